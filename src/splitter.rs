//! Workload splitter.
//!
//! Partitions oversized work against a resource budget: DM trial ranges
//! against the memory budget, observations into fixed-length time
//! segments, and candidate lists into fold batches. All partitions are
//! deterministic, ordered, gap-free, and cover the input exactly once, so
//! sub-packets can be processed independently and in any order.

use tracing::info;

use crate::error::PipelineError;
use crate::types::DmRange;

/// Whether an input of the given size must be DM-split to fit the budget.
pub fn needs_dm_split(file_len_bytes: u64, budget_bytes: u64) -> bool {
    file_len_bytes > budget_bytes
}

/// Split `[start, end)` into `segments` contiguous equal-width sub-ranges.
///
/// The last sub-range ends exactly at `range.end`, absorbing any
/// floating-point drift from the width multiplication.
pub fn split_dm_range(range: DmRange, segments: usize) -> Result<Vec<DmRange>, PipelineError> {
    if segments == 0 {
        return Err(PipelineError::InvalidParameter(
            "DM segment count must be positive".to_string(),
        ));
    }
    if range.width() <= 0.0 || !range.width().is_finite() {
        return Err(PipelineError::InvalidParameter(format!(
            "DM range {range} has non-positive or non-finite width"
        )));
    }
    let width = range.width() / segments as f64;
    let mut out = Vec::with_capacity(segments);
    for i in 0..segments {
        let start = range.start + i as f64 * width;
        let end = if i == segments - 1 {
            range.end
        } else {
            range.start + (i + 1) as f64 * width
        };
        out.push(DmRange::new(start, end));
    }
    Ok(out)
}

/// One fixed-length slice of an observation, in samples.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeSegment {
    pub index: usize,
    pub start_sample: u64,
    pub sample_count: u64,
}

/// Plan fixed-length segments for each requested length (in minutes).
///
/// Every segment of a given length holds the same number of samples; the
/// final segment is anchored to the end of the file rather than left as a
/// short remainder, so it may overlap its predecessor. Requested lengths
/// longer than the observation are skipped with a notice, not an error.
///
/// No stage currently schedules segmented searches; callers supply their
/// own segment lengths.
pub fn plan_time_segments(
    total_samples: u64,
    sampling_interval_s: f64,
    segment_minutes: &[f64],
) -> Result<Vec<TimeSegment>, PipelineError> {
    if !sampling_interval_s.is_finite() || sampling_interval_s <= 0.0 {
        return Err(PipelineError::InvalidParameter(format!(
            "sampling interval must be finite and positive, got {sampling_interval_s}"
        )));
    }
    let observation_s = total_samples as f64 * sampling_interval_s;
    let mut out = Vec::new();
    for &minutes in segment_minutes {
        let requested_s = minutes * 60.0;
        if requested_s > observation_s {
            info!(
                segment_min = minutes,
                observation_s, "segment length exceeds observation, skipping split"
            );
            continue;
        }
        let per_segment = (requested_s / sampling_interval_s) as u64;
        if per_segment == 0 {
            continue;
        }
        let count = total_samples.div_ceil(per_segment);
        for i in 0..count {
            let start_sample = if i == count - 1 {
                total_samples - per_segment
            } else {
                i * per_segment
            };
            out.push(TimeSegment {
                index: i as usize,
                start_sample,
                sample_count: per_segment,
            });
        }
    }
    Ok(out)
}

/// One contiguous slice `[start, end)` of a candidate list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Batch {
    pub start: usize,
    pub end: usize,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }
}

/// Partition `n` candidates into batches of at most `batch_size`.
///
/// Produces `ceil(n / batch_size)` batches; every batch except the last
/// holds exactly `batch_size` items. A count that divides evenly yields
/// only full batches, never a trailing empty one.
pub fn plan_batches(n: usize, batch_size: usize) -> Result<Vec<Batch>, PipelineError> {
    if batch_size == 0 {
        return Err(PipelineError::InvalidParameter(
            "batch size must be positive".to_string(),
        ));
    }
    let count = n.div_ceil(batch_size);
    let mut out = Vec::with_capacity(count);
    for i in 0..count {
        let start = i * batch_size;
        out.push(Batch {
            start,
            end: (start + batch_size).min(n),
        });
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dm_split_reconstructs_the_range_exactly() {
        for (a, b, n) in [(0.0, 100.0, 10), (12.5, 97.3, 7), (0.0, 1.0, 3), (5.0, 6.0, 1)] {
            let parts = split_dm_range(DmRange::new(a, b), n).unwrap();
            assert_eq!(parts.len(), n);
            assert_eq!(parts[0].start, a);
            assert_eq!(parts[n - 1].end, b);
            for pair in parts.windows(2) {
                // Contiguous and non-overlapping: each end is the next start.
                assert_eq!(pair[0].end, pair[1].start);
                assert!(pair[0].width() > 0.0);
            }
            let widths: Vec<f64> = parts.iter().map(DmRange::width).collect();
            let expected = (b - a) / n as f64;
            for w in widths {
                assert!((w - expected).abs() < 1e-9);
            }
        }
    }

    #[test]
    fn dm_split_rejects_degenerate_input() {
        assert!(split_dm_range(DmRange::new(0.0, 100.0), 0).is_err());
        assert!(split_dm_range(DmRange::new(100.0, 0.0), 4).is_err());
        assert!(split_dm_range(DmRange::new(5.0, 5.0), 4).is_err());
    }

    #[test]
    fn split_decision_uses_strict_budget_exceedance() {
        let gib = 1u64 << 30;
        assert!(!needs_dm_split(10 * gib, 10 * gib));
        assert!(needs_dm_split(10 * gib + 1, 10 * gib));
    }

    #[test]
    fn time_segments_are_uniform_and_anchor_the_tail() {
        // 100 min observation at 1 s sampling, 30 min segments:
        // ceil(6000/1800) = 4 segments, last anchored to the end.
        let segs = plan_time_segments(6000, 1.0, &[30.0]).unwrap();
        assert_eq!(segs.len(), 4);
        for seg in &segs {
            assert_eq!(seg.sample_count, 1800);
        }
        assert_eq!(segs[0].start_sample, 0);
        assert_eq!(segs[2].start_sample, 3600);
        assert_eq!(segs[3].start_sample, 6000 - 1800);
    }

    #[test]
    fn time_segments_skip_lengths_longer_than_the_observation() {
        // 10 min of data: the 30 min request is skipped, 5 min kept.
        let segs = plan_time_segments(600, 1.0, &[30.0, 5.0]).unwrap();
        assert_eq!(segs.len(), 2);
        assert!(segs.iter().all(|s| s.sample_count == 300));
    }

    #[test]
    fn batches_sum_to_n_with_only_the_last_short() {
        for (n, b) in [(31, 15), (45, 15), (1, 15), (14, 15), (1000, 7)] {
            let batches = plan_batches(n, b).unwrap();
            assert_eq!(batches.len(), n.div_ceil(b));
            let total: usize = batches.iter().map(Batch::len).sum();
            assert_eq!(total, n);
            assert!(batches.iter().all(|batch| !batch.is_empty()));
            for batch in &batches[..batches.len() - 1] {
                assert_eq!(batch.len(), b);
            }
        }
    }

    #[test]
    fn exact_multiple_never_emits_a_phantom_batch() {
        let batches = plan_batches(45, 15).unwrap();
        assert_eq!(batches.len(), 3);
        assert_eq!(batches[2], Batch { start: 30, end: 45 });
    }

    #[test]
    fn zero_candidates_yield_zero_batches() {
        assert!(plan_batches(0, 15).unwrap().is_empty());
        assert!(plan_batches(10, 0).is_err());
    }
}
