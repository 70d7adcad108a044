//! Search stage: run the acceleration search over one filterbank and one
//! DM trial range, register the candidate overview, and emit a fold
//! packet.
//!
//! Oversized inputs are DM-split before execution: each sub-range becomes
//! its own packet with its own Processing record, so one slow or failing
//! sub-range never blocks the others.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::info;

use super::{wrong_packet, Dispatch, ProductDraft, StageContext, StageHandler, StageOutput};
use crate::config::PipelineConfig;
use crate::error::PipelineError;
use crate::invoker::ToolCommand;
use crate::splitter::{needs_dm_split, split_dm_range};
use crate::transform::{max_acceleration_from_orbit, next_power_of_two_fft_size};
use crate::types::{AccelerationRange, FoldPacket, SearchPacket, StageKind, WorkPacket};

/// Observations are assumed to span at most this fraction of any binary
/// orbit; the shortest orbit consistent with that bounds the acceleration
/// range.
const MAX_ORBIT_FRACTION: f64 = 0.1;

pub struct SearchStage;

#[async_trait]
impl StageHandler for SearchStage {
    fn kind(&self) -> StageKind {
        StageKind::Search
    }

    fn split(
        &self,
        packet: WorkPacket,
        config: &PipelineConfig,
    ) -> Result<Vec<WorkPacket>, PipelineError> {
        let WorkPacket::Search(p) = packet else {
            return Err(wrong_packet(StageKind::Search, &packet));
        };
        if !needs_dm_split(p.file_len_bytes, config.memory_budget_bytes()) {
            return Ok(vec![WorkPacket::Search(p)]);
        }
        let ranges = split_dm_range(p.dm_range, config.dm_segments)?;
        info!(
            file = %p.input_file.display(),
            bytes = p.file_len_bytes,
            segments = ranges.len(),
            "input exceeds memory budget, splitting DM range"
        );
        Ok(ranges
            .into_iter()
            .map(|dm_range| {
                WorkPacket::Search(SearchPacket {
                    dm_range,
                    ..p.clone()
                })
            })
            .collect())
    }

    async fn run(
        &self,
        packet: &WorkPacket,
        ctx: &StageContext,
    ) -> Result<StageOutput, PipelineError> {
        let WorkPacket::Search(p) = packet else {
            return Err(wrong_packet(StageKind::Search, packet));
        };

        let acc = match p.acceleration_range {
            Some(range) => range,
            None => {
                let min_orbit_hours = p.observation_length_s / MAX_ORBIT_FRACTION / 3600.0;
                max_acceleration_from_orbit(
                    min_orbit_hours,
                    ctx.config.companion_mass,
                    ctx.config.pulsar_mass,
                )?
            }
        };
        let fft_size = match p.fft_size {
            Some(size) => size,
            None => next_power_of_two_fft_size(p.sample_count)?,
        };

        let odir = p.output_dir.join(format!(
            "{}_dm_{}_{}",
            p.output_stem, p.dm_range.start, p.dm_range.end
        ));
        tokio::fs::create_dir_all(&odir).await.map_err(|e| {
            PipelineError::ExternalToolFailure(format!(
                "failed to create {}: {e}",
                odir.display()
            ))
        })?;

        let mut cmd = ToolCommand::new(&ctx.config.tools.peasoup)
            .args(["-i".to_string(), p.input_file.to_string_lossy().into_owned()])
            .args(["-o".to_string(), odir.to_string_lossy().into_owned()])
            .args(["--dm_start".to_string(), p.dm_range.start.to_string()])
            .args(["--dm_end".to_string(), p.dm_range.end.to_string()])
            .args(["--acc_start".to_string(), acc.start.to_string()])
            .args(["--acc_end".to_string(), acc.end.to_string()])
            .args(["-m".to_string(), ctx.config.snr_threshold.to_string()])
            .args(["--fft_size".to_string(), fft_size.to_string()])
            .args(["--limit".to_string(), ctx.config.candidate_limit.to_string()]);
        if !p.mask_file.as_os_str().is_empty() {
            cmd = cmd.args(["-k".to_string(), p.mask_file.to_string_lossy().into_owned()]);
        }
        if !p.birdie_file.as_os_str().is_empty() {
            cmd = cmd.args(["-z".to_string(), p.birdie_file.to_string_lossy().into_owned()]);
        }

        info!(dm_range = %p.dm_range, fft_size, "running acceleration search");
        ctx.invoker
            .run(&cmd)
            .await?
            .require_success("acceleration search")?;

        let overview = odir.join("overview.xml");
        sanitize_overview(&overview).await?;

        let fold = FoldPacket {
            input_dp_ids: Vec::new(),
            overview_dir: odir.clone(),
            input_files: p.source_files.clone(),
            output_dir: sibling_with_suffix(&odir, "_folded"),
            mask_file: p.mask_file.clone(),
            batch_size: ctx.config.fold_batch_size,
            sub_ints: ctx.config.fold_sub_ints,
            bins: ctx.config.fold_bins,
        };

        Ok(StageOutput {
            products: vec![ProductDraft {
                location: overview,
                file_type: "peasoup_xml".to_string(),
            }],
            downstream: vec![Dispatch {
                queue: ctx.config.queues.fold.clone(),
                packet: WorkPacket::Fold(fold),
            }],
            failure_note: None,
            requeue_input: false,
        })
    }
}

/// The search tool records the invoking account name in its overview;
/// drop those lines before the file is registered and shipped around.
async fn sanitize_overview(path: &Path) -> Result<(), PipelineError> {
    let text = tokio::fs::read_to_string(path).await.map_err(|e| {
        PipelineError::ExternalToolFailure(format!(
            "search produced no readable overview at {}: {e}",
            path.display()
        ))
    })?;
    if !text.contains("username") {
        return Ok(());
    }
    let kept: Vec<&str> = text
        .lines()
        .filter(|line| !line.contains("username"))
        .collect();
    tokio::fs::write(path, kept.join("\n"))
        .await
        .map_err(|e| {
            PipelineError::ExternalToolFailure(format!(
                "failed to rewrite overview {}: {e}",
                path.display()
            ))
        })
}

fn sibling_with_suffix(dir: &Path, suffix: &str) -> PathBuf {
    let name = dir
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    dir.with_file_name(format!("{name}{suffix}"))
}

// ============================================================================
// Tests
// ============================================================================
