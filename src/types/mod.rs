//! Core data model: work packets, candidates, and registry identifiers.
//!
//! A [`WorkPacket`] is an immutable, serializable unit of work tagged by
//! stage kind. Packets are created by the producing stage and consumed
//! exactly once downstream; splitting builds new packets rather than
//! mutating the original. Unknown wire fields are tolerated for forward
//! compatibility; missing required fields fail decoding.

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

// ============================================================================
// Identifiers
// ============================================================================

/// Identifier of one Processing record in the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProcessingId(pub i64);

impl fmt::Display for ProcessingId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of one registered data product.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DataProductId(pub i64);

impl fmt::Display for DataProductId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// Stage kinds
// ============================================================================

/// The four pipeline stages, in data-flow order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageKind {
    Merge,
    Search,
    Fold,
    Score,
}

impl StageKind {
    /// Short tag used in queue payloads and log lines.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Merge => "merge",
            Self::Search => "search",
            Self::Fold => "fold",
            Self::Score => "score",
        }
    }

    /// Registry pipeline name for Processing records created by this stage.
    pub fn pipeline_name(self) -> &'static str {
        match self {
            Self::Merge => "digifil_merge",
            Self::Search => "peasoup",
            Self::Fold => "PRESTO",
            Self::Score => "PICS_Original",
        }
    }
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Numeric ranges
// ============================================================================

/// Half-open dispersion-measure trial range `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DmRange {
    pub start: f64,
    pub end: f64,
}

impl DmRange {
    pub fn new(start: f64, end: f64) -> Self {
        Self { start, end }
    }

    pub fn width(&self) -> f64 {
        self.end - self.start
    }
}

impl fmt::Display for DmRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.start, self.end)
    }
}

/// Symmetric line-of-sight acceleration search range in m/s².
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AccelerationRange {
    pub start: f64,
    pub end: f64,
}

// ============================================================================
// Candidates
// ============================================================================

/// A scored detection from the acceleration search, as reported in the
/// search tool's candidate overview. Never persisted directly; only the
/// data products derived from it are.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    /// Index within its result set.
    pub index: usize,
    /// Barycentred spin period in seconds.
    pub period_s: f64,
    /// Line-of-sight acceleration in m/s².
    pub acceleration_ms2: f64,
    /// Dispersion measure in pc/cm³.
    pub dm: f64,
    /// Signal-to-noise ratio.
    pub snr: f64,
}

// ============================================================================
// Work packets
// ============================================================================

/// One unit of work, tagged by the stage that consumes it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WorkPacket {
    Merge(MergePacket),
    Search(SearchPacket),
    Fold(FoldPacket),
    Score(ScorePacket),
}

impl WorkPacket {
    pub fn kind(&self) -> StageKind {
        match self {
            Self::Merge(_) => StageKind::Merge,
            Self::Search(_) => StageKind::Search,
            Self::Fold(_) => StageKind::Fold,
            Self::Score(_) => StageKind::Score,
        }
    }

    /// Identifiers of every upstream data product this packet derives from.
    pub fn input_dp_ids(&self) -> &[DataProductId] {
        match self {
            Self::Merge(p) => &p.input_dp_ids,
            Self::Search(p) => &p.input_dp_ids,
            Self::Fold(p) => &p.input_dp_ids,
            Self::Score(p) => &p.input_dp_ids,
        }
    }

    /// Record additional upstream products, e.g. the outputs of the stage
    /// that emitted this packet.
    pub fn append_input_dp_ids(&mut self, ids: &[DataProductId]) {
        let target = match self {
            Self::Merge(p) => &mut p.input_dp_ids,
            Self::Search(p) => &mut p.input_dp_ids,
            Self::Fold(p) => &mut p.input_dp_ids,
            Self::Score(p) => &mut p.input_dp_ids,
        };
        target.extend_from_slice(ids);
    }
}

/// Merge one beam's filterbank recordings into a single file, then apply
/// the RFI filter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MergePacket {
    /// Beam name, e.g. `cfbf00042`. Used for output naming only.
    pub beam_name: String,
    /// Filterbank files to merge, in time order.
    pub input_files: Vec<PathBuf>,
    /// Registry identifiers of the input files.
    pub input_dp_ids: Vec<DataProductId>,
    /// Directory that receives the merged and filtered files.
    pub output_dir: PathBuf,
    /// Output filename stem (no extension).
    pub output_stem: String,
    /// Total sample count across the inputs.
    pub sample_count: u64,
    /// Sampling interval in seconds.
    pub sampling_interval_s: f64,
    /// Optional time-downsampling factor passed to the merge tool.
    #[serde(default)]
    pub time_downsample: Option<u32>,
    /// Frequency-downsampling factor.
    #[serde(default = "default_freq_downsample")]
    pub freq_downsample: u32,
    /// DM trial range for the downstream search.
    pub dm_range: DmRange,
    /// RFI mask, threaded through to the search and fold stages. Empty
    /// means no mask.
    #[serde(default)]
    pub mask_file: PathBuf,
    /// Birdie (known-interference) list for the search tool. Empty means
    /// none.
    #[serde(default)]
    pub birdie_file: PathBuf,
}

fn default_freq_downsample() -> u32 {
    1
}

/// Run the acceleration search over one filterbank and one DM range.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchPacket {
    /// Filterbank to search (merged + RFI-filtered).
    pub input_file: PathBuf,
    /// Registry identifiers of the upstream inputs.
    pub input_dp_ids: Vec<DataProductId>,
    /// Original per-beam recordings, threaded through for the fold stage.
    pub source_files: Vec<PathBuf>,
    /// Directory for search products.
    pub output_dir: PathBuf,
    /// Output naming stem.
    pub output_stem: String,
    /// DM trial range for this packet.
    pub dm_range: DmRange,
    /// Size of the input file in bytes; drives the DM-split decision.
    pub file_len_bytes: u64,
    /// Number of samples in the input.
    pub sample_count: u64,
    /// Sampling interval in seconds.
    pub sampling_interval_s: f64,
    /// Observation length in seconds.
    pub observation_length_s: f64,
    /// RFI mask file for the search tool.
    pub mask_file: PathBuf,
    /// Birdie (known-interference) list.
    pub birdie_file: PathBuf,
    /// Pinned acceleration range; derived from the orbital rule when absent.
    #[serde(default)]
    pub acceleration_range: Option<AccelerationRange>,
    /// Pinned FFT size; decided from the sample count when absent.
    #[serde(default)]
    pub fft_size: Option<u64>,
}

/// Fold the time series at each candidate reported by a search.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FoldPacket {
    /// Registry identifiers of the upstream inputs.
    pub input_dp_ids: Vec<DataProductId>,
    /// Directory holding the search tool's `overview.xml`.
    pub overview_dir: PathBuf,
    /// Per-beam recordings to fold.
    pub input_files: Vec<PathBuf>,
    /// Directory that receives the fold products.
    pub output_dir: PathBuf,
    /// RFI mask for the folding tool.
    pub mask_file: PathBuf,
    /// Candidates folded per batch.
    pub batch_size: usize,
    /// Number of sub-integrations per fold.
    pub sub_ints: u32,
    /// Number of profile bins per fold.
    pub bins: u32,
}

/// Score the folded candidates of one fold run with a trained classifier.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScorePacket {
    /// Registry identifiers of the upstream inputs.
    pub input_dp_ids: Vec<DataProductId>,
    /// Directory of fold products to score.
    pub input_dir: PathBuf,
    /// Classifier model name.
    pub model: String,
}
