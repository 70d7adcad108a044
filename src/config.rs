//! Pipeline configuration.
//!
//! Loaded from a TOML file given on the command line, with built-in
//! defaults matching the long-running production values. Passed as an
//! explicit handle; nothing here is process-global.

use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::types::StageKind;

/// Top-level pipeline configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Inputs larger than this are DM-split before searching.
    pub memory_budget_gib: f64,
    /// Number of DM sub-ranges when a split is required.
    pub dm_segments: usize,
    /// Candidates folded per batch.
    pub fold_batch_size: usize,
    /// Sub-integrations per fold.
    pub fold_sub_ints: u32,
    /// Profile bins per fold.
    pub fold_bins: u32,
    /// Assumed companion mass (solar masses) for the acceleration range.
    pub companion_mass: f64,
    /// Assumed pulsar mass (solar masses).
    pub pulsar_mass: f64,
    /// Minimum signal-to-noise for reported candidates.
    pub snr_threshold: f64,
    /// Cap on candidates reported per search.
    pub candidate_limit: u32,
    /// Classifier model for the score stage.
    pub score_model: String,
    /// Re-publish a fold packet to its own input queue when the search
    /// produced zero candidates. Operator-controlled and uncapped: with no
    /// retry limit an always-empty search will requeue forever, so leave
    /// this off unless re-submission is being driven by hand.
    pub requeue_on_empty_candidates: bool,
    /// Kill an external tool after this many seconds, if set.
    pub tool_timeout_secs: Option<u64>,
    pub merge: MergeConfig,
    pub tools: ToolPaths,
    pub queues: QueueNames,
}

/// Knobs for the merge/RFI-filter stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MergeConfig {
    /// Threads passed to the merge tool.
    pub threads: u32,
    /// Output bits per sample.
    pub bits: u32,
    /// IQR filter lag radius.
    pub iqrm_radius: u32,
    /// IQR filter threshold in sigma.
    pub iqrm_threshold: f64,
    /// Samples per filter block.
    pub iqrm_samples_per_block: u32,
    /// Channel count presented to the filter.
    pub iqrm_nchans: u32,
}

/// External tool binaries; override with absolute paths when not on PATH.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolPaths {
    pub digifil: String,
    pub iqrm: String,
    pub peasoup: String,
    pub prepfold: String,
    pub scorer: String,
    pub tar: String,
}

/// Queue names, one per consuming stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueNames {
    pub merge: String,
    pub search: String,
    pub fold: String,
    pub score: String,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            memory_budget_gib: 10.0,
            dm_segments: 10,
            fold_batch_size: 15,
            fold_sub_ints: 64,
            fold_bins: 128,
            companion_mass: 4.0,
            pulsar_mass: 1.4,
            snr_threshold: 8.0,
            candidate_limit: 1000,
            score_model: "clfl2_PALFA.pkl".to_string(),
            requeue_on_empty_candidates: false,
            tool_timeout_secs: None,
            merge: MergeConfig::default(),
            tools: ToolPaths::default(),
            queues: QueueNames::default(),
        }
    }
}

impl Default for MergeConfig {
    fn default() -> Self {
        Self {
            threads: 15,
            bits: 8,
            iqrm_radius: 3,
            iqrm_threshold: 6.0,
            iqrm_samples_per_block: 100_000,
            iqrm_nchans: 4096,
        }
    }
}

impl Default for ToolPaths {
    fn default() -> Self {
        Self {
            digifil: "digifil".to_string(),
            iqrm: "iqrm_apollo_cli".to_string(),
            peasoup: "peasoup".to_string(),
            prepfold: "prepfold".to_string(),
            scorer: "pics_score".to_string(),
            tar: "tar".to_string(),
        }
    }
}

impl Default for QueueNames {
    fn default() -> Self {
        Self {
            merge: "filterbank_merge".to_string(),
            search: "peasoup_search".to_string(),
            fold: "presto_fold".to_string(),
            score: "pics_score".to_string(),
        }
    }
}

impl PipelineConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        let config: Self = toml::from_str(&text)
            .with_context(|| format!("parsing config file {}", path.display()))?;
        Ok(config)
    }

    pub fn memory_budget_bytes(&self) -> u64 {
        (self.memory_budget_gib * (1u64 << 30) as f64) as u64
    }

    pub fn tool_timeout(&self) -> Option<Duration> {
        self.tool_timeout_secs.map(Duration::from_secs)
    }

    /// Queue consumed by the given stage.
    pub fn input_queue(&self, stage: StageKind) -> &str {
        match stage {
            StageKind::Merge => &self.queues.merge,
            StageKind::Search => &self.queues.search,
            StageKind::Fold => &self.queues.fold,
            StageKind::Score => &self.queues.score,
        }
    }
}
