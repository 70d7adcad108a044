//! Merge stage: combine one beam's filterbank recordings into a single
//! file with `digifil`, then clean it with the IQRM RFI filter, and hand
//! the cleaned file to the search stage.

use async_trait::async_trait;
use tracing::{info, warn};

use super::{wrong_packet, Dispatch, ProductDraft, StageContext, StageHandler, StageOutput};
use crate::error::PipelineError;
use crate::invoker::ToolCommand;
use crate::types::{MergePacket, SearchPacket, StageKind, WorkPacket};

pub struct MergeStage;

#[async_trait]
impl StageHandler for MergeStage {
    fn kind(&self) -> StageKind {
        StageKind::Merge
    }

    async fn run(
        &self,
        packet: &WorkPacket,
        ctx: &StageContext,
    ) -> Result<StageOutput, PipelineError> {
        let WorkPacket::Merge(p) = packet else {
            return Err(wrong_packet(StageKind::Merge, packet));
        };
        if p.input_files.is_empty() {
            return Err(PipelineError::InvalidParameter(
                "merge packet has no input files".to_string(),
            ));
        }

        tokio::fs::create_dir_all(&p.output_dir).await.map_err(|e| {
            PipelineError::ExternalToolFailure(format!(
                "failed to create {}: {e}",
                p.output_dir.display()
            ))
        })?;

        let merged = p.output_dir.join(format!("{}_merged.fil", p.output_stem));
        let cleaned = p.output_dir.join(format!("{}_clean.fil", p.output_stem));

        let mut cmd = ToolCommand::new(&ctx.config.tools.digifil);
        for f in &p.input_files {
            cmd = cmd.arg(f.to_string_lossy());
        }
        cmd = cmd
            .args(["-b".to_string(), ctx.config.merge.bits.to_string()])
            .args(["-threads".to_string(), ctx.config.merge.threads.to_string()]);
        if let Some(t) = p.time_downsample {
            cmd = cmd.args(["-t".to_string(), t.to_string()]);
        }
        if p.freq_downsample > 1 {
            cmd = cmd.args(["-f".to_string(), p.freq_downsample.to_string()]);
        }
        cmd = cmd.args(["-o".to_string(), merged.to_string_lossy().into_owned()]);

        info!(beam = %p.beam_name, files = p.input_files.len(), "merging filterbanks");
        let first = ctx.invoker.run(&cmd).await?;
        if !first.success {
            // A failed merge can leave a truncated output behind; clear it
            // and try once more before giving up.
            warn!(beam = %p.beam_name, code = ?first.code, "merge failed, retrying once");
            if let Err(e) = tokio::fs::remove_file(&merged).await {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(file = %merged.display(), error = %e, "could not remove partial merge output");
                }
            }
            ctx.invoker.run(&cmd).await?.require_success("filterbank merge")?;
        }

        let iqrm = ToolCommand::new(&ctx.config.tools.iqrm)
            .args(["-m".to_string(), ctx.config.merge.iqrm_radius.to_string()])
            .args(["-t".to_string(), ctx.config.merge.iqrm_threshold.to_string()])
            .args([
                "-s".to_string(),
                ctx.config.merge.iqrm_samples_per_block.to_string(),
            ])
            .args(["-f".to_string(), ctx.config.merge.iqrm_nchans.to_string()])
            .args(["-i".to_string(), merged.to_string_lossy().into_owned()])
            .args(["-o".to_string(), cleaned.to_string_lossy().into_owned()]);
        ctx.invoker.run(&iqrm).await?.require_success("RFI filter")?;

        // The merged intermediate is superseded by the cleaned file.
        if let Err(e) = tokio::fs::remove_file(&merged).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(file = %merged.display(), error = %e, "could not remove merge intermediate");
            }
        }

        let t = u64::from(p.time_downsample.unwrap_or(1).max(1));
        let sample_count = p.sample_count / t;
        let sampling_interval_s = p.sampling_interval_s * t as f64;
        // The cleaned file's size drives the search stage's DM-split
        // decision; a missing or unreadable file here means the filter
        // did not deliver what it claimed.
        let file_len_bytes = tokio::fs::metadata(&cleaned)
            .await
            .map_err(|e| {
                PipelineError::ExternalToolFailure(format!(
                    "failed to stat cleaned output {}: {e}",
                    cleaned.display()
                ))
            })?
            .len();

        let search = SearchPacket {
            input_file: cleaned.clone(),
            input_dp_ids: Vec::new(),
            source_files: p.input_files.clone(),
            output_dir: p.output_dir.clone(),
            output_stem: p.output_stem.clone(),
            dm_range: p.dm_range,
            file_len_bytes,
            sample_count,
            sampling_interval_s,
            observation_length_s: sample_count as f64 * sampling_interval_s,
            mask_file: p.mask_file.clone(),
            birdie_file: p.birdie_file.clone(),
            acceleration_range: None,
            fft_size: None,
        };

        Ok(StageOutput {
            products: vec![ProductDraft {
                location: cleaned,
                file_type: "filterbank".to_string(),
            }],
            downstream: vec![Dispatch {
                queue: ctx.config.queues.search.clone(),
                packet: WorkPacket::Search(search),
            }],
            failure_note: None,
            requeue_input: false,
        })
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use std::path::PathBuf;
    use std::sync::Arc;

    use super::*;
    use crate::config::PipelineConfig;
    use crate::invoker::{ToolInvoker, ToolOutcome};
    use crate::registry::MemoryRegistry;
    use crate::types::DmRange;

    /// Records every command; fails the first `fail_first` calls; creates
    /// the file named after `-o` on success so downstream stat calls work.
    struct ScriptedInvoker {
        calls: std::sync::Mutex<Vec<ToolCommand>>,
        fail_first: std::sync::atomic::AtomicUsize,
    }

    impl ScriptedInvoker {
        fn new(fail_first: usize) -> Self {
            Self {
                calls: std::sync::Mutex::new(Vec::new()),
                fail_first: std::sync::atomic::AtomicUsize::new(fail_first),
            }
        }

        fn calls(&self) -> Vec<ToolCommand> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ToolInvoker for ScriptedInvoker {
        async fn run(&self, command: &ToolCommand) -> Result<ToolOutcome, PipelineError> {
            self.calls.lock().unwrap().push(command.clone());
            let remaining = self
                .fail_first
                .fetch_update(
                    std::sync::atomic::Ordering::SeqCst,
                    std::sync::atomic::Ordering::SeqCst,
                    |n| n.checked_sub(1),
                )
                .is_ok();
            if remaining {
                return Ok(ToolOutcome {
                    success: false,
                    code: Some(1),
                    stdout: String::new(),
                    stderr: "scripted failure".to_string(),
                });
            }
            if let Some(pos) = command.args.iter().position(|a| a == "-o") {
                if let Some(out) = command.args.get(pos + 1) {
                    std::fs::write(out, b"fake filterbank").unwrap();
                }
            }
            Ok(ToolOutcome {
                success: true,
                code: Some(0),
                stdout: String::new(),
                stderr: String::new(),
            })
        }
    }

    fn ctx(invoker: Arc<dyn ToolInvoker>) -> StageContext {
        StageContext {
            registry: Arc::new(MemoryRegistry::new()),
            invoker,
            config: Arc::new(PipelineConfig::default()),
        }
    }

    fn packet(dir: &std::path::Path, time_downsample: Option<u32>) -> WorkPacket {
        WorkPacket::Merge(MergePacket {
            beam_name: "cfbf00042".to_string(),
            input_files: vec![PathBuf::from("/data/a.fil"), PathBuf::from("/data/b.fil")],
            input_dp_ids: Vec::new(),
            output_dir: dir.to_path_buf(),
            output_stem: "cfbf00042".to_string(),
            sample_count: 1_000_000,
            sampling_interval_s: 6.4e-5,
            time_downsample,
            freq_downsample: 1,
            dm_range: DmRange::new(0.0, 100.0),
            mask_file: PathBuf::new(),
            birdie_file: PathBuf::new(),
        })
    }

    #[tokio::test]
    async fn merge_then_filter_emits_search_packet() {
        let tmp = tempfile::tempdir().unwrap();
        let invoker = Arc::new(ScriptedInvoker::new(0));
        let ctx = ctx(invoker.clone());

        let out = MergeStage
            .run(&packet(tmp.path(), Some(2)), &ctx)
            .await
            .unwrap();

        let calls = invoker.calls();
        assert_eq!(calls.len(), 2);
        assert!(calls[0].program.to_string_lossy().contains("digifil"));
        assert!(calls[0].args.contains(&"-t".to_string()));
        assert!(calls[1].program.to_string_lossy().contains("iqrm"));

        assert_eq!(out.products.len(), 1);
        assert!(out.products[0]
            .location
            .to_string_lossy()
            .ends_with("cfbf00042_clean.fil"));

        assert_eq!(out.downstream.len(), 1);
        match &out.downstream[0].packet {
            WorkPacket::Search(s) => {
                assert_eq!(s.sample_count, 500_000);
                assert!((s.sampling_interval_s - 1.28e-4).abs() < 1e-12);
                assert!(s.file_len_bytes > 0);
                assert_eq!(s.dm_range, DmRange::new(0.0, 100.0));
            }
            other => panic!("unexpected downstream packet: {other:?}"),
        }
        // The merge intermediate is cleaned up.
        assert!(!tmp.path().join("cfbf00042_merged.fil").exists());
    }

    #[tokio::test]
    async fn merge_retries_once_after_tool_failure() {
        let tmp = tempfile::tempdir().unwrap();
        let invoker = Arc::new(ScriptedInvoker::new(1));
        let ctx = ctx(invoker.clone());

        MergeStage
            .run(&packet(tmp.path(), None), &ctx)
            .await
            .unwrap();
        // digifil (failed), digifil (retry), iqrm.
        assert_eq!(invoker.calls().len(), 3);
    }

    #[tokio::test]
    async fn merge_gives_up_after_second_failure() {
        let tmp = tempfile::tempdir().unwrap();
        let invoker = Arc::new(ScriptedInvoker::new(2));
        let ctx = ctx(invoker.clone());

        let err = MergeStage
            .run(&packet(tmp.path(), None), &ctx)
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::ExternalToolFailure(_)));
        assert_eq!(invoker.calls().len(), 2);
    }

    #[tokio::test]
    async fn missing_cleaned_output_is_a_tool_failure() {
        // Exits zero but writes nothing, so the cleaned file never
        // appears on disk.
        struct SilentInvoker;

        #[async_trait]
        impl ToolInvoker for SilentInvoker {
            async fn run(&self, _command: &ToolCommand) -> Result<ToolOutcome, PipelineError> {
                Ok(ToolOutcome {
                    success: true,
                    code: Some(0),
                    stdout: String::new(),
                    stderr: String::new(),
                })
            }
        }

        let tmp = tempfile::tempdir().unwrap();
        let ctx = ctx(Arc::new(SilentInvoker));

        let err = MergeStage
            .run(&packet(tmp.path(), None), &ctx)
            .await
            .unwrap_err();
        match err {
            PipelineError::ExternalToolFailure(msg) => {
                assert!(msg.contains("cfbf00042_clean.fil"), "unexpected message: {msg}");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn empty_input_list_is_invalid() {
        let tmp = tempfile::tempdir().unwrap();
        let invoker = Arc::new(ScriptedInvoker::new(0));
        let ctx = ctx(invoker);
        let mut p = packet(tmp.path(), None);
        if let WorkPacket::Merge(m) = &mut p {
            m.input_files.clear();
        }
        let err = MergeStage.run(&p, &ctx).await.unwrap_err();
        assert!(matches!(err, PipelineError::InvalidParameter(_)));
    }
}
