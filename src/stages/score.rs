//! Score stage: run the trained classifier over one fold directory, then
//! archive the candidate plots for download. Terminal stage, so nothing
//! is published downstream.

use async_trait::async_trait;
use tracing::info;

use super::{wrong_packet, ProductDraft, StageContext, StageHandler, StageOutput};
use crate::error::PipelineError;
use crate::invoker::ToolCommand;
use crate::types::{StageKind, WorkPacket};

const SCORES_FILENAME: &str = "pics_scores.txt";

pub struct ScoreStage;

#[async_trait]
impl StageHandler for ScoreStage {
    fn kind(&self) -> StageKind {
        StageKind::Score
    }

    async fn run(
        &self,
        packet: &WorkPacket,
        ctx: &StageContext,
    ) -> Result<StageOutput, PipelineError> {
        let WorkPacket::Score(p) = packet else {
            return Err(wrong_packet(StageKind::Score, packet));
        };

        let scores = p.input_dir.join(SCORES_FILENAME);
        let score_cmd = ToolCommand::new(&ctx.config.tools.scorer)
            .args(["-i".to_string(), p.input_dir.to_string_lossy().into_owned()])
            .args(["-m".to_string(), p.model.clone()])
            .args(["-o".to_string(), scores.to_string_lossy().into_owned()]);

        info!(dir = %p.input_dir.display(), model = %p.model, "scoring candidates");
        ctx.invoker
            .run(&score_cmd)
            .await?
            .require_success("candidate scoring")?;

        let parent = p.input_dir.parent().ok_or_else(|| {
            PipelineError::InvalidParameter(format!(
                "fold directory {} has no parent to archive into",
                p.input_dir.display()
            ))
        })?;
        let base = p
            .input_dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| {
                PipelineError::InvalidParameter(format!(
                    "fold directory {} has no name",
                    p.input_dir.display()
                ))
            })?;
        let archive = parent.join(format!("{base}_presto_cands.tar.gz"));
        let tar_cmd = ToolCommand::new(&ctx.config.tools.tar)
            .arg("-czf")
            .arg(archive.to_string_lossy())
            .arg(base.as_str())
            .current_dir(parent);
        ctx.invoker
            .run(&tar_cmd)
            .await?
            .require_success("candidate archiving")?;

        Ok(StageOutput {
            products: vec![
                ProductDraft {
                    location: scores,
                    file_type: "pics_scores".to_string(),
                },
                ProductDraft {
                    location: archive,
                    file_type: "candidate_archive".to_string(),
                },
            ],
            downstream: Vec::new(),
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
    use crate::types::ScorePacket;

    struct CountingInvoker {
        calls: std::sync::Mutex<Vec<ToolCommand>>,
    }

    #[async_trait]
    impl ToolInvoker for CountingInvoker {
        async fn run(&self, command: &ToolCommand) -> Result<ToolOutcome, PipelineError> {
            self.calls.lock().unwrap().push(command.clone());
            Ok(ToolOutcome {
                success: true,
                code: Some(0),
                stdout: String::new(),
                stderr: String::new(),
            })
        }
    }

    #[tokio::test]
    async fn scores_then_archives_and_registers_both() {
        let invoker = Arc::new(CountingInvoker {
            calls: std::sync::Mutex::new(Vec::new()),
        });
        let ctx = StageContext {
            registry: Arc::new(MemoryRegistry::new()),
            invoker: invoker.clone(),
            config: Arc::new(PipelineConfig::default()),
        };
        let packet = WorkPacket::Score(ScorePacket {
            input_dp_ids: Vec::new(),
            input_dir: PathBuf::from("/data/obs/beam_dm_0_100_folded"),
            model: "clfl2_PALFA.pkl".to_string(),
        });

        let out = ScoreStage.run(&packet, &ctx).await.unwrap();

        let calls = invoker.calls.lock().unwrap().clone();
        assert_eq!(calls.len(), 2);
        assert!(calls[0].args.contains(&"clfl2_PALFA.pkl".to_string()));
        // tar runs in the parent directory against the bare dir name.
        assert_eq!(calls[1].cwd.as_deref(), Some(std::path::Path::new("/data/obs")));
        assert!(calls[1]
            .args
            .contains(&"beam_dm_0_100_folded".to_string()));

        assert_eq!(out.products.len(), 2);
        assert!(out.products[0].location.ends_with("pics_scores.txt"));
        assert!(out.products[1]
            .location
            .to_string_lossy()
            .ends_with("beam_dm_0_100_folded_presto_cands.tar.gz"));
        assert!(out.downstream.is_empty());
    }
}
