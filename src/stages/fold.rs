//! Fold stage: fold the raw recordings at every candidate the search
//! reported, correcting each candidate's barycentric period to the
//! observation midpoint, then hand the fold directory to the scorer.

use async_trait::async_trait;
use tracing::{info, warn};

use super::{wrong_packet, Dispatch, ProductDraft, StageContext, StageHandler, StageOutput};
use crate::candidates::read_overview;
use crate::error::PipelineError;
use crate::invoker::ToolCommand;
use crate::splitter::plan_batches;
use crate::transform::{midpoint_adjusted_period, period_derivative};
use crate::types::{ScorePacket, StageKind, WorkPacket};

pub struct FoldStage;

#[async_trait]
impl StageHandler for FoldStage {
    fn kind(&self) -> StageKind {
        StageKind::Fold
    }

    async fn run(
        &self,
        packet: &WorkPacket,
        ctx: &StageContext,
    ) -> Result<StageOutput, PipelineError> {
        let WorkPacket::Fold(p) = packet else {
            return Err(wrong_packet(StageKind::Fold, packet));
        };

        let overview = read_overview(&p.overview_dir.join("overview.xml")).await?;
        if overview.candidates.is_empty() {
            // Nothing to fold. Whether that means "genuinely empty sky" or
            // "search output not ready yet" is operator-determined, hence
            // the optional requeue. With requeue enabled an empty result
            // loops forever, so it defaults off.
            if ctx.config.requeue_on_empty_candidates {
                warn!(overview = %p.overview_dir.display(), "no candidates, requeueing fold packet");
            }
            return Ok(StageOutput::failed(
                format!(
                    "search overview {} contains no candidates",
                    p.overview_dir.display()
                ),
                ctx.config.requeue_on_empty_candidates,
            ));
        }

        tokio::fs::create_dir_all(&p.output_dir).await.map_err(|e| {
            PipelineError::ExternalToolFailure(format!(
                "failed to create {}: {e}",
                p.output_dir.display()
            ))
        })?;

        let batches = plan_batches(overview.candidates.len(), p.batch_size)?;
        info!(
            candidates = overview.candidates.len(),
            batches = batches.len(),
            "folding candidates"
        );

        for batch in &batches {
            for candidate in &overview.candidates[batch.start..batch.end] {
                let pdot = period_derivative(candidate.period_s, candidate.acceleration_ms2)?;
                let period = midpoint_adjusted_period(
                    candidate.period_s,
                    pdot,
                    overview.sample_count,
                    overview.sampling_interval_s,
                    overview.fft_size,
                )?;

                let mut cmd = ToolCommand::new(&ctx.config.tools.prepfold)
                    .args(["-ncpus", "1"]);
                if !p.mask_file.as_os_str().is_empty() {
                    cmd = cmd
                        .args(["-mask".to_string(), p.mask_file.to_string_lossy().into_owned()]);
                }
                cmd = cmd
                    .arg("-noxwin")
                    .arg("-nodmsearch")
                    .arg("-topo")
                    .args(["-p".to_string(), format!("{period:.16}")])
                    .args(["-pd".to_string(), format!("{pdot:.16e}")])
                    .args(["-dm".to_string(), candidate.dm.to_string()])
                    .args(["-n".to_string(), p.bins.to_string()])
                    .args(["-npart".to_string(), p.sub_ints.to_string()])
                    .args(["-o".to_string(), format!("cand_{}", candidate.index)])
                    .current_dir(&p.output_dir);
                for f in &p.input_files {
                    cmd = cmd.arg(f.to_string_lossy());
                }

                ctx.invoker
                    .run(&cmd)
                    .await?
                    .require_success(&format!("fold of candidate {}", candidate.index))?;
            }
        }

        let score = ScorePacket {
            input_dp_ids: Vec::new(),
            input_dir: p.output_dir.clone(),
            model: ctx.config.score_model.clone(),
        };

        Ok(StageOutput {
            products: vec![ProductDraft {
                location: p.output_dir.clone(),
                file_type: "presto_candidates".to_string(),
            }],
            downstream: vec![Dispatch {
                queue: ctx.config.queues.score.clone(),
                packet: WorkPacket::Score(score),
            }],
            failure_note: None,
            requeue_input: false,
        })
    }
}

// ============================================================================
// Tests
// ============================================================================
