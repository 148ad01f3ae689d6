//! Output types: per-step negotiated results and the assembled manual.

use crate::cache::StageManifest;
use crate::error::{CollaboratorError, Stage};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Negotiation status of one step.
///
/// Every status except [`StepStatus::Pending`] is terminal; a step that has
/// reached one is never negotiated again in the same run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    /// The critic accepted the draft.
    Accepted,
    /// The critic's reply could not be classified; the latest draft was kept.
    AmbiguousExit,
    /// The turn ceiling was reached, or a role call failed or timed out.
    Exhausted,
    /// The proposer reported that the image shows no assembly step. Kept in
    /// the audit trail, left out of the assembled text.
    Skipped,
}

impl StepStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, StepStatus::Pending)
    }
}

/// Final text of a step whose first draft could not be produced.
pub const MISSING_INSTRUCTION: &str = "(No instruction could be generated for this step.)";

/// The final, negotiated instruction for one step, plus its audit trail.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepInstruction {
    pub step_id: String,
    /// Document-wide reading-order position (0-based).
    pub global_step_index: usize,
    pub page_index: usize,
    pub status: StepStatus,
    /// Number of proposer invocations, including the first draft.
    pub proposer_calls: u32,
    pub critic_calls: u32,
    /// Clarification questions the critic asked, in order.
    pub questions: Vec<String>,
    /// The final instruction text.
    pub text: String,
    /// The role failure that ended negotiation early, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<CollaboratorError>,
}

impl StepInstruction {
    /// Whether the proposer never produced a draft for this step.
    pub fn is_undrafted(&self) -> bool {
        self.error.is_some() && self.critic_calls == 0
    }
}

/// Persisted record of the negotiation stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstructionsManifest {
    pub cache_key: String,
    pub proposer: String,
    pub critic: String,
    pub max_proposer_calls: u32,
    pub step_count: usize,
    /// Ordered by `global_step_index`.
    pub steps: Vec<StepInstruction>,
}

impl StageManifest for InstructionsManifest {
    const STAGE: Stage = Stage::Negotiate;
    const SCHEMA_VERSION: u32 = 2;

    fn cache_key(&self) -> &str {
        &self.cache_key
    }
}

/// First successfully rendered page, surfaced for callers that want a thumbnail.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoverPage {
    pub page_index: usize,
    pub image_path: PathBuf,
    pub width_px: u32,
    pub height_px: u32,
}

/// Which stages were served from the artifact cache.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageCacheHits {
    pub render: bool,
    pub detect: bool,
    pub crop: bool,
    pub negotiate: bool,
}

/// Aggregate statistics for one pipeline run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PipelineStats {
    pub page_count: usize,
    /// Pages that failed to rasterise.
    pub failed_pages: usize,
    /// Pages the detector failed on (treated as having no detections).
    pub detector_failed_pages: usize,
    pub detection_count: usize,
    pub step_count: usize,
    pub accepted: usize,
    pub ambiguous_exits: usize,
    pub exhausted: usize,
    pub skipped: usize,
    /// Steps that ended without any draft (first proposer call failed).
    pub undrafted: usize,
    pub proposer_calls: u64,
    pub critic_calls: u64,
    pub cache_hits: StageCacheHits,
    pub render_duration_ms: u64,
    pub detect_duration_ms: u64,
    pub crop_duration_ms: u64,
    pub negotiate_duration_ms: u64,
    pub total_duration_ms: u64,
}

impl PipelineStats {
    /// Fill the per-status counters from a finished step list.
    pub fn record_steps(&mut self, steps: &[StepInstruction]) {
        self.step_count = steps.len();
        self.accepted = 0;
        self.ambiguous_exits = 0;
        self.exhausted = 0;
        self.skipped = 0;
        self.undrafted = 0;
        self.proposer_calls = 0;
        self.critic_calls = 0;
        for s in steps {
            match s.status {
                StepStatus::Accepted => self.accepted += 1,
                StepStatus::AmbiguousExit => self.ambiguous_exits += 1,
                StepStatus::Exhausted => self.exhausted += 1,
                StepStatus::Skipped => self.skipped += 1,
                StepStatus::Pending => {}
            }
            if s.is_undrafted() {
                self.undrafted += 1;
            }
            self.proposer_calls += u64::from(s.proposer_calls);
            self.critic_calls += u64::from(s.critic_calls);
        }
    }
}

/// The finished document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssembledManual {
    /// Stable document identifier: SHA-256 of the source bytes.
    pub document_id: String,
    pub cover: Option<CoverPage>,
    /// Steps in reading order, with their terminal status for auditing.
    pub steps: Vec<StepInstruction>,
    /// `## Step N` sections joined in reading order.
    pub text: String,
    pub stats: PipelineStats,
}

impl AssembledManual {
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

/// Join step texts into the final document, numbering from 1.
///
/// The terminal status is not rendered. Skipped steps are left out and do
/// not consume a number.
pub fn assemble_text(steps: &[StepInstruction]) -> String {
    steps
        .iter()
        .filter(|s| s.status != StepStatus::Skipped)
        .enumerate()
        .map(|(i, s)| format!("## Step {}\n\n{}\n", i + 1, s.text.trim()))
        .collect::<Vec<_>>()
        .join("\n")
}
