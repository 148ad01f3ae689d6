//! NegotiationLoop: the bounded proposer ⇄ critic exchange for one step.
//!
//! ```text
//! proposing ──┬─ no step ─────▶ skipped
//!     ▲       └─▶ awaiting-critique ──┬─ accept ───────▶ accepted
//!     │                               ├─ unrecognized ─▶ ambiguous-exit
//!     │                               └─ clarify ──┬──▶ exhausted (ceiling reached)
//!     └──────────── revise ◀───────────────────────┘
//! ```
//!
//! At most [`MAX_PROPOSER_CALLS`] proposer invocations happen per step,
//! counting the first draft. Every role call is bounded by
//! `step_call_timeout_secs`. A role call that fails or times out ends the
//! step as [`StepStatus::Exhausted`] with the latest draft, or with
//! [`MISSING_INSTRUCTION`] when not even a first draft exists; the cause is
//! kept in [`StepInstruction::error`]. One broken step never fails the
//! document.

use crate::error::CollaboratorError;
use crate::output::{StepInstruction, StepStatus, MISSING_INSTRUCTION};
use crate::pipeline::crop::StepCrop;
use crate::pipeline::llm::{Critic, CriticVerdict, ProposalRequest, Proposer, Revision};
use crate::pipeline::response::reports_no_step;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

/// Proposer invocations per step, first draft included.
pub const MAX_PROPOSER_CALLS: u32 = 3;

/// Run `call` under the per-call bound; an elapsed timer becomes a
/// [`CollaboratorError::Timeout`].
async fn bounded<T, F>(role: &str, secs: u64, call: F) -> Result<T, CollaboratorError>
where
    F: Future<Output = Result<T, CollaboratorError>>,
{
    match tokio::time::timeout(Duration::from_secs(secs), call).await {
        Ok(result) => result,
        Err(_) => Err(CollaboratorError::Timeout {
            role: role.to_string(),
            secs,
        }),
    }
}

/// Negotiate one step to a terminal status.
///
/// Always returns exactly one final text.
pub async fn negotiate_step(
    step: &StepCrop,
    prior_context: Option<&str>,
    proposer: &dyn Proposer,
    critic: &dyn Critic,
    call_timeout_secs: u64,
) -> StepInstruction {
    let mut outcome = StepInstruction {
        step_id: step.step_id.clone(),
        global_step_index: step.global_step_index,
        page_index: step.page_index,
        status: StepStatus::Pending,
        proposer_calls: 1,
        critic_calls: 0,
        questions: Vec::new(),
        text: String::new(),
        error: None,
    };

    let first = ProposalRequest {
        step,
        prior_context,
        revision: None,
    };
    match bounded("proposer", call_timeout_secs, proposer.propose(first)).await {
        Ok(draft) => outcome.text = draft,
        Err(e) => {
            warn!("{}: no first draft, step exhausted: {}", step.step_id, e);
            outcome.text = MISSING_INSTRUCTION.to_string();
            outcome.status = StepStatus::Exhausted;
            outcome.error = Some(e);
            return outcome;
        }
    }
    debug!("{}: first draft ({} chars)", step.step_id, outcome.text.len());

    if reports_no_step(&outcome.text) {
        debug!("{}: proposer sees no assembly step, skipping", step.step_id);
        outcome.status = StepStatus::Skipped;
        return outcome;
    }

    while !outcome.status.is_terminal() {
        outcome.critic_calls += 1;
        let verdict = match bounded("critic", call_timeout_secs, critic.critique(&outcome.text)).await {
            Ok(v) => v,
            Err(e) => {
                warn!("{}: critic failed, keeping latest draft: {}", step.step_id, e);
                outcome.status = StepStatus::Exhausted;
                outcome.error = Some(e);
                break;
            }
        };

        match verdict {
            CriticVerdict::Accept => outcome.status = StepStatus::Accepted,
            CriticVerdict::Unrecognized(reply) => {
                warn!(
                    "{}: unrecognized critic reply, keeping draft: {:?}",
                    step.step_id,
                    reply.chars().take(80).collect::<String>()
                );
                outcome.status = StepStatus::AmbiguousExit;
            }
            CriticVerdict::Clarify(question) => {
                debug!("{}: critic asks {:?}", step.step_id, question);
                outcome.questions.push(question);
                if outcome.proposer_calls >= MAX_PROPOSER_CALLS {
                    outcome.status = StepStatus::Exhausted;
                    break;
                }

                outcome.proposer_calls += 1;
                let revised = {
                    let question = outcome.questions.last().map(String::as_str).unwrap_or_default();
                    let request = ProposalRequest {
                        step,
                        prior_context,
                        revision: Some(Revision {
                            previous_draft: &outcome.text,
                            question,
                        }),
                    };
                    bounded("proposer", call_timeout_secs, proposer.propose(request)).await
                };
                match revised {
                    Ok(revised) => outcome.text = revised,
                    Err(e) => {
                        warn!("{}: revision failed, keeping latest draft: {}", step.step_id, e);
                        outcome.status = StepStatus::Exhausted;
                        outcome.error = Some(e);
                        break;
                    }
                }

                if outcome.proposer_calls >= MAX_PROPOSER_CALLS {
                    outcome.status = StepStatus::Exhausted;
                }
            }
        }
    }

    debug!(
        "{}: {:?} after {} proposer / {} critic calls",
        step.step_id, outcome.status, outcome.proposer_calls, outcome.critic_calls
    );
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::geometry::{BBox, PixelRect};
    use async_trait::async_trait;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    fn step(id: &str, index: usize) -> StepCrop {
        StepCrop {
            step_id: id.to_string(),
            global_step_index: index,
            page_index: 0,
            panel_index: index,
            bbox: BBox::new(10.0, 10.0, 100.0, 100.0),
            bbox_padded: PixelRect { x1: 0, y1: 0, x2: 116, y2: 116 },
            confidence: 0.9,
            class_id: 0,
            image_path: PathBuf::from(format!("step_{id}.png")),
            width_px: 116,
            height_px: 116,
            source_page_image_path: PathBuf::from("page_000.png"),
        }
    }

    /// Numbered drafts; records every request it sees.
    #[derive(Default)]
    struct DraftProposer {
        calls: AtomicU32,
        seen: Mutex<Vec<(Option<String>, Option<String>)>>,
        fail_from: Option<u32>,
        hang_from: Option<u32>,
        first_draft: Option<&'static str>,
    }

    #[async_trait]
    impl Proposer for DraftProposer {
        fn id(&self) -> &str {
            "draft"
        }

        async fn propose(&self, request: ProposalRequest<'_>) -> Result<String, CollaboratorError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            self.seen.lock().unwrap().push((
                request.prior_context.map(str::to_string),
                request.revision.map(|r| r.question.to_string()),
            ));
            if self.hang_from.is_some_and(|h| n >= h) {
                std::future::pending::<()>().await;
            }
            if self.fail_from.is_some_and(|f| n >= f) {
                return Err(CollaboratorError::Failed {
                    role: "proposer".into(),
                    retries: 0,
                    detail: "boom".into(),
                });
            }
            match (n, self.first_draft) {
                (1, Some(text)) => Ok(text.to_string()),
                _ => Ok(format!("draft {n}")),
            }
        }
    }

    enum CriticMode {
        Script(Vec<CriticVerdict>),
        Fail,
        Hang,
    }

    /// Replies from a fixed script (repeating the last entry), or fails,
    /// or never answers.
    struct ScriptedCritic {
        mode: CriticMode,
        calls: AtomicU32,
    }

    impl ScriptedCritic {
        fn new(script: Vec<CriticVerdict>) -> Self {
            Self::with_mode(CriticMode::Script(script))
        }

        fn with_mode(mode: CriticMode) -> Self {
            Self {
                mode,
                calls: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl Critic for ScriptedCritic {
        fn id(&self) -> &str {
            "scripted"
        }

        async fn critique(&self, _draft: &str) -> Result<CriticVerdict, CollaboratorError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) as usize;
            match &self.mode {
                CriticMode::Script(script) => Ok(script[n.min(script.len() - 1)].clone()),
                CriticMode::Fail => Err(CollaboratorError::Malformed {
                    role: "critic".into(),
                    detail: "500".into(),
                }),
                CriticMode::Hang => {
                    std::future::pending::<()>().await;
                    unreachable!()
                }
            }
        }
    }

    fn clarify(q: &str) -> CriticVerdict {
        CriticVerdict::Clarify(q.to_string())
    }

    fn timeout(role: &str) -> Option<CollaboratorError> {
        Some(CollaboratorError::Timeout {
            role: role.into(),
            secs: 1,
        })
    }

    #[tokio::test]
    async fn always_clarifying_critic_exhausts_after_three_drafts() {
        let proposer = DraftProposer::default();
        let critic = ScriptedCritic::new(vec![clarify("Which legs?")]);
        let out = negotiate_step(&step("s", 0), None, &proposer, &critic, 5).await;

        assert_eq!(out.status, StepStatus::Exhausted);
        assert_eq!(out.proposer_calls, 3);
        assert_eq!(proposer.calls.load(Ordering::SeqCst), 3);
        assert_eq!(out.critic_calls, 2);
        assert_eq!(out.text, "draft 3");
        assert_eq!(out.questions, vec!["Which legs?", "Which legs?"]);
        assert_eq!(out.error, None);
    }

    #[tokio::test]
    async fn immediate_acceptance_takes_one_call_each() {
        let proposer = DraftProposer::default();
        let critic = ScriptedCritic::new(vec![CriticVerdict::Accept]);
        let out = negotiate_step(&step("s", 0), None, &proposer, &critic, 5).await;

        assert_eq!(out.status, StepStatus::Accepted);
        assert_eq!((out.proposer_calls, out.critic_calls), (1, 1));
        assert_eq!(critic.calls.load(Ordering::SeqCst), 1);
        assert_eq!(out.text, "draft 1");
        assert!(out.questions.is_empty());
    }

    #[tokio::test]
    async fn acceptance_after_one_revision() {
        let proposer = DraftProposer::default();
        let critic = ScriptedCritic::new(vec![clarify("Where?"), CriticVerdict::Accept]);
        let out = negotiate_step(&step("s", 0), None, &proposer, &critic, 5).await;

        assert_eq!(out.status, StepStatus::Accepted);
        assert_eq!((out.proposer_calls, out.critic_calls), (2, 2));
        assert_eq!(out.text, "draft 2");
        let seen = proposer.seen.lock().unwrap();
        assert_eq!(seen[1].1.as_deref(), Some("Where?"));
    }

    #[tokio::test]
    async fn unrecognized_reply_keeps_current_draft() {
        let proposer = DraftProposer::default();
        let critic = ScriptedCritic::new(vec![
            clarify("Which screw?"),
            CriticVerdict::Unrecognized("hmm".into()),
        ]);
        let out = negotiate_step(&step("s", 0), None, &proposer, &critic, 5).await;

        assert_eq!(out.status, StepStatus::AmbiguousExit);
        assert_eq!(out.text, "draft 2");
    }

    #[tokio::test]
    async fn first_draft_failure_exhausts_without_text() {
        let proposer = DraftProposer {
            fail_from: Some(1),
            ..Default::default()
        };
        let critic = ScriptedCritic::new(vec![CriticVerdict::Accept]);
        let out = negotiate_step(&step("s", 0), None, &proposer, &critic, 5).await;

        assert_eq!(out.status, StepStatus::Exhausted);
        assert_eq!(out.text, MISSING_INSTRUCTION);
        assert!(matches!(out.error, Some(CollaboratorError::Failed { .. })));
        assert!(out.is_undrafted());
        assert_eq!(critic.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn revision_failure_exhausts_with_latest_draft() {
        let proposer = DraftProposer {
            fail_from: Some(2),
            ..Default::default()
        };
        let critic = ScriptedCritic::new(vec![clarify("Which?")]);
        let out = negotiate_step(&step("s", 0), None, &proposer, &critic, 5).await;

        assert_eq!(out.status, StepStatus::Exhausted);
        assert_eq!(out.text, "draft 1");
        assert_eq!(out.proposer_calls, 2);
        assert!(!out.is_undrafted());
    }

    #[tokio::test]
    async fn hanging_first_draft_times_out_to_exhaustion() {
        let proposer = DraftProposer {
            hang_from: Some(1),
            ..Default::default()
        };
        let critic = ScriptedCritic::new(vec![CriticVerdict::Accept]);
        let out = negotiate_step(&step("s", 0), None, &proposer, &critic, 1).await;

        assert_eq!(out.status, StepStatus::Exhausted);
        assert_eq!(out.text, MISSING_INSTRUCTION);
        assert_eq!(out.error, timeout("proposer"));
        assert_eq!(critic.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn hanging_revision_times_out_with_first_draft() {
        let proposer = DraftProposer {
            hang_from: Some(2),
            ..Default::default()
        };
        let critic = ScriptedCritic::new(vec![clarify("Which side?")]);
        let out = negotiate_step(&step("s", 0), None, &proposer, &critic, 1).await;

        assert_eq!(out.status, StepStatus::Exhausted);
        assert_eq!(out.text, "draft 1");
        assert_eq!((out.proposer_calls, out.critic_calls), (2, 1));
        assert_eq!(out.questions, vec!["Which side?"]);
        assert_eq!(out.error, timeout("proposer"));
    }

    #[tokio::test]
    async fn critic_failure_exhausts_with_first_draft() {
        let proposer = DraftProposer::default();
        let critic = ScriptedCritic::with_mode(CriticMode::Fail);
        let out = negotiate_step(&step("s", 0), None, &proposer, &critic, 5).await;

        assert_eq!(out.status, StepStatus::Exhausted);
        assert_eq!(out.text, "draft 1");
        assert_eq!((out.proposer_calls, out.critic_calls), (1, 1));
        assert!(matches!(out.error, Some(CollaboratorError::Malformed { ref role, .. }) if role == "critic"));
    }

    #[tokio::test]
    async fn hanging_critic_times_out_with_first_draft() {
        let proposer = DraftProposer::default();
        let critic = ScriptedCritic::with_mode(CriticMode::Hang);
        let out = negotiate_step(&step("s", 0), None, &proposer, &critic, 1).await;

        assert_eq!(out.status, StepStatus::Exhausted);
        assert_eq!(out.text, "draft 1");
        assert_eq!(out.critic_calls, 1);
        assert_eq!(out.error, timeout("critic"));
        assert!(!out.is_undrafted());
    }

    #[tokio::test]
    async fn no_step_draft_is_skipped_without_critique() {
        let proposer = DraftProposer {
            first_draft: Some("THOUGHTS: a parts list.\nNo assembly steps on this panel."),
            ..Default::default()
        };
        let critic = ScriptedCritic::new(vec![CriticVerdict::Accept]);
        let out = negotiate_step(&step("s", 0), None, &proposer, &critic, 5).await;

        assert_eq!(out.status, StepStatus::Skipped);
        assert_eq!((out.proposer_calls, out.critic_calls), (1, 0));
        assert_eq!(critic.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn prior_context_reaches_every_proposer_call() {
        let proposer = DraftProposer::default();
        let critic = ScriptedCritic::new(vec![clarify("?"), CriticVerdict::Accept]);
        negotiate_step(&step("s", 1), Some("Insert dowels."), &proposer, &critic, 5).await;

        let seen = proposer.seen.lock().unwrap();
        assert!(seen.iter().all(|(ctx, _)| ctx.as_deref() == Some("Insert dowels.")));
    }
}
