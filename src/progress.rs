//! Progress-callback trait for stage and step events.
//!
//! Inject an [`Arc<dyn PipelineProgressCallback>`] via
//! [`crate::config::PipelineConfigBuilder::progress_callback`] to receive
//! events as the pipeline moves through its stages and negotiates each step.
//!
//! # Example
//!
//! ```rust
//! use manual2steps::{PipelineConfig, PipelineProgressCallback, StepStatus};
//! use std::sync::{Arc, atomic::{AtomicUsize, Ordering}};
//!
//! struct CountingCallback {
//!     finished: AtomicUsize,
//! }
//!
//! impl PipelineProgressCallback for CountingCallback {
//!     fn on_step_complete(&self, step_index: usize, total_steps: usize, status: StepStatus) {
//!         let done = self.finished.fetch_add(1, Ordering::SeqCst) + 1;
//!         eprintln!("step {}/{} {:?} ({done} done)", step_index + 1, total_steps, status);
//!     }
//! }
//!
//! let cb = Arc::new(CountingCallback { finished: AtomicUsize::new(0) });
//! let config = PipelineConfig::builder()
//!     .progress_callback(cb as Arc<dyn PipelineProgressCallback>)
//!     .build()
//!     .unwrap();
//! ```

use crate::error::Stage;
use crate::output::StepStatus;
use std::sync::Arc;

/// Called by the pipeline as it runs each stage and negotiates each step.
///
/// Implementations must be `Send + Sync`: steps are negotiated concurrently
/// unless prior-step context is enabled, so the step methods may be called
/// from several tasks at once. All methods default to no-ops.
pub trait PipelineProgressCallback: Send + Sync {
    /// Called when a stage begins.
    fn on_stage_start(&self, stage: Stage) {
        let _ = stage;
    }

    /// Called when a stage finishes.
    ///
    /// # Arguments
    /// * `stage`  — the stage that finished
    /// * `cached` — true when the stage's output came from the artifact cache
    fn on_stage_complete(&self, stage: Stage, cached: bool) {
        let _ = (stage, cached);
    }

    /// Called once before negotiation starts, with the number of steps.
    fn on_negotiation_start(&self, total_steps: usize) {
        let _ = total_steps;
    }

    /// Called just before a step's first proposer call.
    ///
    /// `step_index` is the 0-based global step index.
    fn on_step_start(&self, step_index: usize, total_steps: usize) {
        let _ = (step_index, total_steps);
    }

    /// Called when a step reaches a terminal status.
    fn on_step_complete(&self, step_index: usize, total_steps: usize, status: StepStatus) {
        let _ = (step_index, total_steps, status);
    }

    /// Called once when the document has been assembled.
    fn on_pipeline_complete(&self, total_steps: usize) {
        let _ = total_steps;
    }
}

/// A no-op implementation for callers that don't need progress events.
pub struct NoopProgressCallback;

impl PipelineProgressCallback for NoopProgressCallback {}

/// Convenience alias matching the type stored in [`crate::config::PipelineConfig`].
pub type ProgressCallback = Arc<dyn PipelineProgressCallback>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    struct TrackingCallback {
        stages: Mutex<Vec<(Stage, bool)>>,
        steps_done: AtomicUsize,
        exhausted: AtomicUsize,
    }

    impl PipelineProgressCallback for TrackingCallback {
        fn on_stage_complete(&self, stage: Stage, cached: bool) {
            self.stages.lock().unwrap().push((stage, cached));
        }

        fn on_step_complete(&self, _step: usize, _total: usize, status: StepStatus) {
            self.steps_done.fetch_add(1, Ordering::SeqCst);
            if status == StepStatus::Exhausted {
                self.exhausted.fetch_add(1, Ordering::SeqCst);
            }
        }
    }

    #[test]
    fn noop_callback_does_not_panic() {
        let cb = NoopProgressCallback;
        cb.on_stage_start(Stage::Render);
        cb.on_stage_complete(Stage::Render, true);
        cb.on_negotiation_start(3);
        cb.on_step_start(0, 3);
        cb.on_step_complete(0, 3, StepStatus::Accepted);
        cb.on_pipeline_complete(3);
    }

    #[test]
    fn tracking_callback_receives_events() {
        let tracker = TrackingCallback::default();
        tracker.on_stage_complete(Stage::Render, false);
        tracker.on_stage_complete(Stage::Crop, true);
        tracker.on_step_complete(0, 2, StepStatus::Accepted);
        tracker.on_step_complete(1, 2, StepStatus::Exhausted);

        assert_eq!(
            *tracker.stages.lock().unwrap(),
            vec![(Stage::Render, false), (Stage::Crop, true)]
        );
        assert_eq!(tracker.steps_done.load(Ordering::SeqCst), 2);
        assert_eq!(tracker.exhausted.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn arc_dyn_callback_works() {
        let cb: ProgressCallback = Arc::new(NoopProgressCallback);
        cb.on_stage_start(Stage::Detect);
        cb.on_step_start(1, 10);
    }
}
