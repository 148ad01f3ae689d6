//! End-to-end pipeline tests with in-process collaborators.
//!
//! Pages are generated `image` buffers rather than pdfium output, and the
//! detector, proposer and critic are scripted doubles that count their
//! calls, so these tests need neither a pdfium library nor an API key.

use async_trait::async_trait;
use image::{DynamicImage, Rgba, RgbaImage};
use manual2steps::output::MISSING_INSTRUCTION;
use manual2steps::pipeline::detect::RawDetection;
use manual2steps::{
    convert, convert_from_bytes, convert_to_file, CachePolicy, Collaborators, CollaboratorError,
    Critic, CriticVerdict, DocumentSource, DocumentStore, Manual2StepsError, MemoryDocumentStore,
    PipelineConfig, ProposalRequest, Proposer, Rasterizer, RegionDetector, Stage, StepStatus,
};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

const PDF: &[u8] = b"%PDF-1.7\n% test manual\n";

// ── Doubles ──────────────────────────────────────────────────────────────

struct FakeRasterizer {
    pages: Vec<(u32, u32)>,
    calls: AtomicUsize,
}

impl Rasterizer for FakeRasterizer {
    fn rasterize(
        &self,
        _pdf: &[u8],
        _dpi: u32,
        _password: Option<&str>,
        _origin: &str,
    ) -> Result<Vec<Result<DynamicImage, String>>, Manual2StepsError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .pages
            .iter()
            .map(|&(w, h)| {
                Ok(DynamicImage::ImageRgba8(RgbaImage::from_pixel(
                    w,
                    h,
                    Rgba([240, 240, 240, 255]),
                )))
            })
            .collect())
    }
}

/// Boxes per page index, recovered from the `page_NNN` file name.
struct MapDetector {
    boxes: HashMap<usize, Vec<[f32; 4]>>,
    calls: AtomicUsize,
}

fn page_index(image: &Path) -> usize {
    image
        .file_stem()
        .and_then(|s| s.to_str())
        .and_then(|s| s.strip_prefix("page_"))
        .and_then(|s| s.parse().ok())
        .unwrap_or(usize::MAX)
}

#[async_trait]
impl RegionDetector for MapDetector {
    fn id(&self) -> &str {
        "map"
    }

    async fn detect(&self, image: &Path) -> Result<Vec<RawDetection>, CollaboratorError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .boxes
            .get(&page_index(image))
            .into_iter()
            .flatten()
            .map(|b| RawDetection {
                bbox_xyxy: b.to_vec(),
                confidence: 0.9,
                class_id: 0,
            })
            .collect())
    }
}

/// First draft names the step; each revision appends " (revised)".
#[derive(Default)]
struct EchoProposer {
    calls: AtomicUsize,
    contexts: Mutex<Vec<(String, Option<String>)>>,
    /// Global index of a step whose every draft fails.
    fail_step: Option<usize>,
}

#[async_trait]
impl Proposer for EchoProposer {
    fn id(&self) -> &str {
        "echo"
    }

    async fn propose(&self, request: ProposalRequest<'_>) -> Result<String, CollaboratorError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_step == Some(request.step.global_step_index) {
            return Err(CollaboratorError::Failed {
                role: "proposer".into(),
                retries: 2,
                detail: "503".into(),
            });
        }
        assert!(request.step.image_path.exists(), "crop must exist on disk");
        self.contexts.lock().unwrap().push((
            request.step.step_id.clone(),
            request.prior_context.map(str::to_string),
        ));
        Ok(match request.revision {
            None => format!("Attach panel {}.", request.step.global_step_index),
            Some(rev) => format!("{} (revised)", rev.previous_draft),
        })
    }
}

struct FixedCritic {
    verdict: CriticVerdict,
    calls: AtomicUsize,
}

#[async_trait]
impl Critic for FixedCritic {
    fn id(&self) -> &str {
        "fixed"
    }

    async fn critique(&self, _draft: &str) -> Result<CriticVerdict, CollaboratorError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.verdict.clone())
    }
}

struct Harness {
    rasterizer: Arc<FakeRasterizer>,
    detector: Arc<MapDetector>,
    proposer: Arc<EchoProposer>,
    critic: Arc<FixedCritic>,
    store: Arc<MemoryDocumentStore>,
}

/// `RUST_LOG=manual2steps=debug cargo test` shows the pipeline's logs.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

impl Harness {
    fn new(pages: Vec<(u32, u32)>, boxes: Vec<(usize, Vec<[f32; 4]>)>, verdict: CriticVerdict) -> Self {
        init_tracing();
        Self {
            rasterizer: Arc::new(FakeRasterizer {
                pages,
                calls: AtomicUsize::new(0),
            }),
            detector: Arc::new(MapDetector {
                boxes: boxes.into_iter().collect(),
                calls: AtomicUsize::new(0),
            }),
            proposer: Arc::new(EchoProposer::default()),
            critic: Arc::new(FixedCritic {
                verdict,
                calls: AtomicUsize::new(0),
            }),
            store: Arc::new(MemoryDocumentStore::new()),
        }
    }

    fn collaborators(&self) -> Collaborators {
        Collaborators {
            rasterizer: self.rasterizer.clone(),
            detector: self.detector.clone(),
            proposer: self.proposer.clone(),
            critic: self.critic.clone(),
            store: Some(self.store.clone()),
        }
    }

    fn counts(&self) -> [usize; 4] {
        [
            self.rasterizer.calls.load(Ordering::SeqCst),
            self.detector.calls.load(Ordering::SeqCst),
            self.proposer.calls.load(Ordering::SeqCst),
            self.critic.calls.load(Ordering::SeqCst),
        ]
    }
}

fn config(root: &Path) -> PipelineConfig {
    PipelineConfig::builder()
        .artifact_root(root)
        .dpi(72)
        .build()
        .unwrap()
}

async fn run(h: &Harness, config: &PipelineConfig) -> Result<manual2steps::AssembledManual, Manual2StepsError> {
    convert_from_bytes(PDF.to_vec(), "manual.pdf", config, &h.collaborators()).await
}

fn subdirs(path: PathBuf) -> usize {
    std::fs::read_dir(path).map(|d| d.count()).unwrap_or(0)
}

// ── Tests ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn single_step_on_two_page_manual() {
    let tmp = tempfile::tempdir().unwrap();
    let h = Harness::new(
        vec![(850, 1100), (850, 1100)],
        vec![(0, vec![[10.0, 10.0, 100.0, 100.0]])],
        CriticVerdict::Accept,
    );
    let manual = run(&h, &config(tmp.path())).await.unwrap();

    assert_eq!(manual.steps.len(), 1);
    let step = &manual.steps[0];
    assert_eq!(step.global_step_index, 0);
    assert_eq!(step.page_index, 0);
    assert_eq!(step.status, StepStatus::Accepted);
    assert_eq!((step.proposer_calls, step.critic_calls), (1, 1));
    assert_eq!(manual.text, "## Step 1\n\nAttach panel 0.\n");

    assert_eq!(manual.stats.page_count, 2);
    assert_eq!(manual.stats.detection_count, 1);
    assert_eq!(manual.stats.accepted, 1);
    let cover = manual.cover.expect("first page is the cover");
    assert_eq!((cover.page_index, cover.width_px, cover.height_px), (0, 850, 1100));

    let stored = h.store.get(&manual.document_id).await.unwrap();
    assert_eq!(stored.as_deref(), Some(manual.text.as_str()));

    for dir in ["pdf_pages", "detections", "step_crops", "instructions"] {
        assert_eq!(subdirs(tmp.path().join(dir)), 1, "{dir}");
    }
}

#[tokio::test]
async fn too_narrow_box_yields_empty_manual() {
    let tmp = tempfile::tempdir().unwrap();
    let h = Harness::new(
        vec![(1000, 1000)],
        vec![(0, vec![[5.0, 5.0, 3.0, 300.0]])],
        CriticVerdict::Accept,
    );
    let manual = run(&h, &config(tmp.path())).await.unwrap();

    assert!(manual.is_empty());
    assert_eq!(manual.text, "");
    assert_eq!(h.counts()[2..], [0, 0]);
    assert_eq!(subdirs(tmp.path().join("instructions")), 0);
}

#[tokio::test]
async fn persistent_clarifications_exhaust_each_step() {
    let tmp = tempfile::tempdir().unwrap();
    let h = Harness::new(
        vec![(850, 1100)],
        vec![(0, vec![[10.0, 10.0, 200.0, 200.0], [10.0, 400.0, 200.0, 600.0]])],
        CriticVerdict::Clarify("Which screws?".into()),
    );
    let manual = run(&h, &config(tmp.path())).await.unwrap();

    assert_eq!(manual.steps.len(), 2);
    for (i, step) in manual.steps.iter().enumerate() {
        assert_eq!(step.status, StepStatus::Exhausted);
        assert_eq!(step.proposer_calls, 3);
        assert_eq!(step.critic_calls, 2);
        assert_eq!(step.text, format!("Attach panel {i}. (revised) (revised)"));
    }
    assert_eq!(manual.stats.exhausted, 2);
    assert_eq!(manual.stats.proposer_calls, 6);
    assert_eq!(h.counts()[2..], [6, 4]);
    // Status is audited per step but not rendered into the text.
    assert!(!manual.text.contains("xhausted"));
}

#[tokio::test]
async fn ambiguous_critic_keeps_first_draft() {
    let tmp = tempfile::tempdir().unwrap();
    let h = Harness::new(
        vec![(850, 1100)],
        vec![(0, vec![[10.0, 10.0, 200.0, 200.0]])],
        CriticVerdict::Unrecognized("Looks fine I guess".into()),
    );
    let manual = run(&h, &config(tmp.path())).await.unwrap();

    assert_eq!(manual.steps[0].status, StepStatus::AmbiguousExit);
    assert_eq!(manual.steps[0].text, "Attach panel 0.");
    assert_eq!(manual.stats.ambiguous_exits, 1);
}

#[tokio::test]
async fn rerun_is_served_from_cache() {
    let tmp = tempfile::tempdir().unwrap();
    let h = Harness::new(
        vec![(850, 1100), (850, 1100)],
        vec![
            (0, vec![[10.0, 10.0, 200.0, 200.0]]),
            (1, vec![[300.0, 10.0, 500.0, 200.0], [10.0, 10.0, 200.0, 200.0]]),
        ],
        CriticVerdict::Accept,
    );
    let cfg = config(tmp.path());

    let first = run(&h, &cfg).await.unwrap();
    let after_first = h.counts();
    let second = run(&h, &cfg).await.unwrap();

    assert_eq!(h.counts(), after_first, "no collaborator may run twice");
    assert_eq!(first.text, second.text);
    assert_eq!(first.steps, second.steps);
    let hits = second.stats.cache_hits;
    assert!(hits.render && hits.detect && hits.crop && hits.negotiate);
    assert!(!first.stats.cache_hits.render);
}

#[tokio::test]
async fn refresh_recomputes_every_stage() {
    let tmp = tempfile::tempdir().unwrap();
    let h = Harness::new(
        vec![(850, 1100)],
        vec![(0, vec![[10.0, 10.0, 200.0, 200.0]])],
        CriticVerdict::Accept,
    );
    run(&h, &config(tmp.path())).await.unwrap();

    let refresh = PipelineConfig::builder()
        .artifact_root(tmp.path())
        .dpi(72)
        .cache_policy(CachePolicy::Refresh)
        .build()
        .unwrap();
    let manual = run(&h, &refresh).await.unwrap();

    assert_eq!(h.counts(), [2, 2, 2, 2]);
    assert!(!manual.stats.cache_hits.render);
    assert_eq!(subdirs(tmp.path().join("pdf_pages")), 1);
}

#[tokio::test]
async fn changed_resolution_gets_its_own_render_entry() {
    let tmp = tempfile::tempdir().unwrap();
    let h = Harness::new(vec![(850, 1100)], vec![], CriticVerdict::Accept);
    run(&h, &config(tmp.path())).await.unwrap();

    let hi_res = PipelineConfig::builder()
        .artifact_root(tmp.path())
        .dpi(150)
        .build()
        .unwrap();
    run(&h, &hi_res).await.unwrap();

    assert_eq!(h.rasterizer.calls.load(Ordering::SeqCst), 2);
    assert_eq!(subdirs(tmp.path().join("pdf_pages")), 2);
}

#[tokio::test]
async fn steps_come_back_in_reading_order_under_concurrency() {
    let tmp = tempfile::tempdir().unwrap();
    let boxes: Vec<[f32; 4]> = (0..8)
        .rev()
        .map(|i| {
            let y = 20.0 + i as f32 * 120.0;
            [20.0, y, 400.0, y + 100.0]
        })
        .collect();
    let h = Harness::new(vec![(850, 1100), (850, 1100)], vec![(0, boxes.clone()), (1, boxes)], CriticVerdict::Accept);
    let manual = run(&h, &config(tmp.path())).await.unwrap();

    assert_eq!(manual.steps.len(), 16);
    for (i, step) in manual.steps.iter().enumerate() {
        assert_eq!(step.global_step_index, i);
        assert_eq!(step.text, format!("Attach panel {i}."));
    }
    assert!(manual.text.starts_with("## Step 1\n\nAttach panel 0.\n"));
    assert!(manual.text.contains("## Step 16\n\nAttach panel 15.\n"));
}

#[tokio::test]
async fn prior_context_chains_step_texts() {
    let tmp = tempfile::tempdir().unwrap();
    let h = Harness::new(
        vec![(850, 1100)],
        vec![(0, vec![[10.0, 10.0, 200.0, 200.0], [10.0, 300.0, 200.0, 500.0]])],
        CriticVerdict::Accept,
    );
    let cfg = PipelineConfig::builder()
        .artifact_root(tmp.path())
        .dpi(72)
        .carry_prior_context(true)
        .build()
        .unwrap();
    run(&h, &cfg).await.unwrap();

    let contexts = h.proposer.contexts.lock().unwrap();
    assert_eq!(contexts.len(), 2);
    assert_eq!(contexts[0].1, None);
    assert_eq!(contexts[1].1.as_deref(), Some("Attach panel 0."));
}

#[tokio::test]
async fn non_pdf_input_fails_in_input_stage() {
    let tmp = tempfile::tempdir().unwrap();
    let h = Harness::new(vec![(850, 1100)], vec![], CriticVerdict::Accept);
    let err = convert_from_bytes(b"GIF89a".to_vec(), "x.gif", &config(tmp.path()), &h.collaborators())
        .await
        .unwrap_err();

    assert_eq!(err.stage(), Some(Stage::Input));
    assert_eq!(h.counts(), [0, 0, 0, 0]);
}

#[tokio::test]
async fn missing_file_fails_in_input_stage() {
    let tmp = tempfile::tempdir().unwrap();
    let h = Harness::new(vec![(850, 1100)], vec![], CriticVerdict::Accept);
    let source = DocumentSource::Path(tmp.path().join("nope.pdf"));
    let err = convert(source, &config(tmp.path()), &h.collaborators())
        .await
        .unwrap_err();

    assert_eq!(err.stage(), Some(Stage::Input));
}

#[tokio::test]
async fn failed_first_draft_only_exhausts_its_own_step() {
    let tmp = tempfile::tempdir().unwrap();
    let mut h = Harness::new(
        vec![(850, 1100)],
        vec![(0, vec![[10.0, 10.0, 200.0, 200.0], [10.0, 400.0, 200.0, 600.0]])],
        CriticVerdict::Accept,
    );
    h.proposer = Arc::new(EchoProposer {
        fail_step: Some(1),
        ..Default::default()
    });
    let cfg = config(tmp.path());
    let manual = run(&h, &cfg).await.unwrap();

    assert_eq!(manual.steps.len(), 2);
    assert_eq!(manual.steps[0].status, StepStatus::Accepted);
    assert_eq!(manual.steps[0].text, "Attach panel 0.");
    let failed = &manual.steps[1];
    assert_eq!(failed.status, StepStatus::Exhausted);
    assert_eq!(failed.text, MISSING_INSTRUCTION);
    assert!(matches!(failed.error, Some(CollaboratorError::Failed { .. })));
    assert_eq!((manual.stats.exhausted, manual.stats.undrafted), (1, 1));
    assert_eq!(
        manual.text,
        format!("## Step 1\n\nAttach panel 0.\n\n## Step 2\n\n{MISSING_INSTRUCTION}\n")
    );
    let stored = h.store.get(&manual.document_id).await.unwrap();
    assert_eq!(stored.as_deref(), Some(manual.text.as_str()));
    assert_eq!(h.counts()[2..], [2, 1]);

    // The undrafted step makes the instructions entry stale.
    let rerun = run(&h, &cfg).await.unwrap();
    assert!(rerun.stats.cache_hits.crop);
    assert!(!rerun.stats.cache_hits.negotiate);
    assert_eq!(h.counts()[2..], [4, 2]);
}

#[tokio::test]
async fn convert_to_file_writes_the_text() {
    let tmp = tempfile::tempdir().unwrap();
    let pdf_path = tmp.path().join("manual.pdf");
    std::fs::write(&pdf_path, PDF).unwrap();
    let out = tmp.path().join("out").join("steps.md");

    let h = Harness::new(
        vec![(850, 1100)],
        vec![(0, vec![[10.0, 10.0, 200.0, 200.0]])],
        CriticVerdict::Accept,
    );
    let manual = convert_to_file(
        DocumentSource::Path(pdf_path),
        &out,
        &config(&tmp.path().join("artifacts")),
        &h.collaborators(),
    )
    .await
    .unwrap();

    assert_eq!(std::fs::read_to_string(&out).unwrap(), manual.text);
    assert!(!out.with_extension("md.tmp").exists());
}
