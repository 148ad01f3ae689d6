//! CLI binary for manual2steps.
//!
//! A thin shim over the library crate that maps CLI flags
//! to `PipelineConfig` and prints results.

use anyhow::{bail, Context, Result};
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use manual2steps::{
    convert, convert_to_file, resolve_source, CachePolicy, Collaborators, CommandDetector, DocumentSource,
    DocumentStore, FileDocumentStore, PipelineConfig, PipelineProgressCallback, ProgressCallback,
    Stage, StepStatus,
};
use std::collections::HashMap;
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;

// ── ANSI colour helpers (no extra deps) ──────────────────────────────────────

fn green(s: &str) -> String {
    format!("\x1b[32m{s}\x1b[0m")
}
fn yellow(s: &str) -> String {
    format!("\x1b[33m{s}\x1b[0m")
}
fn dim(s: &str) -> String {
    format!("\x1b[2m{s}\x1b[0m")
}
fn bold(s: &str) -> String {
    format!("\x1b[1m{s}\x1b[0m")
}
fn cyan(s: &str) -> String {
    format!("\x1b[36m{s}\x1b[0m")
}

const TICKS: &[&str] = &["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏", "⠿"];

// ── CLI progress callback using indicatif ────────────────────────────────────

/// Spinner while the cached stages run, then a step counter during
/// negotiation. Steps may finish out of order.
struct CliProgressCallback {
    bar: ProgressBar,
    start_times: Mutex<HashMap<usize, Instant>>,
}

impl CliProgressCallback {
    fn new() -> Arc<Self> {
        let bar = ProgressBar::new(0);
        let spinner_style = ProgressStyle::with_template("{spinner:.cyan} {prefix:.bold}  {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner())
            .tick_strings(TICKS);

        bar.set_style(spinner_style);
        bar.set_prefix("Preparing");
        bar.set_message("Opening PDF…");
        bar.enable_steady_tick(Duration::from_millis(80));

        Arc::new(Self {
            bar,
            start_times: Mutex::new(HashMap::new()),
        })
    }
}

impl PipelineProgressCallback for CliProgressCallback {
    fn on_stage_start(&self, stage: Stage) {
        let label = match stage {
            Stage::Render => "Rendering pages",
            Stage::Detect => "Detecting steps",
            Stage::Crop => "Cropping steps",
            Stage::Negotiate => "Writing instructions",
            Stage::Input | Stage::Assemble => return,
        };
        self.bar.set_prefix(label);
        self.bar.set_message("");
    }

    fn on_stage_complete(&self, stage: Stage, cached: bool) {
        let note = if cached { dim("(cached)") } else { String::new() };
        self.bar
            .println(format!("{} {} {}", cyan("◆"), bold(&stage.to_string()), note));
    }

    fn on_negotiation_start(&self, total_steps: usize) {
        let style = ProgressStyle::with_template(
            "{spinner:.cyan} {prefix:.bold}  \
             [{bar:42.green/238}] {pos:>3}/{len} steps  \
             ⏱ {elapsed_precise}  ETA {eta_precise}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("█▉▊▋▌▍▎▏  ")
        .tick_strings(TICKS);

        self.bar.set_length(total_steps as u64);
        self.bar.set_style(style);
        self.bar.reset_eta();
    }

    fn on_step_start(&self, step_index: usize, _total: usize) {
        if let Ok(mut times) = self.start_times.lock() {
            times.insert(step_index, Instant::now());
        }
        self.bar.set_message(format!("step {}", step_index + 1));
    }

    fn on_step_complete(&self, step_index: usize, total: usize, status: StepStatus) {
        let elapsed_ms = self
            .start_times
            .lock()
            .ok()
            .and_then(|mut t| t.remove(&step_index))
            .map(|t| t.elapsed().as_millis())
            .unwrap_or(0);
        let mark = match status {
            StepStatus::Accepted => green("✓"),
            StepStatus::Skipped => dim("-"),
            _ => yellow("~"),
        };

        self.bar.println(format!(
            "  {} Step {:>3}/{:<3}  {:<14}  {}",
            mark,
            step_index + 1,
            total,
            dim(&format!("{status:?}")),
            dim(&format!("{:.1}s", elapsed_ms as f64 / 1000.0)),
        ));
        self.bar.inc(1);
    }

    fn on_pipeline_complete(&self, total_steps: usize) {
        self.bar.finish_and_clear();
        eprintln!(
            "{} {} steps written",
            green("✔"),
            bold(&total_steps.to_string())
        );
    }
}

const AFTER_HELP: &str = r#"EXAMPLES:
  # Instructions for a manual (stdout)
  manual2steps --detector-cmd ./detect_steps.py manual.pdf

  # Write to a file, recomputing every stage
  manual2steps --detector-cmd ./detect_steps.py --refresh manual.pdf -o steps.md

  # Different models for the two roles
  manual2steps --detector-cmd yolo-detect --provider openai \
      --model gpt-4.1 --critic-model gpt-4.1-nano manual.pdf

  # Print a previously assembled manual without running anything
  manual2steps --from-store manual.pdf

DETECTOR PROGRAM:
  Invoked once with every page image path appended to --detector-arg values.
  Must print a JSON array with one entry per image, each a list of
  {"bbox": [x1, y1, x2, y2], "confidence": 0.9, "class_id": 0}.
  Missing confidence / class_id default to 0; malformed records are skipped.

ENVIRONMENT VARIABLES:
  OPENAI_API_KEY          OpenAI API key
  ANTHROPIC_API_KEY       Anthropic API key
  GEMINI_API_KEY          Google Gemini API key
  EDGEQUAKE_LLM_PROVIDER  Override provider (openai, anthropic, gemini, ollama)
  EDGEQUAKE_MODEL         Override model ID
  PDFIUM_LIB_PATH         Path to an existing libpdfium (skips auto-download)
  PDFIUM_AUTO_CACHE_DIR   Override the default pdfium cache directory
"#;

/// Turn furniture assembly manuals into step-by-step text instructions.
#[derive(Parser, Debug)]
#[command(
    name = "manual2steps",
    version,
    about = "Turn PDF assembly manuals into step-by-step text instructions",
    long_about = "Render a PDF assembly manual, detect its step panels, crop them, and have a \
vision model draft each instruction while a text-only critic asks for clarifications. All \
intermediate artifacts are cached under the artifact root.",
    arg_required_else_help = true,
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    /// Local PDF file path or HTTP/HTTPS URL.
    input: String,

    /// Write the instructions to this file instead of stdout.
    #[arg(short, long, env = "MANUAL2STEPS_OUTPUT")]
    output: Option<PathBuf>,

    /// Region detector program.
    #[arg(long, env = "MANUAL2STEPS_DETECTOR_CMD")]
    detector_cmd: Option<PathBuf>,

    /// Argument passed to the detector before the image paths (repeatable).
    #[arg(long = "detector-arg", allow_hyphen_values = true)]
    detector_args: Vec<String>,

    /// Detector identifier used in cache keys (default: derived from the program name).
    #[arg(long, env = "MANUAL2STEPS_DETECTOR_ID")]
    detector_id: Option<String>,

    /// Detector timeout in seconds for one batch.
    #[arg(long, env = "MANUAL2STEPS_DETECTOR_TIMEOUT", default_value_t = 600)]
    detector_timeout: u64,

    /// Root directory of the artifact cache.
    #[arg(long, env = "MANUAL2STEPS_ARTIFACTS", default_value = "artifacts")]
    artifacts: PathBuf,

    /// Directory of the document store (default: <artifacts>/documents).
    #[arg(long, env = "MANUAL2STEPS_STORE_DIR")]
    store_dir: Option<PathBuf>,

    /// Print the stored instructions for this input and exit.
    #[arg(long)]
    from_store: bool,

    /// Ignore cached artifacts and recompute every stage.
    #[arg(long, env = "MANUAL2STEPS_REFRESH")]
    refresh: bool,

    /// Proposer (vision) model ID.
    #[arg(long, env = "EDGEQUAKE_MODEL")]
    model: Option<String>,

    /// Critic model ID (default: the proposer model).
    #[arg(long, env = "MANUAL2STEPS_CRITIC_MODEL")]
    critic_model: Option<String>,

    /// LLM provider: openai, anthropic, gemini, ollama, azure.
    #[arg(long, env = "EDGEQUAKE_PROVIDER")]
    provider: Option<String>,

    /// Rendering DPI (72–400).
    #[arg(long, env = "MANUAL2STEPS_DPI", default_value_t = 200,
          value_parser = clap::value_parser!(u32).range(72..=400))]
    dpi: u32,

    /// Raster format for pages and crops.
    #[arg(long, env = "MANUAL2STEPS_FORMAT", default_value = "png")]
    format: String,

    /// Padding in pixels around each detected step.
    #[arg(long, env = "MANUAL2STEPS_PADDING", default_value_t = 16)]
    padding: u32,

    /// Minimum width and height in pixels of a detected step.
    #[arg(long, env = "MANUAL2STEPS_MIN_BOX", default_value_t = 10)]
    min_box: u32,

    /// Parallel detector / crop / negotiation tasks.
    #[arg(short, long, env = "MANUAL2STEPS_CONCURRENCY", default_value_t = 4)]
    concurrency: usize,

    /// Pass each step's final text to the next step (forces sequential negotiation).
    #[arg(long, env = "MANUAL2STEPS_PRIOR_CONTEXT")]
    prior_context: bool,

    /// Have the critic model tighten every first draft before negotiation.
    #[arg(long, env = "MANUAL2STEPS_REFLECT")]
    reflect: bool,

    /// PDF user password for encrypted documents.
    #[arg(long, env = "MANUAL2STEPS_PASSWORD")]
    password: Option<String>,

    /// Max LLM output tokens per call.
    #[arg(long, env = "MANUAL2STEPS_MAX_TOKENS", default_value_t = 1024)]
    max_tokens: usize,

    /// Retries per LLM call.
    #[arg(long, env = "MANUAL2STEPS_MAX_RETRIES", default_value_t = 2)]
    max_retries: u32,

    /// Per-attempt LLM timeout in seconds.
    #[arg(long, env = "MANUAL2STEPS_API_TIMEOUT", default_value_t = 60)]
    api_timeout: u64,

    /// Upper bound in seconds on one proposer or critic call, retries included.
    #[arg(long, env = "MANUAL2STEPS_STEP_TIMEOUT", default_value_t = 300)]
    step_timeout: u64,

    /// HTTP download timeout in seconds.
    #[arg(long, env = "MANUAL2STEPS_DOWNLOAD_TIMEOUT", default_value_t = 120)]
    download_timeout: u64,

    /// Output the assembled manual (steps, statuses, stats) as JSON.
    #[arg(long, env = "MANUAL2STEPS_JSON")]
    json: bool,

    /// Disable progress bar.
    #[arg(long, env = "MANUAL2STEPS_NO_PROGRESS")]
    no_progress: bool,

    /// Enable DEBUG-level tracing logs.
    #[arg(short, long, env = "MANUAL2STEPS_VERBOSE")]
    verbose: bool,

    /// Suppress all output except errors.
    #[arg(short, long, env = "MANUAL2STEPS_QUIET")]
    quiet: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // ── Logging setup ────────────────────────────────────────────────────
    let show_progress = !cli.quiet && !cli.no_progress && !cli.json && !cli.from_store;
    let filter = if cli.verbose {
        "debug"
    } else if cli.quiet || show_progress {
        "error"
    } else {
        "info"
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_writer(io::stderr)
        .init();

    let source = DocumentSource::parse(&cli.input).context("Invalid input")?;
    let store_dir = cli
        .store_dir
        .clone()
        .unwrap_or_else(|| cli.artifacts.join("documents"));
    let store = Arc::new(FileDocumentStore::new(store_dir));

    // ── Store lookup mode ────────────────────────────────────────────────
    if cli.from_store {
        let document = resolve_source(source, cli.download_timeout)
            .await
            .context("Failed to read input")?;
        match store.get(&document.content_hash).await? {
            Some(text) => write_stdout(&text)?,
            None => bail!(
                "No stored instructions for {} (document id {})",
                cli.input,
                document.content_hash
            ),
        }
        return Ok(());
    }

    let Some(ref program) = cli.detector_cmd else {
        bail!("--detector-cmd is required unless --from-store is given");
    };

    ensure_pdfium(cli.quiet)?;

    // ── Build config and collaborators ───────────────────────────────────
    let progress_cb: Option<ProgressCallback> = if show_progress {
        Some(CliProgressCallback::new() as Arc<dyn PipelineProgressCallback>)
    } else {
        None
    };
    let config = build_config(&cli, progress_cb)?;

    let mut detector = CommandDetector::new(program, cli.detector_args.clone())
        .with_timeout(Duration::from_secs(cli.detector_timeout));
    if let Some(ref id) = cli.detector_id {
        detector = detector.with_id(id.clone());
    }
    let collaborators = Collaborators::from_config(&config, Arc::new(detector))
        .context("Failed to configure the LLM provider")?
        .with_store(store);

    // ── Run pipeline ─────────────────────────────────────────────────────
    let manual = if let Some(ref output_path) = cli.output {
        convert_to_file(source, output_path, &config, &collaborators)
            .await
            .context("Conversion failed")?
    } else {
        let manual = convert(source, &config, &collaborators)
            .await
            .context("Conversion failed")?;
        if cli.json {
            let json =
                serde_json::to_string_pretty(&manual).context("Failed to serialise output")?;
            println!("{json}");
        } else {
            write_stdout(&manual.text)?;
        }
        manual
    };

    if !cli.quiet {
        let s = &manual.stats;
        if manual.is_empty() {
            eprintln!("{} no steps detected in {} pages", yellow("⚠"), s.page_count);
        }
        eprintln!(
            "   {} steps: {} accepted, {} ambiguous, {} exhausted, {} skipped  —  {} proposer / {} critic calls, {}ms",
            s.step_count,
            s.accepted,
            s.ambiguous_exits,
            s.exhausted,
            s.skipped,
            dim(&s.proposer_calls.to_string()),
            dim(&s.critic_calls.to_string()),
            s.total_duration_ms,
        );
        if s.undrafted > 0 {
            eprintln!(
                "{} {} steps have no instruction (role failures); run again to retry them",
                yellow("⚠"),
                s.undrafted
            );
        }
        if let Some(ref path) = cli.output {
            eprintln!("   →  {}", bold(&path.display().to_string()));
        }
    }

    Ok(())
}

fn write_stdout(text: &str) -> Result<()> {
    let stdout = io::stdout();
    let mut handle = stdout.lock();
    handle
        .write_all(text.as_bytes())
        .context("Failed to write to stdout")?;
    if !text.ends_with('\n') {
        handle.write_all(b"\n").ok();
    }
    Ok(())
}

/// Make sure a pdfium library is available before rendering.
///
/// With `--features bundled` the library was embedded at compile time and
/// is only extracted; otherwise it is downloaded once into the user cache.
fn ensure_pdfium(quiet: bool) -> Result<()> {
    #[cfg(feature = "bundled")]
    {
        let _ = quiet;
        tokio::task::block_in_place(|| pdfium_auto::ensure_pdfium_bundled())
            .context("Failed to extract bundled PDFium engine")?;
    }

    #[cfg(not(feature = "bundled"))]
    if !pdfium_auto::is_pdfium_cached() {
        if quiet {
            tokio::task::block_in_place(|| pdfium_auto::ensure_pdfium_library(None))
                .context("Failed to download PDFium engine")?;
            return Ok(());
        }

        let dl_bar = ProgressBar::new(0);
        dl_bar.set_style(
            ProgressStyle::with_template(
                "{spinner:.cyan} {prefix:.bold}  \
                 [{bar:42.green/238}] {bytes}/{total_bytes}  ETA {eta_precise}",
            )
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("█▉▊▋▌▍▎▏  ")
            .tick_strings(TICKS),
        );
        dl_bar.set_prefix("PDF engine");
        dl_bar.enable_steady_tick(Duration::from_millis(80));

        let bar = dl_bar.clone();
        tokio::task::block_in_place(|| {
            pdfium_auto::ensure_pdfium_library(Some(&|downloaded, total| {
                if let Some(t) = total {
                    if bar.length().unwrap_or(0) != t {
                        bar.set_length(t);
                    }
                }
                bar.set_position(downloaded);
            }))
        })
        .context("Failed to download PDFium engine")?;

        dl_bar.finish_with_message("ready ✓");
    }

    Ok(())
}

/// Map CLI args to `PipelineConfig`.
fn build_config(cli: &Cli, progress: Option<ProgressCallback>) -> Result<PipelineConfig> {
    let mut builder = PipelineConfig::builder()
        .artifact_root(&cli.artifacts)
        .cache_policy(if cli.refresh {
            CachePolicy::Refresh
        } else {
            CachePolicy::UseCache
        })
        .dpi(cli.dpi)
        .format(cli.format.clone())
        .padding_px(cli.padding)
        .min_box_size_px(cli.min_box)
        .concurrency(cli.concurrency)
        .carry_prior_context(cli.prior_context)
        .reflect_drafts(cli.reflect)
        .max_tokens(cli.max_tokens)
        .max_retries(cli.max_retries)
        .api_timeout_secs(cli.api_timeout)
        .step_call_timeout_secs(cli.step_timeout)
        .download_timeout_secs(cli.download_timeout);

    if let Some(ref provider) = cli.provider {
        builder = builder.provider_name(provider.clone());
    }
    if let Some(ref model) = cli.model {
        builder = builder.proposer_model(model.clone());
    }
    if let Some(ref model) = cli.critic_model {
        builder = builder.critic_model(model.clone());
    }
    if let Some(ref pwd) = cli.password {
        builder = builder.password(pwd.clone());
    }
    if let Some(cb) = progress {
        builder = builder.progress_callback(cb);
    }

    builder.build().context("Invalid configuration")
}
