//! CLI binary for doc2comic.
//!
//! A thin shim over the library crate that maps CLI flags to
//! `GenerationConfig` / `GenerationOptions` and prints where each format
//! was written.

use anyhow::{Context, Result};
use clap::Parser;
use doc2comic::{
    run_once, ExportResult, GenerationConfig, GenerationObserver, GenerationOptions, GenerationRequest, JobStatus,
    OutputFormat, Pipeline, Stage,
};
use indicatif::{ProgressBar, ProgressStyle};
use std::collections::BTreeSet;
use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

// ── ANSI colour helpers ──────────────────────────────────────────────────

fn green(s: &str) -> String {
    format!("\x1b[32m{s}\x1b[0m")
}
fn red(s: &str) -> String {
    format!("\x1b[31m{s}\x1b[0m")
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

// ── Terminal observer ────────────────────────────────────────────────────

/// Live progress for one job. Starts as a spinner and becomes a panel
/// counter once the script is known.
struct CliObserver {
    bar: ProgressBar,
    degraded: AtomicUsize,
}

impl CliObserver {
    fn new() -> Arc<Self> {
        let bar = ProgressBar::new(0);
        bar.set_style(
            ProgressStyle::with_template("{spinner:.cyan} {prefix:.bold}  {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner())
                .tick_strings(TICKS),
        );
        bar.set_prefix("Preparing");
        bar.enable_steady_tick(Duration::from_millis(80));
        Arc::new(Self {
            bar,
            degraded: AtomicUsize::new(0),
        })
    }
}

impl GenerationObserver for CliObserver {
    fn on_status_change(&self, _job_id: &str, status: JobStatus) {
        if status.is_terminal() {
            self.bar.finish_and_clear();
            let degraded = self.degraded.load(Ordering::SeqCst);
            if degraded > 0 {
                eprintln!("{} {} panel(s) drawn as placeholders", cyan("⚠"), bold(&degraded.to_string()));
            }
        }
    }

    fn on_stage_start(&self, _job_id: &str, stage: Stage) {
        self.bar.set_message(stage.describe().to_string());
    }

    fn on_script_ready(&self, _job_id: &str, total_panels: usize, total_pages: usize) {
        self.bar.println(format!(
            "{} {}",
            cyan("◆"),
            bold(&format!("Script ready: {total_panels} panels on {total_pages} pages"))
        ));
        self.bar.set_length(total_panels as u64);
        self.bar.set_style(
            ProgressStyle::with_template(
                "{spinner:.cyan} {prefix:.bold}  [{bar:42.green/238}] {pos:>3}/{len} panels  ⏱ {elapsed_precise}",
            )
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("█▉▊▋▌▍▎▏  ")
            .tick_strings(TICKS),
        );
        self.bar.set_prefix("Drawing");
    }

    fn on_panel_complete(&self, _job_id: &str, panel_number: u32, total_panels: usize, degraded: bool) {
        if degraded {
            self.degraded.fetch_add(1, Ordering::SeqCst);
            self.bar.println(format!(
                "  {} Panel {:>3}/{:<3}  {}",
                red("✗"),
                panel_number,
                total_panels,
                dim("placeholder")
            ));
        }
        self.bar.inc(1);
    }

    fn on_page_rendered(&self, _job_id: &str, page_number: u32, total_pages: usize) {
        self.bar.set_prefix("Composing");
        self.bar.set_message(format!("page {page_number}/{total_pages}"));
    }

    fn on_export_result(&self, _job_id: &str, format: OutputFormat, result: Result<&ExportResult, &str>) {
        match result {
            Ok(r) => self.bar.println(format!(
                "  {} {:<15} {}",
                green("✓"),
                format.id(),
                dim(&format!("{} bytes", r.byte_size))
            )),
            Err(reason) => self
                .bar
                .println(format!("  {} {:<15} {}", red("✗"), format.id(), red(reason))),
        }
    }
}

const AFTER_HELP: &str = r#"EXAMPLES:
  # A PDF as a 10-page CBZ archive
  doc2comic report.pdf --pages 10 --formats cbz

  # Raw text, every format, manga style
  doc2comic --text "A robot learns to grow flowers." --style manga --formats pdf,cbz,web

  # Spanish comic, JSON result on stdout
  doc2comic story.txt --language es --json > result.json

ENVIRONMENT VARIABLES:
  OPENAI_API_KEY          Text model key (default provider)
  EDGEQUAKE_LLM_PROVIDER  Override text provider (openai, anthropic, gemini, ollama)
  EDGEQUAKE_MODEL         Override text model ID
  MODELSLAB_API_KEY       Image-generation service key
  PDFIUM_LIB_PATH         Directory containing libpdfium (PDF sources only)
"#;

/// Turn documents into illustrated comic books.
#[derive(Parser, Debug)]
#[command(
    name = "doc2comic",
    version,
    about = "Turn a PDF or text into an illustrated comic book",
    arg_required_else_help = true,
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    /// Source document: a .pdf or a plain-text file.
    #[arg(conflicts_with = "text", required_unless_present = "text")]
    input: Option<PathBuf>,

    /// Use this text as the source instead of a file.
    #[arg(long)]
    text: Option<String>,

    /// Output formats, comma separated: pdf, cbz, web.
    #[arg(short, long, env = "DOC2COMIC_FORMATS", default_value = "pdf")]
    formats: String,

    /// Target number of comic pages (1–100).
    #[arg(short, long, env = "DOC2COMIC_PAGES", default_value_t = 20,
          value_parser = clap::value_parser!(u32).range(1..=100))]
    pages: u32,

    /// Art style, e.g. cartoon, manga, noir.
    #[arg(long, env = "DOC2COMIC_STYLE", default_value = "cartoon")]
    style: String,

    /// Intended audience.
    #[arg(long, env = "DOC2COMIC_AUDIENCE", default_value = "general")]
    audience: String,

    /// Language of the finished comic.
    #[arg(short, long, env = "DOC2COMIC_LANGUAGE", default_value = "en")]
    language: String,

    /// Language of the source (default: en).
    #[arg(long, env = "DOC2COMIC_SOURCE_LANGUAGE")]
    source_language: Option<String>,

    /// Override the generated title.
    #[arg(long)]
    title: Option<String>,

    /// Root directory for job outputs.
    #[arg(short, long, env = "DOC2COMIC_OUTPUT_DIR", default_value = "outputs")]
    output_dir: PathBuf,

    /// Text model ID.
    #[arg(long, env = "EDGEQUAKE_MODEL")]
    model: Option<String>,

    /// Text provider: openai, anthropic, gemini, ollama.
    #[arg(long, env = "EDGEQUAKE_PROVIDER")]
    provider: Option<String>,

    /// Maximum panels generated at once (1–20).
    #[arg(long, env = "DOC2COMIC_PARALLEL", default_value_t = 5)]
    parallel: usize,

    /// TTF/OTF font for balloon text.
    #[arg(long, env = "DOC2COMIC_FONT")]
    font: Option<PathBuf>,

    /// Print the full result as JSON.
    #[arg(long)]
    json: bool,

    /// Disable the progress bar.
    #[arg(long, env = "DOC2COMIC_NO_PROGRESS")]
    no_progress: bool,

    /// Enable DEBUG-level tracing logs.
    #[arg(short, long, env = "DOC2COMIC_VERBOSE")]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // ── Logging setup ────────────────────────────────────────────────────
    let show_progress = !cli.no_progress && !cli.json && !cli.verbose;
    let filter = if cli.verbose {
        "debug"
    } else if show_progress {
        "error"
    } else {
        "info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .with_writer(io::stderr)
        .init();

    // ── Build request ────────────────────────────────────────────────────
    let options = GenerationOptions {
        art_style: cli.style.clone(),
        target_pages: cli.pages,
        target_audience: cli.audience.clone(),
        target_language: cli.language.clone(),
        source_language: cli.source_language.clone(),
        title: cli.title.clone(),
        output_formats: parse_formats(&cli.formats)?,
    };
    let request = match (&cli.text, &cli.input) {
        (Some(text), _) => GenerationRequest::from_text(text.clone(), options),
        (None, Some(path)) => GenerationRequest::from_file(path.clone(), options),
        (None, None) => anyhow::bail!("either an input file or --text is required"),
    };

    let config = build_config(&cli)?;
    let mut pipeline = Pipeline::from_config(config).context("Failed to set up services")?;
    if show_progress {
        pipeline = pipeline.with_observer(CliObserver::new());
    }

    // ── Run ──────────────────────────────────────────────────────────────
    let result = run_once(&pipeline, &request).await.context("Generation failed")?;

    if cli.json {
        println!(
            "{}",
            serde_json::to_string_pretty(&result).context("Failed to serialise result")?
        );
        return Ok(());
    }

    let icon = if result.export_failures.is_empty() && result.degraded_panels.is_empty() {
        green("✔")
    } else {
        cyan("⚠")
    };
    eprintln!(
        "{}  {}  {} page(s)  {}ms",
        icon,
        bold(&result.title),
        result.actual_pages,
        result.duration_ms
    );
    for book in &result.comic_books {
        println!("{:<15} {}", book.format.id(), book.output_location.display());
    }
    for (format, reason) in &result.export_failures {
        eprintln!("   {} {} {}", red("✗"), format.id(), dim(reason));
    }
    for warning in &result.warnings {
        eprintln!("   {} {}", cyan("⚠"), dim(warning));
    }
    Ok(())
}

/// Map CLI args to `GenerationConfig`.
fn build_config(cli: &Cli) -> Result<GenerationConfig> {
    let mut builder = GenerationConfig::builder()
        .max_parallel_panels(cli.parallel)
        .output_dir(&cli.output_dir)
        .temp_dir(cli.output_dir.join("temp"));
    if let Some(ref model) = cli.model {
        builder = builder.model(model);
    }
    if let Some(ref provider) = cli.provider {
        builder = builder.provider_name(provider);
    }
    if let Some(ref font) = cli.font {
        builder = builder.font_path(font);
    }
    builder.build().context("Invalid configuration")
}

/// Parse `--formats` into a set of output formats.
fn parse_formats(s: &str) -> Result<BTreeSet<OutputFormat>> {
    let formats = s
        .split(',')
        .map(str::trim)
        .filter(|f| !f.is_empty())
        .map(|f| f.parse::<OutputFormat>().with_context(|| format!("Invalid format '{f}'")))
        .collect::<Result<BTreeSet<_>>>()?;
    if formats.is_empty() {
        anyhow::bail!("at least one output format is required");
    }
    Ok(formats)
}
