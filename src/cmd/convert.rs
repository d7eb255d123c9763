//! The `convert` subcommand.

use std::sync::Arc;

use clap::Args;

use super::collect_pdf_inputs;
use crate::{
    audit::{AuditSink, JsonlAuditSink, TracingAuditSink},
    batch::{BatchJob, BatchJobRunner, BatchReport, BatchSummary, ProgressEvent},
    config::ConverterConfig,
    convert::{CollisionPolicy, ConversionTarget, DocumentConverter, OutcomeStatus, OutputFormat},
    ocr::TesseractOcrEngine,
    pdf::{PdfToCairoRasterizer, PopplerTextExtractor},
    prelude::*,
    preprocess::{Binarization, ImagePreprocessor},
    toolchain::OcrCapability,
    ui::{ProgressConfig, Ui},
};

/// Options for the `convert` subcommand.
#[derive(Debug, Args)]
pub struct ConvertOpts {
    /// PDF files, or directories containing PDF files.
    #[clap(required = true, value_name = "INPUTS")]
    pub inputs: Vec<PathBuf>,

    /// Also look for PDFs in subdirectories of directory inputs.
    #[clap(short = 'r', long)]
    pub recursive: bool,

    /// Output format. Documents that need OCR are always written as text.
    #[clap(short = 'f', long, value_enum, default_value_t = OutputFormat::Docx)]
    pub format: OutputFormat,

    /// Directory for output files. Created if it does not exist.
    #[clap(short = 'o', long = "output-dir", default_value = ".")]
    pub output_dir: PathBuf,

    /// What to do when an output file already exists.
    #[clap(long = "on-conflict", value_enum, default_value_t = CollisionPolicy::Fail)]
    pub on_conflict: CollisionPolicy,

    /// TOML file with tuning settings.
    #[clap(long = "config", value_name = "FILE")]
    pub config_path: Option<PathBuf>,

    /// Append one JSON audit record per file to this file.
    #[clap(long = "audit-log", value_name = "FILE")]
    pub audit_log: Option<PathBuf>,

    /// Write the batch summary as JSON to this file.
    #[clap(long = "summary-out", value_name = "FILE")]
    pub summary_path: Option<PathBuf>,

    /// What portion of inputs should we allow to fail? Specified as a
    /// number between 0.0 and 1.0.
    #[clap(long, default_value = "0.0")]
    pub allowed_failure_rate: f32,

    #[clap(flatten)]
    pub tuning: TuningOpts,
}

/// Command-line overrides for [`ConverterConfig`].
#[derive(Debug, Default, Args)]
pub struct TuningOpts {
    /// OCR languages, as Tesseract names. Repeat or join with `+`
    /// (`-l pol+eng`). Defaults to `pol`.
    #[clap(short = 'l', long = "lang", value_delimiter = '+')]
    pub languages: Vec<String>,

    /// Keep OCR output exactly as Tesseract produced it.
    #[clap(long)]
    pub raw_ocr_text: bool,

    /// Separate pages with a blank line instead of a form feed.
    #[clap(long)]
    pub no_page_breaks: bool,

    /// Pages with fewer visible characters than this are OCRed.
    #[clap(long)]
    pub min_text_chars: Option<usize>,

    /// Render pages at this multiple of 72 dpi.
    #[clap(long)]
    pub render_scale: Option<f32>,

    /// Upscale rendered pages by this factor before cleanup.
    #[clap(long)]
    pub upscale_factor: Option<f32>,

    /// Fixed black/white threshold (0-255).
    #[clap(long)]
    pub threshold: Option<u8>,

    /// Pick the black/white threshold per page with Otsu's method.
    #[clap(long, conflicts_with = "threshold")]
    pub otsu: bool,

    /// Tesseract page segmentation mode.
    #[clap(long)]
    pub psm: Option<u8>,
}

impl TuningOpts {
    /// Apply these flags on top of `config`.
    pub fn apply_to(&self, config: &mut ConverterConfig) -> Result<()> {
        if !self.languages.is_empty() {
            config.languages = self
                .languages
                .iter()
                .map(|l| l.trim().to_owned())
                .filter(|l| !l.is_empty())
                .collect();
        }
        if self.raw_ocr_text {
            config.clean_ocr_text = false;
        }
        if self.no_page_breaks {
            config.page_breaks = false;
        }
        if let Some(min_chars) = self.min_text_chars {
            config.text_layer.min_chars = min_chars;
        }
        if let Some(render_scale) = self.render_scale {
            config.preprocess.render_scale = render_scale;
        }
        if let Some(upscale_factor) = self.upscale_factor {
            config.preprocess.upscale_factor = upscale_factor;
        }
        if let Some(threshold) = self.threshold {
            config.preprocess.binarization = Binarization::Fixed(threshold);
        }
        if self.otsu {
            config.preprocess.binarization = Binarization::Otsu;
        }
        if let Some(psm) = self.psm {
            config.page_segmentation_mode = psm;
        }
        config.validate()
    }
}

/// The `convert` subcommand.
#[instrument(level = "debug", skip_all)]
pub async fn cmd_convert(ui: Ui, opts: &ConvertOpts) -> Result<()> {
    let mut config = match &opts.config_path {
        Some(path) => ConverterConfig::load(path).await?,
        None => ConverterConfig::default(),
    };
    opts.tuning.apply_to(&mut config)?;
    if !(0.0..=1.0).contains(&opts.allowed_failure_rate) {
        return Err(anyhow!("--allowed-failure-rate must be between 0.0 and 1.0"));
    }
    debug!(?config, "Resolved configuration");

    let inputs = collect_pdf_inputs(&opts.inputs, opts.recursive).await?;
    if inputs.is_empty() {
        return Err(anyhow!("no PDF files found in the given inputs"));
    }

    // Check the toolchain once, before anything is opened.
    let capability = OcrCapability::detect(&config.languages).await?;

    tokio::fs::create_dir_all(&opts.output_dir)
        .await
        .with_context(|| format!("cannot create output directory {:?}", opts.output_dir.display()))?;

    let rasterizer = Arc::new(PdfToCairoRasterizer::new());
    let converter = DocumentConverter::new(
        Arc::new(PopplerTextExtractor::new()),
        ImagePreprocessor::new(rasterizer, config.preprocess),
        Arc::new(TesseractOcrEngine::new(&capability, config.ocr_options())),
        config.converter_options(),
    );

    let mut audit_sinks: Vec<Arc<dyn AuditSink>> = vec![Arc::new(TracingAuditSink)];
    if let Some(path) = &opts.audit_log {
        audit_sinks.push(Arc::new(JsonlAuditSink::open(path)?));
    }

    let job = BatchJob::new(
        inputs,
        ConversionTarget {
            output_dir: opts.output_dir.clone(),
            format: opts.format,
            collision: opts.on_conflict,
        },
    );
    let runner = BatchJobRunner::new(converter, audit_sinks);
    info!(batch_id = %runner.batch_id(), files = job.len(), "Starting batch");

    let pb = ui.new_progress_bar(
        &ProgressConfig {
            emoji: "📄",
            msg: "Converting PDFs",
            done_msg: "Converted PDFs",
        },
        job.len() as u64,
    );
    let mut handle = runner.spawn(job);

    // Drain progress until the worker hangs up, cancelling on Ctrl-C.
    let mut interrupts = Interrupts::default();
    loop {
        tokio::select! {
            event = handle.events.recv() => match event {
                Some(event) => {
                    report_event(&ui, &event);
                    pb.inc(1);
                }
                None => break,
            },
            result = tokio::signal::ctrl_c() => {
                result.context("cannot listen for Ctrl-C")?;
                match interrupts.press() {
                    CtrlC::Cancel => {
                        handle.cancel.cancel();
                        ui.display_message(
                            "🛑",
                            "Cancelling after the current step... (press Ctrl-C again to quit now)",
                        );
                    }
                    CtrlC::Exit => {
                        // A stuck external tool never reaches the next
                        // cancellation check.
                        ui.display_message("💥", "Interrupted again, exiting now");
                        std::process::exit(INTERRUPTED_EXIT_CODE);
                    }
                }
            }
        }
    }
    let report = handle.worker.join().await?;
    pb.finish_using_style();
    log_report_details(&report);

    if let Some(path) = &opts.summary_path {
        let json = serde_json::to_string_pretty(&report.summary)
            .context("failed to serialize batch summary")?;
        tokio::fs::write(path, json)
            .await
            .with_context(|| format!("cannot write summary to {:?}", path.display()))?;
    }
    finish(&ui, &report.summary, opts.allowed_failure_rate)
}

/// Conventional exit status for a process stopped by SIGINT.
const INTERRUPTED_EXIT_CODE: i32 = 130;

/// What a Ctrl-C should do.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum CtrlC {
    /// Ask the batch to stop at the next checkpoint.
    Cancel,
    /// Give up on a clean stop.
    Exit,
}

/// Counts Ctrl-C presses during a batch.
#[derive(Debug, Default)]
struct Interrupts {
    seen: usize,
}

impl Interrupts {
    fn press(&mut self) -> CtrlC {
        self.seen += 1;
        if self.seen == 1 { CtrlC::Cancel } else { CtrlC::Exit }
    }
}

/// Per-file detail for `RUST_LOG=debug`.
fn log_report_details(report: &BatchReport) {
    for (result, item) in report.results.iter().zip(&report.items) {
        if result.succeeded() {
            debug!(
                file_name = %result.file_name(),
                output_path = ?result.output_path,
                written_format = ?result.written_format,
                history = ?item.history(),
                "Converted"
            );
        } else {
            debug!(
                file_name = %result.file_name(),
                outcome = ?result.outcome.status(),
                history = ?item.history(),
                "Not converted"
            );
        }
    }
}

/// Show one finished item.
fn report_event(ui: &Ui, event: &ProgressEvent) {
    let position = format!("[{}/{}]", event.index + 1, event.total);
    match event.outcome {
        OutcomeStatus::Failed => ui.display_message(
            "❌",
            &format!(
                "{} {}: {}",
                position,
                event.file_name,
                event.reason.as_deref().unwrap_or("failed")
            ),
        ),
        OutcomeStatus::Succeeded if event.format_downgraded => ui.display_message(
            "🔎",
            &format!("{} {}: OCR used, wrote plain text", position, event.file_name),
        ),
        OutcomeStatus::Succeeded | OutcomeStatus::Cancelled => {
            trace!(index = event.index, outcome = ?event.outcome, "Item finished")
        }
    }
}

/// Print the summary and decide the exit status.
fn finish(ui: &Ui, summary: &BatchSummary, allowed_failure_rate: f32) -> Result<()> {
    ui.display_message(
        "📊",
        &format!(
            "{} converted ({} with OCR), {} failed, {} cancelled",
            summary.succeeded, summary.ocr_documents, summary.failed, summary.cancelled
        ),
    );
    if summary.format_downgraded > 0 {
        ui.display_message(
            "📝",
            &format!(
                "{} documents needed OCR and were written as .txt instead of .docx",
                summary.format_downgraded
            ),
        );
    }
    if let Some(reason) = &summary.aborted {
        return Err(anyhow!("batch stopped early: {}", reason));
    }
    let failure_rate = summary.failure_rate();
    if failure_rate > allowed_failure_rate {
        return Err(anyhow!(
            "{}/{} ({:.2}%) of files failed, but only {:.2}% were allowed",
            summary.failed,
            summary.total,
            failure_rate * 100.0,
            allowed_failure_rate * 100.0
        ));
    }
    if summary.cancelled > 0 {
        return Err(anyhow!("batch cancelled, {} files not converted", summary.cancelled));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_ctrl_c_exits() {
        let mut interrupts = Interrupts::default();
        assert_eq!(interrupts.press(), CtrlC::Cancel);
        assert_eq!(interrupts.press(), CtrlC::Exit);
        assert_eq!(interrupts.press(), CtrlC::Exit);
    }

    fn summary(succeeded: usize, failed: usize, cancelled: usize) -> BatchSummary {
        BatchSummary {
            total: succeeded + failed + cancelled,
            succeeded,
            failed,
            cancelled,
            ..BatchSummary::default()
        }
    }

    #[test]
    fn tuning_flags_override_config() -> Result<()> {
        let mut config = ConverterConfig::default();
        let tuning = TuningOpts {
            languages: vec!["pol".to_owned(), "eng".to_owned()],
            raw_ocr_text: true,
            otsu: true,
            psm: Some(4),
            ..TuningOpts::default()
        };
        tuning.apply_to(&mut config)?;
        assert_eq!(config.languages, vec!["pol", "eng"]);
        assert!(!config.clean_ocr_text);
        assert_eq!(config.preprocess.binarization, Binarization::Otsu);
        assert_eq!(config.page_segmentation_mode, 4);
        Ok(())
    }

    #[test]
    fn invalid_flags_are_rejected() {
        let mut config = ConverterConfig::default();
        let tuning = TuningOpts {
            render_scale: Some(0.0),
            ..TuningOpts::default()
        };
        assert!(tuning.apply_to(&mut config).is_err());
    }

    #[test]
    fn failure_rate_decides_exit_status() {
        let ui = Ui::init_for_tests();
        assert!(finish(&ui, &summary(3, 0, 0), 0.0).is_ok());
        assert!(finish(&ui, &summary(2, 1, 0), 0.0).is_err());
        assert!(finish(&ui, &summary(2, 1, 0), 0.5).is_ok());
        assert!(finish(&ui, &summary(1, 0, 2), 1.0).is_err());
    }

    #[test]
    fn aborted_batches_fail() {
        let ui = Ui::init_for_tests();
        let mut aborted = summary(1, 1, 1);
        aborted.aborted = Some("tesseract vanished".to_owned());
        let err = finish(&ui, &aborted, 1.0).unwrap_err();
        assert!(err.to_string().contains("tesseract vanished"));
    }
}
