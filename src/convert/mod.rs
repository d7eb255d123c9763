//! Converting one PDF into a DOCX or text file.
//!
//! For each page we use the existing text layer when there is one, and
//! otherwise rasterize, preprocess and OCR the page. OCR output is only ever
//! written as plain text. If DOCX was requested for a document that needed
//! OCR, we write `.txt` instead and say so in the result.

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use schemars::JsonSchema;

use crate::{
    async_utils::spawn_blocking_propagating_panics,
    batch::CancellationFlag,
    errors::{ConversionError, ErrorKind},
    ocr::OcrEngine,
    pdf::{PageText, PageTextExtractor, TextLayerPolicy},
    prelude::*,
    preprocess::ImagePreprocessor,
};

pub mod item;
pub mod output;

pub use self::{
    item::{ConversionJobItem, ItemState},
    output::{
        BLANK_LINE_SEPARATOR, CollisionPolicy, OutputFormat, PAGE_BREAK_SEPARATOR,
        assemble_text, render_docx, write_output_file,
    },
};

/// Where and how to write a converted document.
#[derive(Clone, Debug)]
pub struct ConversionTarget {
    pub output_dir: PathBuf,
    pub format: OutputFormat,
    pub collision: CollisionPolicy,
}

/// How a single conversion ended.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Outcome {
    /// An output file was written. `format_downgraded` is set when DOCX was
    /// requested but text was written because OCR was needed.
    Succeeded { format_downgraded: bool },
    /// Nothing was written.
    Failed { kind: ErrorKind, reason: String },
    /// Cancellation was observed before anything was written.
    Cancelled,
}

impl Outcome {
    pub fn status(&self) -> OutcomeStatus {
        match self {
            Outcome::Succeeded { .. } => OutcomeStatus::Succeeded,
            Outcome::Failed { .. } => OutcomeStatus::Failed,
            Outcome::Cancelled => OutcomeStatus::Cancelled,
        }
    }

    pub fn error_kind(&self) -> Option<ErrorKind> {
        match self {
            Outcome::Failed { kind, .. } => Some(*kind),
            _ => None,
        }
    }

    pub fn reason(&self) -> Option<&str> {
        match self {
            Outcome::Failed { reason, .. } => Some(reason),
            _ => None,
        }
    }
}

/// Outcome without its payload, for reports and audit logs.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeStatus {
    Succeeded,
    Failed,
    Cancelled,
}

/// The result of converting one file.
#[derive(Clone, Debug)]
pub struct ConversionResult {
    pub source: PathBuf,
    pub output_path: Option<PathBuf>,
    pub requested_format: OutputFormat,
    /// The format actually written, if anything was.
    pub written_format: Option<OutputFormat>,
    /// Pages processed.
    pub page_count: usize,
    /// Pages that went through OCR.
    pub ocr_pages: usize,
    pub scan_like: bool,
    pub elapsed: Duration,
    pub outcome: Outcome,
}

impl ConversionResult {
    /// A result for an item that was never started.
    pub fn cancelled_before_start(source: &Path, requested_format: OutputFormat) -> Self {
        Self {
            source: source.to_owned(),
            output_path: None,
            requested_format,
            written_format: None,
            page_count: 0,
            ocr_pages: 0,
            scan_like: false,
            elapsed: Duration::ZERO,
            outcome: Outcome::Cancelled,
        }
    }

    pub fn ocr_used(&self) -> bool {
        self.ocr_pages > 0
    }

    pub fn succeeded(&self) -> bool {
        matches!(self.outcome, Outcome::Succeeded { .. })
    }

    /// The file name of the source, for display.
    pub fn file_name(&self) -> String {
        self.source
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.source.display().to_string())
    }
}

/// Converter settings that do not change between files.
#[derive(Clone, Debug)]
pub struct ConverterOptions {
    pub text_layer: TextLayerPolicy,
    /// Inserted between pages in text output.
    pub page_separator: String,
}

impl Default for ConverterOptions {
    fn default() -> Self {
        Self {
            text_layer: TextLayerPolicy::default(),
            page_separator: PAGE_BREAK_SEPARATOR.to_owned(),
        }
    }
}

/// Why a conversion stopped early.
enum Interrupt {
    Cancelled,
    Error(ConversionError),
}

impl From<ConversionError> for Interrupt {
    fn from(err: ConversionError) -> Self {
        Interrupt::Error(err)
    }
}

/// What we learned while converting, filled in as we go so that failures
/// still report page counts.
#[derive(Default)]
struct Progress {
    page_count: usize,
    ocr_pages: usize,
    scan_like: bool,
    output_path: Option<PathBuf>,
    written_format: Option<OutputFormat>,
    format_downgraded: bool,
}

/// Per-file orchestrator.
#[derive(Clone)]
pub struct DocumentConverter {
    extractor: Arc<dyn PageTextExtractor>,
    preprocessor: ImagePreprocessor,
    ocr: Arc<dyn OcrEngine>,
    options: ConverterOptions,
}

impl DocumentConverter {
    pub fn new(
        extractor: Arc<dyn PageTextExtractor>,
        preprocessor: ImagePreprocessor,
        ocr: Arc<dyn OcrEngine>,
        options: ConverterOptions,
    ) -> Self {
        Self {
            extractor,
            preprocessor,
            ocr,
            options,
        }
    }

    /// Convert one file. Errors never escape: they become a
    /// [`Outcome::Failed`] result, and `item` ends in a terminal state.
    #[instrument(level = "debug", skip_all, fields(index = item.index(), path = %item.source().display()))]
    pub async fn convert(
        &self,
        item: &mut ConversionJobItem,
        target: &ConversionTarget,
        cancel: &CancellationFlag,
    ) -> ConversionResult {
        let started = Instant::now();
        let mut progress = Progress::default();
        let outcome = match self.run(item, target, cancel, &mut progress).await {
            Ok(()) => Outcome::Succeeded {
                format_downgraded: progress.format_downgraded,
            },
            Err(Interrupt::Cancelled) => {
                settle(item, ItemState::Cancelled);
                debug!("Conversion cancelled");
                Outcome::Cancelled
            }
            Err(Interrupt::Error(err)) => {
                settle(item, ItemState::Failed);
                warn!(error = %err, "Conversion failed");
                Outcome::Failed {
                    kind: err.kind(),
                    reason: err.to_string(),
                }
            }
        };
        ConversionResult {
            source: item.source().to_owned(),
            output_path: progress.output_path,
            requested_format: target.format,
            written_format: progress.written_format,
            page_count: progress.page_count,
            ocr_pages: progress.ocr_pages,
            scan_like: progress.scan_like,
            elapsed: started.elapsed(),
            outcome,
        }
    }

    async fn run(
        &self,
        item: &mut ConversionJobItem,
        target: &ConversionTarget,
        cancel: &CancellationFlag,
        progress: &mut Progress,
    ) -> Result<(), Interrupt> {
        enter(item, ItemState::Extracting, cancel)?;
        let path = item.source().to_owned();
        let stem = path
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .ok_or_else(|| ConversionError::document_open(&path, "path has no file name"))?;

        let mut doc = self.extractor.open(&path).await?;
        progress.page_count = doc.page_count();
        let policy = &self.options.text_layer;
        for page_idx in 0..doc.page_count() {
            doc.page_text(self.extractor.as_ref(), policy, page_idx).await?;
        }
        progress.scan_like = doc.is_scan_like(policy);
        let textless = doc.textless_page_count();
        debug!(
            pages = doc.page_count(),
            textless,
            scan_like = progress.scan_like,
            "Classified pages"
        );

        let mut pages = Vec::with_capacity(doc.page_count());
        if textless == 0 {
            enter(item, ItemState::TextFound, cancel)?;
            for page_idx in 0..doc.page_count() {
                if let PageText::HasText(text) =
                    doc.page_text(self.extractor.as_ref(), policy, page_idx).await?
                {
                    pages.push(text.clone());
                }
            }
        } else {
            enter(item, ItemState::NeedsOcr, cancel)?;
            for page_idx in 0..doc.page_count() {
                let layer = match doc.page_text(self.extractor.as_ref(), policy, page_idx).await? {
                    PageText::HasText(text) => Some(text.clone()),
                    PageText::NeedsOcr => None,
                };
                if let Some(text) = layer {
                    pages.push(text);
                    continue;
                }

                enter(item, ItemState::Preprocessing, cancel)?;
                let bitmap = self.preprocessor.prepare_page(&doc, page_idx).await?;
                enter(item, ItemState::Recognizing, cancel)?;
                let text = self.ocr.recognize(&bitmap).await?;
                trace!(page = page_idx, chars = text.len(), "Recognized page");
                progress.ocr_pages += 1;
                pages.push(text);
            }
        }
        // We are done with the PDF itself.
        drop(doc);

        enter(item, ItemState::Writing, cancel)?;
        let (format, format_downgraded) = match target.format {
            OutputFormat::Docx if progress.ocr_pages > 0 => (OutputFormat::Txt, true),
            format => (format, false),
        };
        if format_downgraded {
            info!(ocr_pages = progress.ocr_pages, "OCR was needed, writing text instead of DOCX");
        }

        let output_dir = target.output_dir.clone();
        let collision = target.collision;
        let separator = self.options.page_separator.clone();
        let output_path = spawn_blocking_propagating_panics(move || {
            let bytes = match format {
                OutputFormat::Txt => assemble_text(&pages, &separator).into_bytes(),
                OutputFormat::Docx => render_docx(&pages).map_err(|err| {
                    ConversionError::output_write(&output_dir.join(&stem), format!("{:#}", err))
                })?,
            };
            write_output_file(&output_dir, &stem, format, &bytes, collision)
        })
        .await?;

        progress.output_path = Some(output_path);
        progress.written_format = Some(format);
        progress.format_downgraded = format_downgraded;
        enter(item, ItemState::Done, cancel)?;
        Ok(())
    }
}

/// Move `item` to `next`, refusing guarded states once cancellation has been
/// requested.
fn enter(
    item: &mut ConversionJobItem,
    next: ItemState,
    cancel: &CancellationFlag,
) -> Result<(), Interrupt> {
    if next.is_guarded_by_cancellation() && cancel.is_cancelled() {
        return Err(Interrupt::Cancelled);
    }
    item.advance(next)
        .expect("converter should only take legal steps");
    Ok(())
}

/// Put `item` into a terminal state, unless it already is in one.
fn settle(item: &mut ConversionJobItem, terminal: ItemState) {
    if !item.state().is_terminal() {
        item.advance(terminal)
            .expect("non-terminal items can always fail or be cancelled");
    }
}
