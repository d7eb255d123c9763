//! PDF documents and their per-page text layers.
//!
//! A [`SourceDocument`] is opened by a [`PageTextExtractor`], and each page is
//! classified exactly once as either [`PageText::HasText`] or
//! [`PageText::NeedsOcr`]. The verdict is cached on the document for the rest
//! of the job, so the converter can never change its mind halfway through.

use std::sync::LazyLock;

use regex::Regex;

use crate::{errors::ConversionError, prelude::*};

pub mod extract;
pub mod rasterize;

pub use self::{
    extract::{PageTextExtractor, PopplerTextExtractor},
    rasterize::{PageRasterizer, PdfToCairoRasterizer},
};

/// Pages with fewer non-whitespace characters than this are treated as
/// having no text layer.
pub const DEFAULT_MIN_TEXT_CHARS: usize = 10;

/// Pages where less than this fraction of the characters are non-whitespace
/// are treated as having no usable text layer. Scanned pages with a bad
/// invisible OCR layer often look like this.
pub const DEFAULT_MIN_TEXT_DENSITY: f32 = 0.1;

/// A document is "scan-like" when more than this fraction of its pages have
/// no usable text layer.
pub const DEFAULT_SCAN_LIKE_FRACTION: f32 = 0.5;

/// A default error regex for checking Poppler output.
static ERROR_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)error").expect("failed to compile regex"));

static DOWNGRADE_TO_WARNING_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)error: xref num").expect("failed to compile regex")
});

/// Does this line of Poppler output contain an error?
///
/// Poppler complains about broken cross-reference tables on a lot of PDFs it
/// can read perfectly well, so those are not counted.
pub(crate) fn is_error_line(line: &str) -> bool {
    ERROR_REGEX.is_match(line) && !DOWNGRADE_TO_WARNING_REGEX.is_match(line)
}

/// Policy for deciding whether a page's text layer is usable.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TextLayerPolicy {
    /// Minimum number of non-whitespace characters.
    pub min_chars: usize,
    /// Minimum fraction of non-whitespace characters.
    pub min_density: f32,
    /// Fraction of textless pages above which the document is scan-like.
    pub scan_like_fraction: f32,
}

impl Default for TextLayerPolicy {
    fn default() -> Self {
        Self {
            min_chars: DEFAULT_MIN_TEXT_CHARS,
            min_density: DEFAULT_MIN_TEXT_DENSITY,
            scan_like_fraction: DEFAULT_SCAN_LIKE_FRACTION,
        }
    }
}

impl TextLayerPolicy {
    /// Classify the raw text layer of one page.
    pub fn classify(&self, raw: String) -> PageText {
        let total = raw.chars().count();
        let visible = raw.chars().filter(|c| !c.is_whitespace()).count();
        if visible < self.min_chars {
            return PageText::NeedsOcr;
        }
        if total > 0 && (visible as f32 / total as f32) < self.min_density {
            return PageText::NeedsOcr;
        }
        PageText::HasText(raw)
    }
}

/// What we know about one page's text layer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PageText {
    /// The page has a usable text layer, which we keep verbatim.
    HasText(String),
    /// The page has no usable text layer and must be OCRed.
    NeedsOcr,
}

impl PageText {
    /// Does this page need OCR?
    pub fn needs_ocr(&self) -> bool {
        matches!(self, PageText::NeedsOcr)
    }
}

/// An open PDF document.
///
/// Owned by the job item that opened it, and dropped once that item's output
/// has been written or the item has failed.
#[derive(Debug)]
pub struct SourceDocument {
    /// Absolute path to the PDF.
    path: PathBuf,

    /// Cached text-layer verdicts, one per page, filled in lazily.
    pages: Vec<Option<PageText>>,
}

impl SourceDocument {
    /// Create a document with `page_count` pages, none of which have been
    /// examined yet.
    pub fn new(path: PathBuf, page_count: usize) -> Self {
        Self {
            path,
            pages: vec![None; page_count],
        }
    }

    /// The path to the PDF.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The number of pages.
    pub fn page_count(&self) -> usize {
        self.pages.len()
    }

    /// Get the text-layer verdict for `page_idx`, asking `extractor` for the
    /// raw text the first time.
    #[instrument(level = "debug", skip_all, fields(path = %self.path.display(), page = page_idx))]
    pub async fn page_text(
        &mut self,
        extractor: &dyn PageTextExtractor,
        policy: &TextLayerPolicy,
        page_idx: usize,
    ) -> Result<&PageText, ConversionError> {
        if page_idx >= self.pages.len() {
            return Err(ConversionError::document_open(
                &self.path,
                format!("page {} out of range ({} pages)", page_idx, self.pages.len()),
            ));
        }
        let verdict = match self.pages[page_idx].take() {
            Some(verdict) => verdict,
            None => {
                let raw = extractor.extract_page(self, page_idx).await?;
                let verdict = policy.classify(raw);
                trace!(needs_ocr = verdict.needs_ocr(), "Classified page");
                verdict
            }
        };
        Ok(self.pages[page_idx].insert(verdict))
    }

    /// Has this page been classified as having a text layer? Returns `None`
    /// if the page has not been examined yet.
    #[cfg(test)]
    pub fn has_text_layer(&self, page_idx: usize) -> Option<bool> {
        self.pages
            .get(page_idx)
            .and_then(|p| p.as_ref())
            .map(|p| !p.needs_ocr())
    }

    /// Number of classified pages with no usable text layer.
    pub fn textless_page_count(&self) -> usize {
        self.pages
            .iter()
            .filter(|p| matches!(p, Some(PageText::NeedsOcr)))
            .count()
    }

    /// Is this document mostly scanned pages? Only meaningful once every page
    /// has been classified.
    pub fn is_scan_like(&self, policy: &TextLayerPolicy) -> bool {
        if self.pages.is_empty() {
            return false;
        }
        let fraction = self.textless_page_count() as f32 / self.pages.len() as f32;
        fraction > policy.scan_like_fraction
    }
}
