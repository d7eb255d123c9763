//! Pulling existing text layers out of PDF pages.

use std::collections::BTreeMap;

use tokio::process::Command;

use super::SourceDocument;
use crate::{
    async_utils::{CommandError, run_command},
    cpu_limit::with_cpu_semaphore,
    errors::ConversionError,
    prelude::*,
};

/// The MIME type every input must have.
const PDF_MIME_TYPE: &str = "application/pdf";

/// Interface for opening PDFs and reading their embedded text.
#[async_trait]
pub trait PageTextExtractor: Send + Sync + 'static {
    /// Open a PDF and count its pages.
    ///
    /// Fails with [`ConversionError::DocumentOpen`] if the file cannot be
    /// parsed as a PDF at all, including encrypted files.
    async fn open(&self, path: &Path) -> Result<SourceDocument, ConversionError>;

    /// Return the raw embedded text of one page. A page with no text layer
    /// returns an empty string, which is not an error.
    async fn extract_page(
        &self,
        doc: &SourceDocument,
        page_idx: usize,
    ) -> Result<String, ConversionError>;
}

/// Text extractor that shells out to Poppler's `pdfinfo` and `pdftotext`.
#[derive(Clone, Debug, Default)]
#[non_exhaustive]
pub struct PopplerTextExtractor {}

impl PopplerTextExtractor {
    /// Create a new Poppler-based extractor.
    pub fn new() -> Self {
        Self {}
    }
}

#[async_trait]
impl PageTextExtractor for PopplerTextExtractor {
    #[instrument(level = "debug", skip_all, fields(path = %path.display()))]
    async fn open(&self, path: &Path) -> Result<SourceDocument, ConversionError> {
        let mime_type = get_mime_type(path)
            .map_err(|err| ConversionError::document_open(path, format!("{:#}", err)))?;
        if mime_type != PDF_MIME_TYPE {
            return Err(ConversionError::document_open(
                path,
                format!("expected a PDF, found {}", mime_type),
            ));
        }
        let page_count = get_pdf_page_count(path).await?;
        debug!(page_count, "Opened PDF");
        Ok(SourceDocument::new(path.to_owned(), page_count))
    }

    #[instrument(level = "debug", skip_all, fields(path = %doc.path().display(), page = page_idx))]
    async fn extract_page(
        &self,
        doc: &SourceDocument,
        page_idx: usize,
    ) -> Result<String, ConversionError> {
        let path = doc.path();
        // Poppler uses 1-based, inclusive page ranges.
        let page_number = (page_idx + 1).to_string();
        let mut cmd = Command::new("pdftotext");
        cmd.args(["-f", &page_number, "-l", &page_number, "-enc", "UTF-8"])
            .arg(path)
            .arg("-");
        // Only the exit status counts. Poppler prints "Syntax Error" lines
        // for many files it reads without trouble.
        let output = with_cpu_semaphore(move || async move {
            run_command("pdftotext", &mut cmd, None).await
        })
        .await
        .map_err(|err| ConversionError::document_open(path, format!("{:#}", err)))?
        .map_err(|err| match err {
            CommandError::NotInstalled(tool) => ConversionError::ocr_unavailable(
                format!("{} disappeared from PATH", tool),
            ),
            CommandError::Failed(err) => ConversionError::document_open(
                path,
                format!("cannot read text layer of page {}: {:#}", page_idx + 1, err),
            ),
        })?;
        let text = String::from_utf8_lossy(&output.stdout);
        Ok(strip_page_break(&text).to_owned())
    }
}

/// `pdftotext` ends every page with a form feed. Drop it, but leave any other
/// whitespace alone.
fn strip_page_break(text: &str) -> &str {
    text.strip_suffix('\x0C').unwrap_or(text)
}

/// Get the number of pages in a PDF file.
///
/// `pdfinfo` is also our "can this be parsed at all" check: it fails on
/// corrupt headers and on encrypted files we cannot open without a password.
#[instrument(level = "debug", skip_all, fields(path = %path.display()))]
pub async fn get_pdf_page_count(path: &Path) -> Result<usize, ConversionError> {
    let mut cmd = Command::new("pdfinfo");
    cmd.arg(path);
    let output = run_command("pdfinfo", &mut cmd, None)
        .await
        .map_err(|err| match err {
            CommandError::NotInstalled(tool) => {
                ConversionError::ocr_unavailable(format!("{} disappeared from PATH", tool))
            }
            CommandError::Failed(err) => ConversionError::document_open(path, format!("{:#}", err)),
        })?;

    let output = String::from_utf8_lossy(&output.stdout);
    parse_page_count(&output).map_err(|err| ConversionError::document_open(path, err))
}

/// Parse the `Pages:` property out of `pdfinfo` output.
fn parse_page_count(pdfinfo_output: &str) -> Result<usize, String> {
    let mut properties = BTreeMap::new();
    for line in pdfinfo_output.lines() {
        let mut parts = line.splitn(2, ':');
        let key = parts.next().unwrap_or("").trim();
        let value = parts.next().unwrap_or("").trim();
        properties.insert(key.to_string(), value.to_string());
    }

    if properties.get("Encrypted").is_some_and(|v| v.starts_with("yes")) {
        return Err("password-protected PDFs are not supported".to_owned());
    }

    let page_count_str = properties
        .get("Pages")
        .ok_or_else(|| "failed to find page count in pdfinfo output".to_owned())?;
    page_count_str
        .parse::<usize>()
        .map_err(|err| format!("failed to parse page count {:?}: {}", page_count_str, err))
}

/// Get the MIME type of a file from its magic bytes.
pub fn get_mime_type(path: &Path) -> Result<String> {
    Ok(infer::get_from_path(path)
        .with_context(|| format!("failed to read {:?}", path.display()))?
        .ok_or_else(|| anyhow!("unknown file type for {:?}", path.display()))?
        .mime_type()
        .to_string())
}
