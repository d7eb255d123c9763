//! Error taxonomy for the conversion pipeline.
//!
//! Most of the program uses [`anyhow`], but the converter needs to tell its
//! callers _what kind_ of thing went wrong, because a missing OCR toolchain
//! stops the whole batch while a corrupt PDF only fails one item.

use schemars::JsonSchema;
use thiserror::Error;

use crate::prelude::*;

/// Errors produced while converting a single document.
#[derive(Debug, Error)]
pub enum ConversionError {
    /// The file could not be opened or parsed as a PDF.
    #[error("cannot open {path:?}: {message}")]
    DocumentOpen { path: PathBuf, message: String },

    /// A single page could not be rasterized.
    #[error("cannot render page {page} of {path:?}: {message}")]
    PageRender {
        path: PathBuf,
        page: usize,
        message: String,
    },

    /// The external PDF/OCR toolchain is missing or not initialized.
    #[error("OCR toolchain unavailable: {message}")]
    OcrUnavailable { message: String },

    /// Tesseract ran but could not recognize a page.
    #[error("OCR failed: {message}")]
    OcrFailed { message: String },

    /// The output file could not be created.
    #[error("cannot write {path:?}: {message}")]
    OutputWrite { path: PathBuf, message: String },
}

impl ConversionError {
    /// Build a [`ConversionError::DocumentOpen`] from anything printable.
    pub fn document_open(path: &Path, message: impl ToString) -> Self {
        Self::DocumentOpen {
            path: path.to_owned(),
            message: message.to_string(),
        }
    }

    /// Build a [`ConversionError::PageRender`] from anything printable.
    pub fn page_render(path: &Path, page: usize, message: impl ToString) -> Self {
        Self::PageRender {
            path: path.to_owned(),
            page,
            message: message.to_string(),
        }
    }

    /// Build a [`ConversionError::OcrUnavailable`] from anything printable.
    pub fn ocr_unavailable(message: impl ToString) -> Self {
        Self::OcrUnavailable {
            message: message.to_string(),
        }
    }

    /// Build a [`ConversionError::OcrFailed`] from anything printable.
    pub fn ocr_failed(message: impl ToString) -> Self {
        Self::OcrFailed {
            message: message.to_string(),
        }
    }

    /// Build a [`ConversionError::OutputWrite`] from anything printable.
    pub fn output_write(path: &Path, message: impl ToString) -> Self {
        Self::OutputWrite {
            path: path.to_owned(),
            message: message.to_string(),
        }
    }

    /// What kind of error is this?
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::DocumentOpen { .. } => ErrorKind::DocumentOpen,
            Self::PageRender { .. } => ErrorKind::PageRender,
            Self::OcrUnavailable { .. } => ErrorKind::OcrUnavailable,
            Self::OcrFailed { .. } => ErrorKind::OcrFailed,
            Self::OutputWrite { .. } => ErrorKind::OutputWrite,
        }
    }

}

/// Serializable error kind, for audit records and progress events.
#[derive(
    Clone, Copy, Debug, Deserialize, Eq, Hash, JsonSchema, PartialEq, Serialize,
)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    DocumentOpen,
    PageRender,
    OcrUnavailable,
    OcrFailed,
    OutputWrite,
}

impl ErrorKind {
    /// Only a missing toolchain stops a batch. Everything else fails one item.
    pub fn is_fatal_for_batch(self) -> bool {
        matches!(self, ErrorKind::OcrUnavailable)
    }
}
