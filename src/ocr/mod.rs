//! Text recognition on preprocessed page bitmaps.

use image::GrayImage;

use crate::{errors::ConversionError, prelude::*};

pub mod tesseract;

pub use self::tesseract::TesseractOcrEngine;

/// Default page segmentation mode: assume a single uniform block of text.
pub const DEFAULT_PAGE_SEGMENTATION_MODE: u8 = 6;

/// Per-session OCR settings.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OcrOptions {
    /// Tesseract page segmentation mode (`--psm`).
    pub page_segmentation_mode: u8,

    /// Resolution of the bitmaps we pass in, so Tesseract does not have to
    /// guess.
    pub dpi: Option<u32>,

    /// Normalize whitespace in the recognized text.
    pub clean_text: bool,
}

impl Default for OcrOptions {
    fn default() -> Self {
        Self {
            page_segmentation_mode: DEFAULT_PAGE_SEGMENTATION_MODE,
            dpi: None,
            clean_text: true,
        }
    }
}

/// Interface to an OCR engine.
///
/// An empty result is a success. There are no retries at this level.
#[async_trait]
pub trait OcrEngine: Send + Sync + 'static {
    /// Recognize the text on a single page.
    async fn recognize(&self, image: &GrayImage) -> Result<String, ConversionError>;
}

#[cfg(test)]
pub(crate) mod testing {
    //! OCR fakes.

    use std::sync::{
        Mutex,
        atomic::{AtomicUsize, Ordering},
    };

    use super::*;
    use crate::batch::CancellationFlag;

    /// An engine that counts calls and returns canned text, one entry per
    /// call, and can trip a cancellation flag after a given number of calls.
    #[derive(Default)]
    pub struct SpyOcrEngine {
        pub calls: AtomicUsize,
        pub texts: Vec<String>,
        pub widths: Mutex<Vec<u32>>,
        pub cancel_after: Option<(usize, CancellationFlag)>,
        pub unavailable: bool,
        /// Zero-based call that fails as if Tesseract rejected the page.
        pub fail_on_call: Option<usize>,
    }

    impl SpyOcrEngine {
        pub fn with_texts(texts: &[&str]) -> Self {
            Self {
                texts: texts.iter().map(|t| (*t).to_owned()).collect(),
                ..Self::default()
            }
        }

        pub fn call_count(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl OcrEngine for SpyOcrEngine {
        async fn recognize(&self, image: &GrayImage) -> Result<String, ConversionError> {
            if self.unavailable {
                return Err(ConversionError::ocr_unavailable("tesseract vanished"));
            }
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            self.widths.lock().unwrap().push(image.width());
            if self.fail_on_call == Some(call) {
                return Err(ConversionError::ocr_failed("Image too large"));
            }
            if let Some((after, flag)) = &self.cancel_after {
                if call + 1 >= *after {
                    flag.cancel();
                }
            }
            Ok(self
                .texts
                .get(call)
                .cloned()
                .unwrap_or_else(|| format!("recognized page {}", call + 1)))
        }
    }
}
