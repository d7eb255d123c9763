//! OCR engine wrapping the `tesseract` CLI tool.

use std::io::Cursor;

use image::{GrayImage, ImageFormat};
use tokio::process::Command;

use super::{OcrEngine, OcrOptions};
use crate::{
    async_utils::{CommandError, run_command, spawn_blocking_propagating_panics},
    cpu_limit::with_cpu_semaphore,
    errors::ConversionError,
    prelude::*,
    text_cleanup::clean_ocr_text,
    toolchain::OcrCapability,
};

/// OCR engine wrapping the `tesseract` CLI tool.
#[non_exhaustive]
pub struct TesseractOcrEngine {
    /// Language specification for `-l`, such as `pol` or `pol+eng`.
    language_spec: String,
    options: OcrOptions,
}

impl TesseractOcrEngine {
    /// Create a new `tesseract` engine. Requires proof that the toolchain was
    /// detected.
    pub fn new(capability: &OcrCapability, options: OcrOptions) -> Self {
        Self {
            language_spec: capability.language_spec(),
            options,
        }
    }

    /// Build the argument list for one run.
    fn args(&self, input_path: &Path) -> Vec<String> {
        let mut args = vec![
            input_path.display().to_string(),
            "stdout".to_owned(),
            "-l".to_owned(),
            self.language_spec.clone(),
            "--psm".to_owned(),
            self.options.page_segmentation_mode.to_string(),
        ];
        if let Some(dpi) = self.options.dpi {
            args.push("--dpi".to_owned());
            args.push(dpi.to_string());
        }
        args
    }
}

/// Only a missing binary means the toolchain is gone. A non-zero exit is a
/// problem with this page, and must not stop other documents.
fn command_error(err: CommandError) -> ConversionError {
    match err {
        CommandError::NotInstalled(_) => {
            ConversionError::ocr_unavailable("tesseract disappeared from PATH")
        }
        CommandError::Failed(err) => ConversionError::ocr_failed(format!("{:#}", err)),
    }
}

#[async_trait]
impl OcrEngine for TesseractOcrEngine {
    #[instrument(level = "debug", skip_all, fields(width = image.width(), height = image.height()))]
    async fn recognize(&self, image: &GrayImage) -> Result<String, ConversionError> {
        // Tesseract wants a file, so encode the page as PNG first.
        let owned = image.clone();
        let png = spawn_blocking_propagating_panics(move || -> Result<Vec<u8>, image::ImageError> {
            let mut png = Cursor::new(Vec::new());
            owned.write_to(&mut png, ImageFormat::Png)?;
            Ok(png.into_inner())
        })
        .await
        .map_err(|err| ConversionError::ocr_failed(format!("cannot encode page: {}", err)))?;

        let tmpdir = tempfile::TempDir::with_prefix("tesseract").map_err(|err| {
            ConversionError::ocr_failed(format!("cannot create temporary directory: {}", err))
        })?;
        let input_path = tmpdir.path().join("page.png");
        tokio::fs::write(&input_path, &png).await.map_err(|err| {
            ConversionError::ocr_failed(format!("cannot write tesseract input file: {}", err))
        })?;

        let mut cmd = Command::new("tesseract");
        cmd.args(self.args(&input_path));
        let output = with_cpu_semaphore(move || async move {
            run_command("tesseract", &mut cmd, None).await
        })
        .await
        .map_err(|err| ConversionError::ocr_failed(format!("{:#}", err)))?
        .map_err(command_error)?;

        if let Err(err) = tmpdir.close() {
            warn!("failed to delete temporary directory: {}", err);
        }

        let text = String::from_utf8_lossy(&output.stdout);
        if self.options.clean_text {
            Ok(clean_ocr_text(&text))
        } else {
            Ok(text.into_owned())
        }
    }
}
