//! Rendering PDF pages to bitmaps.

use image::{DynamicImage, ImageFormat};
use tokio::process::Command;

use super::{SourceDocument, is_error_line};
use crate::{
    async_utils::{CommandError, run_command},
    cpu_limit::with_cpu_semaphore,
    errors::ConversionError,
    prelude::*,
};

/// Interface for rasterizing a single PDF page.
#[async_trait]
pub trait PageRasterizer: Send + Sync + 'static {
    /// Render `page_idx` (0-based) of `doc` at `dpi`.
    async fn rasterize(
        &self,
        doc: &SourceDocument,
        page_idx: usize,
        dpi: u32,
    ) -> Result<DynamicImage, ConversionError>;
}

/// Rasterizer wrapping Poppler's `pdftocairo`.
#[derive(Clone, Debug, Default)]
#[non_exhaustive]
pub struct PdfToCairoRasterizer {}

impl PdfToCairoRasterizer {
    /// Create a new `pdftocairo` rasterizer.
    pub fn new() -> Self {
        Self {}
    }
}

#[async_trait]
impl PageRasterizer for PdfToCairoRasterizer {
    #[instrument(level = "debug", skip_all, fields(path = %doc.path().display(), page = page_idx, dpi))]
    async fn rasterize(
        &self,
        doc: &SourceDocument,
        page_idx: usize,
        dpi: u32,
    ) -> Result<DynamicImage, ConversionError> {
        let path = doc.path();
        let render_error = |message: String| ConversionError::page_render(path, page_idx, message);

        // `-singlefile` stops pdftocairo from adding page digits to the name.
        let tmpdir = tempfile::TempDir::with_prefix("render")
            .map_err(|err| render_error(format!("cannot create temporary directory: {}", err)))?;
        let out_prefix = tmpdir.path().join("page");
        let page_number = (page_idx + 1).to_string();
        let mut cmd = Command::new("pdftocairo");
        cmd.arg("-png")
            .arg("-r")
            .arg(dpi.to_string())
            .args(["-f", &page_number, "-l", &page_number])
            .arg("-singlefile")
            .arg(path)
            .arg(&out_prefix);

        // We use `with_cpu_semaphore` because `pdftocairo` will use _at least_
        // 100% of a CPU.
        with_cpu_semaphore(move || async move {
            run_command("pdftocairo", &mut cmd, Some(is_error_line)).await
        })
        .await
        .map_err(|err| render_error(format!("{:#}", err)))?
        .map_err(|err| match err {
            CommandError::NotInstalled(tool) => {
                ConversionError::ocr_unavailable(format!("{} disappeared from PATH", tool))
            }
            CommandError::Failed(err) => render_error(format!("{:#}", err)),
        })?;

        let png_path = out_prefix.with_extension("png");
        let bytes = tokio::fs::read(&png_path)
            .await
            .map_err(|err| render_error(format!("cannot read {:?}: {}", png_path.display(), err)))?;
        let image = image::load_from_memory_with_format(&bytes, ImageFormat::Png)
            .map_err(|err| render_error(format!("cannot decode rendered page: {}", err)))?;

        if let Err(err) = tmpdir.close() {
            warn!("failed to delete temporary directory: {}", err);
        }
        Ok(image)
    }
}
