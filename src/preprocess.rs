//! Turning PDF pages into clean black-and-white bitmaps for OCR.
//!
//! Every step after rasterization is a pure function of the input pixels, so
//! the same page always produces the same bitmap.

use std::sync::Arc;

use image::{
    DynamicImage, GrayImage,
    imageops::{self, FilterType},
};
use imageproc::{
    contrast::{ThresholdType, otsu_level, stretch_contrast, threshold},
    stats::cumulative_histogram,
};

use crate::{
    async_utils::spawn_blocking_propagating_panics,
    errors::ConversionError,
    pdf::{PageRasterizer, SourceDocument},
    prelude::*,
};

/// PDF user space units per inch.
pub const NOMINAL_DPI: u32 = 72;

/// Pages are rendered at this multiple of [`NOMINAL_DPI`].
pub const DEFAULT_RENDER_SCALE: f32 = 3.0;

/// Rendered pages are upscaled by this factor before any other processing.
pub const DEFAULT_UPSCALE_FACTOR: f32 = 2.0;

/// Fraction of the darkest and lightest pixels ignored by auto-contrast.
pub const DEFAULT_CONTRAST_CUTOFF: f32 = 0.01;

/// Pixels darker than this become black.
pub const DEFAULT_BINARY_THRESHOLD: u8 = 180;

/// Standard 3x3 sharpening kernel. `filter3x3` divides by its sum, 16.
const SHARPEN_KERNEL: [f32; 9] = [-2.0, -2.0, -2.0, -2.0, 32.0, -2.0, -2.0, -2.0, -2.0];

/// How to choose the black/white cut-off.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Binarization {
    /// A fixed threshold.
    Fixed(u8),
    /// Otsu's method, computed per page.
    Otsu,
}

impl Default for Binarization {
    fn default() -> Self {
        Binarization::Fixed(DEFAULT_BINARY_THRESHOLD)
    }
}

/// Tuning knobs for the preprocessing pipeline.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PreprocessOptions {
    pub render_scale: f32,
    pub upscale_factor: f32,
    pub contrast_cutoff: f32,
    pub sharpen: bool,
    pub binarization: Binarization,
}

impl Default for PreprocessOptions {
    fn default() -> Self {
        Self {
            render_scale: DEFAULT_RENDER_SCALE,
            upscale_factor: DEFAULT_UPSCALE_FACTOR,
            contrast_cutoff: DEFAULT_CONTRAST_CUTOFF,
            sharpen: true,
            binarization: Binarization::default(),
        }
    }
}

impl PreprocessOptions {
    /// The resolution we ask the rasterizer for.
    pub fn render_dpi(&self) -> u32 {
        ((NOMINAL_DPI as f32) * self.render_scale).round().max(1.0) as u32
    }

    /// Run the pixel pipeline: grayscale, upscale, auto-contrast, sharpen,
    /// binarize.
    pub fn apply(&self, image: DynamicImage) -> GrayImage {
        let gray = image.into_luma8();
        let gray = upscale(gray, self.upscale_factor);
        let gray = auto_contrast(gray, self.contrast_cutoff);
        let gray = if self.sharpen { sharpen(&gray) } else { gray };
        binarize(&gray, self.binarization)
    }
}

/// Rasterizes pages and prepares them for OCR.
#[derive(Clone)]
pub struct ImagePreprocessor {
    rasterizer: Arc<dyn PageRasterizer>,
    options: PreprocessOptions,
}

impl ImagePreprocessor {
    pub fn new(rasterizer: Arc<dyn PageRasterizer>, options: PreprocessOptions) -> Self {
        Self {
            rasterizer,
            options,
        }
    }

    /// Render one page and return a single-channel, binarized bitmap.
    #[instrument(level = "debug", skip_all, fields(path = %doc.path().display(), page = page_idx))]
    pub async fn prepare_page(
        &self,
        doc: &SourceDocument,
        page_idx: usize,
    ) -> Result<GrayImage, ConversionError> {
        let rendered = self
            .rasterizer
            .rasterize(doc, page_idx, self.options.render_dpi())
            .await?;
        let options = self.options;
        let prepared =
            spawn_blocking_propagating_panics(move || options.apply(rendered)).await;
        trace!(
            width = prepared.width(),
            height = prepared.height(),
            "Preprocessed page"
        );
        Ok(prepared)
    }
}

fn upscale(image: GrayImage, factor: f32) -> GrayImage {
    if factor <= 1.0 {
        return image;
    }
    let width = ((image.width() as f32) * factor).round() as u32;
    let height = ((image.height() as f32) * factor).round() as u32;
    imageops::resize(&image, width, height, FilterType::Lanczos3)
}

/// Stretch the histogram so that the darkest `cutoff` of pixels become black
/// and the lightest `cutoff` become white.
fn auto_contrast(image: GrayImage, cutoff: f32) -> GrayImage {
    let cumulative = cumulative_histogram(&image).channels[0];
    let total = u64::from(cumulative[255]);
    if total == 0 {
        return image;
    }
    let clip = ((total as f64) * f64::from(cutoff.clamp(0.0, 0.49))) as u64;

    let low = cumulative
        .iter()
        .position(|&count| u64::from(count) > clip)
        .unwrap_or(0);
    let high = (0..256)
        .rev()
        .find(|&value| {
            let below = if value == 0 { 0 } else { u64::from(cumulative[value - 1]) };
            total - below > clip
        })
        .unwrap_or(255);
    if high <= low {
        return image;
    }
    stretch_contrast(&image, low as u8, high as u8, 0, 255)
}

/// Apply [`SHARPEN_KERNEL`]. `filter3x3` skips the outermost pixels, so we
/// pad by one repeated edge pixel first and crop afterwards.
fn sharpen(image: &GrayImage) -> GrayImage {
    let (width, height) = image.dimensions();
    if width == 0 || height == 0 {
        return image.clone();
    }
    let padded = GrayImage::from_fn(width + 2, height + 2, |x, y| {
        *image.get_pixel(x.saturating_sub(1).min(width - 1), y.saturating_sub(1).min(height - 1))
    });
    let filtered: GrayImage = imageops::filter3x3(&padded, &SHARPEN_KERNEL);
    imageops::crop_imm(&filtered, 1, 1, width, height).to_image()
}

/// Map every pixel to pure black or white.
fn binarize(image: &GrayImage, binarization: Binarization) -> GrayImage {
    // `ThresholdType::Binary` keeps pixels strictly above the level.
    let level = match binarization {
        Binarization::Fixed(cutoff) => cutoff.saturating_sub(1),
        Binarization::Otsu => otsu_level(image),
    };
    threshold(image, level, ThresholdType::Binary)
}

#[cfg(test)]
mod tests {
    use image::Luma;

    use super::*;
    use crate::pdf::testing::FakeRasterizer;

    fn page_with_bar() -> DynamicImage {
        DynamicImage::ImageLuma8(GrayImage::from_fn(40, 20, |x, _y| {
            if (10..20).contains(&x) {
                Luma([50])
            } else {
                Luma([200])
            }
        }))
    }

    #[test]
    fn default_render_resolution_is_three_times_nominal() {
        assert_eq!(PreprocessOptions::default().render_dpi(), 216);
    }

    #[test]
    fn output_is_binary_and_upscaled() {
        let options = PreprocessOptions::default();
        let out = options.apply(page_with_bar());
        assert_eq!(out.dimensions(), (80, 40));
        assert!(out.pixels().all(|Luma([v])| *v == 0 || *v == 255));
        assert_eq!(out.get_pixel(30, 20)[0], 0);
        assert_eq!(out.get_pixel(2, 20)[0], 255);
        assert_eq!(out.get_pixel(77, 20)[0], 255);
    }

    #[test]
    fn pipeline_is_deterministic() {
        let options = PreprocessOptions::default();
        assert_eq!(options.apply(page_with_bar()), options.apply(page_with_bar()));
    }

    #[test]
    fn color_input_becomes_single_channel() {
        let rgb = image::RgbImage::from_pixel(4, 4, image::Rgb([255, 0, 0]));
        let options = PreprocessOptions {
            upscale_factor: 1.0,
            ..PreprocessOptions::default()
        };
        let out = options.apply(DynamicImage::ImageRgb8(rgb));
        assert_eq!(out.dimensions(), (4, 4));
    }

    #[test]
    fn auto_contrast_stretches_to_full_range() {
        let image = GrayImage::from_fn(10, 1, |x, _| Luma([100 + x as u8 * 10]));
        let out = auto_contrast(image, 0.0);
        assert_eq!(out.get_pixel(0, 0)[0], 0);
        assert_eq!(out.get_pixel(9, 0)[0], 255);
    }

    #[test]
    fn otsu_splits_bimodal_images() {
        let image = GrayImage::from_fn(20, 20, |x, _| {
            if x < 8 { Luma([30]) } else { Luma([220]) }
        });
        let out = binarize(&image, Binarization::Otsu);
        assert_eq!(out.get_pixel(0, 0)[0], 0);
        assert_eq!(out.get_pixel(19, 0)[0], 255);
    }

    #[test]
    fn fixed_threshold_blackens_strictly_darker_pixels() {
        let image = GrayImage::from_fn(3, 1, |x, _| Luma([179 + x as u8]));
        let out = binarize(&image, Binarization::Fixed(180));
        assert_eq!(out.as_raw(), &vec![0, 255, 255]);
    }

    #[test]
    fn sharpening_reaches_the_borders() {
        let image = GrayImage::from_fn(4, 4, |x, _| if x == 0 { Luma([0]) } else { Luma([200]) });
        let out = sharpen(&image);
        assert_eq!(out.dimensions(), (4, 4));
        assert_eq!(out.get_pixel(3, 0)[0], 200);
        assert_eq!(out.get_pixel(0, 3)[0], 0);
        assert_eq!(out.get_pixel(1, 1)[0], 255);
    }

    #[test]
    fn sharpening_keeps_flat_regions_flat() {
        let image = GrayImage::from_pixel(5, 5, Luma([120]));
        assert_eq!(sharpen(&image), image);
    }

    #[tokio::test]
    async fn prepare_page_renders_at_configured_resolution() -> Result<()> {
        let rasterizer = Arc::new(FakeRasterizer::default());
        let preprocessor = ImagePreprocessor::new(rasterizer.clone(), PreprocessOptions::default());
        let doc = SourceDocument::new(PathBuf::from("/docs/scan.pdf"), 2);
        let out = preprocessor.prepare_page(&doc, 1).await?;
        assert_eq!(out.dimensions(), (32, 16));
        assert_eq!(*rasterizer.calls.lock().unwrap(), vec![1]);
        Ok(())
    }

    #[tokio::test]
    async fn render_failures_are_reported() {
        let rasterizer = Arc::new(FakeRasterizer {
            fail_on_page: Some(0),
            ..FakeRasterizer::default()
        });
        let preprocessor = ImagePreprocessor::new(rasterizer, PreprocessOptions::default());
        let doc = SourceDocument::new(PathBuf::from("/docs/scan.pdf"), 1);
        let err = preprocessor.prepare_page(&doc, 0).await.unwrap_err();
        assert!(matches!(err, ConversionError::PageRender { page: 0, .. }));
    }
}
