//! Converter configuration.
//!
//! Settings come from built-in defaults, then an optional TOML tuning file,
//! then command-line flags, each overriding the last. Unknown keys in the
//! TOML file are errors, so typos do not silently fall back to defaults.

use toml_span::{DeserError, Value, de_helpers::TableHelper, value::ValueInner};

use crate::{
    convert::{BLANK_LINE_SEPARATOR, ConverterOptions, PAGE_BREAK_SEPARATOR},
    ocr::{DEFAULT_PAGE_SEGMENTATION_MODE, OcrOptions},
    pdf::TextLayerPolicy,
    prelude::*,
    preprocess::{Binarization, PreprocessOptions},
    toml_utils::{custom_deser_error, describe_deser_error, from_toml_str},
};

/// Default OCR language set.
pub const DEFAULT_LANGUAGES: &[&str] = &["pol"];

/// Fully resolved converter settings.
#[derive(Clone, Debug, PartialEq)]
pub struct ConverterConfig {
    pub languages: Vec<String>,
    pub text_layer: TextLayerPolicy,
    pub preprocess: PreprocessOptions,
    pub page_segmentation_mode: u8,
    pub clean_ocr_text: bool,
    pub page_breaks: bool,
}

impl Default for ConverterConfig {
    fn default() -> Self {
        Self {
            languages: DEFAULT_LANGUAGES.iter().map(|l| (*l).to_owned()).collect(),
            text_layer: TextLayerPolicy::default(),
            preprocess: PreprocessOptions::default(),
            page_segmentation_mode: DEFAULT_PAGE_SEGMENTATION_MODE,
            clean_ocr_text: true,
            page_breaks: true,
        }
    }
}

impl ConverterConfig {
    /// Load defaults overridden by the TOML file at `path`.
    #[instrument(level = "debug", skip_all, fields(path = %path.display()))]
    pub async fn load(path: &Path) -> Result<Self> {
        let toml_str = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("cannot read config file {:?}", path.display()))?;
        let mut config = Self::default();
        config.apply_toml(&toml_str).with_context(|| {
            format!("invalid config file {:?}", path.display())
        })?;
        Ok(config)
    }

    /// Apply the settings in a TOML document on top of `self`.
    pub fn apply_toml(&mut self, toml_str: &str) -> Result<()> {
        let file: ConfigFile = from_toml_str(toml_str)
            .map_err(|err| anyhow!("{}", describe_deser_error(toml_str, &err)))?;
        file.apply_to(self);
        self.validate()
    }

    /// Check that the values make sense together.
    pub fn validate(&self) -> Result<()> {
        if self.languages.is_empty() {
            return Err(anyhow!("at least one OCR language is required"));
        }
        if let Some(lang) = self
            .languages
            .iter()
            .find(|lang| lang.is_empty() || !lang.chars().all(|c| c.is_ascii_alphanumeric() || c == '_'))
        {
            return Err(anyhow!("invalid OCR language name {:?}", lang));
        }
        let fractions = [
            ("min_density", self.text_layer.min_density),
            ("scan_like_fraction", self.text_layer.scan_like_fraction),
            ("contrast_cutoff", self.preprocess.contrast_cutoff),
        ];
        for (name, value) in fractions {
            if !(0.0..=1.0).contains(&value) {
                return Err(anyhow!("{} must be between 0.0 and 1.0, got {}", name, value));
            }
        }
        if self.preprocess.contrast_cutoff >= 0.5 {
            return Err(anyhow!("contrast_cutoff must be below 0.5"));
        }
        if !(self.preprocess.render_scale > 0.0) {
            return Err(anyhow!("render_scale must be positive"));
        }
        if !(self.preprocess.upscale_factor >= 1.0) {
            return Err(anyhow!("upscale_factor must be at least 1.0"));
        }
        if self.page_segmentation_mode > 13 {
            return Err(anyhow!(
                "page_segmentation_mode must be between 0 and 13, got {}",
                self.page_segmentation_mode
            ));
        }
        Ok(())
    }

    /// Settings for the converter itself.
    pub fn converter_options(&self) -> ConverterOptions {
        ConverterOptions {
            text_layer: self.text_layer,
            page_separator: if self.page_breaks {
                PAGE_BREAK_SEPARATOR.to_owned()
            } else {
                BLANK_LINE_SEPARATOR.to_owned()
            },
        }
    }

    /// Settings for the OCR engine.
    pub fn ocr_options(&self) -> OcrOptions {
        let effective_dpi =
            self.preprocess.render_dpi() as f32 * self.preprocess.upscale_factor.max(1.0);
        OcrOptions {
            page_segmentation_mode: self.page_segmentation_mode,
            dpi: Some(effective_dpi.round() as u32),
            clean_text: self.clean_ocr_text,
        }
    }
}

/// The TOML tuning file. Every key is optional.
#[derive(Debug, Default)]
struct ConfigFile {
    languages: Option<Vec<String>>,
    text_layer: Option<TextLayerSection>,
    preprocess: Option<PreprocessSection>,
    ocr: Option<OcrSection>,
    output: Option<OutputSection>,
}

impl ConfigFile {
    fn apply_to(self, config: &mut ConverterConfig) {
        if let Some(languages) = self.languages {
            config.languages = languages;
        }
        if let Some(section) = self.text_layer {
            let policy = &mut config.text_layer;
            set(&mut policy.min_chars, section.min_chars);
            set(&mut policy.min_density, section.min_density.map(|v| v as f32));
            set(
                &mut policy.scan_like_fraction,
                section.scan_like_fraction.map(|v| v as f32),
            );
        }
        if let Some(section) = self.preprocess {
            let options = &mut config.preprocess;
            set(&mut options.render_scale, section.render_scale.map(|v| v as f32));
            set(&mut options.upscale_factor, section.upscale_factor.map(|v| v as f32));
            set(&mut options.contrast_cutoff, section.contrast_cutoff.map(|v| v as f32));
            set(&mut options.sharpen, section.sharpen);
            set(&mut options.binarization, section.binarization);
        }
        if let Some(section) = self.ocr {
            set(&mut config.page_segmentation_mode, section.page_segmentation_mode);
            set(&mut config.clean_ocr_text, section.clean_text);
        }
        if let Some(section) = self.output {
            set(&mut config.page_breaks, section.page_breaks);
        }
    }
}

fn set<T>(slot: &mut T, value: Option<T>) {
    if let Some(value) = value {
        *slot = value;
    }
}

impl<'de> toml_span::Deserialize<'de> for ConfigFile {
    fn deserialize(value: &mut Value<'de>) -> Result<Self, DeserError> {
        let mut th = TableHelper::new(value)?;
        let languages = th.optional("languages");
        let text_layer = th.optional("text_layer");
        let preprocess = th.optional("preprocess");
        let ocr = th.optional("ocr");
        let output = th.optional("output");
        th.finalize(None)?;
        Ok(Self {
            languages,
            text_layer,
            preprocess,
            ocr,
            output,
        })
    }
}

#[derive(Debug)]
struct TextLayerSection {
    min_chars: Option<usize>,
    min_density: Option<f64>,
    scan_like_fraction: Option<f64>,
}

impl<'de> toml_span::Deserialize<'de> for TextLayerSection {
    fn deserialize(value: &mut Value<'de>) -> Result<Self, DeserError> {
        let mut th = TableHelper::new(value)?;
        let min_chars = th.optional("min_chars");
        let min_density = th.optional("min_density");
        let scan_like_fraction = th.optional("scan_like_fraction");
        th.finalize(None)?;
        Ok(Self {
            min_chars,
            min_density,
            scan_like_fraction,
        })
    }
}

#[derive(Debug)]
struct PreprocessSection {
    render_scale: Option<f64>,
    upscale_factor: Option<f64>,
    contrast_cutoff: Option<f64>,
    sharpen: Option<bool>,
    binarization: Option<Binarization>,
}

impl<'de> toml_span::Deserialize<'de> for PreprocessSection {
    fn deserialize(value: &mut Value<'de>) -> Result<Self, DeserError> {
        let mut th = TableHelper::new(value)?;
        let render_scale = th.optional("render_scale");
        let upscale_factor = th.optional("upscale_factor");
        let contrast_cutoff = th.optional("contrast_cutoff");
        let sharpen = th.optional("sharpen");
        let binarization = th.optional("binarization");
        th.finalize(None)?;
        Ok(Self {
            render_scale,
            upscale_factor,
            contrast_cutoff,
            sharpen,
            binarization,
        })
    }
}

/// `binarization = "otsu"` or `binarization = 180`.
impl<'de> toml_span::Deserialize<'de> for Binarization {
    fn deserialize(value: &mut Value<'de>) -> Result<Self, DeserError> {
        match value.take() {
            ValueInner::String(s) if s == "otsu" => Ok(Binarization::Otsu),
            ValueInner::Integer(i) => u8::try_from(i).map(Binarization::Fixed).map_err(|_| {
                custom_deser_error(value.span, "binarization threshold must be between 0 and 255")
            }),
            _ => Err(custom_deser_error(
                value.span,
                "expected \"otsu\" or a threshold between 0 and 255",
            )),
        }
    }
}

#[derive(Debug)]
struct OcrSection {
    page_segmentation_mode: Option<u8>,
    clean_text: Option<bool>,
}

impl<'de> toml_span::Deserialize<'de> for OcrSection {
    fn deserialize(value: &mut Value<'de>) -> Result<Self, DeserError> {
        let mut th = TableHelper::new(value)?;
        let page_segmentation_mode = th.optional("page_segmentation_mode");
        let clean_text = th.optional("clean_text");
        th.finalize(None)?;
        Ok(Self {
            page_segmentation_mode,
            clean_text,
        })
    }
}

#[derive(Debug)]
struct OutputSection {
    page_breaks: Option<bool>,
}

impl<'de> toml_span::Deserialize<'de> for OutputSection {
    fn deserialize(value: &mut Value<'de>) -> Result<Self, DeserError> {
        let mut th = TableHelper::new(value)?;
        let page_breaks = th.optional("page_breaks");
        th.finalize(None)?;
        Ok(Self { page_breaks })
    }
}
