//! Detecting the external PDF and OCR toolchain.
//!
//! We need Poppler's `pdfinfo`, `pdftotext` and `pdftocairo`, plus
//! `tesseract` with every requested language pack. All of this is checked
//! exactly once, before a batch is built, and the result is passed around as
//! an [`OcrCapability`] value. Nothing else in the program probes for tools.

use tokio::process::Command;

use crate::{
    async_utils::{CommandError, run_command},
    errors::ConversionError,
    prelude::*,
};

/// Poppler tools that must be present. Each accepts `-v` to print its version.
const POPPLER_TOOLS: &[&str] = &["pdfinfo", "pdftotext", "pdftocairo"];

/// Installation hint shown when Poppler is missing.
const POPPLER_HINT: &str =
    "install poppler-utils (Debian/Ubuntu) or poppler (Homebrew), and make sure its bin directory is on PATH";

/// Installation hint shown when Tesseract is missing.
const TESSERACT_HINT: &str =
    "install tesseract-ocr (Debian/Ubuntu) or tesseract (Homebrew), and make sure it is on PATH";

/// Proof that the OCR toolchain was present when the session started.
///
/// The only way to get one of these outside of tests is [`OcrCapability::detect`],
/// so holding one means the precondition check has already passed.
#[derive(Clone, Debug)]
pub struct OcrCapability {
    /// First line of `tesseract --version`.
    tesseract_version: String,

    /// Languages installed for Tesseract.
    installed_languages: Vec<String>,

    /// Languages we were asked to recognize.
    languages: Vec<String>,
}

impl OcrCapability {
    /// Probe the host for Poppler and Tesseract, and check that every language
    /// in `languages` has a trained data file.
    #[instrument(level = "debug", skip_all, fields(languages = ?languages))]
    pub async fn detect(languages: &[String]) -> Result<Self, ConversionError> {
        if languages.is_empty() {
            return Err(ConversionError::ocr_unavailable(
                "no OCR languages were configured",
            ));
        }

        for &tool in POPPLER_TOOLS {
            let mut cmd = Command::new(tool);
            cmd.arg("-v");
            match cmd.output().await {
                Ok(_) => debug!(tool, "Found Poppler tool"),
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                    return Err(ConversionError::ocr_unavailable(format!(
                        "{} not found: {}",
                        tool, POPPLER_HINT
                    )));
                }
                Err(err) => {
                    return Err(ConversionError::ocr_unavailable(format!(
                        "cannot run {}: {}",
                        tool, err
                    )));
                }
            }
        }

        let version_output =
            run_command("tesseract", Command::new("tesseract").arg("--version"), None)
                .await
                .map_err(tesseract_error)?;
        // Older Tesseract releases print the version on stderr.
        let mut version_text = String::from_utf8_lossy(&version_output.stdout).into_owned();
        if version_text.trim().is_empty() {
            version_text = String::from_utf8_lossy(&version_output.stderr).into_owned();
        }
        let tesseract_version = version_text.lines().next().unwrap_or("tesseract").trim().to_owned();

        let langs_output = run_command(
            "tesseract",
            Command::new("tesseract").arg("--list-langs"),
            None,
        )
        .await
        .map_err(tesseract_error)?;
        let mut listing = String::from_utf8_lossy(&langs_output.stdout).into_owned();
        if listing.trim().is_empty() {
            listing = String::from_utf8_lossy(&langs_output.stderr).into_owned();
        }
        let installed_languages = parse_language_list(&listing);

        let capability = Self {
            tesseract_version,
            installed_languages,
            languages: languages.to_owned(),
        };
        capability.check_languages()?;
        info!(
            version = %capability.tesseract_version,
            languages = %capability.language_spec(),
            "OCR toolchain available"
        );
        Ok(capability)
    }

    /// Build a capability without probing the host, for tests that use fake
    /// engines.
    #[cfg(test)]
    pub fn assume_available(languages: &[&str]) -> Self {
        let languages = languages.iter().map(|l| (*l).to_owned()).collect::<Vec<_>>();
        Self {
            tesseract_version: "tesseract (test)".to_owned(),
            installed_languages: languages.clone(),
            languages,
        }
    }

    /// Make sure every requested language is installed.
    fn check_languages(&self) -> Result<(), ConversionError> {
        let missing = self
            .languages
            .iter()
            .filter(|lang| !self.installed_languages.contains(lang))
            .cloned()
            .collect::<Vec<_>>();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(ConversionError::ocr_unavailable(format!(
                "Tesseract language data missing for {} (installed: {}); install the matching tesseract-ocr-<lang> package",
                missing.join(", "),
                self.installed_languages.join(", ")
            )))
        }
    }

    /// The Tesseract version string.
    pub fn tesseract_version(&self) -> &str {
        &self.tesseract_version
    }

    /// Every language Tesseract reported as installed.
    pub fn installed_languages(&self) -> &[String] {
        &self.installed_languages
    }

    /// The configured languages, in Tesseract's `-l` syntax (`pol+eng`).
    pub fn language_spec(&self) -> String {
        self.languages.join("+")
    }
}

/// Convert a failure to run `tesseract` into a [`ConversionError`].
fn tesseract_error(err: CommandError) -> ConversionError {
    match err {
        CommandError::NotInstalled(_) => {
            ConversionError::ocr_unavailable(format!("tesseract not found: {}", TESSERACT_HINT))
        }
        CommandError::Failed(err) => ConversionError::ocr_unavailable(format!("{:#}", err)),
    }
}

/// Parse the output of `tesseract --list-langs`.
///
/// The first line is a header like `List of available languages in
/// "/usr/share/tesseract-ocr/5/tessdata/" (3):`.
fn parse_language_list(listing: &str) -> Vec<String> {
    listing
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with("List of available languages"))
        .map(str::to_owned)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_language_listing() {
        let listing = "List of available languages in \"/usr/share/tessdata/\" (3):\neng\nosd\npol\n";
        assert_eq!(parse_language_list(listing), vec!["eng", "osd", "pol"]);
    }

    #[test]
    fn missing_language_is_ocr_unavailable() {
        let capability = OcrCapability {
            tesseract_version: "tesseract 5.3.0".to_owned(),
            installed_languages: vec!["eng".to_owned(), "osd".to_owned()],
            languages: vec!["pol".to_owned()],
        };
        let err = capability.check_languages().unwrap_err();
        assert!(err.kind().is_fatal_for_batch());
        assert!(err.to_string().contains("pol"));
    }

    #[test]
    fn language_spec_joins_with_plus() {
        let capability = OcrCapability::assume_available(&["pol", "eng"]);
        assert_eq!(capability.language_spec(), "pol+eng");
    }

    #[tokio::test]
    async fn empty_language_set_is_rejected_before_probing() {
        let err = OcrCapability::detect(&[]).await.unwrap_err();
        assert!(matches!(err, ConversionError::OcrUnavailable { .. }));
    }

    #[tokio::test]
    #[ignore = "Requires poppler-utils and tesseract-ocr-pol to be installed"]
    async fn detects_installed_toolchain() {
        let capability = OcrCapability::detect(&["pol".to_owned()]).await.unwrap();
        assert!(capability.tesseract_version().contains("tesseract"));
    }
}
