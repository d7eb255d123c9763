//! The `check` subcommand.

use clap::Args;

use crate::{
    config::DEFAULT_LANGUAGES,
    prelude::*,
    toolchain::OcrCapability,
    ui::{ProgressConfig, Ui},
};

/// Options for the `check` subcommand.
#[derive(Debug, Args)]
pub struct CheckOpts {
    /// OCR languages that must be installed. Repeat or join with `+`.
    #[clap(short = 'l', long = "lang", value_delimiter = '+')]
    pub languages: Vec<String>,
}

/// Check that Poppler and Tesseract are installed, with the languages we need.
#[instrument(level = "debug", skip_all)]
pub async fn cmd_check(ui: Ui, opts: &CheckOpts) -> Result<()> {
    let languages = if opts.languages.is_empty() {
        DEFAULT_LANGUAGES.iter().map(|l| (*l).to_owned()).collect()
    } else {
        opts.languages.clone()
    };

    let spinner = ui.new_spinner(&ProgressConfig {
        emoji: "🔧",
        msg: "Checking OCR toolchain",
        done_msg: "Checked OCR toolchain",
    });
    let capability = OcrCapability::detect(&languages).await;
    spinner.finish_using_style();
    let capability = capability?;

    ui.display_message("✅", capability.tesseract_version());
    ui.display_message(
        "🌐",
        &format!(
            "Installed languages: {}",
            capability.installed_languages().join(", ")
        ),
    );
    ui.display_message(
        "📄",
        &format!("Ready to OCR with -l {}", capability.language_spec()),
    );
    Ok(())
}
