use std::str::FromStr;

use clap::{Parser, Subcommand};
use tracing_subscriber::{
    EnvFilter, Layer as _, filter::Directive, fmt::format::FmtSpan, layer::SubscriberExt,
    util::SubscriberInitExt as _,
};

use self::{prelude::*, ui::Ui};

mod async_utils;
mod audit;
mod batch;
mod cmd;
mod config;
mod convert;
mod cpu_limit;
mod errors;
mod ocr;
mod pdf;
mod prelude;
mod preprocess;
mod text_cleanup;
mod toml_utils;
mod toolchain;
mod ui;

/// Convert PDFs to DOCX or plain text, with OCR for scanned pages.
#[derive(Debug, Parser)]
#[clap(
    version,
    author,
    after_help = r#"
External Tools:
  - Poppler (`pdfinfo`, `pdftotext`, `pdftocairo`) must be on PATH.
  - Tesseract must be on PATH, with language data for every `--lang`.
  Run `pdf-ocr-converter check` to verify.

Environment Variables:
  - RUST_LOG (optional): Log filter, such as `debug` or `audit=info`.

  These variables may be set in a standard `.env` file.
"#
)]
struct Opts {
    #[clap(subcommand)]
    subcmd: Cmd,
}

/// The subcommands we support.
#[derive(Debug, Subcommand)]
enum Cmd {
    /// Convert PDF files to DOCX or text.
    Convert(cmd::convert::ConvertOpts),
    /// Check that the PDF and OCR tools are installed.
    Check(cmd::check::CheckOpts),
    /// Print schemas for audit records and batch summaries.
    Schema(cmd::schema::SchemaOpts),
}

impl Cmd {
    /// Are we using stdout for output?
    fn using_stdout_for_output(&self) -> bool {
        match self {
            Cmd::Convert(_) | Cmd::Check(_) => false,
            Cmd::Schema(opts) => opts.output_path.is_none(),
        }
    }
}

/// Our entry point, which can return an error. [`anyhow::Result`] will
/// automatically print a nice error message with optional backtrace.
#[tokio::main]
async fn main() -> Result<()> {
    let ui = Ui::init();

    // Initialize tracing.
    let directive =
        Directive::from_str("info").expect("built-in directive should be valid");
    let env_filter = EnvFilter::builder()
        .with_default_directive(directive)
        .from_env_lossy();

    let subscriber = tracing_subscriber::fmt::layer()
        .with_span_events(FmtSpan::NEW | FmtSpan::CLOSE)
        .with_writer(ui.get_stderr_writer())
        .with_filter(env_filter);

    // We can stack multiple layers here if we need to.
    tracing_subscriber::registry().with(subscriber).init();

    // Call our real `main` function now that logging is set up.
    real_main(ui).await
}

/// Our real entry point.
#[instrument(level = "debug", name = "main", skip_all)]
async fn real_main(ui: Ui) -> Result<()> {
    // Load environment variables from a `.env` file, if it exists.
    dotenvy::dotenv().ok();

    // Parse command-line arguments.
    let opts = Opts::parse();
    debug!("Parsed options: {:?}", opts);

    // Hide the progress bar if we're using stdout for output.
    if opts.subcmd.using_stdout_for_output() {
        ui.hide_progress_bars();
    }

    // Run the appropriate subcommand.
    match &opts.subcmd {
        Cmd::Convert(convert_opts) => {
            cmd::convert::cmd_convert(ui, convert_opts).await?;
        }
        Cmd::Check(check_opts) => {
            cmd::check::cmd_check(ui, check_opts).await?;
        }
        Cmd::Schema(schema_opts) => {
            cmd::schema::cmd_schema(schema_opts).await?;
        }
    }
    Ok(())
}
