//! The `schema` subcommand.

use clap::{Args, ValueEnum};
use schemars::schema_for;
use tokio::io::AsyncWriteExt as _;

use crate::{audit::AuditRecord, batch::BatchSummary, prelude::*};

/// The different schema types we support.
///
/// We parse these as PascalCase, because they represent type names.
#[derive(Debug, Clone, Copy, ValueEnum)]
#[clap(rename_all = "PascalCase")]
pub enum SchemaType {
    /// One line of the `--audit-log` file.
    AuditRecord,
    /// The `--summary-out` file.
    BatchSummary,
}

/// Schema command line arguments.
#[derive(Debug, Args)]
pub struct SchemaOpts {
    /// The schema type to generate.
    #[clap(value_enum, value_name = "TYPE")]
    pub schema_type: SchemaType,

    /// The output path to write the schema to.
    #[clap(short = 'o', long = "out")]
    pub output_path: Option<PathBuf>,
}

/// The `schema` subcommand.
#[instrument(level = "debug", skip_all)]
pub async fn cmd_schema(schema_opts: &SchemaOpts) -> Result<()> {
    let schema = match schema_opts.schema_type {
        SchemaType::AuditRecord => schema_for!(AuditRecord),
        SchemaType::BatchSummary => schema_for!(BatchSummary),
    };
    let mut schema_str =
        serde_json::to_string_pretty(&schema).context("failed to serialize schema")?;
    schema_str.push('\n');

    match &schema_opts.output_path {
        Some(path) => tokio::fs::write(path, schema_str)
            .await
            .with_context(|| format!("failed to write schema to {:?}", path.display()))?,
        None => {
            let mut stdout = tokio::io::stdout();
            stdout
                .write_all(schema_str.as_bytes())
                .await
                .context("failed to write schema")?;
            stdout.flush().await.context("failed to flush schema")?;
        }
    }
    Ok(())
}
