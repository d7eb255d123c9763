//! Rendering and writing converted documents.

use std::io::{self, Cursor, Write as _};

use clap::ValueEnum;
use docx_rs::{BreakType, Docx, Paragraph, Run};
use schemars::JsonSchema;

use crate::{errors::ConversionError, prelude::*};

/// Page separator used in text output: a form feed on its own line.
pub const PAGE_BREAK_SEPARATOR: &str = "\n\x0C\n";

/// Page separator used when page breaks are turned off.
pub const BLANK_LINE_SEPARATOR: &str = "\n\n";

/// How many ` (n)` suffixes we try before giving up.
const MAX_RENAME_ATTEMPTS: usize = 10_000;

/// Output document formats.
#[derive(
    Clone, Copy, Debug, Default, Deserialize, Eq, Hash, JsonSchema, PartialEq, Serialize, ValueEnum,
)]
#[serde(rename_all = "snake_case")]
pub enum OutputFormat {
    /// Word document, one paragraph per page. Only for text-layer documents.
    #[default]
    Docx,
    /// Plain UTF-8 text.
    Txt,
}

impl OutputFormat {
    /// File extension, without the dot.
    pub fn extension(self) -> &'static str {
        match self {
            OutputFormat::Docx => "docx",
            OutputFormat::Txt => "txt",
        }
    }
}

/// What to do when the output file already exists.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, ValueEnum)]
pub enum CollisionPolicy {
    /// Leave the existing file alone and fail the item.
    #[default]
    Fail,
    /// Pick a new name: `stem (1).ext`, `stem (2).ext`, and so on.
    Rename,
    /// Replace the existing file.
    Overwrite,
}

/// Join page texts in page order.
pub fn assemble_text(pages: &[String], separator: &str) -> String {
    pages.join(separator)
}

/// Build a DOCX file with one paragraph per page and a page break between
/// pages.
pub fn render_docx(pages: &[String]) -> Result<Vec<u8>> {
    let mut docx = Docx::new();
    for (page_idx, page) in pages.iter().enumerate() {
        let mut run = Run::new();
        if page_idx > 0 {
            run = run.add_break(BreakType::Page);
        }
        for (line_idx, line) in page.lines().enumerate() {
            if line_idx > 0 {
                run = run.add_break(BreakType::TextWrapping);
            }
            run = run.add_text(xml_safe(line));
        }
        docx = docx.add_paragraph(Paragraph::new().add_run(run));
    }

    let mut buf = Cursor::new(Vec::new());
    docx.build()
        .pack(&mut buf)
        .map_err(|err| anyhow!("cannot build DOCX: {}", err))?;
    Ok(buf.into_inner())
}

/// Drop characters XML 1.0 cannot represent, such as the form feeds
/// `pdftotext` leaves in some text layers.
fn xml_safe(line: &str) -> String {
    line.chars()
        .filter(|&c| c == '\t' || !c.is_control())
        .collect()
}

/// Write `bytes` to `<dir>/<stem>.<ext>` without ever exposing a partial
/// file.
///
/// The data goes to a temporary file in `dir` first, which is then moved into
/// place. Unless `policy` is [`CollisionPolicy::Overwrite`], the move refuses
/// to replace an existing file.
pub fn write_output_file(
    dir: &Path,
    stem: &str,
    format: OutputFormat,
    bytes: &[u8],
    policy: CollisionPolicy,
) -> Result<PathBuf, ConversionError> {
    let target = dir.join(format!("{}.{}", stem, format.extension()));
    let write_error = |err: io::Error| ConversionError::output_write(&target, err);

    let mut tmp = tempfile::Builder::new()
        .prefix(".partial-")
        .suffix(".tmp")
        .tempfile_in(dir)
        .map_err(write_error)?;
    tmp.write_all(bytes).map_err(write_error)?;
    tmp.as_file().sync_all().map_err(write_error)?;

    if policy == CollisionPolicy::Overwrite {
        if target.exists() {
            warn!(path = %target.display(), "Overwriting existing output file");
        }
        tmp.persist(&target)
            .map_err(|err| ConversionError::output_write(&target, err.error))?;
        return Ok(target);
    }

    for attempt in 0..MAX_RENAME_ATTEMPTS {
        let candidate = if attempt == 0 {
            target.clone()
        } else {
            dir.join(format!("{} ({}).{}", stem, attempt, format.extension()))
        };
        match tmp.persist_noclobber(&candidate) {
            Ok(_) => {
                if attempt > 0 {
                    info!(path = %candidate.display(), "Output renamed to avoid a collision");
                }
                return Ok(candidate);
            }
            Err(err) if err.error.kind() == io::ErrorKind::AlreadyExists => {
                if policy == CollisionPolicy::Fail {
                    return Err(ConversionError::output_write(
                        &candidate,
                        "file already exists",
                    ));
                }
                tmp = err.file;
            }
            Err(err) => return Err(ConversionError::output_write(&candidate, err.error)),
        }
    }
    Err(ConversionError::output_write(
        &target,
        "too many existing files with this name",
    ))
}
