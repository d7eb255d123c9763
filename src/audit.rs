//! One structured record per converted file.
//!
//! Records go to `tracing` (target `audit`) and, optionally, to an
//! append-only JSONL file that can be parsed back later.

use std::{
    fs::{File, OpenOptions},
    io::{BufWriter, Write as _},
    sync::Mutex,
};

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use uuid::Uuid;

use crate::{
    convert::{ConversionResult, Outcome, OutcomeStatus, OutputFormat},
    errors::ErrorKind,
    prelude::*,
};

/// What happened to one file.
#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
pub struct AuditRecord {
    pub timestamp: DateTime<Utc>,
    pub batch_id: Uuid,
    /// Position of the file in its batch.
    pub index: usize,
    pub file_name: String,
    pub source_path: PathBuf,
    pub outcome: OutcomeStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub ocr_used: bool,
    pub ocr_pages: usize,
    pub page_count: usize,
    pub scan_like: bool,
    pub elapsed_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_path: Option<PathBuf>,
    pub requested_format: OutputFormat,
    /// Missing when nothing was written.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub written_format: Option<OutputFormat>,
    /// DOCX was requested, but text was written.
    pub format_downgraded: bool,
}

impl AuditRecord {
    pub fn new(batch_id: Uuid, index: usize, result: &ConversionResult) -> Self {
        Self {
            timestamp: Utc::now(),
            batch_id,
            index,
            file_name: result.file_name(),
            source_path: result.source.clone(),
            outcome: result.outcome.status(),
            error_kind: result.outcome.error_kind(),
            reason: result.outcome.reason().map(str::to_owned),
            ocr_used: result.ocr_used(),
            ocr_pages: result.ocr_pages,
            page_count: result.page_count,
            scan_like: result.scan_like,
            elapsed_ms: u64::try_from(result.elapsed.as_millis()).unwrap_or(u64::MAX),
            output_path: result.output_path.clone(),
            requested_format: result.requested_format,
            written_format: result.written_format,
            format_downgraded: matches!(
                result.outcome,
                Outcome::Succeeded {
                    format_downgraded: true
                }
            ),
        }
    }
}

/// Somewhere to send audit records.
pub trait AuditSink: Send + Sync {
    fn record(&self, record: &AuditRecord) -> Result<()>;
}

/// Logs each record as an `info` event with target `audit`.
#[derive(Debug, Default)]
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn record(&self, record: &AuditRecord) -> Result<()> {
        match record.outcome {
            OutcomeStatus::Failed => warn!(
                target: "audit",
                batch_id = %record.batch_id,
                index = record.index,
                file_name = %record.file_name,
                error_kind = ?record.error_kind,
                reason = record.reason.as_deref().unwrap_or(""),
                page_count = record.page_count,
                elapsed_ms = record.elapsed_ms,
                "Conversion failed"
            ),
            _ => info!(
                target: "audit",
                batch_id = %record.batch_id,
                index = record.index,
                file_name = %record.file_name,
                outcome = ?record.outcome,
                ocr_used = record.ocr_used,
                ocr_pages = record.ocr_pages,
                page_count = record.page_count,
                elapsed_ms = record.elapsed_ms,
                format_downgraded = record.format_downgraded,
                written_format = ?record.written_format,
                output_path = ?record.output_path,
                "Conversion finished"
            ),
        }
        Ok(())
    }
}

/// Appends each record as one line of JSON.
pub struct JsonlAuditSink {
    path: PathBuf,
    writer: Mutex<BufWriter<File>>,
}

impl JsonlAuditSink {
    /// Open `path` for appending, creating it if needed.
    pub fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("cannot open audit log {:?}", path.display()))?;
        Ok(Self {
            path: path.to_owned(),
            writer: Mutex::new(BufWriter::new(file)),
        })
    }
}

impl AuditSink for JsonlAuditSink {
    fn record(&self, record: &AuditRecord) -> Result<()> {
        let mut writer = self
            .writer
            .lock()
            .map_err(|_| anyhow!("audit log lock poisoned"))?;
        serde_json::to_writer(&mut *writer, record)
            .context("failed to serialize audit record")?;
        writer
            .write_all(b"\n")
            .and_then(|()| writer.flush())
            .with_context(|| format!("failed to write audit log {:?}", self.path.display()))?;
        Ok(())
    }
}


#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn result(outcome: Outcome) -> ConversionResult {
        ConversionResult {
            source: PathBuf::from("/in/faktura.pdf"),
            output_path: Some(PathBuf::from("/out/faktura.txt")),
            requested_format: OutputFormat::Docx,
            written_format: Some(OutputFormat::Txt),
            page_count: 3,
            ocr_pages: 2,
            scan_like: true,
            elapsed: Duration::from_millis(1500),
            outcome,
        }
    }

    #[test]
    fn records_describe_the_result() {
        let batch_id = Uuid::new_v4();
        let record = AuditRecord::new(
            batch_id,
            4,
            &result(Outcome::Succeeded {
                format_downgraded: true,
            }),
        );
        assert_eq!(record.file_name, "faktura.pdf");
        assert_eq!(record.outcome, OutcomeStatus::Succeeded);
        assert!(record.ocr_used);
        assert!(record.format_downgraded);
        assert_eq!(record.elapsed_ms, 1500);
        assert_eq!(record.error_kind, None);
        assert_eq!(record.requested_format, OutputFormat::Docx);
        assert_eq!(record.written_format, Some(OutputFormat::Txt));
    }

    #[test]
    fn jsonl_lines_parse_back() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("audit.jsonl");
        let batch_id = Uuid::new_v4();
        let first = AuditRecord::new(
            batch_id,
            0,
            &result(Outcome::Succeeded {
                format_downgraded: false,
            }),
        );
        let second = AuditRecord::new(
            batch_id,
            1,
            &result(Outcome::Failed {
                kind: ErrorKind::PageRender,
                reason: "cannot render page 2".to_owned(),
            }),
        );
        {
            let sink = JsonlAuditSink::open(&path)?;
            sink.record(&first)?;
            sink.record(&second)?;
        }
        // Reopening appends.
        JsonlAuditSink::open(&path)?.record(&first)?;

        let contents = std::fs::read_to_string(&path)?;
        let parsed = contents
            .lines()
            .map(serde_json::from_str::<AuditRecord>)
            .collect::<Result<Vec<_>, _>>()?;
        assert_eq!(parsed, vec![first.clone(), second, first]);
        assert_eq!(parsed[1].error_kind, Some(ErrorKind::PageRender));
        Ok(())
    }

    #[test]
    fn tracing_sink_accepts_every_outcome() -> Result<()> {
        let sink = TracingAuditSink;
        for outcome in [
            Outcome::Cancelled,
            Outcome::Failed {
                kind: ErrorKind::DocumentOpen,
                reason: "bad header".to_owned(),
            },
        ] {
            sink.record(&AuditRecord::new(Uuid::new_v4(), 0, &result(outcome)))?;
        }
        Ok(())
    }
}
