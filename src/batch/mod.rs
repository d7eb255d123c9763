//! Running a list of files through the converter, one at a time.
//!
//! A batch runs on a single background task. The foreground can watch
//! progress events and flip a shared [`CancellationFlag`], and that flag is
//! the only state the two sides share.

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Instant,
};

use schemars::JsonSchema;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::{
    async_utils::JoinWorker,
    audit::{AuditRecord, AuditSink},
    convert::{
        ConversionJobItem, ConversionResult, ConversionTarget, DocumentConverter, ItemState,
        Outcome,
    },
    errors::ErrorKind,
    prelude::*,
};

pub mod progress;

pub use self::progress::{ChannelObserver, ProgressEvent, ProgressObserver};

/// A one-way "please stop" flag. Once set, it stays set.
#[derive(Clone, Debug, Default)]
pub struct CancellationFlag(Arc<AtomicBool>);

impl CancellationFlag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation. Safe to call from any thread, any number of
    /// times.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// An ordered list of files with one output target.
#[derive(Debug)]
pub struct BatchJob {
    items: Vec<ConversionJobItem>,
    target: ConversionTarget,
    cancel: CancellationFlag,
}

impl BatchJob {
    pub fn new(paths: Vec<PathBuf>, target: ConversionTarget) -> Self {
        let items = paths
            .into_iter()
            .enumerate()
            .map(|(index, path)| ConversionJobItem::new(index, path))
            .collect();
        Self {
            items,
            target,
            cancel: CancellationFlag::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// The flag this batch watches.
    pub fn cancellation_flag(&self) -> &CancellationFlag {
        &self.cancel
    }
}

/// Counts for a finished batch.
#[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
pub struct BatchSummary {
    /// Unique ID of this batch, shared by its audit records.
    pub batch_id: Uuid,
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub cancelled: usize,
    /// Documents where at least one page was OCRed.
    pub ocr_documents: usize,
    /// Documents written as text although DOCX was requested.
    pub format_downgraded: usize,
    pub elapsed_ms: u64,
    /// Why the batch stopped early, if the OCR toolchain went away.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aborted: Option<String>,
}

impl BatchSummary {
    fn from_results(
        batch_id: Uuid,
        results: &[ConversionResult],
        elapsed_ms: u64,
        aborted: Option<String>,
    ) -> Self {
        let mut summary = Self {
            batch_id,
            total: results.len(),
            elapsed_ms,
            aborted,
            ..Self::default()
        };
        for result in results {
            match &result.outcome {
                Outcome::Succeeded { format_downgraded } => {
                    summary.succeeded += 1;
                    if *format_downgraded {
                        summary.format_downgraded += 1;
                    }
                }
                Outcome::Failed { .. } => summary.failed += 1,
                Outcome::Cancelled => summary.cancelled += 1,
            }
            if result.ocr_used() {
                summary.ocr_documents += 1;
            }
        }
        summary
    }

    /// Fraction of items that failed.
    pub fn failure_rate(&self) -> f32 {
        if self.total == 0 {
            0.0
        } else {
            self.failed as f32 / self.total as f32
        }
    }
}

/// Everything a batch produced.
#[derive(Debug)]
pub struct BatchReport {
    /// One result per input, in input order.
    pub results: Vec<ConversionResult>,
    /// The job items, with their state histories.
    pub items: Vec<ConversionJobItem>,
    pub summary: BatchSummary,
}

/// Handle to a batch running in the background.
pub struct BatchHandle {
    pub cancel: CancellationFlag,
    pub events: mpsc::UnboundedReceiver<ProgressEvent>,
    pub worker: JoinWorker<BatchReport>,
}

/// Sequences files through a [`DocumentConverter`].
pub struct BatchJobRunner {
    converter: DocumentConverter,
    audit_sinks: Vec<Arc<dyn AuditSink>>,
    batch_id: Uuid,
}

impl BatchJobRunner {
    pub fn new(converter: DocumentConverter, audit_sinks: Vec<Arc<dyn AuditSink>>) -> Self {
        Self {
            converter,
            audit_sinks,
            batch_id: Uuid::new_v4(),
        }
    }

    pub fn batch_id(&self) -> Uuid {
        self.batch_id
    }

    /// Run `job` on a background task.
    pub fn spawn(self, job: BatchJob) -> BatchHandle {
        let cancel = job.cancellation_flag().clone();
        let (observer, events) = ChannelObserver::new();
        let handle = tokio::spawn(async move { self.run(job, &observer).await });
        BatchHandle {
            cancel,
            events,
            worker: JoinWorker::from_handle(handle),
        }
    }

    /// Run every item in `job`, in order.
    #[instrument(level = "debug", skip_all, fields(batch_id = %self.batch_id, items = job.len()))]
    pub async fn run(&self, job: BatchJob, observer: &dyn ProgressObserver) -> BatchReport {
        let started = Instant::now();
        let BatchJob {
            mut items,
            target,
            cancel,
        } = job;
        let total = items.len();
        let mut results = Vec::with_capacity(total);
        let mut aborted: Option<String> = None;

        for item in items.iter_mut() {
            let result = if aborted.is_some() || cancel.is_cancelled() {
                if let Err(err) = item.advance(ItemState::Cancelled) {
                    error!(index = item.index(), "{}", err);
                }
                ConversionResult::cancelled_before_start(item.source(), target.format)
            } else {
                let result = self.converter.convert(item, &target, &cancel).await;
                if result.outcome.error_kind().is_some_and(ErrorKind::is_fatal_for_batch) {
                    let reason = result.outcome.reason().unwrap_or("OCR unavailable").to_owned();
                    error!(reason = %reason, "OCR toolchain unavailable, stopping batch");
                    aborted = Some(reason);
                }
                result
            };

            let record = AuditRecord::new(self.batch_id, item.index(), &result);
            for sink in &self.audit_sinks {
                if let Err(err) = sink.record(&record) {
                    warn!(index = item.index(), "failed to write audit record: {:#}", err);
                }
            }
            observer.item_finished(&ProgressEvent::from_result(item.index(), total, &result));
            results.push(result);
        }

        let elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        let summary = BatchSummary::from_results(self.batch_id, &results, elapsed_ms, aborted);
        info!(
            succeeded = summary.succeeded,
            failed = summary.failed,
            cancelled = summary.cancelled,
            ocr_documents = summary.ocr_documents,
            "Batch finished"
        );
        BatchReport {
            results,
            items,
            summary,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::{
        progress::testing::{FnObserver, RecordingObserver},
        *,
    };
    use crate::{
        audit::testing::RecordingAuditSink,
        convert::{CollisionPolicy, ConverterOptions, OutcomeStatus, OutputFormat},
        ocr::testing::SpyOcrEngine,
        pdf::testing::{FakeExtractor, FakeRasterizer},
        preprocess::{ImagePreprocessor, PreprocessOptions},
    };

    const TEXT: &str = "Pełnomocnictwo do reprezentowania spółki.";

    fn runner(extractor: FakeExtractor, ocr: SpyOcrEngine) -> (BatchJobRunner, Arc<RecordingAuditSink>) {
        let converter = DocumentConverter::new(
            Arc::new(extractor),
            ImagePreprocessor::new(Arc::new(FakeRasterizer::default()), PreprocessOptions::default()),
            Arc::new(ocr),
            ConverterOptions::default(),
        );
        let audit = Arc::new(RecordingAuditSink::default());
        (BatchJobRunner::new(converter, vec![audit.clone()]), audit)
    }

    fn job(out: &Path, names: &[&str]) -> BatchJob {
        BatchJob::new(
            names.iter().map(|n| PathBuf::from(format!("/in/{}", n))).collect(),
            ConversionTarget {
                output_dir: out.to_owned(),
                format: OutputFormat::Txt,
                collision: CollisionPolicy::Fail,
            },
        )
    }

    #[test]
    fn cancellation_flag_is_shared_and_sticky() {
        let flag = CancellationFlag::new();
        let other = flag.clone();
        assert!(!other.is_cancelled());
        flag.cancel();
        flag.cancel();
        assert!(other.is_cancelled());
    }

    #[tokio::test]
    async fn one_corrupt_file_does_not_stop_the_batch() {
        let extractor = FakeExtractor::default()
            .with_doc(Path::new("/in/a.pdf"), &[TEXT])
            .with_corrupt(Path::new("/in/b.pdf"))
            .with_doc(Path::new("/in/c.pdf"), &[TEXT]);
        let (runner, audit) = runner(extractor, SpyOcrEngine::default());
        let out = tempfile::tempdir().unwrap();
        let observer = RecordingObserver::default();
        let report = runner.run(job(out.path(), &["a.pdf", "b.pdf", "c.pdf"]), &observer).await;

        let statuses = report
            .results
            .iter()
            .map(|r| r.outcome.status())
            .collect::<Vec<_>>();
        assert_eq!(
            statuses,
            vec![OutcomeStatus::Succeeded, OutcomeStatus::Failed, OutcomeStatus::Succeeded]
        );
        assert_eq!(report.results[1].outcome.error_kind(), Some(ErrorKind::DocumentOpen));
        assert!(out.path().join("a.txt").exists());
        assert!(out.path().join("c.txt").exists());
        assert_eq!(report.summary.succeeded, 2);
        assert_eq!(report.summary.failed, 1);
        assert!((report.summary.failure_rate() - 1.0 / 3.0).abs() < 1e-6);

        let events = observer.events.lock().unwrap();
        assert_eq!(
            events.iter().map(|e| (e.index, e.total)).collect::<Vec<_>>(),
            vec![(0, 3), (1, 3), (2, 3)]
        );
        assert_eq!(events[1].file_name, "b.pdf");
        let records = audit.records.lock().unwrap();
        assert_eq!(records.len(), 3);
        assert!(records.iter().all(|r| r.batch_id == runner.batch_id()));
    }

    #[tokio::test]
    async fn cancelling_before_item_k_cancels_the_rest() {
        let extractor = FakeExtractor::default()
            .with_doc(Path::new("/in/a.pdf"), &[TEXT])
            .with_doc(Path::new("/in/b.pdf"), &[TEXT])
            .with_doc(Path::new("/in/c.pdf"), &[TEXT])
            .with_doc(Path::new("/in/d.pdf"), &[TEXT]);
        let (runner, _audit) = runner(extractor, SpyOcrEngine::default());
        let out = tempfile::tempdir().unwrap();
        let job = job(out.path(), &["a.pdf", "b.pdf", "c.pdf", "d.pdf"]);
        let flag = job.cancellation_flag().clone();
        // Cancel as soon as item 1 is done, so items 2 and 3 never start.
        let observer = FnObserver(move |event: &ProgressEvent| {
            if event.index == 1 {
                flag.cancel();
            }
        });
        let report = runner.run(job, &observer).await;

        let statuses = report
            .results
            .iter()
            .map(|r| r.outcome.status())
            .collect::<Vec<_>>();
        assert_eq!(
            statuses,
            vec![
                OutcomeStatus::Succeeded,
                OutcomeStatus::Succeeded,
                OutcomeStatus::Cancelled,
                OutcomeStatus::Cancelled
            ]
        );
        assert!(out.path().join("b.txt").exists());
        assert!(!out.path().join("c.txt").exists());
        assert!(!out.path().join("d.txt").exists());
        assert_eq!(report.items[3].history(), &[ItemState::Pending, ItemState::Cancelled]);
        assert_eq!(report.summary.cancelled, 2);
    }

    #[tokio::test]
    async fn cancelled_items_are_never_opened() {
        let extractor = FakeExtractor::default().with_doc(Path::new("/in/a.pdf"), &[TEXT]);
        let events_seen = Arc::new(Mutex::new(0usize));
        let (runner, audit) = runner(extractor, SpyOcrEngine::default());
        let out = tempfile::tempdir().unwrap();
        let job = job(out.path(), &["a.pdf"]);
        job.cancellation_flag().cancel();
        let seen = events_seen.clone();
        let observer = FnObserver(move |_: &ProgressEvent| {
            *seen.lock().unwrap() += 1;
        });
        let report = runner.run(job, &observer).await;
        assert_eq!(report.results[0].outcome, Outcome::Cancelled);
        assert_eq!(report.items[0].history(), &[ItemState::Pending, ItemState::Cancelled]);
        assert_eq!(std::fs::read_dir(out.path()).unwrap().count(), 0);
        // Cancelled items are still reported and audited.
        assert_eq!(*events_seen.lock().unwrap(), 1);
        assert_eq!(audit.records.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn vanished_toolchain_aborts_the_batch() {
        let extractor = FakeExtractor::default()
            .with_doc(Path::new("/in/a.pdf"), &[TEXT])
            .with_doc(Path::new("/in/skan.pdf"), &[""])
            .with_doc(Path::new("/in/c.pdf"), &[TEXT]);
        let ocr = SpyOcrEngine {
            unavailable: true,
            ..SpyOcrEngine::default()
        };
        let (runner, _audit) = runner(extractor, ocr);
        let out = tempfile::tempdir().unwrap();
        let report = runner
            .run(job(out.path(), &["a.pdf", "skan.pdf", "c.pdf"]), &RecordingObserver::default())
            .await;

        assert!(report.results[0].succeeded());
        assert_eq!(report.results[1].outcome.error_kind(), Some(ErrorKind::OcrUnavailable));
        assert_eq!(report.results[2].outcome, Outcome::Cancelled);
        assert!(report.summary.aborted.is_some());
    }

    #[tokio::test]
    async fn unreadable_scan_fails_only_its_own_file() {
        let extractor = FakeExtractor::default()
            .with_doc(Path::new("/in/skan1.pdf"), &[""])
            .with_doc(Path::new("/in/skan2.pdf"), &[""]);
        let ocr = SpyOcrEngine {
            fail_on_call: Some(0),
            ..SpyOcrEngine::with_texts(&["", "druga strona"])
        };
        let (runner, audit) = runner(extractor, ocr);
        let out = tempfile::tempdir().unwrap();
        let report = runner
            .run(job(out.path(), &["skan1.pdf", "skan2.pdf"]), &RecordingObserver::default())
            .await;

        assert_eq!(report.results[0].outcome.error_kind(), Some(ErrorKind::OcrFailed));
        assert!(report.results[1].succeeded());
        assert!(report.summary.aborted.is_none());
        assert!(!out.path().join("skan1.txt").exists());
        assert_eq!(
            std::fs::read_to_string(out.path().join("skan2.txt")).unwrap(),
            "druga strona"
        );
        assert_eq!(audit.records.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn spawned_batches_stream_events_and_return_a_report() -> Result<()> {
        let extractor = FakeExtractor::default()
            .with_doc(Path::new("/in/a.pdf"), &[TEXT])
            .with_doc(Path::new("/in/b.pdf"), &[""]);
        let (runner, _audit) = runner(extractor, SpyOcrEngine::with_texts(&["skan"]));
        let out = tempfile::tempdir()?;
        let mut handle = runner.spawn(job(out.path(), &["a.pdf", "b.pdf"]));

        let mut events = Vec::new();
        while let Some(event) = handle.events.recv().await {
            events.push(event);
        }
        let report = handle.worker.join().await?;
        assert_eq!(events.len(), 2);
        assert!(!events[0].ocr_used);
        assert!(events[1].ocr_used);
        assert_eq!(report.summary.ocr_documents, 1);
        assert_eq!(report.summary.total, 2);
        Ok(())
    }
}
