//! Per-item progress notifications.

use tokio::sync::mpsc;

use crate::{
    convert::{ConversionResult, OutcomeStatus},
    errors::ErrorKind,
    prelude::*,
};

/// Sent after every item in a batch, in order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProgressEvent {
    pub index: usize,
    pub total: usize,
    pub file_name: String,
    pub outcome: OutcomeStatus,
    pub ocr_used: bool,
    pub error_kind: Option<ErrorKind>,
    pub reason: Option<String>,
    pub output_path: Option<PathBuf>,
    pub format_downgraded: bool,
}

impl ProgressEvent {
    pub fn from_result(index: usize, total: usize, result: &ConversionResult) -> Self {
        Self {
            index,
            total,
            file_name: result.file_name(),
            outcome: result.outcome.status(),
            ocr_used: result.ocr_used(),
            error_kind: result.outcome.error_kind(),
            reason: result.outcome.reason().map(str::to_owned),
            output_path: result.output_path.clone(),
            format_downgraded: matches!(
                result.outcome,
                crate::convert::Outcome::Succeeded {
                    format_downgraded: true
                }
            ),
        }
    }
}

/// Receives progress notifications from a running batch.
///
/// Called on the batch worker, so implementations must return quickly.
pub trait ProgressObserver: Send + Sync {
    fn item_finished(&self, event: &ProgressEvent);
}

/// Forwards events over a channel, for a foreground task to drain.
pub struct ChannelObserver {
    tx: mpsc::UnboundedSender<ProgressEvent>,
}

impl ChannelObserver {
    /// Create an observer and the matching receiver.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ProgressEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl ProgressObserver for ChannelObserver {
    fn item_finished(&self, event: &ProgressEvent) {
        // A foreground that stopped listening is not our problem.
        if self.tx.send(event.clone()).is_err() {
            trace!(index = event.index, "Progress receiver dropped");
        }
    }
}
