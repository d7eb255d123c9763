//! Limits on the number of concurrent CPU-bound external processes.

use std::sync::LazyLock;

use tokio::sync::Semaphore;

use crate::prelude::*;

/// One permit per core, shared by every `pdftocairo`, `pdftotext` and
/// `tesseract` process we start.
static CPU_SEMAPHORE: LazyLock<Semaphore> =
    LazyLock::new(|| Semaphore::new(num_cpus::get()));

/// Call an async function while holding a permit from the CPU semaphore.
///
/// A batch only has one document in flight, but tests and future callers may
/// run several runners side by side, and each `tesseract` process will happily
/// eat a whole core.
#[instrument(level = "trace", skip_all)]
pub async fn with_cpu_semaphore<Func, Fut, R>(f: Func) -> Result<R>
where
    Func: FnOnce() -> Fut,
    Fut: Future<Output = R>,
{
    let permit = CPU_SEMAPHORE
        .acquire()
        .await
        .context("Could not acquire CPU permit")?;
    let result = f().await;
    drop(permit);
    Ok(result)
}
