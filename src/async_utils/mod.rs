//! Asynchronous utilities for use with Tokio.
//!
//! The conversion pipeline is mostly external processes and CPU-bound pixel
//! work, so the helpers here are about running those without blocking the
//! executor, and about joining the background batch worker.

use std::{io, pin::Pin, process::Output};

use tokio::{process::Command, task::JoinHandle};

use crate::prelude::*;

/// A type alias for a boxed future. This is used to make it easier to work with
/// with complex futures.
pub type BoxedFuture<Output> = Pin<Box<dyn Future<Output = Output> + Send>>;

/// A handle for a background worker. This can be awaited to wait for the
/// worker to complete normally.
pub struct JoinWorker<T = ()> {
    /// The task handle.
    future: BoxedFuture<Result<T>>,
}

impl<T: Send + 'static> JoinWorker<T> {
    /// Create a new worker handle from a [`JoinHandle`].
    pub fn from_handle(handle: JoinHandle<T>) -> Self {
        Self {
            future: Box::pin(async move { handle.await.context("could not join task") }),
        }
    }

    /// Wait for the worker to complete.
    pub async fn join(self) -> Result<T> {
        self.future.await
    }
}

/// Wrapper around [`tokio::task::spawn_blocking`] that propagates panics from
/// the background task.
pub async fn spawn_blocking_propagating_panics<F, T>(f: F) -> T
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    match tokio::task::spawn_blocking(f).await {
        Ok(value) => value,
        // Propagate any panics from the blocking task.
        Err(err) => std::panic::resume_unwind(err.into_panic()),
    }
}

/// How did an external command fail to run?
#[derive(Debug)]
pub enum CommandError {
    /// The binary could not be found on `PATH`.
    NotInstalled(String),
    /// The binary ran, but reported a failure.
    Failed(anyhow::Error),
}

/// Run an external command to completion, capturing its output.
///
/// A missing binary is reported separately, because that means the toolchain
/// is broken rather than the input.
pub async fn run_command(
    command_name: &str,
    cmd: &mut Command,
    is_error_line: Option<fn(&str) -> bool>,
) -> Result<Output, CommandError> {
    let output = match cmd.output().await {
        Ok(output) => output,
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            return Err(CommandError::NotInstalled(command_name.to_owned()));
        }
        Err(err) => {
            return Err(CommandError::Failed(
                anyhow::Error::new(err).context(format!("cannot run {}", command_name)),
            ));
        }
    };
    check_for_command_failure(command_name, &output, is_error_line)
        .map_err(CommandError::Failed)?;
    Ok(output)
}

/// Report any command failures, and include any error output.
///
/// The output of standard error and standard output will be logged at
/// appropriate levels. And each line of standard error may be optionally
/// checked with `is_error_line` to determine if the command failed.
pub fn check_for_command_failure(
    command_name: &str,
    output: &Output,
    is_error_line: Option<fn(&str) -> bool>,
) -> Result<()> {
    let stderr = String::from_utf8_lossy(&output.stderr);
    trace!(
        command_name = command_name,
        bytes = output.stdout.len(),
        "Standard output from command"
    );
    if !stderr.trim().is_empty() {
        debug!(
            command_name = command_name,
            output = %stderr,
            "Standard error from command",
        );
    }

    if output.status.success() {
        if let Some(is_error_line) = is_error_line {
            if stderr.lines().any(is_error_line) {
                return Err(anyhow!(
                    "{} printed error output:\n{}",
                    command_name,
                    stderr,
                ));
            }
        }
        Ok(())
    } else if let Some(exit_code) = output.status.code() {
        Err(anyhow!(
            "{} failed with exit code {} and error output:\n{}",
            command_name,
            exit_code,
            stderr,
        ))
    } else {
        Err(anyhow!(
            "{} failed with error output:\n{}",
            command_name,
            stderr,
        ))
    }
}
