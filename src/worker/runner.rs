//! Runs one execution of a worker.

use futures::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::time::Duration;

use super::registry::WorkerKind;
use super::{WorkContext, WorkResult};

/// How an execution ended.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum ExecutionOutcome {
    /// The worker returned a result.
    Completed(WorkResult),
    /// The stop signal fired before the worker returned.
    Stopped,
    /// The worker panicked.
    Panicked(String),
    /// The remote side could not deliver a result.
    Lost(String),
}

/// Run a worker to completion or until its stop signal fires.
///
/// Blocking workers are not interrupted; they are expected to notice the
/// stop signal themselves.
pub(crate) async fn execute(
    kind: WorkerKind,
    ctx: WorkContext,
    remote_timeout: Duration,
) -> ExecutionOutcome {
    let stop = ctx.stop_signal().clone();

    match kind {
        WorkerKind::Async(worker) => {
            let work = AssertUnwindSafe(async move { worker.do_work(ctx).await }).catch_unwind();
            tokio::select! {
                result = work => match result {
                    Ok(result) => ExecutionOutcome::Completed(result),
                    Err(panic) => ExecutionOutcome::Panicked(panic_message(panic)),
                },
                _ = stop.stopped() => ExecutionOutcome::Stopped,
            }
        }
        WorkerKind::Blocking(worker) => {
            match tokio::task::spawn_blocking(move || worker.do_work(ctx)).await {
                Ok(result) => ExecutionOutcome::Completed(result),
                Err(e) if e.is_panic() => ExecutionOutcome::Panicked(panic_message(e.into_panic())),
                Err(e) => ExecutionOutcome::Lost(e.to_string()),
            }
        }
        WorkerKind::Remote(worker) => {
            tokio::select! {
                result = worker.run(&ctx, remote_timeout) => match result {
                    Ok(result) => ExecutionOutcome::Completed(result),
                    Err(e) => ExecutionOutcome::Lost(e.to_string()),
                },
                _ = stop.stopped() => ExecutionOutcome::Stopped,
            }
        }
    }
}

fn panic_message(panic: Box<dyn Any + Send>) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
