//! Supervised task spawning.
//!
//! A panic inside a supervised task ends only that task. The watcher logs
//! it and bumps a counter; the panic hook installed by `mqgate-logging`
//! has already recorded the payload and backtrace.

use std::future::Future;

use metrics::counter;
use tokio::task::JoinHandle;
use tracing::{debug, error};

use crate::metrics::GATE_TASK_PANICS_TOTAL;

/// Spawn `fut` under a watcher. The returned handle completes when the
/// task does, whether it finished, panicked, or was cancelled.
pub fn supervise<F>(name: &'static str, fut: F) -> JoinHandle<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let task = tokio::spawn(fut);
    tokio::spawn(async move {
        match task.await {
            Ok(()) => {}
            Err(e) if e.is_panic() => {
                counter!(GATE_TASK_PANICS_TOTAL, "task" => name).increment(1);
                error!(task = name, "supervised task panicked");
            }
            Err(e) => debug!(task = name, error = %e, "supervised task cancelled"),
        }
    })
}
