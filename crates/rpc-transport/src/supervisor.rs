//! The respawn rule both [`Server`](../rpc_server)'s and [`Client`](../rpc_client)'s
//! `serve()` apply to their two cooperating tasks: wait for either to
//! finish; an error respawns it; a clean finish just waits out the other one.
//!
//! The original supervisor respawned forever. Per the design notes this
//! version bounds the retries and gives up loudly instead — see
//! `DESIGN.md` for why.

use std::future::Future;
use std::time::Duration;

use tokio::task::JoinHandle;

/// Retries exhausted before a supervised task is allowed to die for good.
pub const DEFAULT_MAX_RETRIES: u32 = 8;

/// Runs `make_task()` under the shared supervision rule: a task that finishes
/// with `Err` is logged and relaunched (up to `max_retries` times, with
/// exponential backoff capped at a few seconds); a task that finishes `Ok`
/// is left finished. Returns a handle that resolves once the task has
/// either exited cleanly or exhausted its retries.
pub fn supervise<F, Fut>(label: &'static str, max_retries: u32, mut make_task: F) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    tokio::spawn(async move {
        let mut attempt = 0u32;
        loop {
            match make_task().await {
                Ok(()) => {
                    tracing::debug!(task = label, "supervised task exited cleanly");
                    return;
                }
                Err(err) => {
                    attempt += 1;
                    if attempt > max_retries {
                        tracing::error!(
                            task = label,
                            %err,
                            attempt,
                            "supervised task failed repeatedly, giving up"
                        );
                        return;
                    }
                    let backoff = Duration::from_millis(50 * 2u64.pow(attempt.min(6)));
                    tracing::error!(task = label, %err, attempt, ?backoff, "supervised task failed, respawning");
                    tokio::time::sleep(backoff).await;
                }
            }
        }
    })
}
