//! Worker loop: claim, execute with retry, clean up.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use crate::agenda::Agenda;
use crate::error::Severity;

/// Retry knobs for the execution loop. The 5 s delay matches the S3-side
/// throttling horizon; tests shrink it.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Attempts per task, including the first.
    pub max_attempts: u32,
    /// Sleep between retryable attempts.
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { max_attempts: 10, delay: Duration::from_secs(5) }
    }
}

pub(super) fn worker_loop(agenda: &Arc<Agenda>) {
    let policy = agenda.retry_policy();
    while let Some((task, mut segments)) = agenda.claim() {
        let mut fail = true;
        for _attempt in 0..policy.max_attempts {
            let outcome =
                catch_unwind(AssertUnwindSafe(|| task.execute(agenda, &mut segments)));
            match outcome {
                Ok(Ok(())) => {
                    fail = false;
                    break;
                }
                Ok(Err(err)) => match err.severity() {
                    Severity::Info => {
                        tracing::debug!("INFO: {}", err);
                        std::thread::sleep(policy.delay);
                    }
                    Severity::Warn => {
                        tracing::warn!("WARN: {}", err);
                        std::thread::sleep(policy.delay);
                    }
                    Severity::Fatal => {
                        tracing::error!("{}", err);
                        break;
                    }
                },
                Err(_) => {
                    tracing::error!("panic in task: {}", task.describe());
                    break;
                }
            }
        }
        // Return any still-held buffers before the bookkeeping wakeup.
        drop(segments);
        agenda.cleanup(task.class(), fail);
    }
}
