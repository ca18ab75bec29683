// Background task supervision
//
// A supervised task is restarted with exponential backoff whenever it
// returns an error, and stops for good once it returns `Ok` or the shutdown
// token fires.

use std::future::Future;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    pub initial: Duration,
    pub max: Duration,
}

impl Backoff {
    pub const fn fixed(delay: Duration) -> Self {
        Self { initial: delay, max: delay }
    }

    fn next(&self, current: Duration) -> Duration {
        (current * 2).min(self.max)
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self { initial: Duration::from_secs(2), max: Duration::from_secs(30) }
    }
}

pub fn spawn_supervised<F, Fut>(
    name: &'static str,
    shutdown: CancellationToken,
    backoff: Backoff,
    mut task: F,
) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    tokio::spawn(async move {
        let mut delay = backoff.initial;
        loop {
            let started = Instant::now();
            let result = tokio::select! {
                _ = shutdown.cancelled() => break,
                result = task() => result,
            };

            match result {
                Ok(()) => {
                    tracing::debug!(task = name, "Task finished");
                    break;
                }
                Err(e) => {
                    // A run that outlived the longest backoff counts as healthy.
                    if started.elapsed() > backoff.max {
                        delay = backoff.initial;
                    }
                    tracing::warn!(task = name, error = %e, retry_in = ?delay, "Task failed, restarting");
                }
            }

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
            delay = backoff.next(delay);
        }
        tracing::debug!(task = name, "Supervisor stopped");
    })
}
