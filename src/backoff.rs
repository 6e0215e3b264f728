//! Bounded fixed-interval polling and timeout guards.

use std::future::Future;
use std::time::Duration;

use anyhow::{Result, anyhow};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Why a poll loop gave up.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WaitError {
    #[error("not ready after {attempts} attempt(s){}", last_error_suffix(.last_error))]
    Exhausted {
        attempts: u32,
        last_error: Option<String>,
    },

    #[error("cancelled after {attempts} attempt(s)")]
    Cancelled { attempts: u32 },
}

fn last_error_suffix(last_error: &Option<String>) -> String {
    last_error
        .as_ref()
        .map(|e| format!(" (last error: {e})"))
        .unwrap_or_default()
}

/// Poll a probe at a fixed interval, at most `max_attempts` times.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub interval: Duration,
    pub max_attempts: u32,
}

impl Backoff {
    pub const fn new(interval: Duration, max_attempts: u32) -> Self {
        Self {
            interval,
            max_attempts,
        }
    }

    /// Upper bound of the time spent sleeping between attempts.
    pub fn budget(&self) -> Duration {
        self.interval * self.max_attempts.saturating_sub(1)
    }

    /// Run `probe` until it reports ready.
    ///
    /// A probe error counts as "not ready yet"; the last one is kept for the
    /// exhaustion report. When `cancel` is given, cancellation is observed
    /// while sleeping between attempts. Returns the number of attempts used.
    pub async fn poll<F, Fut>(
        &self,
        cancel: Option<&CancellationToken>,
        mut probe: F,
    ) -> Result<u32, WaitError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<bool>>,
    {
        let mut last_error = None;

        for attempt in 1..=self.max_attempts {
            match probe(attempt).await {
                Ok(true) => return Ok(attempt),
                Ok(false) => {}
                Err(e) => last_error = Some(e.to_string()),
            }

            if attempt == self.max_attempts {
                break;
            }

            match cancel {
                Some(token) => {
                    tokio::select! {
                        () = token.cancelled() => {
                            return Err(WaitError::Cancelled { attempts: attempt });
                        }
                        () = tokio::time::sleep(self.interval) => {}
                    }
                }
                None => tokio::time::sleep(self.interval).await,
            }
        }

        Err(WaitError::Exhausted {
            attempts: self.max_attempts,
            last_error,
        })
    }
}

/// Await `fut`, failing with a timeout error once `limit` elapses.
pub async fn deadline<T, F>(limit: Duration, what: &str, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    tokio::time::timeout(limit, fut)
        .await
        .unwrap_or_else(|_| Err(anyhow!("{what} timed out after {limit:?}")))
}
