use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use super::{SshError, SshRetryPolicy};

const MAX_RETRY_DELAY: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetrySettings {
    pub attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            attempts: 5,
            base_delay: Duration::from_secs(1),
        }
    }
}

impl RetrySettings {
    fn attempts_for(self, policy: SshRetryPolicy) -> u32 {
        match policy {
            SshRetryPolicy::ProhibitRetries => 1,
            SshRetryPolicy::AllowRetries => self.attempts.max(1),
        }
    }

    /// Exponential backoff capped at thirty seconds, plus up to half the base delay of jitter.
    fn delay_for(self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        let backoff = self
            .base_delay
            .saturating_mul(1_u32 << exponent)
            .min(MAX_RETRY_DELAY);

        let jitter_ceiling = u64::try_from(self.base_delay.as_millis() / 2).unwrap_or(u64::MAX);
        let jitter = if jitter_ceiling == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..=jitter_ceiling)
        };

        backoff + Duration::from_millis(jitter)
    }
}

/// Runs `operation` until it succeeds, fails with a non-retryable error or the policy's
/// attempts run out. Waiting between attempts stops early on cancellation.
///
/// # Errors
/// Returns the last error produced by `operation`, or [`SshError::Cancelled`].
pub async fn with_retries<T, F, Fut>(
    policy: SshRetryPolicy,
    settings: RetrySettings,
    cancellation: &CancellationToken,
    command: &str,
    mut operation: F,
) -> Result<T, SshError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, SshError>>,
{
    let attempts = settings.attempts_for(policy);
    let mut attempt = 1;

    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(error) if !error.is_retryable() || attempt >= attempts => return Err(error),
            Err(error) => {
                let delay = settings.delay_for(attempt);
                warn!(
                    command,
                    attempt,
                    attempts,
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    error = %error,
                    "ssh command failed, retrying"
                );

                tokio::select! {
                    () = cancellation.cancelled() => {
                        return Err(SshError::Cancelled {
                            command: command.to_string(),
                        });
                    }
                    () = tokio::time::sleep(delay) => {}
                }

                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    fn fast() -> RetrySettings {
        RetrySettings {
            attempts: 3,
            base_delay: Duration::from_millis(1),
        }
    }

    fn failure() -> SshError {
        SshError::CommandFailed {
            command: "uptime".to_string(),
            exit_code: 1,
            text: "not yet".to_string(),
        }
    }

    #[tokio::test]
    async fn allow_retries_runs_until_success() {
        let counter = AtomicU32::new(0);
        let calls = &counter;

        let result = with_retries(
            SshRetryPolicy::AllowRetries,
            fast(),
            &CancellationToken::new(),
            "uptime",
            move || async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(failure())
                } else {
                    Ok("ready")
                }
            },
        )
        .await;

        assert_eq!(result.expect("should succeed"), "ready");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn allow_retries_gives_up_after_configured_attempts() {
        let counter = AtomicU32::new(0);
        let calls = &counter;

        let result: Result<(), SshError> = with_retries(
            SshRetryPolicy::AllowRetries,
            fast(),
            &CancellationToken::new(),
            "uptime",
            move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(failure())
            },
        )
        .await;

        assert!(matches!(result, Err(SshError::CommandFailed { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn prohibit_retries_runs_once() {
        let counter = AtomicU32::new(0);
        let calls = &counter;

        let result: Result<(), SshError> = with_retries(
            SshRetryPolicy::ProhibitRetries,
            fast(),
            &CancellationToken::new(),
            "docker-compose up",
            move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(failure())
            },
        )
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cancellation_stops_waiting_between_attempts() {
        let cancellation = CancellationToken::new();
        cancellation.cancel();

        let result: Result<(), SshError> = with_retries(
            SshRetryPolicy::AllowRetries,
            RetrySettings {
                attempts: 10,
                base_delay: Duration::from_secs(60),
            },
            &cancellation,
            "uptime",
            || async { Err(failure()) },
        )
        .await;

        assert!(matches!(result, Err(SshError::Cancelled { .. })));
    }

    #[test]
    fn delay_grows_and_is_capped() {
        let settings = RetrySettings {
            attempts: 10,
            base_delay: Duration::from_secs(4),
        };

        assert!(settings.delay_for(1) >= Duration::from_secs(4));
        assert!(settings.delay_for(2) >= Duration::from_secs(8));
        assert!(settings.delay_for(12) <= MAX_RETRY_DELAY + Duration::from_secs(2));
    }
}
