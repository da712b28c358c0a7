use backoff::{backoff::Backoff, ExponentialBackoff};
use slog::{debug, info, Logger};
use std::{fmt::Debug, thread, time::Duration};

/// Parameters for the retry loop wrapped around outbound cloud calls. The
/// base delay grows exponentially (with jitter) up to `max_interval`; the
/// loop gives up after `max_attempts` total calls.
#[derive(Clone, Copy, Debug)]
pub struct RetryPolicy {
    pub initial_interval: Duration,
    pub max_interval: Duration,
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        // AWS does not publish specific guidance on retry intervals; the GCP
        // SDKs use a 1s initial interval doubling to a 30s cap, and cite AWS
        // blog posts, so the same parameters are probably fine for both.
        RetryPolicy {
            initial_interval: Duration::from_secs(1),
            max_interval: Duration::from_secs(30),
            max_attempts: 3,
        }
    }
}

/// Executes the provided action `f`, retrying under `RetryPolicy::default()`
/// if the error returned by `f` is deemed retryable by `is_retryable`. On
/// success, returns the value returned by `f`. On failure, returns the error
/// returned by the last attempt to call `f`. Retryable failures are logged
/// using the provided logger.
pub(crate) fn retry_request<F, T, E, R>(logger: &Logger, f: F, is_retryable: R) -> Result<T, E>
where
    F: FnMut() -> Result<T, E>,
    R: FnMut(&E) -> bool,
    E: Debug,
{
    retry_request_with_policy(logger, RetryPolicy::default(), f, is_retryable)
}

/// Version of `retry_request` with an explicit policy, for callers with their
/// own base delay or attempt budget.
pub(crate) fn retry_request_with_policy<F, T, E, R>(
    logger: &Logger,
    policy: RetryPolicy,
    mut f: F,
    mut is_retryable: R,
) -> Result<T, E>
where
    F: FnMut() -> Result<T, E>,
    R: FnMut(&E) -> bool,
    E: Debug,
{
    let mut backoff = ExponentialBackoff {
        initial_interval: policy.initial_interval,
        max_interval: policy.max_interval,
        multiplier: 2.0,
        // Attempts are bounded by the policy's counter, not by elapsed time
        max_elapsed_time: None,
        ..Default::default()
    };

    let mut attempt: u32 = 1;
    loop {
        match f() {
            Ok(value) => return Ok(value),
            Err(error) => {
                if !is_retryable(&error) {
                    debug!(logger, "encountered non-retryable error");
                    return Err(error);
                }
                if attempt >= policy.max_attempts {
                    info!(
                        logger, "giving up after retryable error";
                        "attempts" => attempt,
                        "error" => format!("{error:?}"),
                    );
                    return Err(error);
                }
                let delay = backoff.next_backoff().unwrap_or(policy.max_interval);
                info!(
                    logger, "encountered retryable error";
                    "attempt" => attempt,
                    "delay_ms" => delay.as_millis() as u64,
                    "error" => format!("{error:?}"),
                );
                thread::sleep(delay);
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logging::setup_test_logging;

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            initial_interval: Duration::from_millis(1),
            max_interval: Duration::from_millis(2),
            max_attempts,
        }
    }

    #[test]
    fn success() {
        let logger = setup_test_logging();
        let mut counter = 0;
        let f = || -> Result<(), bool> {
            counter += 1;
            Ok(())
        };

        retry_request_with_policy(&logger, fast_policy(3), f, |_| false).unwrap();
        assert_eq!(counter, 1);
    }

    #[test]
    fn retryable_failure() {
        let logger = setup_test_logging();
        let mut counter = 0;
        let f = || -> Result<(), bool> {
            counter += 1;
            if counter == 1 {
                Err(false)
            } else {
                Ok(())
            }
        };

        retry_request_with_policy(&logger, fast_policy(3), f, |_| true).unwrap();
        assert_eq!(counter, 2);
    }

    #[test]
    fn retryable_failure_exhausts_attempts() {
        let logger = setup_test_logging();
        let mut counter = 0;
        let f = || -> Result<(), bool> {
            counter += 1;
            Err(false)
        };

        retry_request_with_policy(&logger, fast_policy(4), f, |_| true).unwrap_err();
        assert_eq!(counter, 4);
    }

    #[test]
    fn unretryable_failure() {
        let logger = setup_test_logging();
        let mut counter = 0;
        let f = || -> Result<(), bool> {
            counter += 1;
            Err(false)
        };

        retry_request_with_policy(&logger, fast_policy(3), f, |_| false).unwrap_err();
        assert_eq!(counter, 1);
    }
}
