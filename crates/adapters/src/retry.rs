use std::thread;
use std::time::Duration;

use log::warn;

use crate::error::AdapterError;

#[derive(Clone, Copy, Debug)]
pub struct RetryConfig {
    pub max_retries: usize,
    pub sleep: Duration,
}

impl RetryConfig {
    pub const fn new(max_retries: usize, sleep: Duration) -> Self {
        Self { max_retries, sleep }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            sleep: Duration::from_secs(2),
        }
    }
}

/// Runs `f` up to `max_retries` times, sleeping between failures. Only used
/// for idempotent metadata calls; generation surfaces every failure.
pub fn call_with_retry<F, T>(mut f: F, config: &RetryConfig) -> Result<T, AdapterError>
where
    F: FnMut() -> Result<T, AdapterError>,
{
    let attempts = config.max_retries.max(1);
    let mut last_error: Option<AdapterError> = None;

    for attempt in 1..=attempts {
        match f() {
            Ok(value) => return Ok(value),
            Err(err) => {
                warn!("[call_with_retry] attempt {attempt}/{attempts} failed: {err}");
                if attempt < attempts {
                    thread::sleep(config.sleep);
                }
                last_error = Some(err);
            }
        }
    }

    let err = last_error.unwrap_or(AdapterError::EmptyResponse);
    Err(AdapterError::retry_exhausted(attempts, err))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn retries_until_success() {
        let calls = Cell::new(0);
        let config = RetryConfig::new(3, Duration::ZERO);
        let value = call_with_retry(
            || {
                calls.set(calls.get() + 1);
                if calls.get() < 3 {
                    Err(AdapterError::EmptyResponse)
                } else {
                    Ok(calls.get())
                }
            },
            &config,
        )
        .unwrap();
        assert_eq!(value, 3);
    }

    #[test]
    fn exhaustion_wraps_last_error() {
        let config = RetryConfig::new(2, Duration::ZERO);
        let err = call_with_retry::<_, ()>(|| Err(AdapterError::EmptyResponse), &config)
            .unwrap_err();
        assert!(matches!(
            err,
            AdapterError::RetryExhausted { attempts: 2, .. }
        ));
    }
}
