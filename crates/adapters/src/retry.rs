use std::thread;
use std::time::Duration;

use log::warn;

use storyforge_core::LlmConfig;

use crate::error::{AdapterError, ErrorClass};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryConfig {
    /// Total attempts, the first one included.
    pub max_attempts: usize,
    pub backoff: Duration,
}

impl RetryConfig {
    pub const fn new(max_attempts: usize, backoff: Duration) -> Self {
        Self {
            max_attempts,
            backoff,
        }
    }

    pub fn from_profile(profile: &LlmConfig) -> Self {
        Self::new(
            profile.max_attempts.max(1),
            Duration::from_secs(profile.backoff_secs),
        )
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            backoff: Duration::from_secs(10),
        }
    }
}

/// Calls `f` with the 1-based attempt number until it succeeds, a fatal
/// error comes back, or the attempts run out.
pub fn call_with_retry<F, T>(
    label: &str,
    mut f: F,
    config: &RetryConfig,
) -> Result<T, AdapterError>
where
    F: FnMut(usize) -> Result<T, AdapterError>,
{
    let max_attempts = config.max_attempts.max(1);
    let mut last_error: Option<AdapterError> = None;

    for attempt in 1..=max_attempts {
        let err = match f(attempt) {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };

        let class = err.class();
        warn!(
            "[{}] attempt {}/{} failed ({:?}): {}",
            label, attempt, max_attempts, class, err
        );

        match class {
            ErrorClass::Fatal => return Err(err),
            ErrorClass::Backoff if attempt < max_attempts => {
                let delay = err
                    .retry_after()
                    .map_or(config.backoff, |hint| hint.max(config.backoff));
                thread::sleep(delay);
            }
            ErrorClass::Backoff | ErrorClass::Resample => {}
        }
        last_error = Some(err);
    }

    let err = last_error.unwrap_or(AdapterError::EmptyResponse);
    Err(AdapterError::retry_exhausted(max_attempts, err))
}
