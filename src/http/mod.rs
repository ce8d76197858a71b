//! Blocking HTTP plumbing shared by the Ollama and OpenAI-compatible clients.

use std::time::Duration;

use anyhow::Result;
use tracing::{debug, error, warn};

const EXPONENTIAL_BACKOFF_BASE: u32 = 2;

/// Build a `ureq` agent with a bounded global timeout.
///
/// Non-2xx statuses are kept as errors so [`with_retry`] can classify them.
#[inline]
pub fn agent(timeout: Duration) -> ureq::Agent {
    ureq::Agent::config_builder()
        .timeout_global(Some(timeout))
        .build()
        .into()
}

/// Run `request_fn` up to `attempts` times with exponential backoff.
///
/// Server errors and transport failures are retried, client errors (4xx) and
/// everything else fail immediately. `target` only labels log lines.
#[inline]
pub fn with_retry<F>(
    target: &str,
    attempts: u32,
    backoff: Duration,
    mut request_fn: F,
) -> Result<String>
where
    F: FnMut() -> Result<String, ureq::Error>,
{
    let attempts = attempts.max(1);
    let mut last_error = None;

    for attempt in 1..=attempts {
        debug!("HTTP request attempt {}/{} to {}", attempt, attempts, target);

        match request_fn() {
            Ok(response_text) => {
                debug!("Request succeeded on attempt {}", attempt);
                return Ok(response_text);
            }
            Err(error) => {
                match &error {
                    ureq::Error::StatusCode(status) if *status >= 500 => {
                        warn!(
                            "Server error (status {}), attempt {}/{}",
                            status, attempt, attempts
                        );
                    }
                    ureq::Error::StatusCode(status) => {
                        warn!("Client error (status {}), not retrying", status);
                        return Err(anyhow::anyhow!("Client error: HTTP {}", status));
                    }
                    ureq::Error::ConnectionFailed
                    | ureq::Error::HostNotFound
                    | ureq::Error::Timeout(_)
                    | ureq::Error::Io(_) => {
                        warn!(
                            "Transport error: {}, attempt {}/{}",
                            error, attempt, attempts
                        );
                    }
                    _ => {
                        warn!("Non-retryable error: {}", error);
                        return Err(anyhow::anyhow!("Non-retryable error: {}", error));
                    }
                }

                last_error = Some(anyhow::anyhow!("Request error: {}", error));

                if attempt < attempts {
                    let delay =
                        backoff.saturating_mul(EXPONENTIAL_BACKOFF_BASE.saturating_pow(attempt - 1));
                    debug!("Waiting {:?} before retry", delay);
                    std::thread::sleep(delay);
                }
            }
        }
    }

    error!("All retry attempts failed for request to {}", target);

    Err(last_error.unwrap_or_else(|| anyhow::anyhow!("Request failed after retries")))
}
