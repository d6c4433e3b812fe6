//! Retry logic for the dispatch boundary.
//!
//! Provides error categorization (transient vs permanent) by keyword
//! inspection and exponential backoff with jitter. Only rate-limit, timeout,
//! and network failures are retried; validation and authentication failures
//! never are, and uncategorized errors are treated as non-retryable to avoid
//! retry storms on failures nothing has classified yet.

use std::future::Future;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::{Result, RouterError};

/// Category assigned to a dispatch failure for retry decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Provider throttling (429, quota). Transient.
    RateLimit,
    /// Request or connection deadline exceeded. Transient.
    Timeout,
    /// Connection/DNS/transport failure. Transient.
    Network,
    /// Malformed request; retrying cannot help.
    Validation,
    /// Credential failure; retrying cannot help.
    Authentication,
    /// Response could not be parsed.
    Parsing,
    /// Nothing matched. Non-retryable by default.
    Unknown,
}

impl ErrorCategory {
    /// Whether a failure of this category may succeed on retry.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            ErrorCategory::RateLimit | ErrorCategory::Timeout | ErrorCategory::Network
        )
    }
}

/// Categorize raw error text by keyword inspection.
pub fn categorize_error(message: &str) -> ErrorCategory {
    let msg = message.to_lowercase();

    if msg.contains("rate limit")
        || msg.contains("too many requests")
        || msg.contains("429")
        || msg.contains("quota")
    {
        return ErrorCategory::RateLimit;
    }

    if msg.contains("timeout") || msg.contains("timed out") || msg.contains("deadline exceeded") {
        return ErrorCategory::Timeout;
    }

    if msg.contains("connection")
        || msg.contains("network")
        || msg.contains("dns")
        || msg.contains("503")
        || msg.contains("service unavailable")
        || msg.contains("502")
        || msg.contains("bad gateway")
    {
        return ErrorCategory::Network;
    }

    if msg.contains("401")
        || msg.contains("unauthorized")
        || msg.contains("invalid api key")
        || msg.contains("authentication")
        || msg.contains("403")
        || msg.contains("forbidden")
    {
        return ErrorCategory::Authentication;
    }

    if msg.contains("400")
        || msg.contains("bad request")
        || msg.contains("invalid request")
        || msg.contains("validation")
    {
        return ErrorCategory::Validation;
    }

    if msg.contains("parse") || msg.contains("malformed") || msg.contains("unexpected token") {
        return ErrorCategory::Parsing;
    }

    ErrorCategory::Unknown
}

/// Categorize a router error. Budget and circuit conditions are never
/// retried at this layer; only dispatcher failures go through keyword
/// inspection.
pub fn categorize_router_error(error: &RouterError) -> ErrorCategory {
    match error {
        RouterError::DispatchFailed(msg) => categorize_error(msg),
        RouterError::BudgetExceeded { .. } | RouterError::NoAffordableCandidate { .. } => {
            ErrorCategory::Validation
        }
        _ => ErrorCategory::Unknown,
    }
}

/// Retry strategy configuration.
#[derive(Debug, Clone, Copy, serde::Serialize, serde::Deserialize)]
pub struct RetryConfig {
    /// Maximum number of retry attempts after the initial try.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Initial backoff delay in milliseconds.
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,

    /// Maximum backoff delay in milliseconds.
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,

    /// Whether to add random jitter to backoff delays.
    #[serde(default = "default_jitter")]
    pub jitter: bool,
}

fn default_max_retries() -> u32 {
    3
}

fn default_initial_backoff_ms() -> u64 {
    1000
}

fn default_max_backoff_ms() -> u64 {
    60_000
}

fn default_jitter() -> bool {
    true
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            jitter: default_jitter(),
        }
    }
}

impl RetryConfig {
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            ..Default::default()
        }
    }

    pub fn with_initial_backoff(mut self, ms: u64) -> Self {
        self.initial_backoff_ms = ms;
        self
    }

    pub fn with_max_backoff(mut self, ms: u64) -> Self {
        self.max_backoff_ms = ms;
        self
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Backoff delay for a given attempt: `initial * 2^attempt`, capped, plus
    /// up to 25% jitter when enabled.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let delay_ms =
            (self.initial_backoff_ms as f64 * 2.0_f64.powi(attempt as i32)) as u64;
        let delay_ms = delay_ms.min(self.max_backoff_ms);
        let delay_ms = if self.jitter {
            let jitter_amount = (delay_ms as f64 * 0.25 * rand::random::<f64>()) as u64;
            delay_ms + jitter_amount
        } else {
            delay_ms
        };
        Duration::from_millis(delay_ms)
    }
}

/// Execute an async operation with retry on transient failures.
///
/// Non-retryable categories return immediately with the underlying error;
/// exhausting all attempts returns [`RouterError::RetriesExhausted`].
pub async fn retry_with_backoff<F, Fut, T>(
    config: &RetryConfig,
    operation_name: &str,
    mut f: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut last_error: Option<RouterError> = None;

    for attempt in 0..=config.max_retries {
        if attempt > 0 {
            info!(
                operation = operation_name,
                attempt = attempt,
                max_retries = config.max_retries,
                "retrying operation"
            );
        }

        match f().await {
            Ok(result) => {
                if attempt > 0 {
                    info!(
                        operation = operation_name,
                        attempt = attempt,
                        "operation succeeded after retry"
                    );
                }
                return Ok(result);
            }
            Err(e) => {
                let category = categorize_router_error(&e);
                debug!(
                    operation = operation_name,
                    attempt = attempt,
                    error = %e,
                    category = ?category,
                    "operation failed"
                );

                if !category.is_retryable() {
                    error!(
                        operation = operation_name,
                        error = %e,
                        category = ?category,
                        "non-retryable error, aborting"
                    );
                    return Err(e);
                }

                last_error = Some(e);

                if attempt < config.max_retries {
                    let delay = config.backoff_delay(attempt);
                    warn!(
                        operation = operation_name,
                        attempt = attempt,
                        delay_ms = delay.as_millis() as u64,
                        "transient error, will retry after delay"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    Err(RouterError::RetriesExhausted {
        attempts: config.max_retries + 1,
        last_error: last_error
            .map(|e| e.to_string())
            .unwrap_or_else(|| "unknown".to_string()),
    })
}
