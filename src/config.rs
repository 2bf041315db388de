use std::time::Duration;

/// General config for the client-side invocation engine.
#[derive(Clone, Debug)]
pub struct ClientConfig {
    /// Delay applied before each retry attempt. An attempt failing with a
    /// retryable error retries after `retry_intervals[n]` where `n` is the
    /// number of failures so far; the length bounds the retry count.
    /// Empty disables retries entirely.
    pub retry_intervals: Vec<Duration>,
    /// Default invocation timeout, applied when the target descriptor does
    /// not carry its own. `None` means the invocation waits forever.
    pub invocation_timeout: Option<Duration>,
    /// Log a warning when a user callback panics.
    pub warn_callbacks: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            retry_intervals: vec![Duration::ZERO],
            invocation_timeout: None,
            warn_callbacks: true,
        }
    }
}
