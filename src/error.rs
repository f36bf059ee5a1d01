use std::time::Duration;

use thiserror::Error;

/// Every failure the mail pipeline can surface.
///
/// Callers decide between retrying, skipping and halting with
/// [`MailError::is_retryable`] and [`MailError::is_skippable`].
#[derive(Debug, Error)]
pub enum MailError {
    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("rate limited by the mail service")]
    RateLimit { retry_after: Option<Duration> },

    #[error("message {0} not found")]
    NotFound(String),

    #[error("malformed message: {0}")]
    Malformed(String),

    /// Carries the deadline when it is ours rather than the HTTP stack's.
    #[error("request timed out{}", after(.0))]
    Timeout(Option<Duration>),

    #[error("transient network error: {0}")]
    TransientNetwork(String),

    #[error("mail service returned HTTP {status}: {message}")]
    Api { status: u16, message: String },

    #[error("credential store error: {0}")]
    Store(String),

    #[error("configuration error: {0}")]
    Config(String),
}

impl MailError {
    /// Errors worth another attempt after a backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            MailError::RateLimit { .. } | MailError::Timeout(_) | MailError::TransientNetwork(_)
        )
    }

    /// Errors that mean "this one message is unusable", never the whole run.
    pub fn is_skippable(&self) -> bool {
        matches!(self, MailError::NotFound(_) | MailError::Malformed(_))
    }

    pub fn is_auth(&self) -> bool {
        matches!(self, MailError::Auth(_))
    }
}

fn after(deadline: &Option<Duration>) -> String {
    deadline
        .map(|d| format!(" after {:?}", d))
        .unwrap_or_default()
}

impl From<reqwest::Error> for MailError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            MailError::Timeout(None)
        } else if err.is_decode() {
            MailError::Malformed(err.to_string())
        } else if let Some(status) = err.status() {
            MailError::Api {
                status: status.as_u16(),
                message: err.to_string(),
            }
        } else {
            MailError::TransientNetwork(err.to_string())
        }
    }
}

impl From<keyring::Error> for MailError {
    fn from(err: keyring::Error) -> Self {
        MailError::Store(err.to_string())
    }
}
