//! Batch retrieval: sequential listing, bounded concurrent fetching, parsing.
//!
//! Failures stay per message. Only an authentication failure (after the
//! client's re-authentication cycle) or a listing that cannot be completed
//! halts the run; the summary is produced either way.

use futures::stream::{self, StreamExt};
use log::{debug, info, warn};
use rand::Rng;
use serde::Serialize;
use std::collections::HashSet;
use std::fmt;
use std::time::Duration;

use crate::email_content;
use crate::error::MailError;
use crate::gmail_api::{MailApi, MessagePages};
use crate::models::{MessageReference, ParsedMessage, RawMessage};

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(8),
        }
    }
}

impl RetryPolicy {
    /// Exponential delay with up to 50% jitter; a longer `Retry-After` wins.
    pub fn delay_for(&self, attempt: u32, error: &MailError) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        let backoff = self
            .base_delay
            .saturating_mul(1u32 << exponent)
            .min(self.max_delay);

        let max_jitter = (backoff.as_millis() / 2) as u64;
        let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..=max_jitter));
        let delay = backoff + jitter;

        match error {
            MailError::RateLimit {
                retry_after: Some(retry_after),
            } if *retry_after > delay => *retry_after,
            _ => delay,
        }
    }
}

#[derive(Debug, Clone)]
pub struct BatchOptions {
    pub query: String,
    pub limit: Option<usize>,
    pub concurrency: usize,
    pub retry: RetryPolicy,
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self {
            query: String::new(),
            limit: None,
            concurrency: 4,
            retry: RetryPolicy::default(),
        }
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub listed: usize,
    pub succeeded: usize,
    pub skipped: usize,
    pub failed: usize,
    pub retries: usize,
    /// Listed but never processed because the run halted
    pub not_attempted: usize,
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} listed, {} succeeded, {} skipped, {} failed, {} retries",
            self.listed, self.succeeded, self.skipped, self.failed, self.retries
        )?;
        if self.not_attempted > 0 {
            write!(f, ", {} not attempted", self.not_attempted)?;
        }
        Ok(())
    }
}

/// A message that did not make it into the output, and why.
#[derive(Debug)]
pub struct BatchIssue {
    pub id: String,
    pub skipped: bool,
    pub error: MailError,
}

#[derive(Debug, Default)]
pub struct BatchReport {
    /// Parsed messages in listing order
    pub messages: Vec<ParsedMessage>,
    pub issues: Vec<BatchIssue>,
    pub summary: RunSummary,
    /// Set when the run stopped early
    pub halted: Option<MailError>,
}

enum Outcome {
    Parsed(ParsedMessage),
    Skipped(String, MailError),
    Failed(String, MailError),
}

/// Fetch one message, retrying retryable errors under `policy`.
///
/// `retries` is incremented once per repeated attempt.
pub async fn fetch_with_retry<A: MailApi + ?Sized>(
    api: &A,
    reference: &MessageReference,
    policy: &RetryPolicy,
    retries: &mut usize,
) -> Result<RawMessage, MailError> {
    let mut attempt = 1;
    loop {
        match api.get_message(reference).await {
            Ok(raw) => return Ok(raw),
            Err(e) if e.is_retryable() && attempt < policy.max_attempts => {
                let delay = policy.delay_for(attempt, &e);
                warn!(
                    "Fetching {} failed ({}), retrying in {:?}",
                    reference.id, e, delay
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
                *retries += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

async fn fetch_one<A: MailApi + ?Sized>(
    api: &A,
    reference: MessageReference,
    policy: &RetryPolicy,
) -> (Outcome, usize) {
    let mut retries = 0;
    let outcome = match fetch_with_retry(api, &reference, policy, &mut retries).await {
        Ok(raw) => match email_content::parse(&raw) {
            Ok(message) => Outcome::Parsed(message),
            Err(e) => Outcome::Skipped(reference.id, e),
        },
        Err(e) if e.is_skippable() => Outcome::Skipped(reference.id, e),
        Err(e) => Outcome::Failed(reference.id, e),
    };
    (outcome, retries)
}

/// Page through the listing, dropping repeated ids, retrying failed pages.
async fn list_references<A: MailApi + ?Sized>(
    api: &A,
    options: &BatchOptions,
    summary: &mut RunSummary,
) -> Result<Vec<MessageReference>, MailError> {
    let mut pages = MessagePages::new(api, options.query.clone());
    let mut seen = HashSet::new();
    let mut references = Vec::new();
    let mut attempt = 1;

    while let Some(page) = pages.next_page().await {
        match page {
            Ok(page) => {
                attempt = 1;
                debug!("Listed page with {} references", page.references.len());
                for reference in page.references {
                    if options.limit.is_some_and(|max| references.len() >= max) {
                        break;
                    }
                    if seen.insert(reference.id.clone()) {
                        references.push(reference);
                    }
                }
                if options.limit.is_some_and(|max| references.len() >= max) {
                    break;
                }
            }
            Err(e) if e.is_retryable() && attempt < options.retry.max_attempts => {
                let delay = options.retry.delay_for(attempt, &e);
                warn!("Listing page failed ({}), retrying in {:?}", e, delay);
                tokio::time::sleep(delay).await;
                attempt += 1;
                summary.retries += 1;
            }
            Err(e) => return Err(e),
        }
    }

    Ok(references)
}

/// List, fetch and parse every message matching `options.query`.
pub async fn run_batch<A: MailApi + ?Sized>(api: &A, options: &BatchOptions) -> BatchReport {
    let mut report = BatchReport::default();

    let references = match list_references(api, options, &mut report.summary).await {
        Ok(references) => references,
        Err(e) => {
            warn!("Listing messages failed: {}", e);
            report.halted = Some(e);
            return report;
        }
    };
    report.summary.listed = references.len();
    info!(
        "Fetching {} messages with concurrency {}",
        references.len(),
        options.concurrency
    );

    let mut fetches = stream::iter(references)
        .map(|reference| fetch_one(api, reference, &options.retry))
        .buffered(options.concurrency.max(1));

    while let Some((outcome, retries)) = fetches.next().await {
        report.summary.retries += retries;
        match outcome {
            Outcome::Parsed(message) => {
                report.summary.succeeded += 1;
                report.messages.push(message);
            }
            Outcome::Skipped(id, error) => {
                warn!("Skipping message {}: {}", id, error);
                report.summary.skipped += 1;
                report.issues.push(BatchIssue {
                    id,
                    skipped: true,
                    error,
                });
            }
            Outcome::Failed(_, error) if error.is_auth() => {
                report.summary.failed += 1;
                report.halted = Some(error);
                break;
            }
            Outcome::Failed(id, error) => {
                warn!("Failed to fetch message {}: {}", id, error);
                report.summary.failed += 1;
                report.issues.push(BatchIssue {
                    id,
                    skipped: false,
                    error,
                });
            }
        }
    }

    let summary = &mut report.summary;
    summary.not_attempted = summary
        .listed
        .saturating_sub(summary.succeeded + summary.skipped + summary.failed);

    info!("Batch finished: {}", report.summary);
    report
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delay_grows_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 10,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(1_000),
        };
        let error = MailError::TransientNetwork("reset".into());

        let first = policy.delay_for(1, &error);
        assert!(first >= Duration::from_millis(100) && first <= Duration::from_millis(150));

        let third = policy.delay_for(3, &error);
        assert!(third >= Duration::from_millis(400) && third <= Duration::from_millis(600));

        let late = policy.delay_for(9, &error);
        assert!(late >= Duration::from_millis(1_000) && late <= Duration::from_millis(1_500));
    }

    #[test]
    fn test_retry_after_overrides_short_backoff() {
        let policy = RetryPolicy::default();
        let error = MailError::RateLimit {
            retry_after: Some(Duration::from_secs(30)),
        };
        assert_eq!(policy.delay_for(1, &error), Duration::from_secs(30));
    }

    #[test]
    fn test_summary_display() {
        let summary = RunSummary {
            listed: 5,
            succeeded: 3,
            skipped: 1,
            failed: 1,
            retries: 2,
            not_attempted: 0,
        };
        assert_eq!(
            summary.to_string(),
            "5 listed, 3 succeeded, 1 skipped, 1 failed, 2 retries"
        );
    }

    #[test]
    fn test_summary_display_reports_unprocessed_messages() {
        let summary = RunSummary {
            listed: 6,
            succeeded: 1,
            failed: 1,
            not_attempted: 4,
            ..Default::default()
        };
        assert_eq!(
            summary.to_string(),
            "6 listed, 1 succeeded, 0 skipped, 1 failed, 0 retries, 4 not attempted"
        );
    }
}
