use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;

use deskmail::gmail_api::MailApi;
use deskmail::sync::{run_batch, BatchOptions, RetryPolicy};
use deskmail::{MailError, MessagePage, MessageReference, RawMessage};

// What the fake mailbox does on one get_message call
#[derive(Clone, Copy, Debug)]
enum Step {
    Deliver,
    BrokenMime,
    RateLimited,
    NotFound,
    Unauthorized,
    ServerError,
}

// In-memory mailbox serving scripted responses
struct FakeMailbox {
    pages: Vec<Vec<String>>,
    scripts: Mutex<HashMap<String, VecDeque<Step>>>,
    fetches: Mutex<HashMap<String, usize>>,
    listing_failures: Mutex<usize>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl FakeMailbox {
    fn new(pages: &[&[&str]]) -> Self {
        Self {
            pages: pages
                .iter()
                .map(|page| page.iter().map(|id| id.to_string()).collect())
                .collect(),
            scripts: Mutex::new(HashMap::new()),
            fetches: Mutex::new(HashMap::new()),
            listing_failures: Mutex::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    async fn script(&self, id: &str, steps: &[Step]) {
        self.scripts
            .lock()
            .await
            .insert(id.to_string(), steps.iter().copied().collect());
    }

    async fn fail_listing(&self, times: usize) {
        *self.listing_failures.lock().await = times;
    }

    async fn fetch_count(&self, id: &str) -> usize {
        self.fetches.lock().await.get(id).copied().unwrap_or(0)
    }
}

fn ticket_mime(id: &str) -> Vec<u8> {
    format!(
        "From: Customer <{id}@customers.example.com>\r\n\
         To: support@example.com\r\n\
         Subject: Ticket {id}\r\n\
         Date: Mon, 2 Jun 2025 10:00:00 +0000\r\n\
         Message-ID: <{id}@customers.example.com>\r\n\
         \r\n\
         Body of {id}\r\n"
    )
    .into_bytes()
}

fn broken_mime() -> Vec<u8> {
    [
        "From: Customer <broken@customers.example.com>",
        "Subject: Half a message",
        "Date: Mon, 2 Jun 2025 10:00:00 +0000",
        "Content-Type: multipart/mixed; boundary=\"cut\"",
        "",
        "--cut",
        "Content-Type: text/plain",
        "",
        "the rest never arrived",
    ]
    .join("\r\n")
    .into_bytes()
}

#[async_trait]
impl MailApi for FakeMailbox {
    async fn list_messages(
        &self,
        _query: &str,
        page_token: Option<&str>,
    ) -> Result<MessagePage, MailError> {
        {
            let mut failures = self.listing_failures.lock().await;
            if *failures > 0 {
                *failures -= 1;
                return Err(MailError::TransientNetwork("connection reset".to_string()));
            }
        }

        let index: usize = page_token.map_or(0, |t| t.parse().unwrap_or(0));
        let ids = self.pages.get(index).cloned().unwrap_or_default();
        let next_page_token = if index + 1 < self.pages.len() {
            Some((index + 1).to_string())
        } else {
            None
        };

        Ok(MessagePage {
            references: ids
                .iter()
                .map(|id| MessageReference::new(id.clone(), format!("thread-{}", id)))
                .collect(),
            next_page_token,
            result_size_estimate: None,
        })
    }

    async fn get_message(&self, reference: &MessageReference) -> Result<RawMessage, MailError> {
        let running = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(running, Ordering::SeqCst);
        *self
            .fetches
            .lock()
            .await
            .entry(reference.id.clone())
            .or_insert(0) += 1;

        // Later messages finish first, so ordering has to come from the runner
        let n: u64 = reference.id.trim_start_matches('m').parse().unwrap_or(0);
        let delay = 30u64.saturating_sub(n * 2);
        tokio::time::sleep(Duration::from_millis(delay)).await;

        let step = self
            .scripts
            .lock()
            .await
            .get_mut(&reference.id)
            .and_then(|steps| steps.pop_front())
            .unwrap_or(Step::Deliver);
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        let mime = match step {
            Step::Deliver => ticket_mime(&reference.id),
            Step::BrokenMime => broken_mime(),
            Step::RateLimited => {
                return Err(MailError::RateLimit {
                    retry_after: Some(Duration::from_millis(1)),
                })
            }
            Step::NotFound => return Err(MailError::NotFound(reference.id.clone())),
            Step::Unauthorized => {
                return Err(MailError::Auth("token rejected twice".to_string()))
            }
            Step::ServerError => {
                return Err(MailError::TransientNetwork("503 backend error".to_string()))
            }
        };

        Ok(RawMessage {
            reference: reference.clone(),
            mime,
            labels: vec!["INBOX".to_string(), "UNREAD".to_string()],
            size_estimate: None,
            snippet: None,
            internal_date: None,
        })
    }
}

fn options() -> BatchOptions {
    BatchOptions {
        query: "is:unread label:inbox".to_string(),
        limit: None,
        concurrency: 3,
        retry: RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
        },
    }
}

fn ids(report: &deskmail::BatchReport) -> Vec<&str> {
    report.messages.iter().map(|m| m.id.as_str()).collect()
}

#[tokio::test]
async fn test_every_page_fetched_once_in_listing_order() {
    let mailbox = FakeMailbox::new(&[&["m1", "m2"], &["m3", "m4"], &["m5"]]);

    let report = run_batch(&mailbox, &options()).await;

    assert!(report.halted.is_none());
    assert_eq!(ids(&report), vec!["m1", "m2", "m3", "m4", "m5"]);
    assert_eq!(report.summary.listed, 5);
    assert_eq!(report.summary.succeeded, 5);
    assert_eq!(report.summary.retries, 0);
    assert_eq!(report.summary.not_attempted, 0);
    for id in ["m1", "m2", "m3", "m4", "m5"] {
        assert_eq!(mailbox.fetch_count(id).await, 1, "{} fetched once", id);
    }

    let first = &report.messages[0];
    assert_eq!(first.subject, "Ticket m1");
    assert_eq!(first.thread_id, "thread-m1");
    assert_eq!(first.from.address, "m1@customers.example.com");
    assert_eq!(first.labels, vec!["INBOX", "UNREAD"]);
}

#[tokio::test]
async fn test_ids_repeated_across_pages_are_fetched_once() {
    let mailbox = FakeMailbox::new(&[&["m1", "m2"], &["m2", "m3"]]);

    let report = run_batch(&mailbox, &options()).await;

    assert_eq!(ids(&report), vec!["m1", "m2", "m3"]);
    assert_eq!(report.summary.listed, 3);
    assert_eq!(mailbox.fetch_count("m2").await, 1);
}

#[tokio::test]
async fn test_limit_stops_listing_early() {
    let mailbox = FakeMailbox::new(&[&["m1", "m2"], &["m3", "m4"], &["m5"]]);
    let options = BatchOptions {
        limit: Some(3),
        ..options()
    };

    let report = run_batch(&mailbox, &options).await;

    assert_eq!(ids(&report), vec!["m1", "m2", "m3"]);
    assert_eq!(mailbox.fetch_count("m4").await, 0);
}

#[tokio::test]
async fn test_rate_limited_fetch_is_retried_and_counted() {
    let mailbox = FakeMailbox::new(&[&["m1", "m2"]]);
    mailbox.script("m1", &[Step::RateLimited]).await;

    let report = run_batch(&mailbox, &options()).await;

    assert_eq!(ids(&report), vec!["m1", "m2"]);
    assert_eq!(report.summary.succeeded, 2);
    assert_eq!(report.summary.retries, 1);
    assert_eq!(mailbox.fetch_count("m1").await, 2);
}

#[tokio::test]
async fn test_exhausted_retries_fail_only_that_message() {
    let mailbox = FakeMailbox::new(&[&["m1", "m2", "m3"]]);
    mailbox
        .script(
            "m2",
            &[Step::ServerError, Step::ServerError, Step::ServerError],
        )
        .await;

    let report = run_batch(&mailbox, &options()).await;

    assert!(report.halted.is_none());
    assert_eq!(ids(&report), vec!["m1", "m3"]);
    assert_eq!(report.summary.failed, 1);
    assert_eq!(report.summary.retries, 2);
    assert_eq!(mailbox.fetch_count("m2").await, 3);
    assert_eq!(report.issues.len(), 1);
    assert_eq!(report.issues[0].id, "m2");
    assert!(!report.issues[0].skipped);
}

#[tokio::test]
async fn test_malformed_and_missing_messages_are_skipped() {
    let mailbox = FakeMailbox::new(&[&["m1", "m2", "m3", "m4"]]);
    mailbox.script("m2", &[Step::BrokenMime]).await;
    mailbox.script("m3", &[Step::NotFound]).await;

    let report = run_batch(&mailbox, &options()).await;

    assert!(report.halted.is_none());
    assert_eq!(ids(&report), vec!["m1", "m4"]);
    assert_eq!(report.summary.listed, 4);
    assert_eq!(report.summary.succeeded, 2);
    assert_eq!(report.summary.skipped, 2);
    assert_eq!(report.summary.failed, 0);

    let broken = report.issues.iter().find(|i| i.id == "m2").unwrap();
    assert!(broken.skipped);
    assert!(matches!(broken.error, MailError::Malformed(_)));
    assert!(broken.error.to_string().contains("unterminated"));

    // Not found is never retried
    assert_eq!(mailbox.fetch_count("m3").await, 1);
}

#[tokio::test]
async fn test_auth_failure_halts_with_summary() {
    let mailbox = FakeMailbox::new(&[&["m1", "m2", "m3", "m4", "m5", "m6"]]);
    mailbox.script("m2", &[Step::Unauthorized]).await;
    let options = BatchOptions {
        concurrency: 1,
        ..options()
    };

    let report = run_batch(&mailbox, &options).await;

    assert!(matches!(report.halted, Some(MailError::Auth(_))));
    assert_eq!(ids(&report), vec!["m1"]);
    assert_eq!(report.summary.listed, 6);
    assert_eq!(report.summary.succeeded, 1);
    assert_eq!(report.summary.failed, 1);
    assert_eq!(report.summary.not_attempted, 4);
    assert!(report.summary.to_string().ends_with("4 not attempted"));
    assert_eq!(mailbox.fetch_count("m6").await, 0);
}

#[tokio::test]
async fn test_transient_listing_failure_is_retried() {
    let mailbox = FakeMailbox::new(&[&["m1"], &["m2"]]);
    mailbox.fail_listing(1).await;

    let report = run_batch(&mailbox, &options()).await;

    assert!(report.halted.is_none());
    assert_eq!(ids(&report), vec!["m1", "m2"]);
    assert_eq!(report.summary.retries, 1);
}

#[tokio::test]
async fn test_unrecoverable_listing_halts_before_fetching() {
    let mailbox = FakeMailbox::new(&[&["m1"]]);
    mailbox.fail_listing(10).await;

    let report = run_batch(&mailbox, &options()).await;

    assert!(matches!(
        report.halted,
        Some(MailError::TransientNetwork(_))
    ));
    assert!(report.messages.is_empty());
    assert_eq!(report.summary.listed, 0);
    assert_eq!(report.summary.retries, 2);
    assert_eq!(mailbox.fetch_count("m1").await, 0);
}

#[tokio::test]
async fn test_concurrency_is_bounded() {
    let page: Vec<String> = (1..=12).map(|n| format!("m{}", n)).collect();
    let page: Vec<&str> = page.iter().map(String::as_str).collect();
    let mailbox = FakeMailbox::new(&[&page]);

    let report = run_batch(&mailbox, &options()).await;

    assert_eq!(report.summary.succeeded, 12);
    let peak = mailbox.max_in_flight.load(Ordering::SeqCst);
    assert!(peak <= 3, "peak concurrency {}", peak);
    assert!(peak > 1, "fetches never overlapped");
}
