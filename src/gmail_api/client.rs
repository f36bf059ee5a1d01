//! Gmail REST client
//!
//! Every request carries a bearer token from the shared [`CredentialManager`].
//! A 401 invalidates that token and the request is sent once more with a
//! refreshed one before the failure is reported as terminal.

use async_trait::async_trait;
use base64::engine::general_purpose::{URL_SAFE, URL_SAFE_NO_PAD};
use base64::engine::Engine;
use log::debug;
use reqwest::header::RETRY_AFTER;
use reqwest::{RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use super::auth::CredentialManager;
use crate::config::Config;
use crate::error::MailError;
use crate::models::{MessagePage, MessageReference, RawMessage};
use crate::types::{ApiErrorResponse, MessagesResponse, RawMessageResponse};

/// Remote listing and retrieval, the seam the batch runner is written against.
#[async_trait]
pub trait MailApi: Send + Sync {
    async fn list_messages(
        &self,
        query: &str,
        page_token: Option<&str>,
    ) -> Result<MessagePage, MailError>;

    async fn get_message(&self, reference: &MessageReference) -> Result<RawMessage, MailError>;
}

pub struct GmailClient {
    http: reqwest::Client,
    credentials: Arc<CredentialManager>,
    base_url: String,
    page_size: u32,
    timeout: Duration,
}

impl GmailClient {
    pub fn new(http: reqwest::Client, credentials: Arc<CredentialManager>, config: &Config) -> Self {
        Self {
            http,
            credentials,
            base_url: config.api_base_url.trim_end_matches('/').to_string(),
            page_size: config.page_size.clamp(1, 500),
            timeout: config.request_timeout(),
        }
    }

    pub fn with_page_size(mut self, page_size: u32) -> Self {
        self.page_size = page_size.clamp(1, 500);
        self
    }

    pub(crate) fn url(&self, path: &str) -> String {
        format!("{}/users/me/{}", self.base_url, path)
    }

    async fn send(&self, request: RequestBuilder) -> Result<Response, MailError> {
        tokio::time::timeout(self.timeout, request.send())
            .await
            .map_err(|_| MailError::Timeout(Some(self.timeout)))?
            .map_err(MailError::from)
    }

    /// Send an authorized request, with one re-authentication cycle on 401.
    pub(crate) async fn execute<F>(&self, build: F, resource: &str) -> Result<Response, MailError>
    where
        F: Fn(&str) -> RequestBuilder,
    {
        let token = self.credentials.get_valid_token().await?;
        let response = self.send(build(&token)).await?;
        if response.status() != StatusCode::UNAUTHORIZED {
            return check_status(response, resource).await;
        }

        self.credentials.invalidate(&token).await;
        let token = self.credentials.get_valid_token().await?;
        let response = self.send(build(&token)).await?;
        if response.status() == StatusCode::UNAUTHORIZED {
            return Err(MailError::Auth(
                "mail service rejected the refreshed access token".into(),
            ));
        }
        check_status(response, resource).await
    }

    pub(crate) async fn read_json<T: DeserializeOwned>(
        &self,
        response: Response,
    ) -> Result<T, MailError> {
        let bytes = tokio::time::timeout(self.timeout, response.bytes())
            .await
            .map_err(|_| MailError::Timeout(Some(self.timeout)))??;
        serde_json::from_slice(&bytes)
            .map_err(|e| MailError::Malformed(format!("unexpected response shape: {}", e)))
    }

    pub(crate) async fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
        resource: &str,
    ) -> Result<T, MailError> {
        let url = self.url(path);
        let response = self
            .execute(
                |token| self.http.get(&url).bearer_auth(token).query(query),
                resource,
            )
            .await?;
        self.read_json(response).await
    }

    pub(crate) async fn post_json<B, T>(
        &self,
        path: &str,
        body: Option<&B>,
        resource: &str,
    ) -> Result<T, MailError>
    where
        B: Serialize + ?Sized + Sync,
        T: DeserializeOwned,
    {
        let url = self.url(path);
        let response = self
            .execute(
                |token| {
                    let request = self.http.post(&url).bearer_auth(token);
                    match body {
                        Some(body) => request.json(body),
                        None => request.header(reqwest::header::CONTENT_LENGTH, 0),
                    }
                },
                resource,
            )
            .await?;
        self.read_json(response).await
    }
}

#[async_trait]
impl MailApi for GmailClient {
    async fn list_messages(
        &self,
        query: &str,
        page_token: Option<&str>,
    ) -> Result<MessagePage, MailError> {
        let mut params = vec![
            ("q", query.to_string()),
            ("maxResults", self.page_size.to_string()),
        ];
        if let Some(token) = page_token {
            params.push(("pageToken", token.to_string()));
        }

        debug!("Listing messages q={:?} page_token={:?}", query, page_token);
        let response: MessagesResponse = self.get_json("messages", &params, "messages").await?;

        Ok(MessagePage {
            references: response
                .messages
                .unwrap_or_default()
                .into_iter()
                .map(|m| MessageReference::new(m.id, m.thread_id))
                .collect(),
            next_page_token: response.next_page_token.filter(|t| !t.is_empty()),
            result_size_estimate: response.result_size_estimate,
        })
    }

    async fn get_message(&self, reference: &MessageReference) -> Result<RawMessage, MailError> {
        debug!("Fetching message {}", reference.id);
        let response: RawMessageResponse = self
            .get_json(
                &format!("messages/{}", reference.id),
                &[("format", "raw".to_string())],
                &reference.id,
            )
            .await?;
        raw_message_from_response(response)
    }
}

pub(crate) fn raw_message_from_response(
    response: RawMessageResponse,
) -> Result<RawMessage, MailError> {
    let mime = decode_raw(&response.raw)?;
    Ok(RawMessage {
        reference: MessageReference::new(response.id, response.thread_id),
        mime,
        labels: response.label_ids.unwrap_or_default(),
        size_estimate: response.size_estimate,
        snippet: response.snippet,
        internal_date: response.internal_date.and_then(|d| d.parse().ok()),
    })
}

/// Gmail returns base64url, with or without padding.
fn decode_raw(data: &str) -> Result<Vec<u8>, MailError> {
    URL_SAFE
        .decode(data)
        .or_else(|_| URL_SAFE_NO_PAD.decode(data))
        .map_err(|e| MailError::Malformed(format!("raw payload is not base64url: {}", e)))
}

async fn check_status(response: Response, resource: &str) -> Result<Response, MailError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let retry_after = response
        .headers()
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(parse_retry_after);
    let body = response.text().await.unwrap_or_default();
    Err(classify_failure(status.as_u16(), retry_after, &body, resource))
}

fn parse_retry_after(value: &str) -> Option<Duration> {
    value.trim().parse::<u64>().ok().map(Duration::from_secs)
}

/// Map a non-success response onto the error taxonomy.
fn classify_failure(
    status: u16,
    retry_after: Option<Duration>,
    body: &str,
    resource: &str,
) -> MailError {
    let envelope = serde_json::from_str::<ApiErrorResponse>(body).ok();
    let rate_limited_reason = envelope.as_ref().is_some_and(|e| {
        e.error
            .errors
            .iter()
            .any(|d| d.reason == "rateLimitExceeded" || d.reason == "userRateLimitExceeded")
    });

    match status {
        404 => MailError::NotFound(resource.to_string()),
        429 => MailError::RateLimit { retry_after },
        403 if rate_limited_reason => MailError::RateLimit { retry_after },
        401 => MailError::Auth("mail service rejected the access token".into()),
        500..=599 => MailError::TransientNetwork(format!("mail service returned {}", status)),
        _ => MailError::Api {
            status,
            message: envelope
                .map(|e| e.error.message)
                .filter(|m| !m.is_empty())
                .unwrap_or_else(|| body.chars().take(200).collect()),
        },
    }
}

/// Lazy pager over `list_messages`.
///
/// A failed page does not advance the cursor, so calling `next_page` again
/// retries it. `page_token` exposes the cursor for resuming later.
pub struct MessagePages<'a, A: MailApi + ?Sized> {
    api: &'a A,
    query: String,
    next: Option<String>,
    finished: bool,
}

impl<'a, A: MailApi + ?Sized> MessagePages<'a, A> {
    pub fn new(api: &'a A, query: impl Into<String>) -> Self {
        Self {
            api,
            query: query.into(),
            next: None,
            finished: false,
        }
    }

    /// Continue a listing from a previously saved page token.
    pub fn resume(api: &'a A, query: impl Into<String>, page_token: impl Into<String>) -> Self {
        Self {
            next: Some(page_token.into()),
            ..Self::new(api, query)
        }
    }

    pub fn page_token(&self) -> Option<&str> {
        self.next.as_deref()
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub async fn next_page(&mut self) -> Option<Result<MessagePage, MailError>> {
        if self.finished {
            return None;
        }

        match self.api.list_messages(&self.query, self.next.as_deref()).await {
            Ok(page) => {
                self.next = page.next_page_token.clone();
                self.finished = self.next.is_none();
                Some(Ok(page))
            }
            Err(e) => Some(Err(e)),
        }
    }

    /// Concatenate every page, dropping repeated ids, up to `limit` references.
    pub async fn collect_all(
        mut self,
        limit: Option<usize>,
    ) -> Result<Vec<MessageReference>, MailError> {
        let mut seen = HashSet::new();
        let mut references = Vec::new();

        while let Some(page) = self.next_page().await {
            for reference in page?.references {
                if limit.is_some_and(|max| references.len() >= max) {
                    return Ok(references);
                }
                if seen.insert(reference.id.clone()) {
                    references.push(reference);
                }
            }
            if limit.is_some_and(|max| references.len() >= max) {
                break;
            }
        }

        Ok(references)
    }
}
