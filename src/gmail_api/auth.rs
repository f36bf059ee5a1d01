use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use keyring::Entry;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use yup_oauth2::storage::{TokenInfo, TokenStorage};
use yup_oauth2::{ApplicationSecret, InstalledFlowAuthenticator, InstalledFlowReturnMethod};

use crate::error::MailError;

pub const KEYRING_SERVICE_NAME: &str = "deskmail-gmail-credentials";
pub const KEYRING_USERNAME: &str = "default_user"; // Could be user's email if available

/// Refresh attempts per `get_valid_token` call when the failure is transient
const MAX_REFRESH_ATTEMPTS: u32 = 2;
/// Lifetime assumed when the token endpoint omits `expires_in`
const DEFAULT_TOKEN_LIFETIME_SECS: u64 = 3600;

/// An OAuth2 access token with its expiry and the refresh token that renews it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    pub access_token: String,
    pub expires_at: DateTime<Utc>,
    pub refresh_token: Option<String>,
}

impl Credential {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    /// Still valid for at least `skew`
    pub fn is_fresh(&self, now: DateTime<Utc>, skew: ChronoDuration) -> bool {
        self.expires_at > now + skew
    }

    fn from_grant(grant: TokenGrant, previous_refresh: Option<String>, now: DateTime<Utc>) -> Self {
        let lifetime = grant.expires_in.unwrap_or(DEFAULT_TOKEN_LIFETIME_SECS);
        Self {
            access_token: grant.access_token,
            expires_at: now + ChronoDuration::seconds(lifetime as i64),
            // Google omits the refresh token on refresh responses
            refresh_token: grant.refresh_token.or(previous_refresh),
        }
    }
}

/// What the keyring holds: the OAuth client plus the current credential.
#[derive(Serialize, Deserialize, Clone, Default)]
pub struct SecureCredentials {
    pub client_secret: Option<ApplicationSecret>,
    pub credential: Option<Credential>,
}

// Define a trait for Keyring operations to allow mocking
#[cfg_attr(test, mockall::automock)]
pub trait KeyringEntry: Send + Sync {
    fn get_password(&self) -> Result<String, keyring::Error>;
    fn set_password(&self, password: &str) -> Result<(), keyring::Error>;
    fn delete_password(&self) -> Result<(), keyring::Error>;
}

// Implement the trait for the real keyring::Entry
impl KeyringEntry for Entry {
    fn get_password(&self) -> Result<String, keyring::Error> {
        self.get_password()
    }
    fn set_password(&self, password: &str) -> Result<(), keyring::Error> {
        self.set_password(password)
    }
    fn delete_password(&self) -> Result<(), keyring::Error> {
        self.delete_password()
    }
}

/// Persisted key-value slot for the credential.
#[cfg_attr(test, mockall::automock)]
pub trait CredentialStore: Send + Sync {
    fn load(&self) -> Result<Option<Credential>, MailError>;
    fn save(&self, credential: &Credential) -> Result<(), MailError>;
    fn clear(&self) -> Result<(), MailError>;
}

/// Credential store backed by one keyring entry holding [`SecureCredentials`] as JSON.
pub struct KeyringStore<K: KeyringEntry> {
    entry: K,
}

impl KeyringStore<Entry> {
    pub fn open_default() -> Result<Self, MailError> {
        Ok(Self::new(Entry::new(KEYRING_SERVICE_NAME, KEYRING_USERNAME)?))
    }
}

impl<K: KeyringEntry> KeyringStore<K> {
    pub fn new(entry: K) -> Self {
        Self { entry }
    }

    fn read(&self) -> Result<SecureCredentials, MailError> {
        match self.entry.get_password() {
            Ok(json) => serde_json::from_str(&json)
                .map_err(|e| MailError::Store(format!("stored credentials are corrupt: {}", e))),
            Err(keyring::Error::NoEntry) => Ok(SecureCredentials::default()),
            Err(e) => Err(e.into()),
        }
    }

    fn write(&self, credentials: &SecureCredentials) -> Result<(), MailError> {
        let json = serde_json::to_string(credentials)
            .map_err(|e| MailError::Store(e.to_string()))?;
        self.entry.set_password(&json)?;
        Ok(())
    }

    pub fn client_secret(&self) -> Result<Option<ApplicationSecret>, MailError> {
        Ok(self.read()?.client_secret)
    }

    pub fn save_client_secret(&self, secret: ApplicationSecret) -> Result<(), MailError> {
        let mut credentials = self.read().unwrap_or_default();
        credentials.client_secret = Some(secret);
        self.write(&credentials)
    }
}

impl<K: KeyringEntry> CredentialStore for KeyringStore<K> {
    fn load(&self) -> Result<Option<Credential>, MailError> {
        Ok(self.read()?.credential)
    }

    fn save(&self, credential: &Credential) -> Result<(), MailError> {
        // Keep the client secret that shares the entry
        let mut credentials = self.read().unwrap_or_default();
        credentials.credential = Some(credential.clone());
        self.write(&credentials)
    }

    fn clear(&self) -> Result<(), MailError> {
        match self.entry.delete_password() {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Load the OAuth client from the keyring, falling back to the JSON file
/// downloaded from the Google Cloud console.
pub async fn load_client_secret<K: KeyringEntry>(
    store: &KeyringStore<K>,
    path: &Path,
) -> Result<ApplicationSecret, MailError> {
    if let Ok(Some(secret)) = store.client_secret() {
        return Ok(secret);
    }

    let secret = yup_oauth2::read_application_secret(path).await.map_err(|e| {
        MailError::Config(format!(
            "could not read client secret {}: {}",
            path.display(),
            e
        ))
    })?;

    if let Err(e) = store.save_client_secret(secret.clone()) {
        warn!("Failed to save client secret to keyring: {}", e);
    }
    Ok(secret)
}

/// Successful response of a refresh_token grant.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct TokenGrant {
    pub access_token: String,
    pub expires_in: Option<u64>,
    pub refresh_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TokenErrorResponse {
    error: String,
    error_description: Option<String>,
}

/// OAuth2 token endpoint performing the refresh grant.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TokenEndpoint: Send + Sync {
    async fn refresh(&self, refresh_token: &str) -> Result<TokenGrant, MailError>;
}

pub struct HttpTokenEndpoint {
    client: reqwest::Client,
    token_uri: String,
    client_id: String,
    client_secret: String,
    timeout: Duration,
}

impl HttpTokenEndpoint {
    pub fn new(client: reqwest::Client, secret: &ApplicationSecret, timeout: Duration) -> Self {
        Self {
            client,
            token_uri: secret.token_uri.clone(),
            client_id: secret.client_id.clone(),
            client_secret: secret.client_secret.clone(),
            timeout,
        }
    }
}

#[async_trait]
impl TokenEndpoint for HttpTokenEndpoint {
    async fn refresh(&self, refresh_token: &str) -> Result<TokenGrant, MailError> {
        let request = self
            .client
            .post(&self.token_uri)
            .form(&[
                ("client_id", self.client_id.as_str()),
                ("client_secret", self.client_secret.as_str()),
                ("refresh_token", refresh_token),
                ("grant_type", "refresh_token"),
            ])
            .send();

        let response = tokio::time::timeout(self.timeout, request)
            .await
            .map_err(|_| MailError::Timeout(Some(self.timeout)))??;

        let status = response.status();
        if status.is_success() {
            return Ok(response.json::<TokenGrant>().await?);
        }

        let body = response.text().await.unwrap_or_default();
        if status.is_server_error() || status.as_u16() == 429 {
            return Err(MailError::TransientNetwork(format!(
                "token endpoint returned {}",
                status
            )));
        }

        // Explicit rejection (invalid_grant, invalid_client, ...)
        let reason = match serde_json::from_str::<TokenErrorResponse>(&body) {
            Ok(err) => match err.error_description {
                Some(description) => format!("{}: {}", err.error, description),
                None => err.error,
            },
            Err(_) => format!("token endpoint returned {}", status),
        };
        Err(MailError::Auth(reason))
    }
}

// Define a trait for OAuth flow operations to allow mocking
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait OAuthFlow: Send + Sync {
    async fn perform_flow(
        &self,
        secret: ApplicationSecret,
        scopes: Vec<String>,
    ) -> Result<Credential, MailError>;
}

/// Token storage handed to yup-oauth2 so the refresh token it obtains can be
/// kept in our own store.
#[derive(Default, Clone)]
struct CapturingStorage {
    captured: Arc<Mutex<Option<TokenInfo>>>,
}

#[async_trait]
impl TokenStorage for CapturingStorage {
    async fn set(&self, _scopes: &[&str], token: TokenInfo) -> anyhow::Result<()> {
        *self.captured.lock().await = Some(token);
        Ok(())
    }

    async fn get(&self, _scopes: &[&str]) -> Option<TokenInfo> {
        self.captured.lock().await.clone()
    }
}

// Browser based installed-app flow, delegated to yup-oauth2
pub struct RealOAuthFlow;

#[async_trait]
impl OAuthFlow for RealOAuthFlow {
    async fn perform_flow(
        &self,
        secret: ApplicationSecret,
        scopes: Vec<String>,
    ) -> Result<Credential, MailError> {
        let storage = CapturingStorage::default();
        let auth =
            InstalledFlowAuthenticator::builder(secret, InstalledFlowReturnMethod::HTTPRedirect)
                .with_storage(Box::new(storage.clone()))
                .build()
                .await
                .map_err(|e| MailError::Auth(e.to_string()))?;

        let scopes_refs: Vec<&str> = scopes.iter().map(|s| s.as_str()).collect();
        let token = auth
            .token(&scopes_refs)
            .await
            .map_err(|e| MailError::Auth(e.to_string()))?;

        let info = storage.captured.lock().await.clone();
        let access_token = token
            .token()
            .map(str::to_string)
            .ok_or_else(|| MailError::Auth("authorization returned no access token".into()))?;
        let expires_at = token
            .expiration_time()
            .and_then(|at| Utc.timestamp_opt(at.unix_timestamp(), 0).single())
            .unwrap_or_else(|| {
                Utc::now() + ChronoDuration::seconds(DEFAULT_TOKEN_LIFETIME_SECS as i64)
            });

        Ok(Credential {
            access_token,
            expires_at,
            refresh_token: info.and_then(|i| i.refresh_token),
        })
    }
}

// Any failure to produce a token is an authentication failure to callers
fn into_auth(context: &str, err: MailError) -> MailError {
    match err {
        MailError::Auth(_) => err,
        other => MailError::Auth(format!("{}: {}", context, other)),
    }
}

#[derive(Default)]
struct TokenState {
    loaded: bool,
    credential: Option<Credential>,
}

/// Single owner of the access token.
///
/// The state lock is held across a refresh, so concurrent callers queue
/// behind the one in-flight refresh and then read its result.
pub struct CredentialManager {
    store: Box<dyn CredentialStore>,
    endpoint: Box<dyn TokenEndpoint>,
    skew: ChronoDuration,
    refresh_backoff: Duration,
    state: Mutex<TokenState>,
}

impl CredentialManager {
    pub fn new(store: Box<dyn CredentialStore>, endpoint: Box<dyn TokenEndpoint>) -> Self {
        Self {
            store,
            endpoint,
            skew: ChronoDuration::seconds(60),
            refresh_backoff: Duration::from_millis(500),
            state: Mutex::new(TokenState::default()),
        }
    }

    /// Refresh this long before the recorded expiry
    pub fn with_skew(mut self, skew: ChronoDuration) -> Self {
        self.skew = skew;
        self
    }

    pub fn with_refresh_backoff(mut self, backoff: Duration) -> Self {
        self.refresh_backoff = backoff;
        self
    }

    /// A token that is not expired, refreshing first if it is expired or about to be.
    pub async fn get_valid_token(&self) -> Result<String, MailError> {
        let mut state = self.state.lock().await;

        if !state.loaded {
            state.credential = self
                .store
                .load()
                .map_err(|e| into_auth("could not load stored credential", e))?;
            state.loaded = true;
        }

        let current = state.credential.clone().ok_or_else(|| {
            MailError::Auth("no stored credential, run `deskmail login` first".into())
        })?;

        if current.is_fresh(Utc::now(), self.skew) {
            return Ok(current.access_token);
        }

        let Some(refresh_token) = current.refresh_token.clone() else {
            if !current.is_expired(Utc::now()) {
                return Ok(current.access_token);
            }
            return Err(MailError::Auth(
                "access token expired and no refresh token is available".into(),
            ));
        };

        match self.refresh_with_retry(&refresh_token).await {
            Ok(grant) => {
                let updated = Credential::from_grant(grant, Some(refresh_token), Utc::now());
                info!("Access token refreshed, valid until {}", updated.expires_at);
                if let Err(e) = self.store.save(&updated) {
                    warn!("Failed to persist refreshed credential: {}", e);
                }
                let token = updated.access_token.clone();
                state.credential = Some(updated);
                Ok(token)
            }
            // Early refresh failed but the old token still works
            Err(e) if !current.is_expired(Utc::now()) => {
                warn!("Token refresh failed, using current token until expiry: {}", e);
                Ok(current.access_token)
            }
            Err(e) => Err(into_auth("token refresh failed", e)),
        }
    }

    async fn refresh_with_retry(&self, refresh_token: &str) -> Result<TokenGrant, MailError> {
        let mut attempt = 1;
        loop {
            debug!("Refreshing access token (attempt {})", attempt);
            match self.endpoint.refresh(refresh_token).await {
                Ok(grant) => return Ok(grant),
                Err(e) if e.is_retryable() && attempt < MAX_REFRESH_ATTEMPTS => {
                    warn!("Token refresh attempt {} failed: {}", attempt, e);
                    tokio::time::sleep(self.refresh_backoff * attempt).await;
                    attempt += 1;
                }
                Err(e) if e.is_retryable() => {
                    return Err(MailError::Auth(format!("token refresh failed: {}", e)))
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Mark `rejected` as unusable so the next `get_valid_token` refreshes.
    ///
    /// A token that was already replaced by another caller is left alone.
    pub async fn invalidate(&self, rejected: &str) {
        let mut state = self.state.lock().await;
        if let Some(credential) = state.credential.as_mut() {
            if credential.access_token == rejected {
                debug!("Access token rejected by the mail service, forcing refresh");
                credential.expires_at = Utc::now() - ChronoDuration::seconds(1);
            }
        }
    }

    /// Run the interactive authorization flow and store the result.
    pub async fn authorize_interactive<O: OAuthFlow + ?Sized>(
        &self,
        flow: &O,
        secret: ApplicationSecret,
        scopes: &[String],
    ) -> Result<(), MailError> {
        let credential = flow.perform_flow(secret, scopes.to_vec()).await?;
        if credential.refresh_token.is_none() {
            warn!("Authorization returned no refresh token; you will need to log in again when it expires");
        }
        self.store.save(&credential)?;

        let mut state = self.state.lock().await;
        state.loaded = true;
        state.credential = Some(credential);
        Ok(())
    }

    /// Remove the stored credential.
    pub async fn logout(&self) -> Result<(), MailError> {
        let mut state = self.state.lock().await;
        self.store.clear()?;
        state.loaded = true;
        state.credential = None;
        Ok(())
    }
}
