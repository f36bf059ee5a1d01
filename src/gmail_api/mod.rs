//! Gmail API module split into logical submodules
//!
//! This module provides all Gmail API functionality organized into:
//! - auth: Credential manager, credential store and OAuth flows
//! - client: Authorized HTTP client, listing and raw message retrieval
//! - labels: Label lookup and creation
//! - operations: Message actions (reply, label, trash)

pub mod auth;
pub mod client;
pub mod labels;
pub mod operations;

pub use auth::{
    load_client_secret, Credential, CredentialManager, CredentialStore, HttpTokenEndpoint,
    KeyringEntry, KeyringStore, OAuthFlow, RealOAuthFlow, TokenEndpoint, TokenGrant,
};
pub use client::{GmailClient, MailApi, MessagePages};
pub use labels::{ensure_label, fetch_labels};
pub use operations::{apply_label, send_reply, trash_message};

// Re-export auth constants
pub use auth::{KEYRING_SERVICE_NAME, KEYRING_USERNAME};
