//! Help-desk mailbox client for Gmail.
//!
//! OAuth2 credentials feed an authorized REST client; raw messages it
//! fetches are decoded into structured messages by a pure MIME parser, and
//! the batch runner ties the two together under a bounded worker pool.

pub mod config;
pub mod email_content;
pub mod error;
pub mod gmail_api;
pub mod models;
pub mod sync;
pub mod types;

pub use config::Config;
pub use email_content::{attachment_content, parse};
pub use error::MailError;
pub use models::{
    AttachmentDescriptor, Mailbox, MessagePage, MessageReference, ParsedMessage, RawMessage,
};
pub use sync::{run_batch, BatchOptions, BatchReport, RetryPolicy, RunSummary};
