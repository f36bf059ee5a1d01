use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::engine::Engine;
use lettre::message::header::ContentType;
use lettre::message::Mailbox as LettreMailbox;
use lettre::{Address, Message};
use log::info;
use serde::de::IgnoredAny;

use super::labels::ensure_label;
use super::GmailClient;
use crate::error::MailError;
use crate::models::{Mailbox, ParsedMessage};
use crate::types::{Label, ModifyRequest, ProfileResponse, SendRequest, SentMessage};

/// Address of the authenticated account
pub async fn fetch_profile_address(client: &GmailClient) -> Result<String, MailError> {
    let profile: ProfileResponse = client.get_json("profile", &[], "profile").await?;
    Ok(profile.email_address)
}

pub fn reply_subject(original: &str) -> String {
    if original.to_lowercase().starts_with("re:") {
        original.to_string()
    } else {
        format!("Re: {}", original)
    }
}

fn to_lettre(mailbox: &Mailbox) -> Result<LettreMailbox, MailError> {
    let address: Address = mailbox
        .address
        .parse()
        .map_err(|e| MailError::Malformed(format!("invalid address {}: {}", mailbox.address, e)))?;
    Ok(LettreMailbox::new(mailbox.name.clone(), address))
}

/// RFC 5322 bytes of a plain-text reply to `original`, threaded through
/// In-Reply-To and References.
pub fn build_reply(
    from: &Mailbox,
    original: &ParsedMessage,
    body: &str,
) -> Result<Vec<u8>, MailError> {
    let mut builder = Message::builder()
        .from(to_lettre(from)?)
        .to(to_lettre(&original.from)?)
        .subject(reply_subject(&original.subject))
        .header(ContentType::TEXT_PLAIN);

    if let Some(message_id) = &original.message_id {
        builder = builder
            .in_reply_to(message_id.clone())
            .references(message_id.clone());
    }

    let email = builder
        .body(body.to_string())
        .map_err(|e| MailError::Malformed(format!("could not build reply: {}", e)))?;
    Ok(email.formatted())
}

// Send a reply in the original thread
pub async fn send_reply(
    client: &GmailClient,
    original: &ParsedMessage,
    body: &str,
) -> Result<SentMessage, MailError> {
    let from = Mailbox {
        name: None,
        address: fetch_profile_address(client).await?,
    };
    let raw = build_reply(&from, original, body)?;

    let request = SendRequest {
        raw: URL_SAFE_NO_PAD.encode(raw),
        thread_id: Some(&original.thread_id),
    };
    let sent: SentMessage = client
        .post_json("messages/send", Some(&request), "messages/send")
        .await?;
    info!("Reply {} sent to {}", sent.id, original.from);
    Ok(sent)
}

/// Add the named label to a message, creating the label if needed.
pub async fn apply_label(
    client: &GmailClient,
    message_id: &str,
    label_name: &str,
) -> Result<Label, MailError> {
    let label = ensure_label(client, label_name).await?;
    let request = ModifyRequest {
        add_label_ids: vec![label.id.clone()],
        ..Default::default()
    };

    let _: IgnoredAny = client
        .post_json(
            &format!("messages/{}/modify", message_id),
            Some(&request),
            message_id,
        )
        .await?;
    Ok(label)
}

// Move a message to trash (recoverable for 30 days)
pub async fn trash_message(client: &GmailClient, message_id: &str) -> Result<(), MailError> {
    let _: IgnoredAny = client
        .post_json::<(), _>(&format!("messages/{}/trash", message_id), None, message_id)
        .await?;
    Ok(())
}
