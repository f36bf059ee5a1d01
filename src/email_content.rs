//! MIME decoding of raw messages into [`ParsedMessage`].
//!
//! Pure functions over bytes. Transfer encodings, charsets and RFC 2047
//! header words are decoded by `mailparse`; the structural checks it is
//! lenient about (boundaries, required headers) are enforced here.

use chrono::{TimeZone, Utc};
use mailparse::{DispositionType, MailAddr, MailHeaderMap, ParsedMail};

use crate::error::MailError;
use crate::models::{AttachmentDescriptor, Mailbox, ParsedMessage, RawMessage};

/// Decode a raw message. Fails only with `MailError::Malformed`.
pub fn parse(raw: &RawMessage) -> Result<ParsedMessage, MailError> {
    let mail = mailparse::parse_mail(&raw.mime)
        .map_err(|e| MailError::Malformed(format!("{}: {}", raw.reference.id, e)))?;
    let headers = mail.get_headers();

    let from = headers
        .get_first_header("From")
        .and_then(|h| mailparse::addrparse_header(h).ok())
        .and_then(|list| flatten_addresses(&list).into_iter().next())
        .ok_or_else(|| malformed(raw, "missing or unparseable From header"))?;

    let to = address_header(&mail, "To");
    let cc = address_header(&mail, "Cc");
    let subject = headers.get_first_value("Subject").unwrap_or_default();
    let message_id = headers
        .get_first_value("Message-ID")
        .map(|id| id.trim().to_string());

    let timestamp = headers
        .get_first_value("Date")
        .and_then(|date| mailparse::dateparse(&date).ok())
        .and_then(|secs| Utc.timestamp_opt(secs, 0).single())
        .or_else(|| {
            raw.internal_date
                .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
        })
        .ok_or_else(|| malformed(raw, "missing Date header"))?;

    let mut walk = PartWalk::default();
    walk.visit(&mail, "1", true)
        .map_err(|reason| malformed(raw, &reason))?;

    Ok(ParsedMessage {
        id: raw.reference.id.clone(),
        thread_id: raw.reference.thread_id.clone(),
        message_id,
        from,
        to,
        cc,
        subject,
        timestamp,
        body_text: walk.text.unwrap_or_default(),
        body_html: walk.html,
        labels: raw.labels.clone(),
        attachments: walk.attachments,
    })
}

/// Decoded bytes of the part named by an attachment's `content_ref`.
pub fn attachment_content(raw: &RawMessage, content_ref: &str) -> Result<Vec<u8>, MailError> {
    let mail = mailparse::parse_mail(&raw.mime)
        .map_err(|e| MailError::Malformed(format!("{}: {}", raw.reference.id, e)))?;

    let not_found = || MailError::NotFound(format!("{} part {}", raw.reference.id, content_ref));
    let mut part = &mail;
    if !mail.subparts.is_empty() {
        for index in content_ref.split('.') {
            let index: usize = index.parse().map_err(|_| not_found())?;
            part = index
                .checked_sub(1)
                .and_then(|i| part.subparts.get(i))
                .ok_or_else(not_found)?;
        }
    } else if content_ref != "1" {
        return Err(not_found());
    }

    part.get_body_raw()
        .map_err(|e| MailError::Malformed(e.to_string()))
}

fn malformed(raw: &RawMessage, reason: &str) -> MailError {
    MailError::Malformed(format!("{}: {}", raw.reference.id, reason))
}

fn address_header(mail: &ParsedMail<'_>, name: &str) -> Vec<Mailbox> {
    mail.get_headers()
        .get_all_headers(name)
        .into_iter()
        .filter_map(|h| mailparse::addrparse_header(h).ok())
        .flat_map(|list| flatten_addresses(&list))
        .collect()
}

fn flatten_addresses(list: &[MailAddr]) -> Vec<Mailbox> {
    let single = |info: &mailparse::SingleInfo| Mailbox {
        name: info
            .display_name
            .as_ref()
            .map(|n| n.trim().to_string())
            .filter(|n| !n.is_empty()),
        address: info.addr.clone(),
    };

    list.iter()
        .flat_map(|addr| match addr {
            MailAddr::Single(info) => vec![single(info)],
            MailAddr::Group(group) => group.addrs.iter().map(single).collect(),
        })
        .collect()
}

#[derive(Default)]
struct PartWalk {
    text: Option<String>,
    html: Option<String>,
    attachments: Vec<AttachmentDescriptor>,
}

impl PartWalk {
    /// Depth-first, document order. `path` is the IMAP-style part number.
    fn visit(&mut self, part: &ParsedMail<'_>, path: &str, is_root: bool) -> Result<(), String> {
        let mimetype = part.ctype.mimetype.to_ascii_lowercase();

        if mimetype.starts_with("multipart/") {
            check_boundaries(part, path)?;
            for (i, sub) in part.subparts.iter().enumerate() {
                let sub_path = if is_root {
                    (i + 1).to_string()
                } else {
                    format!("{}.{}", path, i + 1)
                };
                self.visit(sub, &sub_path, false)?;
            }
            return Ok(());
        }

        let disposition = part.get_content_disposition();
        let filename = disposition
            .params
            .get("filename")
            .or_else(|| part.ctype.params.get("name"))
            .map(|name| name.trim().to_string())
            .filter(|name| !name.is_empty());
        let is_attachment = disposition.disposition == DispositionType::Attachment
            || filename.is_some()
            || mimetype == "message/rfc822";

        if is_attachment {
            let content = part
                .get_body_raw()
                .map_err(|e| format!("part {}: {}", path, e))?;
            let filename =
                filename.unwrap_or_else(|| format!("attachment-{}", self.attachments.len() + 1));
            self.attachments.push(AttachmentDescriptor {
                filename,
                content_type: mimetype,
                size: content.len(),
                content_ref: path.to_string(),
            });
            return Ok(());
        }

        match mimetype.as_str() {
            "text/plain" if self.text.is_none() => {
                self.text = Some(part.get_body().map_err(|e| format!("part {}: {}", path, e))?);
            }
            "text/html" if self.html.is_none() => {
                self.html = Some(part.get_body().map_err(|e| format!("part {}: {}", path, e))?);
            }
            _ => {}
        }
        Ok(())
    }
}

/// A multipart body needs its boundary parameter, at least one delimiter
/// line and the closing `--boundary--` line.
fn check_boundaries(part: &ParsedMail<'_>, path: &str) -> Result<(), String> {
    let boundary = part
        .ctype
        .params
        .get("boundary")
        .filter(|b| !b.is_empty())
        .ok_or_else(|| format!("part {}: multipart without boundary", path))?;

    let body = part
        .get_body_raw()
        .map_err(|e| format!("part {}: {}", path, e))?;
    let delimiter = format!("--{}", boundary);
    let closing = format!("--{}--", boundary);

    let mut opened = false;
    let mut closed = false;
    for line in body.split(|b| *b == b'\n') {
        let line = String::from_utf8_lossy(line);
        let line = line.trim_end();
        if line == closing {
            closed = true;
            break;
        }
        if line == delimiter {
            opened = true;
        }
    }

    if !opened || part.subparts.is_empty() {
        return Err(format!("part {}: no parts found for boundary {:?}", path, boundary));
    }
    if !closed {
        return Err(format!("part {}: unterminated boundary {:?}", path, boundary));
    }
    Ok(())
}
