use log::info;

use super::GmailClient;
use crate::error::MailError;
use crate::types::{Label, LabelsResponse, NewLabel};

// Both system (INBOX, UNREAD) and user labels
pub async fn fetch_labels(client: &GmailClient) -> Result<Vec<Label>, MailError> {
    let response: LabelsResponse = client.get_json("labels", &[], "labels").await?;
    Ok(response.labels.unwrap_or_default())
}

pub fn find_label<'a>(labels: &'a [Label], name: &str) -> Option<&'a Label> {
    labels.iter().find(|label| label.name == name)
}

pub async fn create_label(client: &GmailClient, name: &str) -> Result<Label, MailError> {
    let request = NewLabel {
        name,
        label_list_visibility: "labelShow",
        message_list_visibility: "show",
    };
    let label: Label = client.post_json("labels", Some(&request), "labels").await?;
    info!("Created label {} ({})", label.name, label.id);
    Ok(label)
}

/// Look a label up by name, creating it when missing.
pub async fn ensure_label(client: &GmailClient, name: &str) -> Result<Label, MailError> {
    let labels = fetch_labels(client).await?;
    match find_label(&labels, name) {
        Some(label) => Ok(label.clone()),
        None => create_label(client, name).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_find_label_is_exact() {
        let labels = vec![
            Label {
                id: "INBOX".to_string(),
                name: "INBOX".to_string(),
            },
            Label {
                id: "Label_7".to_string(),
                name: "IN_PROGRESS".to_string(),
            },
        ];
        assert_eq!(find_label(&labels, "IN_PROGRESS").unwrap().id, "Label_7");
        assert!(find_label(&labels, "in_progress").is_none());
    }
}
