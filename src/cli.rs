use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use yup_oauth2::ApplicationSecret;

use deskmail::email_content::{attachment_content, parse};
use deskmail::gmail_api::{
    apply_label, load_client_secret, send_reply, trash_message, CredentialManager, CredentialStore,
    GmailClient, HttpTokenEndpoint, KeyringStore, RealOAuthFlow,
};
use deskmail::sync::{fetch_with_retry, run_batch, BatchOptions, BatchReport};
use deskmail::{Config, MessageReference, ParsedMessage, RawMessage};

const UNREAD_TICKETS_QUERY: &str = "is:unread label:inbox";

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
pub struct Cli {
    /// Clear the stored credentials from the system keyring and exit.
    #[clap(long)]
    pub clear_keyring: bool,

    /// OAuth client secret downloaded from the Google Cloud console.
    #[clap(long, global = true)]
    pub client_secret: Option<PathBuf>,

    /// Increase log output (-v info, -vv debug).
    #[clap(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[clap(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Authorize access to the mailbox in the browser.
    Login,
    /// Fetch and parse every message matching a query, then print a summary.
    Fetch {
        #[clap(long)]
        query: Option<String>,
        #[clap(long)]
        limit: Option<usize>,
        #[clap(long)]
        concurrency: Option<usize>,
        /// Print one JSON object per message.
        #[clap(long)]
        json: bool,
    },
    /// List unread tickets in the inbox.
    Unread {
        #[clap(long, default_value_t = 10)]
        limit: usize,
    },
    /// List tickets matching a Gmail search query.
    Search {
        query: String,
        #[clap(long, default_value_t = 20)]
        limit: usize,
    },
    /// Print the plain-text body of a ticket.
    Read {
        id: String,
        /// Write the attachments into this directory.
        #[clap(long)]
        save_attachments: Option<PathBuf>,
    },
    /// Reply to a ticket in its thread.
    Reply { id: String, body: String },
    /// Label a ticket, creating the label when needed.
    Label {
        id: String,
        #[clap(long, default_value = "IN_PROGRESS")]
        name: String,
    },
    /// Move a ticket to the trash.
    Trash {
        id: String,
        /// Skip the confirmation prompt.
        #[clap(long)]
        yes: bool,
    },
}

pub fn handle_keyring_clear() -> Result<()> {
    let store = KeyringStore::open_default()?;
    store
        .clear()
        .context("Failed to delete credentials from keyring")?;
    println!("Credentials removed from keyring. Exiting.");
    Ok(())
}

/// Everything a command needs to talk to the mailbox.
struct Session {
    config: Config,
    secret: ApplicationSecret,
    credentials: Arc<CredentialManager>,
    client: GmailClient,
}

async fn open_session(config: Config) -> Result<Session> {
    let store = KeyringStore::open_default()?;
    let secret = load_client_secret(&store, &config.client_secret_path).await?;

    let http = reqwest::Client::new();
    let endpoint = HttpTokenEndpoint::new(http.clone(), &secret, config.request_timeout());
    let credentials = Arc::new(
        CredentialManager::new(Box::new(store), Box::new(endpoint))
            .with_skew(config.refresh_skew()),
    );
    let client = GmailClient::new(http, credentials.clone(), &config);

    Ok(Session {
        config,
        secret,
        credentials,
        client,
    })
}

pub async fn run(cli: Cli) -> Result<()> {
    if cli.clear_keyring {
        return handle_keyring_clear();
    }

    let mut config = Config::load()?;
    if let Some(path) = cli.client_secret {
        config.client_secret_path = path;
    }
    let session = open_session(config).await?;

    match cli.command.unwrap_or(Command::Unread { limit: 10 }) {
        Command::Login => login(&session).await,
        Command::Fetch {
            query,
            limit,
            concurrency,
            json,
        } => {
            let mut options = batch_options(&session.config, query, limit);
            if let Some(concurrency) = concurrency {
                options.concurrency = concurrency.max(1);
            }
            let report = run_batch(&session.client, &options).await;
            for message in &report.messages {
                if json {
                    println!("{}", serde_json::to_string(message)?);
                } else {
                    print_message_line(message);
                }
            }
            finish(report)
        }
        Command::Unread { limit } => {
            let options = unread_options(&session.config, limit);
            let report = run_batch(&session.client, &options).await;
            print_tickets(&format!("Unread Tickets (latest {})", limit), &report, false);
            finish(report)
        }
        Command::Search { query, limit } => {
            let options = batch_options(&session.config, Some(query.clone()), Some(limit));
            let report = run_batch(&session.client, &options).await;
            print_tickets(
                &format!("Custom Query: {} (latest {})", query, limit),
                &report,
                true,
            );
            finish(report)
        }
        Command::Read {
            id,
            save_attachments,
        } => read_ticket(&session, &id, save_attachments.as_deref()).await,
        Command::Reply { id, body } => {
            let original = parse(&fetch_raw(&session, &id).await?)?;
            let sent = send_reply(&session.client, &original, &body).await?;
            println!("Reply sent. ID: {}", sent.id);
            Ok(())
        }
        Command::Label { id, name } => {
            let label = apply_label(&session.client, &id, &name).await?;
            println!(
                "Label {} with LabelID of {} applied to messageID: {}",
                label.name, label.id, id
            );
            Ok(())
        }
        Command::Trash { id, yes } => {
            if !yes && !confirm("Are you sure? (y/n): ")? {
                println!("Trash cancelled.");
                return Ok(());
            }
            trash_message(&session.client, &id).await?;
            println!(
                "Message (ID: {}) moved to Trash (30-day retention). This action is reversible.",
                id
            );
            Ok(())
        }
    }
}

async fn login(session: &Session) -> Result<()> {
    session
        .credentials
        .authorize_interactive(
            &RealOAuthFlow,
            session.secret.clone(),
            &session.config.scopes,
        )
        .await
        .context("Authorization failed")?;
    println!("Authorization stored in the system keyring.");
    Ok(())
}

fn batch_options(config: &Config, query: Option<String>, limit: Option<usize>) -> BatchOptions {
    BatchOptions {
        query: query.unwrap_or_else(|| config.query.clone()),
        limit,
        concurrency: config.concurrency,
        retry: config.retry_policy(),
    }
}

/// `unread` ignores the configured default query.
fn unread_options(config: &Config, limit: usize) -> BatchOptions {
    batch_options(config, Some(UNREAD_TICKETS_QUERY.to_string()), Some(limit))
}

async fn fetch_raw(session: &Session, id: &str) -> Result<RawMessage> {
    let reference = MessageReference::new(id, "");
    let mut retries = 0;
    let raw = fetch_with_retry(
        &session.client,
        &reference,
        &session.config.retry_policy(),
        &mut retries,
    )
    .await
    .with_context(|| format!("Failed to fetch message {}", id))?;
    Ok(raw)
}

async fn read_ticket(session: &Session, id: &str, save_dir: Option<&Path>) -> Result<()> {
    let raw = fetch_raw(session, id).await?;
    let message = parse(&raw)?;

    println!("From: {}", message.from);
    println!("Subject: {}", message.subject);
    println!("Date: {}", message.timestamp.to_rfc2822());
    println!();
    if message.body_text.trim().is_empty() {
        println!("(no plain text body)");
    } else {
        println!("{}", message.body_text);
    }

    for attachment in &message.attachments {
        println!(
            "[attachment {}] {} ({}, {} bytes)",
            attachment.content_ref, attachment.filename, attachment.content_type, attachment.size
        );
    }

    if let Some(dir) = save_dir {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create {}", dir.display()))?;
        for attachment in &message.attachments {
            // Never trust a sender-supplied path
            let name = Path::new(&attachment.filename)
                .file_name()
                .map(|n| n.to_os_string())
                .unwrap_or_else(|| format!("part-{}", attachment.content_ref).into());
            let path = dir.join(name);
            let content = attachment_content(&raw, &attachment.content_ref)?;
            std::fs::write(&path, content)
                .with_context(|| format!("Failed to write {}", path.display()))?;
            println!("Saved {}", path.display());
        }
    }
    Ok(())
}

fn print_message_line(message: &ParsedMessage) {
    println!(
        "{} | {} | {} | {} attachment(s)",
        message.timestamp.format("%Y-%m-%d %H:%M"),
        message.from,
        message.subject,
        message.attachments.len()
    );
}

fn print_tickets(title: &str, report: &BatchReport, with_snippet: bool) {
    if report.messages.is_empty() && report.halted.is_none() {
        println!("No messages found.");
        return;
    }

    println!("--- {} -----------------------", title);
    for (index, message) in report.messages.iter().enumerate() {
        let subject = if message.subject.is_empty() {
            "(no subject)"
        } else {
            message.subject.as_str()
        };
        if with_snippet {
            let snippet = message.snippet(80);
            println!(
                "{}. Subject: {} || From: {} || Snippet: {} || Message ID: {}",
                index + 1,
                subject,
                message.from,
                if snippet.is_empty() { "(no snippet)" } else { &snippet },
                message.id
            );
        } else {
            println!(
                "{}. Subject: {} || From: {} || Message ID: {}",
                index + 1,
                subject,
                message.from,
                message.id
            );
        }
    }
    println!("------------------------------------------------------");
}

/// Print the summary and turn a halted run into an error.
fn finish(report: BatchReport) -> Result<()> {
    println!("Summary: {}", report.summary);

    match report.halted {
        Some(error) => Err(anyhow::Error::new(error).context("Run halted")),
        None => Ok(()),
    }
}

fn confirm(prompt: &str) -> Result<bool> {
    print!("{}", prompt);
    std::io::stdout().flush()?;
    let mut answer = String::new();
    std::io::stdin().lock().read_line(&mut answer)?;
    Ok(answer.trim().eq_ignore_ascii_case("y"))
}
