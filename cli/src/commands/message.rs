use std::path::{Path, PathBuf};

use clap::Subcommand;
use reqwest::multipart::{Form, Part};
use switchyard_core::conversation::TurnSource;
use uuid::Uuid;

use crate::util::{RequestBody, api_request, exit_error, guess_mime};

#[derive(Subcommand)]
pub enum MessageCommands {
    /// Send a chat turn, optionally with a file attachment
    Send {
        /// Conversation ID
        #[arg(long)]
        conversation: Uuid,
        /// Message text
        #[arg(long, default_value = "")]
        content: String,
        /// File to upload with the message (audio, image, document)
        #[arg(long)]
        attachment: Option<PathBuf>,
        /// Turn source: text, upload, voice_transcription
        #[arg(long)]
        source: Option<String>,
    },
    /// List the messages of a conversation
    List {
        /// Conversation ID
        #[arg(long)]
        conversation: Uuid,
    },
}

pub async fn run(api_url: &str, session: Option<&str>, raw: bool, command: MessageCommands) -> i32 {
    match command {
        MessageCommands::Send {
            conversation,
            content,
            attachment,
            source,
        } => {
            let source = source.map(|raw| {
                TurnSource::parse(&raw).unwrap_or_else(|| {
                    exit_error(
                        &format!("Unknown turn source '{raw}'"),
                        Some("Use one of: text, upload, voice_transcription"),
                    )
                })
            });
            let body = match attachment {
                Some(path) => RequestBody::Multipart(upload_form(&path, content, source)),
                None => {
                    if content.trim().is_empty() {
                        exit_error(
                            "A message needs --content or --attachment",
                            Some("switchyard message send --conversation <ID> --content 'hello'"),
                        );
                    }
                    let mut body = serde_json::json!({ "content": content });
                    if let Some(source) = source {
                        body["source"] = serde_json::json!(source.as_str());
                    }
                    RequestBody::Json(body)
                }
            };
            api_request(
                api_url,
                reqwest::Method::POST,
                &format!("/conversations/{conversation}/messages"),
                session,
                body,
                raw,
            )
            .await
        }
        MessageCommands::List { conversation } => {
            api_request(
                api_url,
                reqwest::Method::GET,
                &format!("/conversations/{conversation}/messages"),
                session,
                RequestBody::Empty,
                raw,
            )
            .await
        }
    }
}

fn upload_form(path: &Path, content: String, source: Option<TurnSource>) -> Form {
    let data = std::fs::read(path).unwrap_or_else(|e| {
        exit_error(&format!("Failed to read {}: {e}", path.display()), None);
    });
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("attachment")
        .to_string();
    let part = Part::bytes(data)
        .file_name(file_name)
        .mime_str(guess_mime(path))
        .unwrap_or_else(|e| exit_error(&format!("Invalid attachment type: {e}"), None));

    let mut form = Form::new().text("content", content).part("attachment", part);
    if let Some(source) = source {
        form = form.text("source", source.as_str());
    }
    form
}
