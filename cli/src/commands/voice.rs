use clap::Subcommand;
use serde_json::json;
use uuid::Uuid;

use crate::util::{RequestBody, api_request};

#[derive(Subcommand)]
pub enum VoiceCommands {
    /// Request a realtime voice grant for a conversation
    Grant {
        /// Conversation ID
        #[arg(long)]
        conversation: Uuid,
    },
    /// Close the voice bridge of a conversation
    Close {
        /// Conversation ID
        #[arg(long)]
        conversation: Uuid,
    },
}

pub async fn run(api_url: &str, session: Option<&str>, raw: bool, command: VoiceCommands) -> i32 {
    match command {
        VoiceCommands::Grant { conversation } => {
            api_request(
                api_url,
                reqwest::Method::POST,
                "/voice/sessions",
                session,
                RequestBody::Json(json!({ "conversation_id": conversation })),
                raw,
            )
            .await
        }
        VoiceCommands::Close { conversation } => {
            api_request(
                api_url,
                reqwest::Method::DELETE,
                &format!("/voice/sessions/{conversation}"),
                session,
                RequestBody::Empty,
                raw,
            )
            .await
        }
    }
}
