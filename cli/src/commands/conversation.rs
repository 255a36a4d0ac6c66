use clap::Subcommand;
use uuid::Uuid;

use crate::util::{RequestBody, api_request};

#[derive(Subcommand)]
pub enum ConversationCommands {
    /// Start a new conversation owned by the current session
    Create,
    /// Show the audit trail of a conversation
    Log {
        /// Conversation ID
        #[arg(long)]
        id: Uuid,
    },
}

pub async fn run(api_url: &str, session: Option<&str>, raw: bool, command: ConversationCommands) -> i32 {
    match command {
        ConversationCommands::Create => {
            api_request(
                api_url,
                reqwest::Method::POST,
                "/conversations",
                session,
                RequestBody::Empty,
                raw,
            )
            .await
        }
        ConversationCommands::Log { id } => {
            api_request(
                api_url,
                reqwest::Method::GET,
                &format!("/conversations/{id}/log"),
                session,
                RequestBody::Empty,
                raw,
            )
            .await
        }
    }
}
