use clap::Subcommand;
use serde_json::json;

use crate::util::{RequestBody, api_request, session_path};

#[derive(Subcommand)]
pub enum SessionCommands {
    /// Print the session ID this CLI presents
    Show,
    /// Retire the current session and start a fresh one
    Reset,
    /// Show today's usage counts and limits for the session
    Usage,
}

pub async fn run(api_url: &str, session: Option<&str>, raw: bool, command: SessionCommands) -> i32 {
    match command {
        SessionCommands::Show => {
            let out = json!({
                "api_url": api_url,
                "session_id": session,
                "stored_at": session_path().display().to_string(),
            });
            println!("{}", serde_json::to_string_pretty(&out).unwrap_or_else(|_| out.to_string()));
            0
        }
        SessionCommands::Reset => {
            api_request(
                api_url,
                reqwest::Method::POST,
                "/sessions/reset",
                session,
                RequestBody::Empty,
                raw,
            )
            .await
        }
        SessionCommands::Usage => {
            api_request(
                api_url,
                reqwest::Method::GET,
                "/usage",
                session,
                RequestBody::Empty,
                raw,
            )
            .await
        }
    }
}
