use clap::{Parser, Subcommand};

mod commands;
mod util;

use commands::conversation::ConversationCommands;
use commands::message::MessageCommands;
use commands::session::SessionCommands;
use commands::voice::VoiceCommands;

#[derive(Parser)]
#[command(name = "switchyard", version, about = "Switchyard CLI: drive conversations, sessions and voice grants over the HTTP API")]
struct Cli {
    /// API base URL
    #[arg(long, env = "SWITCHYARD_API_URL", default_value = "http://localhost:3000")]
    api_url: String,

    /// Session ID to present (defaults to the one saved by the last request)
    #[arg(long, env = "SWITCHYARD_SESSION_ID")]
    session: Option<String>,

    /// Print compact JSON instead of pretty-printed output
    #[arg(long, global = true)]
    raw: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check API health
    Health,
    /// Conversation operations
    Conversation {
        #[command(subcommand)]
        command: ConversationCommands,
    },
    /// Send and list chat messages
    Message {
        #[command(subcommand)]
        command: MessageCommands,
    },
    /// Session identity and usage
    Session {
        #[command(subcommand)]
        command: SessionCommands,
    },
    /// Realtime voice grants
    Voice {
        #[command(subcommand)]
        command: VoiceCommands,
    },
}

#[tokio::main]
async fn main() {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();

    let api_url = cli.api_url.trim_end_matches('/').to_string();
    let session = cli.session.or_else(|| util::load_session(&api_url));
    let session = session.as_deref();

    let code = match cli.command {
        Commands::Health => commands::health::run(&api_url, cli.raw).await,
        Commands::Conversation { command } => {
            commands::conversation::run(&api_url, session, cli.raw, command).await
        }
        Commands::Message { command } => {
            commands::message::run(&api_url, session, cli.raw, command).await
        }
        Commands::Session { command } => {
            commands::session::run(&api_url, session, cli.raw, command).await
        }
        Commands::Voice { command } => {
            commands::voice::run(&api_url, session, cli.raw, command).await
        }
    };

    std::process::exit(code);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_message_send_with_attachment() {
        let cli = Cli::try_parse_from([
            "switchyard",
            "--api-url",
            "http://example.test",
            "message",
            "send",
            "--conversation",
            "0190f5c2-7d3a-7b4e-9a1c-2f8e6d5b4a39",
            "--attachment",
            "memo.webm",
        ])
        .expect("arguments should parse");
        match cli.command {
            Commands::Message {
                command: MessageCommands::Send { attachment, content, .. },
            } => {
                assert_eq!(attachment.as_deref(), Some(std::path::Path::new("memo.webm")));
                assert!(content.is_empty());
            }
            _ => panic!("expected message send"),
        }
    }

    #[test]
    fn rejects_malformed_conversation_id() {
        let parsed = Cli::try_parse_from([
            "switchyard",
            "conversation",
            "log",
            "--id",
            "not-a-uuid",
        ]);
        assert!(parsed.is_err());
    }
}
