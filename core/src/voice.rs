use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct IceServer {
    pub urls: Vec<String>,
}

/// Connection credentials handed to the client for a realtime voice session.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct VoiceGrant {
    pub conversation_id: Uuid,
    pub session_handle: String,
    pub client_secret: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    pub model: String,
    pub voice: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ice_servers: Vec<IceServer>,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct VoiceSessionRequest {
    pub conversation_id: Uuid,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct VoiceGrantResponse {
    pub grant: VoiceGrant,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct VoiceOfferRequest {
    pub conversation_id: Uuid,
    /// SDP offer from the client transport
    pub sdp: String,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct VoiceOfferResponse {
    pub conversation_id: Uuid,
    pub answer_sdp: String,
    /// False when the bridge was already streaming and the offer only refreshed the answer
    pub stream_started: bool,
}

/// Transport connection states reported by the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl ConnectionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Failed | Self::Closed)
    }
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct ConnectionStateRequest {
    pub state: ConnectionState,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_failed_and_closed_are_terminal() {
        assert!(ConnectionState::Failed.is_terminal());
        assert!(ConnectionState::Closed.is_terminal());
        assert!(!ConnectionState::Disconnected.is_terminal());
        assert!(!ConnectionState::Connected.is_terminal());
    }
}
