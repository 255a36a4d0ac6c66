use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Header carrying the client's session identifier on requests and the
/// resolved identifier on responses.
pub const SESSION_HEADER: &str = "x-session-id";

/// Response header signalling whether the session was `new`, `rotated` or `existing`.
pub const SESSION_STATUS_HEADER: &str = "x-session-status";

/// Mint a fresh session identifier (UUIDv7, time-sortable).
pub fn mint_session_id() -> Uuid {
    Uuid::now_v7()
}

/// Accept a client-presented identifier only if it is UUID-shaped.
///
/// Surrounding whitespace is ignored; anything else (including the nil UUID)
/// is rejected so the caller mints a new identifier instead.
pub fn parse_session_id(raw: &str) -> Option<Uuid> {
    let parsed = Uuid::parse_str(raw.trim()).ok()?;
    if parsed.is_nil() { None } else { Some(parsed) }
}

/// Stable pseudonymous key for a network origin. Raw addresses never reach
/// the usage snapshot or the audit log.
pub fn origin_fingerprint(address: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(address.trim().as_bytes());
    let digest = hex::encode(hasher.finalize());
    format!("org_{}", &digest[..24])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minted_ids_parse_back() {
        let id = mint_session_id();
        assert_eq!(parse_session_id(&id.to_string()), Some(id));
    }

    #[test]
    fn parse_trims_whitespace() {
        let id = mint_session_id();
        assert_eq!(parse_session_id(&format!("  {id}\n")), Some(id));
    }

    #[test]
    fn parse_rejects_malformed_and_nil() {
        assert_eq!(parse_session_id("not-a-session"), None);
        assert_eq!(parse_session_id(""), None);
        assert_eq!(parse_session_id("00000000-0000-0000-0000-000000000000"), None);
        assert_eq!(parse_session_id("123e4567-e89b-12d3-a456-42661417400"), None);
    }

    #[test]
    fn origin_fingerprint_is_stable_and_opaque() {
        let a = origin_fingerprint("203.0.113.9");
        assert_eq!(a, origin_fingerprint(" 203.0.113.9 "));
        assert_ne!(a, origin_fingerprint("203.0.113.10"));
        assert!(a.starts_with("org_"));
        assert!(!a.contains("203.0.113.9"));
        assert_eq!(a.len(), 4 + 24);
    }
}
