use std::io::Write;
use std::path::{Path, PathBuf};

use reqwest::multipart::Form;
use serde::{Deserialize, Serialize};
use serde_json::json;
use switchyard_core::identity::{SESSION_HEADER, SESSION_STATUS_HEADER};

/// Session identity remembered between CLI invocations, per API URL.
#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub struct StoredSession {
    pub api_url: String,
    pub session_id: String,
}

pub fn client() -> reqwest::Client {
    reqwest::Client::new()
}

pub fn exit_error(message: &str, docs_hint: Option<&str>) -> ! {
    let mut err = json!({
        "error": "cli_error",
        "message": message
    });
    if let Some(hint) = docs_hint {
        err["docs_hint"] = json!(hint);
    }
    eprintln!("{}", serde_json::to_string_pretty(&err).unwrap_or_else(|_| err.to_string()));
    std::process::exit(4);
}

pub fn session_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("switchyard")
        .join("session.json")
}

fn read_session(path: &Path) -> Option<StoredSession> {
    let data = std::fs::read_to_string(path).ok()?;
    serde_json::from_str(&data).ok()
}

fn write_session(path: &Path, session: &StoredSession) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let data = serde_json::to_string_pretty(session)?;

    let mut options = std::fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options.open(path)?;
    file.write_all(data.as_bytes())
}

/// Stored session id for `api_url`; a session minted by another server is ignored.
pub fn load_session(api_url: &str) -> Option<String> {
    read_session(&session_path())
        .filter(|stored| stored.api_url == api_url)
        .map(|stored| stored.session_id)
}

fn remember_session(api_url: &str, session_id: &str) {
    let session = StoredSession {
        api_url: api_url.to_string(),
        session_id: session_id.to_string(),
    };
    if let Err(e) = write_session(&session_path(), &session) {
        eprintln!("warning: could not save session to {}: {e}", session_path().display());
    }
}

pub enum RequestBody {
    Empty,
    Json(serde_json::Value),
    Multipart(Form),
}

/// Execute an API request under the stored session, print the response and
/// return a structured exit code. The session id echoed by the server is
/// saved for the next invocation.
///
/// Exit codes: 0=success (2xx), 1=client error (4xx), 2=server error (5xx),
///             3=connection error, 4=usage error
pub async fn api_request(
    api_url: &str,
    method: reqwest::Method,
    path: &str,
    session: Option<&str>,
    body: RequestBody,
    raw: bool,
) -> i32 {
    let mut req = client().request(method, format!("{api_url}{path}"));

    if let Some(id) = session {
        req = req.header(SESSION_HEADER, id);
    }

    req = match body {
        RequestBody::Empty => req,
        RequestBody::Json(b) => req.json(&b),
        RequestBody::Multipart(form) => req.multipart(form),
    };

    let resp = match req.send().await {
        Ok(r) => r,
        Err(e) => {
            let err = json!({
                "error": "connection_error",
                "message": format!("{e}"),
                "docs_hint": "Is the API server running? Check SWITCHYARD_API_URL."
            });
            eprintln!("{}", serde_json::to_string_pretty(&err).unwrap_or_default());
            return 3;
        }
    };

    let status = resp.status().as_u16();
    let exit_code = match status {
        200..=299 => 0,
        400..=499 => 1,
        _ => 2,
    };

    let echoed = resp
        .headers()
        .get(SESSION_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    if let Some(id) = &echoed
        && session != Some(id.as_str())
    {
        let reason = resp
            .headers()
            .get(SESSION_STATUS_HEADER)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("new");
        remember_session(api_url, id);
        if session.is_some() {
            eprintln!("note: server issued a {reason} session id {id}");
        }
    }

    let resp_body: serde_json::Value = if status == 204 {
        json!({ "status": "ok" })
    } else {
        match resp.json().await {
            Ok(v) => v,
            Err(e) => json!({"raw_error": format!("Failed to parse response as JSON: {e}")}),
        }
    };

    let formatted = if raw {
        serde_json::to_string(&resp_body)
    } else {
        serde_json::to_string_pretty(&resp_body)
    }
    .unwrap_or_else(|_| resp_body.to_string());

    if exit_code == 0 {
        println!("{formatted}");
    } else {
        eprintln!("{formatted}");
    }

    exit_code
}

/// MIME type for an attachment by file extension.
pub fn guess_mime(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
        .unwrap_or_default();
    match ext.as_str() {
        "webm" => "audio/webm",
        "mp3" => "audio/mpeg",
        "wav" => "audio/wav",
        "ogg" | "oga" => "audio/ogg",
        "m4a" | "mp4" => "audio/mp4",
        "pdf" => "application/pdf",
        "txt" => "text/plain",
        "md" | "markdown" => "text/markdown",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        _ => "application/octet-stream",
    }
}
