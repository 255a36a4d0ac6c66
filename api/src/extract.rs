//! Custom extractors that convert axum rejections to structured AppError responses.
//!
//! Use `AppJson<T>` as a drop-in replacement for `axum::Json<T>` in handler signatures.
//! `TurnPayload` accepts a chat turn either as JSON or as a multipart upload.

use axum::{
    Json,
    extract::{FromRequest, Multipart, Request, rejection::JsonRejection},
    http::header,
};
use switchyard_core::conversation::{SendMessageRequest, TurnSource};
use switchyard_core::dispatch::Attachment;

use crate::error::AppError;

/// JSON extractor that converts deserialization errors to structured `AppError` responses.
pub struct AppJson<T>(pub T);

impl<S, T> FromRequest<S> for AppJson<T>
where
    Json<T>: FromRequest<S, Rejection = JsonRejection>,
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        match Json::<T>::from_request(req, state).await {
            Ok(Json(value)) => Ok(AppJson(value)),
            Err(rejection) => Err(map_json_rejection(rejection)),
        }
    }
}

/// Convert a `JsonRejection` to a structured `AppError::Validation`.
pub fn map_json_rejection(rejection: JsonRejection) -> AppError {
    let body_text = rejection.body_text();
    let field_hint = extract_field_from_serde_message(&body_text);

    AppError::Validation {
        message: format!("Invalid request body: {body_text}"),
        field: Some(field_hint.unwrap_or("body".to_string())),
        received: None,
        docs_hint: Some(
            "Check the request body against the endpoint's schema (GET /api-doc/openapi.json)."
                .to_string(),
        ),
    }
}

/// Pull `foo` out of serde messages such as "missing field `foo`".
fn extract_field_from_serde_message(msg: &str) -> Option<String> {
    for pattern in ["missing field `", "unknown field `", "unknown variant `"] {
        if let Some(start) = msg.find(pattern) {
            let after = &msg[start + pattern.len()..];
            if let Some(end) = after.find('`') {
                return Some(after[..end].to_string());
            }
        }
    }
    None
}

/// A chat turn as posted to `POST /conversations/{id}/messages`.
#[derive(Debug)]
pub struct TurnPayload {
    pub content: String,
    pub source: Option<TurnSource>,
    pub attachment: Option<Attachment>,
}

impl<S> FromRequest<S> for TurnPayload
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let is_multipart = req
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .is_some_and(|value| value.starts_with("multipart/form-data"));

        if !is_multipart {
            let AppJson(body) = AppJson::<SendMessageRequest>::from_request(req, state).await?;
            if body.content.trim().is_empty() {
                return Err(AppError::validation("content must not be empty", "content"));
            }
            return Ok(TurnPayload {
                content: body.content,
                source: body.source,
                attachment: None,
            });
        }

        let mut multipart = Multipart::from_request(req, state)
            .await
            .map_err(|rejection| AppError::validation(rejection.body_text(), "body"))?;
        read_multipart(&mut multipart).await
    }
}

async fn read_multipart(multipart: &mut Multipart) -> Result<TurnPayload, AppError> {
    let mut content = None;
    let mut source = None;
    let mut attachment = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|err| AppError::validation(err.body_text(), "body"))?
    {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "content" => {
                let text = field
                    .text()
                    .await
                    .map_err(|err| AppError::validation(err.body_text(), "content"))?;
                content = Some(text);
            }
            "source" => {
                let raw = field
                    .text()
                    .await
                    .map_err(|err| AppError::validation(err.body_text(), "source"))?;
                let parsed = TurnSource::parse(&raw).ok_or_else(|| AppError::Validation {
                    message: format!("Unknown source '{}'", raw.trim()),
                    field: Some("source".to_string()),
                    received: Some(serde_json::Value::String(raw.clone())),
                    docs_hint: Some(
                        "Use one of: text, upload, voice_transcription.".to_string(),
                    ),
                })?;
                source = Some(parsed);
            }
            "attachment" => {
                let filename = field.file_name().unwrap_or("attachment").to_string();
                let mime_type = field
                    .content_type()
                    .unwrap_or("application/octet-stream")
                    .to_string();
                let data = field
                    .bytes()
                    .await
                    .map_err(|err| AppError::validation(err.body_text(), "attachment"))?;
                attachment = Some(Attachment::new(filename, mime_type, data.to_vec()));
            }
            other => {
                tracing::debug!(field = other, "ignoring unknown multipart field");
            }
        }
    }

    let content = match (content, &attachment) {
        (Some(text), _) if !text.trim().is_empty() => text,
        (_, Some(_)) => String::new(),
        _ => {
            return Err(AppError::validation(
                "content is required unless an attachment is provided",
                "content",
            ));
        }
    };

    Ok(TurnPayload {
        content,
        source,
        attachment,
    })
}
