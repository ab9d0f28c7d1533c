//! Gemini API client
//!
//! Speaks the `generateContent` and `embedContent` REST endpoints with
//! typed request/response models. Audio attachments are sent inline as
//! base64; the clips this pipeline produces stay well under the inline
//! size limit.

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::debug;

use aircheck_common::{Error, Result};

use super::{GenerateRequest, GenerateResponse, InferenceClient};

const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";

/// Gemini REST client shared by all stages of one process.
pub struct GeminiClient {
    http_client: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl GeminiClient {
    pub fn new(base_url: Option<&str>, api_key: String, timeout: Duration) -> Result<Self> {
        let http_client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::transient(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            http_client,
            base_url: base_url.unwrap_or(DEFAULT_BASE_URL).trim_end_matches('/').to_string(),
            api_key,
        })
    }

    async fn post_json<T: Serialize, R: for<'de> Deserialize<'de>>(
        &self,
        url: &str,
        body: &T,
    ) -> Result<R> {
        let response = self
            .http_client
            .post(url)
            .query(&[("key", self.api_key.as_str())])
            .json(body)
            .send()
            .await
            .map_err(request_error)?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(status_error(status, &text));
        }

        response
            .json()
            .await
            .map_err(|e| Error::validation(format!("malformed provider response: {e}")))
    }
}

// Timeouts, refused connections, and mid-flight resets all look the same
// to the caller: worth retrying.
fn request_error(e: reqwest::Error) -> Error {
    Error::transient(format!("request failed: {e}"))
}

/// Map an HTTP status onto the error kind the escalation policy keys on.
fn status_error(status: reqwest::StatusCode, body: &str) -> Error {
    let message = format!("provider returned {}: {}", status.as_u16(), truncate(body, 500));
    match status.as_u16() {
        401 | 403 => Error::auth(message),
        429 => Error::transient(message),
        500..=599 => Error::transient(message),
        _ => Error::validation(message),
    }
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

fn mime_type_for(path: &Path) -> &'static str {
    match path.extension().and_then(|e| e.to_str()) {
        Some("wav") => "audio/wav",
        Some("flac") => "audio/flac",
        Some("ogg") => "audio/ogg",
        Some("m4a") | Some("aac") => "audio/aac",
        _ => "audio/mpeg",
    }
}

// ---- wire models ----

#[derive(Serialize)]
struct GenerateContentRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<Content>,
    contents: Vec<Content>,
    #[serde(skip_serializing_if = "Option::is_none")]
    generation_config: Option<GenerationConfig>,
}

#[derive(Serialize)]
struct Content {
    parts: Vec<Part>,
}

#[derive(Serialize)]
struct Part {
    #[serde(skip_serializing_if = "Option::is_none")]
    text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    inline_data: Option<InlineData>,
}

#[derive(Serialize)]
struct InlineData {
    mime_type: String,
    data: String,
}

#[derive(Serialize)]
struct GenerationConfig {
    response_mime_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_schema: Option<serde_json::Value>,
}

#[derive(Deserialize)]
struct GenerateContentResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Deserialize)]
struct Candidate {
    content: Option<CandidateContent>,
    #[serde(rename = "groundingMetadata")]
    grounding_metadata: Option<serde_json::Value>,
}

#[derive(Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<CandidatePart>,
}

#[derive(Deserialize)]
struct CandidatePart {
    text: Option<String>,
}

#[derive(Serialize)]
struct EmbedContentRequest {
    content: Content,
}

#[derive(Deserialize)]
struct EmbedContentResponse {
    embedding: EmbeddingValues,
}

#[derive(Deserialize)]
struct EmbeddingValues {
    values: Vec<f32>,
}

#[async_trait]
impl InferenceClient for GeminiClient {
    async fn generate(&self, request: &GenerateRequest) -> Result<GenerateResponse> {
        let mut parts = vec![Part {
            text: Some(request.prompt.clone()),
            inline_data: None,
        }];

        if let Some(audio_path) = &request.audio_path {
            let bytes = tokio::fs::read(audio_path).await?;
            debug!(
                path = %audio_path.display(),
                bytes = bytes.len(),
                "Attaching audio to generation request"
            );
            parts.push(Part {
                text: None,
                inline_data: Some(InlineData {
                    mime_type: mime_type_for(audio_path).to_string(),
                    data: BASE64.encode(bytes),
                }),
            });
        }

        let body = GenerateContentRequest {
            system_instruction: request.system.as_ref().map(|s| Content {
                parts: vec![Part {
                    text: Some(s.clone()),
                    inline_data: None,
                }],
            }),
            contents: vec![Content { parts }],
            generation_config: request.response_schema.as_ref().map(|schema| GenerationConfig {
                response_mime_type: "application/json".to_string(),
                response_schema: Some(schema.clone()),
            }),
        };

        let url = format!("{}/models/{}:generateContent", self.base_url, request.model);
        let response: GenerateContentResponse = self.post_json(&url, &body).await?;

        let candidate = response
            .candidates
            .into_iter()
            .next()
            .ok_or_else(|| Error::validation("provider returned no candidates"))?;

        let text: String = candidate
            .content
            .map(|c| {
                c.parts
                    .into_iter()
                    .filter_map(|p| p.text)
                    .collect::<Vec<_>>()
                    .join("")
            })
            .unwrap_or_default();
        if text.is_empty() {
            return Err(Error::validation("provider returned an empty candidate"));
        }

        Ok(GenerateResponse {
            text,
            grounding_metadata: candidate
                .grounding_metadata
                .as_ref()
                .map(|m| m.to_string()),
        })
    }

    async fn embed(&self, model: &str, document: &str) -> Result<Vec<f32>> {
        let body = EmbedContentRequest {
            content: Content {
                parts: vec![Part {
                    text: Some(document.to_string()),
                    inline_data: None,
                }],
            },
        };
        let url = format!("{}/models/{}:embedContent", self.base_url, model);
        let response: EmbedContentResponse = self.post_json(&url, &body).await?;
        if response.embedding.values.is_empty() {
            return Err(Error::validation("provider returned an empty embedding"));
        }
        Ok(response.embedding.values)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aircheck_common::ErrorKind;

    #[test]
    fn auth_statuses_map_to_auth_kind() {
        let err = status_error(reqwest::StatusCode::UNAUTHORIZED, "no key");
        assert_eq!(err.kind(), ErrorKind::Auth);
        let err = status_error(reqwest::StatusCode::FORBIDDEN, "denied");
        assert_eq!(err.kind(), ErrorKind::Auth);
    }

    #[test]
    fn throttling_and_server_errors_are_transient() {
        let err = status_error(reqwest::StatusCode::TOO_MANY_REQUESTS, "slow down");
        assert_eq!(err.kind(), ErrorKind::Transient);
        let err = status_error(reqwest::StatusCode::SERVICE_UNAVAILABLE, "overloaded");
        assert_eq!(err.kind(), ErrorKind::Transient);
    }

    #[test]
    fn client_errors_are_validation() {
        let err = status_error(reqwest::StatusCode::BAD_REQUEST, "bad schema");
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    #[test]
    fn mime_types_follow_extension() {
        assert_eq!(mime_type_for(Path::new("a.mp3")), "audio/mpeg");
        assert_eq!(mime_type_for(Path::new("a.wav")), "audio/wav");
        assert_eq!(mime_type_for(Path::new("noext")), "audio/mpeg");
    }
}
