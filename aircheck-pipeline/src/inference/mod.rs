//! Model inference abstraction
//!
//! Stages talk to the model provider through `InferenceClient` so the
//! pipeline logic stays testable without network access. The trait is
//! deliberately small: one generation call (optionally with an audio
//! attachment and a response schema) and one embedding call.

mod gemini;

pub use gemini::GeminiClient;

use async_trait::async_trait;
use std::path::PathBuf;

use aircheck_common::Result;

/// One generation request against a named model.
#[derive(Debug, Clone)]
pub struct GenerateRequest {
    /// Model identifier, e.g. `gemini-2.5-pro`.
    pub model: String,
    /// Optional system instruction.
    pub system: Option<String>,
    /// User prompt text.
    pub prompt: String,
    /// Audio file to attach, if the stage is multimodal.
    pub audio_path: Option<PathBuf>,
    /// JSON schema the response must conform to. When set, the provider
    /// is asked for structured JSON output.
    pub response_schema: Option<serde_json::Value>,
}

impl GenerateRequest {
    pub fn new(model: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            system: None,
            prompt: prompt.into(),
            audio_path: None,
            response_schema: None,
        }
    }

    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }

    pub fn with_audio(mut self, path: PathBuf) -> Self {
        self.audio_path = Some(path);
        self
    }

    pub fn with_schema(mut self, schema: serde_json::Value) -> Self {
        self.response_schema = Some(schema);
        self
    }
}

/// Text produced by a generation call.
#[derive(Debug, Clone)]
pub struct GenerateResponse {
    pub text: String,
    /// Provider-reported grounding/citation metadata, when present.
    pub grounding_metadata: Option<String>,
}

/// Provider seam used by every stage.
///
/// Implementations map provider failures onto `Error::Inference` with an
/// `ErrorKind` that drives the escalation policy: `Transient` for rate
/// limits, timeouts and 5xx, `Auth` for credential rejections,
/// `Validation` for requests the provider refuses.
#[async_trait]
pub trait InferenceClient: Send + Sync {
    async fn generate(&self, request: &GenerateRequest) -> Result<GenerateResponse>;

    /// Embed a document with the given embedding model.
    async fn embed(&self, model: &str, document: &str) -> Result<Vec<f32>>;
}
