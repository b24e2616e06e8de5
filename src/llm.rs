use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::GeminiConfig;
use crate::error::ModelError;

/// One fragment of a prompt.
#[derive(Debug, Clone, PartialEq)]
pub enum Part {
    Text(String),
    /// Binary image; `kind` is the short format tag ("jpeg", "png").
    Image { kind: String, data: Vec<u8> },
}

impl Part {
    pub fn text(text: impl Into<String>) -> Self {
        Part::Text(text.into())
    }

    pub fn image(kind: impl Into<String>, data: Vec<u8>) -> Self {
        Part::Image {
            kind: kind.into(),
            data,
        }
    }

    fn to_wire(&self) -> WirePart {
        match self {
            Part::Text(text) => WirePart {
                text: Some(text.clone()),
                inline_data: None,
            },
            Part::Image { kind, data } => WirePart {
                text: None,
                inline_data: Some(InlineData {
                    mime_type: format!("image/{}", kind),
                    data: STANDARD.encode(data),
                }),
            },
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct InlineData {
    pub mime_type: String,
    /// Base64-encoded payload
    pub data: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct WirePart {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub inline_data: Option<InlineData>,
}

impl std::fmt::Display for WirePart {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (&self.text, &self.inline_data) {
            (Some(text), _) => f.write_str(text),
            (None, Some(blob)) => write!(f, "[{} data]", blob.mime_type),
            (None, None) => Ok(()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Content {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default)]
    pub parts: Vec<WirePart>,
}

#[derive(Debug, Serialize)]
struct GenerateContentRequest {
    contents: Vec<Content>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct Candidate {
    #[serde(default)]
    pub content: Option<Content>,
    #[serde(default)]
    pub finish_reason: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct PromptFeedback {
    #[serde(default)]
    pub block_reason: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct GenerateResponse {
    #[serde(default)]
    pub candidates: Vec<Candidate>,
    #[serde(default)]
    pub prompt_feedback: Option<PromptFeedback>,
}

impl GenerateResponse {
    /// Build a response holding a single text candidate.
    #[cfg(test)]
    pub fn from_text(text: impl Into<String>) -> Self {
        Self {
            candidates: vec![Candidate {
                content: Some(Content {
                    role: Some("model".to_string()),
                    parts: vec![WirePart {
                        text: Some(text.into()),
                        inline_data: None,
                    }],
                }),
                finish_reason: Some("STOP".to_string()),
            }],
            prompt_feedback: None,
        }
    }

    /// Render the first part of the first candidate. Only that part is used.
    pub fn first_text(&self) -> Result<String, ModelError> {
        let candidate = match self.candidates.first() {
            Some(c) => c,
            None => {
                let reason = self
                    .prompt_feedback
                    .as_ref()
                    .and_then(|f| f.block_reason.clone());
                return Err(match reason {
                    Some(reason) => ModelError::Blocked(reason),
                    None => ModelError::NoCandidates,
                });
            }
        };

        candidate
            .content
            .as_ref()
            .and_then(|c| c.parts.first())
            .map(|part| part.to_string())
            .ok_or_else(|| {
                ModelError::EmptyCandidate(
                    candidate
                        .finish_reason
                        .clone()
                        .unwrap_or_else(|| "unknown".to_string()),
                )
            })
    }
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    error: ApiErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ApiErrorDetail {
    message: String,
}

/// Generative model seam. The relay only ever talks to this trait.
#[async_trait]
pub trait ModelClient: Send + Sync {
    async fn generate(&self, model: &str, parts: &[Part]) -> Result<GenerateResponse, ModelError>;
}

/// Gemini `generateContent` REST client
pub struct GeminiClient {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl GeminiClient {
    pub fn new(config: &GeminiConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
        })
    }
}

#[async_trait]
impl ModelClient for GeminiClient {
    async fn generate(&self, model: &str, parts: &[Part]) -> Result<GenerateResponse, ModelError> {
        let request = GenerateContentRequest {
            contents: vec![Content {
                role: Some("user".to_string()),
                parts: parts.iter().map(Part::to_wire).collect(),
            }],
        };

        let url = format!("{}/models/{}:generateContent", self.base_url, model);

        debug!(model, parts = parts.len(), "Sending request to Gemini");

        let response = self
            .client
            .post(&url)
            .header("x-goog-api-key", &self.api_key)
            .json(&request)
            .send()
            .await
            .map_err(ModelError::Transport)?;

        let status = response.status();
        let body = response.text().await.map_err(ModelError::Transport)?;

        if !status.is_success() {
            let message = serde_json::from_str::<ApiErrorBody>(&body)
                .map(|b| b.error.message)
                .unwrap_or(body);
            return Err(ModelError::Api { status, message });
        }

        serde_json::from_str(&body).map_err(|e| ModelError::Decode(e.to_string()))
    }
}
