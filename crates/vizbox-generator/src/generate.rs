//! Chart code generation through the Anthropic messages API.

use crate::job::Job;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Default messages API endpoint.
pub const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";

/// API version header value.
pub const API_VERSION: &str = "2023-06-01";

/// Instructions sent as the system prompt on every request.
pub const SYSTEM_PROMPT: &str = "You are a data visualization engineer. \
Answer with one complete, self-contained HTML document that renders the requested chart. \
Load any charting library from a public CDN, inline all data, and do not add commentary \
outside the document.";

/// Errors raised while producing the artifact.
#[derive(Debug, Error)]
pub enum GenerateError {
    #[error("invalid job: {0}")]
    InvalidJob(String),

    #[error("ANTHROPIC_API_KEY is not set")]
    MissingApiKey,

    #[error("failed to create API client: {0}")]
    Client(String),

    #[error("API returned {status}: {message}")]
    Api { status: u16, message: String },

    #[error("API request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("response contained no text")]
    EmptyResponse,

    #[error("response is not an HTML document")]
    NotHtml,
}

/// Produces the raw model answer for a job.
#[async_trait]
pub trait CodeGenerator: Send + Sync {
    async fn generate(&self, job: &Job) -> Result<String, GenerateError>;
}

#[derive(Debug, Serialize)]
struct MessagesRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    system: &'a str,
    messages: Vec<Message>,
}

#[derive(Debug, Serialize)]
struct Message {
    role: &'static str,
    content: String,
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    #[serde(default)]
    content: Vec<ContentBlock>,
}

#[derive(Debug, Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    error: ApiErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ApiErrorDetail {
    message: String,
}

pub struct AnthropicGenerator {
    http: reqwest::Client,
    api_key: String,
    base_url: String,
}

impl std::fmt::Debug for AnthropicGenerator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AnthropicGenerator")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

impl AnthropicGenerator {
    /// Build a client for `api_key`, optionally against another endpoint.
    pub fn new(
        api_key: Option<String>,
        base_url: Option<String>,
        timeout: Duration,
    ) -> Result<Self, GenerateError> {
        let api_key = api_key
            .filter(|key| !key.trim().is_empty())
            .ok_or(GenerateError::MissingApiKey)?;
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| GenerateError::Client(e.to_string()))?;
        let base_url = base_url
            .filter(|url| !url.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string());

        Ok(Self {
            http,
            api_key,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl CodeGenerator for AnthropicGenerator {
    async fn generate(&self, job: &Job) -> Result<String, GenerateError> {
        let body = MessagesRequest {
            model: &job.model,
            max_tokens: job.max_tokens,
            system: SYSTEM_PROMPT,
            messages: vec![Message {
                role: "user",
                content: job.prompt(),
            }],
        };

        tracing::debug!(model = %job.model, max_tokens = job.max_tokens, "Calling messages API");
        let response = self
            .http
            .post(format!("{}/v1/messages", self.base_url))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", API_VERSION)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let raw = response.text().await.unwrap_or_default();
            let message = serde_json::from_str::<ApiErrorBody>(&raw)
                .map(|body| body.error.message)
                .unwrap_or(raw);
            return Err(GenerateError::Api {
                status: status.as_u16(),
                message,
            });
        }

        let parsed: MessagesResponse = response.json().await?;
        let text: String = parsed
            .content
            .into_iter()
            .filter(|block| block.kind == "text")
            .filter_map(|block| block.text)
            .collect::<Vec<_>>()
            .join("\n");

        if text.trim().is_empty() {
            return Err(GenerateError::EmptyResponse);
        }
        Ok(text)
    }
}

/// Reduce a model answer to the HTML document it contains.
///
/// Markdown code fences are stripped; the result must carry an `<html` or
/// `<!doctype` marker.
pub fn extract_html(text: &str) -> Result<String, GenerateError> {
    let body = strip_fences(text).trim();
    let lower = body.to_ascii_lowercase();

    let start = match (lower.find("<!doctype"), lower.find("<html")) {
        (Some(a), Some(b)) => a.min(b),
        (Some(a), None) | (None, Some(a)) => a,
        (None, None) => return Err(GenerateError::NotHtml),
    };
    let end = lower
        .rfind("</html>")
        .map(|i| i + "</html>".len())
        .filter(|&end| end > start)
        .unwrap_or(body.len());

    Ok(body[start..end].to_string())
}

fn strip_fences(text: &str) -> &str {
    let Some(open) = text.find("```") else {
        return text;
    };
    let after = &text[open + 3..];
    // Skip the info string (```html)
    let content = match after.find('\n') {
        Some(newline) => &after[newline + 1..],
        None => return text,
    };
    match content.rfind("```") {
        Some(close) => &content[..close],
        None => content,
    }
}
