use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};

use crate::config::GeminiConfig;

/// Sent when the Gemini call fails at the transport or HTTP status level.
pub const FALLBACK_API_ERROR: &str =
    "တောင်းပန်ပါတယ်၊ ကျွန်တော့်မှာ အမှားအယွင်းတစ်ခုဖြစ်နေလို့ပါ။ ခဏနေ ပြန်ကြိုးစားပေးပါနော်။";
/// Sent when Gemini answers but the reply text can't be located.
pub const FALLBACK_NO_ANSWER: &str = "တောင်းပန်ပါတယ်၊ အဖြေရှာမတွေ့လို့ပါ။";
/// Sent when the located reply text is blank.
pub const FALLBACK_EMPTY_REPLY: &str = "တောင်းပန်ပါတယ်၊ အဆင်မပြေဖြစ်သွားလို့ပါ။";

/// Turns a user's message into the text the page should answer with.
///
/// Implementations never fail: every error path resolves to a fallback string.
#[async_trait]
pub trait ReplyGenerator: Send + Sync {
    async fn generate(&self, user_message: &str) -> String;
}

#[derive(Debug, thiserror::Error)]
pub enum ReplyError {
    #[error("request to Gemini failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("Gemini API error ({status}): {body}")]
    Status { status: StatusCode, body: String },
    #[error("unexpected Gemini response shape: {reason}")]
    Malformed { reason: String, body: String },
}

#[derive(Debug, Serialize, PartialEq)]
pub struct GenerateRequest {
    contents: Vec<Content>,
}

#[derive(Debug, Serialize, PartialEq)]
struct Content {
    parts: Vec<Part>,
}

#[derive(Debug, Serialize, PartialEq)]
struct Part {
    text: String,
}

impl GenerateRequest {
    /// The persona prompt and the question travel together in a single text part.
    pub fn new(system_prompt: &str, user_message: &str) -> Self {
        Self {
            contents: vec![Content {
                parts: vec![Part {
                    text: format!("{system_prompt}\n\nUser Question: {user_message}"),
                }],
            }],
        }
    }
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    candidates: Option<Vec<Candidate>>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    content: Option<CandidateContent>,
}

#[derive(Debug, Deserialize)]
struct CandidateContent {
    parts: Option<Vec<ResponsePart>>,
}

#[derive(Debug, Deserialize)]
struct ResponsePart {
    text: Option<String>,
}

/// Pulls `candidates[0].content.parts[0].text` out of a raw response body.
fn extract_text(body: &str) -> Result<String, ReplyError> {
    let malformed = |reason: &str| ReplyError::Malformed {
        reason: reason.to_string(),
        body: body.to_string(),
    };

    let parsed: GenerateResponse =
        serde_json::from_str(body).map_err(|e| malformed(&format!("invalid JSON: {e}")))?;

    parsed
        .candidates
        .ok_or_else(|| malformed("no candidates"))?
        .into_iter()
        .next()
        .ok_or_else(|| malformed("empty candidates"))?
        .content
        .ok_or_else(|| malformed("candidate has no content"))?
        .parts
        .and_then(|parts| parts.into_iter().next())
        .ok_or_else(|| malformed("content has no parts"))?
        .text
        .ok_or_else(|| malformed("part has no text"))
}

/// Maps the outcome of a Gemini call onto the text that will be sent.
pub fn reply_text(outcome: Result<String, ReplyError>) -> String {
    match outcome {
        Ok(text) => {
            let trimmed = text.trim();
            if trimmed.is_empty() {
                warn!("Gemini returned an empty reply");
                FALLBACK_EMPTY_REPLY.to_string()
            } else {
                trimmed.to_string()
            }
        }
        Err(e @ (ReplyError::Transport(_) | ReplyError::Status { .. })) => {
            error!("Error calling Gemini API: {}", e);
            FALLBACK_API_ERROR.to_string()
        }
        Err(ReplyError::Malformed { reason, body }) => {
            error!("Error parsing Gemini response: {}", reason);
            error!("Full Gemini response: {}", body);
            FALLBACK_NO_ANSWER.to_string()
        }
    }
}

pub struct GeminiClient {
    client: reqwest::Client,
    config: GeminiConfig,
}

impl GeminiClient {
    pub fn new(client: reqwest::Client, config: GeminiConfig) -> Self {
        Self { client, config }
    }

    pub async fn request_reply(&self, user_message: &str) -> Result<String, ReplyError> {
        let request = GenerateRequest::new(&self.config.system_prompt, user_message);

        debug!("Sending request to Gemini model {}", self.config.model);

        let response = self
            .client
            .post(self.config.generate_url())
            .header("Content-Type", "application/json")
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ReplyError::Status { status, body });
        }

        let body = response.text().await?;
        extract_text(&body)
    }
}

#[async_trait]
impl ReplyGenerator for GeminiClient {
    async fn generate(&self, user_message: &str) -> String {
        reply_text(self.request_reply(user_message).await)
    }
}
