//! Facebook Messenger webhook schema, subscription handshake, and Send API client.

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::MessengerConfig;
use crate::platform::{IncomingMessage, MessageSender};

// ── Subscription handshake ─────────────────────────────────────────────────────

/// Query string of `GET /webhook`.
#[derive(Debug, Default)]
pub struct VerifyParams {
    pub mode: Option<String>,
    pub challenge: Option<String>,
    pub verify_token: Option<String>,
}

impl VerifyParams {
    /// Builds the params from decoded query pairs. The first occurrence of a
    /// repeated key wins; unknown keys are ignored.
    pub fn from_pairs(pairs: Vec<(String, String)>) -> Self {
        let mut params = Self::default();
        for (key, value) in pairs {
            let slot = match key.as_str() {
                "hub.mode" => &mut params.mode,
                "hub.challenge" => &mut params.challenge,
                "hub.verify_token" => &mut params.verify_token,
                _ => continue,
            };
            if slot.is_none() {
                *slot = Some(value);
            }
        }
        params
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum VerifyOutcome {
    /// Echo this challenge back with 200.
    Confirmed(String),
    /// A subscribe request carrying the wrong token.
    Mismatch,
    /// Not a subscribe request at all.
    NotRequested,
}

/// Checks a subscription request against the configured verify token.
///
/// An empty configured token never matches, so an unconfigured relay can't be
/// claimed by a request that simply omits `hub.verify_token`.
pub fn verify_subscription(params: &VerifyParams, expected_token: &str) -> VerifyOutcome {
    let challenge = match (params.mode.as_deref(), params.challenge.as_deref()) {
        (Some("subscribe"), Some(challenge)) if !challenge.is_empty() => challenge,
        _ => return VerifyOutcome::NotRequested,
    };

    match params.verify_token.as_deref() {
        Some(token) if !expected_token.is_empty() && token == expected_token => {
            VerifyOutcome::Confirmed(challenge.to_string())
        }
        _ => VerifyOutcome::Mismatch,
    }
}

// ── Inbound callback ───────────────────────────────────────────────────────────

/// Body of `POST /webhook`. Only the fields the relay reads are modelled.
#[derive(Debug, Deserialize)]
pub struct WebhookPayload {
    #[serde(default)]
    pub object: String,
    #[serde(default)]
    pub entry: Vec<Entry>,
}

/// Events stay raw until extraction so one odd event can't sink the batch.
#[derive(Debug, Deserialize)]
pub struct Entry {
    #[serde(default)]
    pub messaging: Vec<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
pub struct MessagingEvent {
    pub sender: Option<Participant>,
    pub message: Option<EventMessage>,
}

#[derive(Debug, Deserialize)]
pub struct Participant {
    pub id: String,
}

#[derive(Debug, Deserialize)]
pub struct EventMessage {
    pub text: Option<String>,
    pub is_echo: Option<bool>,
}

impl WebhookPayload {
    /// Text messages written to the page, in payload order.
    ///
    /// Payloads for anything other than a page subscription yield nothing.
    /// Echoes of the page's own messages, attachments without text, events
    /// without a sender, and events that don't fit the schema are skipped.
    pub fn incoming_messages(&self) -> Vec<IncomingMessage> {
        if self.object != "page" {
            debug!("Ignoring webhook for object type {:?}", self.object);
            return Vec::new();
        }

        self.entry
            .iter()
            .flat_map(|entry| entry.messaging.iter())
            .filter_map(|raw| {
                let event = match MessagingEvent::deserialize(raw) {
                    Ok(event) => event,
                    Err(e) => {
                        warn!("Skipping malformed messaging event: {} ({})", e, raw);
                        return None;
                    }
                };
                let message = event.message.as_ref()?;
                if message.is_echo == Some(true) {
                    debug!("Skipping echo event");
                    return None;
                }
                let Some(sender) = event.sender.as_ref() else {
                    warn!("Skipping message event without a sender");
                    return None;
                };
                let Some(text) = message.text.as_ref() else {
                    debug!("Skipping non-text message from {}", sender.id);
                    return None;
                };
                Some(IncomingMessage {
                    sender_id: sender.id.clone(),
                    text: text.clone(),
                })
            })
            .collect()
    }
}

// ── Send API ───────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum SendError {
    #[error("request to Send API failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("Send API error ({status}): {body}")]
    Status { status: StatusCode, body: String },
}

#[derive(Debug, Serialize)]
struct SendRequest<'a> {
    messaging_type: &'static str,
    recipient: Recipient<'a>,
    message: OutgoingText<'a>,
}

#[derive(Debug, Serialize)]
struct Recipient<'a> {
    id: &'a str,
}

#[derive(Debug, Serialize)]
struct OutgoingText<'a> {
    text: &'a str,
}

impl<'a> SendRequest<'a> {
    fn response(recipient_id: &'a str, text: &'a str) -> Self {
        Self {
            messaging_type: "RESPONSE",
            recipient: Recipient { id: recipient_id },
            message: OutgoingText { text },
        }
    }
}

pub struct MessengerClient {
    client: reqwest::Client,
    config: MessengerConfig,
}

impl MessengerClient {
    pub fn new(client: reqwest::Client, config: MessengerConfig) -> Self {
        Self { client, config }
    }
}

#[async_trait]
impl MessageSender for MessengerClient {
    async fn send(&self, recipient_id: &str, text: &str) -> Result<(), SendError> {
        let response = self
            .client
            .post(self.config.send_url())
            .header("Content-Type", "application/json")
            .json(&SendRequest::response(recipient_id, text))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SendError::Status { status, body });
        }

        info!("Successfully sent message to {}", recipient_id);
        Ok(())
    }
}
