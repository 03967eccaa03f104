use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Query, State},
    http::StatusCode,
    routing::get,
    Router,
};
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::llm::{GeminiClient, ReplyGenerator};
use crate::platform::messenger::{
    verify_subscription, MessengerClient, VerifyOutcome, VerifyParams, WebhookPayload,
};
use crate::platform::{IncomingMessage, MessageSender};

const LIVENESS_TEXT: &str = "Hello! Your Burmese Chatbot server is running.";
const VERIFY_MISMATCH_TEXT: &str = "Verification token mismatch";
const VERIFY_DEFAULT_TEXT: &str = "Hello world";
const ACK_TEXT: &str = "ok";

/// Shared application state
pub struct AppState {
    verify_token: String,
    generator: Arc<dyn ReplyGenerator>,
    sender: Arc<dyn MessageSender>,
}

impl AppState {
    pub fn new(
        verify_token: String,
        generator: Arc<dyn ReplyGenerator>,
        sender: Arc<dyn MessageSender>,
    ) -> Self {
        Self {
            verify_token,
            generator,
            sender,
        }
    }

    /// Wires the Gemini and Messenger clients over one HTTP client.
    pub fn from_config(config: &Config, http: reqwest::Client) -> Self {
        let generator = GeminiClient::new(http.clone(), config.gemini.clone());
        let sender = MessengerClient::new(http, config.messenger.clone());
        Self::new(
            config.messenger.verify_token.clone(),
            Arc::new(generator),
            Arc::new(sender),
        )
    }

    /// Generates a reply to one message and sends it back to its author.
    ///
    /// A failed send is logged and dropped; nothing is retried.
    pub async fn relay(&self, message: &IncomingMessage) {
        info!("Message from {}", message.sender_id);
        debug!("Message text from {}: {}", message.sender_id, message.text);

        let reply = self.generator.generate(&message.text).await;

        if let Err(e) = self.sender.send(&message.sender_id, &reply).await {
            error!("Error sending message to {}: {}", message.sender_id, e);
        }
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(home))
        .route("/webhook", get(verify_webhook).post(handle_webhook))
        .with_state(state)
}

async fn home() -> &'static str {
    LIVENESS_TEXT
}

async fn verify_webhook(
    State(state): State<Arc<AppState>>,
    Query(pairs): Query<Vec<(String, String)>>,
) -> (StatusCode, String) {
    let params = VerifyParams::from_pairs(pairs);
    match verify_subscription(&params, &state.verify_token) {
        VerifyOutcome::Confirmed(challenge) => {
            info!("Webhook subscription verified");
            (StatusCode::OK, challenge)
        }
        VerifyOutcome::Mismatch => {
            warn!("Webhook verification failed: token mismatch");
            (StatusCode::FORBIDDEN, VERIFY_MISMATCH_TEXT.to_string())
        }
        VerifyOutcome::NotRequested => (StatusCode::OK, VERIFY_DEFAULT_TEXT.to_string()),
    }
}

/// Messages are relayed one at a time, in payload order, before the platform
/// gets its acknowledgement. The acknowledgement is always 200 "ok".
async fn handle_webhook(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> (StatusCode, &'static str) {
    let payload: WebhookPayload = match serde_json::from_slice(&body) {
        Ok(payload) => payload,
        Err(e) => {
            warn!(
                "Ignoring malformed webhook payload: {} ({})",
                e,
                String::from_utf8_lossy(&body)
            );
            return (StatusCode::OK, ACK_TEXT);
        }
    };

    for message in payload.incoming_messages() {
        state.relay(&message).await;
    }

    (StatusCode::OK, ACK_TEXT)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::SendError;
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::Request;
    use serde_json::json;
    use tokio::sync::Mutex;
    use tower::ServiceExt;

    #[derive(Default)]
    struct RecordingGenerator {
        calls: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl ReplyGenerator for RecordingGenerator {
        async fn generate(&self, user_message: &str) -> String {
            self.calls.lock().await.push(user_message.to_string());
            format!("reply to {user_message}")
        }
    }

    #[derive(Default)]
    struct RecordingSender {
        fail: bool,
        calls: Mutex<Vec<(String, String)>>,
    }

    #[async_trait]
    impl MessageSender for RecordingSender {
        async fn send(&self, recipient_id: &str, text: &str) -> Result<(), SendError> {
            self.calls
                .lock()
                .await
                .push((recipient_id.to_string(), text.to_string()));
            if self.fail {
                Err(SendError::Status {
                    status: reqwest::StatusCode::INTERNAL_SERVER_ERROR,
                    body: "down".to_string(),
                })
            } else {
                Ok(())
            }
        }
    }

    struct Harness {
        app: Router,
        generator: Arc<RecordingGenerator>,
        sender: Arc<RecordingSender>,
    }

    fn harness(failing_sender: bool) -> Harness {
        let generator = Arc::new(RecordingGenerator::default());
        let sender = Arc::new(RecordingSender {
            fail: failing_sender,
            ..Default::default()
        });
        let state = AppState::new("secret".to_string(), generator.clone(), sender.clone());
        Harness {
            app: router(Arc::new(state)),
            generator,
            sender,
        }
    }

    async fn call(app: Router, request: Request<Body>) -> (StatusCode, String) {
        let response = app.oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, String::from_utf8(bytes.to_vec()).unwrap())
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    fn post_webhook(body: impl Into<Body>) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/webhook")
            .header("content-type", "application/json")
            .body(body.into())
            .unwrap()
    }

    fn page_payload(events: serde_json::Value) -> String {
        json!({ "object": "page", "entry": [{ "messaging": events }] }).to_string()
    }

    #[tokio::test]
    async fn test_home_is_alive() {
        let h = harness(false);
        let (status, body) = call(h.app, get("/")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, LIVENESS_TEXT);
    }

    #[tokio::test]
    async fn test_verify_echoes_challenge() {
        let h = harness(false);
        let (status, body) = call(
            h.app,
            get("/webhook?hub.mode=subscribe&hub.challenge=CHALLENGE_ACCEPTED&hub.verify_token=secret"),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "CHALLENGE_ACCEPTED");
    }

    #[tokio::test]
    async fn test_verify_rejects_wrong_token() {
        let h = harness(false);
        let (status, body) = call(
            h.app,
            get("/webhook?hub.mode=subscribe&hub.challenge=abc&hub.verify_token=nope"),
        )
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(body, VERIFY_MISMATCH_TEXT);
    }

    #[tokio::test]
    async fn test_verify_with_repeated_params_uses_first_value() {
        let h = harness(false);
        let (status, body) = call(
            h.app.clone(),
            get("/webhook?hub.mode=subscribe&hub.mode=subscribe&hub.challenge=c&hub.verify_token=secret"),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "c");

        let (status, body) = call(
            h.app,
            get("/webhook?hub.mode=unsubscribe&hub.mode=subscribe&hub.challenge=c"),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, VERIFY_DEFAULT_TEXT);
    }

    #[tokio::test]
    async fn test_verify_without_params_greets() {
        let h = harness(false);
        let (status, body) = call(h.app, get("/webhook")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, VERIFY_DEFAULT_TEXT);
    }

    #[tokio::test]
    async fn test_single_message_is_relayed_once() {
        let h = harness(false);
        let payload = page_payload(json!([
            { "sender": { "id": "42" }, "recipient": { "id": "page" }, "message": { "mid": "m1", "text": "hello" } }
        ]));

        let (status, body) = call(h.app, post_webhook(payload)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, ACK_TEXT);

        assert_eq!(*h.generator.calls.lock().await, vec!["hello".to_string()]);
        assert_eq!(
            *h.sender.calls.lock().await,
            vec![("42".to_string(), "reply to hello".to_string())]
        );
    }

    #[tokio::test]
    async fn test_messages_relayed_in_order_and_echoes_skipped() {
        let h = harness(false);
        let payload = page_payload(json!([
            { "sender": { "id": "1" }, "message": { "text": "a" } },
            { "sender": { "id": "page" }, "message": { "text": "reply to a", "is_echo": true } },
            { "sender": { "id": "2" }, "message": { "text": "b" } }
        ]));

        call(h.app, post_webhook(payload)).await;

        assert_eq!(
            *h.sender.calls.lock().await,
            vec![
                ("1".to_string(), "reply to a".to_string()),
                ("2".to_string(), "reply to b".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn test_bad_event_does_not_drop_good_ones() {
        let h = harness(false);
        let payload = page_payload(json!([
            { "sender": { "id": "1" }, "message": { "text": "good" } },
            { "sender": { "id": 2 }, "message": { "text": "bad" } },
            { "sender": { "id": "3" }, "message": { "text": "also good" } }
        ]));

        let (status, body) = call(h.app, post_webhook(payload)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, ACK_TEXT);
        assert_eq!(
            *h.sender.calls.lock().await,
            vec![
                ("1".to_string(), "reply to good".to_string()),
                ("3".to_string(), "reply to also good".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn test_non_page_object_is_acknowledged_without_calls() {
        let h = harness(false);
        let payload = json!({
            "object": "user",
            "entry": [{ "messaging": [{ "sender": { "id": "1" }, "message": { "text": "hi" } }] }]
        })
        .to_string();

        let (status, body) = call(h.app, post_webhook(payload)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, ACK_TEXT);
        assert!(h.generator.calls.lock().await.is_empty());
        assert!(h.sender.calls.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_send_failure_still_acknowledged() {
        let h = harness(true);
        let payload = page_payload(json!([
            { "sender": { "id": "7" }, "message": { "text": "hi" } }
        ]));

        let (status, body) = call(h.app, post_webhook(payload)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, ACK_TEXT);
        assert_eq!(h.sender.calls.lock().await.len(), 1);
    }

    #[tokio::test]
    async fn test_malformed_body_still_acknowledged() {
        let h = harness(false);
        let (status, body) = call(h.app, post_webhook("{not json")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, ACK_TEXT);
        assert!(h.generator.calls.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_pipeline_against_live_apis() {
        let mut gemini = mockito::Server::new_async().await;
        let gemini_mock = gemini
            .mock("POST", mockito::Matcher::Any)
            .with_status(200)
            .with_body(
                json!({ "candidates": [{ "content": { "parts": [{ "text": " ဟုတ်ကဲ့ " }] } }] })
                    .to_string(),
            )
            .expect(1)
            .create_async()
            .await;

        let mut graph = mockito::Server::new_async().await;
        let graph_mock = graph
            .mock("POST", mockito::Matcher::Any)
            .match_body(mockito::Matcher::Json(json!({
                "messaging_type": "RESPONSE",
                "recipient": { "id": "99" },
                "message": { "text": "ဟုတ်ကဲ့" }
            })))
            .with_status(200)
            .expect(1)
            .create_async()
            .await;

        let mut config = Config::default();
        config.messenger.verify_token = "secret".to_string();
        config.messenger.api_base_url = graph.url();
        config.gemini.api_base_url = gemini.url();
        let state = AppState::from_config(&config, reqwest::Client::new());

        let payload = page_payload(json!([
            { "sender": { "id": "99" }, "message": { "text": "Is the shop open?" } }
        ]));
        let (status, _) = call(router(Arc::new(state)), post_webhook(payload)).await;

        assert_eq!(status, StatusCode::OK);
        gemini_mock.assert_async().await;
        graph_mock.assert_async().await;
    }
}
