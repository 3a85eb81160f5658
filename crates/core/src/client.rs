//! JsonClient trait — the abstraction over the model used for side-channel checks.
//!
//! The semantic loop check asks a model to rate its own conversation. That
//! request goes through this trait so the detector never owns an HTTP client;
//! the embedding application implements it on top of whatever provider stack
//! it already has.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::error::ClientError;
use crate::message::Message;

/// A structured-generation request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRequest {
    /// The conversational context to reason over.
    pub messages: Vec<Message>,

    /// JSON Schema the response must conform to.
    pub schema: serde_json::Value,

    /// Preferred model for this check, if the caller routes by name
    /// (e.g. a cheaper model than the one driving the conversation).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_hint: Option<String>,
}

/// The structured-generation client trait.
///
/// Implementations must honor the cancellation token by abandoning the
/// network call; they may return [`ClientError::Cancelled`] when they do.
#[async_trait]
pub trait JsonClient: Send + Sync {
    /// A human-readable name for this client (e.g. "ollama", "openai").
    fn name(&self) -> &str;

    /// Generate a JSON value conforming to `request.schema`.
    async fn generate_json(
        &self,
        request: JsonRequest,
        cancel: &CancellationToken,
    ) -> std::result::Result<serde_json::Value, ClientError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    struct EchoClient;

    #[async_trait]
    impl JsonClient for EchoClient {
        fn name(&self) -> &str {
            "echo"
        }

        async fn generate_json(
            &self,
            request: JsonRequest,
            _cancel: &CancellationToken,
        ) -> std::result::Result<serde_json::Value, ClientError> {
            Ok(serde_json::json!({ "messages": request.messages.len() }))
        }
    }

    #[tokio::test]
    async fn trait_object_is_usable() {
        let client: Box<dyn JsonClient> = Box::new(EchoClient);
        let request = JsonRequest {
            messages: vec![Message::user("hello"), Message::assistant("hi")],
            schema: serde_json::json!({"type": "object"}),
            model_hint: None,
        };
        let value = client
            .generate_json(request, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(value["messages"], 2);
    }

    #[test]
    fn request_serialization_skips_empty_hint() {
        let request = JsonRequest {
            messages: vec![],
            schema: serde_json::json!({}),
            model_hint: None,
        };
        let json = serde_json::to_string(&request).unwrap();
        assert!(!json.contains("model_hint"));
    }
}
