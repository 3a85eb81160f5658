//! Response-stream events fed into the loop detector.
//!
//! `StreamEvent` is the detector's view of a model's streaming response:
//! the turn loop translates whatever its provider emits into these variants
//! and feeds them in strict arrival order. Out-of-order delivery invalidates
//! the detector's chunk-position bookkeeping.

use serde::{Deserialize, Serialize};

/// One event observed on a streaming model response.
///
/// - `tool_call` — the model requested a tool invocation
/// - `content`   — a partial text token from the model
/// - `turn_boundary` — the provider finished one conversational turn
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    /// The model is requesting a tool call.
    ToolCall {
        name: String,
        args: serde_json::Value,
    },

    /// Partial text content from the model.
    Content { text: String },

    /// The provider completed one conversational turn.
    TurnBoundary,
}

impl StreamEvent {
    /// Wire name for this event type.
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::ToolCall { .. } => "tool_call",
            Self::Content { .. } => "content",
            Self::TurnBoundary => "turn_boundary",
        }
    }

    /// Convenience constructor for a content chunk.
    pub fn content(text: impl Into<String>) -> Self {
        Self::Content { text: text.into() }
    }

    /// Convenience constructor for a tool-call request.
    pub fn tool_call(name: impl Into<String>, args: serde_json::Value) -> Self {
        Self::ToolCall {
            name: name.into(),
            args,
        }
    }
}
