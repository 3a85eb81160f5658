//! Telemetry event system — decoupled reporting of loop and gate activity.
//!
//! Events are published when something interesting happens. The embedding
//! application subscribes to forward events into its metrics pipeline;
//! publishing is fire-and-forget and never blocks or fails back into the
//! detector or gate.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;

/// Classification of a detected conversation loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopType {
    /// The same tool was requested with identical arguments several times in a row.
    ConsecutiveIdenticalToolCalls,
    /// The same span of streamed text recurred in tight succession.
    ChantingIdenticalSentences,
    /// A side-channel model check judged the conversation unproductive.
    LlmDetectedLoop,
}

impl std::fmt::Display for LoopType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::ConsecutiveIdenticalToolCalls => "consecutive_identical_tool_calls",
            Self::ChantingIdenticalSentences => "chanting_identical_sentences",
            Self::LlmDetectedLoop => "llm_detected_loop",
        };
        f.write_str(s)
    }
}

/// All telemetry events in the system.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum TelemetryEvent {
    /// The loop detector confirmed a loop for the current prompt.
    LoopDetected {
        prompt_id: String,
        loop_type: LoopType,
        timestamp: DateTime<Utc>,
    },

    /// An automatic recovery nudge was issued after a detected loop.
    RecoveryAttempted {
        prompt_id: String,
        attempt: u32,
        loop_type: LoopType,
        timestamp: DateTime<Utc>,
    },

    /// A gated request could not start immediately and was queued.
    RequestThrottled {
        request_id: String,
        queued: usize,
        active: usize,
        timestamp: DateTime<Utc>,
    },
}

/// A broadcast-based event bus for telemetry events.
///
/// Uses `tokio::sync::broadcast` for multi-consumer pub/sub.
/// Components can subscribe to receive all events and filter for what they care about.
pub struct EventBus {
    sender: broadcast::Sender<Arc<TelemetryEvent>>,
}

impl EventBus {
    /// Create a new event bus with the given capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish an event to all subscribers.
    pub fn publish(&self, event: TelemetryEvent) {
        // Ignore send errors (no subscribers = that's fine)
        let _ = self.sender.send(Arc::new(event));
    }

    /// Subscribe to receive events.
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<TelemetryEvent>> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
