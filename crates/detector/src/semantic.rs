//! LLM-based semantic loop check.
//!
//! Cheap fingerprint checks miss slow burns: the model rewrites the same
//! function over and over, or cycles through a small set of files with no
//! net change. Past an activation floor of turns, a side-channel request
//! asks a model to rate its own conversation; the verdict only ever aborts
//! the turn when confidence is very high, and every failure on this path
//! degrades to "no loop".

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use turnstile_config::DetectorConfig;
use turnstile_core::{ClientError, JsonClient, JsonRequest, Message};

/// The structured verdict returned by the side-channel model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoopVerdict {
    /// The model's explanation of its rating.
    pub reasoning: String,
    /// Confidence, 0.0–1.0, that the conversation is unproductively looping.
    pub confidence: f64,
}

/// Instruction attached to the recent turns handed to the model.
const CHECK_INSTRUCTION: &str = "\
You are auditing the conversation above for unproductive repetition.

Rate your confidence (0.0 to 1.0) that the conversation is stuck in a loop. \
A loop means the assistant repeats the same actions or content with no net \
progress: replacing identical content over and over, cycling through a small \
set of files without changing them, or re-running the same failing command \
expecting a different result.

Incremental progress is NOT a loop: sequentially editing many call sites, \
working through a checklist, or retrying with meaningfully different \
arguments all count as progress even when they look similar.

Respond with JSON: {\"reasoning\": \"<one or two sentences>\", \
\"confidence\": <number>}.";

/// JSON Schema for the verdict.
pub(crate) fn verdict_schema() -> serde_json::Value {
    serde_json::json!({
        "type": "object",
        "properties": {
            "reasoning": {
                "type": "string",
                "description": "Why the conversation is or is not looping"
            },
            "confidence": {
                "type": "number",
                "minimum": 0.0,
                "maximum": 1.0,
                "description": "Confidence that the conversation is unproductively looping"
            }
        },
        "required": ["reasoning", "confidence"]
    })
}

/// Assemble the check request: the last `recent_turns` messages plus the
/// diagnostic instruction.
pub(crate) fn build_request(history: &[Message], config: &DetectorConfig) -> JsonRequest {
    let start = history.len().saturating_sub(config.recent_turns_for_llm_check);
    let mut messages: Vec<Message> = history[start..].to_vec();
    messages.push(Message::user(CHECK_INSTRUCTION));
    JsonRequest {
        messages,
        schema: verdict_schema(),
        model_hint: None,
    }
}

/// Run one semantic check. Abandons the request when the token fires;
/// detector state is left for the caller to manage either way.
pub(crate) async fn run_check(
    client: &dyn JsonClient,
    history: &[Message],
    config: &DetectorConfig,
    cancel: &CancellationToken,
) -> Result<LoopVerdict, ClientError> {
    let request = build_request(history, config);
    let value = tokio::select! {
        _ = cancel.cancelled() => return Err(ClientError::Cancelled),
        result = client.generate_json(request, cancel) => result?,
    };

    let verdict: LoopVerdict = serde_json::from_value(value)
        .map_err(|e| ClientError::MalformedResponse(e.to_string()))?;
    if !(0.0..=1.0).contains(&verdict.confidence) || !verdict.confidence.is_finite() {
        return Err(ClientError::MalformedResponse(format!(
            "confidence {} outside [0.0, 1.0]",
            verdict.confidence
        )));
    }
    Ok(verdict)
}

/// Map the verdict's confidence onto the next check interval: high confidence
/// checks again soon, low confidence backs off.
pub(crate) fn next_check_interval(confidence: f64, config: &DetectorConfig) -> u32 {
    let min = config.min_llm_check_interval as f64;
    let max = config.max_llm_check_interval as f64;
    (min + (max - min) * (1.0 - confidence)).round() as u32
}
