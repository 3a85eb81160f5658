//! The loop detector itself.
//!
//! One detector instance tracks one prompt. The turn loop feeds it every
//! [`StreamEvent`] as it arrives and calls [`LoopDetector::turn_started`] at
//! each turn boundary; a `true` from either means the current turn should be
//! aborted and (optionally) a recovery nudge injected. Detection is sticky:
//! once a loop is confirmed the detector keeps answering `true` until
//! [`LoopDetector::reset`] starts a new prompt.

use std::sync::Arc;

use chrono::Utc;
use sha2::{Digest, Sha256};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use turnstile_backend::BackendProfile;
use turnstile_config::DetectorConfig;
use turnstile_core::{EventBus, JsonClient, LoopType, Message, StreamEvent, TelemetryEvent};

use crate::content::ContentTracker;
use crate::{recovery, semantic};

/// Detector lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetectorState {
    /// No loop seen yet for this prompt.
    Tracking,
    /// A loop was confirmed; sticky until the next reset.
    Confirmed(LoopType),
}

/// Point-in-time snapshot of the detector's counters.
#[derive(Debug, Clone)]
pub struct DetectorStats {
    pub prompt_id: String,
    pub state: DetectorState,
    pub turns: u32,
    pub tool_repetition_count: u32,
    pub content_history_len: usize,
    pub tracked_chunks: usize,
    pub llm_check_interval: u32,
    pub recovery_attempts: u32,
}

/// Per-prompt conversation loop detector.
pub struct LoopDetector {
    config: DetectorConfig,
    events: Option<Arc<EventBus>>,
    client: Option<Arc<dyn JsonClient>>,
    structured_json_ok: bool,

    prompt_id: String,
    state: DetectorState,

    last_tool_fingerprint: Option<String>,
    tool_repetition_count: u32,
    content: ContentTracker,

    turns_in_current_prompt: u32,
    llm_check_interval: u32,
    last_check_turn: u32,
    recovery_attempts: u32,
}

impl LoopDetector {
    pub fn new(config: DetectorConfig) -> Self {
        let content = ContentTracker::new(&config);
        let llm_check_interval = config.default_llm_check_interval;
        Self {
            config,
            events: None,
            client: None,
            structured_json_ok: true,
            prompt_id: String::new(),
            state: DetectorState::Tracking,
            last_tool_fingerprint: None,
            tool_repetition_count: 0,
            content,
            turns_in_current_prompt: 0,
            llm_check_interval,
            last_check_turn: 0,
            recovery_attempts: 0,
        }
    }

    /// Attach the client used for semantic checks. Without one, only the
    /// fingerprint- and content-based checks run.
    pub fn with_client(mut self, client: Arc<dyn JsonClient>) -> Self {
        self.client = Some(client);
        self
    }

    /// Attach a telemetry bus for loop and recovery events.
    pub fn with_events(mut self, events: Arc<EventBus>) -> Self {
        self.events = Some(events);
        self
    }

    /// Disable semantic checks for backends that cannot produce reliable
    /// structured JSON.
    pub fn with_backend_profile(mut self, profile: &BackendProfile) -> Self {
        self.structured_json_ok = profile.kind.supports_structured_json();
        self
    }

    /// Begin tracking a new prompt. Clears all detection state including a
    /// confirmed loop.
    pub fn reset(&mut self, prompt_id: impl Into<String>) {
        self.prompt_id = prompt_id.into();
        self.state = DetectorState::Tracking;
        self.last_tool_fingerprint = None;
        self.tool_repetition_count = 0;
        self.content.reset();
        self.turns_in_current_prompt = 0;
        self.llm_check_interval = self.config.default_llm_check_interval;
        self.last_check_turn = 0;
        self.recovery_attempts = 0;
    }

    /// Feed one stream event. Returns `true` when a loop is (or already was)
    /// confirmed for this prompt.
    pub fn add_and_check(&mut self, event: &StreamEvent) -> bool {
        if matches!(self.state, DetectorState::Confirmed(_)) {
            return true;
        }

        match event {
            StreamEvent::ToolCall { name, args } => {
                // Text before a tool call and text after it are different
                // utterances; chanting never spans a tool call.
                self.content.reset_tracking();

                let fingerprint = tool_fingerprint(name, args);
                if self.last_tool_fingerprint.as_deref() == Some(fingerprint.as_str()) {
                    self.tool_repetition_count += 1;
                } else {
                    self.last_tool_fingerprint = Some(fingerprint);
                    self.tool_repetition_count = 1;
                }

                if self.tool_repetition_count >= self.config.tool_call_loop_threshold {
                    self.confirm(LoopType::ConsecutiveIdenticalToolCalls);
                    return true;
                }
                false
            }
            StreamEvent::Content { text } => {
                if self.content.record(text) {
                    self.confirm(LoopType::ChantingIdenticalSentences);
                    return true;
                }
                false
            }
            StreamEvent::TurnBoundary => false,
        }
    }

    /// Called once at the start of every conversational turn. Counts turns
    /// and, past the activation floor, runs the semantic check at the
    /// current interval. Returns `true` when a loop is confirmed.
    ///
    /// Failures on the side channel (network, malformed output,
    /// cancellation) never confirm a loop.
    pub async fn turn_started(&mut self, history: &[Message], cancel: &CancellationToken) -> bool {
        if matches!(self.state, DetectorState::Confirmed(_)) {
            return true;
        }

        self.turns_in_current_prompt += 1;

        let Some(client) = self.client.clone() else {
            return false;
        };
        if !self.structured_json_ok {
            return false;
        }
        if self.turns_in_current_prompt < self.config.llm_check_after_turns {
            return false;
        }
        if self.turns_in_current_prompt - self.last_check_turn < self.llm_check_interval {
            return false;
        }
        // Marked before the call so a failing side channel is not retried
        // every single turn.
        self.last_check_turn = self.turns_in_current_prompt;

        let verdict =
            match semantic::run_check(client.as_ref(), history, &self.config, cancel).await {
                Ok(verdict) => verdict,
                Err(e) => {
                    debug!(prompt_id = %self.prompt_id, error = %e, "semantic loop check failed");
                    return false;
                }
            };

        if verdict.confidence > self.config.llm_confidence_threshold {
            warn!(
                prompt_id = %self.prompt_id,
                confidence = verdict.confidence,
                reasoning = %verdict.reasoning,
                "semantic check judged the conversation looping"
            );
            self.confirm(LoopType::LlmDetectedLoop);
            return true;
        }

        self.llm_check_interval = semantic::next_check_interval(verdict.confidence, &self.config);
        debug!(
            prompt_id = %self.prompt_id,
            confidence = verdict.confidence,
            next_interval = self.llm_check_interval,
            "semantic check passed"
        );
        false
    }

    fn confirm(&mut self, loop_type: LoopType) {
        warn!(prompt_id = %self.prompt_id, %loop_type, "conversation loop detected");
        self.state = DetectorState::Confirmed(loop_type);
        if let Some(events) = &self.events {
            events.publish(TelemetryEvent::LoopDetected {
                prompt_id: self.prompt_id.clone(),
                loop_type,
                timestamp: Utc::now(),
            });
        }
    }

    /// Escalating recovery nudges for the confirmed loop type, or `None`
    /// while still tracking.
    pub fn recovery_prompts(&self) -> Option<&'static [&'static str]> {
        match self.state {
            DetectorState::Confirmed(loop_type) => Some(recovery::prompts_for(loop_type)),
            DetectorState::Tracking => None,
        }
    }

    /// Whether an automatic recovery nudge should be issued now.
    pub fn should_attempt_auto_recovery(&self) -> bool {
        matches!(self.state, DetectorState::Confirmed(_))
            && self.recovery_attempts < self.config.max_recovery_attempts
    }

    /// Record that a recovery nudge was injected. Returns the prompt used,
    /// or `None` when the attempt budget is spent.
    pub fn record_recovery_attempt(&mut self) -> Option<&'static str> {
        let DetectorState::Confirmed(loop_type) = self.state else {
            return None;
        };
        if self.recovery_attempts >= self.config.max_recovery_attempts {
            return None;
        }
        let prompts = recovery::prompts_for(loop_type);
        let prompt = prompts.get(self.recovery_attempts as usize).copied()?;
        self.recovery_attempts += 1;
        if let Some(events) = &self.events {
            events.publish(TelemetryEvent::RecoveryAttempted {
                prompt_id: self.prompt_id.clone(),
                attempt: self.recovery_attempts,
                loop_type,
                timestamp: Utc::now(),
            });
        }
        Some(prompt)
    }

    pub fn state(&self) -> DetectorState {
        self.state
    }

    pub fn prompt_id(&self) -> &str {
        &self.prompt_id
    }

    pub fn stats(&self) -> DetectorStats {
        DetectorStats {
            prompt_id: self.prompt_id.clone(),
            state: self.state,
            turns: self.turns_in_current_prompt,
            tool_repetition_count: self.tool_repetition_count,
            content_history_len: self.content.history_len(),
            tracked_chunks: self.content.tracked_chunks(),
            llm_check_interval: self.llm_check_interval,
            recovery_attempts: self.recovery_attempts,
        }
    }
}

/// Fingerprint of a tool request: hash of the name and the canonical JSON
/// of the arguments. `serde_json` keeps object keys sorted, so two
/// semantically identical argument objects hash the same regardless of the
/// key order they arrived in.
fn tool_fingerprint(name: &str, args: &serde_json::Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(name.as_bytes());
    hasher.update([0]);
    hasher.update(args.to_string().as_bytes());
    format!("{:x}", hasher.finalize())
}
