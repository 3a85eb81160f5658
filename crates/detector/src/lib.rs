//! Conversation loop detection for Turnstile.
//!
//! One [`LoopDetector`] lives for an agent session and is `reset` at the
//! start of each user prompt. The turn loop feeds it every stream event via
//! [`LoopDetector::add_and_check`] and calls [`LoopDetector::turn_started`]
//! once per conversational turn; a `true` return means the turn should be
//! aborted and recovery guidance offered.
//!
//! Three detectors, cheapest first:
//! 1. consecutive identical tool calls (fingerprint comparison)
//! 2. content "chanting" (sliding-window analysis of streamed text)
//! 3. an LLM-based semantic check for slow burns the first two miss

mod content;
mod recovery;
mod semantic;
mod service;

pub use semantic::LoopVerdict;
pub use service::{DetectorState, DetectorStats, LoopDetector};
