//! # Turnstile Core
//!
//! Domain types, traits, and error definitions for the Turnstile agent-safety
//! library. This crate has **zero framework dependencies** — it defines the
//! vocabulary that the detector, gate, and backend crates implement against.
//!
//! ## Design Philosophy
//!
//! The loop detector and the concurrency gate never talk to the network
//! themselves. Everything external — the model used for the semantic loop
//! check, the telemetry sink, the stream of response events — enters through
//! a trait or a value type defined here. This enables:
//! - Testing both subsystems with in-process fakes
//! - Swapping inference clients without touching detection logic
//! - A clean dependency graph (all crates depend inward on core)

pub mod client;
pub mod error;
pub mod event;
pub mod message;
pub mod stream;

// Re-export key types at crate root for ergonomics
pub use client::{JsonClient, JsonRequest};
pub use error::{ClientError, Error, GateError, Result};
pub use event::{EventBus, LoopType, TelemetryEvent};
pub use message::{Message, Role};
pub use stream::StreamEvent;
