//! Backend classification heuristics for Turnstile.
//!
//! Decides whether an inference endpoint is believed to run on constrained
//! local hardware, which local-serving stack it looks like, and what retry
//! and throttling defaults follow from that. Classification is heuristic,
//! not authoritative: a cloud model mistaken for local merely gets an extra
//! queue; a local model mistaken for cloud skips the gate.

pub mod classify;
pub mod defaults;
pub mod disposition;

pub use classify::{classify_backend, BackendKind, BackendProfile, MatchSource};
pub use defaults::RequestDefaults;
pub use disposition::{classify_client_error, classify_error_message, ErrorDisposition};
