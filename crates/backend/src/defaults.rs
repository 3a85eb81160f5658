//! Retry and sampling defaults derived from a backend profile.
//!
//! Local backends have no SLA: requests queue behind a single GPU, cold
//! models take a minute to load, and aggressive retries make things worse.
//! These defaults encode that asymmetry in one place.

use serde::{Deserialize, Serialize};
use turnstile_config::GateConfig;

use crate::classify::BackendProfile;

/// Per-request defaults chosen from the backend classification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestDefaults {
    /// Retry budget for transient failures.
    pub max_retries: u32,
    /// First retry backoff; doubles per attempt.
    pub initial_backoff_ms: u64,
    /// Wall-clock budget for one inference request.
    pub request_timeout_ms: u64,
    /// Default sampling temperature.
    pub temperature: f32,
    /// Default nucleus sampling cutoff.
    pub top_p: f32,
}

impl RequestDefaults {
    /// Defaults for a backend profile.
    pub fn for_profile(profile: &BackendProfile) -> Self {
        if profile.is_local {
            Self::local()
        } else {
            Self::cloud()
        }
    }

    /// Local backends: generous timeouts (cold model loads), patient retries.
    pub fn local() -> Self {
        Self {
            max_retries: 5,
            initial_backoff_ms: 2_000,
            request_timeout_ms: 120_000,
            temperature: 0.7,
            top_p: 0.9,
        }
    }

    /// Cloud backends: tight timeouts, quick retries.
    pub fn cloud() -> Self {
        Self {
            max_retries: 2,
            initial_backoff_ms: 500,
            request_timeout_ms: 60_000,
            temperature: 0.7,
            top_p: 1.0,
        }
    }

    /// The gate configuration recommended for this profile, or `None` when
    /// the backend should not be gated at all.
    pub fn recommended_gate_config(profile: &BackendProfile) -> Option<GateConfig> {
        profile.is_local.then(GateConfig::default)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify::classify_backend;

    #[test]
    fn local_profile_gets_local_defaults() {
        let profile = classify_backend(Some("http://localhost:11434"), None);
        let defaults = RequestDefaults::for_profile(&profile);
        assert_eq!(defaults, RequestDefaults::local());
        assert!(defaults.request_timeout_ms > RequestDefaults::cloud().request_timeout_ms);
        assert!(defaults.max_retries > RequestDefaults::cloud().max_retries);
    }

    #[test]
    fn cloud_profile_gets_cloud_defaults() {
        let profile = classify_backend(Some("https://api.openai.com"), Some("gpt-4"));
        assert_eq!(RequestDefaults::for_profile(&profile), RequestDefaults::cloud());
    }

    #[test]
    fn only_local_profiles_get_a_gate() {
        let local = classify_backend(Some("http://127.0.0.1:11434"), None);
        let cloud = classify_backend(Some("https://api.openai.com"), Some("gpt-4"));
        assert!(RequestDefaults::recommended_gate_config(&local).is_some());
        assert!(RequestDefaults::recommended_gate_config(&cloud).is_none());
    }
}
