//! Locality and serving-stack classification.
//!
//! A pure function over (base URL, model name). The pattern lists are const
//! tables so new local stacks or model families can be added without touching
//! control flow.

use serde::{Deserialize, Serialize};

/// Hostnames that always mean "this machine".
const LOOPBACK_HOSTS: &[&str] = &[
    "localhost",
    "127.0.0.1",
    "0.0.0.0",
    "::1",
    "host.docker.internal",
];

/// Ports conventionally used by local inference servers.
const LOCAL_INFERENCE_PORTS: &[(u16, BackendKind)] = &[
    (11434, BackendKind::Ollama),
    (1234, BackendKind::LmStudio),
    (8080, BackendKind::LlamaCpp),
    (8000, BackendKind::Vllm),
    (5000, BackendKind::TextGenWebUi),
    (4891, BackendKind::Gpt4All),
];

/// Model-family substrings that indicate a locally-hosted model.
const LOCAL_MODEL_FAMILIES: &[&str] = &[
    "llama",
    "mistral",
    "mixtral",
    "qwen",
    "gemma",
    "phi-",
    "phi2",
    "phi3",
    "vicuna",
    "codellama",
    "tinyllama",
    "smollm",
    "starcoder",
    "deepseek-r1",
    "wizardlm",
    "openhermes",
    "orca",
    "stablelm",
    "falcon",
];

/// The serving stack a local endpoint appears to be.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    Ollama,
    LmStudio,
    LlamaCpp,
    Vllm,
    TextGenWebUi,
    Gpt4All,
    /// Local by some signal, but the stack is unrecognized.
    LocalGeneric,
    /// Not believed to be local.
    Cloud,
}

impl BackendKind {
    /// Whether this stack reliably honors structured-JSON generation requests.
    ///
    /// The semantic loop check is skipped for stacks that don't: raw
    /// completion servers tend to emit prose around the JSON.
    pub fn supports_structured_json(&self) -> bool {
        !matches!(self, Self::LlamaCpp | Self::Gpt4All)
    }
}

/// Which signal produced the locality verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchSource {
    Url,
    ModelName,
    None,
}

/// The classification verdict for one backend connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendProfile {
    /// Believed to run on constrained local hardware.
    pub is_local: bool,
    /// Best guess at the serving stack.
    pub kind: BackendKind,
    /// Which signal matched.
    pub source: MatchSource,
}

impl BackendProfile {
    fn cloud() -> Self {
        Self {
            is_local: false,
            kind: BackendKind::Cloud,
            source: MatchSource::None,
        }
    }
}

/// Classify a backend connection from its base URL and/or model name.
///
/// Local if EITHER the URL matches loopback/private-network hosts or a
/// well-known local-inference port, OR the model name contains a known
/// locally-hosted family substring. A model-name match wins even when the
/// URL looks like a cloud provider.
pub fn classify_backend(base_url: Option<&str>, model: Option<&str>) -> BackendProfile {
    if let Some(url) = base_url {
        if let Some(profile) = classify_url(url) {
            return profile;
        }
    }

    if let Some(model) = model {
        let lower = model.to_lowercase();
        if LOCAL_MODEL_FAMILIES.iter().any(|f| lower.contains(f)) {
            return BackendProfile {
                is_local: true,
                kind: BackendKind::LocalGeneric,
                source: MatchSource::ModelName,
            };
        }
    }

    BackendProfile::cloud()
}

fn classify_url(url: &str) -> Option<BackendProfile> {
    let (host, port) = split_host_port(url)?;

    let kind = port
        .and_then(|p| {
            LOCAL_INFERENCE_PORTS
                .iter()
                .find(|(known, _)| *known == p)
                .map(|(_, kind)| *kind)
        })
        .unwrap_or(BackendKind::LocalGeneric);

    let host_is_local = LOOPBACK_HOSTS.contains(&host.as_str())
        || host.ends_with(".local")
        || is_private_ipv4(&host);

    let port_is_local = port.is_some_and(|p| {
        LOCAL_INFERENCE_PORTS.iter().any(|(known, _)| *known == p)
    });

    if host_is_local || port_is_local {
        Some(BackendProfile {
            is_local: true,
            kind,
            source: MatchSource::Url,
        })
    } else {
        None
    }
}

/// Extract (host, port) from a URL without pulling in a URL parser.
/// Handles `scheme://host`, `host:port`, bracketed IPv6, and trailing paths.
fn split_host_port(url: &str) -> Option<(String, Option<u16>)> {
    let rest = url.split("://").nth(1).unwrap_or(url);
    let authority = rest.split(['/', '?']).next()?;
    if authority.is_empty() {
        return None;
    }

    // Bracketed IPv6: [::1]:8080
    if let Some(stripped) = authority.strip_prefix('[') {
        let (host, tail) = stripped.split_once(']')?;
        let port = tail.strip_prefix(':').and_then(|p| p.parse().ok());
        return Some((host.to_lowercase(), port));
    }

    match authority.rsplit_once(':') {
        Some((host, port)) if port.chars().all(|c| c.is_ascii_digit()) && !port.is_empty() => {
            Some((host.to_lowercase(), port.parse().ok()))
        }
        _ => Some((authority.to_lowercase(), None)),
    }
}

/// RFC 1918 private IPv4 ranges.
fn is_private_ipv4(host: &str) -> bool {
    let octets: Vec<u8> = host
        .split('.')
        .map_while(|o| o.parse().ok())
        .collect();
    if octets.len() != 4 {
        return false;
    }
    match octets[0] {
        10 => true,
        192 => octets[1] == 168,
        172 => (16..=31).contains(&octets[1]),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ollama_default_endpoint_is_local() {
        let profile = classify_backend(Some("http://127.0.0.1:11434"), Some("llama3.2:8b"));
        assert!(profile.is_local);
        assert_eq!(profile.kind, BackendKind::Ollama);
        assert_eq!(profile.source, MatchSource::Url);
    }

    #[test]
    fn cloud_provider_with_cloud_model_is_not_local() {
        let profile = classify_backend(Some("https://api.openai.com"), Some("gpt-4"));
        assert!(!profile.is_local);
        assert_eq!(profile.kind, BackendKind::Cloud);
    }

    #[test]
    fn model_name_wins_over_cloud_url() {
        let profile = classify_backend(Some("https://api.openai.com"), Some("llama-7b"));
        assert!(profile.is_local);
        assert_eq!(profile.source, MatchSource::ModelName);
    }

    #[test]
    fn localhost_without_known_port_is_local_generic() {
        let profile = classify_backend(Some("http://localhost:9999/v1"), None);
        assert!(profile.is_local);
        assert_eq!(profile.kind, BackendKind::LocalGeneric);
    }

    #[test]
    fn private_network_hosts_are_local() {
        assert!(classify_backend(Some("http://192.168.1.50:11434"), None).is_local);
        assert!(classify_backend(Some("http://10.0.0.7:8000/v1"), None).is_local);
        assert!(classify_backend(Some("http://172.20.3.9"), None).is_local);
        assert!(!classify_backend(Some("http://172.40.3.9"), None).is_local);
    }

    #[test]
    fn mdns_and_docker_hosts_are_local() {
        assert!(classify_backend(Some("http://gpu-box.local:1234"), None).is_local);
        assert!(classify_backend(Some("http://host.docker.internal:11434"), None).is_local);
    }

    #[test]
    fn bracketed_ipv6_loopback_is_local() {
        let profile = classify_backend(Some("http://[::1]:8080/completion"), None);
        assert!(profile.is_local);
        assert_eq!(profile.kind, BackendKind::LlamaCpp);
    }

    #[test]
    fn well_known_ports_map_to_kinds() {
        assert_eq!(
            classify_backend(Some("http://localhost:1234/v1"), None).kind,
            BackendKind::LmStudio
        );
        assert_eq!(
            classify_backend(Some("http://localhost:8000/v1"), None).kind,
            BackendKind::Vllm
        );
        assert_eq!(
            classify_backend(Some("http://localhost:4891/v1"), None).kind,
            BackendKind::Gpt4All
        );
    }

    #[test]
    fn model_families_match_case_insensitively() {
        assert!(classify_backend(None, Some("Mistral-7B-Instruct")).is_local);
        assert!(classify_backend(None, Some("Qwen2.5-Coder")).is_local);
        assert!(classify_backend(None, Some("deepseek-r1:14b")).is_local);
        assert!(!classify_backend(None, Some("claude-sonnet-4")).is_local);
    }

    #[test]
    fn no_signal_means_cloud() {
        let profile = classify_backend(None, None);
        assert!(!profile.is_local);
        assert_eq!(profile.source, MatchSource::None);
    }

    #[test]
    fn structured_json_policy_by_kind() {
        assert!(BackendKind::Ollama.supports_structured_json());
        assert!(BackendKind::Vllm.supports_structured_json());
        assert!(!BackendKind::LlamaCpp.supports_structured_json());
        assert!(!BackendKind::Gpt4All.supports_structured_json());
    }

    #[test]
    fn split_host_port_variants() {
        assert_eq!(
            split_host_port("http://localhost:11434/v1"),
            Some(("localhost".into(), Some(11434)))
        );
        assert_eq!(
            split_host_port("https://api.openai.com"),
            Some(("api.openai.com".into(), None))
        );
        assert_eq!(
            split_host_port("[::1]:8080"),
            Some(("::1".into(), Some(8080)))
        );
    }
}
