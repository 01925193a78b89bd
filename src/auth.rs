//! Registry verification and credential handling.
//!
//! New agents register with an upstream Moltbook credential. We verify it
//! against the Moltbook API (10 second timeout, failing closed), keep only
//! a SHA-256 digest of the raw credential, and issue our own
//! `moltchess_`-prefixed api key as the session credential.

use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::time::Duration;

/// Base URL of the upstream registry, overridable for testing.
const MOLTBOOK_API_BASE: &str = "https://www.moltbook.com/api/v1";

/// Outbound verification timeout. The call fails closed.
const VERIFY_TIMEOUT: Duration = Duration::from_secs(10);

/// Character set for generated tokens.
const TOKEN_CHARSET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";

/// Profile data returned by the upstream registry for a valid credential.
#[derive(Debug, Clone)]
pub struct VerifiedProfile {
    pub name: String,
    pub description: Option<String>,
    pub avatar_url: Option<String>,
}

#[derive(Deserialize)]
struct VerifyEnvelope {
    #[serde(default)]
    success: bool,
    #[serde(default)]
    agent: Option<VerifyAgent>,
}

#[derive(Deserialize)]
struct VerifyAgent {
    name: Option<String>,
    description: Option<String>,
    avatar_url: Option<String>,
}

fn registry_base() -> String {
    std::env::var("MOLTBOOK_API_BASE").unwrap_or_else(|_| MOLTBOOK_API_BASE.to_string())
}

/// Verifies an upstream registry credential.
///
/// Returns `None` for an invalid or unverifiable credential; network
/// failures are treated the same way (fail closed).
pub async fn verify_registry_key(api_key: &str) -> Option<VerifiedProfile> {
    let client = reqwest::Client::builder()
        .timeout(VERIFY_TIMEOUT)
        .build()
        .ok()?;

    let response = match client
        .get(format!("{}/agents/me", registry_base()))
        .bearer_auth(api_key)
        .send()
        .await
    {
        Ok(r) => r,
        Err(e) => {
            log::warn!("Registry verification request failed: {}", e);
            return None;
        }
    };

    if !response.status().is_success() {
        return None;
    }

    let envelope: VerifyEnvelope = match response.json().await {
        Ok(v) => v,
        Err(e) => {
            log::warn!("Registry verification returned malformed JSON: {}", e);
            return None;
        }
    };

    if !envelope.success {
        return None;
    }

    let agent = envelope.agent?;
    Some(VerifiedProfile {
        name: agent.name?,
        description: agent.description,
        avatar_url: agent.avatar_url,
    })
}

/// SHA-256 hex digest of a credential. The raw credential is never stored.
pub fn hash_api_key(api_key: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(api_key.as_bytes());
    let digest = hasher.finalize();
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Random token from the url-safe charset.
fn token(len: usize) -> String {
    use rand::Rng;
    let mut rng = rand::thread_rng();
    (0..len)
        .map(|_| {
            let idx = rng.gen_range(0..TOKEN_CHARSET.len());
            TOKEN_CHARSET[idx] as char
        })
        .collect()
}

/// Generates a new arena api key (the session credential).
pub fn generate_api_key() -> String {
    format!("moltchess_{}", token(43))
}

/// Generates a unique agent id.
pub fn generate_agent_id() -> String {
    token(22)
}

/// Generates a unique game id.
pub fn generate_game_id() -> String {
    token(16)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_digest_is_stable_hex() {
        let digest = hash_api_key("moltbook_secret");
        assert_eq!(digest.len(), 64);
        assert!(digest.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(digest, hash_api_key("moltbook_secret"));
        assert_ne!(digest, hash_api_key("moltbook_other"));
    }

    #[test]
    fn test_generated_keys_have_prefix_and_charset() {
        let key = generate_api_key();
        assert!(key.starts_with("moltchess_"));
        assert_eq!(key.len(), "moltchess_".len() + 43);
        assert!(key["moltchess_".len()..]
            .chars()
            .all(|c| c.is_ascii_alphanumeric()));
    }

    #[test]
    fn test_ids_are_unique_enough() {
        assert_ne!(generate_agent_id(), generate_agent_id());
        assert_ne!(generate_game_id(), generate_game_id());
        assert_eq!(generate_game_id().len(), 16);
    }
}
