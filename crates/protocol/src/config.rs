use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Persisted host configuration (`<CommonAppData>/P2PRD/config.json`).
///
/// Every field has a serde default so a partial or first-boot file loads
/// cleanly; the host fills in `host_id` on first run and rewrites the file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostConfig {
    /// Stable opaque host identity, UUID v4, generated once.
    #[serde(default)]
    pub host_id: String,
    /// Self-describing KDF hash (argon2id or bcrypt). Empty = no password set.
    #[serde(default)]
    pub password_hash: String,
    /// HTTPS resolver endpoint, or a ws(s):// URL used directly.
    #[serde(default)]
    pub signaling_resolver_url: String,
    #[serde(default = "default_stun")]
    pub stun: Vec<String>,
    #[serde(default)]
    pub turn: TurnConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub lockout: LockoutState,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            host_id: String::new(),
            password_hash: String::new(),
            signaling_resolver_url: String::new(),
            stun: default_stun(),
            turn: TurnConfig::default(),
            logging: LoggingConfig::default(),
            lockout: LockoutState::default(),
        }
    }
}

impl HostConfig {
    pub fn has_password(&self) -> bool {
        !self.password_hash.is_empty()
    }
}

/// TURN relay credentials. Sensitive but stored plaintext; the directory ACL
/// is the protection.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TurnConfig {
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub credential: String,
}

impl TurnConfig {
    pub fn is_configured(&self) -> bool {
        !self.url.is_empty()
    }
}

/// Log rotation knobs, persisted for the external sink to consume.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_bytes")]
    pub max_bytes: u64,
    #[serde(default = "default_log_files")]
    pub files: u32,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            max_bytes: default_log_bytes(),
            files: default_log_files(),
        }
    }
}

/// Authentication failure tracking, persisted across restarts.
///
/// Invariant: `failed_attempts` is always below the lockout threshold after a
/// persist; hitting the threshold converts the counter into `locked_until`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LockoutState {
    #[serde(default)]
    pub failed_attempts: u32,
    #[serde(default)]
    pub locked_until: Option<DateTime<Utc>>,
}

fn default_stun() -> Vec<String> {
    vec![
        "stun:stun.l.google.com:19302".to_string(),
        "stun:stun1.l.google.com:19302".to_string(),
    ]
}
fn default_log_bytes() -> u64 {
    10 * 1024 * 1024
}
fn default_log_files() -> u32 {
    5
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn empty_json_loads_defaults() {
        let config: HostConfig = serde_json::from_str("{}").unwrap();
        assert!(config.host_id.is_empty());
        assert!(!config.has_password());
        assert_eq!(config.stun.len(), 2);
        assert!(!config.turn.is_configured());
        assert_eq!(config.logging.max_bytes, 10_485_760);
        assert_eq!(config.logging.files, 5);
        assert_eq!(config.lockout.failed_attempts, 0);
        assert!(config.lockout.locked_until.is_none());
    }

    #[test]
    fn locked_until_serializes_iso8601() {
        let mut config = HostConfig::default();
        config.lockout.locked_until = Some(Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap());
        let json = serde_json::to_string(&config).unwrap();
        assert!(json.contains("2025-06-01T12:00:00Z"));
        let parsed: HostConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.lockout, config.lockout);
    }

    #[test]
    fn locked_until_null_roundtrip() {
        let json = r#"{"lockout":{"failed_attempts":3,"locked_until":null}}"#;
        let config: HostConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.lockout.failed_attempts, 3);
        assert!(config.lockout.locked_until.is_none());
    }

    #[test]
    fn full_file_roundtrip() {
        let json = r#"{
            "host_id": "7e3e7d3c-9a64-4cf0-8f4e-1f0f8f8f8f8f",
            "password_hash": "$argon2id$v=19$m=19456,t=2,p=1$abc$def",
            "signaling_resolver_url": "https://resolver.example/endpoint",
            "stun": ["stun:stun.example:3478"],
            "turn": {"url": "turn:turn.example:3478", "username": "u", "credential": "c"},
            "logging": {"max_bytes": 1024, "files": 2},
            "lockout": {"failed_attempts": 0, "locked_until": null}
        }"#;
        let config: HostConfig = serde_json::from_str(json).unwrap();
        assert!(config.has_password());
        assert!(config.turn.is_configured());
        assert_eq!(config.stun, vec!["stun:stun.example:3478"]);
        let out = serde_json::to_string_pretty(&config).unwrap();
        let back: HostConfig = serde_json::from_str(&out).unwrap();
        assert_eq!(back.host_id, config.host_id);
        assert_eq!(back.turn, config.turn);
    }
}
