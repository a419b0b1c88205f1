//! The configuration envelope every backend is built from (spec external
//! interfaces, "Configuration envelope (per backend)").

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::Result;

const DEFAULT_DIAL_TIMEOUT_SECS: u64 = 1;
const DEFAULT_DIAL_KEEPALIVE_TIME_SECS: u64 = 3;
const DEFAULT_DIAL_KEEPALIVE_TIMEOUT_SECS: u64 = 3;
const DEFAULT_ETCD_TTL_SECS: i64 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BackendKind {
    KvLease,
    Naming,
}

/// Raw envelope a `Plugin::config` receives, before the backend-specific
/// dial options (`Trans2EtcdConfig`/`Trans2NacosConfig` in the Go source)
/// are derived from it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BackendConfig {
    #[serde(rename = "type")]
    pub kind: Option<BackendKind>,
    pub endpoints: String,
    #[serde(default)]
    pub namespace: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub settings: HashMap<String, String>,
}

impl BackendConfig {
    pub fn from_yaml(bytes: &[u8]) -> Result<Self> {
        Ok(serde_yaml::from_slice(bytes)?)
    }

    pub fn endpoint_list(&self) -> Vec<String> {
        self.endpoints
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect()
    }

    fn setting_secs(&self, key: &str, default: u64) -> Duration {
        self.settings
            .get(key)
            .and_then(|v| v.parse::<u64>().ok())
            .map(Duration::from_secs)
            .unwrap_or_else(|| Duration::from_secs(default))
    }

    pub fn dial_timeout(&self) -> Duration {
        self.setting_secs("dial_timeout", DEFAULT_DIAL_TIMEOUT_SECS)
    }

    pub fn dial_keepalive_time(&self) -> Duration {
        self.setting_secs("dial_keepalive_time", DEFAULT_DIAL_KEEPALIVE_TIME_SECS)
    }

    pub fn dial_keepalive_timeout(&self) -> Duration {
        self.setting_secs(
            "dial_keepalive_timeout",
            DEFAULT_DIAL_KEEPALIVE_TIMEOUT_SECS,
        )
    }

    /// Registrar lease seconds. Only meaningful for the KV-lease backend.
    pub fn lease_ttl(&self) -> i64 {
        self.settings
            .get("ttl")
            .and_then(|v| v.parse::<i64>().ok())
            .filter(|ttl| *ttl > 0)
            .unwrap_or(DEFAULT_ETCD_TTL_SECS)
    }

    /// Naming-only group name.
    pub fn group(&self) -> &str {
        self.settings.get("group").map(String::as_str).unwrap_or("")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_when_settings_absent() {
        let conf = BackendConfig::default();
        assert_eq!(conf.dial_timeout(), Duration::from_secs(1));
        assert_eq!(conf.dial_keepalive_time(), Duration::from_secs(3));
        assert_eq!(conf.lease_ttl(), 10);
    }

    #[test]
    fn settings_override_defaults() {
        let mut conf = BackendConfig::default();
        conf.settings.insert("ttl".into(), "30".into());
        conf.settings.insert("dial_timeout".into(), "5".into());
        assert_eq!(conf.lease_ttl(), 30);
        assert_eq!(conf.dial_timeout(), Duration::from_secs(5));
    }

    #[test]
    fn parses_comma_separated_endpoints() {
        let mut conf = BackendConfig::default();
        conf.endpoints = "etcd://a:2379, etcd://b:2379".into();
        assert_eq!(conf.endpoint_list(), vec!["etcd://a:2379", "etcd://b:2379"]);
    }

    #[test]
    fn parses_from_yaml() {
        let yaml = b"type: kv-lease\nendpoints: 127.0.0.1:2379\nnamespace: ns\nsettings:\n  ttl: \"6\"\n";
        let conf = BackendConfig::from_yaml(yaml).unwrap();
        assert_eq!(conf.kind, Some(BackendKind::KvLease));
        assert_eq!(conf.lease_ttl(), 6);
    }
}
