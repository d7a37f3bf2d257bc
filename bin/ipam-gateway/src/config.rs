//! Gateway configuration, read from the YAML file named by `IPAM_CONFIG`

use anyhow::{Context, Result};
use ipam_api::{AccountId, DomainId, RouterId};
use ipam_core::NetworkInfo;
use ipam_router::{RedundantPair, RouterCallPolicy};
use serde::Deserialize;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;

pub const CONFIG_ENV: &str = "IPAM_CONFIG";

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AgentConfig {
    /// In-memory routers, for development and tests
    #[default]
    Simulated,
    /// Control endpoint base URL per router
    Http { endpoints: HashMap<RouterId, String> },
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    pub timeout_secs: u64,
    pub max_retries: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub agent: AgentConfig,
    pub pairs: Vec<RedundantPair>,
}

impl Default for RouterConfig {
    fn default() -> Self {
        let policy = RouterCallPolicy::default();
        Self {
            timeout_secs: policy.timeout.as_secs(),
            max_retries: policy.max_retries,
            initial_backoff_ms: policy.initial_backoff.as_millis() as u64,
            max_backoff_ms: policy.max_backoff.as_millis() as u64,
            agent: AgentConfig::default(),
            pairs: Vec::new(),
        }
    }
}

impl RouterConfig {
    pub fn call_policy(&self) -> RouterCallPolicy {
        RouterCallPolicy {
            timeout: Duration::from_secs(self.timeout_secs),
            max_retries: self.max_retries,
            initial_backoff: Duration::from_millis(self.initial_backoff_ms),
            max_backoff: Duration::from_millis(self.max_backoff_ms),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
pub struct AccountSeed {
    pub id: AccountId,
    pub domain: DomainId,
    pub name: String,
    /// Absent means unlimited
    #[serde(default)]
    pub max_public_ips: Option<u64>,
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub listen: SocketAddr,
    /// Directory of the JSON store; state is kept in memory only when unset
    pub state_dir: Option<PathBuf>,
    pub log_format: LogFormat,
    pub router: RouterConfig,
    pub accounts: Vec<AccountSeed>,
    pub networks: Vec<NetworkInfo>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            listen: ([0, 0, 0, 0], 8080).into(),
            state_dir: None,
            log_format: LogFormat::Text,
            router: RouterConfig::default(),
            accounts: Vec::new(),
            networks: Vec::new(),
        }
    }
}

impl GatewayConfig {
    /// Load from `IPAM_CONFIG`, or fall back to defaults when it is unset
    pub fn load() -> Result<Self> {
        match std::env::var(CONFIG_ENV) {
            Ok(path) => Self::from_file(&path),
            Err(_) => Ok(Self::default()),
        }
    }

    pub fn from_file(path: &str) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading configuration from {}", path))?;
        let config = Self::from_yaml(&text).with_context(|| format!("parsing {}", path))?;
        info!("Loaded configuration from {}", path);
        Ok(config)
    }

    pub fn from_yaml(text: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(text)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = GatewayConfig::default();
        assert_eq!(config.listen.port(), 8080);
        assert_eq!(config.log_format, LogFormat::Text);
        assert_eq!(config.router.agent, AgentConfig::Simulated);
        assert_eq!(config.router.call_policy().timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_parse_full_config() {
        let yaml = r#"
listen: 127.0.0.1:9090
state_dir: /var/lib/ipam
log_format: json
router:
  timeout_secs: 5
  max_retries: 1
  agent:
    kind: http
    endpoints:
      8f0c1c52-5b0e-4f0a-9a8e-0d6f7a0f1e11: http://169.254.3.10:8888
accounts:
  - id: 2b7c5d1e-8c1e-4a6a-9a0e-5f3d2b1c0a99
    domain: 7e6d5c4b-3a29-4817-8695-a4b3c2d1e0f0
    name: acct1
    max_public_ips: 1
networks:
  - id: 0a1b2c3d-4e5f-4a6b-8c7d-9e0f1a2b3c4d
    zone: 11111111-2222-4333-8444-555555555555
    account: 2b7c5d1e-8c1e-4a6a-9a0e-5f3d2b1c0a99
"#;
        let config = GatewayConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.listen, "127.0.0.1:9090".parse::<SocketAddr>().unwrap());
        assert_eq!(config.state_dir, Some(PathBuf::from("/var/lib/ipam")));
        assert_eq!(config.log_format, LogFormat::Json);
        assert_eq!(config.router.timeout_secs, 5);
        // Unset fields keep their defaults
        assert_eq!(config.router.max_backoff_ms, 10_000);
        match &config.router.agent {
            AgentConfig::Http { endpoints } => assert_eq!(endpoints.len(), 1),
            other => panic!("unexpected agent: {:?}", other),
        }
        assert_eq!(config.accounts[0].max_public_ips, Some(1));
        assert_eq!(config.networks[0].vpc, None);
    }

    #[test]
    fn test_rejects_unknown_agent() {
        let yaml = "router:\n  agent:\n    kind: telnet\n";
        assert!(GatewayConfig::from_yaml(yaml).is_err());
    }
}
