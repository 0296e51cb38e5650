//! Configuration file support for trustproxy (`.trustproxy.toml`).
//!
//! Precedence, highest to lowest: explicit CLI flag > environment
//! variable > config file value > built-in default.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use trustproxy_retry::{PerErrorConfig, RetryPolicy, RetryStrategyType};

pub const CONFIG_FILE_NAME: &str = ".trustproxy.toml";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    #[serde(default = "default_daemon_socket")]
    pub socket_path: PathBuf,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            socket_path: default_daemon_socket(),
        }
    }
}

fn default_daemon_socket() -> PathBuf {
    PathBuf::from("/var/run/docker.sock")
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListenConfig {
    #[serde(default = "default_listen_addr")]
    pub tcp_addr: String,
    #[serde(default)]
    pub recursive_proxy: bool,
    #[serde(default)]
    pub unix_socket_dir: Option<PathBuf>,
}

impl Default for ListenConfig {
    fn default() -> Self {
        Self {
            tcp_addr: default_listen_addr(),
            recursive_proxy: false,
            unix_socket_dir: None,
        }
    }
}

fn default_listen_addr() -> String {
    "127.0.0.1:2375".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TruststoreConfig {
    #[serde(default = "default_trust_env_vars")]
    pub env_var_names: Vec<String>,
    #[serde(default)]
    pub java: bool,
    #[serde(default = "default_proxy_cert_path")]
    pub proxy_cert_path: PathBuf,
    #[serde(default = "default_proxy_jks_path")]
    pub proxy_jks_path: PathBuf,
}

impl Default for TruststoreConfig {
    fn default() -> Self {
        Self {
            env_var_names: default_trust_env_vars(),
            java: false,
            proxy_cert_path: default_proxy_cert_path(),
            proxy_jks_path: default_proxy_jks_path(),
        }
    }
}

fn default_trust_env_vars() -> Vec<String> {
    vec![
        "SSL_CERT_FILE".to_string(),
        "NODE_EXTRA_CA_CERTS".to_string(),
        "REQUESTS_CA_BUNDLE".to_string(),
        "CURL_CA_BUNDLE".to_string(),
    ]
}

fn default_proxy_cert_path() -> PathBuf {
    PathBuf::from("/var/cache/proxy-ca.pem")
}

fn default_proxy_jks_path() -> PathBuf {
    PathBuf::from("/var/cache/proxy-ca.jks")
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default)]
    pub policy: RetryPolicy,
    #[serde(default)]
    pub strategy: RetryStrategyType,
    #[serde(default)]
    pub per_error: PerErrorConfig,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            policy: RetryPolicy::Default,
            strategy: RetryStrategyType::Exponential,
            per_error: PerErrorConfig::default(),
        }
    }
}

impl RetryConfig {
    pub fn to_strategy_config(&self) -> trustproxy_retry::RetryStrategyConfig {
        let mut config = self.policy.to_config();
        config.strategy = self.strategy;
        config
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProxyConfig {
    #[serde(default)]
    pub daemon: DaemonConfig,
    #[serde(default)]
    pub listen: ListenConfig,
    #[serde(default)]
    pub truststore: TruststoreConfig,
    #[serde(default)]
    pub retry: RetryConfig,
}

impl ProxyConfig {
    /// Search `workspace_root` for `.trustproxy.toml`; `Ok(None)` if absent.
    pub fn load_from_workspace(workspace_root: &Path) -> Result<Option<Self>> {
        let path = workspace_root.join(CONFIG_FILE_NAME);
        if !path.exists() {
            return Ok(None);
        }
        Self::load_from_file(&path).map(Some)
    }

    pub fn load_from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        toml::from_str(&content).with_context(|| format!("failed to parse config file: {}", path.display()))
    }

    /// Override fields from environment variables. Applied after the
    /// file is loaded and before any explicit CLI override.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("TRUSTPROXY_DAEMON_SOCKET") {
            self.daemon.socket_path = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("TRUSTPROXY_LISTEN_ADDR") {
            self.listen.tcp_addr = v;
        }
        if let Ok(v) = std::env::var("TRUSTPROXY_RECURSIVE_PROXY") {
            self.listen.recursive_proxy = parse_bool_env(&v);
        }
        if let Ok(v) = std::env::var("TRUSTPROXY_JAVA") {
            self.truststore.java = parse_bool_env(&v);
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.truststore.env_var_names.is_empty() {
            bail!("truststore.env_var_names must not be empty");
        }
        if self.listen.tcp_addr.is_empty() {
            bail!("listen.tcp_addr must not be empty");
        }
        Ok(())
    }
}

fn parse_bool_env(v: &str) -> bool {
    matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on")
}
