// SPDX-License-Identifier: GPL-2.0-only
use crate::runtime::RuntimeKind;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug)]
pub enum ConfigError {
    NotFound(std::io::Error),
    Invalid(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::NotFound(e) => write!(f, "config file not found: {e}"),
            ConfigError::Invalid(e) => write!(f, "invalid config: {e}"),
        }
    }
}

impl std::error::Error for ConfigError {}

impl ConfigError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, ConfigError::NotFound(_))
    }
}

/// Roles a keeld process can run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Feed,
    Orchestrator,
    Agent,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Feed => "feed",
            Role::Orchestrator => "orchestrator",
            Role::Agent => "agent",
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub api: ApiConfig,
    pub metadata: MetadataConfig,
    pub roles: Vec<Role>,
    pub node: NodeConfig,
    pub firecracker: FirecrackerConfig,
    pub runtime: RuntimeConfig,
    pub network: NetworkConfig,
    pub orchestrator: OrchestratorConfig,
    pub agent: AgentConfig,
    pub feed: FeedConfig,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            api: ApiConfig::default(),
            metadata: MetadataConfig::default(),
            roles: vec![Role::Feed, Role::Orchestrator, Role::Agent],
            node: NodeConfig::default(),
            firecracker: FirecrackerConfig::default(),
            runtime: RuntimeConfig::default(),
            network: NetworkConfig::default(),
            orchestrator: OrchestratorConfig::default(),
            agent: AgentConfig::default(),
            feed: FeedConfig::default(),
        }
    }
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ConfigError::NotFound(e)
            } else {
                ConfigError::Invalid(e.to_string())
            }
        })?;
        let config: Config =
            serde_norway::from_str(&content).map_err(|e| ConfigError::Invalid(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values that would only fail later, deep inside a role.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let range: ipnetwork::Ipv4Network = self
            .node
            .ip_range
            .parse()
            .map_err(|e| ConfigError::Invalid(format!("node.ip_range: {e}")))?;
        if self.node.vm_prefix_len > 30 || self.node.vm_prefix_len < range.prefix() {
            return Err(ConfigError::Invalid(format!(
                "node.vm_prefix_len must be between {} and 30, got {}",
                range.prefix(),
                self.node.vm_prefix_len
            )));
        }
        if self.feed.batch_size == 0 {
            return Err(ConfigError::Invalid("feed.batch_size must be positive".into()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub listen: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        ApiConfig {
            listen: "127.0.0.1:9600".to_string(),
        }
    }
}

/// The metadata endpoint binds `listen`; guests reach it on their
/// gateway address at `port`.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MetadataConfig {
    pub listen: String,
    pub port: u16,
}

impl Default for MetadataConfig {
    fn default() -> Self {
        MetadataConfig {
            listen: "0.0.0.0:9700".to_string(),
            port: 9700,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub name: String,
    /// Address range this node carves VM subnets from.
    pub ip_range: String,
    pub max_instances: u32,
    pub vm_prefix_len: u8,
}

impl Default for NodeConfig {
    fn default() -> Self {
        let name = nix::unistd::gethostname()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "node".to_string());
        NodeConfig {
            name,
            ip_range: "10.80.0.0/16".to_string(),
            max_instances: 32,
            vm_prefix_len: 30,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FirecrackerConfig {
    pub binary: String,
    pub kernel: String,
    /// Node root filesystem holding keel-init; attached read-only.
    pub rootfs: String,
    /// Application images as `<digest>.ext4`.
    pub images_dir: String,
}

impl Default for FirecrackerConfig {
    fn default() -> Self {
        let data_dir = default_data_dir();
        FirecrackerConfig {
            binary: "/usr/bin/firecracker".to_string(),
            kernel: data_dir.join("vmlinux").to_string_lossy().to_string(),
            rootfs: data_dir.join("rootfs.ext4").to_string_lossy().to_string(),
            images_dir: data_dir.join("images").to_string_lossy().to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub kind: RuntimeKind,
    pub startup_deadline_secs: u64,
    pub stop_timeout_secs: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        RuntimeConfig {
            kind: RuntimeKind::Firecracker,
            startup_deadline_secs: 30,
            stop_timeout_secs: 10,
        }
    }
}

impl RuntimeConfig {
    pub fn startup_deadline(&self) -> Duration {
        Duration::from_secs(self.startup_deadline_secs)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.stop_timeout_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Restrict masquerading to this uplink. Empty: any non-VM interface.
    pub egress_interface: String,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        NetworkConfig {
            egress_interface: String::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub backoff_base_ms: u64,
    pub backoff_cap_secs: u64,
    pub exhausted_retry_secs: u64,
    pub resync_interval_secs: u64,
    pub build_poll_secs: u64,
    pub heartbeat_timeout_secs: u64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        OrchestratorConfig {
            backoff_base_ms: 200,
            backoff_cap_secs: 60,
            exhausted_retry_secs: 30,
            resync_interval_secs: 60,
            build_poll_secs: 5,
            heartbeat_timeout_secs: 30,
        }
    }
}

impl OrchestratorConfig {
    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }

    pub fn backoff_cap(&self) -> Duration {
        Duration::from_secs(self.backoff_cap_secs)
    }

    pub fn exhausted_retry(&self) -> Duration {
        Duration::from_secs(self.exhausted_retry_secs)
    }

    pub fn resync_interval(&self) -> Duration {
        Duration::from_secs(self.resync_interval_secs)
    }

    pub fn build_poll(&self) -> Duration {
        Duration::from_secs(self.build_poll_secs)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_secs(self.heartbeat_timeout_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub reconcile_interval_secs: u64,
    pub routes_file: String,
    pub teardown_alert_attempts: u32,
}

impl Default for AgentConfig {
    fn default() -> Self {
        AgentConfig {
            reconcile_interval_secs: 5,
            routes_file: default_runtime_path()
                .join("routes.json")
                .to_string_lossy()
                .to_string(),
            teardown_alert_attempts: 5,
        }
    }
}

impl AgentConfig {
    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_secs(self.reconcile_interval_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FeedConfig {
    pub poll_interval_ms: u64,
    pub batch_size: u32,
}

impl Default for FeedConfig {
    fn default() -> Self {
        FeedConfig {
            poll_interval_ms: 250,
            batch_size: 256,
        }
    }
}

impl FeedConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("keel")
}

/// Returns the default config file path: $XDG_CONFIG_HOME/keel/keel.yaml
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("keel")
        .join("keel.yaml")
}

/// Returns the default database path: $XDG_STATE_HOME/keel/keel.db
pub fn default_db_path() -> PathBuf {
    dirs::state_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("keel")
        .join("keel.db")
}

/// Returns the default runtime path: $XDG_RUNTIME_DIR/keel
pub fn default_runtime_path() -> PathBuf {
    dirs::runtime_dir()
        .unwrap_or_else(|| {
            let uid = nix::unistd::getuid();
            let run_user = PathBuf::from(format!("/run/user/{uid}"));
            if run_user.exists() {
                run_user
            } else {
                std::env::temp_dir().join(format!("keel-runtime-{uid}"))
            }
        })
        .join("keel")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_yaml_uses_defaults() {
        let config: Config = serde_norway::from_str("{}").unwrap();
        assert_eq!(config.api.listen, "127.0.0.1:9600");
        assert_eq!(config.roles.len(), 3);
        assert_eq!(config.node.vm_prefix_len, 30);
        assert_eq!(config.orchestrator.backoff_base(), Duration::from_millis(200));
        assert_eq!(config.orchestrator.backoff_cap(), Duration::from_secs(60));
        assert_eq!(config.runtime.kind, RuntimeKind::Firecracker);
    }

    #[test]
    fn sections_deserialize() {
        let yaml = r#"
roles: [agent]
node:
  name: "node-a"
  ip_range: "10.9.0.0/24"
  max_instances: 4
runtime:
  kind: cloud-hypervisor
  startup_deadline_secs: 5
agent:
  routes_file: "/run/keel/routes.json"
"#;
        let config: Config = serde_norway::from_str(yaml).unwrap();
        assert_eq!(config.roles, vec![Role::Agent]);
        assert_eq!(config.node.name, "node-a");
        assert_eq!(config.node.max_instances, 4);
        assert_eq!(config.runtime.kind, RuntimeKind::CloudHypervisor);
        assert_eq!(config.runtime.startup_deadline(), Duration::from_secs(5));
        assert_eq!(config.agent.routes_file, "/run/keel/routes.json");
        config.validate().unwrap();
    }

    #[test]
    fn validate_rejects_bad_prefix() {
        let mut config = Config::default();
        config.node.ip_range = "10.9.0.0/24".into();
        config.node.vm_prefix_len = 16;
        assert!(config.validate().is_err());

        config.node.vm_prefix_len = 31;
        assert!(config.validate().is_err());
    }

    #[test]
    fn load_nonexistent_file_returns_not_found() {
        let result = Config::load("/nonexistent/path/keel.yaml");
        assert!(result.unwrap_err().is_not_found());
    }

    #[test]
    fn load_invalid_yaml_returns_invalid() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keel.yaml");
        std::fs::write(&path, "{{invalid yaml").unwrap();
        let err = Config::load(&path).unwrap_err();
        assert!(!err.is_not_found());
    }

    #[test]
    fn default_paths_are_namespaced() {
        assert!(default_db_path().ends_with("keel/keel.db"));
        assert!(default_config_path().ends_with("keel/keel.yaml"));
        assert!(default_runtime_path().ends_with("keel"));
    }
}
