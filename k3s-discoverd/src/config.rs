use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, UdpSocket};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use serde::Deserialize;
use anyhow::{Context, Result};
use shared::protocol::DEFAULT_API_PORT;
use crate::clock::RetryPolicy;
use crate::error::Error;
use crate::token::resolve_token;

/// Coordinator settings. Built once from defaults, an optional TOML file and
/// the environment, then passed by reference.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub cluster: ClusterConfig,
    #[serde(default)]
    pub discovery: DiscoveryConfig,
    #[serde(default)]
    pub failopen: FailOpenConfig,
    #[serde(default)]
    pub selfcheck: SelfCheckConfig,
    #[serde(default)]
    pub tools: ToolsConfig,
    /// Resolved join token; never read from the file
    #[serde(skip)]
    pub token: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ClusterConfig {
    #[serde(default = "default_cluster")]
    pub name: String,
    #[serde(default = "default_env")]
    pub env: String,
    #[serde(default = "default_servers")]
    pub servers: u32,
    #[serde(default = "default_api_port")]
    pub api_port: u16,
    pub node_hostname: Option<String>,
    pub token_path: Option<PathBuf>,
    /// Published as TXT `ip4`; detected from the default route when unset
    pub node_ipv4: Option<Ipv4Addr>,
    pub node_ipv6: Option<Ipv6Addr>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    Avahi,
    Native,
}

impl FromStr for Backend {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "avahi" => Ok(Backend::Avahi),
            "native" | "mdns-sd" => Ok(Backend::Native),
            other => Err(format!("unknown backend {}", other)),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DiscoveryConfig {
    #[serde(default = "default_backend")]
    pub backend: Backend,
    pub fixture_file: Option<PathBuf>,
    pub interface: Option<String>,
    #[serde(default = "default_wait_secs")]
    pub wait_secs: u64,
    #[serde(default = "default_discovery_attempts")]
    pub attempts: u32,
    /// Follower polls before giving up; 0 waits forever
    #[serde(default)]
    pub server_wait_attempts: u32,
    #[serde(default = "default_reelect_secs")]
    pub follower_reelect_secs: u64,
    /// Per-call timeout; zero or negative disables it
    #[serde(default = "default_query_timeout")]
    pub query_timeout_secs: f64,
    #[serde(default = "default_query_attempts")]
    pub query_attempts: u32,
    #[serde(default = "default_query_retry_ms")]
    pub query_retry_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FailOpenConfig {
    /// Explicit override; unset means on everywhere except `prod`
    pub enabled: Option<bool>,
    #[serde(default = "default_failopen_timeout")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub server_index: u32,
    #[serde(default = "default_true")]
    pub absence_gate: bool,
    #[serde(default = "default_absence_attempts")]
    pub absence_attempts: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SelfCheckConfig {
    #[serde(default)]
    pub skip: bool,
    #[serde(default = "default_selfcheck_attempts")]
    pub attempts: u32,
    #[serde(default = "default_backoff_start_ms")]
    pub backoff_start_ms: u64,
    #[serde(default = "default_backoff_cap_ms")]
    pub backoff_cap_ms: u64,
    #[serde(default)]
    pub require_ipv4: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ToolsConfig {
    #[serde(default = "default_elect_bin")]
    pub elect_leader_bin: String,
    #[serde(default = "default_api_ready_bin")]
    pub api_ready_bin: String,
    #[serde(default = "default_api_ready_timeout")]
    pub api_ready_timeout_secs: u64,
    #[serde(default = "default_install_bin")]
    pub install_bin: String,
    #[serde(default = "default_install_timeout")]
    pub install_timeout_secs: u64,
    #[serde(default = "default_service_dir")]
    pub avahi_service_dir: PathBuf,
}

fn default_cluster() -> String {
    "sugar".to_string()
}

fn default_env() -> String {
    "dev".to_string()
}

fn default_servers() -> u32 {
    1
}

fn default_api_port() -> u16 {
    DEFAULT_API_PORT
}

fn default_backend() -> Backend {
    Backend::Avahi
}

fn default_wait_secs() -> u64 {
    5
}

fn default_discovery_attempts() -> u32 {
    3
}

fn default_reelect_secs() -> u64 {
    60
}

fn default_query_timeout() -> f64 {
    10.0
}

fn default_query_attempts() -> u32 {
    3
}

fn default_query_retry_ms() -> u64 {
    500
}

fn default_failopen_timeout() -> u64 {
    300
}

fn default_true() -> bool {
    true
}

fn default_absence_attempts() -> u32 {
    2
}

fn default_selfcheck_attempts() -> u32 {
    5
}

fn default_backoff_start_ms() -> u64 {
    500
}

fn default_backoff_cap_ms() -> u64 {
    4000
}

fn default_elect_bin() -> String {
    "elect_leader.sh".to_string()
}

fn default_api_ready_bin() -> String {
    "check_apiready.sh".to_string()
}

fn default_api_ready_timeout() -> u64 {
    120
}

fn default_install_bin() -> String {
    "k3s-install.sh".to_string()
}

fn default_install_timeout() -> u64 {
    900
}

fn default_service_dir() -> PathBuf {
    PathBuf::from("/etc/avahi/services")
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            name: default_cluster(),
            env: default_env(),
            servers: default_servers(),
            api_port: default_api_port(),
            node_hostname: None,
            token_path: None,
            node_ipv4: None,
            node_ipv6: None,
        }
    }
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            fixture_file: None,
            interface: None,
            wait_secs: default_wait_secs(),
            attempts: default_discovery_attempts(),
            server_wait_attempts: 0,
            follower_reelect_secs: default_reelect_secs(),
            query_timeout_secs: default_query_timeout(),
            query_attempts: default_query_attempts(),
            query_retry_ms: default_query_retry_ms(),
        }
    }
}

impl Default for FailOpenConfig {
    fn default() -> Self {
        Self {
            enabled: None,
            timeout_secs: default_failopen_timeout(),
            server_index: 0,
            absence_gate: true,
            absence_attempts: default_absence_attempts(),
        }
    }
}

impl Default for SelfCheckConfig {
    fn default() -> Self {
        Self {
            skip: false,
            attempts: default_selfcheck_attempts(),
            backoff_start_ms: default_backoff_start_ms(),
            backoff_cap_ms: default_backoff_cap_ms(),
            require_ipv4: false,
        }
    }
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            elect_leader_bin: default_elect_bin(),
            api_ready_bin: default_api_ready_bin(),
            api_ready_timeout_secs: default_api_ready_timeout(),
            install_bin: default_install_bin(),
            install_timeout_secs: default_install_timeout(),
            avahi_service_dir: default_service_dir(),
        }
    }
}

fn parse_bool(key: &str, value: &str) -> std::result::Result<bool, Error> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        _ => Err(Error::Config(format!("{}={:?} is not a boolean", key, value))),
    }
}

/// Environment overrides, read from an injected map
struct EnvLayer<'a> {
    vars: &'a HashMap<String, String>,
}

impl EnvLayer<'_> {
    fn get(&self, key: &str) -> Option<&str> {
        self.vars.get(key).map(|v| v.trim()).filter(|v| !v.is_empty())
    }

    fn string(&self, key: &str, target: &mut String) {
        if let Some(value) = self.get(key) {
            *target = value.to_string();
        }
    }

    fn optional<T: From<String>>(&self, key: &str, target: &mut Option<T>) {
        if let Some(value) = self.get(key) {
            *target = Some(T::from(value.to_string()));
        }
    }

    fn parsed_optional<T: FromStr>(&self, key: &str, target: &mut Option<T>) -> std::result::Result<(), Error> {
        if let Some(value) = self.get(key) {
            let parsed = value
                .parse()
                .map_err(|_| Error::Config(format!("{}={:?} is not valid", key, value)))?;
            *target = Some(parsed);
        }
        Ok(())
    }

    fn parsed<T: FromStr>(&self, key: &str, target: &mut T) -> std::result::Result<(), Error> {
        if let Some(value) = self.get(key) {
            *target = value
                .parse()
                .map_err(|_| Error::Config(format!("{}={:?} is not valid", key, value)))?;
        }
        Ok(())
    }

    fn flag(&self, key: &str, target: &mut bool) -> std::result::Result<(), Error> {
        if let Some(value) = self.get(key) {
            *target = parse_bool(key, value)?;
        }
        Ok(())
    }
}

impl Config {
    /// Load from an optional TOML file, then apply environment overrides
    pub fn load(path: Option<&Path>, vars: &HashMap<String, String>) -> Result<Self> {
        let mut config = match path {
            Some(path) => {
                let contents = std::fs::read_to_string(path)
                    .with_context(|| format!("Failed to read config file: {}", path.display()))?;
                toml::from_str::<Config>(&contents)
                    .with_context(|| format!("Failed to parse config file: {}", path.display()))?
            }
            None => Config::default(),
        };
        config.apply_env(vars).context("Invalid environment configuration")?;
        Ok(config)
    }

    /// Defaults plus environment only
    #[cfg(test)]
    pub fn from_env_map(vars: &HashMap<String, String>) -> std::result::Result<Self, Error> {
        let mut config = Config::default();
        config.apply_env(vars)?;
        Ok(config)
    }

    pub fn apply_env(&mut self, vars: &HashMap<String, String>) -> std::result::Result<(), Error> {
        let env = EnvLayer { vars };

        env.string("SUGARKUBE_CLUSTER", &mut self.cluster.name);
        env.string("SUGARKUBE_ENV", &mut self.cluster.env);
        env.parsed("SUGARKUBE_SERVERS", &mut self.cluster.servers)?;
        env.optional("SUGARKUBE_NODE_HOSTNAME", &mut self.cluster.node_hostname);
        env.optional("SUGARKUBE_TOKEN_PATH", &mut self.cluster.token_path);
        env.parsed_optional("SUGARKUBE_NODE_IPV4", &mut self.cluster.node_ipv4)?;
        env.parsed_optional("SUGARKUBE_NODE_IPV6", &mut self.cluster.node_ipv6)?;

        env.parsed("SUGARKUBE_MDNS_BACKEND", &mut self.discovery.backend)?;
        env.optional("SUGARKUBE_MDNS_FIXTURE_FILE", &mut self.discovery.fixture_file);
        env.optional("SUGARKUBE_MDNS_INTERFACE", &mut self.discovery.interface);
        env.parsed("DISCOVERY_WAIT_SECS", &mut self.discovery.wait_secs)?;
        env.parsed("DISCOVERY_ATTEMPTS", &mut self.discovery.attempts)?;
        env.parsed("SUGARKUBE_SERVER_WAIT_ATTEMPTS", &mut self.discovery.server_wait_attempts)?;
        env.parsed("FOLLOWER_REELECT_SECS", &mut self.discovery.follower_reelect_secs)?;
        env.parsed("SUGARKUBE_MDNS_QUERY_TIMEOUT", &mut self.discovery.query_timeout_secs)?;
        env.parsed("SUGARKUBE_MDNS_QUERY_ATTEMPTS", &mut self.discovery.query_attempts)?;
        env.parsed("SUGARKUBE_MDNS_QUERY_RETRY_MS", &mut self.discovery.query_retry_ms)?;

        if let Some(value) = env.get("SUGARKUBE_DISCOVERY_FAILOPEN") {
            self.failopen.enabled = Some(parse_bool("SUGARKUBE_DISCOVERY_FAILOPEN", value)?);
        }
        env.parsed("SUGARKUBE_DISCOVERY_FAILOPEN_TIMEOUT", &mut self.failopen.timeout_secs)?;
        env.parsed("SUGARKUBE_FAILOPEN_SERVER_INDEX", &mut self.failopen.server_index)?;
        env.flag("SUGARKUBE_MDNS_ABSENCE_GATE", &mut self.failopen.absence_gate)?;
        env.parsed("SUGARKUBE_MDNS_ABSENCE_ATTEMPTS", &mut self.failopen.absence_attempts)?;

        env.flag("SUGARKUBE_SKIP_MDNS_SELF_CHECK", &mut self.selfcheck.skip)?;
        env.parsed("SUGARKUBE_SELFCHK_ATTEMPTS", &mut self.selfcheck.attempts)?;
        env.parsed("SUGARKUBE_SELFCHK_BACKOFF_START_MS", &mut self.selfcheck.backoff_start_ms)?;
        env.parsed("SUGARKUBE_SELFCHK_BACKOFF_CAP_MS", &mut self.selfcheck.backoff_cap_ms)?;
        env.flag("SUGARKUBE_MDNS_REQUIRE_IPV4", &mut self.selfcheck.require_ipv4)?;

        env.string("SUGARKUBE_ELECT_LEADER_BIN", &mut self.tools.elect_leader_bin);
        env.string("SUGARKUBE_API_READY_BIN", &mut self.tools.api_ready_bin);
        env.parsed("SUGARKUBE_API_READY_TIMEOUT", &mut self.tools.api_ready_timeout_secs)?;
        env.string("SUGARKUBE_K3S_INSTALL_BIN", &mut self.tools.install_bin);
        if let Some(dir) = env.get("SUGARKUBE_AVAHI_SERVICE_DIR") {
            self.tools.avahi_service_dir = PathBuf::from(dir);
        }

        self.cluster.name = self.cluster.name.to_ascii_lowercase();
        self.cluster.env = self.cluster.env.to_ascii_lowercase();
        self.token = resolve_token(vars, &self.cluster.env, self.cluster.token_path.as_deref())?;
        self.validate()
    }

    fn validate(&self) -> std::result::Result<(), Error> {
        if self.cluster.name.is_empty() || self.cluster.env.is_empty() {
            return Err(Error::Config("cluster and environment must be set".into()));
        }
        if self.cluster.servers == 0 {
            return Err(Error::Config("SUGARKUBE_SERVERS must be at least 1".into()));
        }
        Ok(())
    }

    /// Fail-open is on by default everywhere except `prod`
    pub fn failopen_enabled(&self) -> bool {
        self.failopen.enabled.unwrap_or(self.cluster.env != "prod")
    }

    pub fn failopen_timeout(&self) -> Duration {
        Duration::from_secs(self.failopen.timeout_secs)
    }

    pub fn query_timeout(&self) -> Option<Duration> {
        let secs = self.discovery.query_timeout_secs;
        (secs > 0.0 && secs.is_finite()).then(|| Duration::from_secs_f64(secs))
    }

    pub fn query_retry(&self) -> RetryPolicy {
        RetryPolicy::fixed(self.discovery.query_attempts, Duration::from_millis(self.discovery.query_retry_ms))
    }

    pub fn selfcheck_retry(&self) -> RetryPolicy {
        RetryPolicy::exponential(
            self.selfcheck.attempts,
            Duration::from_millis(self.selfcheck.backoff_start_ms),
            Duration::from_millis(self.selfcheck.backoff_cap_ms),
        )
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.discovery.wait_secs)
    }

    pub fn reelect_interval(&self) -> Duration {
        Duration::from_secs(self.discovery.follower_reelect_secs)
    }

    /// This node's host name in `.local` form
    pub fn hostname(&self) -> String {
        let raw = self.cluster.node_hostname.clone().or_else(system_hostname).unwrap_or_default();
        shared::types::display_host(&raw)
    }
}

pub fn system_hostname() -> Option<String> {
    hostname::get().ok().map(|h| h.to_string_lossy().to_string()).filter(|h| !h.is_empty())
}

/// Source address the kernel picks for the default IPv4 route. Connecting a
/// UDP socket sends nothing.
pub fn outbound_ipv4() -> Option<Ipv4Addr> {
    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).ok()?;
    socket.connect((Ipv4Addr::new(192, 0, 2, 1), 9)).ok()?;
    match socket.local_addr().ok()?.ip() {
        IpAddr::V4(ip) if !ip.is_unspecified() && !ip.is_loopback() => Some(ip),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn test_defaults() {
        let config = Config::from_env_map(&HashMap::new()).unwrap();
        assert_eq!(config.cluster.name, "sugar");
        assert_eq!(config.cluster.env, "dev");
        assert_eq!(config.cluster.servers, 1);
        assert_eq!(config.discovery.backend, Backend::Avahi);
        assert_eq!(config.failopen_timeout(), Duration::from_secs(300));
        assert_eq!(config.query_timeout(), Some(Duration::from_secs(10)));
        assert!(config.failopen_enabled());
        assert!(config.failopen.absence_gate);
        assert_eq!(config.tools.avahi_service_dir, PathBuf::from("/etc/avahi/services"));
        assert_eq!(config.token, None);
    }

    #[test]
    fn test_failopen_default_off_in_prod_and_overridable() {
        let config = Config::from_env_map(&vars(&[("SUGARKUBE_ENV", "PROD")])).unwrap();
        assert_eq!(config.cluster.env, "prod");
        assert!(!config.failopen_enabled());

        let config = Config::from_env_map(&vars(&[("SUGARKUBE_ENV", "prod"), ("SUGARKUBE_DISCOVERY_FAILOPEN", "1")])).unwrap();
        assert!(config.failopen_enabled());

        let config = Config::from_env_map(&vars(&[("SUGARKUBE_DISCOVERY_FAILOPEN", "0")])).unwrap();
        assert!(!config.failopen_enabled());
    }

    #[test]
    fn test_env_overrides() {
        let config = Config::from_env_map(&vars(&[
            ("SUGARKUBE_SERVERS", "3"),
            ("DISCOVERY_WAIT_SECS", "0"),
            ("SUGARKUBE_MDNS_QUERY_TIMEOUT", "0"),
            ("SUGARKUBE_MDNS_BACKEND", "native"),
            ("SUGARKUBE_MDNS_INTERFACE", "eth0"),
            ("SUGARKUBE_MDNS_ABSENCE_GATE", "0"),
            ("SUGARKUBE_TOKEN_DEV", "t0k3n"),
            ("SUGARKUBE_NODE_HOSTNAME", "sugarkube1"),
            ("SUGARKUBE_NODE_IPV4", "192.0.2.7"),
        ]))
        .unwrap();
        assert_eq!(config.cluster.servers, 3);
        assert_eq!(config.poll_interval(), Duration::ZERO);
        assert_eq!(config.query_timeout(), None);
        assert_eq!(config.discovery.backend, Backend::Native);
        assert_eq!(config.discovery.interface.as_deref(), Some("eth0"));
        assert!(!config.failopen.absence_gate);
        assert_eq!(config.token.as_deref(), Some("t0k3n"));
        assert_eq!(config.hostname(), "sugarkube1.local");
        assert_eq!(config.cluster.node_ipv4, Some(Ipv4Addr::new(192, 0, 2, 7)));
        assert_eq!(config.cluster.node_ipv6, None);
    }

    #[test]
    fn test_invalid_values_are_config_errors() {
        for (key, value) in [
            ("SUGARKUBE_SERVERS", "abc"),
            ("SUGARKUBE_SERVERS", "0"),
            ("SUGARKUBE_MDNS_ABSENCE_GATE", "maybe"),
            ("SUGARKUBE_NODE_IPV4", "fe80::1"),
        ] {
            let err = Config::from_env_map(&vars(&[(key, value)])).unwrap_err();
            assert!(matches!(err, Error::Config(_)), "{}={}", key, value);
        }
    }

    #[test]
    fn test_toml_then_env_layering() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("discoverd.toml");
        std::fs::write(
            &path,
            r#"
[cluster]
name = "Lab"
servers = 3

[failopen]
enabled = false
timeout_secs = 30

[tools]
install_bin = "/opt/bin/k3s-install.sh"
"#,
        )
        .unwrap();

        let config = Config::load(Some(&path), &vars(&[("SUGARKUBE_SERVERS", "5")])).unwrap();
        assert_eq!(config.cluster.name, "lab");
        assert_eq!(config.cluster.env, "dev");
        assert_eq!(config.cluster.servers, 5);
        assert!(!config.failopen_enabled());
        assert_eq!(config.failopen.timeout_secs, 30);
        assert_eq!(config.tools.install_bin, "/opt/bin/k3s-install.sh");
        assert_eq!(config.tools.elect_leader_bin, "elect_leader.sh");
    }

    #[test]
    fn test_missing_file_has_context() {
        let err = Config::load(Some(Path::new("/nonexistent/discoverd.toml")), &HashMap::new()).unwrap_err();
        assert!(err.to_string().contains("Failed to read config file"));
    }
}
