use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

/// Global configuration for the gateway
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    /// Listener and process-level settings
    #[serde(default)]
    pub server: ServerConfig,

    /// Credential validation settings
    #[serde(default)]
    pub auth: AuthConfig,

    /// Per-tenant container settings
    #[serde(default)]
    pub instances: InstanceConfig,

    /// Backend session pooling settings
    #[serde(default)]
    pub sessions: SessionConfig,

    /// Forwarding behaviour
    #[serde(default)]
    pub proxy: ProxyConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Bind address (default: 0.0.0.0)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// Listening port (default: 8000)
    #[serde(default = "default_listen_port")]
    pub port: u16,

    /// Path to PID file (optional)
    pub pid_file: Option<String>,

    /// Bearer token for /stats and the removal hook.
    /// When unset, operator auth is left to the front-end proxy.
    pub stats_token: Option<String>,

    /// Maximum idle connections per instance (default: 10)
    #[serde(default = "default_pool_max_idle_per_host")]
    pub pool_max_idle_per_host: usize,

    /// Idle connection timeout in seconds (default: 90)
    #[serde(default = "default_pool_idle_timeout")]
    pub pool_idle_timeout_secs: u64,

    /// Stop every running instance when the gateway exits (default: false)
    #[serde(default)]
    pub stop_instances_on_shutdown: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind_address(),
            port: default_listen_port(),
            pid_file: None,
            stats_token: None,
            pool_max_idle_per_host: default_pool_max_idle_per_host(),
            pool_idle_timeout_secs: default_pool_idle_timeout(),
            stop_instances_on_shutdown: false,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct AuthConfig {
    /// Request header carrying the tenant credential
    #[serde(default = "default_credential_header")]
    pub credential_header: String,

    /// Identity service endpoint used to confirm a credential
    #[serde(default = "default_identity_url")]
    pub identity_url: String,

    /// Timeout for a single identity call in seconds (default: 10)
    #[serde(default = "default_identity_timeout")]
    pub identity_timeout_secs: u64,
}

impl AuthConfig {
    pub fn identity_timeout(&self) -> Duration {
        Duration::from_secs(self.identity_timeout_secs)
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            credential_header: default_credential_header(),
            identity_url: default_identity_url(),
            identity_timeout_secs: default_identity_timeout(),
        }
    }
}

/// Image pull policy for tenant containers
#[derive(Debug, Deserialize, Clone, Default, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub enum PullPolicy {
    /// Always pull before creating a container
    Always,
    /// Pull only when the image is missing locally
    #[default]
    IfNotPresent,
    /// Never pull; the image must already exist
    Never,
}

#[derive(Debug, Deserialize, Clone)]
pub struct InstanceConfig {
    /// Image every tenant container runs
    #[serde(default = "default_image")]
    pub image: String,

    /// Port the backend listens on inside the container
    #[serde(default = "default_container_port")]
    pub container_port: u16,

    /// Prefix of the deterministic container name
    #[serde(default = "default_name_prefix")]
    pub name_prefix: String,

    /// Memory cap, e.g. "256m"
    #[serde(default = "default_memory")]
    pub memory: String,

    /// CPU share cap, e.g. "0.3"
    #[serde(default = "default_cpus")]
    pub cpus: String,

    /// Docker network mode
    #[serde(default = "default_network")]
    pub network: String,

    #[serde(default)]
    pub pull_policy: PullPolicy,

    /// Docker daemon address (unix:// or tcp://), DOCKER_HOST when unset
    pub docker_host: Option<String>,

    /// Environment variable the raw credential is handed to the backend in
    #[serde(default = "default_credential_env")]
    pub credential_env: String,

    /// Extra environment for every container
    #[serde(default)]
    pub env: HashMap<String, String>,

    /// First host port handed out (inclusive)
    #[serde(default = "default_port_range_start")]
    pub port_range_start: u16,

    /// End of the host port range (exclusive)
    #[serde(default = "default_port_range_end")]
    pub port_range_end: u16,

    /// Budget for create + start + readiness on first use
    #[serde(default = "default_creation_timeout")]
    pub creation_timeout_secs: u64,

    /// Budget for start + readiness of a stopped instance
    #[serde(default = "default_restart_timeout")]
    pub restart_timeout_secs: u64,

    /// Interval between readiness checks in milliseconds
    #[serde(default = "default_readiness_interval")]
    pub readiness_interval_ms: u64,

    /// HTTP path requested for readiness; plain TCP connect when unset
    pub readiness_path: Option<String>,

    /// Grace period given to `docker stop` before it kills
    #[serde(default = "default_stop_grace_period")]
    pub stop_grace_period_secs: u64,

    /// Inactivity after which a running instance is stopped (default: 15 min)
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,

    /// Consecutive failed starts before a tenant is cooled down
    #[serde(default = "default_max_start_failures")]
    pub max_start_failures: u32,

    /// How long a tenant fails fast after tripping the breaker
    #[serde(default = "default_failure_cooldown")]
    pub failure_cooldown_secs: u64,
}

impl InstanceConfig {
    pub fn creation_timeout(&self) -> Duration {
        Duration::from_secs(self.creation_timeout_secs)
    }

    pub fn restart_timeout(&self) -> Duration {
        Duration::from_secs(self.restart_timeout_secs)
    }

    pub fn readiness_interval(&self) -> Duration {
        Duration::from_millis(self.readiness_interval_ms)
    }

    pub fn stop_grace_period(&self) -> Duration {
        Duration::from_secs(self.stop_grace_period_secs)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn failure_cooldown(&self) -> Duration {
        Duration::from_secs(self.failure_cooldown_secs)
    }
}

impl Default for InstanceConfig {
    fn default() -> Self {
        Self {
            image: default_image(),
            container_port: default_container_port(),
            name_prefix: default_name_prefix(),
            memory: default_memory(),
            cpus: default_cpus(),
            network: default_network(),
            pull_policy: PullPolicy::default(),
            docker_host: None,
            credential_env: default_credential_env(),
            env: HashMap::new(),
            port_range_start: default_port_range_start(),
            port_range_end: default_port_range_end(),
            creation_timeout_secs: default_creation_timeout(),
            restart_timeout_secs: default_restart_timeout(),
            readiness_interval_ms: default_readiness_interval(),
            readiness_path: None,
            stop_grace_period_secs: default_stop_grace_period(),
            idle_timeout_secs: default_idle_timeout(),
            max_start_failures: default_max_start_failures(),
            failure_cooldown_secs: default_failure_cooldown(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct SessionConfig {
    /// Header the backend uses for its session token
    #[serde(default = "default_session_header")]
    pub header: String,

    /// Inactivity after which a cached token is evicted (default: 1 hour)
    #[serde(default = "default_session_idle_timeout")]
    pub idle_timeout_secs: u64,

    /// Backend statuses meaning "unknown session" when a token was attached
    #[serde(default = "default_rejected_statuses")]
    pub rejected_statuses: Vec<u16>,

    /// Largest request body kept in memory so it can be replayed without a token
    #[serde(default = "default_max_replay_body")]
    pub max_replay_body_bytes: usize,
}

impl SessionConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            header: default_session_header(),
            idle_timeout_secs: default_session_idle_timeout(),
            rejected_statuses: default_rejected_statuses(),
            max_replay_body_bytes: default_max_replay_body(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ProxyConfig {
    /// Time allowed for the instance to answer with response headers
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Interval between reaper sweeps
    #[serde(default = "default_reaper_interval")]
    pub reaper_interval_secs: u64,

    /// Backend path that an inbound "/" is forwarded to
    #[serde(default = "default_root_path")]
    pub root_path: Option<String>,

    /// Accept header set when the caller sends none
    #[serde(default = "default_accept")]
    pub default_accept: Option<String>,
}

impl ProxyConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn reaper_interval(&self) -> Duration {
        Duration::from_secs(self.reaper_interval_secs)
    }
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            request_timeout_secs: default_request_timeout(),
            reaper_interval_secs: default_reaper_interval(),
            root_path: default_root_path(),
            default_accept: default_accept(),
        }
    }
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_listen_port() -> u16 {
    8000
}

fn default_pool_max_idle_per_host() -> usize {
    10
}

fn default_pool_idle_timeout() -> u64 {
    90
}

fn default_credential_header() -> String {
    "x-outline-api-key".to_string()
}

fn default_identity_url() -> String {
    "https://app.getoutline.com/api/auth.info".to_string()
}

fn default_identity_timeout() -> u64 {
    10
}

fn default_image() -> String {
    "ghcr.io/vortiago/mcp-outline:latest".to_string()
}

fn default_container_port() -> u16 {
    3000
}

fn default_name_prefix() -> String {
    "mcp-".to_string()
}

fn default_memory() -> String {
    "256m".to_string()
}

fn default_cpus() -> String {
    "0.3".to_string()
}

fn default_network() -> String {
    "bridge".to_string()
}

fn default_credential_env() -> String {
    "OUTLINE_API_KEY".to_string()
}

fn default_port_range_start() -> u16 {
    4000
}

fn default_port_range_end() -> u16 {
    5000
}

fn default_creation_timeout() -> u64 {
    30
}

fn default_restart_timeout() -> u64 {
    15
}

fn default_readiness_interval() -> u64 {
    250
}

fn default_stop_grace_period() -> u64 {
    10
}

fn default_idle_timeout() -> u64 {
    15 * 60
}

fn default_max_start_failures() -> u32 {
    3
}

fn default_failure_cooldown() -> u64 {
    60
}

fn default_session_header() -> String {
    "mcp-session-id".to_string()
}

fn default_session_idle_timeout() -> u64 {
    60 * 60
}

fn default_rejected_statuses() -> Vec<u16> {
    vec![404]
}

fn default_max_replay_body() -> usize {
    4 * 1024 * 1024
}

fn default_request_timeout() -> u64 {
    90
}

fn default_reaper_interval() -> u64 {
    60
}

fn default_root_path() -> Option<String> {
    Some("/mcp".to_string())
}

fn default_accept() -> Option<String> {
    Some("application/json, text/event-stream".to_string())
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration, reporting every problem at once
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        for (field, value) in [
            ("auth.credential_header", &self.auth.credential_header),
            ("sessions.header", &self.sessions.header),
        ] {
            if hyper::header::HeaderName::from_bytes(value.as_bytes()).is_err() {
                errors.push(format!("{}: '{}' is not a valid header name", field, value));
            }
        }

        if self.auth.credential_header.eq_ignore_ascii_case(&self.sessions.header) {
            errors.push("auth.credential_header and sessions.header must differ".to_string());
        }

        if self.instances.image.trim().is_empty() {
            errors.push("instances.image must not be empty".to_string());
        }

        if let Err(e) = crate::runtime::parse_memory_limit(&self.instances.memory) {
            errors.push(format!("instances.memory: {}", e));
        }
        if let Err(e) = crate::runtime::parse_cpu_limit(&self.instances.cpus) {
            errors.push(format!("instances.cpus: {}", e));
        }

        if self.instances.port_range_start == 0
            || self.instances.port_range_start >= self.instances.port_range_end
        {
            errors.push(format!(
                "instances: port range {}..{} is empty",
                self.instances.port_range_start, self.instances.port_range_end
            ));
        }

        for (field, value) in [
            ("instances.creation_timeout_secs", self.instances.creation_timeout_secs),
            ("instances.restart_timeout_secs", self.instances.restart_timeout_secs),
            ("instances.readiness_interval_ms", self.instances.readiness_interval_ms),
            ("instances.idle_timeout_secs", self.instances.idle_timeout_secs),
            ("sessions.idle_timeout_secs", self.sessions.idle_timeout_secs),
            ("proxy.request_timeout_secs", self.proxy.request_timeout_secs),
            ("proxy.reaper_interval_secs", self.proxy.reaper_interval_secs),
            ("auth.identity_timeout_secs", self.auth.identity_timeout_secs),
        ] {
            if value == 0 {
                errors.push(format!("{} must be greater than 0", field));
            }
        }

        if self.instances.max_start_failures == 0 {
            errors.push("instances.max_start_failures must be greater than 0".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config: Config = toml::from_str("").unwrap();

        assert_eq!(config.server.port, 8000);
        assert_eq!(config.server.bind, "0.0.0.0");
        assert!(config.server.stats_token.is_none());
        assert_eq!(config.auth.credential_header, "x-outline-api-key");
        assert_eq!(config.instances.port_range_start, 4000);
        assert_eq!(config.instances.port_range_end, 5000);
        assert_eq!(config.instances.idle_timeout(), Duration::from_secs(900));
        assert_eq!(config.instances.pull_policy, PullPolicy::IfNotPresent);
        assert_eq!(config.sessions.header, "mcp-session-id");
        assert_eq!(config.sessions.rejected_statuses, vec![404]);
        assert_eq!(config.proxy.root_path.as_deref(), Some("/mcp"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_config() {
        let toml = r#"
[server]
port = 9100
stats_token = "operator"

[auth]
credential_header = "x-api-key"
identity_url = "http://127.0.0.1:7000/auth"

[instances]
image = "backend:dev"
memory = "512m"
cpus = "1.0"
pull_policy = "never"
port_range_start = 6000
port_range_end = 6010
idle_timeout_secs = 60

[instances.env]
LOG_LEVEL = "debug"

[sessions]
header = "x-session"
rejected_statuses = [404, 410]
"#;
        let config: Config = toml::from_str(toml).unwrap();

        assert_eq!(config.server.port, 9100);
        assert_eq!(config.server.stats_token.as_deref(), Some("operator"));
        assert_eq!(config.auth.credential_header, "x-api-key");
        assert_eq!(config.instances.image, "backend:dev");
        assert_eq!(config.instances.pull_policy, PullPolicy::Never);
        assert_eq!(config.instances.port_range_end, 6010);
        assert_eq!(config.instances.idle_timeout(), Duration::from_secs(60));
        assert_eq!(config.instances.env.get("LOG_LEVEL"), Some(&"debug".to_string()));
        assert_eq!(config.sessions.rejected_statuses, vec![404, 410]);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_empty_port_range() {
        let toml = r#"
[instances]
port_range_start = 5000
port_range_end = 5000
"#;
        let config: Config = toml::from_str(toml).unwrap();
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("port range 5000..5000 is empty"));
    }

    #[test]
    fn test_validate_multiple_errors() {
        let toml = r#"
[auth]
credential_header = "bad header"

[instances]
image = ""
creation_timeout_secs = 0
"#;
        let config: Config = toml::from_str(toml).unwrap();
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("not a valid header name"));
        assert!(err.contains("instances.image must not be empty"));
        assert!(err.contains("instances.creation_timeout_secs must be greater than 0"));
    }

    #[test]
    fn test_validate_headers_must_differ() {
        let toml = r#"
[auth]
credential_header = "X-Token"

[sessions]
header = "x-token"
"#;
        let config: Config = toml::from_str(toml).unwrap();
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("must differ"));
    }

    #[test]
    fn test_pull_policy_variants() {
        let config: Config = toml::from_str("[instances]\npull_policy = \"always\"").unwrap();
        assert_eq!(config.instances.pull_policy, PullPolicy::Always);

        let config: Config =
            toml::from_str("[instances]\npull_policy = \"if-not-present\"").unwrap();
        assert_eq!(config.instances.pull_policy, PullPolicy::IfNotPresent);
    }
}
