use crate::settings::{Protocol, Sniffing, TransportTemplate};
use serde::Deserialize;
use std::collections::HashMap;
use std::ops::Range;
use std::path::Path;
use std::time::Duration;

/// Global configuration for the panel
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    /// HTTP API settings
    #[serde(default)]
    pub server: ServerConfig,

    /// Store location
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Admin user created on an empty database
    #[serde(default)]
    pub admin: AdminConfig,

    /// Defaults for newly provisioned inbounds
    #[serde(default)]
    pub provision: ProvisionConfig,

    /// Restart debouncing
    #[serde(default)]
    pub restart: RestartConfig,

    /// The managed proxy process
    #[serde(default)]
    pub xray: XrayConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Bind address (default: 0.0.0.0)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// API port (default: 54321)
    #[serde(default = "default_api_port")]
    pub port: u16,

    /// Bearer token required on /api routes.
    /// If not set, a random token is generated at startup and logged
    pub api_token: Option<String>,

    /// Path to PID file (optional)
    pub pid_file: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind_address(),
            port: default_api_port(),
            api_token: None,
            pid_file: None,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct DatabaseConfig {
    /// SQLite file path (default: ./data/relaypanel.db)
    #[serde(default = "default_database_path")]
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_database_path(),
        }
    }
}

/// Credentials for the user that owns provisioned inbounds
#[derive(Debug, Deserialize, Clone, Default)]
pub struct AdminConfig {
    pub username: Option<String>,
    pub password: Option<String>,
}

impl AdminConfig {
    pub fn credentials(&self) -> Option<(&str, &str)> {
        match (&self.username, &self.password) {
            (Some(u), Some(p)) => Some((u.as_str(), p.as_str())),
            _ => None,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ProvisionConfig {
    /// First port handed out (inclusive, default: 20000)
    #[serde(default = "default_port_range_start")]
    pub port_range_start: u16,

    /// End of the port range (exclusive, default: 50000)
    #[serde(default = "default_port_range_end")]
    pub port_range_end: u16,

    /// Random ports tried before giving up (default: 5)
    #[serde(default = "default_port_attempts")]
    pub port_attempts: u32,

    /// Protocol for new inbounds (default: vmess)
    #[serde(default)]
    pub protocol: Protocol,

    /// Flow mode for new clients
    #[serde(default = "default_flow")]
    pub flow: String,

    /// Listen address for new inbounds, empty for all interfaces
    #[serde(default)]
    pub listen: String,

    /// Transport applied to new inbounds
    #[serde(default)]
    pub transport: TransportTemplate,

    /// Sniffing applied to new inbounds
    #[serde(default)]
    pub sniffing: Sniffing,
}

impl Default for ProvisionConfig {
    fn default() -> Self {
        Self {
            port_range_start: default_port_range_start(),
            port_range_end: default_port_range_end(),
            port_attempts: default_port_attempts(),
            protocol: Protocol::default(),
            flow: default_flow(),
            listen: String::new(),
            transport: TransportTemplate::default(),
            sniffing: Sniffing::default(),
        }
    }
}

impl ProvisionConfig {
    pub fn port_range(&self) -> Range<u16> {
        self.port_range_start..self.port_range_end
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.port_range_start == 0 {
            return Err("provision: 'port_range_start' must be greater than 0".to_string());
        }
        if self.port_range_start >= self.port_range_end {
            return Err(format!(
                "provision: port range {}..{} is empty",
                self.port_range_start, self.port_range_end
            ));
        }
        if self.port_attempts == 0 {
            return Err("provision: 'port_attempts' must be at least 1".to_string());
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct RestartConfig {
    /// Seconds between dirty-flag checks (default: 10)
    #[serde(default = "default_restart_interval")]
    pub interval_secs: u64,

    /// Seconds a restart may take before it counts as failed (default: 30)
    #[serde(default = "default_restart_timeout")]
    pub timeout_secs: u64,

    /// Re-arm the dirty flag after a failed restart so the next tick retries
    #[serde(default)]
    pub rearm_on_failure: bool,
}

impl Default for RestartConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_restart_interval(),
            timeout_secs: default_restart_timeout(),
            rearm_on_failure: false,
        }
    }
}

impl RestartConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.interval_secs == 0 {
            return Err("restart: 'interval_secs' must be at least 1".to_string());
        }
        if self.timeout_secs == 0 {
            return Err("restart: 'timeout_secs' must be at least 1".to_string());
        }
        Ok(())
    }
}

/// Configuration for the managed proxy process
///
/// # Security Warning
///
/// `command` and `args` are executed directly. Configuration files must be
/// protected with appropriate file permissions.
#[derive(Debug, Deserialize, Clone)]
pub struct XrayConfig {
    /// Path of the proxy binary (default: ./bin/xray)
    #[serde(default = "default_xray_command")]
    pub command: String,

    /// Arguments; when empty, `-c <config_path>` is passed
    #[serde(default)]
    pub args: Vec<String>,

    /// Where the rendered proxy config is written
    #[serde(default = "default_xray_config_path")]
    pub config_path: String,

    /// Working directory for the process
    pub working_dir: Option<String>,

    /// Environment variables to set
    #[serde(default)]
    pub env: HashMap<String, String>,

    /// Grace period in seconds between SIGTERM and SIGKILL (default: 5)
    #[serde(default = "default_shutdown_grace_period")]
    pub shutdown_grace_period_secs: u64,

    /// Proxy log level written into the rendered config (default: warning)
    #[serde(default = "default_xray_log_level")]
    pub log_level: String,

    /// How long a fresh process must stay alive to count as started (default: 200ms)
    #[serde(default = "default_startup_check")]
    pub startup_check_ms: u64,
}

impl Default for XrayConfig {
    fn default() -> Self {
        Self {
            command: default_xray_command(),
            args: Vec::new(),
            config_path: default_xray_config_path(),
            working_dir: None,
            env: HashMap::new(),
            shutdown_grace_period_secs: default_shutdown_grace_period(),
            log_level: default_xray_log_level(),
            startup_check_ms: default_startup_check(),
        }
    }
}

impl XrayConfig {
    /// Create a config for the given binary with defaults
    pub fn new(command: &str) -> Self {
        Self {
            command: command.to_string(),
            ..Self::default()
        }
    }

    /// Set arguments (builder pattern)
    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    /// Set the rendered config path (builder pattern)
    pub fn with_config_path(mut self, path: &str) -> Self {
        self.config_path = path.to_string();
        self
    }

    /// Arguments actually passed to the process
    pub fn effective_args(&self) -> Vec<String> {
        if self.args.is_empty() {
            vec!["-c".to_string(), self.config_path.clone()]
        } else {
            self.args.clone()
        }
    }

    pub fn shutdown_grace_period(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_period_secs)
    }

    pub fn startup_check(&self) -> Duration {
        Duration::from_millis(self.startup_check_ms)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.command.trim().is_empty() {
            return Err("xray: 'command' must not be empty".to_string());
        }
        if self.config_path.trim().is_empty() {
            return Err("xray: 'config_path' must not be empty".to_string());
        }
        Ok(())
    }
}

// Default value functions
fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_api_port() -> u16 {
    54321
}

fn default_database_path() -> String {
    "./data/relaypanel.db".to_string()
}

fn default_port_range_start() -> u16 {
    20000
}

fn default_port_range_end() -> u16 {
    50000
}

fn default_port_attempts() -> u32 {
    5
}

fn default_flow() -> String {
    "xtls-rprx-direct".to_string()
}

fn default_restart_interval() -> u64 {
    10
}

fn default_restart_timeout() -> u64 {
    30
}

fn default_xray_command() -> String {
    "./bin/xray".to_string()
}

fn default_xray_config_path() -> String {
    "./bin/config.json".to_string()
}

fn default_shutdown_grace_period() -> u64 {
    5
}

fn default_xray_log_level() -> String {
    "warning".to_string()
}

fn default_startup_check() -> u64 {
    200
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    /// Parse and validate a TOML document
    pub fn parse(content: &str) -> anyhow::Result<Self> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate all configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        if let Err(e) = self.provision.validate() {
            errors.push(e);
        }
        if let Err(e) = self.restart.validate() {
            errors.push(e);
        }
        if let Err(e) = self.xray.validate() {
            errors.push(e);
        }
        if self.admin.username.is_some() != self.admin.password.is_some() {
            errors.push("admin: 'username' and 'password' must be set together".to_string());
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }
}
