//! Session and Host Configuration
//!
//! `SessionConfig` is what one tunnel session is built from. It is created
//! from validated command arguments and never mutated afterwards: a restart
//! builds a fresh value.
//!
//! `HostSettings` carries the knobs that belong to the hosting process
//! rather than to a single session (MTU, virtual address, stop timeout).

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::net::Ipv4Addr;
use std::path::Path;
use std::time::Duration;

/// Application identifier (package name, bundle id, ...)
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AppId(String);

impl AppId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for AppId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for AppId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for AppId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Configuration of one tunnel session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionConfig {
    /// Host of the local intercepting proxy
    pub proxy_host: String,
    /// Port of the local intercepting proxy
    pub proxy_port: u16,
    /// Applications whose traffic enters the tunnel (empty = everything)
    #[serde(default)]
    pub allowed_apps: Option<BTreeSet<AppId>>,
    /// Applications kept out of the tunnel
    #[serde(default)]
    pub disallowed_apps: Option<BTreeSet<AppId>>,
    /// Advertise the proxy as the interface's HTTP proxy
    #[serde(default = "default_true")]
    pub enable_system_proxy: bool,
    /// Domains, IPs and CIDRs that should not be proxied, in user order
    #[serde(default)]
    pub pass_through_entries: Vec<String>,
}

fn default_true() -> bool {
    true
}

impl SessionConfig {
    /// Create a configuration that tunnels every application
    pub fn new(proxy_host: impl Into<String>, proxy_port: u16) -> Self {
        Self {
            proxy_host: proxy_host.into(),
            proxy_port,
            allowed_apps: None,
            disallowed_apps: None,
            enable_system_proxy: true,
            pass_through_entries: Vec::new(),
        }
    }

    pub fn with_allowed_apps<I, A>(mut self, apps: I) -> Self
    where
        I: IntoIterator<Item = A>,
        A: Into<AppId>,
    {
        self.allowed_apps = Some(apps.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_disallowed_apps<I, A>(mut self, apps: I) -> Self
    where
        I: IntoIterator<Item = A>,
        A: Into<AppId>,
    {
        self.disallowed_apps = Some(apps.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_system_proxy(mut self, enabled: bool) -> Self {
        self.enable_system_proxy = enabled;
        self
    }

    pub fn with_pass_through<I, S>(mut self, entries: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.pass_through_entries = entries.into_iter().map(Into::into).collect();
        self
    }

    /// `host:port` of the proxy
    pub fn proxy_endpoint(&self) -> String {
        format!("{}:{}", self.proxy_host, self.proxy_port)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.proxy_host.trim().is_empty() {
            return Err(ConfigError::MissingHost);
        }
        if self.proxy_port == 0 {
            return Err(ConfigError::InvalidPort(0));
        }
        Ok(())
    }
}

/// Raw arguments of a start/restart command, as sent by the UI layer.
///
/// Every field is optional here; [`CommandArgs::into_config`] decides what
/// is required and what falls back to a previous session.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandArgs {
    #[serde(default)]
    pub proxy_host: Option<String>,
    #[serde(default)]
    pub proxy_port: Option<i64>,
    #[serde(default)]
    pub allow_apps: Option<Vec<String>>,
    #[serde(default)]
    pub disallow_apps: Option<Vec<String>>,
    #[serde(default)]
    pub set_system_proxy: Option<bool>,
    #[serde(default)]
    pub proxy_pass_domains: Option<Vec<String>>,
}

impl CommandArgs {
    /// Build a session configuration from these arguments.
    ///
    /// Missing fields are taken from `previous` when given; without a
    /// previous session, host and port are mandatory.
    pub fn into_config(self, previous: Option<&SessionConfig>) -> Result<SessionConfig, ConfigError> {
        let proxy_host = match (self.proxy_host, previous) {
            (Some(host), _) => host.trim().to_string(),
            (None, Some(prev)) => prev.proxy_host.clone(),
            (None, None) => return Err(ConfigError::MissingHost),
        };

        let proxy_port = match (self.proxy_port, previous) {
            (Some(port), _) => u16::try_from(port)
                .ok()
                .filter(|p| *p != 0)
                .ok_or(ConfigError::InvalidPort(port))?,
            (None, Some(prev)) => prev.proxy_port,
            (None, None) => return Err(ConfigError::MissingPort),
        };

        let allowed_apps = match self.allow_apps {
            Some(apps) => Some(apps.into_iter().map(AppId::from).collect()),
            None => previous.and_then(|p| p.allowed_apps.clone()),
        };
        let disallowed_apps = match self.disallow_apps {
            Some(apps) => Some(apps.into_iter().map(AppId::from).collect()),
            None => previous.and_then(|p| p.disallowed_apps.clone()),
        };
        let pass_through_entries = match self.proxy_pass_domains {
            Some(entries) => entries,
            None => previous
                .map(|p| p.pass_through_entries.clone())
                .unwrap_or_default(),
        };

        let config = SessionConfig {
            proxy_host,
            proxy_port,
            allowed_apps,
            disallowed_apps,
            enable_system_proxy: self.set_system_proxy.unwrap_or(true),
            pass_through_entries,
        };
        config.validate()?;
        Ok(config)
    }
}

/// Settings of the hosting process, shared by every session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HostSettings {
    /// Maximum transmission unit of the virtual interface
    pub mtu: u32,
    /// Local address assigned to the virtual interface
    pub virtual_address: Ipv4Addr,
    /// Prefix length of the virtual address
    pub virtual_prefix: u8,
    /// Session label shown by the platform
    pub session_name: String,
    /// Proxy host used by a bare restart with no previous session
    pub default_proxy_host: String,
    /// Proxy port used by a bare restart with no previous session
    pub default_proxy_port: u16,
    /// Bounded wait for the tunnel processor on stop (milliseconds)
    pub stop_timeout_ms: u64,
}

impl Default for HostSettings {
    fn default() -> Self {
        Self {
            mtu: 1500,
            virtual_address: Ipv4Addr::new(10, 0, 0, 2),
            virtual_prefix: 32,
            session_name: "NetProxy".to_string(),
            default_proxy_host: "127.0.0.1".to_string(),
            default_proxy_port: 9099,
            stop_timeout_ms: 5000,
        }
    }
}

impl HostSettings {
    /// Parse settings from TOML
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let settings: Self =
            toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))?;
        settings.validate()?;
        Ok(settings)
    }

    /// Load settings from a TOML file
    pub fn from_toml_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Io(format!("{}: {}", path.display(), e)))?;
        Self::from_toml(&content)
    }

    /// Export as TOML
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }

    /// Fill host/port from the defaults when a restart has nothing to reuse
    pub fn apply_defaults(&self, args: &mut CommandArgs) {
        if args.proxy_host.is_none() {
            args.proxy_host = Some(self.default_proxy_host.clone());
        }
        if args.proxy_port.is_none() {
            args.proxy_port = Some(i64::from(self.default_proxy_port));
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(576..=65535).contains(&self.mtu) {
            return Err(ConfigError::InvalidMtu(self.mtu));
        }
        if self.virtual_prefix > 32 {
            return Err(ConfigError::InvalidPrefix(self.virtual_prefix));
        }
        if self.stop_timeout_ms == 0 {
            return Err(ConfigError::InvalidTimeout);
        }
        if self.default_proxy_port == 0 {
            return Err(ConfigError::InvalidPort(0));
        }
        Ok(())
    }
}

/// Configuration errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing proxy host")]
    MissingHost,

    #[error("Missing proxy port")]
    MissingPort,

    #[error("Invalid proxy port: {0}")]
    InvalidPort(i64),

    #[error("Invalid MTU: {0} (expected 576..=65535)")]
    InvalidMtu(u32),

    #[error("Invalid prefix length: {0}")]
    InvalidPrefix(u8),

    #[error("Stop timeout must be positive")]
    InvalidTimeout,

    #[error("Failed to parse settings: {0}")]
    Parse(String),

    #[error("Failed to read settings: {0}")]
    Io(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(host: Option<&str>, port: Option<i64>) -> CommandArgs {
        CommandArgs {
            proxy_host: host.map(String::from),
            proxy_port: port,
            ..Default::default()
        }
    }

    #[test]
    fn test_start_requires_host_and_port() {
        assert_eq!(
            args(None, Some(9099)).into_config(None),
            Err(ConfigError::MissingHost)
        );
        assert_eq!(
            args(Some("127.0.0.1"), None).into_config(None),
            Err(ConfigError::MissingPort)
        );
        assert_eq!(
            args(Some("  "), Some(9099)).into_config(None),
            Err(ConfigError::MissingHost)
        );
    }

    #[test]
    fn test_port_range() {
        assert_eq!(
            args(Some("127.0.0.1"), Some(70000)).into_config(None),
            Err(ConfigError::InvalidPort(70000))
        );
        assert_eq!(
            args(Some("127.0.0.1"), Some(-1)).into_config(None),
            Err(ConfigError::InvalidPort(-1))
        );
        let config = args(Some("127.0.0.1"), Some(65535)).into_config(None).unwrap();
        assert_eq!(config.proxy_port, 65535);
        assert!(config.enable_system_proxy);
    }

    #[test]
    fn test_restart_reuses_previous() {
        let previous = SessionConfig::new("192.168.1.10", 8888)
            .with_allowed_apps(["com.a"])
            .with_pass_through(["10.0.0.0/8"])
            .with_system_proxy(false);

        let config = CommandArgs::default().into_config(Some(&previous)).unwrap();
        assert_eq!(config.proxy_host, "192.168.1.10");
        assert_eq!(config.proxy_port, 8888);
        assert_eq!(config.allowed_apps, previous.allowed_apps);
        assert_eq!(config.pass_through_entries, vec!["10.0.0.0/8".to_string()]);
        // Not a persisted preference, defaults back on
        assert!(config.enable_system_proxy);

        let overridden = args(None, Some(9000)).into_config(Some(&previous)).unwrap();
        assert_eq!(overridden.proxy_host, "192.168.1.10");
        assert_eq!(overridden.proxy_port, 9000);
    }

    #[test]
    fn test_session_config_json() {
        let json = r#"{"proxyHost":"127.0.0.1","proxyPort":9099}"#;
        let config: SessionConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config, SessionConfig::new("127.0.0.1", 9099));
    }

    #[test]
    fn test_host_settings_defaults() {
        let settings = HostSettings::default();
        assert_eq!(settings.mtu, 1500);
        assert_eq!(settings.virtual_address, Ipv4Addr::new(10, 0, 0, 2));
        assert!(settings.validate().is_ok());

        let mut bare = CommandArgs::default();
        settings.apply_defaults(&mut bare);
        let config = bare.into_config(None).unwrap();
        assert_eq!(config.proxy_endpoint(), "127.0.0.1:9099");
    }

    #[test]
    fn test_host_settings_toml() {
        let settings = HostSettings::from_toml("mtu = 1400\nstop_timeout_ms = 250\n").unwrap();
        assert_eq!(settings.mtu, 1400);
        assert_eq!(settings.stop_timeout(), Duration::from_millis(250));
        assert_eq!(settings.default_proxy_port, 9099);

        let text = settings.to_toml().unwrap();
        assert_eq!(HostSettings::from_toml(&text).unwrap(), settings);

        assert_eq!(
            HostSettings::from_toml("mtu = 100"),
            Err(ConfigError::InvalidMtu(100))
        );
        assert!(matches!(
            HostSettings::from_toml("mtu = \"big\""),
            Err(ConfigError::Parse(_))
        ));
    }
}
