//! Server configuration, loaded from a TOML file.
//!
//! Every section and option has a default. Socket listeners offer STARTTLS
//! only, so they also need certificate settings for every host.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Deserializer};

use crate::auth::Mechanism;
use crate::error::ConfigError;

/// Default stream mailbox depth.
pub const DEFAULT_MAILBOX_SIZE: usize = 64;

fn de_secs<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
    Ok(Duration::from_secs(u64::deserialize(d)?))
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub logger: LoggerConfig,
    pub hosts: Vec<HostConfig>,
    pub storage: StorageConfig,
    pub cache: CacheConfig,
    pub modules: ModulesConfig,
    pub c2s: Vec<C2sConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            logger: LoggerConfig::default(),
            hosts: vec![HostConfig {
                name: "localhost".to_string(),
                tls: None,
            }],
            storage: StorageConfig::default(),
            cache: CacheConfig::default(),
            modules: ModulesConfig::default(),
            c2s: vec![C2sConfig::default()],
        }
    }
}

impl Config {
    /// Reads, parses and validates the file at `path`.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&text)
    }

    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.hosts.is_empty() {
            return Err(ConfigError::Invalid("at least one host is required".to_string()));
        }
        let mut names = HashSet::new();
        for host in &self.hosts {
            if host.name.is_empty() {
                return Err(ConfigError::Invalid("host name cannot be empty".to_string()));
            }
            if !names.insert(host.name.as_str()) {
                return Err(ConfigError::Invalid(format!("duplicated host {}", host.name)));
            }
        }
        if self.c2s.is_empty() {
            return Err(ConfigError::Invalid("at least one c2s listener is required".to_string()));
        }
        let mut ids = HashSet::new();
        for c2s in &self.c2s {
            if !ids.insert(c2s.id.as_str()) {
                return Err(ConfigError::Invalid(format!("duplicated c2s id {}", c2s.id)));
            }
            if c2s.sasl.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "c2s {}: no sasl mechanism enabled",
                    c2s.id
                )));
            }
            if c2s.mailbox_size == 0 {
                return Err(ConfigError::Invalid(format!(
                    "c2s {}: mailbox_size must be positive",
                    c2s.id
                )));
            }
            match c2s.transport.kind {
                TransportKind::Socket => {
                    if let Some(host) = self.hosts.iter().find(|h| h.tls.is_none()) {
                        return Err(ConfigError::Invalid(format!(
                            "c2s {}: socket transport requires tls settings for host {}",
                            c2s.id, host.name
                        )));
                    }
                }
                TransportKind::Websocket => {
                    if c2s.transport.tls && self.hosts.iter().all(|h| h.tls.is_none()) {
                        return Err(ConfigError::Invalid(format!(
                            "c2s {}: wss requires tls settings for at least one host",
                            c2s.id
                        )));
                    }
                }
            }
        }
        if self.modules.ping.send_pings
            && (self.modules.ping.interval.is_zero() || self.modules.ping.ack_timeout.is_zero())
        {
            return Err(ConfigError::Invalid(
                "ping interval and ack_timeout must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggerConfig {
    /// `EnvFilter` directive; `RUST_LOG` takes precedence.
    pub level: String,
    /// Directory for the daily-rotated log file.
    pub log_path: Option<PathBuf>,
}

impl Default for LoggerConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            log_path: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct HostConfig {
    pub name: String,
    #[serde(default)]
    pub tls: Option<TlsConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TlsConfig {
    pub cert_path: PathBuf,
    pub privkey_path: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageKind {
    #[default]
    Memory,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    #[serde(rename = "type")]
    pub kind: StorageKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheKind {
    #[default]
    Memory,
    None,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    #[serde(rename = "type")]
    pub kind: CacheKind,
    #[serde(deserialize_with = "de_secs")]
    pub ttl: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            kind: CacheKind::Memory,
            ttl: Duration::from_secs(86400),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModuleName {
    Roster,
    Offline,
    Registration,
    Version,
    Ping,
    LastActivity,
    Private,
    Vcard,
    BlockingCommand,
    Disco,
    Caps,
}

impl ModuleName {
    pub const ALL: [ModuleName; 11] = [
        ModuleName::Roster,
        ModuleName::Offline,
        ModuleName::Registration,
        ModuleName::Version,
        ModuleName::Ping,
        ModuleName::LastActivity,
        ModuleName::Private,
        ModuleName::Vcard,
        ModuleName::BlockingCommand,
        ModuleName::Disco,
        ModuleName::Caps,
    ];
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ModulesConfig {
    pub enabled: Vec<ModuleName>,
    pub roster: RosterConfig,
    pub offline: OfflineConfig,
    pub registration: RegistrationConfig,
    pub version: VersionConfig,
    pub ping: PingConfig,
}

impl Default for ModulesConfig {
    fn default() -> Self {
        Self {
            enabled: ModuleName::ALL.to_vec(),
            roster: RosterConfig::default(),
            offline: OfflineConfig::default(),
            registration: RegistrationConfig::default(),
            version: VersionConfig::default(),
            ping: PingConfig::default(),
        }
    }
}

impl ModulesConfig {
    pub fn is_enabled(&self, name: ModuleName) -> bool {
        self.enabled.contains(&name)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RosterConfig {
    pub versioning: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OfflineConfig {
    pub queue_size: usize,
}

impl Default for OfflineConfig {
    fn default() -> Self {
        Self { queue_size: 2500 }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RegistrationConfig {
    pub allow_registration: bool,
    pub allow_change: bool,
    pub allow_cancel: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct VersionConfig {
    pub show_os: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeoutAction {
    #[default]
    Kill,
    #[serde(rename = "")]
    None,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PingConfig {
    pub send_pings: bool,
    #[serde(deserialize_with = "de_secs")]
    pub interval: Duration,
    #[serde(deserialize_with = "de_secs")]
    pub ack_timeout: Duration,
    pub timeout_action: TimeoutAction,
}

impl Default for PingConfig {
    fn default() -> Self {
        Self {
            send_pings: false,
            interval: Duration::from_secs(60),
            ack_timeout: Duration::from_secs(10),
            timeout_action: TimeoutAction::Kill,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceConflict {
    Override,
    #[default]
    Replace,
    Reject,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompressionLevel {
    #[default]
    Default,
    Best,
    Speed,
}

impl CompressionLevel {
    pub fn to_flate2(self) -> flate2::Compression {
        match self {
            CompressionLevel::Default => flate2::Compression::default(),
            CompressionLevel::Best => flate2::Compression::best(),
            CompressionLevel::Speed => flate2::Compression::fast(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct CompressionConfig {
    pub level: CompressionLevel,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct C2sConfig {
    pub id: String,
    pub resource_conflict: ResourceConflict,
    pub sasl: Vec<Mechanism>,
    pub compression: Option<CompressionConfig>,
    pub mailbox_size: usize,
    pub transport: TransportConfig,
}

impl Default for C2sConfig {
    fn default() -> Self {
        Self {
            id: "default".to_string(),
            resource_conflict: ResourceConflict::default(),
            sasl: Mechanism::ALL.to_vec(),
            compression: None,
            mailbox_size: DEFAULT_MAILBOX_SIZE,
            transport: TransportConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    #[default]
    Socket,
    Websocket,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    #[serde(rename = "type")]
    pub kind: TransportKind,
    pub bind_addr: String,
    pub port: u16,
    #[serde(deserialize_with = "de_secs")]
    pub connect_timeout: Duration,
    #[serde(deserialize_with = "de_secs")]
    pub keep_alive: Duration,
    pub max_stanza_size: usize,
    /// Serve `wss://`. Only meaningful for WebSocket listeners.
    pub tls: bool,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            kind: TransportKind::Socket,
            bind_addr: "0.0.0.0".to_string(),
            port: 5222,
            connect_timeout: Duration::from_secs(5),
            keep_alive: Duration::from_secs(120),
            max_stanza_size: 32768,
            tls: false,
        }
    }
}
