//! Configuration structs with sensible defaults and RON persistence.

use std::net::IpAddr;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

const APP_NAME: &str = "tether";
const CONFIG_FILE: &str = "config.ron";

/// Longest display name a host accepts in the join handshake.
pub const MAX_PLAYER_NAME_LEN: usize = 64;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Multiplayer transport and session settings.
    pub network: NetworkConfig,
    /// Debug/development settings.
    pub debug: DebugConfig,
}

/// Which transport carries session traffic for this process.
///
/// Exactly one is active at a time. Switching requires leaving the current
/// session first.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum PlatformKind {
    /// Raw TCP socket to a host address.
    #[default]
    Direct,
    /// Connection-oriented relay (handles, listen sockets, status callbacks).
    SocketsRelay,
    /// Packet-oriented relay (socket names, channels, connection requests).
    PacketsRelay,
}

/// Network/multiplayer configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct NetworkConfig {
    /// Active transport.
    pub platform: PlatformKind,
    /// Display name announced to the host when joining.
    pub player_name: String,
    /// Raw-socket transport settings.
    pub direct: DirectConfig,
    /// Settings shared by both relay transports.
    pub relay: RelayConfig,
}

/// Raw-socket transport configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DirectConfig {
    /// Address the host listens on.
    pub bind_address: String,
    /// Address advertised in the lobby id so others can join.
    pub advertise_address: String,
    /// TCP port.
    pub port: u16,
    /// Maximum simultaneous client connections accepted by the host.
    pub max_connections: usize,
    /// Capacity of the queue between socket tasks and the game tick.
    pub inbound_queue: usize,
}

/// Relay transport configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RelayConfig {
    /// Messages drained per peer per tick.
    pub max_messages_per_tick: usize,
    /// Virtual port for the connection-oriented relay.
    pub virtual_port: u16,
    /// Socket name for the packet-oriented relay.
    pub socket_name: String,
    /// Lobby capacity requested when hosting.
    pub max_lobby_members: usize,
    /// Queued connection-lifecycle events past which a backlog warning is logged.
    pub event_queue_capacity: usize,
}

/// Debug/development configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DebugConfig {
    /// Log level override (e.g., "debug", "info", "warn").
    pub log_level: String,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            platform: PlatformKind::Direct,
            player_name: "Player".to_string(),
            direct: DirectConfig::default(),
            relay: RelayConfig::default(),
        }
    }
}

impl Default for DirectConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            advertise_address: "127.0.0.1".to_string(),
            port: 11000,
            max_connections: 16,
            inbound_queue: 1024,
        }
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            max_messages_per_tick: 128,
            virtual_port: 0,
            socket_name: "TETHER".to_string(),
            max_lobby_members: 4,
            event_queue_capacity: 256,
        }
    }
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

/// Platform-specific directory holding `config.ron`.
pub fn default_config_dir() -> Result<PathBuf, ConfigError> {
    let base = dirs::config_dir().ok_or(ConfigError::NoConfigDir)?;
    Ok(base.join(APP_NAME))
}

// --- Load / Save / Reload ---

impl Config {
    /// Load config from the given directory, or create a default config file.
    pub fn load_or_create(config_dir: &Path) -> Result<Self, ConfigError> {
        let config_path = config_dir.join(CONFIG_FILE);

        if config_path.exists() {
            let config = Self::read(&config_path)?;
            log::info!("Loaded config from {}", config_path.display());
            Ok(config)
        } else {
            let config = Config::default();
            config.save(config_dir)?;
            log::info!("Created default config at {}", config_path.display());
            Ok(config)
        }
    }

    /// Save config to the given directory as `config.ron`.
    pub fn save(&self, config_dir: &Path) -> Result<(), ConfigError> {
        std::fs::create_dir_all(config_dir).map_err(|source| ConfigError::Write {
            path: config_dir.to_path_buf(),
            source,
        })?;

        let config_path = config_dir.join(CONFIG_FILE);
        let pretty = ron::ser::PrettyConfig::new()
            .depth_limit(3)
            .enumerate_arrays(false);

        let serialized = ron::ser::to_string_pretty(self, pretty).map_err(ConfigError::Encode)?;

        std::fs::write(&config_path, serialized).map_err(|source| ConfigError::Write {
            path: config_path.clone(),
            source,
        })?;
        Ok(())
    }

    /// Hot-reload: returns `Some(new_config)` if the file changed, `None` otherwise.
    pub fn reload(&self, config_dir: &Path) -> Result<Option<Self>, ConfigError> {
        let new_config = Self::read(&config_dir.join(CONFIG_FILE))?;

        if &new_config != self {
            log::info!("Config reloaded with changes");
            Ok(Some(new_config))
        } else {
            Ok(None)
        }
    }

    fn read(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Config = ron::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values that parse but cannot work: a name the host would
    /// refuse, unparsable socket addresses, or an empty relay socket name.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let name = &self.network.player_name;
        if name.trim().is_empty() {
            return Err(invalid("network.player_name", "must not be blank"));
        }
        if name.chars().count() > MAX_PLAYER_NAME_LEN {
            return Err(invalid(
                "network.player_name",
                format!("longer than {MAX_PLAYER_NAME_LEN} characters"),
            ));
        }

        let direct = &self.network.direct;
        for (field, address) in [
            ("network.direct.bind_address", &direct.bind_address),
            ("network.direct.advertise_address", &direct.advertise_address),
        ] {
            if address.parse::<IpAddr>().is_err() {
                return Err(invalid(field, format!("{address:?} is not an IP address")));
            }
        }
        if direct.max_connections == 0 {
            return Err(invalid("network.direct.max_connections", "must be at least 1"));
        }

        if self.network.relay.socket_name.is_empty() {
            return Err(invalid("network.relay.socket_name", "must not be empty"));
        }
        Ok(())
    }
}

fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        field,
        reason: reason.into(),
    }
}
