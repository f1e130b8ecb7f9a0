//! Configuration for the tether multiplayer layer.
//!
//! Settings persist to disk as a RON file. Every section is
//! `#[serde(default)]`, so older or partial files keep loading as the
//! format grows.

mod config;
mod error;

pub use config::{
    Config, DebugConfig, DirectConfig, MAX_PLAYER_NAME_LEN, NetworkConfig, PlatformKind,
    RelayConfig, default_config_dir,
};
pub use error::ConfigError;
