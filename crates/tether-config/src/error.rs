//! Errors from reading, writing and checking `config.ron`.

use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// `config.ron` exists but could not be read.
    #[error("cannot read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The config directory or file could not be written.
    #[error("cannot write {}: {source}", path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The file is not RON, or does not match the settings layout.
    #[error("{} is not a valid tether config: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: ron::error::SpannedError,
    },

    #[error("cannot encode settings as RON: {0}")]
    Encode(#[source] ron::Error),

    /// Parsed fine, but a value would break hosting or joining.
    #[error("invalid setting `{field}`: {reason}")]
    Invalid { field: &'static str, reason: String },

    /// The OS does not expose a per-user configuration directory.
    #[error("no configuration directory available on this platform")]
    NoConfigDir,
}
