//! Handshake error types

use thiserror::Error;

/// Errors from parsing collector options
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    /// Option name not recognised
    #[error("unknown GC option: {0}")]
    UnknownOption(String),

    /// Option value could not be parsed or is out of range
    #[error("invalid value `{value}` for GC option `{name}`: {reason}")]
    InvalidValue {
        /// Option name
        name: String,
        /// Rejected value
        value: String,
        /// Why it was rejected
        reason: &'static str,
    },

    /// `name=value` pair without the `=`
    #[error("malformed GC option `{0}`, expected name=value")]
    Malformed(String),
}

/// Errors surfaced by the process-wide handshake instance
#[derive(Debug, Error)]
pub enum HandshakeError {
    /// `init` called twice
    #[error("GC handshake already initialized")]
    AlreadyInitialized,

    /// Bad configuration
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Side-metadata bitmap handed to the handshake does not fit the
    /// configured heap
    #[error("side metadata does not match the configured heap: {0}")]
    MetadataMismatch(&'static str),
}
