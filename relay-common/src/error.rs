//! Error types for the WeCom relay.

use thiserror::Error;

/// Result type alias using the relay error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Process-level error type shared across the workspace.
///
/// Module-local failures (crypto, frame codec, WeCom API) carry their own
/// `thiserror` enums; this type covers configuration and the listener
/// lifecycle, where startup failures are fatal.
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error (fatal at startup)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Listener or socket failure from the server lifecycle
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
