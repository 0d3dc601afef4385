//! Configuration error types

use thiserror::Error;

/// Errors raised while assembling the agent configuration
#[derive(Error, Debug)]
pub enum ConfigError {
    /// The reverse target could not be parsed as `[user@]host`
    #[error("Could not parse '{0}': expected [user@]host")]
    InvalidTarget(String),

    /// The reverse target has an empty host part
    #[error("Target '{0}' has an empty host")]
    EmptyHost(String),
}
