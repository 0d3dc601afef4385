//! rssh-core: Shared abstractions for the rssh agent
//!
//! This crate provides the immutable agent configuration, the
//! `[user@]host` target parser, the per-deployment policy gate,
//! credential verification helpers and the identity record sent
//! over the info side channel.

pub mod auth;
pub mod config;
pub mod error;
pub mod info;
pub mod policy;

pub use config::{AgentConfig, Mode, Target};
pub use error::ConfigError;
pub use info::ExtraInfo;
pub use policy::Policy;
