//! Per-deployment policy gate
//!
//! Pure predicates consulted by the transport layer before a session,
//! local-forward or reverse-forward request is granted. Each predicate
//! reads only the static deny flag captured at construction; the only
//! side effect is the grant/deny log line.

/// Kinds of session requests the gate can be asked about
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionRequest {
    Shell,
    Exec,
    Subsystem,
}

impl SessionRequest {
    fn as_str(&self) -> &'static str {
        match self {
            SessionRequest::Shell => "shell",
            SessionRequest::Exec => "exec",
            SessionRequest::Subsystem => "subsystem",
        }
    }
}

/// Capability table built once from configuration
#[derive(Debug, Clone)]
pub struct Policy {
    deny_exec: bool,
}

impl Policy {
    pub fn new(deny_exec: bool) -> Self {
        Self { deny_exec }
    }

    /// Gate shell/exec/subsystem requests
    pub fn allow_session(&self, request: SessionRequest) -> bool {
        if self.deny_exec {
            tracing::warn!("Denying {} request", request.as_str());
            return false;
        }
        true
    }

    /// Gate direct-tcpip (local port forwarding) requests
    pub fn allow_local_forward(&self, host: &str, port: u32) -> bool {
        if self.deny_exec {
            tracing::warn!("Denying local port forwarding request {}:{}", host, port);
            return false;
        }
        tracing::info!("Accepted forward to {}:{}", host, port);
        true
    }

    /// Gate tcpip-forward (reverse port forwarding) requests.
    ///
    /// Always granted: a listen-mode instance must be able to catch
    /// reverse connections even when everything else is denied.
    pub fn allow_remote_forward(&self, host: &str, port: u32) -> bool {
        tracing::info!("Attempt to bind at {}:{} granted", host, port);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_policy_allows_everything() {
        let policy = Policy::new(false);
        assert!(policy.allow_session(SessionRequest::Shell));
        assert!(policy.allow_session(SessionRequest::Exec));
        assert!(policy.allow_local_forward("127.0.0.1", 8080));
        assert!(policy.allow_remote_forward("127.0.0.1", 8888));
    }

    #[test]
    fn test_deny_flag_blocks_sessions_and_local_forwards() {
        let policy = Policy::new(true);
        assert!(!policy.allow_session(SessionRequest::Shell));
        assert!(!policy.allow_session(SessionRequest::Exec));
        assert!(!policy.allow_session(SessionRequest::Subsystem));
        assert!(!policy.allow_local_forward("127.0.0.1", 8080));
    }

    #[test]
    fn test_remote_forward_always_granted() {
        let policy = Policy::new(true);
        assert!(policy.allow_remote_forward("0.0.0.0", 0));
    }
}
