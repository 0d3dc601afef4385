//! rssh-agent: dual-role remote-access agent
//!
//! The agent either binds a local listener or dials out to a
//! controller, requests a listener there, and serves incoming ssh
//! sessions through the resulting tunnel. Either way every session
//! ends up in the same server handler, which dispatches it to an
//! interactive PTY, a one-shot command, or a forwarding-only hold.

pub mod listener;
pub mod pty;
pub mod server;
pub mod tunnel;

pub use listener::RemoteListener;
pub use server::AgentServer;
