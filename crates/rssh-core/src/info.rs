//! Identity record for the info side channel
//!
//! After a reverse connection is tunneled, the agent announces who and
//! where it is on a dedicated side channel. The receiving end is
//! expected to *reject* that request after reading it, answering with
//! [`INFO_ACK_TOKEN`] — the rejection is the designed acknowledgment,
//! not an error.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Request prefix carrying the serialized record.
pub const INFO_REQUEST_PREFIX: &str = "rs-info ";

/// Token the receiving end sends back before rejecting the request.
pub const INFO_ACK_TOKEN: &str = "th4nkz";

/// Identity announced once per reverse connection. Transient — built,
/// serialized, sent, and never stored.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtraInfo {
    pub current_user: String,
    pub hostname: String,
    pub listening_address: String,
}

impl ExtraInfo {
    /// Collect the local identity for a freshly opened listener.
    pub fn collect(listening_address: String) -> Self {
        Self {
            current_user: whoami::username(),
            hostname: gethostname::gethostname().to_string_lossy().into_owned(),
            listening_address,
        }
    }

    /// Render as an info request payload.
    pub fn to_request(&self) -> String {
        // Serialization of a plain struct of strings cannot fail.
        format!(
            "{}{}",
            INFO_REQUEST_PREFIX,
            serde_json::to_string(self).expect("ExtraInfo is always serializable")
        )
    }

    /// Parse the payload of an info request, if it is one.
    pub fn from_request(data: &[u8]) -> Option<Self> {
        let text = std::str::from_utf8(data).ok()?;
        let json = text.strip_prefix(INFO_REQUEST_PREFIX)?;
        serde_json::from_str(json).ok()
    }
}

impl fmt::Display for ExtraInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} on {} reachable via {}",
            self.current_user, self.hostname, self.listening_address
        )
    }
}
