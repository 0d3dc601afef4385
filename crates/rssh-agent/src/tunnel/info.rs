//! Info side channel (sending end)
//!
//! One-shot, fire-and-forget: open a dedicated channel on the reverse
//! connection, send the serialized identity record, and wait for the
//! peer's rejection. A rejection preceded by the ack token is the
//! designed success signal; anything else is logged and ignored — the
//! tunnel stays usable either way.

use std::time::Duration;

use russh::client;
use russh::ChannelMsg;

use rssh_core::info::{ExtraInfo, INFO_ACK_TOKEN};

use super::ReverseHandler;

/// How long to wait for the peer's acknowledgment before giving up.
const INFO_ACK_TIMEOUT: Duration = Duration::from_secs(5);

/// Announce the agent's identity to the controller.
pub async fn send_extra_info(session: &client::Handle<ReverseHandler>, info: ExtraInfo) {
    let outcome = tokio::time::timeout(INFO_ACK_TIMEOUT, exchange(session, &info)).await;
    match outcome {
        Ok(Ok(())) => tracing::debug!("Info channel acknowledged"),
        Ok(Err(err)) => tracing::warn!("Could not create info channel: {:#}", err),
        Err(_) => tracing::warn!("Info channel timed out waiting for acknowledgment"),
    }
}

async fn exchange(
    session: &client::Handle<ReverseHandler>,
    info: &ExtraInfo,
) -> anyhow::Result<()> {
    let mut channel = session.channel_open_session().await?;
    channel.exec(true, info.to_request()).await?;

    let mut acked = Vec::new();
    loop {
        match channel.wait().await {
            Some(ChannelMsg::Data { data }) => acked.extend_from_slice(&data),
            Some(ChannelMsg::Failure) => {
                // The expected outcome: the peer read the record and
                // rejected the request, sending the token first.
                if acked == INFO_ACK_TOKEN.as_bytes() {
                    return Ok(());
                }
                anyhow::bail!("info request rejected without ack token");
            }
            Some(ChannelMsg::Success) => {
                // Unexpectedly accepted; close and move on.
                tracing::debug!("Info channel unexpectedly accepted, closing");
                channel.close().await?;
                return Ok(());
            }
            Some(ChannelMsg::Eof) | Some(ChannelMsg::Close) | None => {
                anyhow::bail!("info channel closed without acknowledgment");
            }
            Some(_) => {}
        }
    }
}
