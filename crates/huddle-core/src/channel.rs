//! Per-peer data channel transport.
//!
//! Wraps the two data channels of an established session:
//!
//! - `control`: ordered and reliable, JSON [`ControlMessage`]s
//! - `file-transfer`: unordered, binary [`TransferFrame`]s
//!
//! Every send first waits until the channel's buffered amount is at or
//! below the high-water mark, polling at a short interval. A channel that
//! is not open fails the send with [`ChannelError::NotOpen`].

use crate::config::ChannelConfig;
use crate::control::ControlMessage;
use crate::error::ChannelError;
use crate::frame::TransferFrame;
use crate::link::{ChannelState, DataChannel, PeerId};
use std::fmt;
use std::sync::Arc;
use tokio::time;

/// Data channels of one connected peer
#[derive(Clone)]
pub struct DataChannelTransport {
    peer_id: PeerId,
    control: Arc<dyn DataChannel>,
    transfer: Arc<dyn DataChannel>,
    config: ChannelConfig,
}

impl DataChannelTransport {
    /// Wrap a session's channels
    pub fn new(
        peer_id: impl Into<PeerId>,
        control: Arc<dyn DataChannel>,
        transfer: Arc<dyn DataChannel>,
        config: ChannelConfig,
    ) -> Self {
        Self {
            peer_id: peer_id.into(),
            control,
            transfer,
            config,
        }
    }

    /// Remote peer
    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    /// Whether both channels are open
    pub fn is_open(&self) -> bool {
        self.control.ready_state() == ChannelState::Open
            && self.transfer.ready_state() == ChannelState::Open
    }

    /// Send a control message
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::NotOpen`] if the control channel is not open.
    pub async fn send_control(&self, message: &ControlMessage) -> Result<(), ChannelError> {
        let bytes = message
            .to_bytes()
            .map_err(|e| ChannelError::Encode(e.to_string()))?;
        self.send_on(&self.control, bytes).await
    }

    /// Send a transfer frame
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::NotOpen`] if the transfer channel is not open.
    pub async fn send_frame(&self, frame: &TransferFrame) -> Result<(), ChannelError> {
        self.send_on(&self.transfer, frame.encode()).await
    }

    async fn send_on(&self, channel: &Arc<dyn DataChannel>, data: Vec<u8>) -> Result<(), ChannelError> {
        wait_for_capacity(channel.as_ref(), &self.config).await?;
        channel.send(data).await
    }
}

impl fmt::Debug for DataChannelTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataChannelTransport")
            .field("peer_id", &self.peer_id)
            .field("open", &self.is_open())
            .finish()
    }
}

/// Wait until `channel` may accept another message
///
/// # Errors
///
/// Returns [`ChannelError::NotOpen`] as soon as the channel leaves the open
/// state, including while waiting for the buffer to drain.
pub async fn wait_for_capacity(
    channel: &dyn DataChannel,
    config: &ChannelConfig,
) -> Result<(), ChannelError> {
    loop {
        if channel.ready_state() != ChannelState::Open {
            return Err(ChannelError::NotOpen(channel.label().to_string()));
        }
        if channel.buffered_amount() <= config.high_water_mark {
            return Ok(());
        }
        time::sleep(config.drain_poll_interval).await;
    }
}
