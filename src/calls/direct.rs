//! Data-channel ("direct connection") layered on a session's peer link.

use super::error::CallError;
use super::media::PeerLink;
use log::debug;

pub const DEFAULT_LABEL: &str = "peerlink";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DirectChannelState {
    /// Created, waiting for the peer link to report the channel open.
    #[default]
    Pending,
    Open,
    Closed,
}

#[derive(Debug)]
pub struct DirectChannel {
    label: String,
    state: DirectChannelState,
}

impl Default for DirectChannel {
    fn default() -> Self {
        Self::new(DEFAULT_LABEL)
    }
}

impl DirectChannel {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            state: DirectChannelState::Pending,
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn state(&self) -> DirectChannelState {
        self.state
    }

    pub fn is_open(&self) -> bool {
        self.state == DirectChannelState::Open
    }

    /// The caller side creates the channel; the callee learns about it when
    /// the link reports it open.
    pub fn create_on(&self, link: &mut dyn PeerLink) -> Result<(), CallError> {
        link.create_data_channel(&self.label)?;
        Ok(())
    }

    /// Returns false if the channel was already closed.
    pub fn mark_open(&mut self) -> bool {
        if self.state == DirectChannelState::Closed {
            return false;
        }
        self.state = DirectChannelState::Open;
        true
    }

    /// Returns whether the state changed.
    pub fn mark_closed(&mut self) -> bool {
        let changed = self.state != DirectChannelState::Closed;
        self.state = DirectChannelState::Closed;
        changed
    }

    pub async fn send(&self, link: &mut dyn PeerLink, message: &str) -> Result<(), CallError> {
        if !self.is_open() {
            return Err(CallError::DirectConnectionClosed);
        }
        link.send_data(message).await?;
        Ok(())
    }

    /// Close the channel on the link. Returns whether it was still live.
    pub fn close(&mut self, link: Option<&mut dyn PeerLink>) -> bool {
        if !self.mark_closed() {
            return false;
        }
        debug!(target: "Call/Direct", "Closing data channel {}", self.label);
        if let Some(link) = link {
            link.close_data_channel();
        }
        true
    }
}
