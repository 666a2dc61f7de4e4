//! Outbound signaling seam between sessions and the dispatcher.

use crate::request::RequestError;
use async_trait::async_trait;
use peerlink_core::SignalEnvelope;

/// How a session reaches the remote party.
///
/// The client implements this over its persistent transport. Sessions only
/// hold this handle, never the client itself.
#[async_trait]
pub trait SignalingChannel: Send + Sync {
    /// Send one envelope and wait for the server to accept it.
    async fn send_signal(&self, envelope: SignalEnvelope) -> Result<(), RequestError>;

    /// Our own connection id, once registered.
    fn connection_id(&self) -> Option<String>;

    /// Our own endpoint id, once registered.
    fn endpoint_id(&self) -> Option<String>;
}
