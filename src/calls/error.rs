//! Call-related error types.

use super::media::MediaError;
use crate::request::RequestError;
use peerlink_core::Target;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CallError {
    /// The session already ended; carries the hangup reason.
    #[error("session already terminated: {0}")]
    Terminated(String),

    #[error("invalid call state transition: {0}")]
    InvalidTransition(#[from] super::state::InvalidTransition),

    #[error(transparent)]
    Negotiation(#[from] NegotiationError),

    #[error("media error: {0}")]
    Media(#[from] MediaError),

    #[error("signaling failed: {0}")]
    Signaling(#[from] RequestError),

    #[error("no handler accepts incoming {0}")]
    NoHandler(Target),

    #[error("direct connection is not open")]
    DirectConnectionClosed,

    #[error("not connected")]
    NotConnected,
}

/// Failures of the offer/answer and renegotiation exchange.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum NegotiationError {
    /// A local renegotiation was requested while another one is pending.
    #[error("renegotiation rejected: negotiating state")]
    ModifyPending,

    /// The remote side started a renegotiation while ours was pending.
    #[error("Got modify in a negotiating state.")]
    ModifyCollision,

    #[error("renegotiation rejected: no session description exchanged yet")]
    ModifyPrecall,

    /// The remote party answered `modify` with `reject`.
    #[error("renegotiation declined by remote party")]
    Declined,

    #[error("renegotiation timed out")]
    ModifyTimedOut,

    #[error("could not create local description: {0}")]
    LocalDescription(String),

    #[error("could not apply remote description: {0}")]
    RemoteDescription(String),

    #[error("peer link is not initialized")]
    NoPeerLink,
}
