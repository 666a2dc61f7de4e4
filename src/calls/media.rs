//! Media layer seam.
//!
//! peerlink does not capture devices or run a WebRTC stack. Applications
//! plug those in through [`MediaSource`] (device access) and
//! [`PeerLinkFactory`] / [`PeerLink`] (the peer connection for one session).

use async_trait::async_trait;
use peerlink_core::envelope::{DescriptionKind, IceCandidate, SessionDescription};
use peerlink_core::types::media::{MediaConstraints, MediaKind};
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum MediaError {
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("device unavailable: {0}")]
    Unavailable(String),
    #[error("media engine error: {0}")]
    Engine(String),
}

/// Local tracks produced by a [`MediaSource`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaHandle {
    pub id: String,
    pub audio: bool,
    pub video: bool,
}

/// Events a peer link reports back to its session.
#[derive(Debug, Clone, PartialEq)]
pub enum LinkEvent {
    LocalCandidate(IceCandidate),
    RemoteMediaAdded,
    RemoteMediaRemoved,
    DataChannelOpen,
    DataChannelClosed,
    DataChannelMessage(String),
    DataChannelError(String),
}

#[async_trait]
pub trait MediaSource: Send + Sync {
    /// Acquire local tracks. May wait on a user permission prompt.
    async fn acquire_media(&self, constraints: &MediaConstraints)
    -> Result<MediaHandle, MediaError>;

    /// Stop tracks acquired earlier.
    fn release(&self, _handle: &MediaHandle) {}
}

/// One peer connection, exclusively owned by the session's negotiator.
#[async_trait]
pub trait PeerLink: Send + Sync {
    /// Restrict media direction before the first description is created.
    fn set_direction(&mut self, _send: bool, _receive: bool) {}

    async fn create_local_description(
        &mut self,
        kind: DescriptionKind,
    ) -> Result<SessionDescription, MediaError>;

    async fn apply_local_description(
        &mut self,
        description: &SessionDescription,
    ) -> Result<(), MediaError>;

    async fn apply_remote_description(
        &mut self,
        description: &SessionDescription,
    ) -> Result<(), MediaError>;

    async fn add_remote_candidate(&mut self, candidate: &IceCandidate) -> Result<(), MediaError>;

    fn add_local_media(&mut self, media: &MediaHandle);

    fn create_data_channel(&mut self, label: &str) -> Result<(), MediaError>;

    async fn send_data(&mut self, message: &str) -> Result<(), MediaError>;

    fn close_data_channel(&mut self);

    fn set_muted(&mut self, kind: MediaKind, muted: bool);

    fn has_remote_media(&self) -> bool;

    fn is_active(&self) -> bool;

    fn close(&mut self);
}

pub trait PeerLinkFactory: Send + Sync {
    /// Create the peer link for `session_id`. Locally gathered candidates and
    /// remote media/data-channel changes must be reported on `events`.
    fn create(
        &self,
        session_id: &str,
        events: mpsc::UnboundedSender<LinkEvent>,
    ) -> Box<dyn PeerLink>;
}
