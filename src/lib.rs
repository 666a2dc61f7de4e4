pub use peerlink_core::{envelope, frame, signal};

pub mod types {
    pub use peerlink_core::types::*;
}

pub mod calls;
pub mod client;
pub mod config;
pub mod groups;
pub mod handshake;
pub mod keepalive;
pub mod request;
pub mod router;
pub mod transport;

pub use calls::{AnswerOptions, Call, CallError, CallOptions, IncomingSessionHandler};
pub use client::{Client, ClientError};
pub use config::{CallConfig, ClientConfig};
pub use peerlink_core::{SignalEnvelope, SignalType, Target};
