//! Platform-agnostic protocol model for peerlink.
//!
//! Nothing in this crate performs I/O. It defines what goes over the wire,
//! how reconnect delays grow, and what events the client publishes.

pub mod backoff;
pub mod envelope;
pub mod frame;
pub mod signal;
pub mod types;

pub use backoff::Backoff;
pub use envelope::{EnvelopeError, SignalEnvelope};
pub use signal::{ModifyAction, SignalType, Target};
