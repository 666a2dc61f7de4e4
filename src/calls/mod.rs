//! Call and direct-connection sessions.
//!
//! # Architecture
//!
//! - [`CallStateMachine`]: pure hierarchical state machine, one per session
//! - [`PeerNegotiator`]: offer/answer, candidate queues and the `modify`
//!   renegotiation sub-protocol over a [`PeerLink`]
//! - [`Call`]: handle to the task that owns both and drives timers, media
//!   acquisition and teardown
//!
//! Sessions reach the remote party through a [`SignalingChannel`], which the
//! client implements over its persistent transport.

mod call;
mod candidates;
mod direct;
mod error;
mod media;
mod negotiator;
mod signaling;
mod state;

#[cfg(test)]
pub(crate) mod test_support;

pub use call::{
    AnswerOptions, Call, CallContext, CallOptions, CallSnapshot, IncomingSessionHandler, Outcome,
};
pub use candidates::CandidateQueue;
pub use direct::{DirectChannel, DirectChannelState};
pub use error::{CallError, NegotiationError};
pub use media::{LinkEvent, MediaError, MediaHandle, MediaSource, PeerLink, PeerLinkFactory};
pub use negotiator::{CandidateFilter, ModifyOutcome, ModifyRequest, PeerNegotiator};
pub use signaling::SignalingChannel;
pub use state::{
    AnsweringState, CallState, CallStateMachine, GuardInput, InvalidTransition, NegotiatingState,
    StateAction, StateEvent, TimerKind, Transition,
};
