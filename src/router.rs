//! Inbound frame dispatch.
//!
//! Responses go to the request waiting for them. Signals are resolved to the
//! session they belong to, in arrival order: a signal is handed to its
//! session before the next frame is read.

use crate::calls::Call;
use crate::client::Client;
use log::{debug, info, warn};
use peerlink_core::frame::Frame;
use peerlink_core::{SignalEnvelope, SignalType};
use serde_json::Value;
use std::sync::Arc;

impl Client {
    pub(crate) async fn handle_frame(self: &Arc<Self>, text: &str) {
        let frame = match Frame::from_json(text) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(target: "Client/Router", "Dropping unparsable frame: {e}");
                return;
            }
        };

        match frame {
            Frame::Response { id, status, body } => {
                if !self.handle_response(&id, status, body).await {
                    debug!(target: "Client/Router", "No pending request for response {id}");
                }
            }
            Frame::Signal { body } => self.handle_signal(body),
            Frame::Request { id, path, .. } => {
                warn!(target: "Client/Router", "Ignoring server-initiated request {id} for {path}");
            }
        }
    }

    fn handle_signal(&self, body: Value) {
        let envelope = match SignalEnvelope::from_value(body) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(target: "Client/Router", "Dropping malformed signal: {e}");
                return;
            }
        };
        self.route_signal(envelope);
    }

    pub(crate) fn route_signal(&self, envelope: SignalEnvelope) {
        if envelope.signal_type == SignalType::Ack {
            return;
        }

        let existing = self
            .sessions
            .get(&envelope.session_id)
            .map(|entry| entry.value().clone());

        match existing {
            Some(call) => self.deliver_to(&call, envelope),
            None if envelope.signal_type.is_initiating() => self.accept_offer(envelope),
            None => {
                warn!(
                    target: "Client/Router",
                    "Dropping orphaned {:?} for unknown session {}",
                    envelope.signal_type, envelope.session_id
                );
            }
        }
    }

    fn deliver_to(&self, call: &Call, envelope: SignalEnvelope) {
        // Another connection of the remote endpoint hanging up is not our concern.
        if envelope.signal_type == SignalType::Hangup
            && let (Some(ours), Some(theirs)) =
                (call.connection_id(), envelope.from_connection.as_deref())
            && ours != theirs
        {
            debug!(
                target: "Client/Router",
                "Ignoring hangup for session {} from foreign connection {theirs}",
                envelope.session_id
            );
            return;
        }

        if !call.deliver(envelope) {
            debug!(target: "Client/Router", "Session {} already ended", call.session_id());
            self.sessions.remove(call.session_id());
        }
    }

    fn accept_offer(&self, envelope: SignalEnvelope) {
        let Some(remote_endpoint) = envelope.from_endpoint.clone() else {
            warn!(
                target: "Client/Router",
                "Dropping offer for session {} without a sender endpoint",
                envelope.session_id
            );
            return;
        };
        info!(
            target: "Client/Router",
            "Incoming {:?} session {} from {remote_endpoint}",
            envelope.target, envelope.session_id
        );
        let call = Call::incoming(self.call_context(), envelope, remote_endpoint);
        self.register_session(&call);
    }
}
