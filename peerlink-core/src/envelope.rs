//! The signaling envelope: one JSON object per message.

use crate::signal::{ModifyAction, SignalType, Target};
use crate::types::media::MediaConstraints;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EnvelopeError {
    #[error("invalid envelope json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("envelope is missing required field `{0}`")]
    MissingField(&'static str),
    #[error("{kind} envelope is missing `{field}`")]
    MissingPayload {
        kind: SignalType,
        field: &'static str,
    },
}

/// Whether a session description is an offer or an answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DescriptionKind {
    Offer,
    Answer,
}

/// An SDP blob together with its role.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: DescriptionKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn new(kind: DescriptionKind, sdp: impl Into<String>) -> Self {
        Self {
            kind,
            sdp: sdp.into(),
        }
    }
}

/// An ICE candidate received from or to be sent to a peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    /// The candidate line, e.g. `candidate:1 1 UDP 2130706431 192.168.1.1 8888 typ host`.
    pub candidate: String,
    #[serde(rename = "sdpMid", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(
        rename = "sdpMLineIndex",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub sdp_m_line_index: Option<u16>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_m_line_index: None,
        }
    }

    pub fn with_sdp_mid(mut self, sdp_mid: impl Into<String>) -> Self {
        self.sdp_mid = Some(sdp_mid.into());
        self
    }

    pub fn with_sdp_m_line_index(mut self, index: u16) -> Self {
        self.sdp_m_line_index = Some(index);
        self
    }

    /// A candidate can only be applied if it names the media line it belongs to.
    pub fn is_addressable(&self) -> bool {
        self.sdp_mid.is_some() || self.sdp_m_line_index.is_some()
    }

    /// TURN relay candidate.
    pub fn is_relay(&self) -> bool {
        self.candidate.contains(" typ relay")
    }
}

/// A single signaling message.
///
/// Construct with [`SignalEnvelope::new`] and the `with_*` setters. Parse
/// inbound messages with [`SignalEnvelope::from_json`] or
/// [`SignalEnvelope::from_value`], which reject envelopes lacking the
/// fields their kind requires.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalEnvelope {
    pub signal_type: SignalType,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub session_id: String,
    pub target: Target,
    pub signal_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub to_connection: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub from_endpoint: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub from_connection: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_description: Option<SessionDescription>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ice_candidates: Option<Vec<IceCandidate>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub action: Option<ModifyAction>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub direct_connection: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub constraints: Option<MediaConstraints>,
}

/// Wire shape before validation. Everything is optional here so that a
/// missing field is reported by name instead of as a serde error.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawEnvelope {
    signal_type: Option<SignalType>,
    session_id: Option<String>,
    target: Option<Target>,
    signal_id: Option<String>,
    to: Option<String>,
    to_connection: Option<String>,
    from_endpoint: Option<String>,
    from_connection: Option<String>,
    session_description: Option<SessionDescription>,
    ice_candidates: Option<Vec<IceCandidate>>,
    action: Option<ModifyAction>,
    reason: Option<String>,
    direct_connection: Option<bool>,
    constraints: Option<MediaConstraints>,
}

/// Random identifier for an outbound envelope.
pub fn generate_signal_id() -> String {
    format!("{:032X}", rand::random::<u128>())
}

impl SignalEnvelope {
    pub fn new(signal_type: SignalType, session_id: impl Into<String>, target: Target) -> Self {
        Self {
            signal_type,
            session_id: session_id.into(),
            target,
            signal_id: generate_signal_id(),
            to: None,
            to_connection: None,
            from_endpoint: None,
            from_connection: None,
            session_description: None,
            ice_candidates: None,
            action: None,
            reason: None,
            direct_connection: None,
            constraints: None,
        }
    }

    pub fn with_recipient(mut self, to: impl Into<String>, connection: Option<String>) -> Self {
        self.to = Some(to.into());
        self.to_connection = connection;
        self
    }

    pub fn with_sender(mut self, endpoint: Option<String>, connection: Option<String>) -> Self {
        self.from_endpoint = endpoint;
        self.from_connection = connection;
        self
    }

    pub fn with_description(mut self, description: SessionDescription) -> Self {
        self.session_description = Some(description);
        self
    }

    pub fn with_candidates(mut self, candidates: Vec<IceCandidate>) -> Self {
        self.ice_candidates = Some(candidates);
        self
    }

    pub fn with_action(mut self, action: ModifyAction) -> Self {
        self.action = Some(action);
        self
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn with_direct_connection(mut self, direct: bool) -> Self {
        self.direct_connection = Some(direct);
        self
    }

    pub fn with_constraints(mut self, constraints: MediaConstraints) -> Self {
        self.constraints = Some(constraints);
        self
    }

    pub fn from_json(text: &str) -> Result<Self, EnvelopeError> {
        let raw: RawEnvelope = serde_json::from_str(text)?;
        Self::validate(raw)
    }

    pub fn from_value(value: Value) -> Result<Self, EnvelopeError> {
        let raw: RawEnvelope = serde_json::from_value(value)?;
        Self::validate(raw)
    }

    pub fn to_json(&self) -> Result<String, EnvelopeError> {
        Ok(serde_json::to_string(self)?)
    }

    fn validate(raw: RawEnvelope) -> Result<Self, EnvelopeError> {
        let signal_type = raw
            .signal_type
            .ok_or(EnvelopeError::MissingField("signalType"))?;
        let is_ack = signal_type == SignalType::Ack;

        let session_id = match raw.session_id {
            Some(id) if !id.is_empty() => id,
            _ if is_ack => String::new(),
            _ => return Err(EnvelopeError::MissingField("sessionId")),
        };
        let target = match raw.target {
            Some(target) => target,
            None if is_ack => Target::default(),
            None => return Err(EnvelopeError::MissingField("target")),
        };

        let missing = |field| EnvelopeError::MissingPayload {
            kind: signal_type,
            field,
        };
        match signal_type {
            SignalType::Offer | SignalType::Answer if raw.session_description.is_none() => {
                return Err(missing("sessionDescription"));
            }
            SignalType::IceCandidates if raw.ice_candidates.is_none() => {
                return Err(missing("iceCandidates"));
            }
            SignalType::Modify if raw.action.is_none() => return Err(missing("action")),
            _ => {}
        }

        Ok(Self {
            signal_type,
            session_id,
            target,
            signal_id: raw.signal_id.unwrap_or_default(),
            to: raw.to,
            to_connection: raw.to_connection,
            from_endpoint: raw.from_endpoint,
            from_connection: raw.from_connection,
            session_description: raw.session_description,
            ice_candidates: raw.ice_candidates,
            action: raw.action,
            reason: raw.reason,
            direct_connection: raw.direct_connection,
            constraints: raw.constraints,
        })
    }
}
