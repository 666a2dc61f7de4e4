//! Signal kind definitions.
//!
//! Every envelope exchanged over the signaling transport carries one of
//! these kinds. Routing matches on them exhaustively.

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

/// Kind of a signaling envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SignalType {
    /// Session description proposing a new session or a new round.
    Offer,
    /// Session description accepting an offer.
    Answer,
    /// Sent by the caller once an answer was applied. Tells every other
    /// connection of the callee's endpoint that it lost the race.
    Connected,
    /// Renegotiation sub-protocol.
    Modify,
    /// One or more trickled ICE candidates.
    IceCandidates,
    /// Session teardown. Either party, any time.
    Hangup,
    /// Acknowledgment of a previously delivered signal.
    Ack,
}

impl SignalType {
    pub const ALL: [SignalType; 7] = [
        Self::Offer,
        Self::Answer,
        Self::Connected,
        Self::Modify,
        Self::IceCandidates,
        Self::Hangup,
        Self::Ack,
    ];

    /// Name used for the `signalType` field on the wire.
    pub const fn tag_name(&self) -> &'static str {
        match self {
            Self::Offer => "offer",
            Self::Answer => "answer",
            Self::Connected => "connected",
            Self::Modify => "modify",
            Self::IceCandidates => "iceCandidates",
            Self::Hangup => "hangup",
            Self::Ack => "ack",
        }
    }

    /// Parse from the wire name. Older peers send `bye` for hangup.
    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "offer" => Some(Self::Offer),
            "answer" => Some(Self::Answer),
            "connected" => Some(Self::Connected),
            "modify" => Some(Self::Modify),
            "iceCandidates" => Some(Self::IceCandidates),
            "hangup" | "bye" => Some(Self::Hangup),
            "ack" => Some(Self::Ack),
            _ => None,
        }
    }

    /// Whether an envelope of this kind starts a new session on the receiver.
    pub const fn is_initiating(&self) -> bool {
        matches!(self, Self::Offer)
    }
}

/// What the session negotiates: a media call or a data channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Target {
    #[default]
    Call,
    DirectConnection,
}

impl Target {
    pub const fn tag_name(&self) -> &'static str {
        match self {
            Self::Call => "call",
            Self::DirectConnection => "directConnection",
        }
    }

    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "call" => Some(Self::Call),
            "directConnection" => Some(Self::DirectConnection),
            _ => None,
        }
    }
}

/// Step of the renegotiation sub-protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModifyAction {
    Initiate,
    Accept,
    Reject,
}

impl ModifyAction {
    pub const fn tag_name(&self) -> &'static str {
        match self {
            Self::Initiate => "initiate",
            Self::Accept => "accept",
            Self::Reject => "reject",
        }
    }

    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "initiate" => Some(Self::Initiate),
            "accept" => Some(Self::Accept),
            "reject" => Some(Self::Reject),
            _ => None,
        }
    }
}

macro_rules! tag_serde {
    ($ty:ty, $what:literal) => {
        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.tag_name())
            }
        }

        impl Serialize for $ty {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.serialize_str(self.tag_name())
            }
        }

        impl<'de> Deserialize<'de> for $ty {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let tag = String::deserialize(deserializer)?;
                Self::from_tag(&tag)
                    .ok_or_else(|| D::Error::custom(format!(concat!("unknown ", $what, " `{}`"), tag)))
            }
        }
    };
}

tag_serde!(SignalType, "signal type");
tag_serde!(Target, "target");
tag_serde!(ModifyAction, "modify action");
