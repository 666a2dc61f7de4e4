use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Video,
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Audio => f.write_str("audio"),
            Self::Video => f.write_str("video"),
        }
    }
}

/// Which tracks to acquire locally. Sent along with `modify` so the remote
/// side knows what the new round is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaConstraints {
    #[serde(default)]
    pub audio: bool,
    #[serde(default)]
    pub video: bool,
}

impl MediaConstraints {
    pub const fn audio_only() -> Self {
        Self {
            audio: true,
            video: false,
        }
    }

    pub const fn audio_video() -> Self {
        Self {
            audio: true,
            video: true,
        }
    }

    pub const fn none() -> Self {
        Self {
            audio: false,
            video: false,
        }
    }

    /// Constraints with one more kind switched on.
    pub fn with(mut self, kind: MediaKind) -> Self {
        match kind {
            MediaKind::Audio => self.audio = true,
            MediaKind::Video => self.video = true,
        }
        self
    }

    pub fn wants_media(&self) -> bool {
        self.audio || self.video
    }
}

impl Default for MediaConstraints {
    fn default() -> Self {
        Self::audio_video()
    }
}
