use peerlink_core::Backoff;
use serde::Deserialize;
use std::time::Duration;

/// Timers and candidate policy for every session a client creates.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct CallConfig {
    /// Caller waits this long for the remote answer after sending an offer.
    pub answer_timeout_ms: u64,
    /// From applying the answer until media or the data channel flows.
    pub connection_timeout_ms: u64,
    /// Callee must answer its own incoming session within this window.
    pub local_answer_timeout_ms: u64,
    /// A renegotiation with no reply rolls back after this.
    pub modify_timeout_ms: u64,
    /// Only relay candidates are sent.
    pub force_turn: bool,
    /// Relay candidates are never sent.
    pub disable_turn: bool,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            answer_timeout_ms: 1000,
            connection_timeout_ms: 1000,
            local_answer_timeout_ms: 10_000,
            modify_timeout_ms: 60_000,
            force_turn: false,
            disable_turn: false,
        }
    }
}

impl CallConfig {
    pub fn answer_timeout(&self) -> Duration {
        Duration::from_millis(self.answer_timeout_ms)
    }

    pub fn connection_timeout(&self) -> Duration {
        Duration::from_millis(self.connection_timeout_ms)
    }

    pub fn local_answer_timeout(&self) -> Duration {
        Duration::from_millis(self.local_answer_timeout_ms)
    }

    pub fn modify_timeout(&self) -> Duration {
        Duration::from_millis(self.modify_timeout_ms)
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub url: String,
    pub auto_reconnect: bool,
    pub request_timeout_ms: u64,
    pub heartbeat_interval_ms: u64,
    pub reconnect_initial_ms: u64,
    pub reconnect_max_ms: u64,
    /// How many times a request answered with 429 is retried.
    pub rate_limit_retries: u32,
    pub rate_limit_delay_ms: u64,
    pub calls: CallConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            auto_reconnect: true,
            request_timeout_ms: 30_000,
            heartbeat_interval_ms: 5000,
            reconnect_initial_ms: 500,
            reconnect_max_ms: 300_000,
            rate_limit_retries: 3,
            rate_limit_delay_ms: 1000,
            calls: CallConfig::default(),
        }
    }
}

impl ClientConfig {
    /// Parses a JSON document. Missing keys keep their defaults.
    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn rate_limit_delay(&self) -> Duration {
        Duration::from_millis(self.rate_limit_delay_ms)
    }

    pub fn backoff(&self) -> Backoff {
        Backoff::new(
            Duration::from_millis(self.reconnect_initial_ms),
            Duration::from_millis(self.reconnect_max_ms),
        )
    }
}
