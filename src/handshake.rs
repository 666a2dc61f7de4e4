use crate::transport::{Transport, TransportEvent};
use log::{debug, info};
use peerlink_core::frame::{Frame, Method, status};
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::{Duration, timeout};

pub const CONNECTIONS_PATH: &str = "/v1/connections";

#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("Transport error: {0}")]
    Transport(#[from] anyhow::Error),
    #[error("Timed out waiting for registration response")]
    Timeout,
    #[error("Unexpected event during registration: {0}")]
    UnexpectedEvent(String),
    #[error("Registration rejected with status {status}")]
    Rejected { status: u16 },
    #[error("Credentials refused")]
    Unauthorized,
    #[error("Malformed registration response: {0}")]
    Malformed(#[from] serde_json::Error),
}

type Result<T> = std::result::Result<T, HandshakeError>;

/// Identity the server assigned to this connection.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Registration {
    #[serde(rename = "id")]
    pub connection_id: String,
    pub endpoint_id: String,
}

/// Registers a freshly opened transport as a connection.
///
/// Runs before the read loop exists, so the response is read straight off the
/// transport events. Signals pushed before the response arrives are dropped.
pub async fn register_connection(
    transport: Arc<dyn Transport>,
    transport_events: &mut mpsc::Receiver<TransportEvent>,
    request_id: String,
    response_timeout: Duration,
) -> Result<Registration> {
    let request = Frame::Request {
        id: request_id.clone(),
        method: Method::Post,
        path: CONNECTIONS_PATH.to_string(),
        body: Value::Null,
    };
    debug!(target: "Client", "--> Registering connection ({request_id})");
    transport.send_frame(&request.to_json()?).await?;

    let deadline = tokio::time::Instant::now() + response_timeout;
    let (code, body) = loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        match timeout(remaining, transport_events.recv()).await {
            Ok(Some(TransportEvent::FrameReceived(text))) => match Frame::from_json(&text) {
                Ok(Frame::Response { id, status, body }) if id == request_id => {
                    break (status, body);
                }
                Ok(other) => {
                    debug!(target: "Client", "Ignoring frame during registration: {other:?}");
                    continue;
                }
                Err(e) => {
                    debug!(target: "Client", "Ignoring unparsable frame during registration: {e}");
                    continue;
                }
            },
            Ok(Some(TransportEvent::Connected)) => continue,
            Ok(Some(TransportEvent::Disconnected)) => {
                return Err(HandshakeError::UnexpectedEvent(
                    "Disconnected during registration".to_string(),
                ));
            }
            Ok(None) | Err(_) => return Err(HandshakeError::Timeout),
        }
    };

    match code {
        s if status::is_success(s) => {
            let registration: Registration = serde_json::from_value(body)?;
            info!(
                target: "Client",
                "Registered connection {} for endpoint {}",
                registration.connection_id, registration.endpoint_id
            );
            Ok(registration)
        }
        status::UNAUTHORIZED => Err(HandshakeError::Unauthorized),
        s => Err(HandshakeError::Rejected { status: s }),
    }
}
