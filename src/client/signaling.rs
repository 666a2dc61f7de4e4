use crate::calls::SignalingChannel;
use crate::client::Client;
use crate::request::RequestError;
use async_trait::async_trait;
use log::debug;
use peerlink_core::SignalEnvelope;
use peerlink_core::frame::Method;
use serde_json::{Map, Value};
use std::sync::Weak;

pub const SIGNALING_PATH: &str = "/v1/signaling";

/// The handle sessions use to reach the client. Holds the client weakly so
/// that sessions outliving it see `NotConnected` instead of keeping it alive.
pub(crate) struct ClientChannel {
    client: Weak<Client>,
}

impl ClientChannel {
    pub(crate) fn new(client: Weak<Client>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl SignalingChannel for ClientChannel {
    async fn send_signal(&self, envelope: SignalEnvelope) -> Result<(), RequestError> {
        let client = self.client.upgrade().ok_or(RequestError::NotConnected)?;
        client.send_signal(envelope).await
    }

    fn connection_id(&self) -> Option<String> {
        self.client.upgrade()?.connection_id()
    }

    fn endpoint_id(&self) -> Option<String> {
        self.client.upgrade()?.endpoint_id()
    }
}

impl Client {
    /// Posts one envelope to the signaling endpoint, addressed to the
    /// envelope's recipient.
    pub async fn send_signal(&self, envelope: SignalEnvelope) -> Result<(), RequestError> {
        let mut body = Map::new();
        if let Some(to) = &envelope.to {
            body.insert("to".into(), Value::String(to.clone()));
        }
        if let Some(connection) = &envelope.to_connection {
            body.insert("toConnection".into(), Value::String(connection.clone()));
        }
        debug!(
            target: "Client/Signaling",
            "--> {:?} for session {}",
            envelope.signal_type, envelope.session_id
        );
        body.insert("signal".into(), serde_json::to_value(&envelope)?);

        self.send_request(Method::Post, SIGNALING_PATH, Value::Object(body))
            .await?;
        Ok(())
    }
}
