use crate::client::Client;
use crate::request::RequestError;
use log::{debug, info, warn};
use peerlink_core::frame::Method;
use serde_json::Value;
use std::sync::Arc;
use std::sync::atomic::Ordering;

pub const HEARTBEAT_PATH: &str = "/v1/heartbeat";

impl Client {
    /// Sends a single heartbeat. Returns false if the loop should stop.
    async fn send_heartbeat(&self) -> bool {
        match self.send_request(Method::Get, HEARTBEAT_PATH, Value::Null).await {
            Ok(_) => {
                debug!(target: "Client/Keepalive", "Heartbeat acknowledged");
                true
            }
            Err(RequestError::Unauthorized) => {
                self.handle_authorization_failure("heartbeat rejected");
                false
            }
            Err(e) if e.is_transport() => {
                // A lost transport is noticed by the read loop.
                debug!(target: "Client/Keepalive", "Heartbeat failed: {e}");
                true
            }
            Err(e) => {
                warn!(target: "Client/Keepalive", "Heartbeat failed: {e}");
                true
            }
        }
    }

    /// The heartbeat loop of one connection. Spawned on connect, exits when
    /// that connection is gone.
    pub(crate) async fn keepalive_loop(self: Arc<Self>, generation: u64) {
        let interval = self.config.heartbeat_interval();
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    if !self.is_connected()
                        || self.connection_generation.load(Ordering::SeqCst) != generation
                    {
                        debug!(target: "Client/Keepalive", "Connection gone, exiting keepalive loop.");
                        return;
                    }

                    if !self.send_heartbeat().await {
                        info!(target: "Client/Keepalive", "Heartbeat refused, disconnecting.");
                        self.disconnect().await;
                        return;
                    }
                },
                _ = self.shutdown_notifier.notified() => {
                    debug!(target: "Client/Keepalive", "Shutdown signaled, exiting keepalive loop.");
                    return;
                }
            }
        }
    }
}
