use crate::client::Client;
use log::{debug, warn};
use peerlink_core::frame::{Frame, Method, status};
use serde_json::Value;
use std::sync::atomic::Ordering;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::time::{sleep, timeout};

/// What a correlated request waits for.
pub(crate) type ResponseWaiter = oneshot::Sender<Result<Response, RequestError>>;

#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub status: u16,
    pub body: Value,
}

#[derive(Debug, Error)]
pub enum RequestError {
    #[error("request timed out")]
    Timeout,
    #[error("client is not connected")]
    NotConnected,
    #[error("transport disconnected while waiting for a response")]
    Disconnected,
    #[error("transport error: {0}")]
    Transport(String),
    #[error("could not encode request: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("server error response: status={status}, message='{message}'")]
    ServerError { status: u16, message: String },
    #[error("not authorized")]
    Unauthorized,
    #[error("too many retries after rate limit exceeded ({tries} tries)")]
    RateLimited { tries: u32 },
    #[error("internal channel closed unexpectedly")]
    ChannelClosed,
}

impl RequestError {
    /// Failures caused by the transport rather than by the server's answer.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            Self::Timeout | Self::NotConnected | Self::Disconnected | Self::Transport(_)
        )
    }
}

fn error_message(status: u16, body: &Value) -> String {
    body.get("error")
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| match status {
            403 => "forbidden".to_string(),
            404 => "not found".to_string(),
            _ => "unknown error".to_string(),
        })
}

impl Client {
    /// Generates a new unique request ID string.
    pub fn generate_request_id(&self) -> String {
        let count = self.id_counter.fetch_add(1, Ordering::Relaxed);
        format!("{}-{}", self.unique_id, count)
    }

    /// Sends a request over the persistent connection and waits for the
    /// response carrying the same id. Responses with status 429 are retried
    /// up to `rate_limit_retries` times.
    pub async fn send_request(
        &self,
        method: Method,
        path: &str,
        body: Value,
    ) -> Result<Value, RequestError> {
        let mut tries = 0;
        loop {
            tries += 1;
            let response = self.send_request_once(method, path, body.clone()).await?;
            if response.status == status::TOO_MANY_REQUESTS {
                if tries > self.config.rate_limit_retries {
                    return Err(RequestError::RateLimited { tries });
                }
                debug!(target: "Client/Request", "{method:?} {path} rate limited, retrying");
                sleep(self.config.rate_limit_delay()).await;
                continue;
            }
            return match response.status {
                s if status::is_success(s) => Ok(response.body),
                status::UNAUTHORIZED => Err(RequestError::Unauthorized),
                s => Err(RequestError::ServerError {
                    status: s,
                    message: error_message(s, &response.body),
                }),
            };
        }
    }

    async fn send_request_once(
        &self,
        method: Method,
        path: &str,
        body: Value,
    ) -> Result<Response, RequestError> {
        let transport = self
            .transport
            .lock()
            .await
            .clone()
            .ok_or(RequestError::NotConnected)?;

        let id = self.generate_request_id();
        let frame = Frame::Request {
            id: id.clone(),
            method,
            path: path.to_string(),
            body,
        }
        .to_json()?;

        let (tx, rx) = oneshot::channel();
        self.response_waiters.lock().await.insert(id.clone(), tx);

        if let Err(e) = transport.send_frame(&frame).await {
            self.response_waiters.lock().await.remove(&id);
            return Err(RequestError::Transport(e.to_string()));
        }

        match timeout(self.config.request_timeout(), rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(RequestError::ChannelClosed),
            Err(_) => {
                self.response_waiters.lock().await.remove(&id);
                Err(RequestError::Timeout)
            }
        }
    }

    /// Hands a response to the request waiting for it. Returns false if no
    /// request with that id is pending.
    pub(crate) async fn handle_response(&self, id: &str, status: u16, body: Value) -> bool {
        let Some(waiter) = self.response_waiters.lock().await.remove(id) else {
            return false;
        };
        if waiter.send(Ok(Response { status, body })).is_err() {
            warn!(target: "Client/Request", "Waiter for response {id} was dropped");
        }
        true
    }

    /// Rejects every pending request, each with its own error.
    pub(crate) async fn fail_pending_requests(&self) {
        let waiters: Vec<_> = self.response_waiters.lock().await.drain().collect();
        if !waiters.is_empty() {
            debug!(target: "Client/Request", "Failing {} pending requests", waiters.len());
        }
        for (_, waiter) in waiters {
            let _ = waiter.send(Err(RequestError::Disconnected));
        }
    }
}
