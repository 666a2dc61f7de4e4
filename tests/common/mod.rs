//! Scripted in-memory server for client integration tests.
#![allow(dead_code)]

use async_trait::async_trait;
use peerlink::calls::{
    Call, IncomingSessionHandler, LinkEvent, MediaError, MediaHandle, MediaSource, PeerLink,
    PeerLinkFactory,
};
use peerlink::envelope::{DescriptionKind, IceCandidate, SessionDescription};
use peerlink::frame::{Frame, Method};
use peerlink::transport::{Transport, TransportEvent, TransportFactory};
use peerlink::types::events::{Event, EventHandler};
use peerlink::types::media::{MediaConstraints, MediaKind};
use peerlink::{Client, ClientConfig, SignalEnvelope};
use serde_json::{Value, json};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;

pub const WAIT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub method: Method,
    pub path: String,
    pub body: Value,
    pub connection: usize,
}

#[derive(Default)]
struct ServerState {
    /// Per-attempt outcome. Attempts past the end of the script are accepted.
    script: VecDeque<bool>,
    attempts: Vec<Instant>,
    connections: usize,
    responses: HashMap<String, VecDeque<(u16, Value)>>,
    silent: HashSet<String>,
    requests: Vec<RecordedRequest>,
    current: Option<(mpsc::Sender<TransportEvent>, Arc<AtomicBool>)>,
}

/// Plays the server side of every connection the client opens.
#[derive(Clone)]
pub struct ScriptedServer {
    endpoint_id: String,
    state: Arc<Mutex<ServerState>>,
}

impl ScriptedServer {
    pub fn new(endpoint_id: &str) -> Self {
        Self {
            endpoint_id: endpoint_id.to_string(),
            state: Arc::new(Mutex::new(ServerState::default())),
        }
    }

    /// `true` accepts an attempt, `false` refuses it.
    pub fn script_attempts(&self, outcomes: &[bool]) {
        self.state.lock().unwrap().script.extend(outcomes);
    }

    /// Queues responses for `path`. Once used up, the default response applies.
    pub fn respond(&self, path: &str, status: u16, body: Value) {
        self.state
            .lock()
            .unwrap()
            .responses
            .entry(path.to_string())
            .or_default()
            .push_back((status, body));
    }

    /// Requests to `path` never get a response.
    pub fn silence(&self, path: &str) {
        self.state.lock().unwrap().silent.insert(path.to_string());
    }

    pub fn attempts(&self) -> Vec<Instant> {
        self.state.lock().unwrap().attempts.clone()
    }

    pub fn requests(&self, path: &str) -> Vec<RecordedRequest> {
        self.state
            .lock()
            .unwrap()
            .requests
            .iter()
            .filter(|r| r.path == path)
            .cloned()
            .collect()
    }

    /// Closes the live connection from the server side.
    pub async fn drop_connection(&self) {
        let current = self.state.lock().unwrap().current.take();
        if let Some((tx, closed)) = current {
            closed.store(true, Ordering::SeqCst);
            let _ = tx.send(TransportEvent::Disconnected).await;
        }
    }

    pub async fn push_raw(&self, text: &str) {
        let tx = self
            .state
            .lock()
            .unwrap()
            .current
            .as_ref()
            .map(|(tx, _)| tx.clone())
            .expect("no live connection");
        tx.send(TransportEvent::FrameReceived(text.to_string()))
            .await
            .unwrap();
    }

    pub async fn push_signal(&self, body: Value) {
        let frame = Frame::Signal { body }.to_json().unwrap();
        self.push_raw(&frame).await;
    }

    pub async fn push_envelope(&self, envelope: &SignalEnvelope) {
        self.push_signal(serde_json::to_value(envelope).unwrap())
            .await;
    }

    /// Waits until at least `count` requests to `path` were made.
    pub async fn wait_for_requests(&self, path: &str, count: usize) -> Vec<RecordedRequest> {
        wait_until(|| self.requests(path).len() >= count).await;
        self.requests(path)
    }

    pub async fn wait_for_attempts(&self, count: usize) -> Vec<Instant> {
        wait_until(|| self.attempts().len() >= count).await;
        self.attempts()
    }
}

/// Polls `cond` until it holds. Panics after [`WAIT`].
pub async fn wait_until(cond: impl Fn() -> bool) {
    let deadline = Instant::now() + WAIT;
    while !cond() {
        assert!(Instant::now() < deadline, "condition not reached in time");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

struct ScriptedTransport {
    endpoint_id: String,
    connection: usize,
    state: Arc<Mutex<ServerState>>,
    events: mpsc::Sender<TransportEvent>,
    closed: Arc<AtomicBool>,
}

impl ScriptedTransport {
    fn respond_to(&self, method: Method, path: &str, body: Value) -> Option<(u16, Value)> {
        let mut state = self.state.lock().unwrap();
        state.requests.push(RecordedRequest {
            method,
            path: path.to_string(),
            body,
            connection: self.connection,
        });
        if state.silent.contains(path) {
            return None;
        }
        if let Some(response) = state.responses.get_mut(path).and_then(VecDeque::pop_front) {
            return Some(response);
        }
        if path == "/v1/connections" {
            return Some((
                200,
                json!({
                    "id": format!("conn-{}", self.connection),
                    "endpointId": self.endpoint_id,
                }),
            ));
        }
        Some((204, Value::Null))
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn send_frame(&self, frame: &str) -> Result<(), anyhow::Error> {
        if self.closed.load(Ordering::SeqCst) {
            anyhow::bail!("connection closed");
        }
        let Frame::Request {
            id,
            method,
            path,
            body,
        } = Frame::from_json(frame)?
        else {
            anyhow::bail!("client sent a non-request frame");
        };
        if let Some((status, body)) = self.respond_to(method, &path, body) {
            let response = Frame::Response { id, status, body }.to_json()?;
            let _ = self
                .events
                .send(TransportEvent::FrameReceived(response))
                .await;
        }
        Ok(())
    }

    async fn disconnect(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            let _ = self.events.send(TransportEvent::Disconnected).await;
        }
    }
}

#[async_trait]
impl TransportFactory for ScriptedServer {
    async fn create_transport(
        &self,
    ) -> Result<(Arc<dyn Transport>, mpsc::Receiver<TransportEvent>), anyhow::Error> {
        let mut state = self.state.lock().unwrap();
        state.attempts.push(Instant::now());
        if !state.script.pop_front().unwrap_or(true) {
            anyhow::bail!("connection refused");
        }
        state.connections += 1;

        let (tx, rx) = mpsc::channel(100);
        let closed = Arc::new(AtomicBool::new(false));
        state.current = Some((tx.clone(), closed.clone()));
        let _ = tx.try_send(TransportEvent::Connected);

        let transport = ScriptedTransport {
            endpoint_id: self.endpoint_id.clone(),
            connection: state.connections,
            state: self.state.clone(),
            events: tx,
            closed,
        };
        Ok((Arc::new(transport), rx))
    }
}

/// Peer link that produces canned descriptions.
struct CannedLink;

#[async_trait]
impl PeerLink for CannedLink {
    async fn create_local_description(
        &mut self,
        kind: DescriptionKind,
    ) -> Result<SessionDescription, MediaError> {
        Ok(SessionDescription::new(
            kind,
            "v=0\r\nm=audio 9 UDP/TLS/RTP/SAVPF 111\r\n",
        ))
    }

    async fn apply_local_description(&mut self, _: &SessionDescription) -> Result<(), MediaError> {
        Ok(())
    }

    async fn apply_remote_description(
        &mut self,
        _: &SessionDescription,
    ) -> Result<(), MediaError> {
        Ok(())
    }

    async fn add_remote_candidate(&mut self, _: &IceCandidate) -> Result<(), MediaError> {
        Ok(())
    }

    fn add_local_media(&mut self, _: &MediaHandle) {}

    fn create_data_channel(&mut self, _: &str) -> Result<(), MediaError> {
        Ok(())
    }

    async fn send_data(&mut self, _: &str) -> Result<(), MediaError> {
        Ok(())
    }

    fn close_data_channel(&mut self) {}

    fn set_muted(&mut self, _: MediaKind, _: bool) {}

    fn has_remote_media(&self) -> bool {
        false
    }

    fn is_active(&self) -> bool {
        false
    }

    fn close(&mut self) {}
}

pub struct CannedLinks;

impl PeerLinkFactory for CannedLinks {
    fn create(&self, _: &str, _: mpsc::UnboundedSender<LinkEvent>) -> Box<dyn PeerLink> {
        Box::new(CannedLink)
    }
}

pub struct GrantingMedia;

#[async_trait]
impl MediaSource for GrantingMedia {
    async fn acquire_media(
        &self,
        constraints: &MediaConstraints,
    ) -> Result<MediaHandle, MediaError> {
        Ok(MediaHandle {
            id: "local".into(),
            audio: constraints.audio,
            video: constraints.video,
        })
    }
}

/// Records every event and lets tests wait for one.
pub struct EventRecorder {
    events: Mutex<Vec<Event>>,
}

impl EventRecorder {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            events: Mutex::new(Vec::new()),
        })
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }

    pub fn count(&self, pred: impl Fn(&Event) -> bool) -> usize {
        self.events.lock().unwrap().iter().filter(|e| pred(e)).count()
    }

    /// Waits until `count` events match `pred` and returns the matches.
    pub async fn wait_for(&self, count: usize, pred: impl Fn(&Event) -> bool) -> Vec<Event> {
        wait_until(|| self.count(&pred) >= count).await;
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| pred(e))
            .cloned()
            .collect()
    }
}

impl EventHandler for EventRecorder {
    fn handle_event(&self, event: &Event) {
        self.events.lock().unwrap().push(event.clone());
    }
}

/// Hands incoming sessions to the test.
pub struct IncomingCalls {
    tx: mpsc::UnboundedSender<Call>,
}

impl IncomingCalls {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<Call>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Self { tx }), rx)
    }
}

impl IncomingSessionHandler for IncomingCalls {
    fn on_call(&self, call: Call) {
        let _ = self.tx.send(call);
    }
}

pub fn test_config() -> ClientConfig {
    let mut config = ClientConfig::default();
    config.url = "ws://scripted".into();
    config.calls.answer_timeout_ms = 60_000;
    config
}

/// A client for endpoint `alice` backed by `server`, with an event recorder.
pub fn client_for(server: &ScriptedServer, config: ClientConfig) -> (Arc<Client>, Arc<EventRecorder>) {
    let client = Client::new(
        config,
        Arc::new(server.clone()),
        Arc::new(CannedLinks),
        Arc::new(GrantingMedia),
    );
    let recorder = EventRecorder::new();
    client.add_event_handler(recorder.clone());
    (client, recorder)
}

/// Starts the run loop and waits for the first connection.
pub async fn start(client: &Arc<Client>, recorder: &EventRecorder) -> tokio::task::JoinHandle<()> {
    let runner = client.clone();
    let handle = tokio::spawn(async move { runner.run().await });
    recorder
        .wait_for(1, |e| matches!(e, Event::Connected(_)))
        .await;
    handle
}
