//! Mock collaborators shared by the call tests.

use super::call::{Call, IncomingSessionHandler};
use super::media::{LinkEvent, MediaError, MediaHandle, MediaSource, PeerLink, PeerLinkFactory};
use super::signaling::SignalingChannel;
use crate::request::RequestError;
use async_trait::async_trait;
use peerlink_core::envelope::{DescriptionKind, IceCandidate, SessionDescription};
use peerlink_core::types::events::{CallEventKind, Event, EventHandler};
use peerlink_core::types::media::{MediaConstraints, MediaKind};
use peerlink_core::{SignalEnvelope, SignalType};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::mpsc;

const WAIT: Duration = Duration::from_secs(30);

pub struct RecordingChannel {
    endpoint_id: String,
    connection_id: String,
    sent: Arc<Mutex<Vec<SignalEnvelope>>>,
    tx: mpsc::UnboundedSender<SignalEnvelope>,
    fail_sends: AtomicBool,
}

/// Reader side of a [`RecordingChannel`].
pub struct SignalLog {
    sent: Arc<Mutex<Vec<SignalEnvelope>>>,
    rx: mpsc::UnboundedReceiver<SignalEnvelope>,
}

impl RecordingChannel {
    pub fn new(endpoint_id: &str, connection_id: &str) -> (Arc<Self>, SignalLog) {
        let sent = Arc::new(Mutex::new(Vec::new()));
        let (tx, rx) = mpsc::unbounded_channel();
        let channel = Arc::new(Self {
            endpoint_id: endpoint_id.to_string(),
            connection_id: connection_id.to_string(),
            sent: sent.clone(),
            tx,
            fail_sends: AtomicBool::new(false),
        });
        (channel, SignalLog { sent, rx })
    }

    pub fn set_fail_sends(&self, fail: bool) {
        self.fail_sends.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl SignalingChannel for RecordingChannel {
    async fn send_signal(&self, envelope: SignalEnvelope) -> Result<(), RequestError> {
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(RequestError::NotConnected);
        }
        self.sent.lock().unwrap().push(envelope.clone());
        let _ = self.tx.send(envelope);
        Ok(())
    }

    fn connection_id(&self) -> Option<String> {
        Some(self.connection_id.clone())
    }

    fn endpoint_id(&self) -> Option<String> {
        Some(self.endpoint_id.clone())
    }
}

impl SignalLog {
    pub fn sent(&self) -> Vec<SignalEnvelope> {
        self.sent.lock().unwrap().clone()
    }

    pub fn count(&self, kind: SignalType) -> usize {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.signal_type == kind)
            .count()
    }

    /// Wait for the next envelope of `kind`, skipping others.
    pub async fn next_of(&mut self, kind: SignalType) -> SignalEnvelope {
        loop {
            let envelope = tokio::time::timeout(WAIT, self.rx.recv())
                .await
                .unwrap_or_else(|_| panic!("no {kind} envelope sent"))
                .expect("channel dropped");
            if envelope.signal_type == kind {
                return envelope;
            }
        }
    }
}

#[derive(Debug, Default)]
pub struct LinkState {
    pub local_descriptions: Vec<SessionDescription>,
    pub remote_descriptions: Vec<SessionDescription>,
    pub remote_candidates: Vec<IceCandidate>,
    pub local_media: Vec<MediaHandle>,
    pub data_channels: Vec<String>,
    pub data_channel_open: bool,
    pub data_channel_closes: usize,
    pub sent_data: Vec<String>,
    pub muted: Vec<(MediaKind, bool)>,
    pub remote_media: bool,
    pub close_count: usize,
    pub fail_remote_description: bool,
}

pub type SharedLinkState = Arc<Mutex<LinkState>>;

pub struct MockLink {
    state: SharedLinkState,
}

impl MockLink {
    pub fn new() -> (Self, SharedLinkState) {
        let state = SharedLinkState::default();
        (
            Self {
                state: state.clone(),
            },
            state,
        )
    }

    pub fn set_data_channel_open(&self, open: bool) {
        self.state.lock().unwrap().data_channel_open = open;
    }
}

#[async_trait]
impl PeerLink for MockLink {
    async fn create_local_description(
        &mut self,
        kind: DescriptionKind,
    ) -> Result<SessionDescription, MediaError> {
        Ok(SessionDescription::new(kind, format!("v=0 mock {kind:?}")))
    }

    async fn apply_local_description(
        &mut self,
        description: &SessionDescription,
    ) -> Result<(), MediaError> {
        self.state
            .lock()
            .unwrap()
            .local_descriptions
            .push(description.clone());
        Ok(())
    }

    async fn apply_remote_description(
        &mut self,
        description: &SessionDescription,
    ) -> Result<(), MediaError> {
        let mut state = self.state.lock().unwrap();
        if state.fail_remote_description {
            return Err(MediaError::Engine("bad sdp".into()));
        }
        state.remote_descriptions.push(description.clone());
        Ok(())
    }

    async fn add_remote_candidate(&mut self, candidate: &IceCandidate) -> Result<(), MediaError> {
        self.state
            .lock()
            .unwrap()
            .remote_candidates
            .push(candidate.clone());
        Ok(())
    }

    fn add_local_media(&mut self, media: &MediaHandle) {
        self.state.lock().unwrap().local_media.push(media.clone());
    }

    fn create_data_channel(&mut self, label: &str) -> Result<(), MediaError> {
        self.state
            .lock()
            .unwrap()
            .data_channels
            .push(label.to_string());
        Ok(())
    }

    async fn send_data(&mut self, message: &str) -> Result<(), MediaError> {
        let mut state = self.state.lock().unwrap();
        if !state.data_channel_open {
            return Err(MediaError::Engine("data channel closed".into()));
        }
        state.sent_data.push(message.to_string());
        Ok(())
    }

    fn close_data_channel(&mut self) {
        let mut state = self.state.lock().unwrap();
        state.data_channel_open = false;
        state.data_channel_closes += 1;
    }

    fn set_muted(&mut self, kind: MediaKind, muted: bool) {
        self.state.lock().unwrap().muted.push((kind, muted));
    }

    fn has_remote_media(&self) -> bool {
        self.state.lock().unwrap().remote_media
    }

    fn is_active(&self) -> bool {
        let state = self.state.lock().unwrap();
        state.close_count == 0 && (state.remote_media || state.data_channel_open)
    }

    fn close(&mut self) {
        self.state.lock().unwrap().close_count += 1;
    }
}

/// Test-side view of a link created by [`MockLinkFactory`].
#[derive(Clone)]
pub struct MockLinkHandle {
    pub session_id: String,
    state: SharedLinkState,
    events: mpsc::UnboundedSender<LinkEvent>,
}

impl MockLinkHandle {
    pub fn state(&self) -> MutexGuard<'_, LinkState> {
        self.state.lock().unwrap()
    }

    pub fn emit(&self, event: LinkEvent) {
        let _ = self.events.send(event);
    }

    pub fn remote_media_arrives(&self) {
        self.state().remote_media = true;
        self.emit(LinkEvent::RemoteMediaAdded);
    }

    pub fn open_data_channel(&self) {
        self.state().data_channel_open = true;
        self.emit(LinkEvent::DataChannelOpen);
    }

    pub fn is_closed(&self) -> bool {
        self.state().close_count > 0
    }
}

#[derive(Default)]
pub struct MockLinkFactory {
    links: Mutex<Vec<MockLinkHandle>>,
    fail_remote_description: AtomicBool,
}

impl MockLinkFactory {
    pub fn failing_remote_description() -> Self {
        Self {
            fail_remote_description: AtomicBool::new(true),
            ..Default::default()
        }
    }

    pub fn last(&self) -> Option<MockLinkHandle> {
        self.links.lock().unwrap().last().cloned()
    }

    pub fn count(&self) -> usize {
        self.links.lock().unwrap().len()
    }
}

impl PeerLinkFactory for MockLinkFactory {
    fn create(
        &self,
        session_id: &str,
        events: mpsc::UnboundedSender<LinkEvent>,
    ) -> Box<dyn PeerLink> {
        let (link, state) = MockLink::new();
        state.lock().unwrap().fail_remote_description =
            self.fail_remote_description.load(Ordering::SeqCst);
        self.links.lock().unwrap().push(MockLinkHandle {
            session_id: session_id.to_string(),
            state,
            events,
        });
        Box::new(link)
    }
}

pub struct MockMediaSource {
    fail: Option<MediaError>,
    delay: Duration,
    acquired: AtomicUsize,
    released: AtomicUsize,
}

impl MockMediaSource {
    pub fn granting() -> Arc<Self> {
        Arc::new(Self {
            fail: None,
            delay: Duration::ZERO,
            acquired: AtomicUsize::new(0),
            released: AtomicUsize::new(0),
        })
    }

    pub fn denying() -> Arc<Self> {
        Arc::new(Self {
            fail: Some(MediaError::PermissionDenied("user said no".into())),
            delay: Duration::ZERO,
            acquired: AtomicUsize::new(0),
            released: AtomicUsize::new(0),
        })
    }

    /// Grants after `delay`, like a permission prompt the user sits on.
    pub fn slow(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            fail: None,
            delay,
            acquired: AtomicUsize::new(0),
            released: AtomicUsize::new(0),
        })
    }

    pub fn acquired(&self) -> usize {
        self.acquired.load(Ordering::SeqCst)
    }

    pub fn released(&self) -> usize {
        self.released.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MediaSource for MockMediaSource {
    async fn acquire_media(
        &self,
        constraints: &MediaConstraints,
    ) -> Result<MediaHandle, MediaError> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if let Some(err) = &self.fail {
            return Err(err.clone());
        }
        let n = self.acquired.fetch_add(1, Ordering::SeqCst);
        Ok(MediaHandle {
            id: format!("media-{n}"),
            audio: constraints.audio,
            video: constraints.video,
        })
    }

    fn release(&self, _handle: &MediaHandle) {
        self.released.fetch_add(1, Ordering::SeqCst);
    }
}

/// Collects every event and lets tests wait for specific call events.
pub struct EventCollector {
    events: Mutex<Vec<Event>>,
    tx: mpsc::UnboundedSender<Event>,
}

pub struct EventStream {
    rx: mpsc::UnboundedReceiver<Event>,
}

impl EventCollector {
    pub fn new() -> (Arc<Self>, EventStream) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                events: Mutex::new(Vec::new()),
                tx,
            }),
            EventStream { rx },
        )
    }

    pub fn call_events(&self, session_id: &str) -> Vec<CallEventKind> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter_map(|e| match e {
                Event::Call(call) if call.session_id == session_id => Some(call.kind.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn hangups(&self, session_id: &str) -> usize {
        self.call_events(session_id)
            .iter()
            .filter(|k| matches!(k, CallEventKind::Hangup { .. }))
            .count()
    }
}

impl EventHandler for EventCollector {
    fn handle_event(&self, event: &Event) {
        self.events.lock().unwrap().push(event.clone());
        let _ = self.tx.send(event.clone());
    }
}

impl EventStream {
    /// Wait for the first call event matching `pred`.
    pub async fn wait_for(&mut self, pred: impl Fn(&CallEventKind) -> bool) -> CallEventKind {
        loop {
            let event = tokio::time::timeout(WAIT, self.rx.recv())
                .await
                .expect("expected call event not emitted")
                .expect("event bus dropped");
            if let Event::Call(call) = event
                && pred(&call.kind)
            {
                return call.kind;
            }
        }
    }

    pub async fn wait_for_hangup(&mut self) -> (String, bool) {
        match self
            .wait_for(|k| matches!(k, CallEventKind::Hangup { .. }))
            .await
        {
            CallEventKind::Hangup {
                reason,
                sent_signal,
                ..
            } => (reason, sent_signal),
            _ => unreachable!(),
        }
    }
}

/// Hands incoming sessions to the test through a channel.
pub struct IncomingQueue {
    tx: mpsc::UnboundedSender<Call>,
    accept: bool,
}

impl IncomingQueue {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<Call>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Self { tx, accept: true }), rx)
    }

    pub fn refusing() -> Arc<Self> {
        let (tx, _rx) = mpsc::unbounded_channel();
        Arc::new(Self { tx, accept: false })
    }
}

impl IncomingSessionHandler for IncomingQueue {
    fn on_call(&self, call: Call) {
        let _ = self.tx.send(call);
    }

    fn on_direct_connection(&self, call: Call) {
        let _ = self.tx.send(call);
    }

    fn accepts(&self, _target: peerlink_core::Target) -> bool {
        self.accept
    }
}
