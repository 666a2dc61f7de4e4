mod signaling;

use crate::calls::{
    Call, CallContext, CallOptions, IncomingSessionHandler, MediaSource, PeerLinkFactory,
    SignalingChannel,
};
use crate::config::ClientConfig;
use crate::handshake::{self, HandshakeError, Registration};
use crate::request::{RequestError, ResponseWaiter};
use crate::transport::{Transport, TransportEvent, TransportFactory};
use chrono::Utc;
use dashmap::DashMap;
use log::{debug, error, info, warn};
use peerlink_core::Target;
use peerlink_core::types::events::{
    AuthorizationFailed, CallEventKind, Connected, Disconnected, Event, EventBus, EventHandler,
    Reconnected,
};
use peerlink_core::types::media::MediaConstraints;
use signaling::ClientChannel;
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use thiserror::Error;
use tokio::sync::{Mutex, Notify, mpsc};
use tokio::time::sleep;

pub const CLIENT_DISCONNECTED_REASON: &str = "client disconnected";

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("client is not connected")]
    NotConnected,
    #[error("client is already connected")]
    AlreadyConnected,
    #[error("connection registration failed: {0}")]
    Registration(#[from] HandshakeError),
    #[error("request failed: {0}")]
    Request(#[from] RequestError),
    #[error("transport error: {0}")]
    Transport(anyhow::Error),
}

/// Removes sessions from the registry once they have ended.
struct SessionReaper {
    sessions: Arc<DashMap<String, Call>>,
}

impl EventHandler for SessionReaper {
    fn handle_event(&self, event: &Event) {
        if let Event::Call(call_event) = event
            && matches!(call_event.kind, CallEventKind::Hangup { .. })
        {
            self.sessions.remove(&call_event.session_id);
        }
    }
}

pub struct Client {
    pub(crate) config: ClientConfig,

    pub(crate) is_connecting: AtomicBool,
    pub(crate) is_running: AtomicBool,
    pub(crate) is_connected: AtomicBool,
    pub(crate) shutdown_notifier: Notify,

    pub(crate) transport: Mutex<Option<Arc<dyn Transport>>>,
    pub(crate) transport_events: Mutex<Option<mpsc::Receiver<TransportEvent>>>,
    pub(crate) transport_factory: Arc<dyn TransportFactory>,

    pub(crate) response_waiters: Mutex<HashMap<String, ResponseWaiter>>,
    pub(crate) unique_id: String,
    pub(crate) id_counter: AtomicU64,

    registration: RwLock<Option<Registration>>,

    /// Live sessions by session id.
    pub(crate) sessions: Arc<DashMap<String, Call>>,
    /// Groups to re-join after a reconnect.
    pub(crate) groups: Mutex<BTreeSet<String>>,

    pub(crate) event_bus: EventBus,
    links: Arc<dyn PeerLinkFactory>,
    media: Arc<dyn MediaSource>,
    incoming: RwLock<Option<Arc<dyn IncomingSessionHandler>>>,
    signaling: Arc<dyn SignalingChannel>,

    pub(crate) expected_disconnect: AtomicBool,
    pub(crate) has_connected_before: AtomicBool,

    /// Incremented on each new connection. Background tasks of an older
    /// connection compare against it and bail out.
    pub(crate) connection_generation: AtomicU64,

    pub enable_auto_reconnect: AtomicBool,
}

impl Client {
    pub fn new(
        config: ClientConfig,
        transport_factory: Arc<dyn TransportFactory>,
        links: Arc<dyn PeerLinkFactory>,
        media: Arc<dyn MediaSource>,
    ) -> Arc<Self> {
        let unique_id_bytes: [u8; 2] = rand::random();
        let sessions = Arc::new(DashMap::new());
        let event_bus = EventBus::new();
        event_bus.add_internal_handler(Arc::new(SessionReaper {
            sessions: sessions.clone(),
        }));

        Arc::new_cyclic(|weak| Self {
            enable_auto_reconnect: AtomicBool::new(config.auto_reconnect),
            config,
            is_connecting: AtomicBool::new(false),
            is_running: AtomicBool::new(false),
            is_connected: AtomicBool::new(false),
            shutdown_notifier: Notify::new(),

            transport: Mutex::new(None),
            transport_events: Mutex::new(None),
            transport_factory,

            response_waiters: Mutex::new(HashMap::new()),
            unique_id: format!("{}.{}", unique_id_bytes[0], unique_id_bytes[1]),
            id_counter: AtomicU64::new(0),

            registration: RwLock::new(None),
            sessions,
            groups: Mutex::new(BTreeSet::new()),

            event_bus,
            links,
            media,
            incoming: RwLock::new(None),
            signaling: Arc::new(ClientChannel::new(weak.clone())),

            expected_disconnect: AtomicBool::new(false),
            has_connected_before: AtomicBool::new(false),
            connection_generation: AtomicU64::new(0),
        })
    }

    pub fn add_event_handler(&self, handler: Arc<dyn EventHandler>) {
        self.event_bus.add_handler(handler);
    }

    /// Without a handler, every incoming session is rejected.
    pub fn set_incoming_handler(&self, handler: Arc<dyn IncomingSessionHandler>) {
        *self.incoming.write().expect("RwLock should not be poisoned") = Some(handler);
    }

    pub fn is_connected(&self) -> bool {
        self.is_connected.load(Ordering::Relaxed)
    }

    pub fn connection_id(&self) -> Option<String> {
        self.registration
            .read()
            .expect("RwLock should not be poisoned")
            .as_ref()
            .map(|r| r.connection_id.clone())
    }

    pub fn endpoint_id(&self) -> Option<String> {
        self.registration
            .read()
            .expect("RwLock should not be poisoned")
            .as_ref()
            .map(|r| r.endpoint_id.clone())
    }

    /// Connects and processes frames until [`Client::disconnect`] is called or
    /// reconnecting is no longer allowed.
    pub async fn run(self: &Arc<Self>) {
        if self.is_running.swap(true, Ordering::SeqCst) {
            warn!("Client `run` method called while already running.");
            return;
        }
        self.has_connected_before.store(false, Ordering::Relaxed);
        let mut backoff = self.config.backoff();

        while self.is_running.load(Ordering::Relaxed) {
            self.expected_disconnect.store(false, Ordering::Relaxed);

            match self.connect().await {
                Ok(()) => {
                    backoff.reset();
                    if self.read_messages_loop().await.is_err() {
                        warn!("Message loop exited with an error. Will attempt to reconnect if enabled.");
                    } else if self.expected_disconnect.load(Ordering::Relaxed) {
                        debug!("Message loop exited gracefully (expected disconnect).");
                    } else {
                        info!("Message loop exited gracefully.");
                    }
                    self.cleanup_connection_state().await;
                }
                Err(e) => error!("Failed to connect: {e}"),
            }

            if !self.is_running.load(Ordering::Relaxed) {
                break;
            }
            if !self.enable_auto_reconnect.load(Ordering::Relaxed) {
                info!("Auto-reconnect disabled, shutting down.");
                self.is_running.store(false, Ordering::Relaxed);
                break;
            }

            let delay = backoff.next_delay();
            info!("Will attempt to reconnect in {delay:?}");
            tokio::select! {
                _ = sleep(delay) => {}
                _ = self.shutdown_notifier.notified() => {}
            }
        }
        info!("Client run loop has shut down.");
    }

    /// Opens the transport and registers the connection. Frames are only
    /// processed once the read loop in [`Client::run`] is running.
    pub(crate) async fn connect(self: &Arc<Self>) -> Result<(), ClientError> {
        if self.is_connecting.swap(true, Ordering::SeqCst) {
            return Err(ClientError::AlreadyConnected);
        }

        let _guard = scopeguard::guard((), |_| {
            self.is_connecting.store(false, Ordering::Relaxed);
        });

        if self.is_connected() {
            return Err(ClientError::AlreadyConnected);
        }

        info!("Connecting to {}", self.config.url);
        let (transport, mut transport_events) = self
            .transport_factory
            .create_transport()
            .await
            .map_err(ClientError::Transport)?;

        let registration = match handshake::register_connection(
            transport.clone(),
            &mut transport_events,
            self.generate_request_id(),
            self.config.request_timeout(),
        )
        .await
        {
            Ok(registration) => registration,
            Err(e) => {
                transport.disconnect().await;
                if matches!(e, HandshakeError::Unauthorized) {
                    self.handle_authorization_failure("connection registration refused");
                }
                return Err(e.into());
            }
        };

        *self.registration.write().expect("RwLock should not be poisoned") =
            Some(registration.clone());
        *self.transport.lock().await = Some(transport);
        *self.transport_events.lock().await = Some(transport_events);
        self.is_connected.store(true, Ordering::Relaxed);
        let generation = self.connection_generation.fetch_add(1, Ordering::SeqCst) + 1;

        let client_clone = self.clone();
        tokio::spawn(async move { client_clone.keepalive_loop(generation).await });

        if self.has_connected_before.swap(true, Ordering::SeqCst) {
            let client_clone = self.clone();
            tokio::spawn(async move {
                client_clone
                    .finish_reconnect(generation, registration)
                    .await
            });
        } else {
            self.event_bus.dispatch(&Event::Connected(Connected {
                connection_id: registration.connection_id,
                endpoint_id: registration.endpoint_id,
                at: Utc::now(),
            }));
        }

        Ok(())
    }

    /// Re-joins groups over the new connection, then announces it. If the
    /// groups cannot be re-joined the transport is dropped so the run loop
    /// tries again.
    async fn finish_reconnect(self: Arc<Self>, generation: u64, registration: Registration) {
        let result = self.rejoin_groups().await;
        if self.connection_generation.load(Ordering::SeqCst) != generation {
            debug!("Connection changed while re-joining groups, skipping reconnect event.");
            return;
        }
        match result {
            Ok(rejoined_groups) => {
                info!("Reconnected, re-joined {rejoined_groups} groups");
                self.event_bus.dispatch(&Event::Reconnected(Reconnected {
                    connection_id: registration.connection_id,
                    endpoint_id: registration.endpoint_id,
                    rejoined_groups,
                    at: Utc::now(),
                }));
            }
            Err(e) => {
                error!("Failed to re-join groups after reconnect: {e}");
                let transport = self.transport.lock().await.clone();
                if let Some(transport) = transport {
                    transport.disconnect().await;
                }
            }
        }
    }

    /// Stops the client. Live sessions are hung up, pending requests fail and
    /// no reconnect follows.
    pub async fn disconnect(&self) {
        info!("Disconnecting client intentionally.");
        self.expected_disconnect.store(true, Ordering::Relaxed);
        self.is_running.store(false, Ordering::Relaxed);
        self.has_connected_before.store(false, Ordering::Relaxed);

        let calls: Vec<Call> = self.sessions.iter().map(|e| e.value().clone()).collect();
        for call in calls {
            call.hangup(Some(CLIENT_DISCONNECTED_REASON)).await;
        }
        self.sessions.clear();

        let was_connected = self.is_connected();
        self.shutdown_notifier.notify_waiters();
        let transport = self.transport.lock().await.clone();
        if let Some(transport) = transport {
            transport.disconnect().await;
        }
        self.cleanup_connection_state().await;

        if was_connected {
            self.event_bus
                .dispatch(&Event::Disconnected(Disconnected {
                    will_reconnect: false,
                }));
        }
    }

    async fn cleanup_connection_state(&self) {
        self.is_connected.store(false, Ordering::Relaxed);
        *self.transport.lock().await = None;
        *self.transport_events.lock().await = None;
        *self.registration.write().expect("RwLock should not be poisoned") = None;
        self.fail_pending_requests().await;
    }

    async fn read_messages_loop(self: &Arc<Self>) -> Result<(), anyhow::Error> {
        info!(target: "Client", "Starting message processing loop...");

        let mut rx_guard = self.transport_events.lock().await;
        let mut transport_events = rx_guard
            .take()
            .ok_or_else(|| anyhow::anyhow!("Cannot start message loop: not connected"))?;
        drop(rx_guard);

        loop {
            tokio::select! {
                biased;
                _ = self.shutdown_notifier.notified() => {
                    info!(target: "Client", "Shutdown signaled in message loop. Exiting message loop.");
                    return Ok(());
                },
                event = transport_events.recv() => {
                    match event {
                        Some(TransportEvent::FrameReceived(text)) => {
                            self.handle_frame(&text).await;
                        }
                        Some(TransportEvent::Connected) => {
                            debug!("Transport connected event received");
                        }
                        Some(TransportEvent::Disconnected) | None => {
                            self.cleanup_connection_state().await;
                            if self.expected_disconnect.load(Ordering::Relaxed) {
                                info!("Transport disconnected as expected.");
                                return Ok(());
                            }
                            let will_reconnect = self.is_running.load(Ordering::Relaxed)
                                && self.enable_auto_reconnect.load(Ordering::Relaxed);
                            self.event_bus.dispatch(&Event::Disconnected(Disconnected { will_reconnect }));
                            info!("Transport disconnected unexpectedly.");
                            return Err(anyhow::anyhow!("Transport disconnected unexpectedly"));
                        }
                    }
                }
            }
        }
    }

    /// The server refused our credentials. Retrying would fail the same way,
    /// so reconnecting stops here.
    pub(crate) fn handle_authorization_failure(&self, message: &str) {
        error!("Authorization failed: {message}");
        self.enable_auto_reconnect.store(false, Ordering::Relaxed);
        self.event_bus
            .dispatch(&Event::AuthorizationFailed(AuthorizationFailed {
                message: message.to_string(),
            }));
    }

    pub(crate) fn call_context(&self) -> CallContext {
        CallContext {
            signaling: self.signaling.clone(),
            links: self.links.clone(),
            media: self.media.clone(),
            events: self.event_bus.clone(),
            incoming: self
                .incoming
                .read()
                .expect("RwLock should not be poisoned")
                .clone(),
            config: self.config.calls.clone(),
        }
    }

    /// Sessions that end before they reach the registry are not kept.
    pub(crate) fn register_session(&self, call: &Call) {
        self.sessions
            .insert(call.session_id().to_string(), call.clone());
        if call.is_terminated() {
            self.sessions.remove(call.session_id());
        }
    }

    fn start_session(
        &self,
        endpoint_id: &str,
        target: Target,
        options: CallOptions,
    ) -> Result<Call, ClientError> {
        if !self.is_connected() {
            return Err(ClientError::NotConnected);
        }
        let call = Call::outgoing(self.call_context(), endpoint_id, target, options);
        info!("Starting {target:?} session {} to {endpoint_id}", call.session_id());
        self.register_session(&call);
        Ok(call)
    }

    /// Calls `endpoint_id`. Every connection of that endpoint is offered the
    /// call; the first to answer wins.
    pub fn call(&self, endpoint_id: &str, options: CallOptions) -> Result<Call, ClientError> {
        self.start_session(endpoint_id, Target::Call, options)
    }

    /// Opens a data-only session to `endpoint_id`.
    pub fn start_direct_connection(&self, endpoint_id: &str) -> Result<Call, ClientError> {
        self.start_session(
            endpoint_id,
            Target::DirectConnection,
            CallOptions {
                constraints: MediaConstraints::none(),
                ..Default::default()
            },
        )
    }

    pub fn get_call(&self, session_id: &str) -> Option<Call> {
        self.sessions.get(session_id).map(|e| e.value().clone())
    }

    /// Sessions that have not ended yet.
    pub fn calls(&self) -> Vec<Call> {
        self.sessions
            .iter()
            .map(|e| e.value().clone())
            .filter(|call| !call.is_terminated())
            .collect()
    }
}
