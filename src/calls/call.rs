//! Session orchestration.
//!
//! Every session runs as its own task that exclusively owns the state
//! machine, the negotiator (and through it the peer link) and the session's
//! timers. [`Call`] is a cheap clonable handle that talks to that task over a
//! command channel. State changes are published on a watch channel, so queries
//! never wait on the task.
//!
//! Inside the task, events are processed strictly one after another: an
//! action that needs a follow-up event pushes it onto a queue that is drained
//! after the current transition completes.

use super::direct::DirectChannel;
use super::error::{CallError, NegotiationError};
use super::media::{LinkEvent, MediaError, MediaHandle, MediaSource, PeerLinkFactory};
use super::negotiator::{
    CandidateFilter, ModifyOutcome, ModifyRequest, OutcomeReceiver, OutcomeSender, PeerNegotiator,
};
use super::signaling::SignalingChannel;
use super::state::{
    AnsweringState, CallState, CallStateMachine, GuardInput, NegotiatingState, StateAction,
    StateEvent, TimerKind, Transition,
};
use crate::config::CallConfig;
use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use peerlink_core::envelope::SessionDescription;
use peerlink_core::types::events::{CallEvent, CallEventKind, Event, EventBus};
use peerlink_core::types::media::{MediaConstraints, MediaKind};
use peerlink_core::{SignalEnvelope, SignalType, Target};
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

type Reply<T> = oneshot::Sender<Result<T, CallError>>;

/// Options for starting an outgoing session.
#[derive(Debug, Clone, Copy, Default)]
pub struct CallOptions {
    pub constraints: MediaConstraints,
    /// Stop after local media is acquired until [`Call::approve`] is called.
    pub preview: bool,
    /// Do not acquire local media.
    pub receive_only: bool,
    pub send_only: bool,
}

/// Options for answering an incoming session.
#[derive(Debug, Clone, Copy, Default)]
pub struct AnswerOptions {
    /// Overrides the media the remote offer asked for.
    pub constraints: Option<MediaConstraints>,
    pub preview: bool,
    pub receive_only: bool,
    pub send_only: bool,
}

impl From<CallOptions> for AnswerOptions {
    fn from(options: CallOptions) -> Self {
        Self {
            constraints: Some(options.constraints),
            preview: options.preview,
            receive_only: options.receive_only,
            send_only: options.send_only,
        }
    }
}

/// Receives sessions started by remote parties.
///
/// Called from the session's own task: implementations must not block, and
/// must not await the handle's methods inline. Spawn a task instead.
pub trait IncomingSessionHandler: Send + Sync {
    fn on_call(&self, call: Call);

    fn on_direct_connection(&self, call: Call) {
        let _ = call;
    }

    /// Sessions of a target nobody accepts are rejected right away.
    fn accepts(&self, target: Target) -> bool {
        target == Target::Call
    }
}

/// Collaborators shared by every session of a client.
#[derive(Clone)]
pub struct CallContext {
    pub signaling: Arc<dyn SignalingChannel>,
    pub links: Arc<dyn PeerLinkFactory>,
    pub media: Arc<dyn MediaSource>,
    pub events: EventBus,
    pub incoming: Option<Arc<dyn IncomingSessionHandler>>,
    pub config: CallConfig,
}

/// Point-in-time view of a session.
#[derive(Debug, Clone)]
pub struct CallSnapshot {
    pub state: CallState,
    /// Current role. Flips when the remote side starts a renegotiation.
    pub caller: bool,
    pub connection_id: Option<String>,
    pub has_media: bool,
    pub is_active: bool,
    pub audio_muted: bool,
    pub video_muted: bool,
    pub hangup_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub connected_at: Option<DateTime<Utc>>,
}

/// Resolves once the operation it belongs to is accepted or rejected. Never
/// stays pending past the end of its session.
#[derive(Debug)]
pub struct Outcome {
    rx: OutcomeReceiver,
}

impl Outcome {
    fn new(rx: OutcomeReceiver) -> Self {
        Self { rx }
    }
}

impl Future for Outcome {
    type Output = Result<(), CallError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx).poll(cx).map(|result| {
            result.unwrap_or_else(|_| Err(CallError::Terminated("session closed".into())))
        })
    }
}

enum Command {
    Signal(SignalEnvelope),
    Answer(AnswerOptions, Reply<()>),
    Approve(Reply<()>),
    Reject(Reply<()>),
    Hangup(String, oneshot::Sender<()>),
    Modify(ModifyRequest, Reply<OutcomeReceiver>),
    SendMessage(String, Reply<()>),
    Mute(MediaKind, bool, Reply<()>),
    MediaReady(OutcomeSender),
    MediaAcquired {
        round: u64,
        constraints: MediaConstraints,
        result: Result<MediaHandle, MediaError>,
    },
    TimerFired(TimerKind, u64),
}

/// Handle to one session.
#[derive(Clone, Debug)]
pub struct Call {
    session_id: String,
    target: Target,
    remote_endpoint: String,
    commands: mpsc::UnboundedSender<Command>,
    snapshot: watch::Receiver<CallSnapshot>,
}

fn new_session_id() -> String {
    let hex = format!("{:032x}", rand::random::<u128>());
    format!(
        "{}-{}-{}-{}-{}",
        &hex[0..8],
        &hex[8..12],
        &hex[12..16],
        &hex[16..20],
        &hex[20..]
    )
}

impl Call {
    /// Start a session towards `remote_endpoint`.
    pub(crate) fn outgoing(
        ctx: CallContext,
        remote_endpoint: &str,
        target: Target,
        options: CallOptions,
    ) -> Call {
        let constraints = options.constraints;
        spawn_session(
            ctx,
            Setup {
                session_id: new_session_id(),
                target,
                remote_endpoint: remote_endpoint.to_string(),
                connection_id: None,
                caller: true,
                answer: options.into(),
                constraints,
            },
        )
    }

    /// Create the callee side of a session from its initiating offer.
    pub(crate) fn incoming(ctx: CallContext, offer: SignalEnvelope, remote_endpoint: String) -> Call {
        let call = spawn_session(
            ctx,
            Setup {
                session_id: offer.session_id.clone(),
                target: offer.target,
                remote_endpoint,
                connection_id: offer.from_connection.clone(),
                caller: false,
                answer: AnswerOptions::default(),
                constraints: MediaConstraints::default(),
            },
        );
        call.deliver(offer);
        call
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn target(&self) -> Target {
        self.target
    }

    pub fn remote_endpoint(&self) -> &str {
        &self.remote_endpoint
    }

    pub fn snapshot(&self) -> CallSnapshot {
        self.snapshot.borrow().clone()
    }

    /// Subscribe to snapshot changes.
    pub fn watch(&self) -> watch::Receiver<CallSnapshot> {
        self.snapshot.clone()
    }

    pub fn state(&self) -> CallState {
        self.snapshot.borrow().state
    }

    pub fn is_caller(&self) -> bool {
        self.snapshot.borrow().caller
    }

    pub fn connection_id(&self) -> Option<String> {
        self.snapshot.borrow().connection_id.clone()
    }

    /// Remote media or an open direct connection is flowing.
    pub fn has_media(&self) -> bool {
        self.snapshot.borrow().has_media
    }

    pub fn is_active(&self) -> bool {
        self.snapshot.borrow().is_active
    }

    pub fn is_terminated(&self) -> bool {
        self.snapshot.borrow().state.is_terminated()
    }

    /// Wait until the session ends. Returns the hangup reason.
    pub async fn terminated(&self) -> String {
        let mut rx = self.snapshot.clone();
        let _ = rx.wait_for(|s| s.state.is_terminated()).await;
        let reason = rx.borrow().hangup_reason.clone();
        reason.unwrap_or_else(|| "none".to_string())
    }

    /// Hand an inbound envelope to the session. Returns false once the
    /// session is gone.
    pub(crate) fn deliver(&self, envelope: SignalEnvelope) -> bool {
        self.commands.send(Command::Signal(envelope)).is_ok()
    }

    fn closed_error(&self) -> CallError {
        CallError::Terminated(
            self.snapshot
                .borrow()
                .hangup_reason
                .clone()
                .unwrap_or_else(|| "none".to_string()),
        )
    }

    async fn request<T>(&self, make: impl FnOnce(Reply<T>) -> Command) -> Result<T, CallError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(make(tx))
            .map_err(|_| self.closed_error())?;
        rx.await.map_err(|_| self.closed_error())?
    }

    pub async fn answer(&self, options: AnswerOptions) -> Result<(), CallError> {
        self.request(|tx| Command::Answer(options, tx)).await
    }

    /// Proceed with the local media acquired for preview.
    pub async fn approve(&self) -> Result<(), CallError> {
        self.request(Command::Approve).await
    }

    /// Decline the session, or the renegotiation in progress if media is
    /// already flowing.
    pub async fn reject(&self) -> Result<(), CallError> {
        self.request(Command::Reject).await
    }

    /// End the session. Safe to call any number of times, from any state.
    pub async fn hangup(&self, reason: Option<&str>) {
        let (tx, rx) = oneshot::channel();
        let reason = reason.unwrap_or("user hangup").to_string();
        if self.commands.send(Command::Hangup(reason, tx)).is_ok() {
            let _ = rx.await;
        }
    }

    async fn modify(&self, request: ModifyRequest) -> Result<Outcome, CallError> {
        self.request(|tx| Command::Modify(request, tx))
            .await
            .map(Outcome::new)
    }

    /// Renegotiate with new media. The returned outcome resolves when the
    /// remote party accepts or rejects.
    pub async fn add_media(&self, constraints: MediaConstraints) -> Result<Outcome, CallError> {
        self.modify(ModifyRequest {
            constraints: Some(constraints),
            direct_connection: None,
        })
        .await
    }

    pub async fn add_direct_connection(&self) -> Result<Outcome, CallError> {
        self.modify(ModifyRequest {
            constraints: None,
            direct_connection: Some(true),
        })
        .await
    }

    pub async fn remove_direct_connection(&self) -> Result<Outcome, CallError> {
        self.modify(ModifyRequest {
            constraints: None,
            direct_connection: Some(false),
        })
        .await
    }

    pub async fn send_message(&self, message: impl Into<String>) -> Result<(), CallError> {
        let message = message.into();
        self.request(|tx| Command::SendMessage(message, tx)).await
    }

    pub async fn set_muted(&self, kind: MediaKind, muted: bool) -> Result<(), CallError> {
        self.request(|tx| Command::Mute(kind, muted, tx)).await
    }

    /// Resolves once local media is available, or right away for sessions
    /// that never acquire any.
    pub fn local_media_ready(&self) -> Outcome {
        let (tx, rx) = oneshot::channel();
        let _ = self.commands.send(Command::MediaReady(tx));
        Outcome::new(rx)
    }
}

struct Setup {
    session_id: String,
    target: Target,
    remote_endpoint: String,
    connection_id: Option<String>,
    caller: bool,
    answer: AnswerOptions,
    constraints: MediaConstraints,
}

fn spawn_session(ctx: CallContext, setup: Setup) -> Call {
    let (commands_tx, commands_rx) = mpsc::unbounded_channel();
    let (link_tx, link_rx) = mpsc::unbounded_channel();

    let mut machine = CallStateMachine::new(setup.caller, setup.target == Target::DirectConnection);
    machine.set_receive_only(setup.answer.receive_only);

    let negotiator = PeerNegotiator::new(
        setup.session_id.clone(),
        setup.target,
        setup.remote_endpoint.clone(),
        setup.connection_id.clone(),
        ctx.signaling.clone(),
        CandidateFilter {
            force_turn: ctx.config.force_turn,
            disable_turn: ctx.config.disable_turn,
        },
    );

    let created_at = Utc::now();
    let (snapshot_tx, snapshot_rx) = watch::channel(CallSnapshot {
        state: CallState::Idle,
        caller: setup.caller,
        connection_id: setup.connection_id,
        has_media: false,
        is_active: false,
        audio_muted: false,
        video_muted: false,
        hangup_reason: None,
        created_at,
        connected_at: None,
    });

    let handle = Call {
        session_id: setup.session_id.clone(),
        target: setup.target,
        remote_endpoint: setup.remote_endpoint.clone(),
        commands: commands_tx,
        snapshot: snapshot_rx,
    };

    let actor = CallActor {
        session_id: setup.session_id,
        target: setup.target,
        ctx,
        handle: handle.clone(),
        machine,
        negotiator: Some(negotiator),
        direct: None,
        link_tx,
        pending: VecDeque::new(),
        timers: HashMap::new(),
        timer_generation: 0,
        answer: setup.answer,
        constraints: setup.constraints,
        media: None,
        media_constraints: None,
        media_round: 0,
        media_waiters: Vec::new(),
        saved_offer: None,
        remote_modify_direct: None,
        prepared: false,
        audio_muted: false,
        video_muted: false,
        connected_at: None,
        snapshot_tx,
    };
    tokio::spawn(actor.run(commands_rx, link_rx));
    handle
}

struct CallActor {
    session_id: String,
    target: Target,
    ctx: CallContext,
    handle: Call,
    machine: CallStateMachine,
    /// Taken on teardown.
    negotiator: Option<PeerNegotiator>,
    direct: Option<DirectChannel>,
    link_tx: mpsc::UnboundedSender<LinkEvent>,
    pending: VecDeque<StateEvent>,
    timers: HashMap<TimerKind, (u64, JoinHandle<()>)>,
    timer_generation: u64,
    answer: AnswerOptions,
    constraints: MediaConstraints,
    media: Option<MediaHandle>,
    media_constraints: Option<MediaConstraints>,
    /// Bumped per acquisition; late results of older rounds are discarded.
    media_round: u64,
    media_waiters: Vec<OutcomeSender>,
    saved_offer: Option<SessionDescription>,
    remote_modify_direct: Option<bool>,
    prepared: bool,
    audio_muted: bool,
    video_muted: bool,
    connected_at: Option<DateTime<Utc>>,
    snapshot_tx: watch::Sender<CallSnapshot>,
}

impl CallActor {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut link_events: mpsc::UnboundedReceiver<LinkEvent>,
    ) {
        let accepts_incoming = self.machine.is_caller()
            || self
                .ctx
                .incoming
                .as_ref()
                .is_some_and(|h| h.accepts(self.target));
        if !accepts_incoming {
            let error = CallError::NoHandler(self.target);
            info!(target: "Call/Session", "Rejecting {}: {error}", self.session_id);
            self.emit(CallEventKind::Error {
                message: error.to_string(),
            });
        }
        if let Err(e) = self.dispatch(StateEvent::Initiate { accepts_incoming }).await {
            warn!(target: "Call/Session", "Could not initiate {}: {e}", self.session_id);
        }

        while !self.machine.is_terminated() {
            tokio::select! {
                Some(command) = commands.recv() => self.handle_command(command).await,
                Some(event) = link_events.recv() => self.handle_link_event(event).await,
                else => break,
            }
            self.drain_pending().await;
            self.publish();
        }
        debug!(target: "Call/Session", "Session {} finished", self.session_id);
    }

    fn emit(&self, kind: CallEventKind) {
        self.ctx.events.dispatch(&Event::Call(CallEvent {
            session_id: self.session_id.clone(),
            target: self.target,
            kind,
        }));
    }

    fn has_media(&self) -> bool {
        let remote = self
            .negotiator
            .as_ref()
            .and_then(|n| n.link())
            .is_some_and(|link| link.has_remote_media());
        remote || self.direct.as_ref().is_some_and(|d| d.is_open())
    }

    fn guard_input(&self) -> GuardInput {
        GuardInput {
            has_media: self.has_media(),
        }
    }

    fn publish(&self) {
        let is_active = self
            .negotiator
            .as_ref()
            .and_then(|n| n.link())
            .is_some_and(|link| link.is_active());
        let connection_id = self
            .negotiator
            .as_ref()
            .and_then(|n| n.connection_id().map(str::to_string));
        let has_media = self.has_media();
        self.snapshot_tx.send_modify(|snapshot| {
            snapshot.state = self.machine.state();
            snapshot.caller = self.machine.is_caller();
            if connection_id.is_some() {
                snapshot.connection_id = connection_id;
            }
            snapshot.has_media = has_media;
            snapshot.is_active = is_active;
            snapshot.audio_muted = self.audio_muted;
            snapshot.video_muted = self.video_muted;
            snapshot.hangup_reason = self.machine.hangup_reason().map(str::to_string);
            snapshot.connected_at = self.connected_at;
        });
    }

    /// Dispatch one event and everything it queues. The result is that of
    /// `event` itself.
    async fn dispatch(&mut self, event: StateEvent) -> Result<(), CallError> {
        let input = self.guard_input();
        let result = match self.machine.dispatch(event, input) {
            Ok(transition) => {
                self.apply(transition).await;
                Ok(())
            }
            Err(e) => {
                debug!(target: "Call/Session", "{}: {e}", self.session_id);
                Err(e.into())
            }
        };
        self.drain_pending().await;
        result
    }

    async fn drain_pending(&mut self) {
        while let Some(event) = self.pending.pop_front() {
            let input = self.guard_input();
            match self.machine.dispatch(event, input) {
                Ok(transition) => self.apply(transition).await,
                Err(e) => debug!(target: "Call/Session", "{}: {e}", self.session_id),
            }
        }
    }

    async fn apply(&mut self, transition: Transition) {
        if transition.changed() {
            debug!(
                target: "Call/Session",
                "{} {} -> {}", self.session_id, transition.from, transition.to
            );
        }
        for action in transition.actions {
            match action {
                StateAction::StartTimer(kind) => self.start_timer(kind),
                StateAction::ClearTimer(kind) => self.clear_timer(kind),
                StateAction::AutoApprove => {
                    self.pending.push_back(StateEvent::Approve { preview: false })
                }
                StateAction::ReplayAnswer => self.pending.push_back(StateEvent::Answer {
                    preview: self.answer.preview,
                }),
                StateAction::Exited(_) => {}
                StateAction::Entered(state) => {
                    self.publish();
                    self.on_enter(state).await;
                }
                StateAction::Terminate { reason, signal } => self.teardown(reason, signal).await,
            }
        }
    }

    async fn on_enter(&mut self, state: CallState) {
        match state {
            CallState::Negotiating(NegotiatingState::Preparing) => self.enter_preparing(),
            CallState::Negotiating(NegotiatingState::Answering(
                AnsweringState::ApprovingDeviceAccess,
            )) => self.request_media(),
            CallState::Negotiating(NegotiatingState::Offering) => self.send_offer().await,
            CallState::Negotiating(NegotiatingState::Connecting) => {
                self.process_saved_offer().await
            }
            CallState::Connected => {
                if self.connected_at.is_none() {
                    self.connected_at = Some(Utc::now());
                }
            }
            _ => {}
        }
    }

    fn enter_preparing(&mut self) {
        let first = !self.prepared;
        self.prepared = true;
        let caller = self.machine.is_caller();

        if let Some(negotiator) = self.negotiator.as_mut() {
            if first {
                negotiator.init(self.ctx.links.as_ref(), self.link_tx.clone());
                if let Ok(link) = negotiator.link_mut() {
                    link.set_direction(!self.answer.receive_only, !self.answer.send_only);
                }
            } else {
                negotiator.reset_round();
                self.saved_offer = None;
            }
        }

        if self.machine.flags().need_direct_connection && self.direct.is_none() {
            let channel = DirectChannel::default();
            if caller
                && let Some(negotiator) = self.negotiator.as_mut()
                && let Ok(link) = negotiator.link_mut()
                && let Err(e) = channel.create_on(link)
            {
                warn!(target: "Call/Session", "Could not create data channel for {}: {e}", self.session_id);
            }
            self.direct = Some(channel);
        }

        if first && !caller {
            self.notify_incoming();
        }
        if caller {
            self.pending.push_back(StateEvent::Answer {
                preview: self.answer.preview,
            });
        }
    }

    fn notify_incoming(&self) {
        let Some(handler) = self.ctx.incoming.clone() else {
            return;
        };
        match self.target {
            Target::Call => handler.on_call(self.handle.clone()),
            Target::DirectConnection => handler.on_direct_connection(self.handle.clone()),
        }
    }

    fn timer_duration(&self, kind: TimerKind) -> std::time::Duration {
        match kind {
            TimerKind::LocalAnswer => self.ctx.config.local_answer_timeout(),
            TimerKind::ReceiveAnswer => self.ctx.config.answer_timeout(),
            TimerKind::Connection => self.ctx.config.connection_timeout(),
            TimerKind::Modify => self.ctx.config.modify_timeout(),
        }
    }

    fn start_timer(&mut self, kind: TimerKind) {
        self.clear_timer(kind);
        self.timer_generation += 1;
        let generation = self.timer_generation;
        let duration = self.timer_duration(kind);
        let commands = self.handle.commands.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep(duration).await;
            let _ = commands.send(Command::TimerFired(kind, generation));
        });
        self.timers.insert(kind, (generation, task));
    }

    fn clear_timer(&mut self, kind: TimerKind) {
        if let Some((_, task)) = self.timers.remove(&kind) {
            task.abort();
        }
    }

    async fn on_timer(&mut self, kind: TimerKind, generation: u64) {
        match self.timers.get(&kind) {
            Some((current, _)) if *current == generation => {}
            _ => return,
        }
        self.timers.remove(&kind);
        info!(target: "Call/Session", "{}: {}", self.session_id, kind.reason());

        if kind == TimerKind::Modify
            && let Some(negotiator) = self.negotiator.as_mut()
            && negotiator.has_pending_modify()
        {
            negotiator.fail_pending_modify(NegotiationError::ModifyTimedOut.into());
            self.emit(CallEventKind::ModifyRejected {
                reason: kind.reason().to_string(),
            });
        }
        let _ = self
            .dispatch(StateEvent::Reject {
                reason: Some(kind.reason().to_string()),
            })
            .await;
    }

    fn request_media(&mut self) {
        self.media_round += 1;
        let round = self.media_round;
        let constraints = self.constraints;
        self.emit(CallEventKind::RequestingMedia);

        if let Some(handle) = self.media.clone()
            && self.media_constraints == Some(constraints)
        {
            let _ = self.handle.commands.send(Command::MediaAcquired {
                round,
                constraints,
                result: Ok(handle),
            });
            return;
        }

        let source = self.ctx.media.clone();
        let commands = self.handle.commands.clone();
        tokio::spawn(async move {
            let result = source.acquire_media(&constraints).await;
            let sent = commands.send(Command::MediaAcquired {
                round,
                constraints,
                result,
            });
            // The session ended while the user was being asked.
            if let Err(mpsc::error::SendError(Command::MediaAcquired {
                result: Ok(handle),
                ..
            })) = sent
            {
                source.release(&handle);
            }
        });
    }

    async fn on_media_acquired(
        &mut self,
        round: u64,
        constraints: MediaConstraints,
        result: Result<MediaHandle, MediaError>,
    ) {
        if round != self.media_round {
            if let Ok(handle) = &result
                && self.media.as_ref() != Some(handle)
            {
                self.ctx.media.release(handle);
            }
            return;
        }

        match result {
            Ok(handle) => {
                let fresh = self.media.as_ref().is_none_or(|m| m.id != handle.id);
                if fresh {
                    if let Some(negotiator) = self.negotiator.as_mut()
                        && let Ok(link) = negotiator.link_mut()
                    {
                        link.add_local_media(&handle);
                    }
                    if let Some(old) = self.media.replace(handle) {
                        self.ctx.media.release(&old);
                    }
                    self.media_constraints = Some(constraints);
                }
                self.emit(CallEventKind::LocalMedia);
                for waiter in self.media_waiters.drain(..) {
                    let _ = waiter.send(Ok(()));
                }
                if self.answer.preview {
                    let _ = self.dispatch(StateEvent::Approve { preview: true }).await;
                }
                let _ = self.dispatch(StateEvent::ReceiveLocalMedia).await;
            }
            Err(e) => {
                warn!(target: "Call/Session", "Media request failed for {}: {e}", self.session_id);
                self.emit(CallEventKind::Error {
                    message: e.to_string(),
                });
                for waiter in self.media_waiters.drain(..) {
                    let _ = waiter.send(Err(CallError::Media(e.clone())));
                }
                let reason = Some(format!("media request failed: {e}"));
                let event = if self.has_media() {
                    StateEvent::Reject { reason }
                } else {
                    StateEvent::Hangup {
                        signal: None,
                        reason,
                    }
                };
                let _ = self.dispatch(event).await;
            }
        }
    }

    /// Report a negotiation failure and end the session. A failed send means
    /// the transport is unusable, so no hangup is attempted.
    fn fail(&mut self, error: CallError) {
        warn!(target: "Call/Session", "Session {} failed: {error}", self.session_id);
        self.emit(CallEventKind::Error {
            message: error.to_string(),
        });
        let signal = matches!(error, CallError::Signaling(_)).then_some(false);
        self.pending.push_back(StateEvent::Hangup {
            signal,
            reason: Some(error.to_string()),
        });
    }

    async fn send_offer(&mut self) {
        let Some(negotiator) = self.negotiator.as_mut() else {
            return;
        };
        match negotiator.create_offer().await {
            Ok(()) => self.pending.push_back(StateEvent::SentOffer),
            Err(e) => self.fail(e),
        }
    }

    async fn process_saved_offer(&mut self) {
        if self.machine.is_caller() {
            return;
        }
        let Some(offer) = self.saved_offer.take() else {
            return;
        };
        let Some(negotiator) = self.negotiator.as_mut() else {
            return;
        };
        if let Err(e) = negotiator.process_offer(&offer).await {
            self.fail(e);
        }
    }

    async fn teardown(&mut self, reason: String, signal: Option<bool>) {
        self.pending.clear();
        for kind in TimerKind::ALL {
            self.clear_timer(kind);
        }
        if let Some(media) = self.media.take() {
            self.ctx.media.release(&media);
        }
        self.close_direct_channel();

        let caller = self.machine.is_caller();
        let sent_signal = match self.negotiator.take() {
            Some(negotiator) => negotiator.close(signal, caller, &reason).await,
            None => false,
        };

        for waiter in self.media_waiters.drain(..) {
            let _ = waiter.send(Err(CallError::Terminated(reason.clone())));
        }

        let duration_secs = self
            .connected_at
            .map(|at| (Utc::now() - at).num_seconds());
        info!(target: "Call/Session", "Session {} ended: {reason}", self.session_id);
        self.publish();
        self.emit(CallEventKind::Hangup {
            reason,
            sent_signal,
            duration_secs,
        });
    }

    fn close_direct_channel(&mut self) {
        let Some(channel) = self.direct.as_mut() else {
            return;
        };
        let link = self.negotiator.as_mut().and_then(|n| n.link_mut().ok());
        if channel.close(link) {
            self.emit(CallEventKind::DirectConnectionClosed);
        }
        self.direct = None;
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Signal(envelope) => self.handle_signal(envelope).await,
            Command::Answer(options, reply) => {
                let result = self.answer(options).await;
                let _ = reply.send(result);
            }
            Command::Approve(reply) => {
                self.emit(CallEventKind::Approve);
                let result = self.dispatch(StateEvent::Approve { preview: false }).await;
                let _ = reply.send(result);
            }
            Command::Reject(reply) => {
                let result = self
                    .dispatch(StateEvent::Reject {
                        reason: Some("call rejected".to_string()),
                    })
                    .await;
                let _ = reply.send(result);
            }
            Command::Hangup(reason, done) => {
                let _ = self
                    .dispatch(StateEvent::Hangup {
                        signal: None,
                        reason: Some(reason),
                    })
                    .await;
                let _ = done.send(());
            }
            Command::Modify(request, reply) => {
                let result = self.start_modify(request).await;
                let _ = reply.send(result);
            }
            Command::SendMessage(message, reply) => {
                let result = self.send_message(&message).await;
                let _ = reply.send(result);
            }
            Command::Mute(kind, muted, reply) => {
                self.set_muted(kind, muted);
                let _ = reply.send(Ok(()));
            }
            Command::MediaReady(waiter) => {
                let needs_none = self.answer.receive_only || self.target == Target::DirectConnection;
                if self.media.is_some() || needs_none {
                    let _ = waiter.send(Ok(()));
                } else {
                    self.media_waiters.push(waiter);
                }
            }
            Command::MediaAcquired {
                round,
                constraints,
                result,
            } => self.on_media_acquired(round, constraints, result).await,
            Command::TimerFired(kind, generation) => self.on_timer(kind, generation).await,
        }
    }

    async fn answer(&mut self, options: AnswerOptions) -> Result<(), CallError> {
        self.answer = options;
        if let Some(constraints) = options.constraints {
            self.constraints = constraints;
        }
        self.machine.set_receive_only(options.receive_only);
        if let Some(negotiator) = self.negotiator.as_mut()
            && !negotiator.sent_sdp()
            && let Ok(link) = negotiator.link_mut()
        {
            link.set_direction(!options.receive_only, !options.send_only);
        }
        self.emit(CallEventKind::Answer);
        self.dispatch(StateEvent::Answer {
            preview: options.preview,
        })
        .await
    }

    async fn start_modify(&mut self, request: ModifyRequest) -> Result<OutcomeReceiver, CallError> {
        let connected = self.machine.state().is_connected();
        let Some(negotiator) = self.negotiator.as_mut() else {
            return Err(CallError::NotConnected);
        };
        if !connected || negotiator.has_pending_modify() {
            return Err(NegotiationError::ModifyPending.into());
        }
        let rx = negotiator.start_modify(request).await?;

        if let Some(constraints) = request.constraints {
            self.constraints = constraints;
        }
        if let Some(direct) = request.direct_connection {
            self.machine.set_need_direct_connection(direct);
            if !direct {
                self.close_direct_channel();
            }
        }
        self.dispatch(StateEvent::Modify { receive: false }).await?;
        Ok(rx)
    }

    async fn send_message(&mut self, message: &str) -> Result<(), CallError> {
        let Some(channel) = self.direct.as_ref() else {
            return Err(CallError::DirectConnectionClosed);
        };
        let Some(negotiator) = self.negotiator.as_mut() else {
            return Err(CallError::DirectConnectionClosed);
        };
        channel.send(negotiator.link_mut()?, message).await
    }

    fn set_muted(&mut self, kind: MediaKind, muted: bool) {
        let slot = match kind {
            MediaKind::Audio => &mut self.audio_muted,
            MediaKind::Video => &mut self.video_muted,
        };
        if *slot == muted {
            return;
        }
        *slot = muted;
        if let Some(negotiator) = self.negotiator.as_mut()
            && let Ok(link) = negotiator.link_mut()
        {
            link.set_muted(kind, muted);
        }
        self.emit(CallEventKind::Mute { kind, muted });
    }

    async fn handle_signal(&mut self, envelope: SignalEnvelope) {
        debug!(target: "Call/Session", "{} <- {}", self.session_id, envelope.signal_type);
        match envelope.signal_type {
            SignalType::Offer => self.on_offer(envelope).await,
            SignalType::Answer => self.on_answer(envelope).await,
            SignalType::Connected => {
                let caller = self.machine.is_caller();
                let lost = self
                    .negotiator
                    .as_ref()
                    .is_some_and(|n| n.lost_to_other_connection(&envelope, caller));
                if lost {
                    info!(target: "Call/Session", "{} was answered by another connection", self.session_id);
                    let _ = self
                        .dispatch(StateEvent::Hangup {
                            signal: Some(false),
                            reason: Some("call answered by another connection".to_string()),
                        })
                        .await;
                }
            }
            SignalType::Modify => self.on_modify(envelope).await,
            SignalType::IceCandidates => {
                if let Some(negotiator) = self.negotiator.as_mut() {
                    negotiator
                        .handle_remote_candidates(envelope.ice_candidates.unwrap_or_default())
                        .await;
                }
            }
            SignalType::Hangup => {
                self.machine.mark_received_bye();
                let reason = envelope
                    .reason
                    .unwrap_or_else(|| "Remote side hung up".to_string());
                let _ = self
                    .dispatch(StateEvent::Hangup {
                        signal: Some(false),
                        reason: Some(reason),
                    })
                    .await;
            }
            SignalType::Ack => {}
        }
    }

    async fn on_offer(&mut self, envelope: SignalEnvelope) {
        if let Some(negotiator) = self.negotiator.as_mut() {
            negotiator.set_connection_id(envelope.from_connection.clone());
        }
        if let Some(description) = &envelope.session_description {
            let sdp = &description.sdp;
            let (audio, video) = (sdp.contains("m=audio"), sdp.contains("m=video"));
            if !self.machine.is_caller() && (audio || video) {
                self.constraints = MediaConstraints { audio, video };
            }
        }
        self.saved_offer = envelope.session_description;

        if self.machine.is_modifying(self.guard_input()) {
            self.emit(CallEventKind::Modify {
                direct_connection: self.remote_modify_direct,
            });
        }
        let _ = self.dispatch(StateEvent::ReceiveOffer).await;

        if self.machine.state() == CallState::Negotiating(NegotiatingState::Connecting) {
            self.process_saved_offer().await;
        }
    }

    async fn on_answer(&mut self, envelope: SignalEnvelope) {
        if self.machine.state() != CallState::Negotiating(NegotiatingState::Offering) {
            debug!(target: "Call/Session", "Ignoring answer for {} in {}", self.session_id, self.machine.state());
            return;
        }
        let Some(negotiator) = self.negotiator.as_mut() else {
            return;
        };
        match negotiator.handle_answer(&envelope).await {
            Ok(()) => {
                let _ = self.dispatch(StateEvent::ReceiveAnswer).await;
            }
            Err(e) => self.fail(e),
        }
    }

    async fn on_modify(&mut self, envelope: SignalEnvelope) {
        let idle = self.machine.state() == CallState::Idle;
        let Some(negotiator) = self.negotiator.as_mut() else {
            return;
        };
        match negotiator.handle_modify(&envelope, idle).await {
            ModifyOutcome::AcceptedRemote {
                direct_connection,
                constraints,
            } => {
                if let Some(constraints) = constraints {
                    self.constraints = constraints;
                }
                if let Some(direct) = direct_connection {
                    self.machine.set_need_direct_connection(direct);
                    if !direct {
                        self.close_direct_channel();
                    }
                }
                self.remote_modify_direct = direct_connection;
                self.emit(CallEventKind::ModifyAccepted);
                let _ = self.dispatch(StateEvent::Modify { receive: true }).await;
            }
            ModifyOutcome::RejectedRemote(NegotiationError::ModifyCollision) => {
                let reason = NegotiationError::ModifyCollision.to_string();
                self.emit(CallEventKind::ModifyRejected {
                    reason: reason.clone(),
                });
                let _ = self
                    .dispatch(StateEvent::Reject {
                        reason: Some(reason),
                    })
                    .await;
            }
            ModifyOutcome::RejectedRemote(e) => {
                debug!(target: "Call/Session", "Refused remote modify for {}: {e}", self.session_id);
            }
            ModifyOutcome::Accepted => {
                self.emit(CallEventKind::ModifyAccepted);
                let _ = self.dispatch(StateEvent::Accept).await;
            }
            ModifyOutcome::Declined => {
                self.emit(CallEventKind::ModifyRejected {
                    reason: NegotiationError::Declined.to_string(),
                });
                let _ = self
                    .dispatch(StateEvent::Reject {
                        reason: Some("modify rejected".to_string()),
                    })
                    .await;
            }
            ModifyOutcome::Stale => {
                debug!(target: "Call/Session", "Stale modify for {}", self.session_id);
            }
        }
    }

    async fn handle_link_event(&mut self, event: LinkEvent) {
        match event {
            LinkEvent::LocalCandidate(candidate) => {
                let caller = self.machine.is_caller();
                if let Some(negotiator) = self.negotiator.as_mut() {
                    negotiator.handle_local_candidate(candidate, caller).await;
                }
            }
            LinkEvent::RemoteMediaAdded => {
                self.emit(CallEventKind::Connect);
                let _ = self.dispatch(StateEvent::ReceiveRemoteMedia).await;
            }
            LinkEvent::RemoteMediaRemoved => {
                if self.machine.state().is_connected() && !self.has_media() {
                    let _ = self
                        .dispatch(StateEvent::Hangup {
                            signal: None,
                            reason: Some("remote media removed".to_string()),
                        })
                        .await;
                }
            }
            LinkEvent::DataChannelOpen => {
                if self.direct.get_or_insert_with(DirectChannel::default).mark_open() {
                    self.emit(CallEventKind::DirectConnectionOpen);
                    let _ = self.dispatch(StateEvent::ReceiveRemoteMedia).await;
                }
            }
            LinkEvent::DataChannelClosed => {
                if let Some(channel) = self.direct.as_mut()
                    && channel.mark_closed()
                {
                    self.emit(CallEventKind::DirectConnectionClosed);
                }
                if !self.has_media() {
                    let _ = self
                        .dispatch(StateEvent::Hangup {
                            signal: None,
                            reason: Some("direct connection closed".to_string()),
                        })
                        .await;
                }
            }
            LinkEvent::DataChannelMessage(message) => {
                self.emit(CallEventKind::DirectMessage { message });
            }
            LinkEvent::DataChannelError(message) => {
                warn!(target: "Call/Session", "Data channel error on {}: {message}", self.session_id);
                self.emit(CallEventKind::Error { message });
            }
        }
    }
}
