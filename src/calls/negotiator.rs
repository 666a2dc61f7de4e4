//! Offer/answer, candidate and renegotiation exchange for one session.

use super::candidates::CandidateQueue;
use super::error::{CallError, NegotiationError};
use super::media::{LinkEvent, PeerLink, PeerLinkFactory};
use super::signaling::SignalingChannel;
use log::{debug, warn};
use peerlink_core::envelope::{DescriptionKind, IceCandidate, SessionDescription};
use peerlink_core::types::media::MediaConstraints;
use peerlink_core::{ModifyAction, SignalEnvelope, SignalType, Target};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

pub type OutcomeSender = oneshot::Sender<Result<(), CallError>>;
pub type OutcomeReceiver = oneshot::Receiver<Result<(), CallError>>;

/// Which locally gathered candidates may leave this host.
#[derive(Debug, Clone, Copy, Default)]
pub struct CandidateFilter {
    pub force_turn: bool,
    pub disable_turn: bool,
}

impl CandidateFilter {
    pub fn allows(&self, candidate: &IceCandidate) -> bool {
        if self.force_turn {
            candidate.is_relay()
        } else if self.disable_turn {
            !candidate.is_relay()
        } else {
            true
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ModifyRequest {
    pub constraints: Option<MediaConstraints>,
    pub direct_connection: Option<bool>,
}

/// What an inbound `modify` envelope amounted to.
#[derive(Debug, PartialEq)]
pub enum ModifyOutcome {
    /// The remote side accepted our pending renegotiation.
    Accepted,
    /// The remote side declined our pending renegotiation.
    Declined,
    /// We accepted a renegotiation started by the remote side.
    AcceptedRemote {
        direct_connection: Option<bool>,
        constraints: Option<MediaConstraints>,
    },
    /// We refused a renegotiation started by the remote side.
    RejectedRemote(NegotiationError),
    /// An accept/reject that matches no pending request.
    Stale,
}

pub struct PeerNegotiator {
    session_id: String,
    target: Target,
    remote_endpoint: String,
    connection_id: Option<String>,
    signaling: Arc<dyn SignalingChannel>,
    link: Option<Box<dyn PeerLink>>,
    outgoing: CandidateQueue,
    incoming: CandidateQueue,
    filter: CandidateFilter,
    /// Offer or answer of the current round went out.
    sent_sdp: bool,
    /// Any offer or answer went out during the lifetime of the session.
    ever_sent_sdp: bool,
    remote_description_applied: bool,
    pending_modify: Option<OutcomeSender>,
}

impl PeerNegotiator {
    pub fn new(
        session_id: impl Into<String>,
        target: Target,
        remote_endpoint: impl Into<String>,
        connection_id: Option<String>,
        signaling: Arc<dyn SignalingChannel>,
        filter: CandidateFilter,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            target,
            remote_endpoint: remote_endpoint.into(),
            connection_id,
            signaling,
            link: None,
            outgoing: CandidateQueue::new(),
            incoming: CandidateQueue::new(),
            filter,
            sent_sdp: false,
            ever_sent_sdp: false,
            remote_description_applied: false,
            pending_modify: None,
        }
    }

    /// Create the peer link on first use. Later calls keep the existing one.
    pub fn init(&mut self, factory: &dyn PeerLinkFactory, events: mpsc::UnboundedSender<LinkEvent>) {
        if self.link.is_none() {
            debug!(target: "Call/Negotiator", "Creating peer link for {}", self.session_id);
            self.link = Some(factory.create(&self.session_id, events));
        }
    }

    pub fn link(&self) -> Option<&dyn PeerLink> {
        self.link.as_deref()
    }

    pub fn link_mut(&mut self) -> Result<&mut dyn PeerLink, CallError> {
        match self.link.as_mut() {
            Some(link) => {
                let link: &mut dyn PeerLink = link.as_mut();
                Ok(link)
            }
            None => Err(NegotiationError::NoPeerLink.into()),
        }
    }

    pub fn connection_id(&self) -> Option<&str> {
        self.connection_id.as_deref()
    }

    pub fn set_connection_id(&mut self, connection_id: Option<String>) {
        if connection_id.is_some() {
            self.connection_id = connection_id;
        }
    }

    pub fn sent_sdp(&self) -> bool {
        self.sent_sdp
    }

    pub fn has_pending_modify(&self) -> bool {
        self.pending_modify.is_some()
    }

    pub fn queued_candidates(&self) -> (usize, usize) {
        (self.outgoing.len(), self.incoming.len())
    }

    /// A new offer/answer round starts.
    pub fn reset_round(&mut self) {
        self.sent_sdp = false;
        self.remote_description_applied = false;
    }

    fn envelope(&self, kind: SignalType) -> SignalEnvelope {
        SignalEnvelope::new(kind, self.session_id.clone(), self.target)
            .with_recipient(self.remote_endpoint.clone(), self.connection_id.clone())
            .with_sender(self.signaling.endpoint_id(), self.signaling.connection_id())
    }

    async fn send(&self, envelope: SignalEnvelope) -> Result<(), CallError> {
        self.signaling.send_signal(envelope).await?;
        Ok(())
    }

    fn mark_sent_sdp(&mut self) {
        self.sent_sdp = true;
        self.ever_sent_sdp = true;
    }

    async fn create_and_apply_local(
        &mut self,
        kind: DescriptionKind,
    ) -> Result<SessionDescription, CallError> {
        let link = self.link_mut()?;
        let description = link
            .create_local_description(kind)
            .await
            .map_err(|e| NegotiationError::LocalDescription(e.to_string()))?;
        link.apply_local_description(&description)
            .await
            .map_err(|e| NegotiationError::LocalDescription(e.to_string()))?;
        Ok(description)
    }

    async fn apply_remote(&mut self, description: &SessionDescription) -> Result<(), CallError> {
        self.link_mut()?
            .apply_remote_description(description)
            .await
            .map_err(|e| NegotiationError::RemoteDescription(e.to_string()))?;
        self.remote_description_applied = true;
        Ok(())
    }

    /// Caller side: build, apply and send an offer.
    pub async fn create_offer(&mut self) -> Result<(), CallError> {
        let offer = self.create_and_apply_local(DescriptionKind::Offer).await?;
        self.send(self.envelope(SignalType::Offer).with_description(offer))
            .await?;
        self.mark_sent_sdp();
        Ok(())
    }

    /// Callee side: apply the remote offer, then build, apply and send an answer.
    pub async fn process_offer(&mut self, offer: &SessionDescription) -> Result<(), CallError> {
        self.apply_remote(offer).await?;
        self.flush_queues(false).await;

        let answer = self.create_and_apply_local(DescriptionKind::Answer).await?;
        self.send(self.envelope(SignalType::Answer).with_description(answer))
            .await?;
        self.mark_sent_sdp();
        self.flush_queues(false).await;
        Ok(())
    }

    /// Caller side: the remote answer arrived. Claims the answering
    /// connection, tells the remote endpoint who won and applies the answer.
    pub async fn handle_answer(&mut self, envelope: &SignalEnvelope) -> Result<(), CallError> {
        let Some(description) = envelope.session_description.as_ref() else {
            return Err(
                NegotiationError::RemoteDescription("answer without description".into()).into(),
            );
        };
        self.set_connection_id(envelope.from_connection.clone());

        if let Err(e) = self.send(self.envelope(SignalType::Connected)).await {
            warn!(target: "Call/Negotiator", "Could not send connected for {}: {e}", self.session_id);
        }

        self.apply_remote(description).await?;
        self.flush_queues(true).await;
        Ok(())
    }

    /// Callee side: whether a `connected` envelope names another of our
    /// endpoint's connections as the winner.
    pub fn lost_to_other_connection(&self, envelope: &SignalEnvelope, caller: bool) -> bool {
        if caller {
            return false;
        }
        match (
            envelope.to_connection.as_deref(),
            self.signaling.connection_id(),
        ) {
            (Some(winner), Some(ours)) => winner != ours,
            _ => false,
        }
    }

    fn can_send_candidates(&self, caller: bool) -> bool {
        self.sent_sdp && (!caller || self.remote_description_applied)
    }

    fn can_apply_candidates(&self) -> bool {
        self.link.is_some() && self.remote_description_applied
    }

    async fn send_candidate(&self, candidate: IceCandidate) {
        let envelope = self
            .envelope(SignalType::IceCandidates)
            .with_candidates(vec![candidate]);
        if let Err(e) = self.send(envelope).await {
            warn!(target: "Call/Negotiator", "Could not send candidate for {}: {e}", self.session_id);
        }
    }

    async fn apply_candidate(&mut self, candidate: &IceCandidate) {
        if let Ok(link) = self.link_mut()
            && let Err(e) = link.add_remote_candidate(candidate).await
        {
            warn!(target: "Call/Negotiator", "Remote candidate rejected: {e}");
        }
    }

    pub async fn handle_local_candidate(&mut self, candidate: IceCandidate, caller: bool) {
        if !self.filter.allows(&candidate) {
            debug!(target: "Call/Negotiator", "Filtered local candidate {}", candidate.candidate);
            return;
        }
        if self.can_send_candidates(caller) {
            self.send_candidate(candidate).await;
        } else {
            self.outgoing.push(candidate);
        }
    }

    pub async fn handle_remote_candidates(&mut self, candidates: Vec<IceCandidate>) {
        for candidate in candidates {
            if !candidate.is_addressable() {
                warn!(target: "Call/Negotiator", "Dropping candidate without sdpMid or sdpMLineIndex");
                continue;
            }
            if self.can_apply_candidates() {
                self.apply_candidate(&candidate).await;
            } else {
                self.incoming.push(candidate);
            }
        }
    }

    /// Send/apply whatever was queued, in arrival order, if allowed by now.
    pub async fn flush_queues(&mut self, caller: bool) {
        if self.can_send_candidates(caller) {
            for candidate in self.outgoing.drain() {
                self.send_candidate(candidate).await;
            }
        }
        if self.can_apply_candidates() {
            for candidate in self.incoming.drain() {
                self.apply_candidate(&candidate).await;
            }
        }
    }

    /// Ask the remote side for a new round. Fails without touching the wire
    /// while an earlier request is unresolved.
    pub async fn start_modify(&mut self, request: ModifyRequest) -> Result<OutcomeReceiver, CallError> {
        if self.pending_modify.is_some() {
            return Err(NegotiationError::ModifyPending.into());
        }

        let mut envelope = self
            .envelope(SignalType::Modify)
            .with_action(ModifyAction::Initiate);
        if let Some(constraints) = request.constraints {
            envelope = envelope.with_constraints(constraints);
        }
        if let Some(direct) = request.direct_connection {
            envelope = envelope.with_direct_connection(direct);
        }
        self.send(envelope).await?;

        let (tx, rx) = oneshot::channel();
        self.pending_modify = Some(tx);
        Ok(rx)
    }

    async fn reply_modify(&self, action: ModifyAction) {
        let envelope = self.envelope(SignalType::Modify).with_action(action);
        if let Err(e) = self.send(envelope).await {
            warn!(target: "Call/Negotiator", "Could not send modify {action}: {e}");
        }
    }

    /// Handle an inbound `modify`. `idle` is true while the session has not
    /// started negotiating.
    pub async fn handle_modify(&mut self, envelope: &SignalEnvelope, idle: bool) -> ModifyOutcome {
        match envelope.action {
            Some(ModifyAction::Initiate) => {
                if let Some(pending) = self.pending_modify.take() {
                    let _ = pending.send(Err(NegotiationError::ModifyCollision.into()));
                    self.reply_modify(ModifyAction::Reject).await;
                    return ModifyOutcome::RejectedRemote(NegotiationError::ModifyCollision);
                }
                if idle || !self.sent_sdp {
                    self.reply_modify(ModifyAction::Reject).await;
                    return ModifyOutcome::RejectedRemote(NegotiationError::ModifyPrecall);
                }
                self.reply_modify(ModifyAction::Accept).await;
                ModifyOutcome::AcceptedRemote {
                    direct_connection: envelope.direct_connection,
                    constraints: envelope.constraints,
                }
            }
            Some(ModifyAction::Accept) => match self.pending_modify.take() {
                Some(pending) => {
                    let _ = pending.send(Ok(()));
                    ModifyOutcome::Accepted
                }
                None => ModifyOutcome::Stale,
            },
            Some(ModifyAction::Reject) => match self.pending_modify.take() {
                Some(pending) => {
                    let _ = pending.send(Err(NegotiationError::Declined.into()));
                    ModifyOutcome::Declined
                }
                None => ModifyOutcome::Stale,
            },
            None => ModifyOutcome::Stale,
        }
    }

    pub fn fail_pending_modify(&mut self, error: CallError) {
        if let Some(pending) = self.pending_modify.take() {
            let _ = pending.send(Err(error));
        }
    }

    /// Tear down the peer link. Consumes the negotiator so nothing can touch
    /// the link afterwards.
    ///
    /// Without an explicit `signal`, a hangup is sent unless we are the
    /// caller and never sent an offer. Returns whether a hangup went out.
    pub async fn close(mut self, signal: Option<bool>, caller: bool, reason: &str) -> bool {
        let to_send = signal.unwrap_or(!(caller && !self.ever_sent_sdp));

        self.fail_pending_modify(CallError::Terminated(reason.to_string()));

        let mut sent = false;
        if to_send {
            let envelope = self.envelope(SignalType::Hangup).with_reason(reason);
            match self.send(envelope).await {
                Ok(()) => sent = true,
                Err(e) => warn!(target: "Call/Negotiator", "Could not send hangup for {}: {e}", self.session_id),
            }
        }

        if let Some(mut link) = self.link.take() {
            link.close();
        }
        sent
    }
}
