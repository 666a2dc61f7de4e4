//! Hierarchical session state machine.
//!
//! The machine is pure: [`CallStateMachine::dispatch`] takes an event plus the
//! guard inputs that depend on media presence, updates its own flags and
//! returns the entry/exit actions the orchestrator has to carry out (timers,
//! offer creation, teardown). It never performs I/O itself.

use serde::Serialize;
use std::fmt;

/// Media acquisition sub-flow of `negotiating`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum AnsweringState {
    /// Waiting for the media source to grant access and produce tracks.
    ApprovingDeviceAccess,
    /// Local media is available for preview; waiting for `approve()`.
    ApprovingContent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum NegotiatingState {
    /// Entry point of every negotiation round.
    Preparing,
    Answering(AnsweringState),
    Offering,
    Connecting,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Default)]
pub enum CallState {
    #[default]
    Idle,
    Negotiating(NegotiatingState),
    /// We asked the remote side to renegotiate and wait for its accept/reject.
    Modifying,
    Connected,
    Terminated,
}

impl CallState {
    /// Name of the innermost state.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Negotiating(NegotiatingState::Preparing) => "preparing",
            Self::Negotiating(NegotiatingState::Answering(AnsweringState::ApprovingDeviceAccess)) => {
                "approvingDeviceAccess"
            }
            Self::Negotiating(NegotiatingState::Answering(AnsweringState::ApprovingContent)) => {
                "approvingContent"
            }
            Self::Negotiating(NegotiatingState::Offering) => "offering",
            Self::Negotiating(NegotiatingState::Connecting) => "connecting",
            Self::Modifying => "modifying",
            Self::Connected => "connected",
            Self::Terminated => "terminated",
        }
    }

    pub fn is_terminated(&self) -> bool {
        matches!(self, Self::Terminated)
    }

    pub fn is_negotiating(&self) -> bool {
        matches!(self, Self::Negotiating(_))
    }

    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected)
    }

    /// States a renegotiation passes through before it reaches `connecting`.
    fn in_modify_round(&self) -> bool {
        matches!(
            self,
            Self::Negotiating(
                NegotiatingState::Preparing
                    | NegotiatingState::Answering(_)
                    | NegotiatingState::Offering
            ) | Self::Modifying
        )
    }
}

impl fmt::Display for CallState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum StateEvent {
    /// First event of every session. Callers always proceed; callees only
    /// when someone accepts incoming work.
    Initiate { accepts_incoming: bool },
    ReceiveOffer,
    Answer { preview: bool },
    Approve { preview: bool },
    ReceiveLocalMedia,
    ReceiveRemoteMedia,
    SentOffer,
    ReceiveAnswer,
    /// `receive` is true when the remote side started the round.
    Modify { receive: bool },
    /// The remote side accepted our renegotiation.
    Accept,
    Reject { reason: Option<String> },
    Hangup {
        signal: Option<bool>,
        reason: Option<String>,
    },
}

impl StateEvent {
    /// Events that are routinely delivered in states that ignore them.
    fn is_non_transition(&self) -> bool {
        matches!(
            self,
            Self::ReceiveLocalMedia
                | Self::ReceiveRemoteMedia
                | Self::Approve { .. }
                | Self::Answer { .. }
                | Self::SentOffer
                | Self::ReceiveAnswer
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKind {
    /// Callee did not answer its own incoming session.
    LocalAnswer,
    /// Remote side did not answer our offer.
    ReceiveAnswer,
    /// Media did not start flowing after the answer.
    Connection,
    /// Renegotiation got no reply.
    Modify,
}

impl TimerKind {
    pub const ALL: [TimerKind; 4] = [
        Self::LocalAnswer,
        Self::ReceiveAnswer,
        Self::Connection,
        Self::Modify,
    ];

    /// Reason carried by the `reject` dispatched on expiry.
    pub fn reason(&self) -> &'static str {
        match self {
            Self::LocalAnswer => "answer own call timer",
            Self::ReceiveAnswer => "no answer received from remote party",
            Self::Connection => "connection timer expired",
            Self::Modify => "modify timer expired",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum StateAction {
    Exited(CallState),
    Entered(CallState),
    StartTimer(TimerKind),
    ClearTimer(TimerKind),
    /// Proceed as if `approve()` had been called.
    AutoApprove,
    /// An offer arrived after the user answered; answer again.
    ReplayAnswer,
    /// Run teardown. Emitted exactly once per machine.
    Terminate {
        reason: String,
        signal: Option<bool>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub from: CallState,
    pub to: CallState,
    pub actions: Vec<StateAction>,
}

impl Transition {
    pub fn changed(&self) -> bool {
        self.from != self.to
    }
}

/// Inputs to guards that the machine cannot know by itself.
#[derive(Debug, Clone, Copy, Default)]
pub struct GuardInput {
    /// Remote media or an open data channel is flowing.
    pub has_media: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct NegotiationFlags {
    pub has_local_media_approval: bool,
    pub has_local_media: bool,
    pub is_answered: bool,
    pub received_sdp: bool,
    pub processed_remote_sdp: bool,
    pub need_direct_connection: bool,
    pub receive_only: bool,
}

#[derive(Debug, Clone)]
pub struct CallStateMachine {
    state: CallState,
    caller: bool,
    /// Role before the current renegotiation round, restored on rollback.
    old_role: Option<bool>,
    flags: NegotiationFlags,
    hangup_reason: Option<String>,
    signal_bye: Option<bool>,
    received_bye: bool,
}

impl CallStateMachine {
    pub fn new(caller: bool, need_direct_connection: bool) -> Self {
        Self {
            state: CallState::Idle,
            caller,
            old_role: None,
            flags: NegotiationFlags {
                need_direct_connection,
                ..Default::default()
            },
            hangup_reason: None,
            signal_bye: None,
            received_bye: false,
        }
    }

    pub fn state(&self) -> CallState {
        self.state
    }

    pub fn is_caller(&self) -> bool {
        self.caller
    }

    pub fn is_terminated(&self) -> bool {
        self.state.is_terminated()
    }

    pub fn flags(&self) -> &NegotiationFlags {
        &self.flags
    }

    pub fn hangup_reason(&self) -> Option<&str> {
        self.hangup_reason.as_deref()
    }

    pub fn set_receive_only(&mut self, receive_only: bool) {
        self.flags.receive_only = receive_only;
    }

    pub fn set_need_direct_connection(&mut self, need: bool) {
        self.flags.need_direct_connection = need;
    }

    /// The remote side already hung up, so teardown must not signal again.
    pub fn mark_received_bye(&mut self) {
        self.received_bye = true;
    }

    pub fn received_bye(&self) -> bool {
        self.received_bye
    }

    /// Whether a renegotiation round is in progress on top of live media.
    pub fn is_modifying(&self, input: GuardInput) -> bool {
        self.state.in_modify_round() && input.has_media
    }

    /// Apply an event. Returns the resulting transition, or an error if the
    /// current state has no handler for it. Once terminated, every event is
    /// rejected.
    pub fn dispatch(
        &mut self,
        event: StateEvent,
        input: GuardInput,
    ) -> Result<Transition, InvalidTransition> {
        use AnsweringState::*;
        use CallState::*;
        use NegotiatingState::*;

        let from = self.state;
        if from.is_terminated() {
            return Err(InvalidTransition::new(from, &event));
        }

        let mut actions = Vec::new();
        let target = match (from, event) {
            (_, StateEvent::Hangup { signal, reason }) => {
                self.signal_bye = signal;
                self.hangup_reason = self
                    .hangup_reason
                    .take()
                    .or(reason)
                    .or_else(|| Some("none".to_string()));
                Some(Terminated)
            }

            (Idle, StateEvent::Initiate { accepts_incoming }) => {
                if self.caller || accepts_incoming {
                    Some(Negotiating(Preparing))
                } else {
                    self.hangup_reason = Some("no call listener".to_string());
                    self.signal_bye = Some(true);
                    Some(Terminated)
                }
            }
            (Idle, StateEvent::ReceiveOffer) => {
                self.flags.received_sdp = true;
                None
            }

            (Negotiating(_) | Modifying, StateEvent::Modify { .. }) => {
                actions.push(StateAction::ClearTimer(TimerKind::Modify));
                None
            }
            (Negotiating(_) | Modifying, StateEvent::Reject { reason }) => {
                Some(self.reject_target(reason, input, &mut actions))
            }

            (Negotiating(Preparing), StateEvent::ReceiveOffer) => {
                self.flags.received_sdp = true;
                if self.flags.is_answered {
                    actions.push(StateAction::ReplayAnswer);
                }
                None
            }
            (Negotiating(Preparing), StateEvent::Answer { preview }) => {
                self.answer_target(preview, &mut actions)
            }

            (Negotiating(Answering(_)), StateEvent::ReceiveLocalMedia) => {
                self.flags.has_local_media = true;
                self.flags
                    .has_local_media_approval
                    .then(|| self.proceed_target())
            }
            (Negotiating(Answering(ApprovingDeviceAccess)), StateEvent::Approve { preview }) => {
                if preview {
                    Some(Negotiating(Answering(ApprovingContent)))
                } else if !self.caller
                    && (self.flags.has_local_media || self.flags.need_direct_connection)
                {
                    Some(Negotiating(Connecting))
                } else if self.caller && self.flags.has_local_media {
                    Some(Negotiating(Offering))
                } else {
                    None
                }
            }
            (Negotiating(Answering(ApprovingContent)), StateEvent::Approve { .. }) => {
                self.flags.has_local_media_approval = true;
                (self.flags.has_local_media || self.flags.need_direct_connection)
                    .then(|| self.proceed_target())
            }

            (Negotiating(Offering), StateEvent::SentOffer) => {
                actions.push(StateAction::StartTimer(TimerKind::ReceiveAnswer));
                None
            }
            (Negotiating(Offering), StateEvent::ReceiveLocalMedia) => {
                self.flags.has_local_media = true;
                self.flags.need_direct_connection.then_some(Connected)
            }
            (Negotiating(Offering), StateEvent::ReceiveAnswer) => {
                actions.push(StateAction::ClearTimer(TimerKind::ReceiveAnswer));
                self.flags.processed_remote_sdp = true;
                Some(Negotiating(Connecting))
            }
            (Negotiating(Offering | Connecting), StateEvent::ReceiveRemoteMedia) => Some(Connected),
            (Negotiating(Connecting) | Connected, StateEvent::ReceiveAnswer) => {
                actions.push(StateAction::ClearTimer(TimerKind::ReceiveAnswer));
                self.flags.processed_remote_sdp = true;
                None
            }
            (Negotiating(Connecting), StateEvent::ReceiveLocalMedia) => {
                self.flags.has_local_media = true;
                (self.flags.need_direct_connection && !self.caller).then_some(Connected)
            }

            (Modifying, StateEvent::Accept) => {
                self.caller = true;
                Some(Negotiating(Preparing))
            }

            (Connected, StateEvent::Reject { reason }) => {
                self.hangup_reason =
                    Some(reason.unwrap_or_else(|| "got reject while connected".to_string()));
                Some(Terminated)
            }
            (Connected, StateEvent::Modify { receive: true }) => {
                self.caller = false;
                actions.push(StateAction::StartTimer(TimerKind::Modify));
                Some(Negotiating(Preparing))
            }
            (Connected, StateEvent::Modify { receive: false }) => Some(Modifying),

            (_, event) if event.is_non_transition() => None,
            (current, event) => return Err(InvalidTransition::new(current, &event)),
        };

        if let Some(to) = target
            && to != from
        {
            self.exit(from, &mut actions);
            self.state = to;
            self.enter(to, input, &mut actions);
        }

        Ok(Transition {
            from,
            to: self.state,
            actions,
        })
    }

    fn proceed_target(&self) -> CallState {
        if self.caller {
            CallState::Negotiating(NegotiatingState::Offering)
        } else {
            CallState::Negotiating(NegotiatingState::Connecting)
        }
    }

    fn answer_target(&mut self, preview: bool, actions: &mut Vec<StateAction>) -> Option<CallState> {
        use AnsweringState::*;
        use CallState::*;
        use NegotiatingState::*;

        self.flags.is_answered = true;
        if !preview {
            self.flags.has_local_media_approval = true;
        }

        let need_dc = self.flags.need_direct_connection;
        let receive_only = self.flags.receive_only;
        if !need_dc && !receive_only {
            return Some(Negotiating(Answering(ApprovingDeviceAccess)));
        }
        if need_dc && preview {
            return Some(Negotiating(Answering(ApprovingContent)));
        }
        if self.caller {
            return Some(Negotiating(Offering));
        }
        if !self.flags.received_sdp {
            return None;
        }
        if !preview || receive_only {
            actions.push(StateAction::AutoApprove);
        }
        Some(Negotiating(Connecting))
    }

    fn reject_target(
        &mut self,
        reason: Option<String>,
        input: GuardInput,
        actions: &mut Vec<StateAction>,
    ) -> CallState {
        if input.has_media {
            if let Some(role) = self.old_role {
                self.caller = role;
            }
            actions.push(StateAction::ClearTimer(TimerKind::Modify));
            CallState::Connected
        } else {
            self.hangup_reason = Some(reason.unwrap_or_else(|| "no media".to_string()));
            CallState::Terminated
        }
    }

    fn exit(&mut self, state: CallState, actions: &mut Vec<StateAction>) {
        match state {
            CallState::Negotiating(NegotiatingState::Preparing) => {
                actions.push(StateAction::ClearTimer(TimerKind::LocalAnswer));
            }
            CallState::Negotiating(NegotiatingState::Connecting) => {
                actions.push(StateAction::ClearTimer(TimerKind::Connection));
                actions.push(StateAction::ClearTimer(TimerKind::Modify));
            }
            _ => {}
        }
        actions.push(StateAction::Exited(state));
    }

    fn enter(&mut self, state: CallState, input: GuardInput, actions: &mut Vec<StateAction>) {
        match state {
            CallState::Negotiating(NegotiatingState::Preparing) => {
                self.flags.has_local_media_approval = false;
                self.flags.has_local_media = false;
                self.flags.received_sdp = false;
                self.flags.processed_remote_sdp = false;
                self.flags.is_answered = false;
                if !self.is_modifying(input) {
                    actions.push(StateAction::StartTimer(TimerKind::LocalAnswer));
                }
            }
            CallState::Negotiating(NegotiatingState::Connecting) => {
                actions.push(StateAction::StartTimer(TimerKind::Connection));
            }
            CallState::Modifying => {
                actions.push(StateAction::StartTimer(TimerKind::Modify));
            }
            CallState::Connected => {
                self.old_role = Some(self.caller);
                self.flags.need_direct_connection = false;
            }
            CallState::Terminated => {
                actions.extend(TimerKind::ALL.into_iter().map(StateAction::ClearTimer));
                let signal = if self.received_bye {
                    Some(false)
                } else {
                    self.signal_bye
                };
                actions.push(StateAction::Terminate {
                    reason: self
                        .hangup_reason
                        .clone()
                        .unwrap_or_else(|| "none".to_string()),
                    signal,
                });
            }
            _ => {}
        }
        actions.push(StateAction::Entered(state));
    }
}

#[derive(Debug, Clone)]
pub struct InvalidTransition {
    pub current_state: String,
    pub attempted: String,
}

impl InvalidTransition {
    fn new(current: CallState, attempted: &StateEvent) -> Self {
        Self {
            current_state: current.name().to_string(),
            attempted: format!("{:?}", attempted),
        }
    }
}

impl fmt::Display for InvalidTransition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "invalid transition {} in state {}",
            self.attempted, self.current_state
        )
    }
}

impl std::error::Error for InvalidTransition {}

#[cfg(test)]
mod tests {
    use super::*;
    use AnsweringState::*;
    use NegotiatingState::*;

    const NO_MEDIA: GuardInput = GuardInput { has_media: false };
    const MEDIA: GuardInput = GuardInput { has_media: true };

    fn step(machine: &mut CallStateMachine, event: StateEvent) -> Transition {
        machine.dispatch(event, NO_MEDIA).unwrap()
    }

    fn terminate_actions(actions: &[StateAction]) -> Vec<&StateAction> {
        actions
            .iter()
            .filter(|a| matches!(a, StateAction::Terminate { .. }))
            .collect()
    }

    fn connected_caller() -> CallStateMachine {
        let mut m = CallStateMachine::new(true, false);
        step(&mut m, StateEvent::Initiate { accepts_incoming: false });
        step(&mut m, StateEvent::Answer { preview: false });
        step(&mut m, StateEvent::ReceiveLocalMedia);
        step(&mut m, StateEvent::SentOffer);
        step(&mut m, StateEvent::ReceiveAnswer);
        step(&mut m, StateEvent::ReceiveRemoteMedia);
        assert_eq!(m.state(), CallState::Connected);
        m
    }

    /// Flow: idle → preparing → approvingDeviceAccess → offering → connecting → connected
    #[test]
    fn test_caller_flow() {
        let mut m = CallStateMachine::new(true, false);

        let t = step(&mut m, StateEvent::Initiate { accepts_incoming: false });
        assert_eq!(t.to, CallState::Negotiating(Preparing));
        assert!(t.actions.contains(&StateAction::StartTimer(TimerKind::LocalAnswer)));

        let t = step(&mut m, StateEvent::Answer { preview: false });
        assert_eq!(t.to, CallState::Negotiating(Answering(ApprovingDeviceAccess)));
        assert!(t.actions.contains(&StateAction::ClearTimer(TimerKind::LocalAnswer)));

        let t = step(&mut m, StateEvent::ReceiveLocalMedia);
        assert_eq!(t.to, CallState::Negotiating(Offering));
        assert_eq!(t.actions.last(), Some(&StateAction::Entered(t.to)));

        let t = step(&mut m, StateEvent::SentOffer);
        assert!(!t.changed());
        assert_eq!(t.actions, vec![StateAction::StartTimer(TimerKind::ReceiveAnswer)]);

        let t = step(&mut m, StateEvent::ReceiveAnswer);
        assert_eq!(t.to, CallState::Negotiating(Connecting));
        assert!(t.actions.contains(&StateAction::ClearTimer(TimerKind::ReceiveAnswer)));
        assert!(t.actions.contains(&StateAction::StartTimer(TimerKind::Connection)));
        assert!(m.flags().processed_remote_sdp);

        let t = step(&mut m, StateEvent::ReceiveRemoteMedia);
        assert_eq!(t.to, CallState::Connected);
        assert!(t.actions.contains(&StateAction::ClearTimer(TimerKind::Connection)));
    }

    #[test]
    fn test_callee_flow() {
        let mut m = CallStateMachine::new(false, false);
        step(&mut m, StateEvent::Initiate { accepts_incoming: true });
        step(&mut m, StateEvent::ReceiveOffer);
        assert!(m.flags().received_sdp);

        let t = step(&mut m, StateEvent::Answer { preview: false });
        assert_eq!(t.to, CallState::Negotiating(Answering(ApprovingDeviceAccess)));

        let t = step(&mut m, StateEvent::ReceiveLocalMedia);
        assert_eq!(t.to, CallState::Negotiating(Connecting));

        let t = step(&mut m, StateEvent::ReceiveRemoteMedia);
        assert_eq!(t.to, CallState::Connected);
    }

    #[test]
    fn test_offer_after_answer_replays_answer() {
        let mut m = CallStateMachine::new(false, false);
        step(&mut m, StateEvent::Initiate { accepts_incoming: true });
        m.set_receive_only(true);
        let t = step(&mut m, StateEvent::Answer { preview: false });
        assert!(!t.changed());

        let t = step(&mut m, StateEvent::ReceiveOffer);
        assert_eq!(t.actions, vec![StateAction::ReplayAnswer]);

        let t = step(&mut m, StateEvent::Answer { preview: false });
        assert_eq!(t.to, CallState::Negotiating(Connecting));
        assert!(t.actions.contains(&StateAction::AutoApprove));
    }

    #[test]
    fn test_callee_without_listener_terminates_with_signal() {
        let mut m = CallStateMachine::new(false, false);
        let t = step(&mut m, StateEvent::Initiate { accepts_incoming: false });
        assert_eq!(t.to, CallState::Terminated);
        assert_eq!(
            terminate_actions(&t.actions),
            vec![&StateAction::Terminate {
                reason: "no call listener".into(),
                signal: Some(true)
            }]
        );
    }

    #[test]
    fn test_preview_waits_for_approve() {
        let mut m = CallStateMachine::new(true, false);
        step(&mut m, StateEvent::Initiate { accepts_incoming: false });
        step(&mut m, StateEvent::Answer { preview: true });

        let t = step(&mut m, StateEvent::Approve { preview: true });
        assert_eq!(t.to, CallState::Negotiating(Answering(ApprovingContent)));

        let t = step(&mut m, StateEvent::ReceiveLocalMedia);
        assert!(!t.changed());

        let t = step(&mut m, StateEvent::Approve { preview: true });
        assert_eq!(t.to, CallState::Negotiating(Offering));
    }

    #[test]
    fn test_reject_without_media_terminates() {
        let mut m = CallStateMachine::new(true, false);
        step(&mut m, StateEvent::Initiate { accepts_incoming: false });
        step(&mut m, StateEvent::Answer { preview: false });
        step(&mut m, StateEvent::ReceiveLocalMedia);
        step(&mut m, StateEvent::SentOffer);

        let t = step(
            &mut m,
            StateEvent::Reject {
                reason: Some(TimerKind::ReceiveAnswer.reason().into()),
            },
        );
        assert_eq!(t.to, CallState::Terminated);
        assert_eq!(m.hangup_reason(), Some("no answer received from remote party"));
        assert_eq!(
            terminate_actions(&t.actions),
            vec![&StateAction::Terminate {
                reason: "no answer received from remote party".into(),
                signal: None
            }]
        );
    }

    #[test]
    fn test_reject_with_media_rolls_back_to_connected() {
        let mut m = connected_caller();
        m.dispatch(StateEvent::Modify { receive: true }, MEDIA).unwrap();
        assert!(!m.is_caller());

        let t = m
            .dispatch(StateEvent::Reject { reason: None }, MEDIA)
            .unwrap();
        assert_eq!(t.to, CallState::Connected);
        assert!(m.is_caller());
        assert!(terminate_actions(&t.actions).is_empty());
    }

    #[test]
    fn test_reject_while_connected_terminates() {
        let mut m = connected_caller();
        let t = m
            .dispatch(StateEvent::Reject { reason: None }, MEDIA)
            .unwrap();
        assert_eq!(t.to, CallState::Terminated);
        assert_eq!(m.hangup_reason(), Some("got reject while connected"));
    }

    #[test]
    fn test_local_modify_round() {
        let mut m = connected_caller();

        let t = m
            .dispatch(StateEvent::Modify { receive: false }, MEDIA)
            .unwrap();
        assert_eq!(t.to, CallState::Modifying);
        assert!(t.actions.contains(&StateAction::StartTimer(TimerKind::Modify)));

        let t = m.dispatch(StateEvent::Accept, MEDIA).unwrap();
        assert_eq!(t.to, CallState::Negotiating(Preparing));
        assert!(m.is_caller());
        assert!(!t.actions.contains(&StateAction::StartTimer(TimerKind::LocalAnswer)));
    }

    #[test]
    fn test_modify_while_negotiating_is_absorbed() {
        let mut m = connected_caller();
        m.dispatch(StateEvent::Modify { receive: false }, MEDIA)
            .unwrap();
        let t = m
            .dispatch(StateEvent::Modify { receive: true }, MEDIA)
            .unwrap();
        assert_eq!(t.to, CallState::Modifying);
        assert_eq!(t.actions, vec![StateAction::ClearTimer(TimerKind::Modify)]);
    }

    #[test]
    fn test_terminated_fires_once() {
        let mut m = connected_caller();
        let t = m
            .dispatch(
                StateEvent::Hangup {
                    signal: None,
                    reason: Some("bye".into()),
                },
                MEDIA,
            )
            .unwrap();
        assert_eq!(terminate_actions(&t.actions).len(), 1);
        assert!(t.actions.contains(&StateAction::ClearTimer(TimerKind::Connection)));

        let again = m.dispatch(
            StateEvent::Hangup {
                signal: None,
                reason: Some("again".into()),
            },
            MEDIA,
        );
        assert!(again.is_err());
        assert_eq!(m.hangup_reason(), Some("bye"));
    }

    #[test]
    fn test_received_bye_suppresses_signal() {
        let mut m = connected_caller();
        m.mark_received_bye();
        let t = m
            .dispatch(
                StateEvent::Hangup {
                    signal: Some(true),
                    reason: None,
                },
                MEDIA,
            )
            .unwrap();
        assert_eq!(
            terminate_actions(&t.actions),
            vec![&StateAction::Terminate {
                reason: "none".into(),
                signal: Some(false)
            }]
        );
    }

    #[test]
    fn test_direct_connection_caller_skips_media() {
        let mut m = CallStateMachine::new(true, true);
        step(&mut m, StateEvent::Initiate { accepts_incoming: false });
        let t = step(&mut m, StateEvent::Answer { preview: false });
        assert_eq!(t.to, CallState::Negotiating(Offering));
    }

    #[test]
    fn test_direct_connection_callee_auto_approves() {
        let mut m = CallStateMachine::new(false, true);
        step(&mut m, StateEvent::Initiate { accepts_incoming: true });
        step(&mut m, StateEvent::ReceiveOffer);
        let t = step(&mut m, StateEvent::Answer { preview: false });
        assert_eq!(t.to, CallState::Negotiating(Connecting));
        assert!(t.actions.contains(&StateAction::AutoApprove));

        step(&mut m, StateEvent::ReceiveRemoteMedia);
        assert!(!m.flags().need_direct_connection);
    }

    #[test]
    fn test_non_transition_events_are_ignored() {
        let mut m = connected_caller();
        let t = step(&mut m, StateEvent::ReceiveRemoteMedia);
        assert!(!t.changed());
        assert!(t.actions.is_empty());
    }

    #[test]
    fn test_unhandled_event_is_invalid() {
        let mut m = CallStateMachine::new(true, false);
        let err = m.dispatch(StateEvent::Accept, NO_MEDIA).unwrap_err();
        assert_eq!(err.current_state, "idle");
        assert!(err.to_string().contains("Accept"));
    }
}
