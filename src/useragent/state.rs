use super::error::VoipError;
use crate::event::{CallerInfo, VoipEvent};
use crate::transport::{SessionId, SessionState, TransportCommand};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{debug, info, warn};

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CallState {
    Idle,
    ServerConnected,
    Registered,
    Unregistered,
    OfferReceived,
    OfferSent,
    AnswerSent,
    InCall,
}

impl fmt::Display for CallState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CallState::Idle => "IDLE",
            CallState::ServerConnected => "SERVER_CONNECTED",
            CallState::Registered => "REGISTERED",
            CallState::Unregistered => "UNREGISTERED",
            CallState::OfferReceived => "OFFER_RECEIVED",
            CallState::OfferSent => "OFFER_SENT",
            CallState::AnswerSent => "ANSWER_SENT",
            CallState::InCall => "IN_CALL",
        };
        f.write_str(name)
    }
}

/// Signaling operation currently outstanding.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Operation {
    None,
    Connect,
    Register,
    Unregister,
    ProcessInvite,
    MakeCall,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Operation::None => "NONE",
            Operation::Connect => "CONNECT",
            Operation::Register => "REGISTER",
            Operation::Unregister => "UNREGISTER",
            Operation::ProcessInvite => "PROCESS_INVITE",
            Operation::MakeCall => "MAKE_CALL",
        };
        f.write_str(name)
    }
}

/// Role of the local party in the current call.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UserState {
    Idle,
    Uas,
    Uac,
}

/// Inbound call offer. Only inbound sessions can be accepted or rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invitation {
    id: SessionId,
}

impl Invitation {
    pub fn accept(&self) -> TransportCommand {
        TransportCommand::Accept(self.id.clone())
    }

    pub fn reject(&self) -> TransportCommand {
        TransportCommand::Reject(self.id.clone())
    }
}

/// Outbound call offer. Can only be cancelled before it is answered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Inviter {
    id: SessionId,
    target: String,
}

impl Inviter {
    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn cancel(&self) -> TransportCommand {
        TransportCommand::Cancel(self.id.clone())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionKind {
    Inbound(Invitation),
    Outbound(Inviter),
}

impl SessionKind {
    pub fn id(&self) -> &SessionId {
        match self {
            SessionKind::Inbound(invitation) => &invitation.id,
            SessionKind::Outbound(inviter) => &inviter.id,
        }
    }

    pub fn is_inbound(&self) -> bool {
        matches!(self, SessionKind::Inbound(_))
    }

    /// Command that ends the session given its transport sub-state.
    /// `None` when the session is already going away.
    fn hangup(&self, state: SessionState) -> Option<TransportCommand> {
        if state.is_ending() {
            return None;
        }
        if state == SessionState::Established {
            return Some(TransportCommand::Terminate(self.id().clone()));
        }
        match self {
            SessionKind::Inbound(invitation) => Some(invitation.reject()),
            SessionKind::Outbound(inviter) => {
                debug!(
                    session = %inviter.id,
                    target = inviter.target(),
                    "cancelling outbound call"
                );
                Some(inviter.cancel())
            }
        }
    }
}

/// The transport session the call state refers to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackedSession {
    pub kind: SessionKind,
    pub state: SessionState,
}

impl TrackedSession {
    pub fn id(&self) -> &SessionId {
        self.kind.id()
    }
}

/// Inputs to [`CallSession::apply`]: local commands and transport
/// notifications alike.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionInput {
    Connect,
    Disconnect,
    Connected,
    ConnectionError(String),
    Register,
    Unregister,
    RequestAccepted,
    RequestRejected(String),
    Invitation {
        session: SessionId,
        caller: CallerInfo,
    },
    AcceptCall,
    RejectCall,
    EndCall,
    MakeCall {
        session: SessionId,
        target: String,
    },
    SetMuted(bool),
    SessionStateChanged {
        session: SessionId,
        state: SessionState,
    },
}

/// Side effects requested by a transition, to be executed in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    Command(TransportCommand),
    AttachRemoteMedia(SessionId),
    ReleaseRemoteMedia,
    Emit(VoipEvent),
}

/// Call state of one user agent.
///
/// [`CallSession::apply`] is the whole state machine: it either rejects the
/// input with an error and leaves the state untouched, or mutates the state
/// and returns the effects the caller must carry out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallSession {
    call_state: CallState,
    operation: Operation,
    user_state: UserState,
    caller_info: Option<CallerInfo>,
    is_ready: bool,
    muted: bool,
    session: Option<TrackedSession>,
}

impl Default for CallSession {
    fn default() -> Self {
        Self {
            call_state: CallState::Idle,
            operation: Operation::None,
            user_state: UserState::Idle,
            caller_info: None,
            is_ready: false,
            muted: false,
            session: None,
        }
    }
}

impl CallSession {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn call_state(&self) -> CallState {
        self.call_state
    }

    pub fn operation(&self) -> Operation {
        self.operation
    }

    pub fn user_state(&self) -> UserState {
        self.user_state
    }

    pub fn is_ready(&self) -> bool {
        self.is_ready
    }

    pub fn is_muted(&self) -> bool {
        self.muted
    }

    pub fn session(&self) -> Option<&TrackedSession> {
        self.session.as_ref()
    }

    pub fn caller_info(&self) -> Result<&CallerInfo, VoipError> {
        self.caller_info.as_ref().ok_or(VoipError::NoCallerInfo)
    }

    pub fn apply(&mut self, input: SessionInput) -> Result<Vec<Effect>, VoipError> {
        match input {
            SessionInput::Connect => self.connect(),
            SessionInput::Disconnect => self.disconnect(),
            SessionInput::Connected => Ok(self.connected()),
            SessionInput::ConnectionError(reason) => Ok(self.connection_error(reason)),
            SessionInput::Register => self.start_registration(Operation::Register),
            SessionInput::Unregister => self.start_registration(Operation::Unregister),
            SessionInput::RequestAccepted => Ok(self.request_accepted()),
            SessionInput::RequestRejected(reason) => Ok(self.request_rejected(reason)),
            SessionInput::Invitation { session, caller } => Ok(self.invitation(session, caller)),
            SessionInput::AcceptCall => self.accept_call(),
            SessionInput::RejectCall => self.reject_call(),
            SessionInput::EndCall => self.end_call(),
            SessionInput::MakeCall { session, target } => self.make_call(session, target),
            SessionInput::SetMuted(muted) => self.set_muted(muted),
            SessionInput::SessionStateChanged { session, state } => {
                Ok(self.session_state_changed(session, state))
            }
        }
    }

    fn connect(&mut self) -> Result<Vec<Effect>, VoipError> {
        if self.operation != Operation::None {
            return Err(VoipError::OperationInProgress {
                operation: self.operation,
            });
        }
        self.operation = Operation::Connect;
        Ok(vec![Effect::Command(TransportCommand::Connect)])
    }

    fn disconnect(&mut self) -> Result<Vec<Effect>, VoipError> {
        if self.session.is_some() {
            return Err(VoipError::invalid_state(self.call_state, "disconnect"));
        }
        self.is_ready = false;
        self.call_state = CallState::Idle;
        self.operation = Operation::None;
        self.user_state = UserState::Idle;
        Ok(vec![
            Effect::Emit(VoipEvent::StateChanged(CallState::Idle)),
            Effect::Command(TransportCommand::Disconnect),
        ])
    }

    fn connected(&mut self) -> Vec<Effect> {
        self.is_ready = true;
        if self.operation == Operation::Connect {
            self.operation = Operation::None;
        }
        // a reconnect must not yank the state out from under a live call
        if self.session.is_none() {
            self.call_state = CallState::ServerConnected;
        }
        vec![Effect::Emit(VoipEvent::Connected)]
    }

    fn connection_error(&mut self, reason: String) -> Vec<Effect> {
        warn!(%reason, operation = %self.operation, "transport connection error");
        self.is_ready = false;
        let mut effects = vec![Effect::Emit(VoipEvent::ConnectionError(reason.clone()))];
        // an outstanding registration request is never answered on a dead connection
        match self.operation {
            Operation::Connect => self.operation = Operation::None,
            Operation::Register => {
                self.operation = Operation::None;
                effects.push(Effect::Emit(VoipEvent::RegistrationError(reason)));
            }
            Operation::Unregister => {
                self.operation = Operation::None;
                effects.push(Effect::Emit(VoipEvent::UnregistrationError(reason)));
            }
            _ => {}
        }
        effects
    }

    fn start_registration(&mut self, operation: Operation) -> Result<Vec<Effect>, VoipError> {
        let name = match operation {
            Operation::Register => "register",
            _ => "unregister",
        };
        if self.operation != Operation::None {
            return Err(VoipError::OperationInProgress {
                operation: self.operation,
            });
        }
        if self.session.is_some() {
            return Err(VoipError::invalid_state(self.call_state, name));
        }
        self.operation = operation;
        let command = match operation {
            Operation::Register => TransportCommand::Register,
            _ => TransportCommand::Unregister,
        };
        Ok(vec![Effect::Command(command)])
    }

    fn request_accepted(&mut self) -> Vec<Effect> {
        match self.operation {
            Operation::Register => {
                self.operation = Operation::None;
                self.call_state = CallState::Registered;
                vec![
                    Effect::Emit(VoipEvent::Registered),
                    Effect::Emit(VoipEvent::StateChanged(CallState::Registered)),
                ]
            }
            Operation::Unregister => {
                self.operation = Operation::None;
                self.call_state = CallState::Unregistered;
                vec![
                    Effect::Emit(VoipEvent::Unregistered),
                    Effect::Emit(VoipEvent::StateChanged(CallState::Unregistered)),
                ]
            }
            operation => {
                debug!(%operation, "request accepted with no registration pending");
                vec![]
            }
        }
    }

    fn request_rejected(&mut self, reason: String) -> Vec<Effect> {
        match self.operation {
            Operation::Register => {
                self.operation = Operation::None;
                vec![Effect::Emit(VoipEvent::RegistrationError(reason))]
            }
            Operation::Unregister => {
                self.operation = Operation::None;
                vec![Effect::Emit(VoipEvent::UnregistrationError(reason))]
            }
            operation => {
                debug!(%operation, %reason, "request rejected with no registration pending");
                vec![]
            }
        }
    }

    fn invitation(&mut self, session: SessionId, caller: CallerInfo) -> Vec<Effect> {
        let invitation = Invitation { id: session };
        if self.call_state != CallState::Registered || self.operation != Operation::None {
            warn!(
                session = %invitation.id,
                caller = %caller.caller_id,
                state = %self.call_state,
                "rejecting invitation, not ready for calls"
            );
            return vec![Effect::Command(invitation.reject())];
        }

        info!(
            session = %invitation.id,
            caller = %caller.caller_id,
            host = %caller.host,
            "incoming call"
        );
        self.session = Some(TrackedSession {
            kind: SessionKind::Inbound(invitation),
            state: SessionState::Initial,
        });
        self.operation = Operation::ProcessInvite;
        self.call_state = CallState::OfferReceived;
        self.user_state = UserState::Uas;
        self.caller_info = Some(caller.clone());
        vec![
            Effect::Emit(VoipEvent::IncomingCall(caller)),
            Effect::Emit(VoipEvent::StateChanged(CallState::OfferReceived)),
        ]
    }

    fn accept_call(&mut self) -> Result<Vec<Effect>, VoipError> {
        if self.call_state != CallState::OfferReceived
            || self.operation != Operation::ProcessInvite
        {
            return Err(VoipError::invalid_state(self.call_state, "accept_call"));
        }
        let command = match self.session.as_ref().map(|s| &s.kind) {
            Some(SessionKind::Inbound(invitation)) => invitation.accept(),
            Some(SessionKind::Outbound(_)) => {
                return Err(VoipError::invalid_state(self.call_state, "accept_call"))
            }
            None => return Err(VoipError::NoSession),
        };
        self.call_state = CallState::AnswerSent;
        Ok(vec![
            Effect::Emit(VoipEvent::StateChanged(CallState::AnswerSent)),
            Effect::Command(command),
        ])
    }

    fn reject_call(&mut self) -> Result<Vec<Effect>, VoipError> {
        let session = self.session.as_ref().ok_or(VoipError::NoSession)?;
        if self.call_state != CallState::OfferReceived {
            return Err(VoipError::invalid_state(self.call_state, "reject_call"));
        }
        match &session.kind {
            SessionKind::Inbound(invitation) => Ok(vec![Effect::Command(invitation.reject())]),
            SessionKind::Outbound(_) => Err(VoipError::NotInbound),
        }
    }

    fn end_call(&mut self) -> Result<Vec<Effect>, VoipError> {
        if !matches!(
            self.call_state,
            CallState::OfferSent | CallState::AnswerSent | CallState::InCall
        ) {
            return Err(VoipError::invalid_state(self.call_state, "end_call"));
        }
        let session = self.session.as_ref().ok_or(VoipError::NoSession)?;
        match session.kind.hangup(session.state) {
            Some(command) => Ok(vec![Effect::Command(command)]),
            None => {
                debug!(session = %session.id(), state = %session.state, "session already ending");
                Ok(vec![])
            }
        }
    }

    fn make_call(&mut self, session: SessionId, target: String) -> Result<Vec<Effect>, VoipError> {
        if self.operation != Operation::None {
            return Err(VoipError::OperationInProgress {
                operation: self.operation,
            });
        }
        if self.call_state != CallState::Registered {
            return Err(VoipError::invalid_state(self.call_state, "make_call"));
        }
        info!(session = %session, %target, "outgoing call");
        let command = TransportCommand::Invite {
            session: session.clone(),
            target: target.clone(),
        };
        self.session = Some(TrackedSession {
            kind: SessionKind::Outbound(Inviter {
                id: session,
                target,
            }),
            state: SessionState::Initial,
        });
        self.operation = Operation::MakeCall;
        self.call_state = CallState::OfferSent;
        self.user_state = UserState::Uac;
        Ok(vec![
            Effect::Emit(VoipEvent::StateChanged(CallState::OfferSent)),
            Effect::Command(command),
        ])
    }

    fn set_muted(&mut self, muted: bool) -> Result<Vec<Effect>, VoipError> {
        if self.call_state != CallState::InCall {
            return Err(VoipError::invalid_state(self.call_state, "set_muted"));
        }
        let session = self.session.as_ref().ok_or(VoipError::NoSession)?;
        let command = TransportCommand::SetLocalAudio {
            session: session.id().clone(),
            enabled: !muted,
        };
        self.muted = muted;
        Ok(vec![Effect::Command(command)])
    }

    fn session_state_changed(&mut self, session: SessionId, state: SessionState) -> Vec<Effect> {
        let tracked = match self.session.as_mut() {
            Some(tracked) if tracked.id() == &session => tracked,
            _ => {
                debug!(%session, %state, "discarding callback of stale session");
                return vec![];
            }
        };
        tracked.state = state;

        match state {
            SessionState::Initial | SessionState::Establishing => vec![],
            SessionState::Established => {
                if self.call_state == CallState::InCall {
                    return vec![];
                }
                info!(%session, "call established");
                self.operation = Operation::None;
                self.call_state = CallState::InCall;
                vec![
                    Effect::AttachRemoteMedia(session),
                    Effect::Emit(VoipEvent::CallEstablished),
                    Effect::Emit(VoipEvent::StateChanged(CallState::InCall)),
                ]
            }
            SessionState::Terminating | SessionState::Terminated => {
                info!(%session, %state, "call terminated");
                self.session = None;
                self.caller_info = None;
                self.muted = false;
                self.call_state = CallState::Registered;
                self.operation = Operation::None;
                self.user_state = UserState::Idle;
                vec![
                    Effect::ReleaseRemoteMedia,
                    Effect::Emit(VoipEvent::CallTerminated),
                    Effect::Emit(VoipEvent::StateChanged(CallState::Registered)),
                ]
            }
        }
    }
}
