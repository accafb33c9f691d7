use crate::event::CallerInfo;
use crate::media::MediaSource;
use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, Weak};

pub mod loopback;
pub use loopback::LoopbackTransport;

pub type SessionId = String;

/// Sub-state of a transport level session (an INVITE dialog).
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Initial,
    Establishing,
    Established,
    Terminating,
    Terminated,
}

impl SessionState {
    pub fn is_ending(&self) -> bool {
        matches!(self, SessionState::Terminating | SessionState::Terminated)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Initial => "initial",
            SessionState::Establishing => "establishing",
            SessionState::Established => "established",
            SessionState::Terminating => "terminating",
            SessionState::Terminated => "terminated",
        };
        f.write_str(name)
    }
}

/// Media requested when answering or placing a call.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct MediaConstraints {
    pub audio: bool,
    pub video: bool,
}

impl Default for MediaConstraints {
    fn default() -> Self {
        Self {
            audio: true,
            video: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncomingInvitation {
    pub session: SessionId,
    pub caller: CallerInfo,
}

/// A single request the user agent wants the transport to perform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportCommand {
    Connect,
    Disconnect,
    Register,
    Unregister,
    Invite { session: SessionId, target: String },
    Accept(SessionId),
    Reject(SessionId),
    Cancel(SessionId),
    Terminate(SessionId),
    SetLocalAudio { session: SessionId, enabled: bool },
}

/// The negotiated media of one session.
pub trait SessionDescriptionHandler: Send + Sync {
    fn remote_media_stream(&self) -> Option<Arc<dyn MediaSource>>;
}

/// SIP signaling engine the user agent drives.
///
/// Outcomes of `connect`, `register` and `unregister` are reported back
/// asynchronously through the attached [`TransportEventSink`]; the returned
/// `Result` only covers failing to issue the request.
#[async_trait]
pub trait SignalingTransport: Send + Sync {
    fn set_event_sink(&self, sink: Weak<dyn TransportEventSink>);

    async fn connect(&self) -> Result<()>;
    async fn disconnect(&self) -> Result<()>;
    async fn register(&self) -> Result<()>;
    async fn unregister(&self) -> Result<()>;
    async fn invite(
        &self,
        session: &SessionId,
        target: &str,
        constraints: &MediaConstraints,
    ) -> Result<()>;
    async fn accept_invitation(
        &self,
        session: &SessionId,
        constraints: &MediaConstraints,
    ) -> Result<()>;
    async fn reject_invitation(&self, session: &SessionId) -> Result<()>;
    async fn cancel(&self, session: &SessionId) -> Result<()>;
    /// Sends BYE on an established session.
    async fn terminate(&self, session: &SessionId) -> Result<()>;
    async fn set_local_audio_enabled(&self, session: &SessionId, enabled: bool) -> Result<()>;

    fn session_description_handler(
        &self,
        session: &SessionId,
    ) -> Option<Arc<dyn SessionDescriptionHandler>>;
}

/// Notifications a transport delivers to its user agent, in order.
///
/// Register and unregister acknowledgments carry no operation tag; the
/// receiver matches them against the operation it has outstanding.
#[async_trait]
pub trait TransportEventSink: Send + Sync {
    async fn on_connected(&self) -> Result<()>;
    async fn on_connection_error(&self, reason: String) -> Result<()>;
    async fn on_request_accepted(&self) -> Result<()>;
    async fn on_request_rejected(&self, reason: String) -> Result<()>;
    async fn on_invite(&self, invitation: IncomingInvitation) -> Result<()>;
    async fn on_session_state(&self, session: SessionId, state: SessionState) -> Result<()>;
}
