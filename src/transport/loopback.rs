use super::{
    IncomingInvitation, MediaConstraints, SessionDescriptionHandler, SessionId, SessionState,
    SignalingTransport, TransportCommand, TransportEventSink,
};
use crate::event::CallerInfo;
use crate::media::{MediaSource, MediaTrack, TrackSet};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex, MutexGuard, Weak,
};
use tracing::{debug, info};
use uuid::Uuid;

struct LoopbackSession {
    remote: Option<Arc<TrackSet>>,
}

impl SessionDescriptionHandler for LoopbackSession {
    fn remote_media_stream(&self) -> Option<Arc<dyn MediaSource>> {
        self.remote
            .clone()
            .map(|remote| remote as Arc<dyn MediaSource>)
    }
}

/// In-process transport: records every command it is asked to perform and
/// lets the owner play the remote side by injecting notifications.
///
/// Answering or placing a call negotiates a remote track set (one audio
/// track, plus video when requested) that shows up through the session
/// description handler.
#[derive(Default)]
pub struct LoopbackTransport {
    sink: Mutex<Option<Weak<dyn TransportEventSink>>>,
    commands: Mutex<Vec<TransportCommand>>,
    sessions: Mutex<HashMap<SessionId, Arc<LoopbackSession>>>,
    failing: AtomicBool,
    auto_establish: AtomicBool,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl LoopbackTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every following command fail until switched off again.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Reports `Established` from inside `accept_invitation` and `invite`,
    /// the way an engine answering synchronously does.
    pub fn set_auto_establish(&self, enabled: bool) {
        self.auto_establish.store(enabled, Ordering::SeqCst);
    }

    pub fn commands(&self) -> Vec<TransportCommand> {
        lock(&self.commands).clone()
    }

    pub fn take_commands(&self) -> Vec<TransportCommand> {
        std::mem::take(&mut *lock(&self.commands))
    }

    pub fn last_command(&self) -> Option<TransportCommand> {
        lock(&self.commands).last().cloned()
    }

    /// Remote track set negotiated for `session`, if any.
    pub fn remote_tracks(&self, session: &SessionId) -> Option<Arc<TrackSet>> {
        lock(&self.sessions)
            .get(session)
            .and_then(|s| s.remote.clone())
    }

    /// Drops the negotiated media of `session`, as a broken engine would.
    pub fn drop_remote_media(&self, session: &SessionId) {
        lock(&self.sessions).insert(session.clone(), Arc::new(LoopbackSession { remote: None }));
    }

    fn sink(&self) -> Result<Arc<dyn TransportEventSink>> {
        lock(&self.sink)
            .as_ref()
            .and_then(|sink| sink.upgrade())
            .ok_or_else(|| anyhow!("loopback: no event sink attached"))
    }

    fn record(&self, command: TransportCommand) -> Result<()> {
        debug!(?command, "loopback command");
        if self.failing.load(Ordering::SeqCst) {
            return Err(anyhow!("loopback: transport unavailable"));
        }
        lock(&self.commands).push(command);
        Ok(())
    }

    fn negotiate(&self, session: &SessionId, constraints: &MediaConstraints) {
        let remote = TrackSet::new(format!("remote:{}", session));
        if constraints.audio {
            remote.add_track(MediaTrack::audio(format!("{}-audio", session)));
        }
        if constraints.video {
            remote.add_track(MediaTrack::video(format!("{}-video", session)));
        }
        lock(&self.sessions).insert(
            session.clone(),
            Arc::new(LoopbackSession {
                remote: Some(Arc::new(remote)),
            }),
        );
    }

    async fn establish_inline(&self, session: &SessionId) -> Result<()> {
        if !self.auto_establish.load(Ordering::SeqCst) {
            return Ok(());
        }
        self.set_session_state(session, SessionState::Established)
            .await
    }

    pub async fn emit_connected(&self) -> Result<()> {
        self.sink()?.on_connected().await
    }

    pub async fn emit_connection_error(&self, reason: &str) -> Result<()> {
        self.sink()?.on_connection_error(reason.to_string()).await
    }

    /// Acknowledges the outstanding register or unregister request.
    pub async fn accept_request(&self) -> Result<()> {
        self.sink()?.on_request_accepted().await
    }

    pub async fn reject_request(&self, reason: &str) -> Result<()> {
        self.sink()?.on_request_rejected(reason.to_string()).await
    }

    /// Delivers an inbound call, returns the new session id.
    pub async fn incoming_call(&self, caller: CallerInfo) -> Result<SessionId> {
        let session = format!("inv-{}", Uuid::new_v4());
        info!(%session, caller = %caller.caller_id, "loopback incoming call");
        self.sink()?
            .on_invite(IncomingInvitation {
                session: session.clone(),
                caller,
            })
            .await?;
        Ok(session)
    }

    pub async fn set_session_state(&self, session: &SessionId, state: SessionState) -> Result<()> {
        if state == SessionState::Terminated {
            lock(&self.sessions).remove(session);
        }
        self.sink()?.on_session_state(session.clone(), state).await
    }
}

#[async_trait]
impl SignalingTransport for LoopbackTransport {
    fn set_event_sink(&self, sink: Weak<dyn TransportEventSink>) {
        *lock(&self.sink) = Some(sink);
    }

    async fn connect(&self) -> Result<()> {
        self.record(TransportCommand::Connect)
    }

    async fn disconnect(&self) -> Result<()> {
        self.record(TransportCommand::Disconnect)
    }

    async fn register(&self) -> Result<()> {
        self.record(TransportCommand::Register)
    }

    async fn unregister(&self) -> Result<()> {
        self.record(TransportCommand::Unregister)
    }

    async fn invite(
        &self,
        session: &SessionId,
        target: &str,
        constraints: &MediaConstraints,
    ) -> Result<()> {
        self.record(TransportCommand::Invite {
            session: session.clone(),
            target: target.to_string(),
        })?;
        self.negotiate(session, constraints);
        self.establish_inline(session).await
    }

    async fn accept_invitation(
        &self,
        session: &SessionId,
        constraints: &MediaConstraints,
    ) -> Result<()> {
        self.record(TransportCommand::Accept(session.clone()))?;
        self.negotiate(session, constraints);
        self.establish_inline(session).await
    }

    async fn reject_invitation(&self, session: &SessionId) -> Result<()> {
        self.record(TransportCommand::Reject(session.clone()))
    }

    async fn cancel(&self, session: &SessionId) -> Result<()> {
        self.record(TransportCommand::Cancel(session.clone()))
    }

    async fn terminate(&self, session: &SessionId) -> Result<()> {
        self.record(TransportCommand::Terminate(session.clone()))
    }

    async fn set_local_audio_enabled(&self, session: &SessionId, enabled: bool) -> Result<()> {
        self.record(TransportCommand::SetLocalAudio {
            session: session.clone(),
            enabled,
        })
    }

    fn session_description_handler(
        &self,
        session: &SessionId,
    ) -> Option<Arc<dyn SessionDescriptionHandler>> {
        lock(&self.sessions)
            .get(session)
            .cloned()
            .map(|s| s as Arc<dyn SessionDescriptionHandler>)
    }
}
