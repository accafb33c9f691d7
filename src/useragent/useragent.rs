use super::error::VoipError;
use super::state::{CallSession, CallState, Effect, Operation, SessionInput, UserState};
use crate::config::VoipConfig;
use crate::event::{CallerInfo, EventEmitter, Subscription};
use crate::media::{
    stream::EventReceiver as MediaEventReceiver, MemoryRenderTarget, RemoteMediaStream,
    RemoteMediaStreamBuilder, RenderTarget,
};
use crate::transport::{
    IncomingInvitation, SessionId, SessionState, SignalingTransport, TransportCommand,
    TransportEventSink,
};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub struct VoipUserBuilder {
    pub config: Option<VoipConfig>,
    pub cancel_token: Option<CancellationToken>,
    pub transport: Option<Arc<dyn SignalingTransport>>,
    pub render_target: Option<Arc<dyn RenderTarget>>,
}

/// A VoIP endpoint driving one signaling transport.
///
/// All state lives in a [`CallSession`]; every command and transport
/// notification is applied to it under a lock, and the resulting effects
/// are queued in the same order. One caller at a time drains the queue, so
/// a notification the transport delivers while a command is still running
/// has its effects carried out after the command's.
pub struct VoipUser {
    pub config: VoipConfig,
    pub token: CancellationToken,
    transport: Arc<dyn SignalingTransport>,
    render_target: Arc<dyn RenderTarget>,
    session: Mutex<CallSession>,
    pending: Mutex<VecDeque<Vec<Effect>>>,
    executor: tokio::sync::Mutex<()>,
    remote_media: tokio::sync::Mutex<Option<RemoteMediaStream>>,
    events: EventEmitter,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl VoipUserBuilder {
    pub fn new() -> Self {
        Self {
            config: None,
            cancel_token: None,
            transport: None,
            render_target: None,
        }
    }

    pub fn with_config(mut self, config: Option<VoipConfig>) -> Self {
        self.config = config;
        self
    }

    pub fn with_cancel_token(mut self, token: CancellationToken) -> Self {
        self.cancel_token = Some(token);
        self
    }

    pub fn with_transport(mut self, transport: Arc<dyn SignalingTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn with_render_target(mut self, target: Arc<dyn RenderTarget>) -> Self {
        self.render_target = Some(target);
        self
    }

    pub fn build(mut self) -> Result<Arc<VoipUser>> {
        let transport = self
            .transport
            .take()
            .ok_or_else(|| anyhow!("voipuser: signaling transport is required"))?;
        let token = self.cancel_token.take().unwrap_or_default();
        let config = self.config.take().unwrap_or_default();
        let render_target = self
            .render_target
            .take()
            .unwrap_or_else(|| Arc::new(MemoryRenderTarget::new(config.media_target())));

        let ua = Arc::new(VoipUser {
            config,
            token,
            transport,
            render_target,
            session: Mutex::new(CallSession::new()),
            pending: Mutex::new(VecDeque::new()),
            executor: tokio::sync::Mutex::new(()),
            remote_media: tokio::sync::Mutex::new(None),
            events: EventEmitter::new(),
        });

        let sink: Arc<dyn TransportEventSink> = ua.clone();
        let sink: Weak<dyn TransportEventSink> = Arc::downgrade(&sink);
        ua.transport.set_event_sink(sink);
        info!(aor = %ua.config.aor(), "voipuser created");
        Ok(ua)
    }
}

impl Default for VoipUserBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl VoipUser {
    fn lock_session(&self) -> MutexGuard<'_, CallSession> {
        lock(&self.session)
    }

    pub fn subscribe(&self) -> Subscription {
        self.events.subscribe()
    }

    pub fn call_state(&self) -> CallState {
        self.lock_session().call_state()
    }

    pub fn operation_in_progress(&self) -> Operation {
        self.lock_session().operation()
    }

    pub fn user_state(&self) -> UserState {
        self.lock_session().user_state()
    }

    pub fn is_ready(&self) -> bool {
        self.lock_session().is_ready()
    }

    pub fn is_muted(&self) -> bool {
        self.lock_session().is_muted()
    }

    pub fn session_id(&self) -> Option<SessionId> {
        self.lock_session().session().map(|s| s.id().clone())
    }

    /// Caller of the current inbound call.
    pub fn caller_info(&self) -> Result<CallerInfo, VoipError> {
        self.lock_session().caller_info().cloned()
    }

    pub fn snapshot(&self) -> CallSession {
        self.lock_session().clone()
    }

    pub async fn has_remote_media(&self) -> bool {
        self.remote_media.lock().await.is_some()
    }

    pub async fn subscribe_media(&self) -> Option<MediaEventReceiver> {
        self.remote_media.lock().await.as_ref().map(|m| m.subscribe())
    }

    /// Connects the transport to the signaling server.
    pub async fn init(&self) -> Result<(), VoipError> {
        info!(uri = %self.config.web_socket_uri, "connecting to signaling server");
        self.dispatch(SessionInput::Connect).await
    }

    pub async fn register(&self) -> Result<(), VoipError> {
        info!(aor = %self.config.aor(), "registering");
        self.dispatch(SessionInput::Register).await
    }

    pub async fn unregister(&self) -> Result<(), VoipError> {
        info!(aor = %self.config.aor(), "unregistering");
        self.dispatch(SessionInput::Unregister).await
    }

    pub async fn accept_call(&self) -> Result<(), VoipError> {
        self.dispatch(SessionInput::AcceptCall).await
    }

    pub async fn reject_call(&self) -> Result<(), VoipError> {
        self.dispatch(SessionInput::RejectCall).await
    }

    pub async fn end_call(&self) -> Result<(), VoipError> {
        self.dispatch(SessionInput::EndCall).await
    }

    /// Places an outbound call, returns the id of the new session.
    pub async fn make_call(&self, target: &str) -> Result<SessionId, VoipError> {
        let session = format!("call-{}", Uuid::new_v4());
        self.dispatch(SessionInput::MakeCall {
            session: session.clone(),
            target: target.to_string(),
        })
        .await?;
        Ok(session)
    }

    pub async fn set_muted(&self, muted: bool) -> Result<(), VoipError> {
        self.dispatch(SessionInput::SetMuted(muted)).await
    }

    /// Disconnects from the signaling server and stops background work.
    pub async fn close(&self) -> Result<(), VoipError> {
        info!("closing");
        self.dispatch(SessionInput::Disconnect).await?;
        self.token.cancel();
        Ok(())
    }

    async fn dispatch(&self, input: SessionInput) -> Result<(), VoipError> {
        self.enqueue(input)?;
        self.run_pending().await
    }

    fn enqueue(&self, input: SessionInput) -> Result<(), VoipError> {
        let mut session = self.lock_session();
        let effects = session.apply(input)?;
        lock(&self.pending).push_back(effects);
        Ok(())
    }

    /// Drains the effect queue unless another caller already is, in which
    /// case that caller picks up whatever was queued here. Returns the
    /// first failure among the batches this caller executed.
    async fn run_pending(&self) -> Result<(), VoipError> {
        let mut result = Ok(());
        loop {
            let Ok(guard) = self.executor.try_lock() else {
                return result;
            };
            loop {
                let batch = lock(&self.pending).pop_front();
                let Some(effects) = batch else {
                    break;
                };
                let outcome = match self.execute(effects).await {
                    Ok(Some(follow_up)) => self.enqueue(follow_up),
                    Ok(None) => Ok(()),
                    Err(e) => Err(e),
                };
                if let Err(e) = outcome {
                    if result.is_ok() {
                        result = Err(e);
                    } else {
                        warn!("effect failed: {}", e);
                    }
                }
            }
            drop(guard);
            // a batch queued between the last pop and the unlock is ours to run
            if lock(&self.pending).is_empty() {
                return result;
            }
        }
    }

    /// Runs effects in order. Returns a follow-up input when a command
    /// failure has to be fed back into the state machine.
    async fn execute(&self, effects: Vec<Effect>) -> Result<Option<SessionInput>, VoipError> {
        for effect in effects {
            match effect {
                Effect::Command(command) => {
                    if let Some(input) = self.send_command(command).await? {
                        return Ok(Some(input));
                    }
                }
                Effect::AttachRemoteMedia(session) => self.attach_remote_media(&session).await?,
                Effect::ReleaseRemoteMedia => self.release_remote_media().await,
                Effect::Emit(event) => self.events.emit(event),
            }
        }
        Ok(None)
    }

    async fn send_command(
        &self,
        command: TransportCommand,
    ) -> Result<Option<SessionInput>, VoipError> {
        debug!(?command, "transport command");
        let constraints = self.config.media_constraints();
        let result = match &command {
            TransportCommand::Connect => self.transport.connect().await,
            TransportCommand::Disconnect => self.transport.disconnect().await,
            TransportCommand::Register => self.transport.register().await,
            TransportCommand::Unregister => self.transport.unregister().await,
            TransportCommand::Invite { session, target } => {
                self.transport.invite(session, target, &constraints).await
            }
            TransportCommand::Accept(session) => {
                self.transport
                    .accept_invitation(session, &constraints)
                    .await
            }
            TransportCommand::Reject(session) => self.transport.reject_invitation(session).await,
            TransportCommand::Cancel(session) => self.transport.cancel(session).await,
            TransportCommand::Terminate(session) => self.transport.terminate(session).await,
            TransportCommand::SetLocalAudio { session, enabled } => {
                self.transport
                    .set_local_audio_enabled(session, *enabled)
                    .await
            }
        };

        match (result, command) {
            (Ok(_), _) => Ok(None),
            (Err(e), TransportCommand::Register) | (Err(e), TransportCommand::Unregister) => {
                warn!("failed to send registration request: {:?}", e);
                Ok(Some(SessionInput::RequestRejected(e.to_string())))
            }
            (Err(e), TransportCommand::Invite { session, .. }) => {
                warn!(%session, "failed to send invite: {:?}", e);
                Ok(Some(SessionInput::SessionStateChanged {
                    session,
                    state: SessionState::Terminated,
                }))
            }
            (Err(e), TransportCommand::Connect) => {
                warn!("failed to connect: {:?}", e);
                Ok(Some(SessionInput::ConnectionError(e.to_string())))
            }
            (Err(e), command) => {
                warn!(?command, "transport command failed: {:?}", e);
                Err(VoipError::Transport(e))
            }
        }
    }

    async fn attach_remote_media(&self, session: &SessionId) -> Result<(), VoipError> {
        let source = self
            .transport
            .session_description_handler(session)
            .and_then(|handler| handler.remote_media_stream())
            .ok_or(VoipError::RemoteMediaUndefined)?;

        let stream = RemoteMediaStreamBuilder::new()
            .with_id(format!("rms:{}", session))
            .cancel_token(self.token.child_token())
            .build(source, self.render_target.clone());
        stream.start().await?;

        let current = {
            let state = self.lock_session();
            state.call_state() == CallState::InCall
                && state.session().is_some_and(|s| s.id() == session)
        };
        if !current {
            debug!(%session, "call ended while attaching remote media");
            stream.clear().await;
            return Ok(());
        }

        let mut slot = self.remote_media.lock().await;
        if let Some(previous) = slot.take() {
            previous.clear().await;
        }
        *slot = Some(stream);
        Ok(())
    }

    async fn release_remote_media(&self) {
        if let Some(stream) = self.remote_media.lock().await.take() {
            stream.clear().await;
        }
    }
}

#[async_trait]
impl TransportEventSink for VoipUser {
    async fn on_connected(&self) -> Result<()> {
        info!("transport connected");
        Ok(self.dispatch(SessionInput::Connected).await?)
    }

    async fn on_connection_error(&self, reason: String) -> Result<()> {
        Ok(self.dispatch(SessionInput::ConnectionError(reason)).await?)
    }

    async fn on_request_accepted(&self) -> Result<()> {
        Ok(self.dispatch(SessionInput::RequestAccepted).await?)
    }

    async fn on_request_rejected(&self, reason: String) -> Result<()> {
        warn!(%reason, "request rejected");
        Ok(self.dispatch(SessionInput::RequestRejected(reason)).await?)
    }

    async fn on_invite(&self, invitation: IncomingInvitation) -> Result<()> {
        Ok(self
            .dispatch(SessionInput::Invitation {
                session: invitation.session,
                caller: invitation.caller,
            })
            .await?)
    }

    async fn on_session_state(&self, session: SessionId, state: SessionState) -> Result<()> {
        debug!(%session, %state, "session state");
        Ok(self
            .dispatch(SessionInput::SessionStateChanged { session, state })
            .await?)
    }
}
