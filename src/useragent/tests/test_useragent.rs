use crate::{
    config::VoipConfig,
    event::{CallerInfo, Subscription, VoipEvent},
    media::{MediaStreamEvent, MediaTrack, MemoryRenderTarget},
    transport::{LoopbackTransport, SessionState, TransportCommand},
    useragent::{CallState, Operation, UserState, VoipError, VoipUser, VoipUserBuilder},
};
use anyhow::Result;
use std::{sync::Arc, time::Duration};
use tokio::time::timeout;

struct TestAgent {
    ua: Arc<VoipUser>,
    transport: Arc<LoopbackTransport>,
    target: Arc<MemoryRenderTarget>,
    events: Subscription,
}

fn create_test_agent(enable_video: bool) -> Result<TestAgent> {
    let config = VoipConfig {
        auth_user_name: "1001".to_string(),
        auth_password: "secret".to_string(),
        sip_registrar_hostname_or_ip: "pbx.example.com".to_string(),
        web_socket_uri: "wss://pbx.example.com/ws".to_string(),
        enable_video,
        ..Default::default()
    };
    let transport = Arc::new(LoopbackTransport::new());
    let target = Arc::new(MemoryRenderTarget::new("remote-media"));
    let ua = VoipUserBuilder::new()
        .with_config(Some(config))
        .with_transport(transport.clone())
        .with_render_target(target.clone())
        .build()?;
    let events = ua.subscribe();
    Ok(TestAgent {
        ua,
        transport,
        target,
        events,
    })
}

async fn create_registered_agent() -> Result<TestAgent> {
    let mut agent = create_test_agent(false)?;
    agent.ua.init().await?;
    agent.transport.emit_connected().await?;
    agent.ua.register().await?;
    agent.transport.accept_request().await?;
    agent.transport.take_commands();
    agent.events.drain();
    Ok(agent)
}

async fn create_agent_in_call() -> Result<(TestAgent, String)> {
    let mut agent = create_registered_agent().await?;
    let session = agent
        .transport
        .incoming_call(CallerInfo::new("alice", "example.com"))
        .await?;
    agent.ua.accept_call().await?;
    agent
        .transport
        .set_session_state(&session, SessionState::Established)
        .await?;
    agent.transport.take_commands();
    agent.events.drain();
    Ok((agent, session))
}

#[tokio::test]
async fn test_connect_and_register() -> Result<()> {
    let mut agent = create_test_agent(false)?;
    assert_eq!(agent.ua.call_state(), CallState::Idle);
    assert!(!agent.ua.is_ready());

    agent.ua.init().await?;
    assert_eq!(agent.ua.operation_in_progress(), Operation::Connect);
    agent.transport.emit_connected().await?;
    assert_eq!(agent.ua.call_state(), CallState::ServerConnected);
    assert!(agent.ua.is_ready());

    agent.ua.register().await?;
    assert_eq!(agent.ua.operation_in_progress(), Operation::Register);
    agent.transport.accept_request().await?;

    assert_eq!(agent.ua.call_state(), CallState::Registered);
    assert_eq!(agent.ua.operation_in_progress(), Operation::None);
    assert_eq!(
        agent.transport.commands(),
        vec![TransportCommand::Connect, TransportCommand::Register]
    );
    assert_eq!(
        agent.events.drain(),
        vec![
            VoipEvent::Connected,
            VoipEvent::Registered,
            VoipEvent::StateChanged(CallState::Registered),
        ]
    );
    Ok(())
}

#[tokio::test]
async fn test_registration_rejected() -> Result<()> {
    let mut agent = create_test_agent(false)?;
    agent.ua.init().await?;
    agent.transport.emit_connected().await?;
    agent.events.drain();

    agent.ua.register().await?;
    agent.transport.reject_request("403 Forbidden").await?;

    assert_eq!(agent.ua.call_state(), CallState::ServerConnected);
    assert_eq!(agent.ua.operation_in_progress(), Operation::None);
    assert_eq!(
        agent.events.drain(),
        vec![VoipEvent::RegistrationError("403 Forbidden".to_string())]
    );
    Ok(())
}

#[tokio::test]
async fn test_register_send_failure_is_reported_as_event() -> Result<()> {
    let mut agent = create_registered_agent().await?;
    agent.transport.set_failing(true);

    agent.ua.unregister().await?;
    assert_eq!(agent.ua.operation_in_progress(), Operation::None);
    assert_eq!(agent.ua.call_state(), CallState::Registered);
    match agent.events.drain().as_slice() {
        [VoipEvent::UnregistrationError(reason)] => {
            assert!(reason.contains("unavailable"))
        }
        other => panic!("unexpected events: {:?}", other),
    }
    Ok(())
}

#[tokio::test]
async fn test_unregister() -> Result<()> {
    let mut agent = create_registered_agent().await?;
    agent.ua.unregister().await?;
    agent.transport.accept_request().await?;
    assert_eq!(agent.ua.call_state(), CallState::Unregistered);
    assert_eq!(agent.ua.operation_in_progress(), Operation::None);
    assert_eq!(
        agent.events.drain(),
        vec![
            VoipEvent::Unregistered,
            VoipEvent::StateChanged(CallState::Unregistered),
        ]
    );
    Ok(())
}

#[tokio::test]
async fn test_connection_error() -> Result<()> {
    let mut agent = create_registered_agent().await?;
    agent.transport.emit_connection_error("socket closed").await?;
    assert!(!agent.ua.is_ready());
    assert_eq!(
        agent.events.drain(),
        vec![VoipEvent::ConnectionError("socket closed".to_string())]
    );
    Ok(())
}

#[tokio::test]
async fn test_incoming_call_while_registered() -> Result<()> {
    let mut agent = create_registered_agent().await?;
    let caller = CallerInfo::new("alice", "example.com");
    agent.transport.incoming_call(caller.clone()).await?;

    assert_eq!(agent.ua.call_state(), CallState::OfferReceived);
    assert_eq!(agent.ua.operation_in_progress(), Operation::ProcessInvite);
    assert_eq!(agent.ua.user_state(), UserState::Uas);
    assert_eq!(agent.ua.caller_info()?.caller_id, "alice");
    assert_eq!(agent.ua.caller_info()?.host, "example.com");

    let events = agent.events.drain();
    let incoming = events
        .iter()
        .filter(|e| matches!(e, VoipEvent::IncomingCall(_)))
        .count();
    assert_eq!(incoming, 1);
    assert_eq!(events[0], VoipEvent::IncomingCall(caller));
    Ok(())
}

#[tokio::test]
async fn test_incoming_call_while_idle_is_rejected() -> Result<()> {
    let mut agent = create_test_agent(false)?;
    let session = agent
        .transport
        .incoming_call(CallerInfo::new("alice", "example.com"))
        .await?;

    assert_eq!(
        agent.transport.commands(),
        vec![TransportCommand::Reject(session)]
    );
    assert_eq!(agent.ua.call_state(), CallState::Idle);
    assert_eq!(agent.ua.operation_in_progress(), Operation::None);
    assert!(matches!(agent.ua.caller_info(), Err(VoipError::NoCallerInfo)));
    assert!(agent.events.drain().is_empty());
    Ok(())
}

#[tokio::test]
async fn test_accept_establish_and_terminate() -> Result<()> {
    let mut agent = create_registered_agent().await?;
    let session = agent
        .transport
        .incoming_call(CallerInfo::new("alice", "example.com"))
        .await?;
    agent.events.drain();

    agent.ua.accept_call().await?;
    assert_eq!(agent.ua.call_state(), CallState::AnswerSent);
    assert_eq!(
        agent.transport.last_command(),
        Some(TransportCommand::Accept(session.clone()))
    );

    agent
        .transport
        .set_session_state(&session, SessionState::Established)
        .await?;
    assert_eq!(agent.ua.call_state(), CallState::InCall);
    assert_eq!(agent.ua.operation_in_progress(), Operation::None);
    assert!(agent.ua.has_remote_media().await);
    assert_eq!(
        agent.target.tracks(),
        vec![MediaTrack::audio(format!("{}-audio", session))]
    );
    assert!(agent.target.is_playing());
    assert!(agent.events.drain().contains(&VoipEvent::CallEstablished));

    agent
        .transport
        .set_session_state(&session, SessionState::Terminated)
        .await?;
    assert_eq!(agent.ua.call_state(), CallState::Registered);
    assert_eq!(agent.ua.user_state(), UserState::Idle);
    assert!(agent.ua.caller_info().is_err());
    assert!(!agent.ua.has_remote_media().await);
    assert!(agent.target.tracks().is_empty());
    assert!(!agent.target.is_playing());
    assert_eq!(
        agent.events.drain(),
        vec![
            VoipEvent::CallTerminated,
            VoipEvent::StateChanged(CallState::Registered),
        ]
    );
    Ok(())
}

#[tokio::test]
async fn test_video_call_renders_both_tracks() -> Result<()> {
    let mut agent = create_test_agent(true)?;
    agent.ua.init().await?;
    agent.transport.emit_connected().await?;
    agent.ua.register().await?;
    agent.transport.accept_request().await?;
    let session = agent
        .transport
        .incoming_call(CallerInfo::new("alice", "example.com"))
        .await?;
    agent.ua.accept_call().await?;
    agent
        .transport
        .set_session_state(&session, SessionState::Established)
        .await?;
    assert_eq!(agent.target.tracks().len(), 2);
    Ok(())
}

#[tokio::test]
async fn test_remote_tracks_follow_the_source() -> Result<()> {
    let (agent, session) = create_agent_in_call().await?;
    let mut media_events = agent.ua.subscribe_media().await.expect("remote media");
    let remote = agent.transport.remote_tracks(&session).expect("negotiated");

    remote.add_track(MediaTrack::video("late-video"));
    let event = timeout(Duration::from_secs(1), media_events.recv()).await??;
    assert_eq!(event, MediaStreamEvent::TrackStart("late-video".to_string()));
    assert_eq!(agent.target.tracks().len(), 2);

    remote.remove_track(&"late-video".to_string());
    let event = timeout(Duration::from_secs(1), media_events.recv()).await??;
    assert_eq!(event, MediaStreamEvent::TrackStop("late-video".to_string()));
    assert_eq!(agent.target.tracks().len(), 1);
    Ok(())
}

#[tokio::test]
async fn test_missing_remote_media_is_fatal() -> Result<()> {
    let mut agent = create_registered_agent().await?;
    let session = agent
        .transport
        .incoming_call(CallerInfo::new("alice", "example.com"))
        .await?;
    agent.ua.accept_call().await?;
    agent.transport.drop_remote_media(&session);

    let err = agent
        .transport
        .set_session_state(&session, SessionState::Established)
        .await
        .unwrap_err();
    assert!(matches!(
        err.downcast_ref::<VoipError>(),
        Some(VoipError::RemoteMediaUndefined)
    ));
    assert_eq!(err.to_string(), "remote media stream undefined");
    assert!(!agent.events.drain().contains(&VoipEvent::CallEstablished));
    Ok(())
}

#[tokio::test]
async fn test_end_call_dispatch() -> Result<()> {
    let (agent, session) = create_agent_in_call().await?;
    agent.ua.end_call().await?;
    assert_eq!(
        agent.transport.commands(),
        vec![TransportCommand::Terminate(session.clone())]
    );
    assert_eq!(agent.ua.call_state(), CallState::InCall);

    let mut agent = create_registered_agent().await?;
    let session = agent
        .transport
        .incoming_call(CallerInfo::new("alice", "example.com"))
        .await?;
    agent.ua.accept_call().await?;
    agent.transport.take_commands();
    agent.ua.end_call().await?;
    assert_eq!(
        agent.transport.commands(),
        vec![TransportCommand::Reject(session.clone())]
    );

    agent
        .transport
        .set_session_state(&session, SessionState::Terminating)
        .await?;
    assert!(agent.ua.end_call().await.is_err());
    assert!(agent.events.drain().contains(&VoipEvent::CallTerminated));
    Ok(())
}

#[tokio::test]
async fn test_guards_do_not_mutate_state() -> Result<()> {
    let agent = create_registered_agent().await?;
    let before = agent.ua.snapshot();

    assert!(matches!(
        agent.ua.end_call().await,
        Err(VoipError::InvalidState { .. })
    ));
    assert!(matches!(
        agent.ua.accept_call().await,
        Err(VoipError::InvalidState { .. })
    ));
    assert!(matches!(
        agent.ua.reject_call().await,
        Err(VoipError::NoSession)
    ));
    assert!(agent.ua.set_muted(true).await.is_err());

    assert_eq!(agent.ua.snapshot(), before);
    assert!(agent.transport.commands().is_empty());
    Ok(())
}

#[tokio::test]
async fn test_reject_incoming_call() -> Result<()> {
    let mut agent = create_registered_agent().await?;
    let session = agent
        .transport
        .incoming_call(CallerInfo::new("alice", "example.com"))
        .await?;
    agent.ua.reject_call().await?;
    assert_eq!(
        agent.transport.last_command(),
        Some(TransportCommand::Reject(session.clone()))
    );
    agent
        .transport
        .set_session_state(&session, SessionState::Terminated)
        .await?;
    assert_eq!(agent.ua.call_state(), CallState::Registered);
    assert!(!agent.ua.has_remote_media().await);
    assert!(agent.events.drain().contains(&VoipEvent::CallTerminated));
    Ok(())
}

#[tokio::test]
async fn test_stale_session_callbacks_are_ignored() -> Result<()> {
    let (mut agent, first) = create_agent_in_call().await?;
    agent
        .transport
        .set_session_state(&first, SessionState::Terminated)
        .await?;
    let second = agent
        .transport
        .incoming_call(CallerInfo::new("bob", "example.com"))
        .await?;
    agent.events.drain();
    let before = agent.ua.snapshot();

    agent
        .transport
        .set_session_state(&first, SessionState::Established)
        .await?;
    agent
        .transport
        .set_session_state(&first, SessionState::Terminated)
        .await?;

    assert_eq!(agent.ua.snapshot(), before);
    assert_eq!(agent.ua.session_id(), Some(second));
    assert_eq!(agent.ua.caller_info()?.caller_id, "bob");
    assert!(agent.events.drain().is_empty());
    Ok(())
}

#[tokio::test]
async fn test_outbound_call() -> Result<()> {
    let mut agent = create_registered_agent().await?;
    let session = agent.ua.make_call("sip:2002@pbx.example.com").await?;
    assert_eq!(agent.ua.call_state(), CallState::OfferSent);
    assert_eq!(agent.ua.user_state(), UserState::Uac);
    assert!(agent.ua.caller_info().is_err());
    assert!(matches!(
        agent.ua.reject_call().await,
        Err(VoipError::InvalidState { .. })
    ));

    agent.ua.end_call().await?;
    assert_eq!(
        agent.transport.commands(),
        vec![
            TransportCommand::Invite {
                session: session.clone(),
                target: "sip:2002@pbx.example.com".to_string(),
            },
            TransportCommand::Cancel(session.clone()),
        ]
    );

    agent
        .transport
        .set_session_state(&session, SessionState::Established)
        .await?;
    assert_eq!(agent.ua.call_state(), CallState::InCall);
    assert!(agent.ua.has_remote_media().await);
    assert!(agent.events.drain().contains(&VoipEvent::CallEstablished));
    Ok(())
}

#[tokio::test]
async fn test_mute_in_call() -> Result<()> {
    let (agent, session) = create_agent_in_call().await?;
    agent.ua.set_muted(true).await?;
    assert!(agent.ua.is_muted());
    assert_eq!(
        agent.transport.last_command(),
        Some(TransportCommand::SetLocalAudio {
            session: session.clone(),
            enabled: false,
        })
    );
    agent.ua.set_muted(false).await?;
    assert!(!agent.ua.is_muted());
    Ok(())
}

#[tokio::test]
async fn test_failed_accept_is_returned() -> Result<()> {
    let agent = create_registered_agent().await?;
    agent
        .transport
        .incoming_call(CallerInfo::new("alice", "example.com"))
        .await?;
    agent.transport.set_failing(true);
    assert!(matches!(
        agent.ua.accept_call().await,
        Err(VoipError::Transport(_))
    ));
    Ok(())
}

#[tokio::test]
async fn test_close() -> Result<()> {
    let mut agent = create_registered_agent().await?;
    agent.ua.close().await?;
    assert_eq!(agent.transport.commands(), vec![TransportCommand::Disconnect]);
    assert_eq!(agent.ua.call_state(), CallState::Idle);
    assert!(!agent.ua.is_ready());
    assert!(agent.ua.token.is_cancelled());
    assert_eq!(
        agent.events.drain(),
        vec![VoipEvent::StateChanged(CallState::Idle)]
    );
    Ok(())
}

#[tokio::test]
async fn test_close_during_call_fails() -> Result<()> {
    let (agent, _) = create_agent_in_call().await?;
    assert!(agent.ua.close().await.is_err());
    assert!(!agent.ua.token.is_cancelled());
    Ok(())
}

#[tokio::test]
async fn test_builder_requires_transport() {
    assert!(VoipUserBuilder::new().build().is_err());
}

#[tokio::test]
async fn test_outbound_call_send_failure() -> Result<()> {
    let mut agent = create_registered_agent().await?;
    agent.transport.set_failing(true);

    agent.ua.make_call("sip:2002@pbx.example.com").await?;
    assert_eq!(agent.ua.call_state(), CallState::Registered);
    assert_eq!(agent.ua.user_state(), UserState::Idle);
    assert_eq!(agent.ua.operation_in_progress(), Operation::None);
    assert!(agent.ua.session_id().is_none());
    assert_eq!(
        agent.events.drain(),
        vec![
            VoipEvent::StateChanged(CallState::OfferSent),
            VoipEvent::CallTerminated,
            VoipEvent::StateChanged(CallState::Registered),
        ]
    );
    Ok(())
}

#[tokio::test]
async fn test_inline_establishment_keeps_event_order() -> Result<()> {
    let mut agent = create_registered_agent().await?;
    agent.transport.set_auto_establish(true);

    let session = agent
        .transport
        .incoming_call(CallerInfo::new("alice", "example.com"))
        .await?;
    agent.events.drain();
    agent.ua.accept_call().await?;
    assert_eq!(agent.ua.call_state(), CallState::InCall);
    assert!(agent.ua.has_remote_media().await);
    assert_eq!(
        agent.events.drain(),
        vec![
            VoipEvent::StateChanged(CallState::AnswerSent),
            VoipEvent::CallEstablished,
            VoipEvent::StateChanged(CallState::InCall),
        ]
    );

    agent
        .transport
        .set_session_state(&session, SessionState::Terminated)
        .await?;
    agent.events.drain();

    agent.ua.make_call("sip:2002@pbx.example.com").await?;
    assert_eq!(agent.ua.call_state(), CallState::InCall);
    assert_eq!(
        agent.events.drain(),
        vec![
            VoipEvent::StateChanged(CallState::OfferSent),
            VoipEvent::CallEstablished,
            VoipEvent::StateChanged(CallState::InCall),
        ]
    );
    assert_eq!(agent.target.tracks().len(), 1);
    Ok(())
}

#[tokio::test]
async fn test_connection_loss_during_registration() -> Result<()> {
    let mut agent = create_test_agent(false)?;
    agent.ua.init().await?;
    agent.transport.emit_connected().await?;
    agent.ua.register().await?;
    agent.transport.emit_connection_error("socket closed").await?;
    assert_eq!(agent.ua.operation_in_progress(), Operation::None);

    agent.transport.emit_connected().await?;
    assert_eq!(agent.ua.call_state(), CallState::ServerConnected);
    agent.ua.register().await?;
    agent.transport.accept_request().await?;
    assert_eq!(agent.ua.call_state(), CallState::Registered);
    assert_eq!(
        agent.events.drain(),
        vec![
            VoipEvent::Connected,
            VoipEvent::ConnectionError("socket closed".to_string()),
            VoipEvent::RegistrationError("socket closed".to_string()),
            VoipEvent::Connected,
            VoipEvent::Registered,
            VoipEvent::StateChanged(CallState::Registered),
        ]
    );
    Ok(())
}
