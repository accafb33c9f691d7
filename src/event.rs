use crate::useragent::CallState;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

/// Identity of the remote party of an inbound call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallerInfo {
    pub caller_id: String,
    pub caller_name: Option<String>,
    pub host: String,
}

impl CallerInfo {
    pub fn new(caller_id: impl Into<String>, host: impl Into<String>) -> Self {
        Self {
            caller_id: caller_id.into(),
            caller_name: None,
            host: host.into(),
        }
    }

    pub fn with_name(mut self, caller_name: impl Into<String>) -> Self {
        self.caller_name = Some(caller_name.into());
        self
    }

    /// Display name if one was supplied, otherwise the caller id.
    pub fn display_name(&self) -> &str {
        self.caller_name.as_deref().unwrap_or(&self.caller_id)
    }
}

/// VoipEvent is what the user agent reports to the UI layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum VoipEvent {
    /// Transport connected to the signaling server
    #[serde(rename = "connected")]
    Connected,

    /// Transport lost or failed to establish its connection
    #[serde(rename = "connectionerror")]
    ConnectionError(String),

    #[serde(rename = "registered")]
    Registered,

    #[serde(rename = "unregistered")]
    Unregistered,

    /// Registrar refused the REGISTER
    #[serde(rename = "registrationerror")]
    RegistrationError(String),

    #[serde(rename = "unregistrationerror")]
    UnregistrationError(String),

    /// Inbound call offered
    #[serde(rename = "incomingcall")]
    IncomingCall(CallerInfo),

    #[serde(rename = "callestablished")]
    CallEstablished,

    #[serde(rename = "callterminated")]
    CallTerminated,

    /// Call state changed, carries the new state
    #[serde(rename = "stateChanged")]
    StateChanged(CallState),
}

impl VoipEvent {
    pub fn name(&self) -> &'static str {
        match self {
            VoipEvent::Connected => "connected",
            VoipEvent::ConnectionError(_) => "connectionerror",
            VoipEvent::Registered => "registered",
            VoipEvent::Unregistered => "unregistered",
            VoipEvent::RegistrationError(_) => "registrationerror",
            VoipEvent::UnregistrationError(_) => "unregistrationerror",
            VoipEvent::IncomingCall(_) => "incomingcall",
            VoipEvent::CallEstablished => "callestablished",
            VoipEvent::CallTerminated => "callterminated",
            VoipEvent::StateChanged(_) => "stateChanged",
        }
    }
}

pub type EventSender = mpsc::UnboundedSender<VoipEvent>;
pub type EventReceiver = mpsc::UnboundedReceiver<VoipEvent>;

type SubscriberList = Mutex<Vec<(Uuid, EventSender)>>;

fn lock_subscribers(list: &SubscriberList) -> MutexGuard<'_, Vec<(Uuid, EventSender)>> {
    match list.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Ordered multicast of [`VoipEvent`]s.
///
/// `emit` hands the event to every live subscriber before returning, in
/// subscription order. Subscribers only see events emitted after they
/// subscribed.
#[derive(Default)]
pub struct EventEmitter {
    subscribers: Arc<SubscriberList>,
}

impl EventEmitter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> Subscription {
        let id = Uuid::new_v4();
        let (sender, receiver) = mpsc::unbounded_channel();
        lock_subscribers(&self.subscribers).push((id, sender));
        debug!(subscription = %id, "event subscriber added");
        Subscription {
            id,
            receiver,
            subscribers: Arc::downgrade(&self.subscribers),
        }
    }

    pub fn unsubscribe(&self, id: Uuid) -> bool {
        let mut subscribers = lock_subscribers(&self.subscribers);
        let before = subscribers.len();
        subscribers.retain(|(sid, _)| *sid != id);
        before != subscribers.len()
    }

    pub fn emit(&self, event: VoipEvent) {
        let mut subscribers = lock_subscribers(&self.subscribers);
        debug!(
            event = event.name(),
            subscribers = subscribers.len(),
            "emit event"
        );
        subscribers.retain(|(_, sender)| sender.send(event.clone()).is_ok());
    }

    pub fn subscriber_count(&self) -> usize {
        lock_subscribers(&self.subscribers).len()
    }
}

/// A live view on the event stream. Dropping it unsubscribes.
pub struct Subscription {
    id: Uuid,
    receiver: EventReceiver,
    subscribers: Weak<SubscriberList>,
}

impl Subscription {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub async fn recv(&mut self) -> Option<VoipEvent> {
        self.receiver.recv().await
    }

    /// Next already-delivered event, if any.
    pub fn try_recv(&mut self) -> Option<VoipEvent> {
        self.receiver.try_recv().ok()
    }

    /// Drains everything delivered so far.
    pub fn drain(&mut self) -> Vec<VoipEvent> {
        let mut events = Vec::new();
        while let Some(event) = self.try_recv() {
            events.push(event);
        }
        events
    }

    pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(subscribers) = self.subscribers.upgrade() {
            lock_subscribers(&subscribers).retain(|(sid, _)| *sid != self.id);
        }
    }
}
