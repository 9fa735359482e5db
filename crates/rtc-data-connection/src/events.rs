//! Event emission for connections
//!
//! A [`Connection`](crate::Connection) owns an [`EventEmitter`]; consumers
//! subscribe by [`EventKind`] with a callback, or take an mpsc receiver of
//! every event with [`EventEmitter::events`].

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;

use crate::connection::ConnectionError;
use crate::types::{ChannelMessage, IceCandidate, SessionDescription};

/// Something a connection reports to its consumer
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    /// Local offer ready for delivery to the peer
    Offer(SessionDescription),
    /// Local answer ready for delivery to the peer
    Answer(SessionDescription),
    /// Local candidate ready for delivery to the peer
    Candidate(IceCandidate),
    /// ICE reached the connected state
    Connect,
    Open,
    Close,
    Message(ChannelMessage),
    Error(ConnectionError),
}

impl ConnectionEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            ConnectionEvent::Offer(_) => EventKind::Offer,
            ConnectionEvent::Answer(_) => EventKind::Answer,
            ConnectionEvent::Candidate(_) => EventKind::Candidate,
            ConnectionEvent::Connect => EventKind::Connect,
            ConnectionEvent::Open => EventKind::Open,
            ConnectionEvent::Close => EventKind::Close,
            ConnectionEvent::Message(_) => EventKind::Message,
            ConnectionEvent::Error(_) => EventKind::Error,
        }
    }
}

/// Event names consumers subscribe to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Offer,
    Answer,
    Candidate,
    Connect,
    Open,
    Close,
    Message,
    Error,
}

impl EventKind {
    pub const ALL: [EventKind; 8] = [
        EventKind::Offer,
        EventKind::Answer,
        EventKind::Candidate,
        EventKind::Connect,
        EventKind::Open,
        EventKind::Close,
        EventKind::Message,
        EventKind::Error,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Offer => "offer",
            EventKind::Answer => "answer",
            EventKind::Candidate => "candidate",
            EventKind::Connect => "connect",
            EventKind::Open => "open",
            EventKind::Close => "close",
            EventKind::Message => "message",
            EventKind::Error => "error",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EventKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| format!("unknown event: {}", s))
    }
}

/// Callback invoked for each matching event
pub type EventHandler = Arc<dyn Fn(&ConnectionEvent) + Send + Sync>;

/// Handle returned by `subscribe`, used to unsubscribe
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    id: u64,
    kind: Option<EventKind>,
}

impl Subscription {
    /// Kind this subscription listens to, `None` for all events
    pub fn kind(&self) -> Option<EventKind> {
        self.kind
    }
}

#[derive(Clone)]
enum Sink {
    Handler(EventHandler),
    Stream(mpsc::UnboundedSender<ConnectionEvent>),
}

#[derive(Clone)]
struct Listener {
    id: u64,
    kind: Option<EventKind>,
    sink: Sink,
}

/// Registry of event listeners
#[derive(Default)]
pub struct EventEmitter {
    next_id: AtomicU64,
    listeners: Mutex<Vec<Listener>>,
}

impl EventEmitter {
    pub fn new() -> Self {
        Self::default()
    }

    fn listeners(&self) -> MutexGuard<'_, Vec<Listener>> {
        self.listeners.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn add(&self, kind: Option<EventKind>, sink: Sink) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.listeners().push(Listener { id, kind, sink });
        Subscription { id, kind }
    }

    /// Call `handler` for every event of `kind`
    pub fn subscribe<F>(&self, kind: EventKind, handler: F) -> Subscription
    where
        F: Fn(&ConnectionEvent) + Send + Sync + 'static,
    {
        self.add(Some(kind), Sink::Handler(Arc::new(handler)))
    }

    /// Call `handler` for every event
    pub fn subscribe_all<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&ConnectionEvent) + Send + Sync + 'static,
    {
        self.add(None, Sink::Handler(Arc::new(handler)))
    }

    /// Receive every event on a channel; dropped receivers are pruned on the next emit
    pub fn events(&self) -> mpsc::UnboundedReceiver<ConnectionEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.add(None, Sink::Stream(tx));
        rx
    }

    /// Returns false if the subscription was already removed
    pub fn unsubscribe(&self, subscription: &Subscription) -> bool {
        let mut listeners = self.listeners();
        let before = listeners.len();
        listeners.retain(|l| l.id != subscription.id);
        listeners.len() != before
    }

    /// Listeners that would receive an event of `kind`
    pub fn listener_count(&self, kind: EventKind) -> usize {
        self.listeners()
            .iter()
            .filter(|l| l.kind.map_or(true, |k| k == kind))
            .count()
    }

    /// Deliver an event to every matching listener
    ///
    /// Listeners are snapshotted first, so a handler may subscribe or
    /// unsubscribe while being called.
    pub(crate) fn emit(&self, event: ConnectionEvent) {
        let kind = event.kind();
        let matching: Vec<Listener> = self
            .listeners()
            .iter()
            .filter(|l| l.kind.map_or(true, |k| k == kind))
            .cloned()
            .collect();

        let mut dead = Vec::new();
        for listener in matching {
            match &listener.sink {
                Sink::Handler(handler) => handler(&event),
                Sink::Stream(tx) => {
                    if tx.send(event.clone()).is_err() {
                        dead.push(listener.id);
                    }
                }
            }
        }

        if !dead.is_empty() {
            self.listeners().retain(|l| !dead.contains(&l.id));
        }
    }
}

impl fmt::Debug for EventEmitter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventEmitter")
            .field("listeners", &self.listeners().len())
            .finish()
    }
}
