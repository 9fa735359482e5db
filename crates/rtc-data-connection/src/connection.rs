//! Data channel connection state machine
//!
//! A [`Connection`] owns one transport peer connection and at most one
//! data channel. It relays transport notifications to its consumer as
//! [`ConnectionEvent`]s, and consumer calls (offer, answer, remote
//! descriptions, candidates, sends) into the transport.

use bytes::Bytes;
use std::fmt;
use std::sync::{Arc, Weak};
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::config::ConnectionConfig;
use crate::events::{ConnectionEvent, EventEmitter, EventKind, Subscription};
use crate::sdp::{normalize_candidate, rewrite_description};
use crate::transport::{ChannelHandle, PeerConnectionFactory, PeerHandle, TransportError};
use crate::types::{
    ChannelMessage, ChannelState, ConnectionState, IceCandidate, IceConnectionState, Role,
    SdpType, SessionDescription, DATA_CHANNEL_LABEL,
};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConnectionError {
    /// The transport could not produce an offer or answer
    #[error("Negotiation failed: {0}")]
    Negotiation(String),
    #[error("Invalid state: {0}")]
    InvalidState(String),
    #[error("Operation not valid for {0}")]
    WrongRole(Role),
    #[error("Invalid config: {0}")]
    InvalidConfig(String),
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("Connection closed")]
    Closed,
}

/// Offer/answer progress, guarded by one lock so signaling calls are serialized
#[derive(Default)]
struct Negotiation {
    local: Option<SdpType>,
    remote: Option<SdpType>,
    /// Candidates received before the remote description was committed
    pending_candidates: Vec<IceCandidate>,
}

struct Inner {
    role: Role,
    config: ConnectionConfig,
    state: RwLock<ConnectionState>,
    peer: RwLock<Option<Arc<dyn PeerHandle>>>,
    channel: RwLock<Option<Arc<dyn ChannelHandle>>>,
    negotiation: Mutex<Negotiation>,
    events: EventEmitter,
}

impl Inner {
    async fn is_closed(&self) -> bool {
        *self.state.read().await == ConnectionState::Closed
    }

    async fn peer(&self) -> Result<Arc<dyn PeerHandle>, ConnectionError> {
        self.peer.read().await.clone().ok_or(ConnectionError::Closed)
    }

    /// Emit a failure and hand it back for the caller to return
    fn fail(&self, err: ConnectionError) -> ConnectionError {
        warn!("[{}] {}", self.role, err);
        self.events.emit(ConnectionEvent::Error(err.clone()));
        err
    }
}

/// Peer-to-peer data channel connection
///
/// Cloning gives another handle to the same connection.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

impl Connection {
    /// Create a connection and its transport peer connection
    ///
    /// The transport is supplied by `factory`; the connection starts in
    /// [`ConnectionState::Negotiating`].
    pub async fn new(
        role: Role,
        config: ConnectionConfig,
        factory: &dyn PeerConnectionFactory,
    ) -> Result<Self, ConnectionError> {
        config.validate().map_err(ConnectionError::InvalidConfig)?;

        let peer = factory
            .create_peer(&config.peer_connection.ice_servers, &config.constraints)
            .await?;

        let inner = Arc::new(Inner {
            role,
            config,
            state: RwLock::new(ConnectionState::New),
            peer: RwLock::new(Some(peer.clone())),
            channel: RwLock::new(None),
            negotiation: Mutex::new(Negotiation::default()),
            events: EventEmitter::new(),
        });

        register_peer_listeners(&inner, peer.as_ref());
        *inner.state.write().await = ConnectionState::Negotiating;
        debug!("[{}] Peer connection created", role);

        Ok(Self { inner })
    }

    pub fn role(&self) -> Role {
        self.inner.role
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.inner.config
    }

    pub async fn state(&self) -> ConnectionState {
        *self.inner.state.read().await
    }

    /// Whether a data channel is held and reports `open`
    pub async fn is_open(&self) -> bool {
        self.inner
            .channel
            .read()
            .await
            .as_ref()
            .map_or(false, |c| c.ready_state() == ChannelState::Open)
    }

    pub fn subscribe<F>(&self, kind: EventKind, handler: F) -> Subscription
    where
        F: Fn(&ConnectionEvent) + Send + Sync + 'static,
    {
        self.inner.events.subscribe(kind, handler)
    }

    pub fn subscribe_all<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&ConnectionEvent) + Send + Sync + 'static,
    {
        self.inner.events.subscribe_all(handler)
    }

    pub fn unsubscribe(&self, subscription: &Subscription) -> bool {
        self.inner.events.unsubscribe(subscription)
    }

    /// Every event this connection emits, from now on
    pub fn events(&self) -> tokio::sync::mpsc::UnboundedReceiver<ConnectionEvent> {
        self.inner.events.events()
    }

    /// Create the data channel and an offer; emits `offer` on success
    ///
    /// Initiator only. A failed offer emits `error` and may be retried.
    pub async fn create_offer(&self) -> Result<SessionDescription, ConnectionError> {
        let inner = &self.inner;
        if inner.role != Role::Initiator {
            return Err(ConnectionError::WrongRole(inner.role));
        }
        if inner.is_closed().await {
            return Err(ConnectionError::Closed);
        }

        let mut negotiation = inner.negotiation.lock().await;
        if negotiation.local.is_some() {
            return Err(ConnectionError::InvalidState(
                "offer already created".to_string(),
            ));
        }
        let peer = inner.peer().await?;

        // The channel must exist before the offer so the SDP carries it
        if inner.channel.read().await.is_none() {
            let channel = peer
                .create_data_channel(DATA_CHANNEL_LABEL, inner.config.channel_options())
                .await
                .map_err(|e| {
                    inner.fail(ConnectionError::Negotiation(format!(
                        "could not create data channel: {}",
                        e
                    )))
                })?;
            wire_channel(inner, channel.as_ref());
            *inner.channel.write().await = Some(channel);
            debug!("[{}] Data channel created", inner.role);
        }

        let offer = peer
            .create_offer(&inner.config.constraints)
            .await
            .map_err(|e| {
                inner.fail(ConnectionError::Negotiation(format!(
                    "could not create offer: {}",
                    e
                )))
            })?;
        let offer = rewrite_description(offer);

        peer.set_local_description(offer.clone())
            .await
            .map_err(|e| inner.fail(e.into()))?;
        negotiation.local = Some(SdpType::Offer);
        drop(negotiation);

        info!("[{}] Offer created, SDP len: {}", inner.role, offer.sdp.len());
        inner.events.emit(ConnectionEvent::Offer(offer.clone()));
        Ok(offer)
    }

    /// Commit the remote peer's description
    ///
    /// An initiator accepts only an answer to its offer, a responder only
    /// an offer. Candidates queued before this call are applied afterwards.
    pub async fn set_description(&self, desc: SessionDescription) -> Result<(), ConnectionError> {
        let inner = &self.inner;
        if inner.is_closed().await {
            return Err(ConnectionError::Closed);
        }

        let mut negotiation = inner.negotiation.lock().await;
        if negotiation.remote.is_some() {
            return Err(ConnectionError::InvalidState(
                "remote description already set".to_string(),
            ));
        }
        match (inner.role, desc.sdp_type) {
            (Role::Initiator, SdpType::Answer) => {
                if negotiation.local != Some(SdpType::Offer) {
                    return Err(ConnectionError::InvalidState(
                        "answer received before an offer was created".to_string(),
                    ));
                }
            }
            (Role::Responder, SdpType::Offer) => {}
            (role, sdp_type) => {
                return Err(ConnectionError::InvalidState(format!(
                    "{} cannot accept a remote {}",
                    role, sdp_type
                )));
            }
        }

        let peer = inner.peer().await?;
        let sdp_type = desc.sdp_type;
        peer.set_remote_description(desc)
            .await
            .map_err(|e| inner.fail(e.into()))?;
        negotiation.remote = Some(sdp_type);
        debug!("[{}] Remote {} set", inner.role, sdp_type);

        let candidates: Vec<IceCandidate> = negotiation.pending_candidates.drain(..).collect();
        if !candidates.is_empty() {
            debug!(
                "[{}] Adding {} pending candidates after {}",
                inner.role,
                candidates.len(),
                sdp_type
            );
        }
        for candidate in candidates {
            if let Err(e) = peer.add_ice_candidate(candidate).await {
                inner.fail(e.into());
            }
        }

        Ok(())
    }

    /// Answer the committed remote offer; emits `answer` on success
    ///
    /// Responder only. A failed answer emits `error` and may be retried.
    pub async fn create_answer(&self) -> Result<SessionDescription, ConnectionError> {
        let inner = &self.inner;
        if inner.role != Role::Responder {
            return Err(ConnectionError::WrongRole(inner.role));
        }
        if inner.is_closed().await {
            return Err(ConnectionError::Closed);
        }

        let mut negotiation = inner.negotiation.lock().await;
        if negotiation.remote != Some(SdpType::Offer) {
            return Err(ConnectionError::InvalidState(
                "no remote offer to answer".to_string(),
            ));
        }
        if negotiation.local.is_some() {
            return Err(ConnectionError::InvalidState(
                "answer already created".to_string(),
            ));
        }
        let peer = inner.peer().await?;

        let answer = peer
            .create_answer(&inner.config.constraints)
            .await
            .map_err(|e| {
                inner.fail(ConnectionError::Negotiation(format!(
                    "could not create answer: {}",
                    e
                )))
            })?;
        let answer = rewrite_description(answer);

        peer.set_local_description(answer.clone())
            .await
            .map_err(|e| inner.fail(e.into()))?;
        negotiation.local = Some(SdpType::Answer);
        drop(negotiation);

        info!("[{}] Answer created, SDP len: {}", inner.role, answer.sdp.len());
        inner.events.emit(ConnectionEvent::Answer(answer.clone()));
        Ok(answer)
    }

    /// Add a candidate received from the remote peer
    ///
    /// Legal at any time before close; queued until the remote
    /// description is committed.
    pub async fn add_candidate(&self, candidate: IceCandidate) -> Result<(), ConnectionError> {
        let inner = &self.inner;
        if inner.is_closed().await {
            return Err(ConnectionError::Closed);
        }

        let mut negotiation = inner.negotiation.lock().await;
        if negotiation.remote.is_none() {
            debug!("[{}] Queueing ICE candidate (no remote description yet)", inner.role);
            negotiation.pending_candidates.push(candidate);
            return Ok(());
        }

        let peer = inner.peer().await?;
        debug!(
            "[{}] Adding ICE candidate: {}",
            inner.role,
            log_prefix(&candidate.candidate, 50)
        );
        peer.add_ice_candidate(candidate)
            .await
            .map_err(|e| inner.fail(e.into()))
    }

    /// Send binary data; dropped unless the channel is open
    pub async fn send(&self, data: impl Into<Bytes>) -> Result<(), ConnectionError> {
        self.send_message(ChannelMessage::binary(data)).await
    }

    /// Send text; dropped unless the channel is open
    pub async fn send_text(&self, text: impl Into<String>) -> Result<(), ConnectionError> {
        self.send_message(ChannelMessage::text(text)).await
    }

    async fn send_message(&self, message: ChannelMessage) -> Result<(), ConnectionError> {
        let channel = self.inner.channel.read().await.clone();
        match channel {
            Some(channel) if channel.ready_state() == ChannelState::Open => {
                channel.send(message).await.map_err(ConnectionError::from)
            }
            Some(channel) => {
                debug!(
                    "[{}] Dropping {} byte message: channel is {}",
                    self.inner.role,
                    message.len(),
                    channel.ready_state()
                );
                Ok(())
            }
            None => {
                debug!(
                    "[{}] Dropping {} byte message: no channel",
                    self.inner.role,
                    message.len()
                );
                Ok(())
            }
        }
    }

    /// Close the data channel and release the peer connection
    ///
    /// Calling it again is a no-op. `close` is emitted by the channel's own
    /// close notification, so nothing is emitted when no channel was held.
    pub async fn close(&self) -> Result<(), ConnectionError> {
        let inner = &self.inner;
        let Some(peer) = inner.peer.write().await.take() else {
            debug!("[{}] Already closed", inner.role);
            return Ok(());
        };
        *inner.state.write().await = ConnectionState::Closed;

        let channel = inner.channel.write().await.take();
        if let Some(channel) = channel {
            if let Err(e) = channel.close().await {
                warn!("[{}] Failed to close data channel: {}", inner.role, e);
            }
        }

        info!("[{}] Connection closed", inner.role);
        peer.close().await.map_err(ConnectionError::from)
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("role", &self.inner.role)
            .field("events", &self.inner.events)
            .finish()
    }
}

/// At most `max_chars` characters of `s`, cut on a character boundary
fn log_prefix(s: &str, max_chars: usize) -> &str {
    match s.char_indices().nth(max_chars) {
        Some((end, _)) => &s[..end],
        None => s,
    }
}

/// Register the permanent peer connection listeners
///
/// Listeners hold a weak reference so the peer never keeps the connection alive.
fn register_peer_listeners(inner: &Arc<Inner>, peer: &dyn PeerHandle) {
    let weak = Arc::downgrade(inner);
    peer.on_ice_candidate(Box::new(move |candidate: Option<IceCandidate>| {
        let weak = weak.clone();
        Box::pin(async move {
            let Some(inner) = weak.upgrade() else { return };
            if inner.is_closed().await {
                return;
            }
            match candidate {
                Some(candidate) => {
                    let candidate = normalize_candidate(candidate);
                    debug!(
                        "[{}] ICE candidate generated: {}",
                        inner.role,
                        log_prefix(&candidate.candidate, 60)
                    );
                    inner.events.emit(ConnectionEvent::Candidate(candidate));
                }
                None => debug!("[{}] ICE gathering complete", inner.role),
            }
        })
    }));

    let weak = Arc::downgrade(inner);
    peer.on_ice_connection_state_change(Box::new(move |state: IceConnectionState| {
        let weak = weak.clone();
        Box::pin(async move {
            let Some(inner) = weak.upgrade() else { return };
            debug!("[{}] ICE connection state: {}", inner.role, state);
            match state {
                IceConnectionState::Connected => {
                    inner.events.emit(ConnectionEvent::Connect);
                }
                IceConnectionState::Disconnected | IceConnectionState::Closed => {
                    let channel = inner.channel.read().await.clone();
                    if let Some(channel) = channel {
                        info!("[{}] ICE {}, closing data channel", inner.role, state);
                        if let Err(e) = channel.close().await {
                            warn!("[{}] Failed to close data channel: {}", inner.role, e);
                        }
                    }
                }
                _ => {}
            }
        })
    }));

    let weak = Arc::downgrade(inner);
    peer.on_data_channel(Box::new(move |channel: Arc<dyn ChannelHandle>| {
        let weak = weak.clone();
        Box::pin(async move {
            let Some(inner) = weak.upgrade() else { return };
            // Checked under the channel lock so a concurrent close cannot miss it
            let mut held = inner.channel.write().await;
            if inner.is_closed().await {
                drop(held);
                debug!("[{}] Closing data channel received after close", inner.role);
                if let Err(e) = channel.close().await {
                    warn!("[{}] Failed to close data channel: {}", inner.role, e);
                }
                return;
            }
            if held.is_some() {
                warn!(
                    "[{}] Ignoring extra data channel '{}'",
                    inner.role,
                    channel.label()
                );
                return;
            }
            info!("[{}] Received data channel: {}", inner.role, channel.label());
            wire_channel(&inner, channel.as_ref());
            *held = Some(channel);
        })
    }));
}

/// Relay a data channel's notifications as connection events
fn wire_channel(inner: &Arc<Inner>, channel: &dyn ChannelHandle) {
    let weak: Weak<Inner> = Arc::downgrade(inner);
    channel.on_open(Box::new(move || {
        let weak = weak.clone();
        Box::pin(async move {
            let Some(inner) = weak.upgrade() else { return };
            {
                let mut state = inner.state.write().await;
                if *state == ConnectionState::Closed {
                    return;
                }
                *state = ConnectionState::Open;
            }
            info!("[{}] Data channel open", inner.role);
            inner.events.emit(ConnectionEvent::Open);
        })
    }));

    let weak = Arc::downgrade(inner);
    channel.on_close(Box::new(move || {
        let weak = weak.clone();
        Box::pin(async move {
            let Some(inner) = weak.upgrade() else { return };
            inner.channel.write().await.take();
            *inner.state.write().await = ConnectionState::Closed;
            info!("[{}] Data channel closed", inner.role);
            inner.events.emit(ConnectionEvent::Close);
        })
    }));

    let weak = Arc::downgrade(inner);
    channel.on_message(Box::new(move |message: ChannelMessage| {
        let weak = weak.clone();
        Box::pin(async move {
            let Some(inner) = weak.upgrade() else { return };
            inner.events.emit(ConnectionEvent::Message(message));
        })
    }));
}
