//! Mock transport for testing and simulation
//!
//! Peers created from one [`MockNetwork`] find each other through the
//! session id embedded in their SDP and exchange data over in-memory
//! channels instead of real ICE and SCTP.
//!
//! Notifications are queued and dispatched on a task per peer and per
//! channel, so handlers never run inside the caller's stack frame and
//! messages keep their send order.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tokio::sync::{mpsc, Mutex as AsyncMutex, RwLock};
use tracing::debug;

use crate::config::{Constraints, IceServer};
use crate::transport::{
    ChannelHandle, ChannelOptions, OnCloseHandler, OnDataChannelHandler,
    OnIceCandidateHandler, OnIceConnectionStateHandler, OnMessageHandler, OnOpenHandler,
    PeerConnectionFactory, PeerHandle, TransportError,
};
use crate::types::{
    ChannelMessage, ChannelState, IceCandidate, IceConnectionState, SdpType, SessionDescription,
};

const MOCK_CANDIDATE_BASE_PORT: u64 = 50000;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Build the SDP a mock peer hands out
///
/// Carries the `b=AS:30` line browsers put on data sections.
pub fn mock_sdp(session_id: u64, sdp_type: SdpType) -> String {
    let setup = match sdp_type {
        SdpType::Offer => "actpass",
        SdpType::Answer => "active",
    };
    format!(
        "v=0\r\n\
         o=- {} 2 IN IP4 127.0.0.1\r\n\
         s=-\r\n\
         t=0 0\r\n\
         m=application 9 UDP/DTLS/SCTP webrtc-datachannel\r\n\
         c=IN IP4 0.0.0.0\r\n\
         b=AS:30\r\n\
         a=mid:0\r\n\
         a=setup:{}\r\n\
         a=sctp-port:5000\r\n",
        session_id, setup
    )
}

/// Session id from the `o=` line of a mock SDP
pub fn parse_session_id(sdp: &str) -> Option<u64> {
    let origin = sdp.lines().find(|l| l.starts_with("o="))?;
    origin.split_whitespace().nth(1)?.parse().ok()
}

fn host_candidate(session_id: u64) -> IceCandidate {
    IceCandidate::new(format!(
        "candidate:1 1 udp 2130706431 127.0.0.1 {} typ host",
        MOCK_CANDIDATE_BASE_PORT + session_id
    ))
}

// ============================================================================
// Mock Network
// ============================================================================

/// In-memory network shared by mock peers
pub struct MockNetwork {
    next_session: AtomicU64,
    peers: RwLock<HashMap<u64, Weak<MockPeerShared>>>,
    /// Serializes link-up so both sides of a pair connect exactly once
    link_lock: AsyncMutex<()>,
}

impl MockNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Create a factory whose peers join this network
    pub fn factory(self: &Arc<Self>) -> MockFactory {
        MockFactory {
            network: self.clone(),
            fail_offers: Arc::new(AtomicUsize::new(0)),
            fail_answers: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Peers created and not yet closed
    pub async fn peer_count(&self) -> usize {
        self.peers
            .read()
            .await
            .values()
            .filter(|p| p.strong_count() > 0)
            .count()
    }

    /// Report ICE `disconnected` to every live peer, as if the path was severed
    pub async fn disconnect_all(&self) {
        let peers: Vec<Arc<MockPeerShared>> = self
            .peers
            .read()
            .await
            .values()
            .filter_map(Weak::upgrade)
            .collect();
        for peer in peers {
            peer.signal(PeerSignal::IceState(IceConnectionState::Disconnected));
        }
    }

    async fn register(&self, peer: &Arc<MockPeerShared>) {
        self.peers
            .write()
            .await
            .insert(peer.session_id, Arc::downgrade(peer));
    }

    async fn unregister(&self, session_id: u64) {
        self.peers.write().await.remove(&session_id);
    }

    async fn lookup(&self, session_id: u64) -> Option<Arc<MockPeerShared>> {
        self.peers
            .read()
            .await
            .get(&session_id)
            .and_then(Weak::upgrade)
    }
}

impl Default for MockNetwork {
    fn default() -> Self {
        Self {
            next_session: AtomicU64::new(1),
            peers: RwLock::new(HashMap::new()),
            link_lock: AsyncMutex::new(()),
        }
    }
}

// ============================================================================
// Mock Peer Connection Factory
// ============================================================================

/// Mock peer connection factory
///
/// Clones share failure injection counters.
#[derive(Clone)]
pub struct MockFactory {
    network: Arc<MockNetwork>,
    fail_offers: Arc<AtomicUsize>,
    fail_answers: Arc<AtomicUsize>,
}

impl MockFactory {
    /// Make the next `n` offers fail
    pub fn fail_offers(&self, n: usize) {
        self.fail_offers.store(n, Ordering::SeqCst);
    }

    /// Make the next `n` answers fail
    pub fn fail_answers(&self, n: usize) {
        self.fail_answers.store(n, Ordering::SeqCst);
    }

    pub fn network(&self) -> &Arc<MockNetwork> {
        &self.network
    }
}

fn take_failure(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

#[async_trait]
impl PeerConnectionFactory for MockFactory {
    async fn create_peer(
        &self,
        ice_servers: &[IceServer],
        constraints: &Constraints,
    ) -> Result<Arc<dyn PeerHandle>, TransportError> {
        let session_id = self.network.next_session.fetch_add(1, Ordering::Relaxed);
        debug!(
            "[MockPeer {}] Created with {} ICE servers, constraints {:?}",
            session_id,
            ice_servers.len(),
            constraints
        );

        let (tx, rx) = mpsc::unbounded_channel();
        let handlers = Arc::new(PeerHandlers::default());
        tokio::spawn(run_peer_dispatch(handlers.clone(), rx));

        let shared = Arc::new(MockPeerShared {
            session_id,
            network: self.network.clone(),
            slots: AsyncMutex::new(PeerSlots::default()),
            handlers,
            signals: tx,
            fail_offers: self.fail_offers.clone(),
            fail_answers: self.fail_answers.clone(),
        });
        self.network.register(&shared).await;

        Ok(Arc::new(MockPeer { shared }))
    }
}

// ============================================================================
// Mock Peer
// ============================================================================

enum PeerSignal {
    Candidate(Option<IceCandidate>),
    IceState(IceConnectionState),
    /// Inbound channel and the remote channel it is paired with
    DataChannel(Arc<MockChannel>, Arc<MockChannel>),
}

#[derive(Default)]
struct PeerHandlers {
    ice_candidate: Mutex<Option<OnIceCandidateHandler>>,
    ice_state: Mutex<Option<OnIceConnectionStateHandler>>,
    data_channel: Mutex<Option<OnDataChannelHandler>>,
}

async fn run_peer_dispatch(handlers: Arc<PeerHandlers>, mut rx: mpsc::UnboundedReceiver<PeerSignal>) {
    while let Some(signal) = rx.recv().await {
        match signal {
            PeerSignal::Candidate(candidate) => {
                let fut = lock(&handlers.ice_candidate).as_mut().map(|h| h(candidate));
                if let Some(fut) = fut {
                    fut.await;
                }
            }
            PeerSignal::IceState(state) => {
                let fut = lock(&handlers.ice_state).as_mut().map(|h| h(state));
                if let Some(fut) = fut {
                    fut.await;
                }
            }
            PeerSignal::DataChannel(inbound, origin) => {
                let handle: Arc<dyn ChannelHandle> = inbound.clone();
                let fut = lock(&handlers.data_channel).as_mut().map(|h| h(handle));
                if let Some(fut) = fut {
                    fut.await;
                }
                // Open only once the receiver has had a chance to wire its handlers
                inbound.set_open();
                origin.set_open();
            }
        }
    }
}

#[derive(Default)]
struct PeerSlots {
    local: Option<SessionDescription>,
    remote: Option<SessionDescription>,
    remote_candidates: usize,
    counterpart: Option<Weak<MockPeerShared>>,
    /// Channels created locally, delivered to the answerer on link-up
    channels: Vec<Arc<MockChannel>>,
    connected: bool,
    closed: bool,
}

impl PeerSlots {
    fn ready(&self) -> bool {
        !self.connected
            && !self.closed
            && self.local.is_some()
            && self.remote.is_some()
            && self.remote_candidates > 0
    }
}

struct MockPeerShared {
    session_id: u64,
    network: Arc<MockNetwork>,
    slots: AsyncMutex<PeerSlots>,
    handlers: Arc<PeerHandlers>,
    signals: mpsc::UnboundedSender<PeerSignal>,
    fail_offers: Arc<AtomicUsize>,
    fail_answers: Arc<AtomicUsize>,
}

impl MockPeerShared {
    fn signal(&self, signal: PeerSignal) {
        // The dispatcher only stops when the peer is dropped
        let _ = self.signals.send(signal);
    }

    /// Bring the pair up once both sides have descriptions and a remote candidate
    async fn try_connect(self: &Arc<Self>) {
        let _link = self.network.link_lock.lock().await;

        let counterpart = {
            let slots = self.slots.lock().await;
            if !slots.ready() {
                return;
            }
            match slots.counterpart.as_ref().and_then(Weak::upgrade) {
                Some(c) => c,
                None => return,
            }
        };

        let mut theirs = counterpart.slots.lock().await;
        let points_back = theirs
            .counterpart
            .as_ref()
            .map_or(false, |w| w.as_ptr() == Arc::as_ptr(self));
        if !theirs.ready() || !points_back {
            return;
        }
        let mut ours = self.slots.lock().await;
        ours.connected = true;
        theirs.connected = true;

        let we_offered = ours.local.as_ref().map(|d| d.sdp_type) == Some(SdpType::Offer);
        let (offered, answerer) = if we_offered {
            (ours.channels.clone(), counterpart.clone())
        } else {
            (theirs.channels.clone(), self.clone())
        };
        drop(ours);
        drop(theirs);

        debug!(
            "[MockPeer {}] Linked with {}",
            self.session_id, counterpart.session_id
        );
        for peer in [self, &counterpart] {
            peer.signal(PeerSignal::IceState(IceConnectionState::Checking));
            peer.signal(PeerSignal::IceState(IceConnectionState::Connected));
        }
        for origin in offered {
            let inbound = Arc::new(MockChannel::new(origin.label(), origin.options));
            MockChannel::pair(&origin, &inbound);
            answerer.signal(PeerSignal::DataChannel(inbound, origin));
        }
    }
}

/// Mock peer connection
pub struct MockPeer {
    shared: Arc<MockPeerShared>,
}

impl MockPeer {
    pub fn session_id(&self) -> u64 {
        self.shared.session_id
    }
}

#[async_trait]
impl PeerHandle for MockPeer {
    async fn create_offer(
        &self,
        _constraints: &Constraints,
    ) -> Result<SessionDescription, TransportError> {
        if self.shared.slots.lock().await.closed {
            return Err(TransportError::Closed);
        }
        if take_failure(&self.shared.fail_offers) {
            return Err(TransportError::NegotiationFailed(
                "injected offer failure".to_string(),
            ));
        }
        Ok(SessionDescription::offer(mock_sdp(
            self.shared.session_id,
            SdpType::Offer,
        )))
    }

    async fn create_answer(
        &self,
        _constraints: &Constraints,
    ) -> Result<SessionDescription, TransportError> {
        {
            let slots = self.shared.slots.lock().await;
            if slots.closed {
                return Err(TransportError::Closed);
            }
            if slots.remote.as_ref().map(|d| d.sdp_type) != Some(SdpType::Offer) {
                return Err(TransportError::NegotiationFailed(
                    "no remote offer".to_string(),
                ));
            }
        }
        if take_failure(&self.shared.fail_answers) {
            return Err(TransportError::NegotiationFailed(
                "injected answer failure".to_string(),
            ));
        }
        Ok(SessionDescription::answer(mock_sdp(
            self.shared.session_id,
            SdpType::Answer,
        )))
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), TransportError> {
        {
            let mut slots = self.shared.slots.lock().await;
            if slots.closed {
                return Err(TransportError::Closed);
            }
            slots.local = Some(desc);
        }
        // Trickle one host candidate, then the end marker
        self.shared
            .signal(PeerSignal::Candidate(Some(host_candidate(self.shared.session_id))));
        self.shared.signal(PeerSignal::Candidate(None));
        self.shared.try_connect().await;
        Ok(())
    }

    async fn set_remote_description(
        &self,
        desc: SessionDescription,
    ) -> Result<(), TransportError> {
        let session_id = parse_session_id(&desc.sdp).ok_or_else(|| {
            TransportError::InvalidDescription("missing origin line".to_string())
        })?;
        let remote = self.shared.network.lookup(session_id).await.ok_or_else(|| {
            TransportError::ConnectionFailed(format!("unknown session {}", session_id))
        })?;

        {
            let mut slots = self.shared.slots.lock().await;
            if slots.closed {
                return Err(TransportError::Closed);
            }
            slots.remote = Some(desc);
            slots.counterpart = Some(Arc::downgrade(&remote));
        }
        self.shared.try_connect().await;
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError> {
        if !candidate.candidate.starts_with("candidate:") {
            return Err(TransportError::InvalidCandidate(candidate.candidate));
        }
        {
            let mut slots = self.shared.slots.lock().await;
            if slots.closed {
                return Err(TransportError::Closed);
            }
            if slots.remote.is_none() {
                return Err(TransportError::InvalidCandidate(
                    "remote description not set".to_string(),
                ));
            }
            slots.remote_candidates += 1;
        }
        self.shared.try_connect().await;
        Ok(())
    }

    async fn create_data_channel(
        &self,
        label: &str,
        options: ChannelOptions,
    ) -> Result<Arc<dyn ChannelHandle>, TransportError> {
        let mut slots = self.shared.slots.lock().await;
        if slots.closed {
            return Err(TransportError::Closed);
        }
        let channel = Arc::new(MockChannel::new(label, options));
        slots.channels.push(channel.clone());
        Ok(channel)
    }

    async fn close(&self) -> Result<(), TransportError> {
        let (channels, counterpart) = {
            let mut slots = self.shared.slots.lock().await;
            if slots.closed {
                return Ok(());
            }
            slots.closed = true;
            (
                std::mem::take(&mut slots.channels),
                slots.counterpart.take().and_then(|w| w.upgrade()),
            )
        };

        for channel in channels {
            channel.close().await?;
        }
        if let Some(counterpart) = counterpart {
            counterpart.signal(PeerSignal::IceState(IceConnectionState::Disconnected));
        }
        self.shared
            .signal(PeerSignal::IceState(IceConnectionState::Closed));
        self.shared.network.unregister(self.shared.session_id).await;
        Ok(())
    }

    fn on_ice_candidate(&self, handler: OnIceCandidateHandler) {
        *lock(&self.shared.handlers.ice_candidate) = Some(handler);
    }

    fn on_ice_connection_state_change(&self, handler: OnIceConnectionStateHandler) {
        *lock(&self.shared.handlers.ice_state) = Some(handler);
    }

    fn on_data_channel(&self, handler: OnDataChannelHandler) {
        *lock(&self.shared.handlers.data_channel) = Some(handler);
    }
}

// ============================================================================
// Mock Data Channel
// ============================================================================

enum ChannelSignal {
    Open,
    Close,
    Message(ChannelMessage),
}

#[derive(Default)]
struct ChannelHandlers {
    open: Mutex<Option<OnOpenHandler>>,
    close: Mutex<Option<OnCloseHandler>>,
    message: Mutex<Option<OnMessageHandler>>,
}

async fn run_channel_dispatch(
    handlers: Arc<ChannelHandlers>,
    mut rx: mpsc::UnboundedReceiver<ChannelSignal>,
) {
    while let Some(signal) = rx.recv().await {
        let fut = match signal {
            ChannelSignal::Open => lock(&handlers.open).as_mut().map(|h| h()),
            ChannelSignal::Close => lock(&handlers.close).as_mut().map(|h| h()),
            ChannelSignal::Message(msg) => lock(&handlers.message).as_mut().map(|h| h(msg)),
        };
        if let Some(fut) = fut {
            fut.await;
        }
    }
}

/// Mock data channel backed by an in-memory queue
pub struct MockChannel {
    label: String,
    options: ChannelOptions,
    state: Mutex<ChannelState>,
    remote: Mutex<Option<Weak<MockChannel>>>,
    handlers: Arc<ChannelHandlers>,
    signals: mpsc::UnboundedSender<ChannelSignal>,
    bytes_sent: AtomicU64,
}

impl MockChannel {
    /// Create an unpaired channel in the `connecting` state
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(label: &str, options: ChannelOptions) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let handlers = Arc::new(ChannelHandlers::default());
        tokio::spawn(run_channel_dispatch(handlers.clone(), rx));
        Self {
            label: label.to_string(),
            options,
            state: Mutex::new(ChannelState::Connecting),
            remote: Mutex::new(None),
            handlers,
            signals: tx,
            bytes_sent: AtomicU64::new(0),
        }
    }

    fn pair(a: &Arc<MockChannel>, b: &Arc<MockChannel>) {
        *lock(&a.remote) = Some(Arc::downgrade(b));
        *lock(&b.remote) = Some(Arc::downgrade(a));
    }

    fn set_open(&self) {
        let mut state = lock(&self.state);
        if *state == ChannelState::Connecting {
            *state = ChannelState::Open;
            let _ = self.signals.send(ChannelSignal::Open);
        }
    }

    /// Returns false if the channel was already closed
    fn mark_closed(&self) -> bool {
        let mut state = lock(&self.state);
        if *state == ChannelState::Closed {
            return false;
        }
        *state = ChannelState::Closed;
        let _ = self.signals.send(ChannelSignal::Close);
        true
    }

    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl ChannelHandle for MockChannel {
    fn label(&self) -> &str {
        &self.label
    }

    fn ready_state(&self) -> ChannelState {
        *lock(&self.state)
    }

    fn ordered(&self) -> bool {
        self.options.ordered
    }

    fn max_retransmits(&self) -> Option<u16> {
        self.options.max_retransmits
    }

    async fn send(&self, message: ChannelMessage) -> Result<(), TransportError> {
        if self.ready_state() != ChannelState::Open {
            return Err(TransportError::NotConnected);
        }
        let remote = lock(&self.remote)
            .as_ref()
            .and_then(Weak::upgrade)
            .ok_or(TransportError::NotConnected)?;

        let len = message.len() as u64;
        remote
            .signals
            .send(ChannelSignal::Message(message))
            .map_err(|e| TransportError::SendFailed(e.to_string()))?;
        self.bytes_sent.fetch_add(len, Ordering::Relaxed);
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        if !self.mark_closed() {
            return Ok(());
        }
        let remote = lock(&self.remote).take().and_then(|w| w.upgrade());
        if let Some(remote) = remote {
            lock(&remote.remote).take();
            remote.mark_closed();
        }
        Ok(())
    }

    fn on_open(&self, handler: OnOpenHandler) {
        *lock(&self.handlers.open) = Some(handler);
    }

    fn on_close(&self, handler: OnCloseHandler) {
        *lock(&self.handlers.close) = Some(handler);
    }

    fn on_message(&self, handler: OnMessageHandler) {
        *lock(&self.handlers.message) = Some(handler);
    }
}
