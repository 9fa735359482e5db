//! Shared helpers for connection tests

#![allow(dead_code)]

use async_trait::async_trait;
use rtc_data_connection::transport::{
    OnDataChannelHandler, OnIceCandidateHandler, OnIceConnectionStateHandler,
};
use rtc_data_connection::{
    ChannelHandle, ChannelOptions, Connection, ConnectionConfig, ConnectionEvent, Constraints,
    EventKind, IceCandidate, IceServer, LoopbackRelay, MockFactory, MockNetwork,
    PeerConnectionFactory, PeerHandle, Role, SessionDescription, TransportError,
};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;

pub const EVENT_TIMEOUT: Duration = Duration::from_secs(5);

/// Next event of `kind`, skipping everything else
pub async fn wait_for(
    events: &mut UnboundedReceiver<ConnectionEvent>,
    kind: EventKind,
) -> ConnectionEvent {
    wait_for_within(events, kind, EVENT_TIMEOUT).await
}

pub async fn wait_for_within(
    events: &mut UnboundedReceiver<ConnectionEvent>,
    kind: EventKind,
    timeout: Duration,
) -> ConnectionEvent {
    let found = tokio::time::timeout(timeout, async {
        while let Some(event) = events.recv().await {
            if event.kind() == kind {
                return Some(event);
            }
        }
        None
    })
    .await;
    match found {
        Ok(Some(event)) => event,
        Ok(None) => panic!("event stream ended while waiting for {}", kind),
        Err(_) => panic!("timed out waiting for {}", kind),
    }
}

/// Let queued notifications drain, then return every event seen
pub async fn drain(events: &mut UnboundedReceiver<ConnectionEvent>) -> Vec<ConnectionEvent> {
    tokio::time::sleep(Duration::from_millis(100)).await;
    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        seen.push(event);
    }
    seen
}

pub fn kinds(events: &[ConnectionEvent]) -> Vec<EventKind> {
    events.iter().map(ConnectionEvent::kind).collect()
}

/// Initiator and responder on one mock network
pub struct Pair {
    pub network: Arc<MockNetwork>,
    pub factory: RecordingFactory<MockFactory>,
    pub a: Connection,
    pub b: Connection,
    pub a_events: UnboundedReceiver<ConnectionEvent>,
    pub b_events: UnboundedReceiver<ConnectionEvent>,
}

impl Pair {
    pub async fn new(config: ConnectionConfig) -> Self {
        let network = MockNetwork::new();
        let factory = RecordingFactory::new(network.factory());
        let a = Connection::new(Role::Initiator, config.clone(), &factory)
            .await
            .unwrap();
        let b = Connection::new(Role::Responder, config, &factory)
            .await
            .unwrap();
        let a_events = a.events();
        let b_events = b.events();
        Self {
            network,
            factory,
            a,
            b,
            a_events,
            b_events,
        }
    }

    /// Relay signaling in-process and wait until both sides are open
    pub async fn open(&mut self) -> LoopbackRelay {
        let relay = LoopbackRelay::connect(&self.a, &self.b);
        self.a.create_offer().await.unwrap();
        wait_for(&mut self.a_events, EventKind::Open).await;
        wait_for(&mut self.b_events, EventKind::Open).await;
        relay
    }
}

/// Factory wrapper that remembers the inbound channels its peers receive
pub struct RecordingFactory<F> {
    pub transport: F,
    inbound: Arc<Mutex<Vec<Arc<dyn ChannelHandle>>>>,
}

impl<F: PeerConnectionFactory> RecordingFactory<F> {
    pub fn new(transport: F) -> Self {
        Self {
            transport,
            inbound: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn inbound_channels(&self) -> Vec<Arc<dyn ChannelHandle>> {
        self.inbound.lock().unwrap().clone()
    }
}

#[async_trait]
impl<F: PeerConnectionFactory> PeerConnectionFactory for RecordingFactory<F> {
    async fn create_peer(
        &self,
        ice_servers: &[IceServer],
        constraints: &Constraints,
    ) -> Result<Arc<dyn PeerHandle>, TransportError> {
        let inner = self.transport.create_peer(ice_servers, constraints).await?;
        Ok(Arc::new(RecordingPeer {
            inner,
            inbound: self.inbound.clone(),
        }))
    }
}

struct RecordingPeer {
    inner: Arc<dyn PeerHandle>,
    inbound: Arc<Mutex<Vec<Arc<dyn ChannelHandle>>>>,
}

#[async_trait]
impl PeerHandle for RecordingPeer {
    async fn create_offer(
        &self,
        constraints: &Constraints,
    ) -> Result<SessionDescription, TransportError> {
        self.inner.create_offer(constraints).await
    }

    async fn create_answer(
        &self,
        constraints: &Constraints,
    ) -> Result<SessionDescription, TransportError> {
        self.inner.create_answer(constraints).await
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), TransportError> {
        self.inner.set_local_description(desc).await
    }

    async fn set_remote_description(
        &self,
        desc: SessionDescription,
    ) -> Result<(), TransportError> {
        self.inner.set_remote_description(desc).await
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError> {
        self.inner.add_ice_candidate(candidate).await
    }

    async fn create_data_channel(
        &self,
        label: &str,
        options: ChannelOptions,
    ) -> Result<Arc<dyn ChannelHandle>, TransportError> {
        self.inner.create_data_channel(label, options).await
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.inner.close().await
    }

    fn on_ice_candidate(&self, handler: OnIceCandidateHandler) {
        self.inner.on_ice_candidate(handler)
    }

    fn on_ice_connection_state_change(&self, handler: OnIceConnectionStateHandler) {
        self.inner.on_ice_connection_state_change(handler)
    }

    fn on_data_channel(&self, mut handler: OnDataChannelHandler) {
        let inbound = self.inbound.clone();
        self.inner
            .on_data_channel(Box::new(move |channel: Arc<dyn ChannelHandle>| {
                inbound.lock().unwrap().push(channel.clone());
                handler(channel)
            }));
    }
}
