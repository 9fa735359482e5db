//! Transport capability abstraction
//!
//! Defines the peer connection and data channel surface the connection
//! state machine drives. Implemented by the webrtc-rs backed transport
//! in [`crate::real`] and the in-memory transport in [`crate::mock`].

use async_trait::async_trait;
use futures::future::BoxFuture;
use std::sync::Arc;
use thiserror::Error;

use crate::config::{Constraints, IceServer};
use crate::types::{
    ChannelMessage, ChannelState, IceCandidate, IceConnectionState, SessionDescription,
};

/// Errors from transport operations
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),
    #[error("Negotiation failed: {0}")]
    NegotiationFailed(String),
    #[error("Invalid session description: {0}")]
    InvalidDescription(String),
    #[error("Invalid ICE candidate: {0}")]
    InvalidCandidate(String),
    #[error("Send failed: {0}")]
    SendFailed(String),
    #[error("Not connected")]
    NotConnected,
    #[error("Closed")]
    Closed,
}

/// Options for creating a data channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelOptions {
    pub ordered: bool,
    /// `None` retransmits until delivered
    pub max_retransmits: Option<u16>,
}

impl Default for ChannelOptions {
    fn default() -> Self {
        Self {
            ordered: true,
            max_retransmits: None,
        }
    }
}

impl ChannelOptions {
    pub fn is_reliable(&self) -> bool {
        self.ordered && self.max_retransmits.is_none()
    }
}

/// Notification handlers return a future the transport drives to completion.
pub type HandlerFuture = BoxFuture<'static, ()>;

/// `None` marks the end of candidate gathering
pub type OnIceCandidateHandler =
    Box<dyn FnMut(Option<IceCandidate>) -> HandlerFuture + Send + Sync>;
pub type OnIceConnectionStateHandler =
    Box<dyn FnMut(IceConnectionState) -> HandlerFuture + Send + Sync>;
pub type OnDataChannelHandler =
    Box<dyn FnMut(Arc<dyn ChannelHandle>) -> HandlerFuture + Send + Sync>;
pub type OnOpenHandler = Box<dyn FnMut() -> HandlerFuture + Send + Sync>;
pub type OnCloseHandler = Box<dyn FnMut() -> HandlerFuture + Send + Sync>;
pub type OnMessageHandler = Box<dyn FnMut(ChannelMessage) -> HandlerFuture + Send + Sync>;

/// Factory for peer connections
///
/// Passed to [`Connection::new`](crate::Connection::new) so the transport
/// is chosen by the caller.
#[async_trait]
pub trait PeerConnectionFactory: Send + Sync {
    async fn create_peer(
        &self,
        ice_servers: &[IceServer],
        constraints: &Constraints,
    ) -> Result<Arc<dyn PeerHandle>, TransportError>;
}

/// A transport peer connection
///
/// Registering a handler replaces any previous handler of the same kind.
#[async_trait]
pub trait PeerHandle: Send + Sync {
    async fn create_offer(
        &self,
        constraints: &Constraints,
    ) -> Result<SessionDescription, TransportError>;

    async fn create_answer(
        &self,
        constraints: &Constraints,
    ) -> Result<SessionDescription, TransportError>;

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), TransportError>;

    async fn set_remote_description(&self, desc: SessionDescription)
        -> Result<(), TransportError>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError>;

    async fn create_data_channel(
        &self,
        label: &str,
        options: ChannelOptions,
    ) -> Result<Arc<dyn ChannelHandle>, TransportError>;

    async fn close(&self) -> Result<(), TransportError>;

    fn on_ice_candidate(&self, handler: OnIceCandidateHandler);

    fn on_ice_connection_state_change(&self, handler: OnIceConnectionStateHandler);

    /// Inbound data channels created by the remote peer
    fn on_data_channel(&self, handler: OnDataChannelHandler);
}

/// A transport data channel
#[async_trait]
pub trait ChannelHandle: Send + Sync {
    fn label(&self) -> &str;

    fn ready_state(&self) -> ChannelState;

    fn ordered(&self) -> bool;

    fn max_retransmits(&self) -> Option<u16>;

    async fn send(&self, message: ChannelMessage) -> Result<(), TransportError>;

    async fn close(&self) -> Result<(), TransportError>;

    fn on_open(&self, handler: OnOpenHandler);

    fn on_close(&self, handler: OnCloseHandler);

    fn on_message(&self, handler: OnMessageHandler);
}

// Blanket implementation for Arc<T> so shared factories can be passed directly

#[async_trait]
impl<T: PeerConnectionFactory + ?Sized> PeerConnectionFactory for Arc<T> {
    async fn create_peer(
        &self,
        ice_servers: &[IceServer],
        constraints: &Constraints,
    ) -> Result<Arc<dyn PeerHandle>, TransportError> {
        (**self).create_peer(ice_servers, constraints).await
    }
}
