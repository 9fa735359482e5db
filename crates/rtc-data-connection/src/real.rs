//! Real WebRTC transport
//!
//! Wraps the webrtc crate to implement the transport traits for production use.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

use crate::config::{Constraints, IceServer};
use crate::transport::{
    ChannelHandle, ChannelOptions, HandlerFuture, OnCloseHandler, OnDataChannelHandler,
    OnIceCandidateHandler, OnIceConnectionStateHandler, OnMessageHandler, OnOpenHandler,
    PeerConnectionFactory, PeerHandle, TransportError,
};
use crate::types::{
    ChannelMessage, ChannelState, IceCandidate, IceConnectionState, SdpType, SessionDescription,
};

use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;

fn connection_failed(e: webrtc::Error) -> TransportError {
    TransportError::ConnectionFailed(e.to_string())
}

fn to_rtc_description(desc: SessionDescription) -> Result<RTCSessionDescription, TransportError> {
    let parsed = match desc.sdp_type {
        SdpType::Offer => RTCSessionDescription::offer(desc.sdp),
        SdpType::Answer => RTCSessionDescription::answer(desc.sdp),
    };
    parsed.map_err(|e| TransportError::InvalidDescription(e.to_string()))
}

fn from_rtc_description(desc: RTCSessionDescription) -> Result<SessionDescription, TransportError> {
    let sdp_type = match desc.sdp_type {
        RTCSdpType::Offer => SdpType::Offer,
        RTCSdpType::Answer => SdpType::Answer,
        other => {
            return Err(TransportError::InvalidDescription(format!(
                "unexpected description type {}",
                other
            )))
        }
    };
    Ok(SessionDescription {
        sdp_type,
        sdp: desc.sdp,
    })
}

/// Packet lifetime used for channels that must not retransmit
///
/// webrtc-rs reads `max_retransmits == 0` as unlimited. A timed channel
/// stamps each chunk when it is first sent, so a 1 ms lifetime lets the
/// first transmission through and abandons every retransmission.
const NO_RETRANSMIT_LIFETIME_MS: u16 = 1;

fn data_channel_init(options: ChannelOptions) -> RTCDataChannelInit {
    let (max_retransmits, max_packet_life_time) = match options.max_retransmits {
        None => (None, None),
        Some(0) => (None, Some(NO_RETRANSMIT_LIFETIME_MS)),
        Some(n) => (Some(n), None),
    };
    RTCDataChannelInit {
        ordered: Some(options.ordered),
        max_retransmits,
        max_packet_life_time,
        ..Default::default()
    }
}

/// Inverse of [`data_channel_init`] for the values a channel reports
fn retransmit_limit(max_retransmits: u16, max_packet_lifetime: u16) -> Option<u16> {
    match (max_retransmits, max_packet_lifetime) {
        (0, NO_RETRANSMIT_LIFETIME_MS) => Some(0),
        (0, _) => None,
        (n, _) => Some(n),
    }
}

fn ice_connection_state(state: RTCIceConnectionState) -> Option<IceConnectionState> {
    match state {
        RTCIceConnectionState::New => Some(IceConnectionState::New),
        RTCIceConnectionState::Checking => Some(IceConnectionState::Checking),
        RTCIceConnectionState::Connected => Some(IceConnectionState::Connected),
        RTCIceConnectionState::Completed => Some(IceConnectionState::Completed),
        RTCIceConnectionState::Disconnected => Some(IceConnectionState::Disconnected),
        RTCIceConnectionState::Failed => Some(IceConnectionState::Failed),
        RTCIceConnectionState::Closed => Some(IceConnectionState::Closed),
        _ => None,
    }
}

/// Real WebRTC peer connection factory
///
/// Creates actual WebRTC connections using the webrtc crate.
#[derive(Debug, Default, Clone)]
pub struct WebRtcFactory;

impl WebRtcFactory {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl PeerConnectionFactory for WebRtcFactory {
    async fn create_peer(
        &self,
        ice_servers: &[IceServer],
        constraints: &Constraints,
    ) -> Result<Arc<dyn PeerHandle>, TransportError> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(connection_failed)?;

        let mut registry = Registry::new();
        registry =
            register_default_interceptors(registry, &mut media_engine).map_err(connection_failed)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let config = RTCConfiguration {
            ice_servers: ice_servers
                .iter()
                .map(|server| RTCIceServer {
                    urls: server.urls.clone(),
                    username: server.username.clone().unwrap_or_default(),
                    credential: server.credential.clone().unwrap_or_default(),
                    ..Default::default()
                })
                .collect(),
            ..Default::default()
        };

        // Data-only sessions carry no media sections and webrtc-rs always runs DTLS
        debug!("Creating peer connection, constraints {:?}", constraints);

        let pc = api
            .new_peer_connection(config)
            .await
            .map_err(connection_failed)?;
        Ok(Arc::new(WebRtcPeer { pc: Arc::new(pc) }))
    }
}

/// Peer connection backed by `RTCPeerConnection`
pub struct WebRtcPeer {
    pc: Arc<RTCPeerConnection>,
}

#[async_trait]
impl PeerHandle for WebRtcPeer {
    async fn create_offer(
        &self,
        _constraints: &Constraints,
    ) -> Result<SessionDescription, TransportError> {
        let offer = self
            .pc
            .create_offer(None)
            .await
            .map_err(|e| TransportError::NegotiationFailed(e.to_string()))?;
        from_rtc_description(offer)
    }

    async fn create_answer(
        &self,
        _constraints: &Constraints,
    ) -> Result<SessionDescription, TransportError> {
        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(|e| TransportError::NegotiationFailed(e.to_string()))?;
        from_rtc_description(answer)
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), TransportError> {
        let desc = to_rtc_description(desc)?;
        self.pc
            .set_local_description(desc)
            .await
            .map_err(|e| TransportError::InvalidDescription(e.to_string()))
    }

    async fn set_remote_description(
        &self,
        desc: SessionDescription,
    ) -> Result<(), TransportError> {
        let desc = to_rtc_description(desc)?;
        self.pc
            .set_remote_description(desc)
            .await
            .map_err(|e| TransportError::InvalidDescription(e.to_string()))
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_m_line_index,
            ..Default::default()
        };
        self.pc
            .add_ice_candidate(init)
            .await
            .map_err(|e| TransportError::InvalidCandidate(e.to_string()))
    }

    async fn create_data_channel(
        &self,
        label: &str,
        options: ChannelOptions,
    ) -> Result<Arc<dyn ChannelHandle>, TransportError> {
        let dc = self
            .pc
            .create_data_channel(label, Some(data_channel_init(options)))
            .await
            .map_err(connection_failed)?;
        Ok(Arc::new(WebRtcChannel { dc }))
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.pc.close().await.map_err(connection_failed)
    }

    fn on_ice_candidate(&self, mut handler: OnIceCandidateHandler) {
        self.pc
            .on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
                let candidate = candidate
                    .and_then(|c| c.to_json().ok())
                    .map(|init| IceCandidate {
                        candidate: init.candidate,
                        sdp_mid: init.sdp_mid,
                        sdp_m_line_index: init.sdp_mline_index,
                    });
                handler(candidate)
            }));
    }

    fn on_ice_connection_state_change(&self, mut handler: OnIceConnectionStateHandler) {
        self.pc
            .on_ice_connection_state_change(Box::new(move |state: RTCIceConnectionState| {
                match ice_connection_state(state) {
                    Some(state) => handler(state),
                    None => {
                        let ignored: HandlerFuture = Box::pin(async {});
                        ignored
                    }
                }
            }));
    }

    fn on_data_channel(&self, mut handler: OnDataChannelHandler) {
        self.pc
            .on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
                handler(Arc::new(WebRtcChannel { dc }))
            }));
    }
}

/// Wrapper around RTCDataChannel that implements our ChannelHandle trait
pub struct WebRtcChannel {
    dc: Arc<RTCDataChannel>,
}

#[async_trait]
impl ChannelHandle for WebRtcChannel {
    fn label(&self) -> &str {
        self.dc.label()
    }

    fn ready_state(&self) -> ChannelState {
        match self.dc.ready_state() {
            RTCDataChannelState::Open => ChannelState::Open,
            RTCDataChannelState::Closing => ChannelState::Closing,
            RTCDataChannelState::Closed => ChannelState::Closed,
            _ => ChannelState::Connecting,
        }
    }

    fn ordered(&self) -> bool {
        self.dc.ordered()
    }

    fn max_retransmits(&self) -> Option<u16> {
        retransmit_limit(self.dc.max_retransmits(), self.dc.max_packet_lifetime())
    }

    async fn send(&self, message: ChannelMessage) -> Result<(), TransportError> {
        let sent = if message.is_string {
            let text = String::from_utf8_lossy(&message.data).into_owned();
            self.dc.send_text(text).await
        } else {
            self.dc.send(&message.data).await
        };
        sent.map(|_| ())
            .map_err(|e| TransportError::SendFailed(e.to_string()))
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.dc.close().await.map_err(connection_failed)
    }

    fn on_open(&self, mut handler: OnOpenHandler) {
        self.dc.on_open(Box::new(move || handler()));
    }

    fn on_close(&self, mut handler: OnCloseHandler) {
        self.dc.on_close(Box::new(move || handler()));
    }

    fn on_message(&self, mut handler: OnMessageHandler) {
        self.dc.on_message(Box::new(move |msg: DataChannelMessage| {
            let message = ChannelMessage {
                is_string: msg.is_string,
                data: msg.data,
            };
            handler(message)
        }));
    }
}
