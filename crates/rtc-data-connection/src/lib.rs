//! Peer-to-peer data channel connections
//!
//! A [`Connection`] drives the offer/answer/candidate exchange that opens a
//! WebRTC data channel, and reports progress as [`ConnectionEvent`]s. The
//! host application delivers `offer`, `answer` and `candidate` events to
//! the remote peer however it likes; [`LoopbackRelay`] does it in-process.
//!
//! # Overview
//!
//! - **Connection**: state machine owning one peer connection and one data channel
//! - **Transport**: injected through [`PeerConnectionFactory`], either
//!   [`WebRtcFactory`] (webrtc-rs) or [`MockFactory`] (in-memory)
//! - **Events**: `offer`, `answer`, `candidate`, `connect`, `open`, `close`,
//!   `message`, `error`
//!
//! # Example
//!
//! ```rust,no_run
//! use rtc_data_connection::{
//!     Connection, ConnectionConfig, ConnectionEvent, LoopbackRelay, Role, WebRtcFactory,
//! };
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let factory = WebRtcFactory::new();
//!     let a = Connection::new(Role::Initiator, ConnectionConfig::default(), &factory).await?;
//!     let b = Connection::new(Role::Responder, ConnectionConfig::default(), &factory).await?;
//!
//!     let mut b_events = b.events();
//!     let _relay = LoopbackRelay::connect(&a, &b);
//!     a.create_offer().await?;
//!
//!     while let Some(event) = b_events.recv().await {
//!         if event == ConnectionEvent::Open {
//!             b.send_text("hello, world!").await?;
//!             break;
//!         }
//!     }
//!
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod connection;
pub mod events;
pub mod mock;
pub mod real;
pub mod sdp;
pub mod signaling;
pub mod transport;
pub mod types;

pub use config::{
    ConnectionConfig, Constraints, IceServer, PeerConnectionConfig, DEFAULT_ICE_SERVERS,
};
pub use connection::{Connection, ConnectionError};
pub use events::{ConnectionEvent, EventEmitter, EventHandler, EventKind, Subscription};
pub use mock::{MockChannel, MockFactory, MockNetwork, MockPeer};
pub use real::{WebRtcChannel, WebRtcFactory, WebRtcPeer};
pub use sdp::{apply_bandwidth_hack, normalize_candidate};
pub use signaling::{LoopbackRelay, SignalingMessage};
pub use transport::{
    ChannelHandle, ChannelOptions, PeerConnectionFactory, PeerHandle, TransportError,
};
pub use types::{
    ChannelMessage, ChannelState, ConnectionState, IceCandidate, IceConnectionState, Role,
    SdpType, SessionDescription, DATA_CHANNEL_LABEL,
};
