//! Signaling messages and an in-process relay
//!
//! Delivering offers, answers and candidates to the remote peer is the
//! host application's job. [`SignalingMessage`] is a JSON-friendly form
//! of those events, and [`LoopbackRelay`] wires two connections in the
//! same process together.

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::connection::{Connection, ConnectionError};
use crate::events::ConnectionEvent;
use crate::types::{IceCandidate, SessionDescription};

/// Signaling message exchanged between peers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum SignalingMessage {
    /// WebRTC offer (SDP)
    #[serde(rename = "offer")]
    Offer { sdp: String },

    /// WebRTC answer (SDP)
    #[serde(rename = "answer")]
    Answer { sdp: String },

    /// Single trickled ICE candidate
    #[serde(rename = "candidate")]
    Candidate {
        candidate: String,
        #[serde(rename = "sdpMLineIndex")]
        sdp_m_line_index: Option<u16>,
        #[serde(rename = "sdpMid")]
        sdp_mid: Option<String>,
    },
}

impl SignalingMessage {
    /// The message to forward for an event, if it is a signaling event
    pub fn from_event(event: &ConnectionEvent) -> Option<Self> {
        match event {
            ConnectionEvent::Offer(desc) => Some(SignalingMessage::Offer {
                sdp: desc.sdp.clone(),
            }),
            ConnectionEvent::Answer(desc) => Some(SignalingMessage::Answer {
                sdp: desc.sdp.clone(),
            }),
            ConnectionEvent::Candidate(c) => Some(SignalingMessage::Candidate {
                candidate: c.candidate.clone(),
                sdp_m_line_index: c.sdp_m_line_index,
                sdp_mid: c.sdp_mid.clone(),
            }),
            _ => None,
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn from_json(s: &str) -> serde_json::Result<Self> {
        serde_json::from_str(s)
    }
}

impl Connection {
    /// Apply a signaling message received from the remote peer
    ///
    /// An offer is committed and answered; an answer is committed; a
    /// candidate is added.
    pub async fn handle_signal(&self, msg: SignalingMessage) -> Result<(), ConnectionError> {
        match msg {
            SignalingMessage::Offer { sdp } => {
                self.set_description(SessionDescription::offer(sdp)).await?;
                self.create_answer().await?;
            }
            SignalingMessage::Answer { sdp } => {
                self.set_description(SessionDescription::answer(sdp)).await?;
            }
            SignalingMessage::Candidate {
                candidate,
                sdp_m_line_index,
                sdp_mid,
            } => {
                self.add_candidate(IceCandidate {
                    candidate,
                    sdp_mid,
                    sdp_m_line_index,
                })
                .await?;
            }
        }
        Ok(())
    }
}

/// Forwards signaling events between two connections in one process
///
/// Forwarding stops when the relay is dropped.
pub struct LoopbackRelay {
    tasks: Vec<JoinHandle<()>>,
}

impl LoopbackRelay {
    pub fn connect(a: &Connection, b: &Connection) -> Self {
        let tasks = vec![
            Self::forward(a.events(), b.clone()),
            Self::forward(b.events(), a.clone()),
        ];
        Self { tasks }
    }

    fn forward(
        mut events: mpsc::UnboundedReceiver<ConnectionEvent>,
        to: Connection,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let Some(msg) = SignalingMessage::from_event(&event) else {
                    continue;
                };
                debug!("Relaying {:?} to {}", event.kind(), to.role());
                if let Err(e) = to.handle_signal(msg).await {
                    warn!("Failed to relay signal to {}: {}", to.role(), e);
                }
            }
        })
    }
}

impl Drop for LoopbackRelay {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ChannelMessage;

    #[test]
    fn test_signaling_message_offer_serialize() {
        let msg = SignalingMessage::Offer {
            sdp: "v=0\r\n...".to_string(),
        };
        let json = msg.to_json().unwrap();
        assert!(json.contains("\"type\":\"offer\""));
        assert!(json.contains("\"sdp\":\"v=0\\r\\n...\""));
    }

    #[test]
    fn test_signaling_message_candidate_keys() {
        let json = r#"{"type":"candidate","candidate":"candidate:1 1 udp 1 10.0.0.1 9 typ host","sdpMLineIndex":0,"sdpMid":"0"}"#;
        let msg = SignalingMessage::from_json(json).unwrap();
        match msg {
            SignalingMessage::Candidate {
                candidate,
                sdp_m_line_index,
                sdp_mid,
            } => {
                assert!(candidate.starts_with("candidate:1"));
                assert_eq!(sdp_m_line_index, Some(0));
                assert_eq!(sdp_mid.as_deref(), Some("0"));
            }
            _ => panic!("Wrong message type"),
        }
    }

    #[test]
    fn test_from_event() {
        let offer = ConnectionEvent::Offer(SessionDescription::offer("o"));
        assert_eq!(
            SignalingMessage::from_event(&offer),
            Some(SignalingMessage::Offer { sdp: "o".into() })
        );

        let candidate = ConnectionEvent::Candidate(IceCandidate::new("candidate:x"));
        assert!(matches!(
            SignalingMessage::from_event(&candidate),
            Some(SignalingMessage::Candidate { .. })
        ));

        assert_eq!(SignalingMessage::from_event(&ConnectionEvent::Open), None);
        assert_eq!(
            SignalingMessage::from_event(&ConnectionEvent::Message(ChannelMessage::text("x"))),
            None
        );
    }
}
