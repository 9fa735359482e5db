//! Session description post-processing

use crate::types::{IceCandidate, SessionDescription};

const DATA_BANDWIDTH_LINE: &str = "b=AS:30";
const RAISED_BANDWIDTH_LINE: &str = "b=AS:102400";

/// Raise the application bandwidth limit to 100 Mbps
///
/// Rewrites only when the SDP contains exactly one `b=AS:30`; anything
/// else is returned unchanged.
pub fn apply_bandwidth_hack(sdp: &str) -> String {
    let mut parts = sdp.split(DATA_BANDWIDTH_LINE);
    match (parts.next(), parts.next(), parts.next()) {
        (Some(head), Some(tail), None) => {
            let mut out = String::with_capacity(sdp.len() + 4);
            out.push_str(head);
            out.push_str(RAISED_BANDWIDTH_LINE);
            out.push_str(tail);
            out
        }
        _ => sdp.to_string(),
    }
}

/// Apply [`apply_bandwidth_hack`] to a description's SDP
pub fn rewrite_description(mut desc: SessionDescription) -> SessionDescription {
    desc.sdp = apply_bandwidth_hack(&desc.sdp);
    desc
}

/// Strip SDP attribute framing from a candidate so it survives JSON transport
///
/// Some stacks hand out `a=candidate:...\r\n`; peers expect `candidate:...`.
pub fn normalize_candidate(mut candidate: IceCandidate) -> IceCandidate {
    let trimmed = candidate.candidate.trim_end_matches(['\r', '\n']);
    let trimmed = trimmed.strip_prefix("a=").unwrap_or(trimmed);
    if trimmed.len() != candidate.candidate.len() {
        candidate.candidate = trimmed.to_string();
    }
    candidate
}
