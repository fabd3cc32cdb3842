//! Session description construction
//!
//! The signaling server hands us ICE/DTLS parameters and per-consumer RTP
//! parameters instead of a ready-made offer, so this module synthesizes the
//! remote "offer"-equivalent description: one media line per consumer, in
//! registration order, carrying payload type, clock rate and SSRC, plus the
//! shared ICE credentials, candidates and the DTLS fingerprint.

use serde::{Deserialize, Serialize};
use std::fmt::Write as _;

use crate::consumer::ConsumerEntry;
use crate::types::MediaKind;

/// ICE parameters advertised by the server transport.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceParameters {
    pub username_fragment: String,
    pub password: String,
    #[serde(default)]
    pub ice_lite: bool,
}

/// One ICE candidate advertised by the server transport.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub foundation: String,
    pub priority: u32,
    pub address: String,
    pub port: u16,
    pub protocol: String,
    #[serde(rename = "type")]
    pub candidate_type: String,
}

/// DTLS role for the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DtlsRole {
    Auto,
    Client,
    Server,
}

impl DtlsRole {
    /// SDP `a=setup:` value for this role.
    #[must_use]
    pub const fn setup_attribute(&self) -> &'static str {
        match self {
            Self::Auto => "actpass",
            Self::Client => "active",
            Self::Server => "passive",
        }
    }
}

/// One DTLS certificate fingerprint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DtlsFingerprint {
    pub algorithm: String,
    pub value: String,
}

/// DTLS parameters of one side of the transport.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DtlsParameters {
    pub role: DtlsRole,
    pub fingerprints: Vec<DtlsFingerprint>,
}

/// Random 63-bit SDP origin id. Generated once per session: renegotiated
/// offers keep the origin id and only bump the version, so a strict engine
/// treats them as updates to the same session rather than a new one.
#[must_use]
pub(crate) fn random_session_id() -> u64 {
    u64::from_le_bytes(
        uuid::Uuid::new_v4().as_bytes()[..8]
            .try_into()
            .unwrap_or([0; 8]),
    ) >> 1
}

/// Build the remote offer-equivalent description for the given consumers.
///
/// Consumers must already be sorted in registration order; the media-line
/// index of each one must stay aligned with the order receive tracks were
/// appended to the transport. `session_id` is fixed per session and
/// `session_version` increments per pass.
#[must_use]
pub fn build_remote_offer(
    ice: &IceParameters,
    candidates: &[IceCandidate],
    dtls: &DtlsParameters,
    consumers: &[&ConsumerEntry],
    cname: &str,
    session_id: u64,
    session_version: u64,
) -> String {
    let mut sdp = String::new();

    let _ = writeln!(sdp, "v=0");
    let _ = writeln!(sdp, "o=- {session_id} {session_version} IN IP4 0.0.0.0");
    let _ = writeln!(sdp, "s=-");
    let _ = writeln!(sdp, "t=0 0");
    if ice.ice_lite {
        let _ = writeln!(sdp, "a=ice-lite");
    }
    if !consumers.is_empty() {
        let mids: Vec<String> = (0..consumers.len()).map(|i| i.to_string()).collect();
        let _ = writeln!(sdp, "a=group:BUNDLE {}", mids.join(" "));
    }
    let _ = writeln!(sdp, "a=msid-semantic: WMS *");

    for (mid, entry) in consumers.iter().enumerate() {
        let kind = match entry.kind {
            MediaKind::Audio => "audio",
            MediaKind::Video => "video",
        };
        let _ = writeln!(sdp, "m={kind} 7 UDP/TLS/RTP/SAVPF {}", entry.payload_type);
        let _ = writeln!(sdp, "c=IN IP4 127.0.0.1");
        let _ = writeln!(sdp, "a=mid:{mid}");
        let _ = writeln!(sdp, "a=ice-ufrag:{}", ice.username_fragment);
        let _ = writeln!(sdp, "a=ice-pwd:{}", ice.password);
        for fp in &dtls.fingerprints {
            let _ = writeln!(sdp, "a=fingerprint:{} {}", fp.algorithm, fp.value);
        }
        let _ = writeln!(sdp, "a=setup:{}", dtls.role.setup_attribute());
        for candidate in candidates {
            let _ = writeln!(
                sdp,
                "a=candidate:{} 1 {} {} {} {} typ {}",
                candidate.foundation,
                candidate.protocol,
                candidate.priority,
                candidate.address,
                candidate.port,
                candidate.candidate_type,
            );
        }
        let _ = writeln!(
            sdp,
            "a=rtpmap:{} {}/{}{}",
            entry.payload_type,
            entry.codec.encoding_name(),
            entry.clock_rate,
            if entry.kind == MediaKind::Audio { "/2" } else { "" },
        );
        if entry.kind == MediaKind::Video {
            let _ = writeln!(sdp, "a=rtcp-fb:{} nack", entry.payload_type);
            let _ = writeln!(sdp, "a=rtcp-fb:{} nack pli", entry.payload_type);
        }
        let _ = writeln!(sdp, "a=rtcp-mux");
        // From the remote point of view every consumer line sends to us.
        let _ = writeln!(sdp, "a=sendonly");
        if entry.expected_ssrc != 0 {
            let _ = writeln!(sdp, "a=ssrc:{} cname:{cname}", entry.expected_ssrc);
            if entry.rtx_ssrc != 0 {
                let _ = writeln!(sdp, "a=ssrc:{} cname:{cname}", entry.rtx_ssrc);
            }
        }
    }

    sdp
}

/// Rewrite `a=inactive` media sections of a locally generated answer to
/// `a=recvonly`.
///
/// Some WebRTC engines mark every same-kind media line beyond the first as
/// inactive when several are bundled on one transport; applied as-is those
/// streams would silently receive nothing.
#[must_use]
pub fn rewrite_inactive_media(local_sdp: &str) -> String {
    if !local_sdp.contains("a=inactive") {
        return local_sdp.to_string();
    }
    local_sdp
        .lines()
        .map(|line| {
            if line.trim_end() == "a=inactive" {
                "a=recvonly"
            } else {
                line
            }
        })
        .collect::<Vec<_>>()
        .join("\r\n")
        + "\r\n"
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{CodecKind, ConsumerId};

    fn ice() -> IceParameters {
        IceParameters {
            username_fragment: "ufrag".into(),
            password: "pwd".into(),
            ice_lite: true,
        }
    }

    fn dtls() -> DtlsParameters {
        DtlsParameters {
            role: DtlsRole::Auto,
            fingerprints: vec![DtlsFingerprint {
                algorithm: "sha-256".into(),
                value: "AA:BB".into(),
            }],
        }
    }

    fn entry(id: &str, kind: MediaKind, codec: CodecKind, pt: u8, ssrc: u32, seq: u64) -> ConsumerEntry {
        ConsumerEntry {
            id: ConsumerId::from(id),
            kind,
            codec,
            mime_type: format!("{kind}/{}", codec.encoding_name()),
            payload_type: pt,
            clock_rate: if kind == MediaKind::Audio { 48_000 } else { 90_000 },
            expected_ssrc: ssrc,
            rtx_ssrc: 0,
            created_at: tokio::time::Instant::now(),
            created_seq: seq,
            has_received_rtp: false,
            track_index: None,
        }
    }

    #[tokio::test]
    async fn test_offer_media_line_order_and_attributes() {
        let video = entry("v1", MediaKind::Video, CodecKind::Vp8, 96, 111, 0);
        let audio = entry("a1", MediaKind::Audio, CodecKind::Opus, 100, 222, 1);
        let offer = build_remote_offer(&ice(), &[], &dtls(), &[&video, &audio], "cname0", 4242, 1);

        let m_lines: Vec<&str> = offer.lines().filter(|l| l.starts_with("m=")).collect();
        assert_eq!(m_lines, vec!["m=video 7 UDP/TLS/RTP/SAVPF 96", "m=audio 7 UDP/TLS/RTP/SAVPF 100"]);
        assert!(offer.contains("a=group:BUNDLE 0 1"));
        assert!(offer.contains("a=ice-lite"));
        assert!(offer.contains("a=fingerprint:sha-256 AA:BB"));
        assert!(offer.contains("a=setup:actpass"));
        assert!(offer.contains("a=rtpmap:96 VP8/90000"));
        assert!(offer.contains("a=rtpmap:100 opus/48000/2"));
        assert!(offer.contains("a=ssrc:111 cname:cname0"));
        assert!(offer.contains("a=ssrc:222 cname:cname0"));
        assert!(offer.contains("a=sendonly"));
    }

    #[tokio::test]
    async fn test_offer_candidate_lines() {
        let video = entry("v1", MediaKind::Video, CodecKind::Vp8, 96, 111, 0);
        let candidate = IceCandidate {
            foundation: "udpcandidate".into(),
            priority: 1_076_302_079,
            address: "192.0.2.1".into(),
            port: 40_000,
            protocol: "udp".into(),
            candidate_type: "host".into(),
        };
        let offer = build_remote_offer(&ice(), &[candidate], &dtls(), &[&video], "c", 4242, 1);
        assert!(offer
            .contains("a=candidate:udpcandidate 1 udp 1076302079 192.0.2.1 40000 typ host"));
    }

    #[tokio::test]
    async fn test_origin_stable_across_versions() {
        let video = entry("v1", MediaKind::Video, CodecKind::Vp8, 96, 111, 0);
        let first = build_remote_offer(&ice(), &[], &dtls(), &[&video], "c", 777, 1);
        let second = build_remote_offer(&ice(), &[], &dtls(), &[&video], "c", 777, 2);
        assert!(first.contains("o=- 777 1 IN IP4 0.0.0.0"));
        assert!(second.contains("o=- 777 2 IN IP4 0.0.0.0"));
    }

    #[test]
    fn test_rewrite_inactive() {
        let sdp = "m=video 9 X 96\r\na=inactive\r\nm=video 9 X 96\r\na=recvonly\r\n";
        let rewritten = rewrite_inactive_media(sdp);
        assert!(!rewritten.contains("a=inactive"));
        assert_eq!(rewritten.matches("a=recvonly").count(), 2);
    }

    #[test]
    fn test_rewrite_noop_without_inactive() {
        let sdp = "m=audio 9 X 100\r\na=recvonly\r\n";
        assert_eq!(rewrite_inactive_media(sdp), sdp);
    }
}
