//! Minimal RTP/RTCP parsing for the multiplexed media channel
//!
//! Covers exactly what the dispatch path consumes: the fixed RFC 3550
//! header (payload type, marker, sequence number, timestamp, SSRC), the
//! CSRC list and RFC 8285 extension block as opaque skips, trailing
//! padding removal, and RTCP demarcation on the muxed channel. Receiver
//! reports are parsed only far enough to pull out the report-block SSRCs
//! that drive the keyframe-throttle path.

use bytes::Bytes;

use crate::error::MediaError;

/// RTP fixed version (RFC 3550 5.1).
pub const RTP_VERSION: u8 = 2;

/// Fixed header length without CSRCs or extension.
pub const RTP_HEADER_MIN_LEN: usize = 12;

/// RTCP packet type for receiver reports (RFC 3550 6.4.2).
pub const RTCP_PT_RECEIVER_REPORT: u8 = 201;

/// RTCP packet type for sender reports (RFC 3550 6.4.1).
pub const RTCP_PT_SENDER_REPORT: u8 = 200;

/// A parsed inbound RTP packet. The payload is a zero-copy slice of the
/// original buffer with header, CSRCs, extension and padding stripped.
#[derive(Debug, Clone)]
pub struct RtpPacket {
    pub payload_type: u8,
    pub marker: bool,
    pub sequence_number: u16,
    pub timestamp: u32,
    pub ssrc: u32,
    pub payload: Bytes,
}

impl RtpPacket {
    /// Parse an RTP packet from a raw datagram.
    pub fn parse(data: &Bytes) -> Result<Self, MediaError> {
        if data.len() < RTP_HEADER_MIN_LEN {
            return Err(MediaError::depacketize("RTP packet shorter than fixed header"));
        }

        let b0 = data[0];
        let version = b0 >> 6;
        if version != RTP_VERSION {
            return Err(MediaError::depacketize(format!(
                "unsupported RTP version {version}"
            )));
        }
        let padding = b0 & 0x20 != 0;
        let extension = b0 & 0x10 != 0;
        let csrc_count = (b0 & 0x0f) as usize;

        let b1 = data[1];
        let marker = b1 & 0x80 != 0;
        let payload_type = b1 & 0x7f;

        let sequence_number = u16::from_be_bytes([data[2], data[3]]);
        let timestamp = u32::from_be_bytes([data[4], data[5], data[6], data[7]]);
        let ssrc = u32::from_be_bytes([data[8], data[9], data[10], data[11]]);

        let mut offset = RTP_HEADER_MIN_LEN + csrc_count * 4;
        if data.len() < offset {
            return Err(MediaError::depacketize("RTP packet truncated in CSRC list"));
        }

        if extension {
            // RFC 8285 block: 16-bit profile, 16-bit length in 32-bit words.
            if data.len() < offset + 4 {
                return Err(MediaError::depacketize(
                    "RTP packet truncated in extension header",
                ));
            }
            let ext_words = u16::from_be_bytes([data[offset + 2], data[offset + 3]]) as usize;
            offset += 4 + ext_words * 4;
            if data.len() < offset {
                return Err(MediaError::depacketize(
                    "RTP packet truncated in extension body",
                ));
            }
        }

        let mut end = data.len();
        if padding {
            let pad_len = data[end - 1] as usize;
            if pad_len == 0 || offset + pad_len > end {
                return Err(MediaError::depacketize("invalid RTP padding length"));
            }
            end -= pad_len;
        }

        Ok(Self {
            payload_type,
            marker,
            sequence_number,
            timestamp,
            ssrc,
            payload: data.slice(offset..end),
        })
    }
}

/// Whether a datagram on the muxed channel is RTCP rather than RTP.
///
/// RTCP packet types occupy 200..=207 in the second byte, a range that
/// cannot collide with a marker bit plus a dynamic payload type.
#[must_use]
pub fn is_rtcp(data: &[u8]) -> bool {
    data.len() >= 2 && (200..=207).contains(&data[1])
}

/// SSRCs referenced by the report blocks of a compound RTCP packet.
///
/// Walks every chunk of the compound packet and collects the reportee
/// SSRC of each SR/RR report block. Anything else (SDES, BYE, feedback)
/// is skipped by length. Malformed chunks terminate the walk; whatever
/// was collected so far is returned.
#[must_use]
pub fn receiver_report_ssrcs(data: &[u8]) -> Vec<u32> {
    let mut ssrcs = Vec::new();
    let mut offset = 0;

    while data.len() >= offset + 8 {
        let b0 = data[offset];
        if b0 >> 6 != RTP_VERSION {
            break;
        }
        let report_count = (b0 & 0x1f) as usize;
        let packet_type = data[offset + 1];
        let length_words =
            u16::from_be_bytes([data[offset + 2], data[offset + 3]]) as usize;
        let chunk_len = (length_words + 1) * 4;
        if data.len() < offset + chunk_len {
            break;
        }

        if packet_type == RTCP_PT_RECEIVER_REPORT || packet_type == RTCP_PT_SENDER_REPORT {
            // Report blocks start after the header + reporter SSRC, and for
            // sender reports, after the 20-byte sender info as well.
            let mut block = offset
                + 8
                + if packet_type == RTCP_PT_SENDER_REPORT {
                    20
                } else {
                    0
                };
            for _ in 0..report_count {
                if block + 24 > offset + chunk_len {
                    break;
                }
                ssrcs.push(u32::from_be_bytes([
                    data[block],
                    data[block + 1],
                    data[block + 2],
                    data[block + 3],
                ]));
                block += 24;
            }
        }

        offset += chunk_len;
    }

    ssrcs
}
