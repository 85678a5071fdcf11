//! Minimal RTCP support: sender reports and packet classification.

use std::time::{SystemTime, UNIX_EPOCH};

/// RTCP packet type for a sender report.
pub const RTCP_SR: u8 = 200;
/// RTCP packet type for a receiver report.
pub const RTCP_RR: u8 = 201;

/// Seconds between 1900-01-01 (NTP epoch) and 1970-01-01.
const NTP_UNIX_OFFSET: u64 = 2_208_988_800;

/// Sender report length without report blocks.
pub const SENDER_REPORT_LEN: usize = 28;

/// Build a sender report with no reception report blocks.
pub fn sender_report(ssrc: u32, rtp_timestamp: u32, packets: u32, octets: u32) -> [u8; SENDER_REPORT_LEN] {
    let (ntp_secs, ntp_frac) = ntp_now();
    let mut out = [0u8; SENDER_REPORT_LEN];

    out[0] = 0x80; // V=2, P=0, RC=0
    out[1] = RTCP_SR;
    // Length in 32-bit words minus one
    out[2..4].copy_from_slice(&((SENDER_REPORT_LEN / 4 - 1) as u16).to_be_bytes());
    out[4..8].copy_from_slice(&ssrc.to_be_bytes());
    out[8..12].copy_from_slice(&ntp_secs.to_be_bytes());
    out[12..16].copy_from_slice(&ntp_frac.to_be_bytes());
    out[16..20].copy_from_slice(&rtp_timestamp.to_be_bytes());
    out[20..24].copy_from_slice(&packets.to_be_bytes());
    out[24..28].copy_from_slice(&octets.to_be_bytes());
    out
}

/// RTCP packet type of the first packet in a compound packet.
pub fn packet_type(data: &[u8]) -> Option<u8> {
    if data.len() < 8 || (data[0] >> 6) != 2 {
        return None;
    }
    Some(data[1])
}

/// SSRC of the sender of the first packet in a compound packet.
pub fn sender_ssrc(data: &[u8]) -> Option<u32> {
    packet_type(data)?;
    Some(u32::from_be_bytes([data[4], data[5], data[6], data[7]]))
}

fn ntp_now() -> (u32, u32) {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    let secs = (now.as_secs() + NTP_UNIX_OFFSET) as u32;
    let frac = ((now.subsec_nanos() as u64) << 32) / 1_000_000_000;
    (secs, frac as u32)
}
