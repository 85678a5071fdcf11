//! Narrowband payload coding for the loopback engine.
//!
//! Every codec runs at 8 kHz mono with 20 ms packets (160 samples).
//!
//! Payload types:
//! - PT 0: G.711 mu-law (PCMU)
//! - PT 8: G.711 A-law (PCMA)
//! - PT 96: linear 16-bit big-endian (L16)

use lazy_static::lazy_static;

use crate::engine::CodecInst;

/// Sample rate of every loopback codec.
pub const SAMPLE_RATE: u32 = 8000;

/// Samples per 20 ms packet.
pub const PACKET_SAMPLES: usize = 160;

/// Samples per 10 ms playout frame.
pub const PLAYOUT_FRAME_SAMPLES: usize = 80;

/// How a codec turns samples into payload bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadCoding {
    Pcmu,
    Pcma,
    L16,
}

impl PayloadCoding {
    /// Append the encoded form of `pcm` to `out`.
    pub fn encode(self, pcm: &[i16], out: &mut Vec<u8>) {
        match self {
            PayloadCoding::Pcmu => out.extend(pcm.iter().map(|&s| ulaw_encode(s))),
            PayloadCoding::Pcma => out.extend(pcm.iter().map(|&s| alaw_encode(s))),
            PayloadCoding::L16 => {
                for s in pcm {
                    out.extend_from_slice(&s.to_be_bytes());
                }
            }
        }
    }

    /// Append the decoded samples of `payload` to `out`.
    ///
    /// A trailing odd byte of an L16 payload is ignored.
    pub fn decode(self, payload: &[u8], out: &mut Vec<i16>) {
        match self {
            PayloadCoding::Pcmu => out.extend(payload.iter().map(|&b| ulaw_decode(b))),
            PayloadCoding::Pcma => out.extend(payload.iter().map(|&b| alaw_decode(b))),
            PayloadCoding::L16 => out.extend(
                payload
                    .chunks_exact(2)
                    .map(|pair| i16::from_be_bytes([pair[0], pair[1]])),
            ),
        }
    }
}

/// A codec the engine supports.
#[derive(Debug, Clone)]
pub struct CodecEntry {
    pub inst: CodecInst,
    pub coding: PayloadCoding,
}

fn entry(pltype: u8, plname: &str, rate: u32, coding: PayloadCoding) -> CodecEntry {
    CodecEntry {
        inst: CodecInst {
            pltype,
            plname: plname.to_string(),
            plfreq: SAMPLE_RATE,
            pacsize: PACKET_SAMPLES as u32,
            channels: 1,
            rate,
        },
        coding,
    }
}

lazy_static! {
    /// Supported codecs in index order.
    pub static ref CODECS: Vec<CodecEntry> = vec![
        entry(0, "PCMU", 64_000, PayloadCoding::Pcmu),
        entry(8, "PCMA", 64_000, PayloadCoding::Pcma),
        entry(96, "L16", 128_000, PayloadCoding::L16),
    ];
}

/// Codec matching `inst` by payload type and name (case-insensitive).
pub fn find(inst: &CodecInst) -> Option<&'static CodecEntry> {
    CODECS.iter().find(|c| {
        c.inst.pltype == inst.pltype
            && c.inst.plname.eq_ignore_ascii_case(&inst.plname)
            && c.inst.plfreq == inst.plfreq
            && c.inst.channels == inst.channels
    })
}

pub fn by_payload_type(pt: u8) -> Option<&'static CodecEntry> {
    CODECS.iter().find(|c| c.inst.pltype == pt)
}

/// Encode one sample to mu-law (ITU-T G.711).
#[inline]
fn ulaw_encode(sample: i16) -> u8 {
    const BIAS: i32 = 0x84;
    const CLIP: i32 = 32635;

    let mut pcm = sample as i32;
    let sign = if pcm < 0 {
        pcm = -pcm;
        0x80
    } else {
        0x00
    };
    let pcm = pcm.min(CLIP) + BIAS;

    // Position of the highest set bit above bit 7 selects the segment
    let exponent = (31 - (pcm as u32).leading_zeros()) as i32 - 7;
    let mantissa = (pcm >> (exponent + 3)) & 0x0F;

    !((sign | (exponent << 4) | mantissa) as u8)
}

#[inline]
fn ulaw_decode(byte: u8) -> i16 {
    let u = !byte;
    let exponent = ((u >> 4) & 0x07) as i32;
    let mantissa = (u & 0x0F) as i32;
    let magnitude = (((mantissa << 3) + 0x84) << exponent) - 0x84;

    if u & 0x80 != 0 {
        -magnitude as i16
    } else {
        magnitude as i16
    }
}

/// Encode one sample to A-law (ITU-T G.711).
#[inline]
fn alaw_encode(sample: i16) -> u8 {
    let mut pcm = sample as i32;
    let sign = if pcm >= 0 {
        0x80
    } else {
        pcm = -pcm - 1;
        0x00
    };

    let (exponent, mantissa) = if pcm < 256 {
        (0, (pcm >> 4) & 0x0F)
    } else {
        let exponent = (31 - (pcm as u32).leading_zeros()) as i32 - 7;
        (exponent, (pcm >> (exponent + 3)) & 0x0F)
    };

    ((sign | (exponent << 4) | mantissa) as u8) ^ 0x55
}

#[inline]
fn alaw_decode(byte: u8) -> i16 {
    let a = byte ^ 0x55;
    let exponent = ((a >> 4) & 0x07) as i32;
    let mantissa = (a & 0x0F) as i32;
    let magnitude = if exponent == 0 {
        (mantissa << 4) + 8
    } else {
        ((mantissa << 4) + 0x108) << (exponent - 1)
    };

    if a & 0x80 != 0 {
        magnitude as i16
    } else {
        -magnitude as i16
    }
}
