//! RTP header parsing and packet building (RFC 3550).

/// Fixed RTP header size without CSRC entries.
pub const RTP_HEADER_LEN: usize = 12;

/// Largest datagram the relay and the loopback engine handle.
pub const MAX_PACKET_LEN: usize = 1500;

/// RTP header fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtpHeader {
    pub padding: bool,
    pub extension: bool,
    pub csrc_count: u8,
    pub marker: bool,
    /// Payload type (0-127)
    pub payload_type: u8,
    pub sequence: u16,
    pub timestamp: u32,
    pub ssrc: u32,
}

impl RtpHeader {
    /// Parse the fixed header. Returns `None` for short data or version != 2.
    pub fn parse(data: &[u8]) -> Option<Self> {
        if data.len() < RTP_HEADER_LEN {
            return None;
        }

        if (data[0] >> 6) & 0x03 != 2 {
            return None;
        }

        Some(RtpHeader {
            padding: (data[0] & 0x20) != 0,
            extension: (data[0] & 0x10) != 0,
            csrc_count: data[0] & 0x0F,
            marker: (data[1] & 0x80) != 0,
            payload_type: data[1] & 0x7F,
            sequence: u16::from_be_bytes([data[2], data[3]]),
            timestamp: u32::from_be_bytes([data[4], data[5], data[6], data[7]]),
            ssrc: u32::from_be_bytes([data[8], data[9], data[10], data[11]]),
        })
    }

    /// Header size including the CSRC list.
    pub fn header_size(&self) -> usize {
        RTP_HEADER_LEN + self.csrc_count as usize * 4
    }

    /// Write the fixed header into `buffer`; returns bytes written (0 if too small).
    pub fn encode(&self, buffer: &mut [u8]) -> usize {
        if buffer.len() < RTP_HEADER_LEN {
            return 0;
        }

        buffer[0] = (2 << 6)
            | if self.padding { 0x20 } else { 0 }
            | if self.extension { 0x10 } else { 0 }
            | (self.csrc_count & 0x0F);
        buffer[1] = if self.marker { 0x80 } else { 0 } | (self.payload_type & 0x7F);
        buffer[2..4].copy_from_slice(&self.sequence.to_be_bytes());
        buffer[4..8].copy_from_slice(&self.timestamp.to_be_bytes());
        buffer[8..12].copy_from_slice(&self.ssrc.to_be_bytes());

        RTP_HEADER_LEN
    }
}

/// Parsed RTP packet borrowing its payload.
#[derive(Debug)]
pub struct RtpPacket<'a> {
    pub header: RtpHeader,
    /// Payload after CSRC list and extension, without padding
    pub payload: &'a [u8],
}

impl<'a> RtpPacket<'a> {
    pub fn parse(data: &'a [u8]) -> Option<Self> {
        let header = RtpHeader::parse(data)?;
        let mut offset = header.header_size();

        if header.extension {
            if data.len() < offset + 4 {
                return None;
            }
            // Extension length counts 32-bit words
            let words = u16::from_be_bytes([data[offset + 2], data[offset + 3]]) as usize;
            offset += 4 + words * 4;
        }

        if offset > data.len() {
            return None;
        }

        let end = if header.padding {
            let pad = data[data.len() - 1] as usize;
            if pad > data.len() - offset {
                return None;
            }
            data.len() - pad
        } else {
            data.len()
        };

        Some(RtpPacket {
            header,
            payload: &data[offset..end],
        })
    }
}

/// Builds consecutive RTP packets for one outgoing stream.
pub struct RtpPacketBuilder {
    ssrc: u32,
    sequence: u16,
    timestamp: u32,
    payload_type: u8,
    buffer: Vec<u8>,
}

impl RtpPacketBuilder {
    pub fn new(ssrc: u32, payload_type: u8) -> Self {
        Self {
            ssrc,
            sequence: 0,
            timestamp: 0,
            payload_type,
            buffer: vec![0u8; MAX_PACKET_LEN],
        }
    }

    pub fn set_payload_type(&mut self, pt: u8) {
        self.payload_type = pt;
    }

    /// Build the next packet, then advance sequence and timestamp.
    ///
    /// Payloads longer than the MTU are truncated.
    pub fn build_packet(&mut self, payload: &[u8], samples: u32, marker: bool) -> &[u8] {
        let header = RtpHeader {
            padding: false,
            extension: false,
            csrc_count: 0,
            marker,
            payload_type: self.payload_type,
            sequence: self.sequence,
            timestamp: self.timestamp,
            ssrc: self.ssrc,
        };

        let header_len = header.encode(&mut self.buffer);
        let payload_len = payload.len().min(self.buffer.len() - header_len);
        self.buffer[header_len..header_len + payload_len].copy_from_slice(&payload[..payload_len]);

        self.sequence = self.sequence.wrapping_add(1);
        self.timestamp = self.timestamp.wrapping_add(samples);

        &self.buffer[..header_len + payload_len]
    }

    /// Advance the timestamp for samples that were not sent.
    pub fn advance_timestamp(&mut self, samples: u32) {
        self.timestamp = self.timestamp.wrapping_add(samples);
    }

    pub fn sequence(&self) -> u16 {
        self.sequence
    }

    pub fn timestamp(&self) -> u32 {
        self.timestamp
    }

    pub fn ssrc(&self) -> u32 {
        self.ssrc
    }
}
