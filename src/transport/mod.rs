//! Socket layer between the network and the packet relay.
//!
//! A [`SocketTransport`] owns the UDP sockets of one channel: it delivers
//! inbound datagrams to a [`PacketSink`] from its own receive thread(s) and
//! sends outbound RTP/RTCP to the configured destination.

pub mod socket;
pub mod udp;

pub use socket::RtpSocket;
pub use udp::{TransportStats, TransportStatsSnapshot, UdpTransport};

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

/// Receiver of inbound datagrams, called on the socket layer's threads.
pub trait PacketSink: Send + Sync {
    fn incoming_rtp(&self, packet: &[u8], from: SocketAddr);
    fn incoming_rtcp(&self, packet: &[u8], from: SocketAddr);
}

/// Contract of the UDP socket layer used by the relay.
///
/// RTP uses the given port and RTCP uses the port above it, on both the
/// receive and the send side.
pub trait SocketTransport: Send + Sync {
    /// Open the receive sockets and remember the sink for delivery.
    fn initialize_receive_sockets(&self, sink: Arc<dyn PacketSink>, rtp_port: u16)
        -> io::Result<()>;

    /// Start the receive loop with `buffer_count` datagrams of socket buffering.
    fn start_receiving(&self, buffer_count: usize) -> io::Result<()>;

    /// Set the outbound destination for RTP (and RTCP on the next port).
    fn initialize_send_sockets(&self, destination: SocketAddr) -> io::Result<()>;

    fn send_rtp(&self, packet: &[u8]) -> io::Result<usize>;
    fn send_rtcp(&self, packet: &[u8]) -> io::Result<usize>;

    /// Stop receiving and close every socket. Safe to call more than once.
    fn destroy(&self);
}

/// Which port a datagram arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketKind {
    Rtp,
    Rtcp,
}

/// RTCP port paired with an RTP port (0 stays ephemeral).
pub fn rtcp_port(rtp_port: u16) -> Option<u16> {
    if rtp_port == 0 {
        Some(0)
    } else {
        rtp_port.checked_add(1)
    }
}
