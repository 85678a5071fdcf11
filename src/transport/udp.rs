//! UDP implementation of the socket layer.
//!
//! RTP is received on the configured port and RTCP on the next one. A
//! receive thread polls its sockets with a short read timeout and hands each
//! datagram to the sink; with a thread hint of 1 a single thread services
//! both sockets, otherwise each socket gets its own thread.

use std::io::{self, ErrorKind};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use log::{debug, error, trace, warn};
use parking_lot::Mutex;

use super::socket::RtpSocket;
use super::{rtcp_port, PacketKind, PacketSink, SocketTransport};
use crate::engine::ChannelId;
use crate::rtp::MAX_PACKET_LEN;

/// Receive buffer per datagram when sizing socket buffers.
const BYTES_PER_RECEIVE_BUFFER: usize = MAX_PACKET_LEN;

/// Socket-layer statistics (lock-free atomic updates).
#[derive(Default)]
pub struct TransportStats {
    pub rtp_received: AtomicU64,
    pub rtcp_received: AtomicU64,
    pub bytes_received: AtomicU64,
    pub packets_sent: AtomicU64,
    pub bytes_sent: AtomicU64,
    pub send_errors: AtomicU64,
    pub receive_errors: AtomicU64,
}

impl TransportStats {
    pub fn snapshot(&self) -> TransportStatsSnapshot {
        TransportStatsSnapshot {
            rtp_received: self.rtp_received.load(Ordering::Relaxed),
            rtcp_received: self.rtcp_received.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            packets_sent: self.packets_sent.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            send_errors: self.send_errors.load(Ordering::Relaxed),
            receive_errors: self.receive_errors.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransportStatsSnapshot {
    pub rtp_received: u64,
    pub rtcp_received: u64,
    pub bytes_received: u64,
    pub packets_sent: u64,
    pub bytes_sent: u64,
    pub send_errors: u64,
    pub receive_errors: u64,
}

#[derive(Default)]
struct UdpState {
    rtp_socket: Option<RtpSocket>,
    rtcp_socket: Option<RtpSocket>,
    sink: Option<Arc<dyn PacketSink>>,
    rtp_destination: Option<SocketAddr>,
    rtcp_destination: Option<SocketAddr>,
    /// Ephemeral senders, used until receive sockets are bound
    send_rtp_socket: Option<RtpSocket>,
    send_rtcp_socket: Option<RtpSocket>,
    receivers: Vec<JoinHandle<()>>,
    destroyed: bool,
}

/// UDP socket transport for one channel.
pub struct UdpTransport {
    channel: ChannelId,
    socket_threads: u8,
    state: Mutex<UdpState>,
    running: Arc<AtomicBool>,
    stats: Arc<TransportStats>,
}

impl UdpTransport {
    /// Create a transport for `channel`; `socket_threads` is the receive thread hint.
    pub fn create(channel: ChannelId, socket_threads: u8) -> Arc<Self> {
        Arc::new(Self {
            channel,
            socket_threads: socket_threads.max(1),
            state: Mutex::new(UdpState::default()),
            running: Arc::new(AtomicBool::new(false)),
            stats: Arc::new(TransportStats::default()),
        })
    }

    pub fn channel(&self) -> ChannelId {
        self.channel
    }

    /// Port the RTP receive socket is bound to, if any.
    pub fn local_rtp_port(&self) -> Option<u16> {
        self.state
            .lock()
            .rtp_socket
            .as_ref()
            .map(|s| s.local_addr().port())
    }

    pub fn is_receiving(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> TransportStatsSnapshot {
        self.stats.snapshot()
    }

    fn send(&self, kind: PacketKind, packet: &[u8]) -> io::Result<usize> {
        let state = self.state.lock();
        let (destination, socket) = match kind {
            PacketKind::Rtp => (
                state.rtp_destination,
                state.rtp_socket.as_ref().or(state.send_rtp_socket.as_ref()),
            ),
            PacketKind::Rtcp => (
                state.rtcp_destination,
                state.rtcp_socket.as_ref().or(state.send_rtcp_socket.as_ref()),
            ),
        };

        let (Some(destination), Some(socket)) = (destination, socket) else {
            self.stats.send_errors.fetch_add(1, Ordering::Relaxed);
            return Err(io::Error::new(
                ErrorKind::NotConnected,
                "send destination not initialized",
            ));
        };

        match socket.send_to(packet, destination) {
            Ok(sent) => {
                self.stats.packets_sent.fetch_add(1, Ordering::Relaxed);
                self.stats.bytes_sent.fetch_add(sent as u64, Ordering::Relaxed);
                Ok(sent)
            }
            Err(e) => {
                self.stats.send_errors.fetch_add(1, Ordering::Relaxed);
                Err(e)
            }
        }
    }

    /// Receive loop - polls each socket and forwards datagrams to the sink.
    fn receiver_loop(
        sockets: Vec<(RtpSocket, PacketKind)>,
        sink: Arc<dyn PacketSink>,
        running: Arc<AtomicBool>,
        stats: Arc<TransportStats>,
    ) {
        let mut buf = [0u8; 2048];

        'outer: while running.load(Ordering::SeqCst) {
            for (socket, kind) in &sockets {
                match socket.recv_from(&mut buf) {
                    Ok((len, from)) => {
                        stats.bytes_received.fetch_add(len as u64, Ordering::Relaxed);
                        match kind {
                            PacketKind::Rtp => {
                                stats.rtp_received.fetch_add(1, Ordering::Relaxed);
                                sink.incoming_rtp(&buf[..len], from);
                            }
                            PacketKind::Rtcp => {
                                stats.rtcp_received.fetch_add(1, Ordering::Relaxed);
                                sink.incoming_rtcp(&buf[..len], from);
                            }
                        }
                    }
                    Err(ref e) if e.kind() == ErrorKind::WouldBlock => continue,
                    Err(ref e) if e.kind() == ErrorKind::TimedOut => continue,
                    // ICMP port unreachable from an earlier send
                    Err(ref e)
                        if matches!(
                            e.kind(),
                            ErrorKind::ConnectionReset | ErrorKind::ConnectionRefused
                        ) =>
                    {
                        trace!("Receive socket reset: {}", e);
                        continue;
                    }
                    Err(e) => {
                        stats.receive_errors.fetch_add(1, Ordering::Relaxed);
                        error!("Receive socket {} failed: {}", socket.local_addr(), e);
                        break 'outer;
                    }
                }
            }
        }
    }
}

impl SocketTransport for UdpTransport {
    fn initialize_receive_sockets(
        &self,
        sink: Arc<dyn PacketSink>,
        rtp_port: u16,
    ) -> io::Result<()> {
        let mut state = self.state.lock();
        if state.destroyed {
            return Err(io::Error::new(ErrorKind::Other, "transport destroyed"));
        }
        if state.rtp_socket.is_some() {
            return Err(io::Error::new(
                ErrorKind::AlreadyExists,
                "receive sockets already initialized",
            ));
        }

        let rtcp = rtcp_port(rtp_port).ok_or_else(|| {
            io::Error::new(ErrorKind::InvalidInput, "no room for RTCP port above RTP port")
        })?;

        // Same family as the peer; IPv6 sockets are dual-stack
        let any = match state.rtp_destination {
            Some(SocketAddr::V6(_)) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
            _ => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        };
        let rtp_socket = RtpSocket::bind(SocketAddr::new(any, rtp_port))?;
        let rtcp_socket = RtpSocket::bind(SocketAddr::new(any, rtcp))?;

        debug!(
            "Channel {} receive sockets: RTP {} RTCP {}",
            self.channel,
            rtp_socket.local_addr(),
            rtcp_socket.local_addr()
        );

        state.rtp_socket = Some(rtp_socket);
        state.rtcp_socket = Some(rtcp_socket);
        state.sink = Some(sink);
        // Bound sockets take over sending
        state.send_rtp_socket = None;
        state.send_rtcp_socket = None;
        Ok(())
    }

    fn start_receiving(&self, buffer_count: usize) -> io::Result<()> {
        let mut state = self.state.lock();
        if self.running.load(Ordering::SeqCst) {
            return Err(io::Error::new(ErrorKind::AlreadyExists, "already receiving"));
        }

        let (Some(rtp), Some(rtcp), Some(sink)) = (
            state.rtp_socket.as_ref(),
            state.rtcp_socket.as_ref(),
            state.sink.clone(),
        ) else {
            return Err(io::Error::new(
                ErrorKind::NotConnected,
                "receive sockets not initialized",
            ));
        };

        let buffer_bytes = buffer_count.max(1) * BYTES_PER_RECEIVE_BUFFER;
        for socket in [rtp, rtcp] {
            if let Err(e) = socket.set_recv_buffer_size(buffer_bytes) {
                warn!("Could not size receive buffer to {} bytes: {}", buffer_bytes, e);
            }
        }

        let rtp = (rtp.try_clone()?, PacketKind::Rtp);
        let rtcp = (rtcp.try_clone()?, PacketKind::Rtcp);
        let groups = if self.socket_threads <= 1 {
            vec![vec![rtp, rtcp]]
        } else {
            vec![vec![rtp], vec![rtcp]]
        };

        self.running.store(true, Ordering::SeqCst);

        for (i, sockets) in groups.into_iter().enumerate() {
            let sink = sink.clone();
            let running = self.running.clone();
            let stats = self.stats.clone();
            let spawned = thread::Builder::new()
                .name(format!("udp-rx-{}-{}", self.channel, i))
                .spawn(move || Self::receiver_loop(sockets, sink, running, stats));

            match spawned {
                Ok(handle) => state.receivers.push(handle),
                Err(e) => {
                    self.running.store(false, Ordering::SeqCst);
                    return Err(e);
                }
            }
        }

        Ok(())
    }

    fn initialize_send_sockets(&self, destination: SocketAddr) -> io::Result<()> {
        let rtcp = rtcp_port(destination.port())
            .filter(|p| *p != 0)
            .ok_or_else(|| io::Error::new(ErrorKind::InvalidInput, "invalid destination port"))?;

        let mut state = self.state.lock();
        if state.destroyed {
            return Err(io::Error::new(ErrorKind::Other, "transport destroyed"));
        }

        let bound = state
            .rtp_socket
            .as_ref()
            .map(|socket| (socket.local_addr(), socket.can_reach(destination)));
        match bound {
            Some((local, false)) => {
                return Err(io::Error::new(
                    ErrorKind::InvalidInput,
                    format!("receive socket {} cannot send to {}", local, destination),
                ));
            }
            Some((_, true)) => {}
            None => {
                state.send_rtp_socket = Some(RtpSocket::ephemeral_for(destination)?);
                state.send_rtcp_socket = Some(RtpSocket::ephemeral_for(destination)?);
            }
        }

        state.rtp_destination = Some(destination);
        state.rtcp_destination = Some(SocketAddr::new(destination.ip(), rtcp));
        debug!("Channel {} sending to {}", self.channel, destination);
        Ok(())
    }

    fn send_rtp(&self, packet: &[u8]) -> io::Result<usize> {
        self.send(PacketKind::Rtp, packet)
    }

    fn send_rtcp(&self, packet: &[u8]) -> io::Result<usize> {
        self.send(PacketKind::Rtcp, packet)
    }

    fn destroy(&self) {
        self.running.store(false, Ordering::SeqCst);

        // Join outside the lock; receive threads never take it
        let receivers = {
            let mut state = self.state.lock();
            state.destroyed = true;
            std::mem::take(&mut state.receivers)
        };
        for handle in receivers {
            let _ = handle.join();
        }

        let mut state = self.state.lock();
        state.rtp_socket = None;
        state.rtcp_socket = None;
        state.send_rtp_socket = None;
        state.send_rtcp_socket = None;
        state.sink = None;
        debug!("Channel {} transport destroyed", self.channel);
    }
}

impl Drop for UdpTransport {
    fn drop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        for handle in self.state.get_mut().receivers.drain(..) {
            let _ = handle.join();
        }
    }
}
