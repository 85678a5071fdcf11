//! UDP socket for RTP/RTCP.
//!
//! Each RtpSocket is independent; clones share the same OS socket so one
//! thread can receive while another sends.

use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, UdpSocket};
use std::time::Duration;

/// Read timeout so receive loops can observe their stop flag.
pub const READ_TIMEOUT: Duration = Duration::from_millis(10);

pub struct RtpSocket {
    socket: UdpSocket,
    local_addr: SocketAddr,
}

impl RtpSocket {
    /// Bind to `local_addr` for receiving (and sending from the same port).
    ///
    /// No SO_REUSEADDR: a second bind on a port that is in use must fail.
    /// IPv6 sockets are dual-stack and also reach IPv4 peers.
    pub fn bind(local_addr: SocketAddr) -> io::Result<Self> {
        let socket = Socket::new(
            Domain::for_address(local_addr),
            Type::DGRAM,
            Some(Protocol::UDP),
        )?;

        if local_addr.is_ipv6() {
            socket.set_only_v6(false)?;
        }
        socket.bind(&local_addr.into())?;
        socket.set_read_timeout(Some(READ_TIMEOUT))?;

        let socket: UdpSocket = socket.into();
        let local_addr = socket.local_addr()?;

        Ok(RtpSocket { socket, local_addr })
    }

    /// Bind an ephemeral port of the same address family as `destination`.
    pub fn ephemeral_for(destination: SocketAddr) -> io::Result<Self> {
        let any = match destination.ip() {
            IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            IpAddr::V6(_) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
        };
        Self::bind(SocketAddr::new(any, 0))
    }

    /// Request a kernel receive buffer of `bytes` (best effort).
    pub fn set_recv_buffer_size(&self, bytes: usize) -> io::Result<()> {
        socket2::SockRef::from(&self.socket).set_recv_buffer_size(bytes)
    }

    pub fn send_to(&self, data: &[u8], addr: SocketAddr) -> io::Result<usize> {
        self.socket.send_to(data, self.reachable(addr)?)
    }

    /// Whether this socket can send to `addr`.
    pub fn can_reach(&self, addr: SocketAddr) -> bool {
        self.reachable(addr).is_ok()
    }

    /// `addr` in this socket's family: IPv4 peers of an IPv6 socket are
    /// addressed through their mapped form.
    fn reachable(&self, addr: SocketAddr) -> io::Result<SocketAddr> {
        match (self.local_addr.ip(), addr.ip()) {
            (IpAddr::V6(_), IpAddr::V4(v4)) => {
                Ok(SocketAddr::new(IpAddr::V6(v4.to_ipv6_mapped()), addr.port()))
            }
            (IpAddr::V4(_), IpAddr::V6(_)) => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("IPv4 socket {} cannot reach {}", self.local_addr, addr),
            )),
            _ => Ok(addr),
        }
    }

    /// Receive one datagram; WouldBlock/TimedOut when nothing arrived in time.
    pub fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        self.socket.recv_from(buf)
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        self.socket.set_read_timeout(timeout)
    }

    pub fn try_clone(&self) -> io::Result<Self> {
        Ok(RtpSocket {
            socket: self.socket.try_clone()?,
            local_addr: self.local_addr,
        })
    }
}

impl std::fmt::Debug for RtpSocket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RtpSocket")
            .field("local_addr", &self.local_addr)
            .finish()
    }
}
