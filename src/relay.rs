//! Packet relay between a channel's UDP sockets and the engine.
//!
//! The relay registers itself with the network facet as the channel's
//! external transport. Inbound datagrams arrive on the socket layer's
//! receive thread and are forwarded to the channel's RTP/RTCP ingestion;
//! outbound packets from the engine are handed to the socket layer.
//!
//! ```text
//! UdpTransport rx thread ──► RelayInner::incoming_rtp ──► NetworkControl::received_rtp_packet
//! engine send thread     ──► RelayInner::send_rtp     ──► UdpTransport::send_rtp
//! ```
//!
//! Destroy closes a gate under a write lock. Deliveries hold the read side
//! for the duration of the forward, so once the gate is closed no further
//! packet reaches the channel.

use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use log::{debug, info, trace, warn};
use parking_lot::RwLock;

use crate::engine::{ChannelId, NetworkControl, PacketTime, Transport};
use crate::error::{Step, VoeError};
use crate::transport::{PacketSink, SocketTransport, UdpTransport};

/// Default datagrams of socket buffering requested when receiving starts.
pub const RECEIVE_BUFFER_COUNT: usize = 500;

/// Relay statistics (lock-free atomic updates).
#[derive(Default)]
pub struct RelayStats {
    pub rtp_forwarded: AtomicU64,
    pub rtcp_forwarded: AtomicU64,
    /// Packets that arrived after the relay was closed
    pub rejected_after_close: AtomicU64,
    /// Non-zero status from the channel's ingestion entry points
    pub ingest_errors: AtomicU64,
    pub sent: AtomicU64,
    pub send_errors: AtomicU64,
}

impl RelayStats {
    pub fn snapshot(&self) -> RelayStatsSnapshot {
        RelayStatsSnapshot {
            rtp_forwarded: self.rtp_forwarded.load(Ordering::Relaxed),
            rtcp_forwarded: self.rtcp_forwarded.load(Ordering::Relaxed),
            rejected_after_close: self.rejected_after_close.load(Ordering::Relaxed),
            ingest_errors: self.ingest_errors.load(Ordering::Relaxed),
            sent: self.sent.load(Ordering::Relaxed),
            send_errors: self.send_errors.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RelayStatsSnapshot {
    pub rtp_forwarded: u64,
    pub rtcp_forwarded: u64,
    pub rejected_after_close: u64,
    pub ingest_errors: u64,
    pub sent: u64,
    pub send_errors: u64,
}

impl std::fmt::Display for RelayStatsSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "RTP in {} | RTCP in {} | out {} | send errors {} | ingest errors {}",
            self.rtp_forwarded, self.rtcp_forwarded, self.sent, self.send_errors, self.ingest_errors
        )
    }
}

/// State shared with the socket layer and the engine.
struct RelayInner {
    channel: ChannelId,
    network: Arc<dyn NetworkControl>,
    transport: Arc<dyn SocketTransport>,
    /// true while deliveries may reach the channel
    gate: RwLock<bool>,
    stats: RelayStats,
}

impl RelayInner {
    fn forward_rtp(&self, packet: &[u8]) {
        let open = self.gate.read();
        if !*open {
            self.stats.rejected_after_close.fetch_add(1, Ordering::Relaxed);
            return;
        }
        let status = self
            .network
            .received_rtp_packet(self.channel, packet, PacketTime::now());
        if status == 0 {
            self.stats.rtp_forwarded.fetch_add(1, Ordering::Relaxed);
        } else {
            self.stats.ingest_errors.fetch_add(1, Ordering::Relaxed);
            trace!("Channel {} rejected RTP packet: {}", self.channel, status);
        }
    }

    fn forward_rtcp(&self, packet: &[u8]) {
        let open = self.gate.read();
        if !*open {
            self.stats.rejected_after_close.fetch_add(1, Ordering::Relaxed);
            return;
        }
        let status = self.network.received_rtcp_packet(self.channel, packet);
        if status == 0 {
            self.stats.rtcp_forwarded.fetch_add(1, Ordering::Relaxed);
        } else {
            self.stats.ingest_errors.fetch_add(1, Ordering::Relaxed);
            trace!("Channel {} rejected RTCP packet: {}", self.channel, status);
        }
    }

    fn count_send(&self, result: io::Result<usize>) -> io::Result<usize> {
        match &result {
            Ok(_) => self.stats.sent.fetch_add(1, Ordering::Relaxed),
            Err(_) => self.stats.send_errors.fetch_add(1, Ordering::Relaxed),
        };
        result
    }
}

impl PacketSink for RelayInner {
    // Source address is not part of the ingestion contract
    fn incoming_rtp(&self, packet: &[u8], _from: SocketAddr) {
        self.forward_rtp(packet);
    }

    fn incoming_rtcp(&self, packet: &[u8], _from: SocketAddr) {
        self.forward_rtcp(packet);
    }
}

impl Transport for RelayInner {
    fn send_rtp(&self, channel: ChannelId, packet: &[u8]) -> io::Result<usize> {
        debug_assert_eq!(channel, self.channel);
        self.count_send(self.transport.send_rtp(packet))
    }

    fn send_rtcp(&self, channel: ChannelId, packet: &[u8]) -> io::Result<usize> {
        debug_assert_eq!(channel, self.channel);
        self.count_send(self.transport.send_rtcp(packet))
    }
}

/// Bridges one channel to its UDP sockets.
///
/// Must be destroyed before the channel is deleted; dropping an
/// undestroyed relay destroys it.
pub struct PacketRelay {
    inner: Arc<RelayInner>,
    receive_buffers: usize,
    destroyed: bool,
}

impl PacketRelay {
    /// Create a relay on a new [`UdpTransport`] and register it for `channel`.
    pub fn create(
        network: Arc<dyn NetworkControl>,
        channel: ChannelId,
        socket_threads: u8,
    ) -> Result<Self, VoeError> {
        let transport: Arc<dyn SocketTransport> = UdpTransport::create(channel, socket_threads);
        Self::with_transport(network, channel, transport)
    }

    /// Create a relay over an existing socket layer and register it for `channel`.
    pub fn with_transport(
        network: Arc<dyn NetworkControl>,
        channel: ChannelId,
        transport: Arc<dyn SocketTransport>,
    ) -> Result<Self, VoeError> {
        let inner = Arc::new(RelayInner {
            channel,
            network,
            transport,
            gate: RwLock::new(true),
            stats: RelayStats::default(),
        });

        let status = inner
            .network
            .register_external_transport(channel, inner.clone() as Arc<dyn Transport>);
        if status != 0 {
            *inner.gate.write() = false;
            inner.transport.destroy();
            return Err(VoeError::RegistrationFailed { channel, code: status });
        }

        info!("Packet relay registered for channel {}", channel);
        Ok(Self {
            inner,
            receive_buffers: RECEIVE_BUFFER_COUNT,
            destroyed: false,
        })
    }

    /// Override the socket buffering requested by [`PacketRelay::set_local_receiver`].
    pub fn with_receive_buffers(mut self, count: usize) -> Self {
        self.receive_buffers = count.max(1);
        self
    }

    pub fn channel(&self) -> ChannelId {
        self.inner.channel
    }

    /// Bind the inbound RTP/RTCP sockets on `port`/`port + 1` and start receiving.
    pub fn set_local_receiver(&self, port: u16) -> Result<(), VoeError> {
        let sink = self.inner.clone() as Arc<dyn PacketSink>;
        self.inner
            .transport
            .initialize_receive_sockets(sink, port)
            .and_then(|()| self.inner.transport.start_receiving(self.receive_buffers))
            .map_err(|source| VoeError::BindFailed { port, source })?;

        info!("Channel {} receiving on port {}", self.inner.channel, port);
        Ok(())
    }

    /// Send RTP to `address:port` and RTCP to `address:port + 1`.
    pub fn set_send_destination(&self, address: &str, port: u16) -> Result<(), VoeError> {
        let invalid = |reason: String| VoeError::InvalidDestination {
            address: address.to_string(),
            port,
            reason,
        };

        let ip: IpAddr = address
            .trim()
            .parse()
            .map_err(|e: std::net::AddrParseError| invalid(e.to_string()))?;
        if port == 0 {
            return Err(invalid("port 0".to_string()));
        }

        self.inner
            .transport
            .initialize_send_sockets(SocketAddr::new(ip, port))
            .map_err(|e| invalid(e.to_string()))?;

        info!("Channel {} sending to {}:{}", self.inner.channel, ip, port);
        Ok(())
    }

    /// Forward an inbound RTP packet to the channel.
    pub fn on_inbound_rtp(&self, packet: &[u8]) {
        self.inner.forward_rtp(packet);
    }

    /// Forward an inbound RTCP packet to the channel.
    pub fn on_inbound_rtcp(&self, packet: &[u8]) {
        self.inner.forward_rtcp(packet);
    }

    pub fn stats(&self) -> RelayStatsSnapshot {
        self.inner.stats.snapshot()
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed
    }

    /// Close the relay: quiesce deliveries, deregister from the network
    /// facet, then release the sockets. Later calls do nothing.
    ///
    /// The sockets are released even when deregistration fails.
    pub fn destroy(&mut self) -> Result<(), VoeError> {
        if self.destroyed {
            return Ok(());
        }
        self.destroyed = true;

        // Waits for in-flight deliveries to finish
        *self.inner.gate.write() = false;

        let channel = self.inner.channel;
        let status = self.inner.network.deregister_external_transport(channel);
        if status != 0 {
            warn!(
                "Deregistering transport for channel {} failed: {}",
                channel, status
            );
        }

        self.inner.transport.destroy();
        debug!("Packet relay for channel {} destroyed", channel);

        if status != 0 {
            return Err(VoeError::FacetCallFailed {
                step: Step::DeregisterTransport,
                code: status,
                last_error: None,
            });
        }
        Ok(())
    }
}

impl Drop for PacketRelay {
    fn drop(&mut self) {
        if !self.destroyed {
            let _ = self.destroy();
        }
    }
}

impl std::fmt::Debug for PacketRelay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PacketRelay")
            .field("channel", &self.inner.channel)
            .field("destroyed", &self.destroyed)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct RecordingNetwork {
        register_status: i32,
        registered: Mutex<Option<Arc<dyn Transport>>>,
        rtp: Mutex<Vec<(ChannelId, Vec<u8>)>>,
        rtcp: Mutex<Vec<(ChannelId, Vec<u8>)>>,
        deregistered: Mutex<u32>,
    }

    impl NetworkControl for RecordingNetwork {
        fn register_external_transport(
            &self,
            _channel: ChannelId,
            transport: Arc<dyn Transport>,
        ) -> i32 {
            if self.register_status == 0 {
                *self.registered.lock() = Some(transport);
            }
            self.register_status
        }

        fn deregister_external_transport(&self, _channel: ChannelId) -> i32 {
            *self.deregistered.lock() += 1;
            self.registered.lock().take();
            0
        }

        fn received_rtp_packet(&self, channel: ChannelId, packet: &[u8], _time: PacketTime) -> i32 {
            self.rtp.lock().push((channel, packet.to_vec()));
            0
        }

        fn received_rtcp_packet(&self, channel: ChannelId, packet: &[u8]) -> i32 {
            self.rtcp.lock().push((channel, packet.to_vec()));
            0
        }
    }

    #[derive(Default)]
    struct NullTransport {
        destroyed: Mutex<u32>,
        sent: Mutex<Vec<Vec<u8>>>,
    }

    impl SocketTransport for NullTransport {
        fn initialize_receive_sockets(&self, _sink: Arc<dyn PacketSink>, _port: u16) -> io::Result<()> {
            Ok(())
        }

        fn start_receiving(&self, _buffer_count: usize) -> io::Result<()> {
            Ok(())
        }

        fn initialize_send_sockets(&self, _destination: SocketAddr) -> io::Result<()> {
            Ok(())
        }

        fn send_rtp(&self, packet: &[u8]) -> io::Result<usize> {
            self.sent.lock().push(packet.to_vec());
            Ok(packet.len())
        }

        fn send_rtcp(&self, packet: &[u8]) -> io::Result<usize> {
            self.send_rtp(packet)
        }

        fn destroy(&self) {
            *self.destroyed.lock() += 1;
        }
    }

    #[test]
    fn test_forwards_with_channel_id() {
        let network = Arc::new(RecordingNetwork::default());
        let relay = PacketRelay::with_transport(network.clone(), 4, Arc::new(NullTransport::default())).unwrap();

        relay.on_inbound_rtp(&[0x80; 20]);
        relay.on_inbound_rtcp(&[0x81; 8]);

        assert_eq!(network.rtp.lock()[0], (4, vec![0x80; 20]));
        assert_eq!(network.rtcp.lock()[0], (4, vec![0x81; 8]));
        assert_eq!(relay.stats().rtp_forwarded, 1);
        assert_eq!(relay.stats().rtcp_forwarded, 1);
    }

    #[test]
    fn test_registration_failure_releases_sockets() {
        let network = Arc::new(RecordingNetwork {
            register_status: 8026,
            ..Default::default()
        });
        let transport = Arc::new(NullTransport::default());
        let err = PacketRelay::with_transport(network, 1, transport.clone()).unwrap_err();

        assert!(matches!(err, VoeError::RegistrationFailed { channel: 1, code: 8026 }));
        assert_eq!(*transport.destroyed.lock(), 1);
    }

    #[test]
    fn test_malformed_destination() {
        let network = Arc::new(RecordingNetwork::default());
        let relay = PacketRelay::with_transport(network, 0, Arc::new(NullTransport::default())).unwrap();

        assert!(matches!(
            relay.set_send_destination("127.0.0.300", 800),
            Err(VoeError::InvalidDestination { .. })
        ));
        assert!(matches!(
            relay.set_send_destination("127.0.0.1", 0),
            Err(VoeError::InvalidDestination { .. })
        ));
        assert!(relay.set_send_destination("127.0.0.1", 800).is_ok());
    }

    #[test]
    fn test_outbound_goes_through_socket_layer() {
        let network = Arc::new(RecordingNetwork::default());
        let transport = Arc::new(NullTransport::default());
        let relay = PacketRelay::with_transport(network.clone(), 2, transport.clone()).unwrap();

        let registered = network.registered.lock().clone().unwrap();
        registered.send_rtp(2, &[1, 2, 3]).unwrap();

        assert_eq!(transport.sent.lock()[0], vec![1, 2, 3]);
        assert_eq!(relay.stats().sent, 1);
    }

    #[test]
    fn test_destroy_once_and_reject_after() {
        let network = Arc::new(RecordingNetwork::default());
        let transport = Arc::new(NullTransport::default());
        let mut relay = PacketRelay::with_transport(network.clone(), 0, transport.clone()).unwrap();

        relay.destroy().unwrap();
        relay.destroy().unwrap();
        relay.on_inbound_rtp(&[0u8; 12]);

        assert_eq!(*network.deregistered.lock(), 1);
        assert_eq!(*transport.destroyed.lock(), 1);
        assert!(network.rtp.lock().is_empty());
        assert_eq!(relay.stats().rejected_after_close, 1);
    }

    #[test]
    fn test_drop_destroys() {
        let network = Arc::new(RecordingNetwork::default());
        let transport = Arc::new(NullTransport::default());
        drop(PacketRelay::with_transport(network.clone(), 0, transport.clone()).unwrap());

        assert_eq!(*network.deregistered.lock(), 1);
        assert_eq!(*transport.destroyed.lock(), 1);
    }
}
