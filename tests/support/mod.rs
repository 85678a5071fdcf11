//! Journaling fakes for integration tests.
//!
//! `FakeEngine` records every engine call by name into a shared journal and
//! returns a configurable status per call. `FakeSockets` stands in for the
//! UDP layer: it keeps the sink the relay registers so a test can deliver
//! datagrams by hand, and journals its own lifecycle into the same journal.

#![allow(dead_code)]

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use voe_call::engine::{
    BaseControl, ChannelId, CodecControl, CodecInst, DeviceInfo, EngineObserver, Facet,
    FacetHandle, FileControl, HardwareControl, MediaEngine, NetworkControl, PacketTime,
    ProcessingControl, Status, Transport, VolumeControl,
};
use voe_call::transport::{PacketSink, SocketTransport};

/// Ordered log of calls shared between the fakes.
#[derive(Clone, Default)]
pub struct Journal(Arc<Mutex<Vec<String>>>);

impl Journal {
    pub fn push(&self, entry: impl Into<String>) {
        self.0.lock().push(entry.into());
    }

    pub fn entries(&self) -> Vec<String> {
        self.0.lock().clone()
    }

    pub fn contains(&self, entry: &str) -> bool {
        self.0.lock().iter().any(|e| e == entry)
    }

    /// Position of the first matching entry.
    pub fn position(&self, entry: &str) -> Option<usize> {
        self.0.lock().iter().position(|e| e == entry)
    }

    /// Entries from `names` in the order they were recorded.
    pub fn only(&self, names: &[&str]) -> Vec<String> {
        self.0
            .lock()
            .iter()
            .filter(|e| names.contains(&e.as_str()))
            .cloned()
            .collect()
    }
}

pub fn pcmu() -> CodecInst {
    CodecInst {
        pltype: 0,
        plname: "PCMU".to_string(),
        plfreq: 8000,
        pacsize: 160,
        channels: 1,
        rate: 64000,
    }
}

pub fn pcma() -> CodecInst {
    CodecInst {
        pltype: 8,
        plname: "PCMA".to_string(),
        ..pcmu()
    }
}

/// Facet state behind every handle of a [`FakeEngine`].
pub struct FakeCore {
    journal: Journal,
    failures: Mutex<HashMap<&'static str, Status>>,
    observer: Mutex<Option<Arc<dyn EngineObserver>>>,
    transports: Mutex<HashMap<ChannelId, Arc<dyn Transport>>>,
    received_rtp: Mutex<Vec<(ChannelId, Vec<u8>)>>,
    received_rtcp: Mutex<Vec<(ChannelId, Vec<u8>)>>,
    send_codec: Mutex<Option<(ChannelId, CodecInst)>>,
    next_channel: AtomicI32,
    mic_volume: AtomicI32,
    last_error: AtomicI32,
}

impl FakeCore {
    fn call(&self, name: &'static str) -> Status {
        self.journal.push(name);
        self.failures.lock().get(name).copied().unwrap_or(0)
    }

    fn query<T>(&self, name: &'static str, value: impl FnOnce() -> T) -> Result<T, Status> {
        match self.call(name) {
            0 => Ok(value()),
            status => Err(status),
        }
    }
}

impl BaseControl for FakeCore {
    fn init(&self) -> Status {
        self.call("Init")
    }

    fn terminate(&self) -> Status {
        self.call("Terminate")
    }

    fn version(&self) -> Result<String, Status> {
        self.query("GetVersion", || "FakeEngine 1.0".to_string())
    }

    fn last_error(&self) -> i32 {
        self.journal.push("LastError");
        self.last_error.load(Ordering::SeqCst)
    }

    fn register_observer(&self, observer: Arc<dyn EngineObserver>) -> Status {
        let status = self.call("RegisterObserver");
        if status == 0 {
            *self.observer.lock() = Some(observer);
        }
        status
    }

    fn deregister_observer(&self) -> Status {
        let status = self.call("DeregisterObserver");
        if status == 0 {
            self.observer.lock().take();
        }
        status
    }

    fn create_channel(&self) -> Result<ChannelId, Status> {
        self.query("CreateChannel", || {
            self.next_channel.fetch_add(1, Ordering::SeqCst)
        })
    }

    fn delete_channel(&self, _channel: ChannelId) -> Status {
        self.call("DeleteChannel")
    }

    fn start_receive(&self, _channel: ChannelId) -> Status {
        self.call("StartReceive")
    }

    fn stop_receive(&self, _channel: ChannelId) -> Status {
        self.call("StopReceive")
    }

    fn start_playout(&self, _channel: ChannelId) -> Status {
        self.call("StartPlayout")
    }

    fn stop_playout(&self, _channel: ChannelId) -> Status {
        self.call("StopPlayout")
    }

    fn start_send(&self, _channel: ChannelId) -> Status {
        self.call("StartSend")
    }

    fn stop_send(&self, _channel: ChannelId) -> Status {
        self.call("StopSend")
    }
}

impl CodecControl for FakeCore {
    fn num_of_codecs(&self) -> usize {
        2
    }

    fn codec(&self, index: usize) -> Result<CodecInst, Status> {
        match index {
            0 => self.query("GetCodec", pcmu),
            1 => self.query("GetCodec", pcma),
            _ => {
                self.journal.push("GetCodec");
                Err(-1)
            }
        }
    }

    fn set_send_codec(&self, channel: ChannelId, codec: &CodecInst) -> Status {
        let status = self.call("SetSendCodec");
        if status == 0 {
            *self.send_codec.lock() = Some((channel, codec.clone()));
        }
        status
    }

    fn set_vad_status(&self, _channel: ChannelId, _enable: bool) -> Status {
        self.call("SetVADStatus")
    }
}

impl ProcessingControl for FakeCore {
    fn set_agc_status(&self, _enable: bool) -> Status {
        self.call("SetAgcStatus")
    }

    fn set_ec_status(&self, _enable: bool) -> Status {
        self.call("SetEcStatus")
    }

    fn set_ns_status(&self, _enable: bool) -> Status {
        self.call("SetNsStatus")
    }

    fn set_rx_agc_status(&self, _channel: ChannelId, _enable: bool) -> Status {
        self.call("SetRxAgcStatus")
    }

    fn set_rx_ns_status(&self, _channel: ChannelId, _enable: bool) -> Status {
        self.call("SetRxNsStatus")
    }
}

impl VolumeControl for FakeCore {
    fn mic_volume(&self) -> Result<u32, Status> {
        self.query("GetMicVolume", || {
            self.mic_volume.load(Ordering::SeqCst) as u32
        })
    }

    fn speaker_volume(&self) -> Result<u32, Status> {
        self.query("GetSpeakerVolume", || 128)
    }
}

impl NetworkControl for FakeCore {
    fn register_external_transport(
        &self,
        channel: ChannelId,
        transport: Arc<dyn Transport>,
    ) -> Status {
        let status = self.call("RegisterExternalTransport");
        if status == 0 {
            self.transports.lock().insert(channel, transport);
        }
        status
    }

    fn deregister_external_transport(&self, channel: ChannelId) -> Status {
        let status = self.call("DeRegisterExternalTransport");
        if status == 0 {
            self.transports.lock().remove(&channel);
        }
        status
    }

    fn received_rtp_packet(&self, channel: ChannelId, packet: &[u8], _time: PacketTime) -> Status {
        let status = self.failures.lock().get("ReceivedRTPPacket").copied().unwrap_or(0);
        if status == 0 {
            self.received_rtp.lock().push((channel, packet.to_vec()));
        }
        status
    }

    fn received_rtcp_packet(&self, channel: ChannelId, packet: &[u8]) -> Status {
        self.received_rtcp.lock().push((channel, packet.to_vec()));
        0
    }
}

impl FileControl for FakeCore {
    fn start_recording_microphone(&self, _path: &Path) -> Status {
        self.call("StartRecordingMicrophone")
    }

    fn stop_recording_microphone(&self) -> Status {
        self.call("StopRecordingMicrophone")
    }

    fn start_recording_playout(&self, _channel: ChannelId, _path: &Path) -> Status {
        self.call("StartRecordingPlayout")
    }

    fn stop_recording_playout(&self, _channel: ChannelId) -> Status {
        self.call("StopRecordingPlayout")
    }
}

impl HardwareControl for FakeCore {
    fn num_of_playout_devices(&self) -> Result<usize, Status> {
        self.query("GetNumOfPlayoutDevices", || 1)
    }

    fn num_of_recording_devices(&self) -> Result<usize, Status> {
        self.query("GetNumOfRecordingDevices", || 1)
    }

    fn playout_device_name(&self, index: usize) -> Result<DeviceInfo, Status> {
        self.query("GetPlayoutDeviceName", || DeviceInfo {
            name: format!("Speaker {}", index),
            guid: format!("spk-{}", index),
        })
    }

    fn recording_device_name(&self, index: usize) -> Result<DeviceInfo, Status> {
        self.query("GetRecordingDeviceName", || DeviceInfo {
            name: format!("Mic {}", index),
            guid: format!("mic-{}", index),
        })
    }

    fn set_playout_device(&self, _index: usize) -> Status {
        self.call("SetPlayoutDevice")
    }

    fn set_recording_device(&self, _index: usize) -> Status {
        self.call("SetRecordingDevice")
    }
}

/// Media engine whose calls are journaled and can be made to fail.
pub struct FakeEngine {
    core: Arc<FakeCore>,
    refs: [AtomicI32; 7],
    deleted: AtomicBool,
}

impl FakeEngine {
    pub fn new(journal: Journal) -> Arc<Self> {
        Arc::new(Self {
            core: Arc::new(FakeCore {
                journal,
                failures: Mutex::new(HashMap::new()),
                observer: Mutex::new(None),
                transports: Mutex::new(HashMap::new()),
                received_rtp: Mutex::new(Vec::new()),
                received_rtcp: Mutex::new(Vec::new()),
                send_codec: Mutex::new(None),
                next_channel: AtomicI32::new(0),
                mic_volume: AtomicI32::new(200),
                last_error: AtomicI32::new(0),
            }),
            refs: Default::default(),
            deleted: AtomicBool::new(false),
        })
    }

    /// Make every later call named `name` return `status`.
    pub fn fail(&self, name: &'static str, status: Status) {
        self.core.failures.lock().insert(name, status);
    }

    /// Code reported by `last_error()` from now on.
    pub fn set_last_error(&self, code: Status) {
        self.core.last_error.store(code, Ordering::SeqCst);
    }

    pub fn set_mic_volume(&self, volume: i32) {
        self.core.mic_volume.store(volume, Ordering::SeqCst);
    }

    pub fn references(&self, facet: Facet) -> i32 {
        self.refs[facet.index()].load(Ordering::SeqCst)
    }

    pub fn total_references(&self) -> i32 {
        Facet::ALL.iter().map(|&f| self.references(f)).sum()
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted.load(Ordering::SeqCst)
    }

    pub fn received_rtp(&self) -> Vec<(ChannelId, Vec<u8>)> {
        self.core.received_rtp.lock().clone()
    }

    pub fn received_rtcp(&self) -> Vec<(ChannelId, Vec<u8>)> {
        self.core.received_rtcp.lock().clone()
    }

    pub fn send_codec(&self) -> Option<(ChannelId, CodecInst)> {
        self.core.send_codec.lock().clone()
    }

    pub fn has_transport(&self, channel: ChannelId) -> bool {
        self.core.transports.lock().contains_key(&channel)
    }

    /// Transport registered for `channel`, as the engine's send path sees it.
    pub fn transport(&self, channel: ChannelId) -> Option<Arc<dyn Transport>> {
        self.core.transports.lock().get(&channel).cloned()
    }

    /// Raise an asynchronous error notification to the registered observer.
    pub fn raise(&self, channel: ChannelId, code: i32) -> bool {
        let observer = self.core.observer.lock().clone();
        match observer {
            Some(observer) => {
                observer.on_error(channel, code);
                true
            }
            None => false,
        }
    }
}

impl MediaEngine for FakeEngine {
    fn acquire(&self, facet: Facet) -> Option<FacetHandle> {
        if self.is_deleted() {
            return None;
        }
        self.refs[facet.index()].fetch_add(1, Ordering::SeqCst);
        let core = self.core.clone();
        Some(match facet {
            Facet::Base => FacetHandle::Base(core),
            Facet::Codec => FacetHandle::Codec(core),
            Facet::Processing => FacetHandle::Processing(core),
            Facet::Volume => FacetHandle::Volume(core),
            Facet::Network => FacetHandle::Network(core),
            Facet::File => FacetHandle::File(core),
            Facet::Hardware => FacetHandle::Hardware(core),
        })
    }

    fn release(&self, facet: Facet) -> i32 {
        self.refs[facet.index()].fetch_sub(1, Ordering::SeqCst) - 1
    }

    fn delete(&self) -> bool {
        self.core.journal.push("Delete");
        !self.deleted.swap(true, Ordering::SeqCst)
    }
}

/// Socket layer stand-in that records addresses and keeps the sink.
pub struct FakeSockets {
    journal: Journal,
    sink: Mutex<Option<Arc<dyn PacketSink>>>,
    local_port: Mutex<Option<u16>>,
    destination: Mutex<Option<SocketAddr>>,
    receive_buffers: Mutex<Option<usize>>,
    sent_rtp: Mutex<Vec<Vec<u8>>>,
    sent_rtcp: Mutex<Vec<Vec<u8>>>,
    fail_bind: AtomicBool,
    destroyed: AtomicBool,
}

impl FakeSockets {
    pub fn new(journal: Journal) -> Arc<Self> {
        Arc::new(Self {
            journal,
            sink: Mutex::new(None),
            local_port: Mutex::new(None),
            destination: Mutex::new(None),
            receive_buffers: Mutex::new(None),
            sent_rtp: Mutex::new(Vec::new()),
            sent_rtcp: Mutex::new(Vec::new()),
            fail_bind: AtomicBool::new(false),
            destroyed: AtomicBool::new(false),
        })
    }

    /// Make the next receive socket initialisation fail as if the port were taken.
    pub fn fail_bind(&self) {
        self.fail_bind.store(true, Ordering::SeqCst);
    }

    pub fn local_port(&self) -> Option<u16> {
        *self.local_port.lock()
    }

    pub fn destination(&self) -> Option<SocketAddr> {
        *self.destination.lock()
    }

    pub fn receive_buffers(&self) -> Option<usize> {
        *self.receive_buffers.lock()
    }

    pub fn sent_rtp(&self) -> Vec<Vec<u8>> {
        self.sent_rtp.lock().clone()
    }

    pub fn sent_rtcp(&self) -> Vec<Vec<u8>> {
        self.sent_rtcp.lock().clone()
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }

    /// Deliver a datagram as if it arrived on the RTP port.
    ///
    /// Delivery still reaches the sink after destroy, like a receive thread
    /// racing the close.
    pub fn deliver_rtp(&self, packet: &[u8]) -> bool {
        let sink = self.sink.lock().clone();
        match sink {
            Some(sink) => {
                sink.incoming_rtp(packet, "127.0.0.1:5004".parse().unwrap());
                true
            }
            None => false,
        }
    }

    pub fn deliver_rtcp(&self, packet: &[u8]) -> bool {
        let sink = self.sink.lock().clone();
        match sink {
            Some(sink) => {
                sink.incoming_rtcp(packet, "127.0.0.1:5005".parse().unwrap());
                true
            }
            None => false,
        }
    }
}

impl SocketTransport for FakeSockets {
    fn initialize_receive_sockets(
        &self,
        sink: Arc<dyn PacketSink>,
        rtp_port: u16,
    ) -> io::Result<()> {
        self.journal.push("InitializeReceiveSockets");
        if self.fail_bind.load(Ordering::SeqCst) {
            return Err(io::Error::new(io::ErrorKind::AddrInUse, "port in use"));
        }
        *self.sink.lock() = Some(sink);
        *self.local_port.lock() = Some(rtp_port);
        Ok(())
    }

    fn start_receiving(&self, buffer_count: usize) -> io::Result<()> {
        self.journal.push("StartReceiving");
        *self.receive_buffers.lock() = Some(buffer_count);
        Ok(())
    }

    fn initialize_send_sockets(&self, destination: SocketAddr) -> io::Result<()> {
        self.journal.push("InitializeSendSockets");
        *self.destination.lock() = Some(destination);
        Ok(())
    }

    fn send_rtp(&self, packet: &[u8]) -> io::Result<usize> {
        self.sent_rtp.lock().push(packet.to_vec());
        Ok(packet.len())
    }

    fn send_rtcp(&self, packet: &[u8]) -> io::Result<usize> {
        self.sent_rtcp.lock().push(packet.to_vec());
        Ok(packet.len())
    }

    fn destroy(&self) {
        self.journal.push("DestroySockets");
        self.destroyed.store(true, Ordering::SeqCst);
    }
}

/// An even local port whose successor is also free, for an RTP/RTCP pair.
pub fn free_port_pair() -> (u16, u16) {
    for _ in 0..64 {
        let candidate = std::net::UdpSocket::bind("0.0.0.0:0").unwrap();
        let port = candidate.local_addr().unwrap().port() & !1;
        drop(candidate);
        if port == 0 || port == u16::MAX - 1 {
            continue;
        }
        let pair = (
            std::net::UdpSocket::bind(("0.0.0.0", port)),
            std::net::UdpSocket::bind(("0.0.0.0", port + 1)),
        );
        if let (Ok(_), Ok(_)) = pair {
            return (port, port + 1);
        }
    }
    panic!("no free UDP port pair");
}
