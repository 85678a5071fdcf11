//! Media engine interface consumed by the call session.
//!
//! The engine is split into facets (base, codec, processing, volume,
//! network, file, hardware), each acquired as a reference-counted handle
//! from the root [`MediaEngine`]. Setters return an integer [`Status`]
//! where zero means success; getters return `Result<T, Status>`.
//!
//! IMPORTANT: [`EngineInstance`] is the sole root owner. Every facet handle
//! must be released before [`EngineInstance::delete`] is called.

pub mod codes;
pub mod loopback;

use std::fmt;
use std::io;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use log::{info, warn};

/// Integer status returned by engine calls (0 = success).
pub type Status = i32;

/// Channel identifier. Negative values never name a live channel.
pub type ChannelId = i32;

/// Functional facets of the media engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Facet {
    Base,
    Codec,
    Processing,
    Volume,
    Network,
    File,
    Hardware,
}

impl Facet {
    /// Every facet, in acquisition order.
    pub const ALL: [Facet; 7] = [
        Facet::Base,
        Facet::Codec,
        Facet::Processing,
        Facet::Volume,
        Facet::Network,
        Facet::File,
        Facet::Hardware,
    ];

    /// Position of the facet in [`Facet::ALL`].
    pub fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for Facet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Codec description as listed by the codec facet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodecInst {
    /// RTP payload type
    pub pltype: u8,
    /// Payload name (e.g. "PCMU")
    pub plname: String,
    /// Sample rate in Hz
    pub plfreq: u32,
    /// Samples per packet
    pub pacsize: u32,
    /// Number of channels
    pub channels: u8,
    /// Bitrate in bits per second
    pub rate: u32,
}

impl fmt::Display for CodecInst {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:3}  {}/{}/{}",
            self.pltype, self.plname, self.plfreq, self.channels
        )
    }
}

/// Audio device name and unique id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    pub name: String,
    pub guid: String,
}

/// Arrival time attached to an inbound RTP packet.
#[derive(Debug, Clone, Copy)]
pub struct PacketTime {
    pub arrival: Instant,
}

impl PacketTime {
    pub fn now() -> Self {
        Self { arrival: Instant::now() }
    }
}

/// Outbound packet path the engine sends a channel's RTP/RTCP through.
pub trait Transport: Send + Sync {
    fn send_rtp(&self, channel: ChannelId, packet: &[u8]) -> io::Result<usize>;
    fn send_rtcp(&self, channel: ChannelId, packet: &[u8]) -> io::Result<usize>;
}

/// Callback the engine invokes from its notification thread.
pub trait EngineObserver: Send + Sync {
    fn on_error(&self, channel: ChannelId, code: i32);
}

pub trait BaseControl: Send + Sync {
    fn init(&self) -> Status;
    fn terminate(&self) -> Status;
    fn version(&self) -> Result<String, Status>;
    /// Detailed error code of the most recent failed call.
    fn last_error(&self) -> i32;
    fn register_observer(&self, observer: Arc<dyn EngineObserver>) -> Status;
    fn deregister_observer(&self) -> Status;
    fn create_channel(&self) -> Result<ChannelId, Status>;
    fn delete_channel(&self, channel: ChannelId) -> Status;
    fn start_receive(&self, channel: ChannelId) -> Status;
    fn stop_receive(&self, channel: ChannelId) -> Status;
    fn start_playout(&self, channel: ChannelId) -> Status;
    fn stop_playout(&self, channel: ChannelId) -> Status;
    fn start_send(&self, channel: ChannelId) -> Status;
    fn stop_send(&self, channel: ChannelId) -> Status;
}

pub trait CodecControl: Send + Sync {
    fn num_of_codecs(&self) -> usize;
    fn codec(&self, index: usize) -> Result<CodecInst, Status>;
    fn set_send_codec(&self, channel: ChannelId, codec: &CodecInst) -> Status;
    fn set_vad_status(&self, channel: ChannelId, enable: bool) -> Status;
}

pub trait ProcessingControl: Send + Sync {
    fn set_agc_status(&self, enable: bool) -> Status;
    fn set_ec_status(&self, enable: bool) -> Status;
    fn set_ns_status(&self, enable: bool) -> Status;
    fn set_rx_agc_status(&self, channel: ChannelId, enable: bool) -> Status;
    fn set_rx_ns_status(&self, channel: ChannelId, enable: bool) -> Status;
}

pub trait VolumeControl: Send + Sync {
    /// Microphone volume in the range 0-255.
    fn mic_volume(&self) -> Result<u32, Status>;
    /// Speaker volume in the range 0-255.
    fn speaker_volume(&self) -> Result<u32, Status>;
}

pub trait NetworkControl: Send + Sync {
    fn register_external_transport(&self, channel: ChannelId, transport: Arc<dyn Transport>)
        -> Status;
    fn deregister_external_transport(&self, channel: ChannelId) -> Status;
    fn received_rtp_packet(&self, channel: ChannelId, packet: &[u8], time: PacketTime) -> Status;
    fn received_rtcp_packet(&self, channel: ChannelId, packet: &[u8]) -> Status;
}

pub trait FileControl: Send + Sync {
    fn start_recording_microphone(&self, path: &Path) -> Status;
    fn stop_recording_microphone(&self) -> Status;
    fn start_recording_playout(&self, channel: ChannelId, path: &Path) -> Status;
    fn stop_recording_playout(&self, channel: ChannelId) -> Status;
}

pub trait HardwareControl: Send + Sync {
    fn num_of_playout_devices(&self) -> Result<usize, Status>;
    fn num_of_recording_devices(&self) -> Result<usize, Status>;
    fn playout_device_name(&self, index: usize) -> Result<DeviceInfo, Status>;
    fn recording_device_name(&self, index: usize) -> Result<DeviceInfo, Status>;
    fn set_playout_device(&self, index: usize) -> Status;
    fn set_recording_device(&self, index: usize) -> Status;
}

/// A capability view into one facet of the engine.
#[derive(Clone)]
pub enum FacetHandle {
    Base(Arc<dyn BaseControl>),
    Codec(Arc<dyn CodecControl>),
    Processing(Arc<dyn ProcessingControl>),
    Volume(Arc<dyn VolumeControl>),
    Network(Arc<dyn NetworkControl>),
    File(Arc<dyn FileControl>),
    Hardware(Arc<dyn HardwareControl>),
}

impl FacetHandle {
    pub fn facet(&self) -> Facet {
        match self {
            FacetHandle::Base(_) => Facet::Base,
            FacetHandle::Codec(_) => Facet::Codec,
            FacetHandle::Processing(_) => Facet::Processing,
            FacetHandle::Volume(_) => Facet::Volume,
            FacetHandle::Network(_) => Facet::Network,
            FacetHandle::File(_) => Facet::File,
            FacetHandle::Hardware(_) => Facet::Hardware,
        }
    }
}

impl fmt::Debug for FacetHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("FacetHandle").field(&self.facet()).finish()
    }
}

/// Root of a media engine implementation.
pub trait MediaEngine: Send + Sync {
    /// Acquire a facet handle, incrementing its reference count.
    /// Returns `None` when the facet is unsupported or the engine is deleted.
    fn acquire(&self, facet: Facet) -> Option<FacetHandle>;

    /// Release one reference to `facet`; returns the references still held.
    fn release(&self, facet: Facet) -> i32;

    /// Destroy the engine. Returns `false` if it was already destroyed.
    fn delete(&self) -> bool;
}

/// Owner of the process's media engine.
///
/// Created first and deleted last; the registry borrows it to acquire
/// facet handles.
pub struct EngineInstance {
    engine: Arc<dyn MediaEngine>,
    deleted: bool,
}

impl EngineInstance {
    pub fn create(engine: Arc<dyn MediaEngine>) -> Self {
        info!("Engine instance created");
        Self {
            engine,
            deleted: false,
        }
    }

    pub(crate) fn engine(&self) -> &Arc<dyn MediaEngine> {
        &self.engine
    }

    /// Delete the engine, consuming the instance.
    pub fn delete(mut self) -> bool {
        self.deleted = true;
        let ok = self.engine.delete();
        if ok {
            info!("Engine instance deleted");
        } else {
            warn!("Engine instance was already deleted");
        }
        ok
    }
}

impl Drop for EngineInstance {
    fn drop(&mut self) {
        if !self.deleted {
            warn!("Engine instance dropped without delete; deleting now");
            self.engine.delete();
        }
    }
}

impl fmt::Debug for EngineInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineInstance")
            .field("deleted", &self.deleted)
            .finish()
    }
}
