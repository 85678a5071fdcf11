//! In-process software media engine.
//!
//! Implements every facet over virtual devices: a tone generator stands in
//! for the microphone and a null sink for the speaker. Channels really send
//! and receive RTP through the registered external transport, so two
//! sessions (or one session sending to itself) carry audio end to end.
//!
//! A monitor thread, started by `init` and stopped by `terminate`, raises
//! receive-timeout and receipt-restarted notifications to the registered
//! observer.

pub mod channel;
pub mod codec;
pub mod recorder;

pub use channel::ChannelStatsSnapshot;

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{debug, info, warn};
use parking_lot::{Mutex, RwLock};

use self::channel::{finish_recorder, Channel, ChannelShared, MicRecorder, ToneSource};
use self::recorder::WavRecorder;
use super::codes::*;
use super::{
    BaseControl, ChannelId, CodecControl, CodecInst, DeviceInfo, EngineObserver, Facet,
    FacetHandle, FileControl, HardwareControl, MediaEngine, NetworkControl, PacketTime,
    ProcessingControl, Status, Transport, VolumeControl,
};

const MONITOR_TICK: Duration = Duration::from_millis(50);

/// Loopback engine settings.
#[derive(Debug, Clone)]
pub struct LoopbackOptions {
    /// Silence after which a receiving channel reports a packet timeout
    pub receive_timeout: Duration,
    /// Frequency of the virtual microphone tone
    pub tone_hz: f32,
    /// Reported microphone volume (0-255), also scales the tone
    pub mic_volume: u32,
    /// Reported speaker volume (0-255)
    pub speaker_volume: u32,
}

impl Default for LoopbackOptions {
    fn default() -> Self {
        Self {
            receive_timeout: Duration::from_secs(5),
            tone_hz: 440.0,
            mic_volume: 200,
            speaker_volume: 200,
        }
    }
}

struct CoreState {
    inited: bool,
    next_channel: ChannelId,
    channels: BTreeMap<ChannelId, Channel>,
}

struct Monitor {
    running: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

type SharedObserver = Arc<RwLock<Option<Arc<dyn EngineObserver>>>>;

/// Engine state behind every facet handle.
struct EngineCore {
    options: LoopbackOptions,
    state: Arc<Mutex<CoreState>>,
    monitor: Mutex<Option<Monitor>>,
    observer: SharedObserver,
    last_error: AtomicI32,
    mic_volume: Arc<AtomicU32>,
    mic_recorder: MicRecorder,
    agc: AtomicBool,
    ec: AtomicBool,
    ns: AtomicBool,
    playout_device: AtomicUsize,
    recording_device: AtomicUsize,
}

/// Devices exposed by the engine: (name, guid).
const PLAYOUT_DEVICES: [(&str, &str); 1] = [("Loopback null speaker", "loopback-playout-0")];
const RECORDING_DEVICES: [(&str, &str); 1] = [("Loopback tone generator", "loopback-recording-0")];

impl EngineCore {
    fn new(options: LoopbackOptions) -> Self {
        Self {
            mic_volume: Arc::new(AtomicU32::new(options.mic_volume)),
            options,
            state: Arc::new(Mutex::new(CoreState {
                inited: false,
                next_channel: 0,
                channels: BTreeMap::new(),
            })),
            monitor: Mutex::new(None),
            observer: Arc::new(RwLock::new(None)),
            last_error: AtomicI32::new(0),
            mic_recorder: Arc::new(Mutex::new(None)),
            agc: AtomicBool::new(false),
            ec: AtomicBool::new(false),
            ns: AtomicBool::new(false),
            playout_device: AtomicUsize::new(0),
            recording_device: AtomicUsize::new(0),
        }
    }

    /// Map a result to a status, remembering the error code.
    fn status(&self, result: Result<(), i32>) -> Status {
        match result {
            Ok(()) => 0,
            Err(code) => {
                self.last_error.store(code, Ordering::Relaxed);
                -1
            }
        }
    }

    fn fail<T>(&self, code: i32) -> Result<T, Status> {
        self.last_error.store(code, Ordering::Relaxed);
        Err(-1)
    }

    fn require_init(&self) -> Result<(), i32> {
        if self.state.lock().inited {
            Ok(())
        } else {
            Err(VE_NOT_INITED)
        }
    }

    fn with_channel<R>(
        &self,
        channel: ChannelId,
        f: impl FnOnce(&mut Channel) -> Result<R, i32>,
    ) -> Result<R, i32> {
        let mut state = self.state.lock();
        if !state.inited {
            return Err(VE_NOT_INITED);
        }
        let channel = state
            .channels
            .get_mut(&channel)
            .ok_or(VE_CHANNEL_NOT_VALID)?;
        f(channel)
    }

    /// Channel state for the packet path, if the channel is receiving.
    fn receiving_channel(&self, channel: ChannelId) -> Result<Arc<ChannelShared>, i32> {
        let state = self.state.lock();
        let channel = state
            .channels
            .get(&channel)
            .ok_or(VE_CHANNEL_NOT_VALID)?;
        if !channel.shared().receiving.load(Ordering::Relaxed) {
            return Err(VE_INVALID_OPERATION);
        }
        Ok(channel.shared().clone())
    }

    fn start_monitor(&self) -> std::io::Result<()> {
        let mut monitor = self.monitor.lock();
        if monitor.is_some() {
            return Ok(());
        }

        let running = Arc::new(AtomicBool::new(true));
        let flag = running.clone();
        let state = self.state.clone();
        let observer = self.observer.clone();
        let timeout = self.options.receive_timeout;

        let handle = thread::Builder::new()
            .name("loopback-monitor".to_string())
            .spawn(move || monitor_loop(state, observer, flag, timeout))?;

        *monitor = Some(Monitor { running, handle });
        Ok(())
    }

    fn stop_monitor(&self) {
        let monitor = self.monitor.lock().take();
        if let Some(monitor) = monitor {
            monitor.running.store(false, Ordering::SeqCst);
            let _ = monitor.handle.join();
        }
    }

    fn stop_microphone_recording(&self) -> bool {
        let recorder = self.mic_recorder.lock().take();
        match recorder {
            Some(recorder) => {
                finish_recorder(recorder);
                true
            }
            None => false,
        }
    }

    fn shutdown(&self) {
        self.stop_monitor();
        // Channel drop stops workers and closes recordings
        let channels = {
            let mut state = self.state.lock();
            state.inited = false;
            std::mem::take(&mut state.channels)
        };
        let count = channels.len();
        drop(channels);
        self.stop_microphone_recording();
        if count > 0 {
            warn!("Engine terminated with {} live channels", count);
        }
    }
}

impl Drop for EngineCore {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn monitor_loop(
    state: Arc<Mutex<CoreState>>,
    observer: SharedObserver,
    running: Arc<AtomicBool>,
    timeout: Duration,
) {
    let mut events = Vec::new();

    while running.load(Ordering::SeqCst) {
        thread::sleep(MONITOR_TICK);

        let receiving: Vec<Arc<ChannelShared>> = state
            .lock()
            .channels
            .values()
            .map(|c| c.shared().clone())
            .filter(|c| c.receiving.load(Ordering::Relaxed))
            .collect();

        for channel in receiving {
            let idle = channel.last_rtp.lock().elapsed();
            if idle >= timeout {
                if !channel.timed_out.swap(true, Ordering::SeqCst) {
                    events.push((channel.id, VE_RECEIVE_PACKET_TIMEOUT));
                }
            } else if channel.timed_out.swap(false, Ordering::SeqCst) {
                events.push((channel.id, VE_PACKET_RECEIPT_RESTARTED));
            }
        }

        if events.is_empty() {
            continue;
        }
        // Notify without holding the engine lock
        let target = observer.read().clone();
        for (channel, code) in events.drain(..) {
            match &target {
                Some(observer) => observer.on_error(channel, code),
                None => debug!("Channel {} notification {} (no observer)", channel, code),
            }
        }
    }
}

impl BaseControl for EngineCore {
    fn init(&self) -> Status {
        {
            let mut state = self.state.lock();
            if state.inited {
                return 0;
            }
            state.inited = true;
        }
        if let Err(e) = self.start_monitor() {
            warn!("Could not start engine monitor: {}", e);
            self.state.lock().inited = false;
            return self.status(Err(VE_INVALID_OPERATION));
        }
        info!("Loopback engine initialized");
        0
    }

    fn terminate(&self) -> Status {
        self.shutdown();
        info!("Loopback engine terminated");
        0
    }

    fn version(&self) -> Result<String, Status> {
        Ok(format!(
            "voe-call loopback engine {} (PCMU, PCMA, L16 @ 8 kHz)",
            env!("CARGO_PKG_VERSION")
        ))
    }

    fn last_error(&self) -> i32 {
        self.last_error.load(Ordering::Relaxed)
    }

    fn register_observer(&self, observer: Arc<dyn EngineObserver>) -> Status {
        let mut slot = self.observer.write();
        if slot.is_some() {
            drop(slot);
            return self.status(Err(VE_INVALID_OPERATION));
        }
        *slot = Some(observer);
        0
    }

    fn deregister_observer(&self) -> Status {
        if self.observer.write().take().is_none() {
            debug!("No observer registered");
        }
        0
    }

    fn create_channel(&self) -> Result<ChannelId, Status> {
        let mut state = self.state.lock();
        if !state.inited {
            drop(state);
            return self.fail(VE_NOT_INITED);
        }
        let id = state.next_channel;
        state.next_channel += 1;
        state.channels.insert(id, Channel::new(id));
        debug!("Loopback channel {} created", id);
        Ok(id)
    }

    fn delete_channel(&self, channel: ChannelId) -> Status {
        let removed = {
            let mut state = self.state.lock();
            if !state.inited {
                Err(VE_NOT_INITED)
            } else {
                state.channels.remove(&channel).ok_or(VE_CHANNEL_NOT_VALID)
            }
        };
        // Dropped outside the lock; joins the channel's workers
        self.status(removed.map(drop))
    }

    fn start_receive(&self, channel: ChannelId) -> Status {
        self.status(self.with_channel(channel, |c| {
            c.start_receive();
            Ok(())
        }))
    }

    fn stop_receive(&self, channel: ChannelId) -> Status {
        self.status(self.with_channel(channel, |c| {
            c.stop_receive();
            Ok(())
        }))
    }

    fn start_playout(&self, channel: ChannelId) -> Status {
        self.status(self.with_channel(channel, |c| {
            c.start_playout().map_err(|e| {
                warn!("Could not start playout: {}", e);
                VE_INVALID_OPERATION
            })
        }))
    }

    fn stop_playout(&self, channel: ChannelId) -> Status {
        self.status(self.with_channel(channel, |c| {
            c.stop_playout();
            Ok(())
        }))
    }

    fn start_send(&self, channel: ChannelId) -> Status {
        let source = ToneSource::new(self.options.tone_hz, self.mic_volume.clone());
        let mic = self.mic_recorder.clone();
        self.status(self.with_channel(channel, |c| c.start_send(source, mic)))
    }

    fn stop_send(&self, channel: ChannelId) -> Status {
        self.status(self.with_channel(channel, |c| {
            c.stop_send();
            Ok(())
        }))
    }
}

impl CodecControl for EngineCore {
    fn num_of_codecs(&self) -> usize {
        codec::CODECS.len()
    }

    fn codec(&self, index: usize) -> Result<CodecInst, Status> {
        match codec::CODECS.get(index) {
            Some(entry) => Ok(entry.inst.clone()),
            None => self.fail(VE_INVALID_ARGUMENT),
        }
    }

    fn set_send_codec(&self, channel: ChannelId, inst: &CodecInst) -> Status {
        let Some(entry) = codec::find(inst) else {
            return self.status(Err(VE_INVALID_ARGUMENT));
        };
        self.status(self.with_channel(channel, |c| {
            *c.shared().send_codec.lock() = entry;
            Ok(())
        }))
    }

    fn set_vad_status(&self, channel: ChannelId, enable: bool) -> Status {
        self.status(self.with_channel(channel, |c| {
            c.shared().vad.store(enable, Ordering::Relaxed);
            Ok(())
        }))
    }
}

impl ProcessingControl for EngineCore {
    fn set_agc_status(&self, enable: bool) -> Status {
        let result = self.require_init();
        if result.is_ok() {
            self.agc.store(enable, Ordering::Relaxed);
        }
        self.status(result)
    }

    fn set_ec_status(&self, enable: bool) -> Status {
        let result = self.require_init();
        if result.is_ok() {
            self.ec.store(enable, Ordering::Relaxed);
        }
        self.status(result)
    }

    fn set_ns_status(&self, enable: bool) -> Status {
        let result = self.require_init();
        if result.is_ok() {
            self.ns.store(enable, Ordering::Relaxed);
        }
        self.status(result)
    }

    fn set_rx_agc_status(&self, channel: ChannelId, enable: bool) -> Status {
        self.status(self.with_channel(channel, |c| {
            c.shared().rx_agc.store(enable, Ordering::Relaxed);
            Ok(())
        }))
    }

    fn set_rx_ns_status(&self, channel: ChannelId, enable: bool) -> Status {
        self.status(self.with_channel(channel, |c| {
            c.shared().rx_ns.store(enable, Ordering::Relaxed);
            Ok(())
        }))
    }
}

impl VolumeControl for EngineCore {
    fn mic_volume(&self) -> Result<u32, Status> {
        Ok(self.mic_volume.load(Ordering::Relaxed))
    }

    fn speaker_volume(&self) -> Result<u32, Status> {
        Ok(self.options.speaker_volume)
    }
}

impl NetworkControl for EngineCore {
    fn register_external_transport(
        &self,
        channel: ChannelId,
        transport: Arc<dyn Transport>,
    ) -> Status {
        self.status(self.with_channel(channel, |c| {
            let mut slot = c.shared().transport.write();
            if slot.is_some() {
                return Err(VE_INVALID_OPERATION);
            }
            *slot = Some(transport);
            Ok(())
        }))
    }

    fn deregister_external_transport(&self, channel: ChannelId) -> Status {
        self.status(self.with_channel(channel, |c| {
            if c.shared().transport.write().take().is_none() {
                debug!("Channel {} had no external transport", channel);
            }
            Ok(())
        }))
    }

    fn received_rtp_packet(&self, channel: ChannelId, packet: &[u8], _time: PacketTime) -> Status {
        let result = self
            .receiving_channel(channel)
            .and_then(|shared| shared.ingest_rtp(packet));
        self.status(result)
    }

    fn received_rtcp_packet(&self, channel: ChannelId, packet: &[u8]) -> Status {
        let result = self
            .receiving_channel(channel)
            .and_then(|shared| shared.ingest_rtcp(packet));
        self.status(result)
    }
}

impl FileControl for EngineCore {
    fn start_recording_microphone(&self, path: &Path) -> Status {
        if let Err(code) = self.require_init() {
            return self.status(Err(code));
        }
        let recorder = match WavRecorder::create(path) {
            Ok(recorder) => recorder,
            Err(e) => {
                warn!("Cannot record microphone to {}: {}", path.display(), e);
                return self.status(Err(VE_BAD_FILE));
            }
        };
        let previous = self.mic_recorder.lock().replace(recorder);
        if let Some(previous) = previous {
            finish_recorder(previous);
        }
        0
    }

    fn stop_recording_microphone(&self) -> Status {
        if !self.stop_microphone_recording() {
            debug!("Microphone recording was not running");
        }
        0
    }

    fn start_recording_playout(&self, channel: ChannelId, path: &Path) -> Status {
        self.status(self.with_channel(channel, |c| {
            let recorder = WavRecorder::create(path).map_err(|e| {
                warn!("Cannot record playout to {}: {}", path.display(), e);
                VE_BAD_FILE
            })?;
            c.start_recording_playout(recorder);
            Ok(())
        }))
    }

    fn stop_recording_playout(&self, channel: ChannelId) -> Status {
        self.status(self.with_channel(channel, |c| {
            if !c.stop_recording_playout() {
                debug!("Channel {} playout recording was not running", channel);
            }
            Ok(())
        }))
    }
}

impl HardwareControl for EngineCore {
    fn num_of_playout_devices(&self) -> Result<usize, Status> {
        Ok(PLAYOUT_DEVICES.len())
    }

    fn num_of_recording_devices(&self) -> Result<usize, Status> {
        Ok(RECORDING_DEVICES.len())
    }

    fn playout_device_name(&self, index: usize) -> Result<DeviceInfo, Status> {
        match PLAYOUT_DEVICES.get(index) {
            Some((name, guid)) => Ok(DeviceInfo {
                name: name.to_string(),
                guid: guid.to_string(),
            }),
            None => self.fail(VE_INVALID_ARGUMENT),
        }
    }

    fn recording_device_name(&self, index: usize) -> Result<DeviceInfo, Status> {
        match RECORDING_DEVICES.get(index) {
            Some((name, guid)) => Ok(DeviceInfo {
                name: name.to_string(),
                guid: guid.to_string(),
            }),
            None => self.fail(VE_INVALID_ARGUMENT),
        }
    }

    fn set_playout_device(&self, index: usize) -> Status {
        if index >= PLAYOUT_DEVICES.len() {
            return self.status(Err(VE_INVALID_ARGUMENT));
        }
        self.playout_device.store(index, Ordering::Relaxed);
        0
    }

    fn set_recording_device(&self, index: usize) -> Status {
        if index >= RECORDING_DEVICES.len() {
            return self.status(Err(VE_INVALID_ARGUMENT));
        }
        self.recording_device.store(index, Ordering::Relaxed);
        0
    }
}

/// Engine-wide audio processing switches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessingSettings {
    pub agc: bool,
    pub ec: bool,
    pub ns: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelSettings {
    pub send_codec: CodecInst,
    pub vad: bool,
    pub rx_agc: bool,
    pub rx_ns: bool,
    pub sending: bool,
    /// SSRC from the latest sender report received, 0 if none
    pub remote_ssrc: u32,
}

/// Root of the loopback engine with per-facet reference counts.
pub struct LoopbackEngine {
    core: Arc<EngineCore>,
    refs: [AtomicI32; 7],
    deleted: AtomicBool,
}

impl Default for LoopbackEngine {
    fn default() -> Self {
        Self::new(LoopbackOptions::default())
    }
}

impl LoopbackEngine {
    pub fn new(options: LoopbackOptions) -> Self {
        Self {
            core: Arc::new(EngineCore::new(options)),
            refs: Default::default(),
            deleted: AtomicBool::new(false),
        }
    }

    /// References currently counted for `facet`.
    pub fn references(&self, facet: Facet) -> i32 {
        self.refs[facet.index()].load(Ordering::SeqCst)
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted.load(Ordering::SeqCst)
    }

    pub fn channel_count(&self) -> usize {
        self.core.state.lock().channels.len()
    }

    /// Selected (playout, recording) device indices.
    pub fn selected_devices(&self) -> (usize, usize) {
        (
            self.core.playout_device.load(Ordering::Relaxed),
            self.core.recording_device.load(Ordering::Relaxed),
        )
    }

    pub fn processing(&self) -> ProcessingSettings {
        ProcessingSettings {
            agc: self.core.agc.load(Ordering::Relaxed),
            ec: self.core.ec.load(Ordering::Relaxed),
            ns: self.core.ns.load(Ordering::Relaxed),
        }
    }

    /// Send codec and per-channel switches of a live channel.
    pub fn channel_settings(&self, channel: ChannelId) -> Option<ChannelSettings> {
        self.core.state.lock().channels.get(&channel).map(|c| {
            let shared = c.shared();
            ChannelSettings {
                send_codec: shared.send_codec.lock().inst.clone(),
                vad: shared.vad.load(Ordering::Relaxed),
                rx_agc: shared.rx_agc.load(Ordering::Relaxed),
                rx_ns: shared.rx_ns.load(Ordering::Relaxed),
                sending: shared.sending.load(Ordering::Relaxed),
                remote_ssrc: shared.remote_ssrc.load(Ordering::Relaxed),
            }
        })
    }

    pub fn channel_stats(&self, channel: ChannelId) -> Option<ChannelStatsSnapshot> {
        self.core
            .state
            .lock()
            .channels
            .get(&channel)
            .map(|c| ChannelStatsSnapshot {
                buffered_samples: c.shared().buffered_samples() as u64,
                ..c.shared().stats.snapshot()
            })
    }
}

impl MediaEngine for LoopbackEngine {
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
        let count = &self.refs[facet.index()];
        match count.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| (n > 0).then(|| n - 1)) {
            Ok(previous) => previous - 1,
            Err(_) => {
                warn!("{} facet released more often than acquired", facet);
                0
            }
        }
    }

    fn delete(&self) -> bool {
        if self.deleted.swap(true, Ordering::SeqCst) {
            return false;
        }
        for facet in Facet::ALL {
            let held = self.references(facet);
            if held != 0 {
                warn!("Engine deleted with {} {} facet references held", held, facet);
            }
        }
        self.core.shutdown();
        true
    }
}
