//! One loopback call channel.
//!
//! Send path: a worker wakes every 20 ms, takes a packet of samples from the
//! tone generator (the virtual microphone), encodes it with the send codec
//! and hands RTP to the registered external transport. Every 5 s it also
//! sends an RTCP sender report.
//!
//! Receive path: RTP arriving through the network facet is parsed and
//! decoded into a ring buffer while playout runs. The playout worker drains
//! 10 ms frames on a fixed schedule into the null playout device (and the
//! playout recording, if one is open), padding underruns with silence.

use std::f32::consts::TAU;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use log::{debug, trace, warn};
use parking_lot::{Mutex, RwLock};
use ringbuf::{
    traits::{Consumer, Observer, Producer, Split},
    HeapRb,
};

use super::codec::{self, CodecEntry, PACKET_SAMPLES, PLAYOUT_FRAME_SAMPLES, SAMPLE_RATE};
use super::recorder::WavRecorder;
use crate::engine::codes::{VE_DESTINATION_NOT_INITED, VE_INVALID_ARGUMENT, VE_INVALID_OPERATION};
use crate::engine::{ChannelId, Transport};
use crate::rtp::{rtcp, RtpPacket, RtpPacketBuilder};

const PACKET_INTERVAL: Duration = Duration::from_millis(20);
const PLAYOUT_INTERVAL: Duration = Duration::from_millis(10);
const SENDER_REPORT_INTERVAL: Duration = Duration::from_secs(5);

/// Peak below which VAD treats a frame as silence.
const SILENCE_LEVEL: u16 = 32;

/// Jitter queue depth: one second of audio.
const JITTER_CAPACITY: usize = SAMPLE_RATE as usize;

/// Shared recording slot for microphone audio.
pub(super) type MicRecorder = Arc<Mutex<Option<WavRecorder>>>;

/// Per-channel counters.
#[derive(Default)]
pub struct ChannelStats {
    pub rtp_received: AtomicU64,
    pub rtcp_received: AtomicU64,
    pub decode_errors: AtomicU64,
    pub samples_dropped: AtomicU64,
    pub packets_sent: AtomicU64,
    pub octets_sent: AtomicU64,
    pub send_errors: AtomicU64,
    pub underruns: AtomicU64,
}

impl ChannelStats {
    pub fn snapshot(&self) -> ChannelStatsSnapshot {
        ChannelStatsSnapshot {
            rtp_received: self.rtp_received.load(Ordering::Relaxed),
            rtcp_received: self.rtcp_received.load(Ordering::Relaxed),
            decode_errors: self.decode_errors.load(Ordering::Relaxed),
            samples_dropped: self.samples_dropped.load(Ordering::Relaxed),
            packets_sent: self.packets_sent.load(Ordering::Relaxed),
            octets_sent: self.octets_sent.load(Ordering::Relaxed),
            send_errors: self.send_errors.load(Ordering::Relaxed),
            underruns: self.underruns.load(Ordering::Relaxed),
            buffered_samples: 0,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChannelStatsSnapshot {
    pub rtp_received: u64,
    pub rtcp_received: u64,
    pub decode_errors: u64,
    pub samples_dropped: u64,
    pub packets_sent: u64,
    pub octets_sent: u64,
    pub send_errors: u64,
    pub underruns: u64,
    /// Decoded samples waiting for playout
    pub buffered_samples: u64,
}

/// Virtual microphone: a sine tone scaled by the mic volume.
pub(super) struct ToneSource {
    step: f32,
    phase: f32,
    volume: Arc<AtomicU32>,
}

impl ToneSource {
    pub fn new(tone_hz: f32, volume: Arc<AtomicU32>) -> Self {
        Self {
            step: TAU * tone_hz / SAMPLE_RATE as f32,
            phase: 0.0,
            volume,
        }
    }

    pub fn fill(&mut self, out: &mut [i16]) {
        let gain = self.volume.load(Ordering::Relaxed).min(255) as f32 / 255.0;
        let amplitude = 8000.0 * gain;
        for sample in out.iter_mut() {
            *sample = (self.phase.sin() * amplitude) as i16;
            self.phase = (self.phase + self.step) % TAU;
        }
    }
}

/// State shared between the engine facets and the channel's workers.
pub(super) struct ChannelShared {
    pub id: ChannelId,
    pub ssrc: u32,
    pub transport: RwLock<Option<Arc<dyn Transport>>>,
    pub send_codec: Mutex<&'static CodecEntry>,
    pub vad: AtomicBool,
    pub rx_agc: AtomicBool,
    pub rx_ns: AtomicBool,
    pub receiving: AtomicBool,
    pub playing: AtomicBool,
    pub sending: AtomicBool,
    /// Arrival of the latest RTP packet, or the receive start
    pub last_rtp: Mutex<Instant>,
    /// Set by the monitor while no RTP is arriving
    pub timed_out: AtomicBool,
    pub remote_ssrc: AtomicU32,
    pub stats: ChannelStats,
    producer: Mutex<ringbuf::HeapProd<i16>>,
    consumer: Mutex<ringbuf::HeapCons<i16>>,
    playout_recorder: Mutex<Option<WavRecorder>>,
}

impl ChannelShared {
    /// Parse, decode and queue one RTP packet.
    pub fn ingest_rtp(&self, packet: &[u8]) -> Result<(), i32> {
        let Some(rtp) = RtpPacket::parse(packet) else {
            self.stats.decode_errors.fetch_add(1, Ordering::Relaxed);
            return Err(VE_INVALID_ARGUMENT);
        };

        *self.last_rtp.lock() = Instant::now();
        self.stats.rtp_received.fetch_add(1, Ordering::Relaxed);

        if !self.playing.load(Ordering::Relaxed) {
            return Ok(());
        }

        let Some(entry) = codec::by_payload_type(rtp.header.payload_type) else {
            trace!(
                "Channel {} dropping unknown payload type {}",
                self.id,
                rtp.header.payload_type
            );
            self.stats.decode_errors.fetch_add(1, Ordering::Relaxed);
            return Ok(());
        };

        let mut samples = Vec::with_capacity(rtp.payload.len());
        entry.coding.decode(rtp.payload, &mut samples);

        let mut producer = self.producer.lock();
        if producer.vacant_len() >= samples.len() {
            producer.push_slice(&samples);
        } else {
            self.stats
                .samples_dropped
                .fetch_add(samples.len() as u64, Ordering::Relaxed);
        }
        Ok(())
    }

    pub fn ingest_rtcp(&self, packet: &[u8]) -> Result<(), i32> {
        let Some(ssrc) = rtcp::sender_ssrc(packet) else {
            return Err(VE_INVALID_ARGUMENT);
        };
        self.stats.rtcp_received.fetch_add(1, Ordering::Relaxed);
        if rtcp::packet_type(packet) == Some(rtcp::RTCP_SR) {
            self.remote_ssrc.store(ssrc, Ordering::Relaxed);
        }
        Ok(())
    }

    pub fn buffered_samples(&self) -> usize {
        self.consumer.lock().occupied_len()
    }

    fn clear_jitter_queue(&self) {
        self.consumer.lock().clear();
    }
}

struct Worker {
    running: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

impl Worker {
    fn stop(self) {
        self.running.store(false, Ordering::SeqCst);
        let _ = self.handle.join();
    }
}

/// A channel owned by the engine.
pub(super) struct Channel {
    shared: Arc<ChannelShared>,
    send_worker: Option<Worker>,
    playout_worker: Option<Worker>,
}

impl Channel {
    pub fn new(id: ChannelId) -> Self {
        let (producer, consumer) = HeapRb::<i16>::new(JITTER_CAPACITY).split();
        let seed = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.subsec_nanos())
            .unwrap_or(0);

        let shared = ChannelShared {
            id,
            ssrc: seed ^ (id as u32).wrapping_mul(0x9E37_79B9),
            transport: RwLock::new(None),
            send_codec: Mutex::new(&codec::CODECS[0]),
            vad: AtomicBool::new(false),
            rx_agc: AtomicBool::new(false),
            rx_ns: AtomicBool::new(false),
            receiving: AtomicBool::new(false),
            playing: AtomicBool::new(false),
            sending: AtomicBool::new(false),
            last_rtp: Mutex::new(Instant::now()),
            timed_out: AtomicBool::new(false),
            remote_ssrc: AtomicU32::new(0),
            stats: ChannelStats::default(),
            producer: Mutex::new(producer),
            consumer: Mutex::new(consumer),
            playout_recorder: Mutex::new(None),
        };

        Self {
            shared: Arc::new(shared),
            send_worker: None,
            playout_worker: None,
        }
    }

    pub fn shared(&self) -> &Arc<ChannelShared> {
        &self.shared
    }

    pub fn start_receive(&mut self) {
        if !self.shared.receiving.swap(true, Ordering::SeqCst) {
            *self.shared.last_rtp.lock() = Instant::now();
            self.shared.timed_out.store(false, Ordering::SeqCst);
            debug!("Channel {} receiving", self.shared.id);
        }
    }

    pub fn stop_receive(&mut self) {
        self.shared.receiving.store(false, Ordering::SeqCst);
        self.shared.timed_out.store(false, Ordering::SeqCst);
    }

    pub fn start_playout(&mut self) -> std::io::Result<()> {
        if self.playout_worker.is_some() {
            return Ok(());
        }
        self.shared.playing.store(true, Ordering::SeqCst);

        let running = Arc::new(AtomicBool::new(true));
        let shared = self.shared.clone();
        let flag = running.clone();
        let spawned = thread::Builder::new()
            .name(format!("loopback-playout-{}", self.shared.id))
            .spawn(move || playout_loop(shared, flag));

        match spawned {
            Ok(handle) => {
                self.playout_worker = Some(Worker { running, handle });
                Ok(())
            }
            Err(e) => {
                self.shared.playing.store(false, Ordering::SeqCst);
                Err(e)
            }
        }
    }

    pub fn stop_playout(&mut self) {
        self.shared.playing.store(false, Ordering::SeqCst);
        if let Some(worker) = self.playout_worker.take() {
            worker.stop();
        }
        self.shared.clear_jitter_queue();
    }

    /// Start the send worker. Fails without a registered transport.
    pub fn start_send(&mut self, source: ToneSource, mic: MicRecorder) -> Result<(), i32> {
        if self.send_worker.is_some() {
            return Ok(());
        }
        if self.shared.transport.read().is_none() {
            return Err(VE_DESTINATION_NOT_INITED);
        }
        self.shared.sending.store(true, Ordering::SeqCst);

        let running = Arc::new(AtomicBool::new(true));
        let shared = self.shared.clone();
        let flag = running.clone();
        let spawned = thread::Builder::new()
            .name(format!("loopback-send-{}", self.shared.id))
            .spawn(move || send_loop(shared, flag, source, mic));

        match spawned {
            Ok(handle) => {
                self.send_worker = Some(Worker { running, handle });
                Ok(())
            }
            Err(e) => {
                warn!("Could not start send worker: {}", e);
                self.shared.sending.store(false, Ordering::SeqCst);
                Err(VE_INVALID_OPERATION)
            }
        }
    }

    pub fn stop_send(&mut self) {
        self.shared.sending.store(false, Ordering::SeqCst);
        if let Some(worker) = self.send_worker.take() {
            worker.stop();
        }
    }

    pub fn start_recording_playout(&mut self, recorder: WavRecorder) {
        let previous = self.shared.playout_recorder.lock().replace(recorder);
        if let Some(previous) = previous {
            finish_recorder(previous);
        }
    }

    /// Returns false if no playout recording was running.
    pub fn stop_recording_playout(&mut self) -> bool {
        match self.shared.playout_recorder.lock().take() {
            Some(recorder) => {
                finish_recorder(recorder);
                true
            }
            None => false,
        }
    }

    /// Stop every activity and close the playout recording.
    pub fn shutdown(&mut self) {
        self.stop_send();
        self.stop_playout();
        self.stop_receive();
        self.stop_recording_playout();
        self.shared.transport.write().take();
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        self.shutdown();
    }
}

pub(super) fn finish_recorder(recorder: WavRecorder) {
    let path = recorder.path().to_path_buf();
    if let Err(e) = recorder.finish() {
        warn!("Could not finalize recording {}: {}", path.display(), e);
    }
}

fn send_loop(
    shared: Arc<ChannelShared>,
    running: Arc<AtomicBool>,
    mut source: ToneSource,
    mic: MicRecorder,
) {
    let mut builder = RtpPacketBuilder::new(shared.ssrc, shared.send_codec.lock().inst.pltype);
    let mut pcm = [0i16; PACKET_SAMPLES];
    let mut payload = Vec::with_capacity(PACKET_SAMPLES * 2);
    let mut next = Instant::now();
    let mut last_report = Instant::now();
    let mut first = true;

    while running.load(Ordering::SeqCst) {
        next += PACKET_INTERVAL;
        let now = Instant::now();
        if next > now {
            thread::sleep(next - now);
        } else if now - next > PACKET_INTERVAL * 5 {
            // Fell far behind (suspended); resynchronise
            next = now;
        }

        source.fill(&mut pcm);
        if let Some(recorder) = mic.lock().as_mut() {
            if let Err(e) = recorder.write(&pcm) {
                warn!("Microphone recording failed: {}", e);
            }
        }

        // Discontinuous transmission: nothing is sent for silent frames
        if shared.vad.load(Ordering::Relaxed) && pcm.iter().all(|s| s.unsigned_abs() < SILENCE_LEVEL) {
            builder.advance_timestamp(PACKET_SAMPLES as u32);
            first = true;
            continue;
        }

        let entry = *shared.send_codec.lock();
        builder.set_payload_type(entry.inst.pltype);
        payload.clear();
        entry.coding.encode(&pcm, &mut payload);

        let transport = shared.transport.read().clone();
        let Some(transport) = transport else {
            continue;
        };

        let packet = builder.build_packet(&payload, PACKET_SAMPLES as u32, first);
        first = false;
        match transport.send_rtp(shared.id, packet) {
            Ok(_) => {
                shared.stats.packets_sent.fetch_add(1, Ordering::Relaxed);
                shared
                    .stats
                    .octets_sent
                    .fetch_add(payload.len() as u64, Ordering::Relaxed);
            }
            Err(e) => {
                shared.stats.send_errors.fetch_add(1, Ordering::Relaxed);
                trace!("Channel {} RTP send failed: {}", shared.id, e);
            }
        }

        if last_report.elapsed() >= SENDER_REPORT_INTERVAL {
            last_report = Instant::now();
            let report = rtcp::sender_report(
                shared.ssrc,
                builder.timestamp(),
                shared.stats.packets_sent.load(Ordering::Relaxed) as u32,
                shared.stats.octets_sent.load(Ordering::Relaxed) as u32,
            );
            if let Err(e) = transport.send_rtcp(shared.id, &report) {
                trace!("Channel {} RTCP send failed: {}", shared.id, e);
            }
        }
    }
}

fn playout_loop(shared: Arc<ChannelShared>, running: Arc<AtomicBool>) {
    let mut frame = [0i16; PLAYOUT_FRAME_SAMPLES];
    let mut next = Instant::now();

    while running.load(Ordering::SeqCst) {
        next += PLAYOUT_INTERVAL;
        let now = Instant::now();
        if next > now {
            thread::sleep(next - now);
        } else if now - next > PLAYOUT_INTERVAL * 5 {
            next = now;
        }

        let read = shared.consumer.lock().pop_slice(&mut frame);
        if read < frame.len() {
            frame[read..].fill(0);
            if shared.receiving.load(Ordering::Relaxed) {
                shared.stats.underruns.fetch_add(1, Ordering::Relaxed);
            }
        }

        if let Some(recorder) = shared.playout_recorder.lock().as_mut() {
            if let Err(e) = recorder.write(&frame) {
                warn!("Playout recording failed: {}", e);
            }
        }
    }
}
