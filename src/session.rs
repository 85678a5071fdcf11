//! Call session lifecycle.
//!
//! A [`CallSession`] owns the engine instance, the facet registry, the
//! error observer and the packet relay of one call, and walks them through
//! a fixed sequence of states:
//!
//! ```text
//! Uninitialized ─init─► Initialized ─create_channel─► ChannelCreated
//!   ─bind_transport─► TransportBound ─configure─► Configured ─start─► Active
//!   ─stop─► Stopping ─► TornDown ─teardown─► Terminated
//! ```
//!
//! Forward steps abort on the first non-zero status and leave the session
//! where it was. [`CallSession::teardown`] may be called from any state; it
//! runs every release step even when earlier ones fail, and reports the
//! failures together.

use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info, warn};
use parking_lot::{Condvar, Mutex};

use crate::config::{MediaSelection, SessionConfig};
use crate::engine::{ChannelId, CodecInst, DeviceInfo, EngineInstance, EngineObserver, Facet};
use crate::error::{check, Step, StepFailure, VoeError};
use crate::observer::ErrorObserver;
use crate::registry::SubsystemRegistry;
use crate::relay::{PacketRelay, RelayStatsSnapshot};
use crate::transport::SocketTransport;

/// Lifecycle state of a [`CallSession`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    Uninitialized,
    Initialized,
    ChannelCreated,
    TransportBound,
    Configured,
    Active,
    Stopping,
    TornDown,
    Terminated,
}

/// Builds the socket layer for a channel's relay.
pub type TransportFactory = Arc<dyn Fn(ChannelId) -> Arc<dyn SocketTransport> + Send + Sync>;

/// Clonable stop trigger shared between the control thread and whatever
/// observes the operator (stdin, Ctrl+C).
#[derive(Clone, Default)]
pub struct StopSignal {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self) {
        let (flag, cvar) = &*self.inner;
        *flag.lock() = true;
        cvar.notify_all();
    }

    pub fn is_triggered(&self) -> bool {
        *self.inner.0.lock()
    }

    /// Block until triggered.
    pub fn wait(&self) {
        let (flag, cvar) = &*self.inner;
        let mut triggered = flag.lock();
        while !*triggered {
            cvar.wait(&mut triggered);
        }
    }

    /// Block until triggered or `timeout` elapses; returns whether triggered.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let (flag, cvar) = &*self.inner;
        let mut triggered = flag.lock();
        if !*triggered {
            cvar.wait_for(&mut triggered, timeout);
        }
        *triggered
    }
}

/// Codec and device listings.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceLists {
    pub playout: Vec<DeviceInfo>,
    pub recording: Vec<DeviceInfo>,
}

/// Outcome of a clean teardown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TeardownReport {
    /// Facet references still counted by the engine after release.
    /// Non-zero points at a leak elsewhere.
    pub remaining_references: i32,
}

/// One voice call on one channel.
pub struct CallSession {
    config: SessionConfig,
    engine: Option<EngineInstance>,
    registry: SubsystemRegistry,
    observer: Arc<ErrorObserver>,
    transport_factory: Option<TransportFactory>,
    state: SessionState,
    version: Option<String>,
    send_codec: Option<CodecInst>,
    channel: Option<ChannelId>,
    relay: Option<PacketRelay>,
    inited: bool,
    observer_registered: bool,
    receiving: bool,
    playing: bool,
    sending: bool,
    recording_microphone: bool,
    recording_playout: bool,
}

impl CallSession {
    /// Session over `engine` using UDP sockets for the relay.
    pub fn new(engine: EngineInstance, config: SessionConfig) -> Self {
        let registry = SubsystemRegistry::new(&engine);
        Self {
            config,
            engine: Some(engine),
            registry,
            observer: Arc::new(ErrorObserver::new()),
            transport_factory: None,
            state: SessionState::Uninitialized,
            version: None,
            send_codec: None,
            channel: None,
            relay: None,
            inited: false,
            observer_registered: false,
            receiving: false,
            playing: false,
            sending: false,
            recording_microphone: false,
            recording_playout: false,
        }
    }

    /// Session whose relay runs over sockets built by `factory`.
    pub fn with_transport_factory(
        engine: EngineInstance,
        config: SessionConfig,
        factory: TransportFactory,
    ) -> Self {
        let mut session = Self::new(engine, config);
        session.transport_factory = Some(factory);
        session
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn channel(&self) -> Option<ChannelId> {
        self.channel
    }

    /// Engine version string, known once the channel is created.
    pub fn version(&self) -> Option<&str> {
        self.version.as_deref()
    }

    pub fn send_codec(&self) -> Option<&CodecInst> {
        self.send_codec.as_ref()
    }

    pub fn observer(&self) -> &Arc<ErrorObserver> {
        &self.observer
    }

    pub fn relay_stats(&self) -> Option<RelayStatsSnapshot> {
        self.relay.as_ref().map(|r| r.stats())
    }

    fn require(&self, operation: &'static str, allowed: &[SessionState]) -> Result<(), VoeError> {
        if allowed.contains(&self.state) {
            Ok(())
        } else {
            Err(VoeError::InvalidState {
                operation,
                state: self.state,
            })
        }
    }

    fn live_channel(&self, operation: &'static str) -> Result<ChannelId, VoeError> {
        self.channel.ok_or(VoeError::InvalidState {
            operation,
            state: self.state,
        })
    }

    /// Add the engine's last error code to a failed engine call.
    fn annotate<T>(&mut self, result: Result<T, VoeError>) -> Result<T, VoeError> {
        match result {
            Err(e @ VoeError::FacetCallFailed { .. }) if self.registry.held(Facet::Base) > 0 => {
                let engine_code = self.registry.base().map(|base| base.last_error()).unwrap_or(0);
                Err(e.with_last_error(engine_code))
            }
            other => other,
        }
    }

    fn transition(&mut self, next: SessionState) {
        debug!("Session {:?} -> {:?}", self.state, next);
        self.state = next;
    }

    /// Acquire every facet and initialise the engine.
    pub fn init(&mut self) -> Result<(), VoeError> {
        let result = self.init_steps();
        self.annotate(result)
    }

    fn init_steps(&mut self) -> Result<(), VoeError> {
        self.require("init", &[SessionState::Uninitialized])?;

        self.registry.acquire_all()?;
        let base = self.registry.base()?;
        check(Step::Init, base.init())?;
        self.inited = true;

        info!("Engine initialized");
        self.transition(SessionState::Initialized);
        Ok(())
    }

    /// Register the error observer and create the call's channel.
    pub fn create_channel(&mut self) -> Result<ChannelId, VoeError> {
        let result = self.create_channel_steps();
        self.annotate(result)
    }

    fn create_channel_steps(&mut self) -> Result<ChannelId, VoeError> {
        self.require("create_channel", &[SessionState::Initialized])?;
        let base = self.registry.base()?;

        let observer = self.observer.clone() as Arc<dyn EngineObserver>;
        check(Step::RegisterObserver, base.register_observer(observer))?;
        self.observer_registered = true;

        match base.version() {
            Ok(version) => {
                info!("Engine version: {}", version);
                self.version = Some(version);
            }
            Err(code) => warn!("{} failed with status {}", Step::GetVersion, code),
        }

        let channel = base
            .create_channel()
            .map_err(|code| VoeError::FacetCallFailed {
                step: Step::CreateChannel,
                code,
                last_error: None,
            })?;
        self.channel = Some(channel);

        info!("Channel {} created", channel);
        self.transition(SessionState::ChannelCreated);
        Ok(channel)
    }

    /// Create the packet relay for the channel and set its addresses.
    pub fn bind_transport(&mut self) -> Result<(), VoeError> {
        self.require("bind_transport", &[SessionState::ChannelCreated])?;
        let channel = self.live_channel("bind_transport")?;
        let network = self.registry.network()?;

        let relay = match &self.transport_factory {
            Some(factory) => PacketRelay::with_transport(network, channel, factory(channel))?,
            None => PacketRelay::create(network, channel, self.config.socket_threads)?,
        };
        // Owned before the addresses are set so teardown always destroys it
        let relay = self
            .relay
            .insert(relay.with_receive_buffers(self.config.receive_buffers));

        relay.set_send_destination(&self.config.remote_ip, self.config.remote_port)?;
        relay.set_local_receiver(self.config.local_port)?;

        self.transition(SessionState::TransportBound);
        Ok(())
    }

    /// Set codec, devices and audio processing for the channel.
    pub fn configure(&mut self, selection: &MediaSelection) -> Result<(), VoeError> {
        let result = self.configure_steps(selection);
        self.annotate(result)
    }

    fn configure_steps(&mut self, selection: &MediaSelection) -> Result<(), VoeError> {
        self.require("configure", &[SessionState::TransportBound])?;
        let channel = self.live_channel("configure")?;
        let codecs = self.registry.codec()?;
        let hardware = self.registry.hardware()?;
        let processing = self.registry.processing()?;
        let settings = self.config.processing.clone();

        let codec = codecs
            .codec(selection.codec_index)
            .map_err(|code| VoeError::FacetCallFailed {
                step: Step::GetCodec,
                code,
                last_error: None,
            })?;
        check(Step::SetSendCodec, codecs.set_send_codec(channel, &codec))?;
        info!("Send codec: {}", codec);
        self.send_codec = Some(codec);

        check(
            Step::SetPlayoutDevice,
            hardware.set_playout_device(selection.playout_device),
        )?;
        check(
            Step::SetRecordingDevice,
            hardware.set_recording_device(selection.recording_device),
        )?;

        check(Step::SetVadStatus, codecs.set_vad_status(channel, settings.vad))?;
        check(Step::SetAgcStatus, processing.set_agc_status(settings.agc))?;
        check(Step::SetEcStatus, processing.set_ec_status(settings.ec))?;
        check(Step::SetNsStatus, processing.set_ns_status(settings.ns))?;
        check(
            Step::SetRxAgcStatus,
            processing.set_rx_agc_status(channel, settings.rx_agc),
        )?;
        check(
            Step::SetRxNsStatus,
            processing.set_rx_ns_status(channel, settings.rx_ns),
        )?;

        self.transition(SessionState::Configured);
        Ok(())
    }

    /// Start receive, playout and send, in that order.
    pub fn start(&mut self) -> Result<(), VoeError> {
        let result = self.start_steps();
        self.annotate(result)
    }

    fn start_steps(&mut self) -> Result<(), VoeError> {
        self.require("start", &[SessionState::Configured])?;
        let channel = self.live_channel("start")?;
        let base = self.registry.base()?;

        check(Step::StartReceive, base.start_receive(channel))?;
        self.receiving = true;
        check(Step::StartPlayout, base.start_playout(channel))?;
        self.playing = true;
        check(Step::StartSend, base.start_send(channel))?;
        self.sending = true;

        info!("Channel {} active", channel);
        self.transition(SessionState::Active);
        Ok(())
    }

    /// Record microphone and playout audio to the configured files.
    pub fn start_recording(&mut self) -> Result<(), VoeError> {
        let result = self.start_recording_steps();
        self.annotate(result)
    }

    fn start_recording_steps(&mut self) -> Result<(), VoeError> {
        self.require(
            "start_recording",
            &[SessionState::Configured, SessionState::Active],
        )?;
        let channel = self.live_channel("start_recording")?;
        let file = self.registry.file()?;
        let recording = self.config.recording.clone();

        if !self.recording_microphone {
            check(
                Step::StartRecordingMicrophone,
                file.start_recording_microphone(&recording.microphone),
            )?;
            self.recording_microphone = true;
        }
        if !self.recording_playout {
            check(
                Step::StartRecordingPlayout,
                file.start_recording_playout(channel, &recording.playout),
            )?;
            self.recording_playout = true;
        }

        info!(
            "Recording to {} and {}",
            recording.microphone.display(),
            recording.playout.display()
        );
        Ok(())
    }

    /// Stop any active recording.
    pub fn stop_recording(&mut self) -> Result<(), VoeError> {
        let mut failures = Vec::new();
        self.stop_recording_into(&mut failures);
        into_result(failures)
    }

    /// Microphone volume (0-255). Values outside 1-255 are logged as suspect.
    pub fn mic_volume(&mut self) -> Result<u32, VoeError> {
        let volume = self
            .registry
            .volume()?
            .mic_volume()
            .map_err(|code| VoeError::FacetCallFailed {
                step: Step::GetMicVolume,
                code,
                last_error: None,
            })?;
        if !(1..=255).contains(&volume) {
            warn!("Mic volume {} is outside 1-255", volume);
        }
        Ok(volume)
    }

    /// Every codec the engine supports, in index order.
    pub fn codecs(&mut self) -> Result<Vec<CodecInst>, VoeError> {
        let codecs = self.registry.codec()?;
        (0..codecs.num_of_codecs())
            .map(|i| {
                codecs.codec(i).map_err(|code| VoeError::FacetCallFailed {
                    step: Step::GetCodec,
                    code,
                    last_error: None,
                })
            })
            .collect()
    }

    /// Playout and recording devices.
    pub fn devices(&mut self) -> Result<DeviceLists, VoeError> {
        let hardware = self.registry.hardware()?;
        let failed = |step| move |code| VoeError::FacetCallFailed {
            step,
            code,
            last_error: None,
        };

        let playout_count = hardware
            .num_of_playout_devices()
            .map_err(failed(Step::NumPlayoutDevices))?;
        let recording_count = hardware
            .num_of_recording_devices()
            .map_err(failed(Step::NumRecordingDevices))?;

        let playout = (0..playout_count)
            .map(|i| {
                hardware
                    .playout_device_name(i)
                    .map_err(failed(Step::PlayoutDeviceName))
            })
            .collect::<Result<Vec<_>, _>>()?;
        let recording = (0..recording_count)
            .map(|i| {
                hardware
                    .recording_device_name(i)
                    .map_err(failed(Step::RecordingDeviceName))
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(DeviceLists { playout, recording })
    }

    /// Stop recording, then send, playout and receive (reverse start order).
    ///
    /// Every stop is attempted; failures are reported together.
    pub fn stop(&mut self) -> Result<(), VoeError> {
        self.require("stop", &[SessionState::Active])?;
        self.transition(SessionState::Stopping);

        let mut failures = Vec::new();
        self.stop_recording_into(&mut failures);
        self.stop_media_into(&mut failures);

        self.transition(SessionState::TornDown);
        into_result(failures)
    }

    /// Release everything the session holds, from whatever state it reached.
    ///
    /// Order: recording, send/playout/receive, relay, channel, observer,
    /// engine terminate, facet handles, engine instance. Every step is
    /// attempted; failures are aggregated into
    /// [`VoeError::TeardownPartialFailure`].
    pub fn teardown(&mut self) -> Result<TeardownReport, VoeError> {
        if self.state == SessionState::Terminated {
            return Err(VoeError::InvalidState {
                operation: "teardown",
                state: self.state,
            });
        }
        if self.state == SessionState::Active {
            self.transition(SessionState::Stopping);
        }

        let mut failures = Vec::new();
        self.stop_recording_into(&mut failures);
        self.stop_media_into(&mut failures);
        if self.state == SessionState::Stopping {
            self.transition(SessionState::TornDown);
        }

        if let Some(mut relay) = self.relay.take() {
            if let Err(e) = relay.destroy() {
                failures.push(StepFailure {
                    step: Step::DeregisterTransport,
                    code: e.status().unwrap_or(-1),
                });
            }
        }

        let base = self.registry.base().ok();

        if let Some(channel) = self.channel.take() {
            match &base {
                Some(base) => {
                    record(&mut failures, Step::DeleteChannel, base.delete_channel(channel));
                    info!("Channel {} deleted", channel);
                }
                None => failures.push(StepFailure {
                    step: Step::DeleteChannel,
                    code: -1,
                }),
            }
        }

        if let Some(base) = &base {
            if self.observer_registered {
                record(&mut failures, Step::DeregisterObserver, base.deregister_observer());
            }
            if self.inited {
                record(&mut failures, Step::Terminate, base.terminate());
            }
        }
        self.observer_registered = false;
        self.inited = false;
        drop(base);

        let remaining_references = self.registry.release_all();

        if let Some(engine) = self.engine.take() {
            if !engine.delete() {
                failures.push(StepFailure {
                    step: Step::DeleteEngine,
                    code: -1,
                });
            }
        }

        self.transition(SessionState::Terminated);

        if failures.is_empty() {
            info!("Session torn down");
            Ok(TeardownReport {
                remaining_references,
            })
        } else {
            for failure in &failures {
                error!("Teardown step failed: {}", failure);
            }
            Err(VoeError::TeardownPartialFailure { steps: failures })
        }
    }

    /// Bring the call up to Active and start recording if configured.
    pub fn bring_up(&mut self, selection: &MediaSelection) -> Result<(), VoeError> {
        self.init()?;
        self.create_channel()?;
        self.bind_transport()?;
        self.configure(selection)?;
        self.start()?;
        if self.config.recording.enabled {
            self.start_recording()?;
        }
        Ok(())
    }

    /// Run a whole call: bring it up, wait for `stop`, tear it down.
    ///
    /// Teardown runs even when bring-up fails; the bring-up error is
    /// returned in preference to a teardown error.
    pub fn run(
        &mut self,
        selection: &MediaSelection,
        stop: &StopSignal,
    ) -> Result<TeardownReport, VoeError> {
        let forward = self.bring_up(selection);
        match &forward {
            Ok(()) => stop.wait(),
            Err(e) => error!("Call setup failed: {}", e),
        }

        let torn_down = self.teardown();
        forward?;
        torn_down
    }

    fn stop_recording_into(&mut self, failures: &mut Vec<StepFailure>) {
        if !self.recording_microphone && !self.recording_playout {
            return;
        }
        let file = match self.registry.file() {
            Ok(file) => file,
            Err(e) => {
                warn!("Cannot stop recording: {}", e);
                return;
            }
        };

        if self.recording_microphone {
            self.recording_microphone = false;
            record(failures, Step::StopRecordingMicrophone, file.stop_recording_microphone());
        }
        if self.recording_playout {
            self.recording_playout = false;
            if let Some(channel) = self.channel {
                record(failures, Step::StopRecordingPlayout, file.stop_recording_playout(channel));
            }
        }
    }

    fn stop_media_into(&mut self, failures: &mut Vec<StepFailure>) {
        let Some(channel) = self.channel else {
            return;
        };
        if !(self.sending || self.playing || self.receiving) {
            return;
        }
        let base = match self.registry.base() {
            Ok(base) => base,
            Err(e) => {
                warn!("Cannot stop channel {}: {}", channel, e);
                return;
            }
        };

        if self.sending {
            self.sending = false;
            record(failures, Step::StopSend, base.stop_send(channel));
        }
        if self.playing {
            self.playing = false;
            record(failures, Step::StopPlayout, base.stop_playout(channel));
        }
        if self.receiving {
            self.receiving = false;
            record(failures, Step::StopReceive, base.stop_receive(channel));
        }
        info!("Channel {} stopped", channel);
    }
}

impl Drop for CallSession {
    fn drop(&mut self) {
        if self.state != SessionState::Terminated {
            warn!("Call session dropped in state {:?}; tearing down", self.state);
            let _ = self.teardown();
        }
    }
}

fn record(failures: &mut Vec<StepFailure>, step: Step, code: i32) {
    if code != 0 {
        warn!("{} failed with status {}", step, code);
        failures.push(StepFailure { step, code });
    }
}

fn into_result(failures: Vec<StepFailure>) -> Result<(), VoeError> {
    if failures.is_empty() {
        Ok(())
    } else {
        Err(VoeError::TeardownPartialFailure { steps: failures })
    }
}
