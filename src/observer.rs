//! Engine error callback.
//!
//! The engine calls [`ErrorObserver::on_error`] from its notification
//! thread at any time between registration and deregistration. The
//! observer classifies the code, logs it and counts it; it never touches
//! session state.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use log::{error, warn};

use crate::engine::codes;
use crate::engine::{ChannelId, EngineObserver};

/// Classified engine notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineEvent {
    TypingNoise,
    TypingNoiseOff,
    ReceivePacketTimeout,
    PacketReceiptRestarted,
    RuntimePlayWarning,
    RuntimeRecordWarning,
    SaturationWarning,
    RuntimePlayError,
    RuntimeRecordError,
    RecordDeviceRemoved,
    Unrecognized(i32),
}

impl EngineEvent {
    /// Number of recognised (non-`Unrecognized`) events.
    pub const RECOGNISED: usize = 10;

    pub fn from_code(code: i32) -> Self {
        match code {
            codes::VE_TYPING_NOISE_WARNING => EngineEvent::TypingNoise,
            codes::VE_TYPING_NOISE_OFF_WARNING => EngineEvent::TypingNoiseOff,
            codes::VE_RECEIVE_PACKET_TIMEOUT => EngineEvent::ReceivePacketTimeout,
            codes::VE_PACKET_RECEIPT_RESTARTED => EngineEvent::PacketReceiptRestarted,
            codes::VE_RUNTIME_PLAY_WARNING => EngineEvent::RuntimePlayWarning,
            codes::VE_RUNTIME_REC_WARNING => EngineEvent::RuntimeRecordWarning,
            codes::VE_SATURATION_WARNING => EngineEvent::SaturationWarning,
            codes::VE_RUNTIME_PLAY_ERROR => EngineEvent::RuntimePlayError,
            codes::VE_RUNTIME_REC_ERROR => EngineEvent::RuntimeRecordError,
            codes::VE_REC_DEVICE_REMOVED => EngineEvent::RecordDeviceRemoved,
            other => EngineEvent::Unrecognized(other),
        }
    }

    /// Human-readable tag used in reports.
    pub fn tag(&self) -> &'static str {
        match self {
            EngineEvent::TypingNoise => "TYPING NOISE",
            EngineEvent::TypingNoiseOff => "TYPING NOISE OFF",
            EngineEvent::ReceivePacketTimeout => "RECEIVE PACKET TIMEOUT",
            EngineEvent::PacketReceiptRestarted => "PACKET RECEIPT RESTARTED",
            EngineEvent::RuntimePlayWarning => "RUNTIME PLAY WARNING",
            EngineEvent::RuntimeRecordWarning => "RUNTIME RECORD WARNING",
            EngineEvent::SaturationWarning => "SATURATION WARNING",
            EngineEvent::RuntimePlayError => "RUNTIME PLAY ERROR",
            EngineEvent::RuntimeRecordError => "RUNTIME RECORD ERROR",
            EngineEvent::RecordDeviceRemoved => "RECORD DEVICE REMOVED",
            EngineEvent::Unrecognized(_) => "UNKNOWN ERROR",
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(
            self,
            EngineEvent::RuntimePlayError
                | EngineEvent::RuntimeRecordError
                | EngineEvent::RecordDeviceRemoved
                | EngineEvent::Unrecognized(_)
        )
    }

    fn slot(&self) -> Option<usize> {
        let slot = match self {
            EngineEvent::TypingNoise => 0,
            EngineEvent::TypingNoiseOff => 1,
            EngineEvent::ReceivePacketTimeout => 2,
            EngineEvent::PacketReceiptRestarted => 3,
            EngineEvent::RuntimePlayWarning => 4,
            EngineEvent::RuntimeRecordWarning => 5,
            EngineEvent::SaturationWarning => 6,
            EngineEvent::RuntimePlayError => 7,
            EngineEvent::RuntimeRecordError => 8,
            EngineEvent::RecordDeviceRemoved => 9,
            EngineEvent::Unrecognized(_) => return None,
        };
        Some(slot)
    }
}

/// One reported notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ErrorReport {
    pub channel: ChannelId,
    pub code: i32,
    pub event: EngineEvent,
}

impl fmt::Display for ErrorReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} (channel {}, code {})",
            self.event.tag(),
            self.channel,
            self.code
        )
    }
}

/// Counts of reported notifications.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ObserverStats {
    pub total: u64,
    pub unrecognized: u64,
    pub last_code: Option<i32>,
}

/// Error observer registered with the base facet.
#[derive(Default)]
pub struct ErrorObserver {
    counts: [AtomicU64; EngineEvent::RECOGNISED],
    unrecognized: AtomicU64,
    total: AtomicU64,
    last_code: AtomicU64,
}

impl ErrorObserver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Classify and log one notification.
    pub fn report(&self, channel: ChannelId, code: i32) -> ErrorReport {
        let event = EngineEvent::from_code(code);
        let report = ErrorReport {
            channel,
            code,
            event,
        };

        match event.slot() {
            Some(slot) => {
                self.counts[slot].fetch_add(1, Ordering::Relaxed);
            }
            None => {
                self.unrecognized.fetch_add(1, Ordering::Relaxed);
            }
        }
        self.total.fetch_add(1, Ordering::Relaxed);
        // Low 32 bits hold the code, bit 32 marks it as set
        self.last_code
            .store((1u64 << 32) | code as u32 as u64, Ordering::Relaxed);

        if event.is_error() {
            error!("Engine error: {}", report);
        } else {
            warn!("Engine warning: {}", report);
        }
        report
    }

    /// Number of times `event` was reported. For `Unrecognized` this counts
    /// every unknown code.
    pub fn count(&self, event: EngineEvent) -> u64 {
        match event.slot() {
            Some(slot) => self.counts[slot].load(Ordering::Relaxed),
            None => self.unrecognized.load(Ordering::Relaxed),
        }
    }

    pub fn stats(&self) -> ObserverStats {
        let last = self.last_code.load(Ordering::Relaxed);
        ObserverStats {
            total: self.total.load(Ordering::Relaxed),
            unrecognized: self.unrecognized.load(Ordering::Relaxed),
            last_code: (last >> 32 != 0).then_some(last as u32 as i32),
        }
    }
}

impl EngineObserver for ErrorObserver {
    fn on_error(&self, channel: ChannelId, code: i32) {
        self.report(channel, code);
    }
}
