//! Voice-call session exerciser.
//!
//! Brings up a media engine, wires a UDP transport for a channel's RTP/RTCP,
//! runs and records a bidirectional call, then tears everything down in
//! reverse dependency order.
//!
//! Components:
//! - [`relay::PacketRelay`]: bridges a channel's UDP sockets to the engine's
//!   packet ingestion and outbound transport hook
//! - [`registry::SubsystemRegistry`]: reference-counted engine facet handles
//! - [`observer::ErrorObserver`]: classifies asynchronous engine notifications
//! - [`session::CallSession`]: the lifecycle state machine tying them together
//!
//! The engine interface lives in [`engine`]; [`engine::loopback`] is a
//! software implementation over virtual devices.

pub mod config;
pub mod engine;
pub mod error;
pub mod logging;
pub mod observer;
pub mod registry;
pub mod relay;
pub mod rtp;
pub mod session;
pub mod transport;

pub use config::{MediaSelection, ProcessingConfig, RecordingConfig, SessionConfig};
pub use engine::{ChannelId, EngineInstance, Facet, MediaEngine, Status};
pub use error::{Step, StepFailure, VoeError};
pub use observer::{EngineEvent, ErrorObserver};
pub use registry::SubsystemRegistry;
pub use relay::{PacketRelay, RelayStatsSnapshot};
pub use session::{CallSession, SessionState, StopSignal, TeardownReport};
