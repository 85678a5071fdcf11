//! RTP/RTCP packet helpers used by the loopback engine.

pub mod header;
pub mod rtcp;

pub use header::*;
