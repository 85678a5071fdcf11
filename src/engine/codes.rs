//! Engine error and warning codes.
//!
//! Warnings are in the 8000 range, errors that stop voice functionality in
//! the 10000 range. These are the values delivered to
//! [`EngineObserver::on_error`](super::EngineObserver::on_error) and
//! returned by `last_error()`.

// Warnings
pub const VE_CHANNEL_NOT_VALID: i32 = 8002;
pub const VE_INVALID_ARGUMENT: i32 = 8005;
pub const VE_NOT_INITED: i32 = 8026;
pub const VE_RECEIVE_PACKET_TIMEOUT: i32 = 8035;
pub const VE_PACKET_RECEIPT_RESTARTED: i32 = 8082;
pub const VE_INVALID_OPERATION: i32 = 8088;
pub const VE_RUNTIME_PLAY_WARNING: i32 = 8098;
pub const VE_RUNTIME_REC_WARNING: i32 = 8099;
pub const VE_DESTINATION_NOT_INITED: i32 = 8104;
pub const VE_TYPING_NOISE_WARNING: i32 = 8107;
pub const VE_SATURATION_WARNING: i32 = 8108;
pub const VE_TYPING_NOISE_OFF_WARNING: i32 = 8116;

// Errors
pub const VE_BAD_FILE: i32 = 10016;
pub const VE_RUNTIME_PLAY_ERROR: i32 = 10019;
pub const VE_RUNTIME_REC_ERROR: i32 = 10020;
pub const VE_REC_DEVICE_REMOVED: i32 = 10023;
