//! Session configuration.

use std::path::PathBuf;

use crate::relay::RECEIVE_BUFFER_COUNT;

/// Audio processing switches applied while configuring the channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessingConfig {
    /// Voice activity detection on the send side
    pub vad: bool,
    /// Automatic gain control (microphone)
    pub agc: bool,
    /// Echo cancellation
    pub ec: bool,
    /// Noise suppression (microphone)
    pub ns: bool,
    /// Automatic gain control on received audio
    pub rx_agc: bool,
    /// Noise suppression on received audio
    pub rx_ns: bool,
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            vad: true,
            agc: true,
            ec: true,
            ns: true,
            rx_agc: true,
            rx_ns: true,
        }
    }
}

/// WAV capture of the call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordingConfig {
    pub enabled: bool,
    /// Microphone (sent) audio
    pub microphone: PathBuf,
    /// Playout (received) audio
    pub playout: PathBuf,
}

impl Default for RecordingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            microphone: PathBuf::from("recorded_mic.wav"),
            playout: PathBuf::from("recorded_playout.wav"),
        }
    }
}

/// Configuration for a call session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    /// Remote address RTP is sent to (RTCP goes to the next port)
    pub remote_ip: String,
    /// Remote RTP port
    pub remote_port: u16,
    /// Local RTP receive port (RTCP on the next port)
    pub local_port: u16,
    /// Receive thread hint for the socket layer
    pub socket_threads: u8,
    /// Datagrams of receive socket buffering
    pub receive_buffers: usize,
    pub processing: ProcessingConfig,
    pub recording: RecordingConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            remote_ip: "127.0.0.1".to_string(),
            remote_port: 800,
            local_port: 800,
            socket_threads: 1,
            receive_buffers: RECEIVE_BUFFER_COUNT,
            processing: ProcessingConfig::default(),
            recording: RecordingConfig::default(),
        }
    }
}

/// Codec and device choice for one call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MediaSelection {
    /// Index into the codec list
    pub codec_index: usize,
    pub playout_device: usize,
    pub recording_device: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = SessionConfig::default();
        assert_eq!(config.remote_ip, "127.0.0.1");
        assert_eq!(config.remote_port, 800);
        assert_eq!(config.local_port, 800);
        assert_eq!(config.receive_buffers, 500);
        assert!(config.processing.rx_ns);
        assert!(config.recording.enabled);
        assert_eq!(config.recording.playout, PathBuf::from("recorded_playout.wav"));
    }
}
