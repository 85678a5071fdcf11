//! Voice call exerciser.
//!
//! Brings up the loopback engine, runs one call between the local port and
//! the remote address, records both directions and tears everything down
//! when Enter or Ctrl+C is pressed.
//!
//! Usage:
//!   voe-call [--remote 127.0.0.1] [--remote-port 800] [--local-port 800] [--codec 0]
//!           [--trace] [--trace-file webrtc_trace.txt]
//!
//! With the defaults the call loops back to itself.

use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use clap::Parser;
use log::error;

use voe_call::engine::loopback::{LoopbackEngine, LoopbackOptions};
use voe_call::logging::{self, LogOutput};
use voe_call::{CallSession, EngineInstance, MediaSelection, SessionConfig, StopSignal, VoeError};

#[derive(Parser, Debug)]
#[command(author, version, about = "Two-way voice call over UDP with WAV recording", long_about = None)]
struct Args {
    /// Remote IPv4/IPv6 address RTP is sent to
    #[arg(long, default_value = "127.0.0.1")]
    remote: String,

    /// Remote RTP port (RTCP uses the next port)
    #[arg(long, default_value = "800")]
    remote_port: u16,

    /// Local RTP receive port (RTCP uses the next port)
    #[arg(long, default_value = "800")]
    local_port: u16,

    /// Send codec index (prompted for when omitted)
    #[arg(long)]
    codec: Option<usize>,

    /// Playout device index (prompted for when omitted)
    #[arg(long)]
    playout_device: Option<usize>,

    /// Recording device index (prompted for when omitted)
    #[arg(long)]
    recording_device: Option<usize>,

    /// Do not record the call
    #[arg(long)]
    no_record: bool,

    /// Microphone recording file
    #[arg(long, default_value = "recorded_mic.wav")]
    mic_file: PathBuf,

    /// Playout recording file
    #[arg(long, default_value = "recorded_playout.wav")]
    playout_file: PathBuf,

    /// Silence after which a receive timeout is reported
    #[arg(long, default_value = "5000")]
    receive_timeout_ms: u64,

    /// Write a full trace of every log record to the trace file
    #[arg(long)]
    trace: bool,

    /// Trace file written with --trace
    #[arg(long, default_value = logging::DEFAULT_TRACE_FILE)]
    trace_file: PathBuf,
}

impl Args {
    fn session_config(&self) -> SessionConfig {
        let mut config = SessionConfig {
            remote_ip: self.remote.clone(),
            remote_port: self.remote_port,
            local_port: self.local_port,
            ..Default::default()
        };
        config.recording.enabled = !self.no_record;
        config.recording.microphone = self.mic_file.clone();
        config.recording.playout = self.playout_file.clone();
        config
    }

    fn log_output(&self) -> LogOutput {
        if self.trace {
            LogOutput::TraceFile(self.trace_file.clone())
        } else {
            LogOutput::default()
        }
    }
}

fn main() -> ExitCode {
    let args = Args::parse();

    if let Err(e) = logging::init(&args.log_output()) {
        eprintln!("ERROR: {}", e);
        return ExitCode::FAILURE;
    }
    if args.trace {
        println!("Tracing to {}", args.trace_file.display());
    }

    let options = LoopbackOptions {
        receive_timeout: Duration::from_millis(args.receive_timeout_ms),
        ..Default::default()
    };
    let engine = EngineInstance::create(Arc::new(LoopbackEngine::new(options)));
    let mut session = CallSession::new(engine, args.session_config());

    let stop = StopSignal::new();
    let ctrlc_stop = stop.clone();
    ctrlc::set_handler(move || {
        println!("\nReceived Ctrl+C, shutting down...");
        ctrlc_stop.trigger();
    })
    .expect("Error setting Ctrl-C handler");

    let outcome = run_call(&mut session, &args, &stop);
    if let Err(e) = &outcome {
        error!("Call failed: {}", e);
    }

    // Teardown runs whatever state the call reached
    println!("Tearing down...");
    let torn_down = session.teardown();
    match &torn_down {
        Ok(report) => {
            println!("Released all facets ({} references left)", report.remaining_references);
        }
        Err(e) => error!("Teardown incomplete: {}", e),
    }

    if outcome.is_ok() && torn_down.is_ok() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

fn run_call(session: &mut CallSession, args: &Args, stop: &StopSignal) -> Result<(), VoeError> {
    session.init()?;
    let channel = session.create_channel()?;
    session.bind_transport()?;

    let config = session.config().clone();
    println!("========================================");
    println!("  Voice Call");
    println!("========================================");
    println!();
    println!("Engine:      {}", session.version().unwrap_or("unknown"));
    println!("Channel:     {}", channel);
    println!("Local port:  {} (RTCP {})", config.local_port, config.local_port.wrapping_add(1));
    println!("Remote:      {}:{}", config.remote_ip, config.remote_port);
    println!();

    let codecs = session.codecs()?;
    println!("Codecs:");
    for (i, codec) in codecs.iter().enumerate() {
        println!("  {}. {}", i, codec);
    }
    let codec_index = match args.codec {
        Some(index) => index,
        None => prompt_index("Select send codec")?,
    };

    let devices = session.devices()?;
    println!("Playout devices:");
    for (i, device) in devices.playout.iter().enumerate() {
        println!("  {}. {} ({})", i, device.name, device.guid);
    }
    let playout_device = match args.playout_device {
        Some(index) => index,
        None => prompt_index("Select playout device")?,
    };
    println!("Recording devices:");
    for (i, device) in devices.recording.iter().enumerate() {
        println!("  {}. {} ({})", i, device.name, device.guid);
    }
    let recording_device = match args.recording_device {
        Some(index) => index,
        None => prompt_index("Select recording device")?,
    };

    let selection = MediaSelection {
        codec_index,
        playout_device,
        recording_device,
    };
    session.configure(&selection)?;
    session.start()?;
    if config.recording.enabled {
        session.start_recording()?;
    }

    match session.mic_volume() {
        Ok(volume) => println!("Mic volume:  {}", volume),
        Err(e) => println!("[WARN] Mic volume unavailable: {}", e),
    }
    println!();
    println!("Call started. Press Enter or Ctrl+C to stop.");
    println!();

    let enter_stop = stop.clone();
    thread::spawn(move || {
        let mut line = String::new();
        // Closed stdin leaves Ctrl+C as the only way out
        if let Ok(n) = io::stdin().lock().read_line(&mut line) {
            if n > 0 {
                enter_stop.trigger();
            }
        }
    });

    while !stop.wait_timeout(Duration::from_secs(1)) {
        if let Some(stats) = session.relay_stats() {
            println!("{}", stats);
        }
    }

    println!();
    println!("Stopping call...");
    session.stop()
}

/// Read a device or codec index from stdin.
fn prompt_index(prompt: &str) -> Result<usize, VoeError> {
    let stdin = io::stdin();
    loop {
        print!("{}: ", prompt);
        let _ = io::stdout().flush();

        let mut line = String::new();
        let read = stdin.lock().read_line(&mut line).map_err(|e| VoeError::Input {
            reason: e.to_string(),
        })?;
        if read == 0 {
            return Err(VoeError::Input {
                reason: "stdin closed".to_string(),
            });
        }
        match line.trim().parse() {
            Ok(index) => return Ok(index),
            Err(_) => println!("Not a number: {}", line.trim()),
        }
    }
}
