//! Logger setup for the binary.
//!
//! Console logging goes to stderr at the level from `RUST_LOG` (or the
//! given default). Tracing sends every record, down to `trace`, to a file.

use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};

use env_logger::{Builder, Env, Target, WriteStyle};
use log::LevelFilter;

/// Trace file written when tracing is on.
pub const DEFAULT_TRACE_FILE: &str = "webrtc_trace.txt";

/// Where log records go.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogOutput {
    /// stderr, filtered by `RUST_LOG` or the default level
    Console { default_level: String },
    /// Every record to this file, truncated first
    TraceFile(PathBuf),
}

impl Default for LogOutput {
    fn default() -> Self {
        LogOutput::Console {
            default_level: "info".to_string(),
        }
    }
}

/// Build (but do not install) the logger for `output`.
///
/// Fails if the trace file cannot be created.
pub fn builder(output: &LogOutput) -> io::Result<Builder> {
    match output {
        LogOutput::Console { default_level } => Ok(Builder::from_env(
            Env::default().default_filter_or(default_level.as_str()),
        )),
        LogOutput::TraceFile(path) => {
            let file = create_trace_file(path)?;
            let mut builder = Builder::new();
            builder
                .filter_level(LevelFilter::Trace)
                .write_style(WriteStyle::Never)
                .target(Target::Pipe(Box::new(file)));
            Ok(builder)
        }
    }
}

/// Install the process logger for `output`.
pub fn init(output: &LogOutput) -> io::Result<()> {
    builder(output)?
        .try_init()
        .map_err(|e| io::Error::new(io::ErrorKind::AlreadyExists, e))
}

fn create_trace_file(path: &Path) -> io::Result<File> {
    File::create(path).map_err(|e| {
        io::Error::new(
            e.kind(),
            format!("cannot create trace file {}: {}", path.display(), e),
        )
    })
}
