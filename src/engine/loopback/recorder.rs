//! WAV capture of call audio.

use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};

use hound::{SampleFormat, WavSpec, WavWriter};
use log::debug;

use super::codec::SAMPLE_RATE;

/// 8 kHz mono 16-bit WAV writer.
pub struct WavRecorder {
    writer: WavWriter<BufWriter<File>>,
    path: PathBuf,
    samples: u64,
}

impl WavRecorder {
    pub fn create(path: &Path) -> Result<Self, hound::Error> {
        let spec = WavSpec {
            channels: 1,
            sample_rate: SAMPLE_RATE,
            bits_per_sample: 16,
            sample_format: SampleFormat::Int,
        };

        let writer = WavWriter::create(path, spec)?;
        debug!("Recording to {}", path.display());
        Ok(Self {
            writer,
            path: path.to_path_buf(),
            samples: 0,
        })
    }

    pub fn write(&mut self, samples: &[i16]) -> Result<(), hound::Error> {
        for &sample in samples {
            self.writer.write_sample(sample)?;
        }
        self.samples += samples.len() as u64;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write the header and close the file; returns the samples written.
    pub fn finish(self) -> Result<u64, hound::Error> {
        let samples = self.samples;
        self.writer.finalize()?;
        debug!("Recorded {} samples to {}", samples, self.path.display());
        Ok(samples)
    }
}
