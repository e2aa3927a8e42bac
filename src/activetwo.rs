// src/activetwo.rs
// BioSemi ActiveTwo (ActiView TCP 服务器) 采集源
use std::io::Read;
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::time::Duration;

use log::{info, warn};
use ndarray::Array2;
use serde::{Deserialize, Serialize};

use crate::drivers::{PipelineError, SampleSource, SamplePacer};

/// Channel order ActiView sends with 32 EEG + 8 EX electrodes.
pub const BIOSEMI_CHANNELS: [&str; 40] = [
    "Fp1", "AF3", "F7", "F3", "FC1", "FC5", "T7", "C3", "CP1", "CP5", "P7", "P3", "Pz", "PO3",
    "O1", "Oz", "O2", "PO4", "P4", "P8", "CP6", "CP2", "C4", "T8", "FC6", "FC2", "F4", "F8",
    "AF4", "Fp2", "Fz", "Cz", "EX1", "EX2", "EX3", "EX4", "EX5", "EX6", "EX7", "EX8",
];
/// One 24-bit count is 31.25 nV.
const MICROVOLTS_PER_COUNT: f32 = 0.031_25;
const BYTES_PER_VALUE: usize = 3;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct ActiveTwoConfig {
    pub host: String,
    pub port: u16,
    pub sample_rate_hz: f32,
    pub channels: usize,
    pub connect_timeout_ms: u64,
}
impl Default for ActiveTwoConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 8888,
            sample_rate_hz: 256.0,
            channels: 40,
            connect_timeout_ms: 3000,
        }
    }
}

pub fn channel_labels(channels: usize) -> Vec<String> {
    (0..channels)
        .map(|idx| match BIOSEMI_CHANNELS.get(idx) {
            Some(name) => name.to_string(),
            None => format!("CH{}", idx + 1),
        })
        .collect()
}

/// Decodes sample-major, little-endian signed 24-bit words into microvolts.
pub fn decode_samples(bytes: &[u8], channels: usize) -> Result<Array2<f32>, PipelineError> {
    let frame = channels * BYTES_PER_VALUE;
    if channels == 0 || bytes.len() % frame != 0 {
        return Err(PipelineError::ChannelMismatch {
            expected: channels,
            actual: bytes.len() / BYTES_PER_VALUE,
        });
    }
    let rows = bytes.len() / frame;
    let values = bytes
        .chunks_exact(BYTES_PER_VALUE)
        .map(|b| {
            // sign-extend via the top byte of an i32
            let raw = i32::from_le_bytes([0, b[0], b[1], b[2]]) >> 8;
            raw as f32 * MICROVOLTS_PER_COUNT
        })
        .collect::<Vec<_>>();
    Array2::from_shape_vec((rows, channels), values).map_err(|_| PipelineError::ChannelMismatch {
        expected: channels,
        actual: bytes.len() / BYTES_PER_VALUE / rows.max(1),
    })
}

pub struct ActiveTwoSource {
    config: ActiveTwoConfig,
    labels: Vec<String>,
    stream: Option<TcpStream>,
    pacer: SamplePacer,
    buf: Vec<u8>,
}
impl ActiveTwoSource {
    pub fn connect(config: ActiveTwoConfig) -> Result<Self, PipelineError> {
        if config.sample_rate_hz <= 0.0 {
            return Err(PipelineError::InvalidSampleRate);
        }
        let mut source = Self {
            labels: channel_labels(config.channels),
            pacer: SamplePacer::new(config.sample_rate_hz),
            stream: None,
            buf: Vec::new(),
            config,
        };
        source.reconnect()?;
        Ok(source)
    }
    fn address(&self) -> Result<SocketAddr, PipelineError> {
        let target = format!("{}:{}", self.config.host, self.config.port);
        target
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| PipelineError::SourceUnavailable(format!("cannot resolve {target}")))
    }
    fn reconnect(&mut self) -> Result<(), PipelineError> {
        let addr = self.address()?;
        let timeout = Duration::from_millis(self.config.connect_timeout_ms.max(1));
        let stream = TcpStream::connect_timeout(&addr, timeout)
            .map_err(|err| PipelineError::SourceUnavailable(format!("ActiView at {addr}: {err}")))?;
        stream.set_nodelay(true)?;
        // a silent amplifier should surface as an error rather than hang the loop
        stream.set_read_timeout(Some(timeout))?;
        info!(
            "connected to ActiView at {addr}: {} channels @ {} Hz",
            self.config.channels, self.config.sample_rate_hz
        );
        self.stream = Some(stream);
        Ok(())
    }
}
impl SampleSource for ActiveTwoSource {
    fn sample_rate_hz(&self) -> f32 {
        self.config.sample_rate_hz
    }
    fn channel_labels(&self) -> &[String] {
        &self.labels
    }
    fn pull(&mut self, duration: Duration) -> Result<Array2<f32>, PipelineError> {
        let count = self.pacer.samples_for(duration);
        let channels = self.config.channels;
        self.buf.resize(count * channels * BYTES_PER_VALUE, 0);
        if count == 0 {
            return Ok(Array2::zeros((0, channels)));
        }
        if self.stream.is_none() {
            self.reconnect()?;
        }
        let Some(stream) = self.stream.as_mut() else {
            return Err(PipelineError::SourceUnavailable("not connected".into()));
        };
        match stream.read_exact(&mut self.buf) {
            Ok(()) => decode_samples(&self.buf, channels),
            Err(err) => {
                warn!("ActiView read failed: {err}; reconnecting on next pull");
                self.stream = None;
                Err(PipelineError::SourceUnavailable(err.to_string()))
            }
        }
    }
}
