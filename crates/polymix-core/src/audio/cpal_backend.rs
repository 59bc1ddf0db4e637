//! CPAL output backend
//!
//! Wires a [`MixerEngine`] into a cpal output stream. The engine moves into
//! the stream callback, which gives the audio thread exclusive ownership
//! with no locking at all:
//!
//! ```text
//! ┌──────────────────┐                     ┌─────────────────────┐
//! │  Control Thread  │───push()───────────►│   Command Queue     │
//! │    (Mixer)       │                     │  (lock-free SPSC)   │
//! └──────────────────┘                     └──────────┬──────────┘
//!         │                                           │ pop()
//!         │ atomics                                   ▼
//! ┌──────────────────┐                     ┌─────────────────────┐
//! │  ChannelAtomics  │◄────────────────────│  CPAL Audio Thread  │
//! │  MusicAtomics    │    state writes     │  (owns MixerEngine) │
//! └──────────────────┘                     └─────────────────────┘
//! ```

use cpal::traits::{DeviceTrait, StreamTrait};
use cpal::{BufferSize as CpalBufferSize, SampleFormat, Stream, StreamConfig};

use crate::engine::{MixerEngine, MAX_BUFFER_SIZE};
use crate::types::StereoBuffer;

use super::config::{AudioConfig, BufferSize, DEFAULT_BUFFER_SIZE};
use super::device::{default_device, find_device};
use super::error::{AudioError, AudioResult};

/// Keeps the output stream alive; drop it to stop audio
pub struct CpalAudioHandle {
    _stream: Stream,
    sample_rate: u32,
    buffer_size: u32,
}

impl CpalAudioHandle {
    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Buffer size in frames as negotiated with the device
    pub fn buffer_size(&self) -> u32 {
        self.buffer_size
    }

    /// One-way output latency in milliseconds
    pub fn latency_ms(&self) -> f32 {
        (self.buffer_size as f32 / self.sample_rate as f32) * 1000.0
    }
}

/// Negotiate a device config and start the output stream around `engine`
///
/// The caller builds the engine at the rate returned by
/// [`negotiate_output`], so the stream and the engine always agree.
pub(crate) fn start_stream(
    device: &cpal::Device,
    stream_config: &StreamConfig,
    buffer_size: u32,
    engine: MixerEngine,
) -> AudioResult<CpalAudioHandle> {
    let sample_rate = stream_config.sample_rate.0;
    let stream = build_output_stream(device, stream_config, engine)?;
    stream
        .play()
        .map_err(|e| AudioError::StreamPlayError(e.to_string()))?;

    log::info!(
        "audio stream started: {}Hz, {} frames (~{:.1}ms latency)",
        sample_rate,
        buffer_size,
        (buffer_size as f32 / sample_rate as f32) * 1000.0
    );

    Ok(CpalAudioHandle { _stream: stream, sample_rate, buffer_size })
}

/// Resolve the configured device and the best output config for it
///
/// Returns the device, a ready stream config and the buffer size in frames.
pub(crate) fn negotiate_output(
    config: &AudioConfig,
) -> AudioResult<(cpal::Device, StreamConfig, u32)> {
    let device = match &config.device {
        Some(id) => find_device(id)?,
        None => default_device()?,
    };
    let name = device.name().unwrap_or_else(|_| "Unknown".to_string());
    log::info!("using audio device: {}", name);

    let supported: Vec<_> = device
        .supported_output_configs()
        .map_err(|e| AudioError::ConfigError(e.to_string()))?
        .collect();
    if supported.is_empty() {
        return Err(AudioError::ConfigError(
            "no supported output configurations".to_string(),
        ));
    }

    let target_rate = config
        .sample_rate
        .unwrap_or(crate::types::DEFAULT_SAMPLE_RATE);

    // Prefer f32 stereo at the requested rate, then degrade gracefully
    let best = supported
        .iter()
        .filter(|c| c.sample_format() == SampleFormat::F32)
        .filter(|c| c.channels() >= 2)
        .find(|c| target_rate >= c.min_sample_rate().0 && target_rate <= c.max_sample_rate().0)
        .or_else(|| supported.iter().find(|c| c.channels() >= 2))
        .or_else(|| supported.first())
        .ok_or_else(|| {
            AudioError::ConfigError("no suitable output configuration found".to_string())
        })?;

    if best.sample_format() != SampleFormat::F32 {
        return Err(AudioError::UnsupportedFormat(format!(
            "{:?}",
            best.sample_format()
        )));
    }

    let sample_rate = if target_rate >= best.min_sample_rate().0
        && target_rate <= best.max_sample_rate().0
    {
        cpal::SampleRate(target_rate)
    } else {
        let fallback = best.max_sample_rate();
        log::warn!(
            "device does not support {}Hz, falling back to {}Hz (sources will be resampled)",
            target_rate,
            fallback.0
        );
        fallback
    };

    let buffer_size = match config.buffer_size {
        BufferSize::Default => DEFAULT_BUFFER_SIZE,
        BufferSize::Fixed(frames) => frames.clamp(64, MAX_BUFFER_SIZE as u32),
    };

    let stream_config = StreamConfig {
        channels: best.channels(),
        sample_rate,
        buffer_size: CpalBufferSize::Fixed(buffer_size),
    };
    Ok((device, stream_config, buffer_size))
}

fn build_output_stream(
    device: &cpal::Device,
    config: &StreamConfig,
    mut engine: MixerEngine,
) -> AudioResult<Stream> {
    let channels = config.channels as usize;
    let mut buffer = StereoBuffer::silence(MAX_BUFFER_SIZE);

    let stream = device
        .build_output_stream(
            config,
            move |data: &mut [f32], _info: &cpal::OutputCallbackInfo| {
                let frames_total = data.len() / channels;
                let mut offset = 0;
                while offset < frames_total {
                    let frames = (frames_total - offset).min(MAX_BUFFER_SIZE);
                    buffer.set_len_from_capacity(frames);
                    engine.process(buffer.as_mut_slice());

                    let out = &mut data[offset * channels..(offset + frames) * channels];
                    if channels == 2 {
                        out.copy_from_slice(buffer.as_interleaved());
                    } else {
                        for (frame, sample) in out.chunks_mut(channels).zip(buffer.as_slice()) {
                            frame[0] = sample.left;
                            if channels > 1 {
                                frame[1] = sample.right;
                            }
                            for extra in frame.iter_mut().skip(2) {
                                *extra = 0.0;
                            }
                        }
                    }
                    offset += frames;
                }
            },
            move |err| {
                log::error!("audio stream error: {}", err);
            },
            None,
        )
        .map_err(|e| AudioError::StreamBuildError(e.to_string()))?;

    Ok(stream)
}
