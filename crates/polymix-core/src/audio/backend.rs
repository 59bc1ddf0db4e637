//! Entry point tying the mixer to a live output device
//!
//! [`start_audio_system`] negotiates a device configuration, builds a mixer
//! and engine at the negotiated rate, and hands the engine to the stream
//! callback. The returned [`Mixer`] is the only surface the application
//! needs from then on.

use std::sync::Arc;

use crate::decode::DecoderRegistry;
use crate::mixer::Mixer;
use crate::types::OutputSpec;

use super::config::AudioConfig;
use super::cpal_backend::{self, CpalAudioHandle};
use super::error::AudioResult;

/// Handle to the running audio output
///
/// Keeps the stream alive; drop it to stop audio. An enum so alternative
/// device backends can slot in without changing callers.
pub enum AudioHandle {
    Cpal(CpalAudioHandle),
}

impl AudioHandle {
    pub fn sample_rate(&self) -> u32 {
        match self {
            AudioHandle::Cpal(h) => h.sample_rate(),
        }
    }

    /// Buffer size in frames as negotiated with the device
    pub fn buffer_size(&self) -> u32 {
        match self {
            AudioHandle::Cpal(h) => h.buffer_size(),
        }
    }

    /// One-way output latency in milliseconds
    pub fn latency_ms(&self) -> f32 {
        match self {
            AudioHandle::Cpal(h) => h.latency_ms(),
        }
    }
}

/// Everything the application needs after startup
pub struct AudioSystemResult {
    /// The control surface
    pub mixer: Mixer,
    /// Keeps audio alive; drop to stop
    pub handle: AudioHandle,
    /// Rate the engine mixes at (the device rate, which may differ from
    /// the configured preference)
    pub sample_rate: u32,
    /// Actual buffer size in frames
    pub buffer_size: u32,
    /// One-way output latency in milliseconds
    pub latency_ms: f32,
}

/// Open the output device and start mixing
pub fn start_audio_system(
    config: &AudioConfig,
    registry: Arc<DecoderRegistry>,
) -> AudioResult<AudioSystemResult> {
    let (device, stream_config, buffer_size) = cpal_backend::negotiate_output(config)?;
    let sample_rate = stream_config.sample_rate.0;

    let (mixer, engine) = Mixer::offline(
        OutputSpec { sample_rate },
        config.channels,
        registry,
    );

    let handle = cpal_backend::start_stream(&device, &stream_config, buffer_size, engine)?;
    let latency_ms = handle.latency_ms();

    Ok(AudioSystemResult {
        mixer,
        handle: AudioHandle::Cpal(handle),
        sample_rate,
        buffer_size,
        latency_ms,
    })
}
