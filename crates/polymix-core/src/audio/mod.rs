//! Device I/O boundary
//!
//! The mixdown engine itself never touches a device; this module owns that
//! edge. The output stream callback pulls windows out of the engine and
//! interleaves them into whatever channel count the device wants. Defaults
//! target 48kHz stereo f32; a device that cannot do the preferred rate wins
//! the negotiation, and sources get resampled at load/stream time instead.

mod backend;
mod config;
mod cpal_backend;
mod device;
mod error;

pub use backend::{start_audio_system, AudioHandle, AudioSystemResult};
pub use config::{AudioConfig, BufferSize, DeviceId, DEFAULT_BUFFER_SIZE};
pub use cpal_backend::CpalAudioHandle;
pub use device::{output_devices, AudioDevice};
pub use error::{AudioError, AudioResult};
