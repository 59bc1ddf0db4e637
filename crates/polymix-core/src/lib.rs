//! polymix-core - channel-based audio mixing and playback engine
//!
//! A pool of mixing channels for short decoded sounds, a streamed music
//! slot, tag-based channel groups, per-channel and post-mix effect chains,
//! and a real-time mixdown loop behind a lock-free command queue.
//!
//! The split that shapes everything: the [`Mixer`] facade lives on the
//! control thread, the [`engine::MixerEngine`] is owned exclusively by the
//! audio thread, and the two only talk through SPSC queues and shared
//! atomics. See [`audio::start_audio_system`] to wire the engine to a
//! device, or [`Mixer::offline`] to drive it yourself.
//!
//! ```no_run
//! use std::sync::Arc;
//! use polymix_core::audio::{start_audio_system, AudioConfig};
//! use polymix_core::decode::DecoderRegistry;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let registry = Arc::new(DecoderRegistry::new());
//! let system = start_audio_system(&AudioConfig::default(), registry)?;
//!
//! let chunk = system.mixer.load_chunk_file("bang.wav")?;
//! let channel = system.mixer.play(-1, &chunk, 0)?;
//! println!("playing on channel {}", channel);
//! # Ok(())
//! # }
//! ```

pub mod audio;
pub mod chunk;
pub mod decode;
pub mod effect;
pub mod engine;
pub mod error;
pub mod mixer;
pub mod resample;
pub mod types;

pub use chunk::Chunk;
pub use engine::{ChannelState, MixerEvent};
pub use error::{MixerError, MixerResult};
pub use mixer::Mixer;
pub use types::*;
