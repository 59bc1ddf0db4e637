//! Chunk store - decoded short sounds shared across channels
//!
//! A chunk is an immutable, fully decoded stereo PCM buffer at the engine
//! rate, plus a per-chunk default volume on the 0-128 scale. Chunks are
//! reference-counted with `basedrop::Shared`: every playing channel holds a
//! clone, so the application can drop its handle at any time and the PCM is
//! released only after the last claim drops - and never freed on the audio
//! thread (see [`crate::engine::gc`]).

use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;

use basedrop::Shared;

use crate::decode::Decoder;
use crate::engine::gc::gc_handle;
use crate::error::MixerResult;
use crate::resample::StreamResampler;
use crate::types::{OutputSpec, StereoSample, MAX_VOLUME};

/// Decode block size when draining a decoder into a chunk
const LOAD_BLOCK: usize = 4096;

/// Shared payload of a chunk
pub struct ChunkData {
    frames: Vec<StereoSample>,
    /// Default volume applied on top of the channel volume (0-128).
    /// Atomic so it can be adjusted while channels are playing the chunk.
    volume: AtomicU8,
}

impl ChunkData {
    /// PCM frames at the engine rate
    #[inline]
    pub fn frames(&self) -> &[StereoSample] {
        &self.frames
    }

    /// Current chunk volume (0-128)
    #[inline]
    pub fn volume(&self) -> u8 {
        self.volume.load(Ordering::Relaxed)
    }
}

/// A loaded short sound, cheap to clone
#[derive(Clone)]
pub struct Chunk {
    data: Shared<ChunkData>,
}

impl Chunk {
    /// Build a chunk from raw frames already at the engine rate
    pub fn from_frames(frames: Vec<StereoSample>) -> Self {
        Self {
            data: Shared::new(
                &gc_handle(),
                ChunkData { frames, volume: AtomicU8::new(MAX_VOLUME) },
            ),
        }
    }

    /// Decode a full stream into a chunk, resampling to the output rate
    pub fn from_decoder(mut decoder: Box<dyn Decoder>, spec: OutputSpec) -> MixerResult<Self> {
        let native = decoder.spec();
        let mut resampler = StreamResampler::new(native.rate, spec.sample_rate)?;

        let mut block = vec![StereoSample::silence(); LOAD_BLOCK];
        let mut frames = Vec::new();
        loop {
            let n = decoder.decode(&mut block)?;
            if n == 0 {
                break;
            }
            resampler.push(&block[..n], &mut frames)?;
        }
        resampler.flush(&mut frames)?;

        Ok(Self::from_frames(frames))
    }

    /// Length in frames
    pub fn len(&self) -> usize {
        self.data.frames.len()
    }

    /// Check if the chunk holds no audio
    pub fn is_empty(&self) -> bool {
        self.data.frames.is_empty()
    }

    /// Duration at the given output spec
    pub fn duration(&self, spec: OutputSpec) -> Duration {
        Duration::from_secs_f64(self.len() as f64 / spec.sample_rate as f64)
    }

    /// Set the chunk volume, returning the previous value
    ///
    /// A negative `volume` queries without changing; values above 128 clamp.
    pub fn set_volume(&self, volume: i32) -> u8 {
        let previous = self.data.volume.load(Ordering::Relaxed);
        if volume >= 0 {
            let clamped = (volume as u32).min(MAX_VOLUME as u32) as u8;
            self.data.volume.store(clamped, Ordering::Relaxed);
        }
        previous
    }

    /// Current chunk volume (0-128)
    pub fn volume(&self) -> u8 {
        self.data.volume()
    }

    /// The shared payload, for handing to the audio thread
    pub(crate) fn data(&self) -> Shared<ChunkData> {
        Shared::clone(&self.data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decode::testing::MemoryDecoder;

    #[test]
    fn test_chunk_from_frames() {
        let chunk = Chunk::from_frames(vec![StereoSample::mono(0.5); 480]);
        assert_eq!(chunk.len(), 480);
        assert!(!chunk.is_empty());
        assert_eq!(
            chunk.duration(OutputSpec { sample_rate: 48000 }),
            Duration::from_millis(10)
        );
    }

    #[test]
    fn test_chunk_volume_convention() {
        let chunk = Chunk::from_frames(vec![StereoSample::silence(); 8]);
        assert_eq!(chunk.volume(), MAX_VOLUME);

        // Negative queries without changing
        assert_eq!(chunk.set_volume(-1), MAX_VOLUME);
        assert_eq!(chunk.volume(), MAX_VOLUME);

        // Set returns the previous value
        assert_eq!(chunk.set_volume(64), MAX_VOLUME);
        assert_eq!(chunk.volume(), 64);

        // Above-range clamps to MAX_VOLUME
        assert_eq!(chunk.set_volume(200), 64);
        assert_eq!(chunk.volume(), MAX_VOLUME);
    }

    #[test]
    fn test_chunk_from_decoder_same_rate() {
        let decoder = Box::new(MemoryDecoder::constant(0.25, 1000, 48000));
        let chunk = Chunk::from_decoder(decoder, OutputSpec { sample_rate: 48000 }).unwrap();
        assert_eq!(chunk.len(), 1000);
        assert_eq!(chunk.data().frames()[0].left, 0.25);
    }

    #[test]
    fn test_chunk_shared_across_clones() {
        let chunk = Chunk::from_frames(vec![StereoSample::silence(); 8]);
        let clone = chunk.clone();
        chunk.set_volume(32);
        // Clones observe the same volume cell
        assert_eq!(clone.volume(), 32);
    }
}
