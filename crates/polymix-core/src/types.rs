//! Common types for Polymix
//!
//! This module contains the fundamental audio types used throughout the
//! engine: the stereo sample/buffer pair that every mixing path operates on,
//! and the volume scale shared by channels, chunks, and the music slot.

/// Default output sample rate when the device does not dictate one (48kHz)
pub const DEFAULT_SAMPLE_RATE: u32 = 48000;

/// Default number of mixing channels in the pool
pub const DEFAULT_CHANNELS: usize = 8;

/// Maximum volume on the 0-128 scale used for channels, chunks, and music
pub const MAX_VOLUME: u8 = 128;

/// Audio sample type (32-bit float throughout the mixing path)
pub type Sample = f32;

/// Convert a 0-128 volume to a linear gain factor
#[inline]
pub fn volume_to_gain(volume: u8) -> Sample {
    volume.min(MAX_VOLUME) as Sample / MAX_VOLUME as Sample
}

/// A single stereo sample (left and right channels)
///
/// Uses `#[repr(C)]` to ensure predictable memory layout: [left, right].
/// This enables zero-copy conversion between `&[StereoSample]` and `&[f32]`
/// (interleaved format) using bytemuck, which is how mixed audio is handed
/// to the device callback.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct StereoSample {
    pub left: Sample,
    pub right: Sample,
}

impl StereoSample {
    /// Create a new stereo sample
    #[inline]
    pub fn new(left: Sample, right: Sample) -> Self {
        Self { left, right }
    }

    /// Create a silent stereo sample
    #[inline]
    pub fn silence() -> Self {
        Self::default()
    }

    /// Create a mono sample (same value in both channels)
    #[inline]
    pub fn mono(value: Sample) -> Self {
        Self { left: value, right: value }
    }

    /// Scale the two channels independently (panning)
    #[inline]
    pub fn scale_lr(&self, left_gain: Sample, right_gain: Sample) -> Self {
        Self {
            left: self.left * left_gain,
            right: self.right * right_gain,
        }
    }
}

impl std::ops::Add for StereoSample {
    type Output = Self;

    #[inline]
    fn add(self, other: Self) -> Self {
        Self {
            left: self.left + other.left,
            right: self.right + other.right,
        }
    }
}

impl std::ops::AddAssign for StereoSample {
    #[inline]
    fn add_assign(&mut self, other: Self) {
        self.left += other.left;
        self.right += other.right;
    }
}

impl std::ops::Mul<Sample> for StereoSample {
    type Output = Self;

    #[inline]
    fn mul(self, factor: Sample) -> Self {
        Self {
            left: self.left * factor,
            right: self.right * factor,
        }
    }
}

impl std::ops::MulAssign<Sample> for StereoSample {
    #[inline]
    fn mul_assign(&mut self, factor: Sample) {
        self.left *= factor;
        self.right *= factor;
    }
}

/// Pre-allocated scratch buffer for the device callback
///
/// Allocated once at stream build; only its working length changes inside
/// the callback, so handing audio to the device never allocates.
#[derive(Debug, Clone)]
pub struct StereoBuffer {
    samples: Vec<StereoSample>,
}

impl StereoBuffer {
    /// Create a buffer filled with silence
    pub fn silence(len: usize) -> Self {
        Self {
            samples: vec![StereoSample::silence(); len],
        }
    }

    /// Get the number of stereo samples in the buffer
    #[inline]
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// Check if the buffer is empty
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Set the working length of a pre-allocated buffer (real-time safe)
    ///
    /// Panics in debug builds if new_len > capacity. Use for pre-allocated
    /// buffers only. Fills any newly exposed elements with silence.
    #[inline]
    pub fn set_len_from_capacity(&mut self, new_len: usize) {
        let current_len = self.samples.len();
        if new_len > current_len {
            debug_assert!(
                new_len <= self.samples.capacity(),
                "set_len_from_capacity called with len > capacity"
            );
            self.samples.resize(new_len, StereoSample::silence());
        } else {
            self.samples.truncate(new_len);
        }
    }

    /// Get a slice of the samples
    #[inline]
    pub fn as_slice(&self) -> &[StereoSample] {
        &self.samples
    }

    /// Get a mutable slice of the samples
    #[inline]
    pub fn as_mut_slice(&mut self) -> &mut [StereoSample] {
        &mut self.samples
    }

    /// Get a zero-copy view of samples as interleaved f32 [L, R, L, R, ...]
    #[inline]
    pub fn as_interleaved(&self) -> &[Sample] {
        bytemuck::cast_slice(&self.samples)
    }
}

/// Native format of a decoded stream, before conversion to the engine format
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamSpec {
    /// Sample rate in Hz
    pub rate: u32,
    /// Channel count (1 = mono, 2 = stereo)
    pub channels: u16,
}

/// Output format the engine mixes at
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutputSpec {
    /// Sample rate in Hz
    pub sample_rate: u32,
}

impl OutputSpec {
    /// Convert a millisecond duration to a frame count at this rate
    #[inline]
    pub fn ms_to_frames(&self, ms: u32) -> u64 {
        ms as u64 * self.sample_rate as u64 / 1000
    }
}

impl Default for OutputSpec {
    fn default() -> Self {
        Self { sample_rate: DEFAULT_SAMPLE_RATE }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stereo_sample_operations() {
        let a = StereoSample::new(1.0, 2.0);
        let b = StereoSample::new(0.5, 0.5);

        let sum = a + b;
        assert_eq!(sum.left, 1.5);
        assert_eq!(sum.right, 2.5);

        let scaled = a * 0.5;
        assert_eq!(scaled.left, 0.5);
        assert_eq!(scaled.right, 1.0);

        let panned = a.scale_lr(1.0, 0.0);
        assert_eq!(panned.left, 1.0);
        assert_eq!(panned.right, 0.0);
    }

    #[test]
    fn test_volume_to_gain() {
        assert_eq!(volume_to_gain(0), 0.0);
        assert_eq!(volume_to_gain(128), 1.0);
        assert_eq!(volume_to_gain(64), 0.5);
        // Values above MAX_VOLUME clamp
        assert_eq!(volume_to_gain(255), 1.0);
    }

    #[test]
    fn test_interleaved_view() {
        let mut buffer = StereoBuffer::silence(2);
        buffer.as_mut_slice()[0] = StereoSample::new(1.0, 2.0);
        buffer.as_mut_slice()[1] = StereoSample::new(3.0, 4.0);
        assert_eq!(buffer.as_interleaved(), &[1.0, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn test_window_resize_keeps_retained_frames() {
        let mut buffer = StereoBuffer::silence(8);
        buffer.set_len_from_capacity(3);
        assert_eq!(buffer.len(), 3);
        buffer.as_mut_slice()[1] = StereoSample::new(1.0, 2.0);

        // Growing back within capacity exposes silence past the old length
        buffer.set_len_from_capacity(8);
        assert_eq!(buffer.as_slice()[1], StereoSample::new(1.0, 2.0));
        assert_eq!(buffer.as_slice()[7], StereoSample::silence());
        assert!(!buffer.is_empty());
    }

    #[test]
    fn test_ms_to_frames() {
        let spec = OutputSpec { sample_rate: 48000 };
        assert_eq!(spec.ms_to_frames(1000), 48000);
        assert_eq!(spec.ms_to_frames(100), 4800);
        assert_eq!(spec.ms_to_frames(0), 0);
    }
}
