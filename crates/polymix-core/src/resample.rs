//! Sample-rate conversion between decoder-native and engine rate
//!
//! Wraps rubato's sinc resampler behind a push/flush interface that accepts
//! arbitrary-sized frame batches. Only ever used off the audio thread: at
//! chunk load time and on the music prefetch thread.

use rubato::{
    Resampler, SincFixedIn, SincInterpolationParameters, SincInterpolationType, WindowFunction,
};

use crate::error::{MixerError, MixerResult};
use crate::types::StereoSample;

/// Fixed input block size fed to the sinc resampler
const RESAMPLE_CHUNK: usize = 1024;

/// Incremental stereo resampler
///
/// Passthrough when source and target rates match; otherwise buffers input
/// until a full block is available and converts block by block. The sinc
/// filter's output delay is compensated: pushed content comes out aligned to
/// frame 0, and `flush` emits exactly `input frames * ratio` frames total.
pub struct StreamResampler {
    inner: Option<SincFixedIn<f32>>,
    ratio: f64,
    left: Vec<f32>,
    right: Vec<f32>,
    /// Leading filter-delay frames still to be discarded
    delay_skip: usize,
    frames_in: u64,
    frames_out: u64,
}

impl StreamResampler {
    /// Create a resampler converting `from` Hz to `to` Hz
    pub fn new(from: u32, to: u32) -> MixerResult<Self> {
        if from == to {
            return Ok(Self {
                inner: None,
                ratio: 1.0,
                left: Vec::new(),
                right: Vec::new(),
                delay_skip: 0,
                frames_in: 0,
                frames_out: 0,
            });
        }

        let params = SincInterpolationParameters {
            sinc_len: 128,
            f_cutoff: 0.95,
            interpolation: SincInterpolationType::Linear,
            oversampling_factor: 128,
            window: WindowFunction::BlackmanHarris2,
        };
        let ratio = to as f64 / from as f64;
        let inner = SincFixedIn::<f32>::new(ratio, 1.0, params, RESAMPLE_CHUNK, 2)
            .map_err(|e| MixerError::InvalidArgument(format!("resampler: {}", e)))?;
        let delay = inner.output_delay();

        Ok(Self {
            inner: Some(inner),
            ratio,
            left: Vec::with_capacity(RESAMPLE_CHUNK * 2),
            right: Vec::with_capacity(RESAMPLE_CHUNK * 2),
            delay_skip: delay,
            frames_in: 0,
            frames_out: 0,
        })
    }

    /// Feed input frames, appending any produced output frames to `out`
    pub fn push(&mut self, frames: &[StereoSample], out: &mut Vec<StereoSample>) -> MixerResult<()> {
        if self.inner.is_none() {
            out.extend_from_slice(frames);
            return Ok(());
        };
        self.frames_in += frames.len() as u64;

        for s in frames {
            self.left.push(s.left);
            self.right.push(s.right);
        }

        loop {
            let inner = self.inner.as_mut().expect("checked above");
            let take = inner.input_frames_next();
            if self.left.len() < take {
                break;
            }
            let wave_in = [&self.left[..take], &self.right[..take]];
            let produced = inner
                .process(&wave_in, None)
                .map_err(|e| MixerError::DecodeFault(format!("resample: {}", e)))?;
            self.left.drain(..take);
            self.right.drain(..take);
            self.emit(&produced, out);
        }

        Ok(())
    }

    /// Drain buffered input and the filter delay line
    ///
    /// Emits exactly enough frames that the total output matches the total
    /// input scaled by the rate ratio.
    pub fn flush(&mut self, out: &mut Vec<StereoSample>) -> MixerResult<()> {
        if self.inner.is_none() || self.frames_in == 0 {
            return Ok(());
        }
        let target = (self.frames_in as f64 * self.ratio).round() as u64;
        let flush_start = out.len();

        if !self.left.is_empty() {
            let inner = self.inner.as_mut().expect("checked above");
            let wave_in = [self.left.as_slice(), self.right.as_slice()];
            let produced = inner
                .process_partial(Some(&wave_in), None)
                .map_err(|e| MixerError::DecodeFault(format!("resample: {}", e)))?;
            self.left.clear();
            self.right.clear();
            self.emit(&produced, out);
        }

        // The delay compensation holds back the tail; feed zero blocks until
        // it has fully drained.
        while self.frames_out < target {
            let inner = self.inner.as_mut().expect("checked above");
            let produced = inner
                .process_partial::<&[f32]>(None, None)
                .map_err(|e| MixerError::DecodeFault(format!("resample: {}", e)))?;
            if produced[0].is_empty() {
                break;
            }
            self.emit(&produced, out);
        }

        // Trim zero-padding past the exact output length
        let excess = (self.frames_out.saturating_sub(target)) as usize;
        if excess > 0 && out.len() - flush_start >= excess {
            out.truncate(out.len() - excess);
            self.frames_out = target;
        }

        Ok(())
    }

    /// Discard buffered input and filter state (after a seek)
    pub fn reset(&mut self) {
        if let Some(inner) = self.inner.as_mut() {
            inner.reset();
            self.delay_skip = inner.output_delay();
        }
        self.left.clear();
        self.right.clear();
        self.frames_in = 0;
        self.frames_out = 0;
    }

    /// Whether this resampler changes the rate at all
    pub fn is_passthrough(&self) -> bool {
        self.inner.is_none()
    }

    fn emit(&mut self, planar: &[Vec<f32>], out: &mut Vec<StereoSample>) {
        let n = planar[0].len().min(planar[1].len());
        let skip = self.delay_skip.min(n);
        self.delay_skip -= skip;
        out.reserve(n - skip);
        for i in skip..n {
            out.push(StereoSample::new(planar[0][i], planar[1][i]));
        }
        self.frames_out += (n - skip) as u64;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_passthrough() {
        let mut rs = StreamResampler::new(48000, 48000).unwrap();
        assert!(rs.is_passthrough());

        let input = vec![StereoSample::mono(0.25); 100];
        let mut out = Vec::new();
        rs.push(&input, &mut out).unwrap();
        rs.flush(&mut out).unwrap();
        assert_eq!(out.len(), 100);
        assert_eq!(out[0].left, 0.25);
    }

    #[test]
    fn test_upsample_doubles_frame_count() {
        let mut rs = StreamResampler::new(24000, 48000).unwrap();
        assert!(!rs.is_passthrough());

        let input = vec![StereoSample::mono(0.5); 4096];
        let mut out = Vec::new();
        rs.push(&input, &mut out).unwrap();
        rs.flush(&mut out).unwrap();
        assert_eq!(out.len(), 8192);
    }

    #[test]
    fn test_delay_compensation_aligns_content() {
        let mut rs = StreamResampler::new(44100, 48000).unwrap();
        let input = vec![StereoSample::mono(1.0); 4096];
        let mut out = Vec::new();
        rs.push(&input, &mut out).unwrap();
        rs.flush(&mut out).unwrap();

        // Content starts at frame 0, not after the filter delay
        assert!(!out.is_empty());
        let lead: f32 = out.iter().take(32).map(|s| s.left.abs()).sum();
        assert!(lead > 1.0, "leading frames are silent: {}", lead);
    }

    #[test]
    fn test_reset_discards_pending() {
        let mut rs = StreamResampler::new(44100, 48000).unwrap();
        let input = vec![StereoSample::mono(1.0); 100]; // less than one block
        let mut out = Vec::new();
        rs.push(&input, &mut out).unwrap();
        assert!(out.is_empty());

        rs.reset();
        rs.flush(&mut out).unwrap();
        assert!(out.is_empty());
    }
}
