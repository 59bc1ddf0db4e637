//! WAV decoding via hound
//!
//! WAV gets its own backend rather than going through symphonia: it is the
//! dominant format for short sound effects, and hound decodes it with no
//! probe or packet machinery at all.

use std::time::Duration;

use hound::{SampleFormat, WavReader};

use polymix_core::decode::{Decoder, DecoderBackend, MediaStream};
use polymix_core::error::{MixerError, MixerResult};
use polymix_core::types::{StereoSample, StreamSpec};

/// Backend recognizing RIFF/WAVE containers
pub struct WavBackend;

impl DecoderBackend for WavBackend {
    fn name(&self) -> &'static str {
        "wav"
    }

    fn probe(&self, header: &[u8]) -> u8 {
        if header.len() >= 12 && &header[0..4] == b"RIFF" && &header[8..12] == b"WAVE" {
            255
        } else {
            0
        }
    }

    fn open(&self, stream: Box<dyn MediaStream>) -> MixerResult<Box<dyn Decoder>> {
        let reader = WavReader::new(stream)
            .map_err(|e| MixerError::UnsupportedFormat(format!("wav: {}", e)))?;
        let spec = reader.spec();
        if spec.channels == 0 {
            return Err(MixerError::UnsupportedFormat("wav: zero channels".into()));
        }
        log::debug!(
            "wav: {} ch, {}Hz, {}-bit {:?}",
            spec.channels,
            spec.sample_rate,
            spec.bits_per_sample,
            spec.sample_format
        );
        Ok(Box::new(WavDecoder {
            total_frames: reader.duration(),
            reader,
        }))
    }
}

struct WavDecoder {
    reader: WavReader<Box<dyn MediaStream>>,
    total_frames: u32,
}

impl WavDecoder {
    /// Pull one frame's worth of channel samples; channels past the first
    /// two are read and discarded
    fn next_frame<S, F>(&mut self, convert: F) -> MixerResult<Option<StereoSample>>
    where
        S: hound::Sample,
        F: Fn(S) -> f32,
    {
        let channels = self.reader.spec().channels as usize;
        let mut frame = [0.0f32; 2];
        let mut samples = self.reader.samples::<S>();
        for ch in 0..channels {
            match samples.next() {
                Some(Ok(value)) => {
                    if ch < 2 {
                        frame[ch] = convert(value);
                    }
                }
                Some(Err(e)) => {
                    return Err(MixerError::DecodeFault(format!("wav: {}", e)));
                }
                None => return Ok(None),
            }
        }
        if channels == 1 {
            Ok(Some(StereoSample::mono(frame[0])))
        } else {
            Ok(Some(StereoSample::new(frame[0], frame[1])))
        }
    }
}

impl Decoder for WavDecoder {
    fn spec(&self) -> StreamSpec {
        let spec = self.reader.spec();
        StreamSpec {
            rate: spec.sample_rate,
            channels: spec.channels.min(2),
        }
    }

    fn duration(&self) -> Option<Duration> {
        Some(Duration::from_secs_f64(
            self.total_frames as f64 / self.reader.spec().sample_rate as f64,
        ))
    }

    fn decode(&mut self, out: &mut [StereoSample]) -> MixerResult<usize> {
        let spec = self.reader.spec();
        let scale = match spec.sample_format {
            SampleFormat::Float => 1.0,
            SampleFormat::Int => (1i64 << (spec.bits_per_sample - 1)) as f32,
        };

        let mut written = 0;
        while written < out.len() {
            let frame = match spec.sample_format {
                SampleFormat::Float => self.next_frame::<f32, _>(|v| v)?,
                SampleFormat::Int => self.next_frame::<i32, _>(|v| v as f32 / scale)?,
            };
            match frame {
                Some(sample) => {
                    out[written] = sample;
                    written += 1;
                }
                None => break,
            }
        }
        Ok(written)
    }

    fn seek(&mut self, position: Duration) -> MixerResult<()> {
        let frame = (position.as_secs_f64() * self.reader.spec().sample_rate as f64) as u32;
        if frame > self.total_frames {
            return Err(MixerError::InvalidArgument(format!(
                "wav: seek past end: {:?}",
                position
            )));
        }
        self.reader
            .seek(frame)
            .map_err(|e| MixerError::DecodeFault(format!("wav seek: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn wav_fixture(spec: hound::WavSpec, frames: usize) -> Vec<u8> {
        let mut cursor = Cursor::new(Vec::new());
        {
            let mut writer = hound::WavWriter::new(&mut cursor, spec).unwrap();
            for i in 0..frames {
                for _ in 0..spec.channels {
                    match spec.sample_format {
                        SampleFormat::Int => {
                            writer.write_sample((i as i32 % 100) * 300).unwrap()
                        }
                        SampleFormat::Float => {
                            writer.write_sample(i as f32 / frames as f32).unwrap()
                        }
                    }
                }
            }
            writer.finalize().unwrap();
        }
        cursor.into_inner()
    }

    fn int_spec(channels: u16) -> hound::WavSpec {
        hound::WavSpec {
            channels,
            sample_rate: 44100,
            bits_per_sample: 16,
            sample_format: SampleFormat::Int,
        }
    }

    #[test]
    fn test_probe_recognizes_riff_wave() {
        let bytes = wav_fixture(int_spec(2), 10);
        assert_eq!(WavBackend.probe(&bytes[..12]), 255);
        assert_eq!(WavBackend.probe(b"OggS etc etc"), 0);
        assert_eq!(WavBackend.probe(b"RIFF"), 0);
    }

    #[test]
    fn test_decode_stereo_int() {
        let bytes = wav_fixture(int_spec(2), 500);
        let mut decoder = WavBackend
            .open(Box::new(Cursor::new(bytes)))
            .unwrap();

        assert_eq!(decoder.spec(), StreamSpec { rate: 44100, channels: 2 });

        let mut out = vec![StereoSample::silence(); 600];
        let n = decoder.decode(&mut out).unwrap();
        assert_eq!(n, 500);
        // Frame 1 holds 300/32768 in both channels
        assert!((out[1].left - 300.0 / 32768.0).abs() < 1e-6);
        assert_eq!(out[1].left, out[1].right);
        assert_eq!(decoder.decode(&mut out).unwrap(), 0);
    }

    #[test]
    fn test_decode_mono_duplicates() {
        let bytes = wav_fixture(int_spec(1), 64);
        let mut decoder = WavBackend
            .open(Box::new(Cursor::new(bytes)))
            .unwrap();

        let mut out = vec![StereoSample::silence(); 64];
        assert_eq!(decoder.decode(&mut out).unwrap(), 64);
        assert_eq!(out[3].left, out[3].right);
    }

    #[test]
    fn test_seek_rewinds() {
        let bytes = wav_fixture(int_spec(2), 1000);
        let mut decoder = WavBackend
            .open(Box::new(Cursor::new(bytes)))
            .unwrap();

        let mut out = vec![StereoSample::silence(); 1000];
        decoder.decode(&mut out).unwrap();

        decoder.seek(Duration::ZERO).unwrap();
        assert_eq!(decoder.decode(&mut out).unwrap(), 1000);

        assert!(decoder.seek(Duration::from_secs(10)).is_err());
    }

    #[test]
    fn test_duration_reported() {
        let bytes = wav_fixture(int_spec(2), 44100);
        let decoder = WavBackend
            .open(Box::new(Cursor::new(bytes)))
            .unwrap();
        assert_eq!(decoder.duration(), Some(Duration::from_secs(1)));
    }
}
