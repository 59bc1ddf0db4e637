//! Compressed-format decoding via symphonia
//!
//! One backend covers mp3, ogg/vorbis, flac and mp4/aac. The container is
//! probed once at open; decode then walks packets, converts each decoded
//! buffer to interleaved f32 and carries any overflow into the next call so
//! the output window never truncates a packet.

use std::io::{Read, Seek, SeekFrom};
use std::time::Duration;

use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{Decoder as SymphoniaDecoder, DecoderOptions, CODEC_TYPE_NULL};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::{FormatOptions, FormatReader, SeekMode, SeekTo, Track};
use symphonia::core::io::{MediaSource, MediaSourceStream};
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;
use symphonia::core::units::Time;

use polymix_core::decode::{Decoder, DecoderBackend, MediaStream};
use polymix_core::error::{MixerError, MixerResult};
use polymix_core::types::{StereoSample, StreamSpec};

/// Backend recognizing ogg, flac, mp4 and mp3 streams
pub struct SymphoniaBackend;

impl DecoderBackend for SymphoniaBackend {
    fn name(&self) -> &'static str {
        "symphonia"
    }

    fn probe(&self, header: &[u8]) -> u8 {
        if header.starts_with(b"OggS") || header.starts_with(b"fLaC") {
            return 255;
        }
        // MP4/M4A: 'ftyp' at offset 4
        if header.len() >= 8 && &header[4..8] == b"ftyp" {
            return 255;
        }
        // MP3 with an ID3v2 tag
        if header.starts_with(b"ID3") {
            return 200;
        }
        // Bare MP3 frame sync; weak evidence, many binaries start with 0xFF
        if header.len() >= 2 && header[0] == 0xFF && header[1] & 0xE0 == 0xE0 {
            return 140;
        }
        0
    }

    fn open(&self, stream: Box<dyn MediaStream>) -> MixerResult<Box<dyn Decoder>> {
        let source = MediaSourceStream::new(
            Box::new(SourceAdapter { inner: stream }),
            Default::default(),
        );

        let probed = symphonia::default::get_probe()
            .format(
                &Hint::new(),
                source,
                &FormatOptions { enable_gapless: true, ..Default::default() },
                &MetadataOptions::default(),
            )
            .map_err(|e| MixerError::UnsupportedFormat(format!("symphonia: {}", e)))?;

        let format = probed.format;
        let audio_tracks: Vec<u32> = format
            .tracks()
            .iter()
            .filter(|t| t.codec_params.codec != CODEC_TYPE_NULL)
            .map(|t| t.id)
            .collect();
        let track_id = *audio_tracks
            .first()
            .ok_or_else(|| MixerError::UnsupportedFormat("symphonia: no audio track".into()))?;

        let mut decoder = StreamingDecoder {
            format,
            decoder: None,
            audio_tracks,
            track_id,
            carry: Vec::new(),
            carry_pos: 0,
            sample_buf: None,
        };
        decoder.make_decoder()?;
        Ok(Box::new(decoder))
    }
}

/// Adapts a [`MediaStream`] to symphonia's `MediaSource`
struct SourceAdapter {
    inner: Box<dyn MediaStream>,
}

impl Read for SourceAdapter {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.inner.read(buf)
    }
}

impl Seek for SourceAdapter {
    fn seek(&mut self, pos: SeekFrom) -> std::io::Result<u64> {
        self.inner.seek(pos)
    }
}

impl MediaSource for SourceAdapter {
    fn is_seekable(&self) -> bool {
        true
    }

    fn byte_len(&self) -> Option<u64> {
        None
    }
}

struct StreamingDecoder {
    format: Box<dyn FormatReader>,
    decoder: Option<Box<dyn SymphoniaDecoder>>,
    /// Ids of every audio track in the container
    audio_tracks: Vec<u32>,
    /// Track currently being decoded
    track_id: u32,
    /// Frames decoded beyond the previous output window
    carry: Vec<StereoSample>,
    carry_pos: usize,
    sample_buf: Option<SampleBuffer<f32>>,
}

impl StreamingDecoder {
    fn track(&self) -> &Track {
        // track_id always comes from audio_tracks, which came from format
        self.format
            .tracks()
            .iter()
            .find(|t| t.id == self.track_id)
            .expect("selected track exists")
    }

    fn make_decoder(&mut self) -> MixerResult<()> {
        let params = self.track().codec_params.clone();
        let decoder = symphonia::default::get_codecs()
            .make(&params, &DecoderOptions::default())
            .map_err(|e| MixerError::UnsupportedFormat(format!("symphonia codec: {}", e)))?;
        self.decoder = Some(decoder);
        Ok(())
    }

    /// Decode packets until at least one frame is carried, or EOS
    fn refill(&mut self) -> MixerResult<bool> {
        self.carry.clear();
        self.carry_pos = 0;

        loop {
            let packet = match self.format.next_packet() {
                Ok(packet) => packet,
                Err(SymphoniaError::IoError(e))
                    if e.kind() == std::io::ErrorKind::UnexpectedEof =>
                {
                    return Ok(false);
                }
                Err(SymphoniaError::ResetRequired) => {
                    self.make_decoder()?;
                    continue;
                }
                Err(e) => {
                    return Err(MixerError::DecodeFault(format!("symphonia: {}", e)));
                }
            };
            if packet.track_id() != self.track_id {
                continue;
            }

            let decoder = self.decoder.as_mut().expect("decoder present");
            let decoded = match decoder.decode(&packet) {
                Ok(decoded) => decoded,
                Err(SymphoniaError::DecodeError(e)) => {
                    // Bad packet; symphonia convention is to skip it
                    log::debug!("skipping undecodable packet: {}", e);
                    continue;
                }
                Err(e) => {
                    return Err(MixerError::DecodeFault(format!("symphonia: {}", e)));
                }
            };

            let spec = *decoded.spec();
            let channels = spec.channels.count();
            if channels == 0 || decoded.frames() == 0 {
                continue;
            }

            let buf = self
                .sample_buf
                .get_or_insert_with(|| SampleBuffer::new(decoded.capacity() as u64, spec));
            if buf.capacity() < decoded.frames() * channels {
                *buf = SampleBuffer::new(decoded.capacity() as u64, spec);
            }
            buf.copy_interleaved_ref(decoded);

            let interleaved = buf.samples();
            self.carry.reserve(interleaved.len() / channels);
            for frame in interleaved.chunks_exact(channels) {
                self.carry.push(if channels == 1 {
                    StereoSample::mono(frame[0])
                } else {
                    StereoSample::new(frame[0], frame[1])
                });
            }
            if !self.carry.is_empty() {
                return Ok(true);
            }
        }
    }
}

impl Decoder for StreamingDecoder {
    fn spec(&self) -> StreamSpec {
        let params = &self.track().codec_params;
        StreamSpec {
            rate: params.sample_rate.unwrap_or(44100),
            channels: params
                .channels
                .map(|c| c.count().min(2) as u16)
                .unwrap_or(2),
        }
    }

    fn duration(&self) -> Option<Duration> {
        let params = &self.track().codec_params;
        let frames = params.n_frames?;
        let rate = params.sample_rate?;
        Some(Duration::from_secs_f64(frames as f64 / rate as f64))
    }

    fn decode(&mut self, out: &mut [StereoSample]) -> MixerResult<usize> {
        let mut written = 0;
        while written < out.len() {
            if self.carry_pos >= self.carry.len() {
                if !self.refill()? {
                    break;
                }
            }
            let n = (self.carry.len() - self.carry_pos).min(out.len() - written);
            out[written..written + n]
                .copy_from_slice(&self.carry[self.carry_pos..self.carry_pos + n]);
            self.carry_pos += n;
            written += n;
        }
        Ok(written)
    }

    fn seek(&mut self, position: Duration) -> MixerResult<()> {
        self.format
            .seek(
                SeekMode::Coarse,
                SeekTo::Time {
                    time: Time::from(position.as_secs_f64()),
                    track_id: Some(self.track_id),
                },
            )
            .map_err(|e| MixerError::DecodeFault(format!("symphonia seek: {}", e)))?;
        if let Some(decoder) = &mut self.decoder {
            decoder.reset();
        }
        self.carry.clear();
        self.carry_pos = 0;
        Ok(())
    }

    fn track_count(&self) -> usize {
        self.audio_tracks.len()
    }

    fn select_track(&mut self, track: usize) -> MixerResult<()> {
        let id = *self.audio_tracks.get(track).ok_or_else(|| {
            MixerError::InvalidArgument(format!(
                "track {} out of range ({} audio tracks)",
                track,
                self.audio_tracks.len()
            ))
        })?;
        self.track_id = id;
        self.make_decoder()?;
        // Restart from the top of the newly selected track
        self.seek(Duration::ZERO)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_probe_magics() {
        assert_eq!(SymphoniaBackend.probe(b"OggS\0\0\0\0rest"), 255);
        assert_eq!(SymphoniaBackend.probe(b"fLaC\0\0\0\0"), 255);
        assert_eq!(SymphoniaBackend.probe(b"\0\0\0\x20ftypM4A "), 255);
        assert_eq!(SymphoniaBackend.probe(b"ID3\x04\0\0\0"), 200);
        assert_eq!(SymphoniaBackend.probe(&[0xFF, 0xFB, 0x90, 0x00]), 140);
        assert_eq!(SymphoniaBackend.probe(b"RIFFxxxxWAVE"), 0);
        assert_eq!(SymphoniaBackend.probe(b"O"), 0);
    }
}
