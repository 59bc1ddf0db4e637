//! The music slot - one streamed track outside the channel pool
//!
//! Music mixes after the channels and before the post chain. It carries its
//! own volume and fade state but no panning, distance or per-slot effects;
//! those belong to the post chain. Opening a new track always releases the
//! previous one first, so at most one music decoder is ever alive.

use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};

use crate::types::{volume_to_gain, StereoSample, MAX_VOLUME};

use super::channel::{ChannelState, Fade};
use super::events::{EventSender, MixerEvent};
use super::stream::StreamSource;

/// Control-visible mirror of the music slot
///
/// Reuses the channel state codes; Reserved never occurs here because music
/// has no reservation step.
pub struct MusicAtomics {
    state: AtomicU8,
    volume: AtomicU8,
    /// Playback position in output-rate frames, updated once per tick
    position: AtomicU64,
}

impl MusicAtomics {
    pub fn new() -> Self {
        Self {
            state: AtomicU8::new(ChannelState::Idle.code()),
            volume: AtomicU8::new(MAX_VOLUME),
            position: AtomicU64::new(0),
        }
    }

    pub fn state(&self) -> ChannelState {
        ChannelState::from_code(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: ChannelState) {
        self.state.store(state.code(), Ordering::Release);
    }

    pub fn volume(&self) -> u8 {
        self.volume.load(Ordering::Relaxed)
    }

    pub(crate) fn set_volume(&self, volume: u8) {
        self.volume.store(volume.min(MAX_VOLUME), Ordering::Relaxed);
    }

    pub fn position_frames(&self) -> u64 {
        self.position.load(Ordering::Relaxed)
    }
}

impl Default for MusicAtomics {
    fn default() -> Self {
        Self::new()
    }
}

/// Audio-thread side of the music slot
pub(crate) struct MusicPlayer {
    source: Option<StreamSource>,
    paused: bool,
    fade: Fade,
}

impl MusicPlayer {
    pub fn new() -> Self {
        Self { source: None, paused: false, fade: Fade::None }
    }

    /// Replace whatever is playing with a new stream
    pub fn play(&mut self, atomics: &MusicAtomics, source: StreamSource, fade_frames: u64) {
        // The old source drops here; its prefetch thread sees the stop
        // flag and exits
        self.source = Some(source);
        self.paused = false;
        atomics.position.store(0, Ordering::Relaxed);
        if fade_frames > 0 {
            self.fade = Fade::In { remaining: fade_frames, total: fade_frames };
            atomics.set_state(ChannelState::FadingIn);
        } else {
            self.fade = Fade::None;
            atomics.set_state(ChannelState::Playing);
        }
    }

    pub fn halt(&mut self, atomics: &MusicAtomics, events: &mut EventSender) {
        if self.source.is_some() {
            self.finish(atomics, events);
        }
    }

    pub fn fade_out(&mut self, atomics: &MusicAtomics, frames: u64) {
        if self.source.is_none() || frames == 0 {
            return;
        }
        match self.fade {
            Fade::Out { remaining, .. } if remaining <= frames => {}
            _ => {
                self.fade = Fade::Out { remaining: frames, total: frames };
                if !self.paused {
                    atomics.set_state(ChannelState::FadingOut);
                }
            }
        }
    }

    pub fn pause(&mut self, atomics: &MusicAtomics) {
        if self.source.is_some() && !self.paused {
            self.paused = true;
            atomics.set_state(ChannelState::Paused);
        }
    }

    pub fn resume(&mut self, atomics: &MusicAtomics) {
        if self.source.is_some() && self.paused {
            self.paused = false;
            atomics.set_state(match self.fade {
                Fade::None => ChannelState::Playing,
                Fade::In { .. } => ChannelState::FadingIn,
                Fade::Out { .. } => ChannelState::FadingOut,
            });
        }
    }

    /// Mix one window into `out`
    pub fn mix(
        &mut self,
        atomics: &MusicAtomics,
        scratch: &mut [StereoSample],
        out: &mut [StereoSample],
        events: &mut EventSender,
    ) {
        if self.paused || out.is_empty() {
            return;
        }
        let Some(source) = &mut self.source else {
            return;
        };

        let frames = out.len();
        let pull = source.read(&mut scratch[..frames]);
        let (processed, ended) = if pull.ended {
            (pull.frames, true)
        } else {
            scratch[pull.frames..frames].fill(StereoSample::silence());
            (frames, false)
        };

        let gain = volume_to_gain(atomics.volume());
        match self.fade {
            Fade::None => {
                for sample in &mut scratch[..processed] {
                    *sample *= gain;
                }
            }
            Fade::In { remaining, total } => {
                let elapsed = total - remaining;
                for (i, sample) in scratch[..processed].iter_mut().enumerate() {
                    let ramp = ((elapsed + i as u64 + 1) as f32 / total as f32).min(1.0);
                    *sample *= gain * ramp;
                }
            }
            Fade::Out { remaining, total } => {
                for (i, sample) in scratch[..processed].iter_mut().enumerate() {
                    let ramp = if (i as u64) < remaining {
                        (remaining - i as u64) as f32 / total as f32
                    } else {
                        0.0
                    };
                    *sample *= gain * ramp;
                }
            }
        }

        for (dst, src) in out[..processed].iter_mut().zip(&scratch[..processed]) {
            *dst += *src;
        }

        atomics.position.store(source.position(), Ordering::Relaxed);

        let advanced = processed as u64;
        let mut done = ended;
        match &mut self.fade {
            Fade::None => {}
            Fade::In { remaining, .. } => {
                *remaining = remaining.saturating_sub(advanced);
                if *remaining == 0 {
                    self.fade = Fade::None;
                    atomics.set_state(ChannelState::Playing);
                }
            }
            Fade::Out { remaining, .. } => {
                *remaining = remaining.saturating_sub(advanced);
                if *remaining == 0 {
                    done = true;
                }
            }
        }

        if done {
            self.finish(atomics, events);
        }
    }

    fn finish(&mut self, atomics: &MusicAtomics, events: &mut EventSender) {
        self.source = None;
        self.paused = false;
        self.fade = Fade::None;
        atomics.set_state(ChannelState::Idle);
        atomics.position.store(0, Ordering::Relaxed);
        events.send(MixerEvent::MusicFinished);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decode::testing::MemoryDecoder;
    use crate::engine::events::event_channel;
    use crate::engine::stream::spawn_stream;
    use crate::types::OutputSpec;
    use std::time::Duration;

    const SPEC: OutputSpec = OutputSpec { sample_rate: 48000 };

    fn open(value: f32, frames: usize) -> StreamSource {
        let decoder = Box::new(MemoryDecoder::constant(value, frames, 48000));
        let (source, handle) = spawn_stream(decoder, SPEC, 0).unwrap();
        // Handle dropped; the stop flag only fires when the source drops too
        std::mem::forget(handle);
        source
    }

    /// Run mix until the player reports finished or frames stop arriving
    fn run_to_end(
        player: &mut MusicPlayer,
        atomics: &MusicAtomics,
        tx: &mut EventSender,
    ) -> usize {
        let mut scratch = vec![StereoSample::silence(); 256];
        let mut out = vec![StereoSample::silence(); 256];
        let mut audible = 0;
        for _ in 0..10_000 {
            out.fill(StereoSample::silence());
            player.mix(atomics, &mut scratch, &mut out, tx);
            audible += out.iter().filter(|s| s.left != 0.0).count();
            if atomics.state() == ChannelState::Idle {
                return audible;
            }
            std::thread::sleep(Duration::from_micros(200));
        }
        panic!("music never finished");
    }

    #[test]
    fn test_music_plays_to_end() {
        let (mut tx, mut rx) = event_channel();
        let atomics = MusicAtomics::new();
        let mut player = MusicPlayer::new();

        player.play(&atomics, open(1.0, 5000), 0);
        assert_eq!(atomics.state(), ChannelState::Playing);

        let audible = run_to_end(&mut player, &atomics, &mut tx);
        assert_eq!(audible, 5000);
        assert_eq!(rx.poll(), Some(MixerEvent::MusicFinished));
        assert_eq!(rx.poll(), None);
    }

    #[test]
    fn test_replacing_music_keeps_single_slot() {
        let (mut tx, mut rx) = event_channel();
        let atomics = MusicAtomics::new();
        let mut player = MusicPlayer::new();

        player.play(&atomics, open(0.25, 100_000), 0);
        player.play(&atomics, open(0.75, 2000), 0);

        let mut scratch = vec![StereoSample::silence(); 64];
        let mut out = vec![StereoSample::silence(); 64];
        // Wait for the second stream's prefetch
        for _ in 0..1000 {
            out.fill(StereoSample::silence());
            player.mix(&atomics, &mut scratch, &mut out, &mut tx);
            if out[0].left != 0.0 {
                break;
            }
            std::thread::sleep(Duration::from_micros(200));
        }
        assert_eq!(out[0].left, 0.75);
        // Replacement is not a finish; no event until the track ends
        assert_eq!(rx.poll(), None);
    }

    #[test]
    fn test_halt_reports_finished() {
        let (mut tx, mut rx) = event_channel();
        let atomics = MusicAtomics::new();
        let mut player = MusicPlayer::new();

        player.play(&atomics, open(1.0, 100_000), 0);
        player.halt(&atomics, &mut tx);

        assert_eq!(atomics.state(), ChannelState::Idle);
        assert_eq!(rx.poll(), Some(MixerEvent::MusicFinished));
    }

    #[test]
    fn test_pause_resume_restores_fade_state() {
        let (mut tx, _rx) = event_channel();
        let atomics = MusicAtomics::new();
        let mut player = MusicPlayer::new();

        player.play(&atomics, open(1.0, 100_000), 0);
        player.fade_out(&atomics, 48_000);
        player.pause(&atomics);
        assert_eq!(atomics.state(), ChannelState::Paused);

        let mut scratch = vec![StereoSample::silence(); 64];
        let mut out = vec![StereoSample::silence(); 64];
        player.mix(&atomics, &mut scratch, &mut out, &mut tx);
        assert_eq!(out[0].left, 0.0);

        player.resume(&atomics);
        assert_eq!(atomics.state(), ChannelState::FadingOut);
    }
}
