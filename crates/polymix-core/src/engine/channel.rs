//! Per-channel playback state and the channel mix routine
//!
//! Each channel splits in two: a [`ChannelAtomics`] block shared with the
//! control thread, and a [`Channel`] owned exclusively by the audio thread.
//! The split keeps a strict writer discipline per field so neither side
//! needs a lock:
//!
//! - `state`: the control thread only performs the Idle -> Reserved CAS
//!   when claiming a channel for `play`; every other transition is written
//!   by the audio thread.
//! - `volume` and `tag`: written by the control thread, read by the audio
//!   thread once per tick.
//! - `start_seq`: written by the control thread at reservation time, read
//!   by both sides for oldest/newest group queries.

use std::sync::atomic::{AtomicI32, AtomicU8, AtomicU64, Ordering};

use basedrop::Shared;

use crate::chunk::ChunkData;
use crate::effect::EffectChain;
use crate::types::{volume_to_gain, StereoSample, MAX_VOLUME};

use super::events::{EventSender, MixerEvent};
use super::stream::StreamSource;

/// Lifecycle of a mixer channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    /// Free for the next `play`
    Idle,
    /// Claimed by the control thread; the start command is in flight
    Reserved,
    Playing,
    Paused,
    FadingIn,
    FadingOut,
}

impl ChannelState {
    pub(crate) fn code(self) -> u8 {
        match self {
            ChannelState::Idle => 0,
            ChannelState::Reserved => 1,
            ChannelState::Playing => 2,
            ChannelState::Paused => 3,
            ChannelState::FadingIn => 4,
            ChannelState::FadingOut => 5,
        }
    }

    pub(crate) fn from_code(code: u8) -> Self {
        match code {
            1 => ChannelState::Reserved,
            2 => ChannelState::Playing,
            3 => ChannelState::Paused,
            4 => ChannelState::FadingIn,
            5 => ChannelState::FadingOut,
            _ => ChannelState::Idle,
        }
    }

    /// Occupied in any way: counts toward "playing" for group queries,
    /// paused included
    pub fn is_active(self) -> bool {
        !matches!(self, ChannelState::Idle)
    }
}

/// Control-visible mirror of one channel
pub struct ChannelAtomics {
    state: AtomicU8,
    volume: AtomicU8,
    tag: AtomicI32,
    start_seq: AtomicU64,
}

impl ChannelAtomics {
    pub fn new() -> Self {
        Self {
            state: AtomicU8::new(ChannelState::Idle.code()),
            volume: AtomicU8::new(MAX_VOLUME),
            tag: AtomicI32::new(-1),
            start_seq: AtomicU64::new(0),
        }
    }

    pub fn state(&self) -> ChannelState {
        ChannelState::from_code(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn set_state(&self, state: ChannelState) {
        self.state.store(state.code(), Ordering::Release);
    }

    /// Claim an idle channel for an imminent start command. Returns false
    /// if another caller or the audio thread got there first.
    pub(crate) fn try_reserve(&self) -> bool {
        self.state
            .compare_exchange(
                ChannelState::Idle.code(),
                ChannelState::Reserved.code(),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Release a reservation that never turned into a start command
    pub(crate) fn cancel_reservation(&self) {
        let _ = self.state.compare_exchange(
            ChannelState::Reserved.code(),
            ChannelState::Idle.code(),
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    pub fn volume(&self) -> u8 {
        self.volume.load(Ordering::Relaxed)
    }

    pub(crate) fn set_volume(&self, volume: u8) {
        self.volume.store(volume.min(MAX_VOLUME), Ordering::Relaxed);
    }

    pub fn tag(&self) -> i32 {
        self.tag.load(Ordering::Relaxed)
    }

    pub(crate) fn set_tag(&self, tag: i32) {
        self.tag.store(tag, Ordering::Relaxed);
    }

    pub fn start_seq(&self) -> u64 {
        self.start_seq.load(Ordering::Relaxed)
    }

    pub(crate) fn set_start_seq(&self, seq: u64) {
        self.start_seq.store(seq, Ordering::Relaxed);
    }
}

impl Default for ChannelAtomics {
    fn default() -> Self {
        Self::new()
    }
}

/// What a channel is reading samples from
pub(crate) enum ChannelSource {
    Chunk { data: Shared<ChunkData>, cursor: usize },
    Stream(StreamSource),
}

/// Linear gain ramp, counted in unpaused frames
#[derive(Clone, Copy)]
pub(crate) enum Fade {
    None,
    In { remaining: u64, total: u64 },
    Out { remaining: u64, total: u64 },
}

/// Audio-thread side of one channel
pub(crate) struct Channel {
    source: Option<ChannelSource>,
    paused: bool,
    fade: Fade,
    /// Extra plays after the current one; -1 loops forever. Streams loop
    /// on their prefetch thread, so this stays 0 for them.
    loops: i32,
    /// Unpaused frames left before a hard stop
    expire: Option<u64>,
    left: u8,
    right: u8,
    distance: u8,
    pub effects: EffectChain,
}

impl Channel {
    pub fn new() -> Self {
        Self {
            source: None,
            paused: false,
            fade: Fade::None,
            loops: 0,
            expire: None,
            left: 255,
            right: 255,
            distance: 0,
            effects: EffectChain::new(),
        }
    }

    pub fn is_active(&self) -> bool {
        self.source.is_some()
    }

    pub fn is_paused(&self) -> bool {
        self.paused && self.source.is_some()
    }

    pub fn start_chunk(
        &mut self,
        atomics: &ChannelAtomics,
        data: Shared<ChunkData>,
        loops: i32,
        expire: Option<u64>,
        fade_frames: u64,
    ) {
        self.begin(
            atomics,
            ChannelSource::Chunk { data, cursor: 0 },
            loops,
            expire,
            fade_frames,
        );
    }

    pub fn start_stream(
        &mut self,
        atomics: &ChannelAtomics,
        source: StreamSource,
        expire: Option<u64>,
        fade_frames: u64,
    ) {
        self.begin(atomics, ChannelSource::Stream(source), 0, expire, fade_frames);
    }

    fn begin(
        &mut self,
        atomics: &ChannelAtomics,
        source: ChannelSource,
        loops: i32,
        expire: Option<u64>,
        fade_frames: u64,
    ) {
        self.source = Some(source);
        self.paused = false;
        self.loops = loops;
        self.expire = expire;
        if fade_frames > 0 {
            self.fade = Fade::In { remaining: fade_frames, total: fade_frames };
            atomics.set_state(ChannelState::FadingIn);
        } else {
            self.fade = Fade::None;
            atomics.set_state(ChannelState::Playing);
        }
    }

    /// Stop immediately, releasing the source and the effect chain
    pub fn halt(&mut self, index: usize, atomics: &ChannelAtomics, events: &mut EventSender) {
        if self.source.is_some() {
            self.finish(index, atomics, events);
        }
    }

    /// Begin a fade-out; a shorter fade already underway is left alone
    pub fn fade_out(&mut self, atomics: &ChannelAtomics, frames: u64) {
        if self.source.is_none() {
            return;
        }
        if frames == 0 {
            // Caller turns this into a halt; keep the state machine simple
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

    pub fn expire_in(&mut self, frames: u64) {
        if self.source.is_some() {
            self.expire = Some(match self.expire {
                Some(current) => current.min(frames),
                None => frames,
            });
        }
    }

    pub fn pause(&mut self, atomics: &ChannelAtomics) {
        if self.source.is_some() && !self.paused {
            self.paused = true;
            atomics.set_state(ChannelState::Paused);
        }
    }

    pub fn resume(&mut self, atomics: &ChannelAtomics) {
        if self.source.is_some() && self.paused {
            self.paused = false;
            atomics.set_state(self.running_state());
        }
    }

    pub fn set_panning(&mut self, left: u8, right: u8) {
        self.left = left;
        self.right = right;
    }

    pub fn set_distance(&mut self, distance: u8) {
        self.distance = distance;
    }

    fn running_state(&self) -> ChannelState {
        match self.fade {
            Fade::None => ChannelState::Playing,
            Fade::In { .. } => ChannelState::FadingIn,
            Fade::Out { .. } => ChannelState::FadingOut,
        }
    }

    /// Mix one window into `out`, using `scratch` as working space
    ///
    /// `scratch` must be at least `out.len()` frames. Paused channels
    /// return immediately; their fades and expiry stay frozen.
    pub fn mix(
        &mut self,
        index: usize,
        atomics: &ChannelAtomics,
        scratch: &mut [StereoSample],
        out: &mut [StereoSample],
        events: &mut EventSender,
    ) {
        if self.source.is_none() || self.paused || out.is_empty() {
            return;
        }

        let mut frames = out.len();
        if let Some(expire) = self.expire {
            frames = frames.min(expire as usize);
        }

        let source_gain = match &self.source {
            Some(ChannelSource::Chunk { data, .. }) => volume_to_gain(data.volume()),
            _ => 1.0,
        };

        let (got, ended) = self.fill(&mut scratch[..frames]);
        let processed = got;

        let channel_gain = volume_to_gain(atomics.volume());
        let distance_gain = (255 - self.distance) as f32 / 255.0;
        let base = source_gain * channel_gain * distance_gain;
        let left_gain = base * self.left as f32 / 255.0;
        let right_gain = base * self.right as f32 / 255.0;

        match self.fade {
            Fade::None => {
                for sample in &mut scratch[..processed] {
                    *sample = sample.scale_lr(left_gain, right_gain);
                }
            }
            Fade::In { remaining, total } => {
                let elapsed = total - remaining;
                for (i, sample) in scratch[..processed].iter_mut().enumerate() {
                    let ramp = ((elapsed + i as u64 + 1) as f32 / total as f32).min(1.0);
                    *sample = sample.scale_lr(left_gain * ramp, right_gain * ramp);
                }
            }
            Fade::Out { remaining, total } => {
                for (i, sample) in scratch[..processed].iter_mut().enumerate() {
                    let ramp = if (i as u64) < remaining {
                        (remaining - i as u64) as f32 / total as f32
                    } else {
                        0.0
                    };
                    *sample = sample.scale_lr(left_gain * ramp, right_gain * ramp);
                }
            }
        }

        self.effects.process(&mut scratch[..processed]);

        for (dst, src) in out[..processed].iter_mut().zip(&scratch[..processed]) {
            *dst += *src;
        }

        // Advance countdowns by the frames actually played
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

        if let Some(expire) = &mut self.expire {
            *expire = expire.saturating_sub(advanced);
            if *expire == 0 {
                done = true;
            }
        }

        if done {
            self.finish(index, atomics, events);
        }
    }

    /// Copy source frames into `dst`. Returns frames written and whether
    /// the source is exhausted.
    fn fill(&mut self, dst: &mut [StereoSample]) -> (usize, bool) {
        let loops = &mut self.loops;
        match self.source.as_mut().expect("fill with no source") {
            ChannelSource::Chunk { data, cursor } => {
                let total = data.frames().len();
                if total == 0 {
                    return (0, true);
                }
                let mut got = 0;
                loop {
                    let n = (total - *cursor).min(dst.len() - got);
                    dst[got..got + n].copy_from_slice(&data.frames()[*cursor..*cursor + n]);
                    *cursor += n;
                    got += n;
                    if *cursor == total {
                        if *loops != 0 {
                            if *loops > 0 {
                                *loops -= 1;
                            }
                            *cursor = 0;
                        } else {
                            return (got, true);
                        }
                    }
                    if got == dst.len() {
                        return (got, false);
                    }
                }
            }
            ChannelSource::Stream(stream) => {
                let pull = stream.read(dst);
                if pull.ended {
                    (pull.frames, true)
                } else {
                    // Underrun already counted by the stream; pad silence
                    // and keep the channel alive
                    dst[pull.frames..].fill(StereoSample::silence());
                    (dst.len(), false)
                }
            }
        }
    }

    /// Shared end-of-playback path: exactly one ChannelFinished per
    /// playback, whatever ended it, and the effect chain is released with
    /// one EffectDone each.
    fn finish(&mut self, index: usize, atomics: &ChannelAtomics, events: &mut EventSender) {
        // Source drops here on the audio thread: chunk frees are deferred
        // through the collector, stream drops only flip a stop flag
        self.source = None;
        self.paused = false;
        self.fade = Fade::None;
        self.loops = 0;
        self.expire = None;
        atomics.set_state(ChannelState::Idle);
        events.send(MixerEvent::ChannelFinished { channel: index });
        self.effects.unregister_all(|id| {
            events.send(MixerEvent::EffectDone {
                slot: crate::effect::EffectSlot::Channel(index),
                id,
            });
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::Chunk;
    use crate::effect::FnEffect;
    use crate::engine::events::event_channel;

    fn constant_chunk(value: f32, frames: usize) -> Shared<ChunkData> {
        Chunk::from_frames(vec![StereoSample::mono(value); frames]).data()
    }

    fn drain_finished(rx: &mut crate::engine::events::EventReceiver) -> Vec<MixerEvent> {
        let mut events = Vec::new();
        while let Some(e) = rx.poll() {
            events.push(e);
        }
        events
    }

    #[test]
    fn test_chunk_plays_to_end_with_one_event() {
        let (mut tx, mut rx) = event_channel();
        let atomics = ChannelAtomics::new();
        let mut channel = Channel::new();
        channel.start_chunk(&atomics, constant_chunk(1.0, 100), 0, None, 0);

        let mut scratch = vec![StereoSample::silence(); 64];
        let mut out = vec![StereoSample::silence(); 64];

        channel.mix(0, &atomics, &mut scratch, &mut out, &mut tx);
        assert_eq!(atomics.state(), ChannelState::Playing);
        assert_eq!(out[0].left, 1.0);

        out.fill(StereoSample::silence());
        channel.mix(0, &atomics, &mut scratch, &mut out, &mut tx);
        assert_eq!(atomics.state(), ChannelState::Idle);
        // Frames 64..100 played, remainder untouched
        assert_eq!(out[35].left, 1.0);
        assert_eq!(out[36].left, 0.0);

        let events = drain_finished(&mut rx);
        assert_eq!(events, vec![MixerEvent::ChannelFinished { channel: 0 }]);
    }

    #[test]
    fn test_loops_count_extra_plays() {
        let (mut tx, _rx) = event_channel();
        let atomics = ChannelAtomics::new();
        let mut channel = Channel::new();
        // 10-frame chunk, 3 extra plays = 40 frames total
        channel.start_chunk(&atomics, constant_chunk(1.0, 10), 3, None, 0);

        let mut scratch = vec![StereoSample::silence(); 16];
        let mut out = vec![StereoSample::silence(); 16];
        let mut played = 0;
        for _ in 0..10 {
            out.fill(StereoSample::silence());
            channel.mix(0, &atomics, &mut scratch, &mut out, &mut tx);
            played += out.iter().filter(|s| s.left != 0.0).count();
            if !channel.is_active() {
                break;
            }
        }
        assert_eq!(played, 40);
    }

    #[test]
    fn test_fade_out_ramps_to_idle() {
        let (mut tx, mut rx) = event_channel();
        let atomics = ChannelAtomics::new();
        let mut channel = Channel::new();
        channel.start_chunk(&atomics, constant_chunk(1.0, 10_000), 0, None, 0);
        channel.fade_out(&atomics, 64);
        assert_eq!(atomics.state(), ChannelState::FadingOut);

        let mut scratch = vec![StereoSample::silence(); 64];
        let mut out = vec![StereoSample::silence(); 64];
        channel.mix(0, &atomics, &mut scratch, &mut out, &mut tx);

        // Linear ramp: first frame near unity, last frame near zero
        assert!(out[0].left > 0.9);
        assert!(out[63].left < 0.05);
        assert_eq!(atomics.state(), ChannelState::Idle);
        assert_eq!(
            drain_finished(&mut rx),
            vec![MixerEvent::ChannelFinished { channel: 0 }]
        );
    }

    #[test]
    fn test_fade_in_reaches_full_gain() {
        let (mut tx, _rx) = event_channel();
        let atomics = ChannelAtomics::new();
        let mut channel = Channel::new();
        channel.start_chunk(&atomics, constant_chunk(1.0, 10_000), 0, None, 32);
        assert_eq!(atomics.state(), ChannelState::FadingIn);

        let mut scratch = vec![StereoSample::silence(); 64];
        let mut out = vec![StereoSample::silence(); 64];
        channel.mix(0, &atomics, &mut scratch, &mut out, &mut tx);

        assert!(out[0].left < 0.1);
        assert_eq!(out[40].left, 1.0);
        assert_eq!(atomics.state(), ChannelState::Playing);
    }

    #[test]
    fn test_expiry_hard_stops() {
        let (mut tx, mut rx) = event_channel();
        let atomics = ChannelAtomics::new();
        let mut channel = Channel::new();
        channel.start_chunk(&atomics, constant_chunk(1.0, 10_000), 0, Some(50), 0);

        let mut scratch = vec![StereoSample::silence(); 64];
        let mut out = vec![StereoSample::silence(); 64];
        channel.mix(0, &atomics, &mut scratch, &mut out, &mut tx);

        assert_eq!(out[49].left, 1.0);
        assert_eq!(out[50].left, 0.0);
        assert!(!channel.is_active());
        assert_eq!(
            drain_finished(&mut rx),
            vec![MixerEvent::ChannelFinished { channel: 0 }]
        );
    }

    #[test]
    fn test_pause_freezes_fade_and_expiry() {
        let (mut tx, _rx) = event_channel();
        let atomics = ChannelAtomics::new();
        let mut channel = Channel::new();
        channel.start_chunk(&atomics, constant_chunk(1.0, 10_000), 0, Some(100), 0);
        channel.fade_out(&atomics, 1000);
        channel.pause(&atomics);
        assert_eq!(atomics.state(), ChannelState::Paused);

        let mut scratch = vec![StereoSample::silence(); 64];
        let mut out = vec![StereoSample::silence(); 64];
        channel.mix(0, &atomics, &mut scratch, &mut out, &mut tx);

        // Nothing mixed, nothing counted down
        assert_eq!(out[0].left, 0.0);
        assert!(channel.is_active());

        channel.resume(&atomics);
        assert_eq!(atomics.state(), ChannelState::FadingOut);
    }

    #[test]
    fn test_panning_and_distance_attenuate() {
        let (mut tx, _rx) = event_channel();
        let atomics = ChannelAtomics::new();
        let mut channel = Channel::new();
        channel.start_chunk(&atomics, constant_chunk(1.0, 1000), 0, None, 0);
        channel.set_panning(255, 0);
        channel.set_distance(128);

        let mut scratch = vec![StereoSample::silence(); 16];
        let mut out = vec![StereoSample::silence(); 16];
        channel.mix(0, &atomics, &mut scratch, &mut out, &mut tx);

        let expected = (255 - 128) as f32 / 255.0;
        assert!((out[0].left - expected).abs() < 1e-6);
        assert_eq!(out[0].right, 0.0);
    }

    #[test]
    fn test_finish_releases_effects_with_done_events() {
        let (mut tx, mut rx) = event_channel();
        let atomics = ChannelAtomics::new();
        let mut channel = Channel::new();
        channel.start_chunk(&atomics, constant_chunk(1.0, 8), 0, None, 0);
        channel
            .effects
            .register(7, Box::new(FnEffect::new("half", |buf| {
                for s in buf {
                    *s *= 0.5;
                }
            })));

        let mut scratch = vec![StereoSample::silence(); 16];
        let mut out = vec![StereoSample::silence(); 16];
        channel.mix(3, &atomics, &mut scratch, &mut out, &mut tx);

        assert_eq!(out[0].left, 0.5);
        let events = drain_finished(&mut rx);
        assert_eq!(
            events,
            vec![
                MixerEvent::ChannelFinished { channel: 3 },
                MixerEvent::EffectDone {
                    slot: crate::effect::EffectSlot::Channel(3),
                    id: 7
                },
            ]
        );
        assert!(channel.effects.is_empty());
    }

    #[test]
    fn test_reserve_is_exclusive() {
        let atomics = ChannelAtomics::new();
        assert!(atomics.try_reserve());
        assert!(!atomics.try_reserve());
        atomics.cancel_reservation();
        assert!(atomics.try_reserve());
    }
}
