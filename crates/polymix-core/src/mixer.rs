//! Control-thread facade over the mixdown engine
//!
//! [`Mixer`] is the application-facing surface: loading sounds, starting and
//! stopping playback, grouping, effects and the music slot. Mutating calls
//! serialize on an internal mutex and turn into commands the audio thread
//! applies at its next tick; queries read the shared atomics directly and
//! never wait on audio.
//!
//! Channel selection happens here, not on the audio thread: `play` scans the
//! shared state blocks for the lowest-index idle channel and claims it with
//! a compare-and-swap before the start command is even queued, which is what
//! lets `play` return the chosen index synchronously.

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use crate::chunk::Chunk;
use crate::decode::{DecoderRegistry, MediaStream};
use crate::effect::{Effect, EffectId, EffectSlot};
use crate::engine::command::{
    command_channel, MixerCommand, PlayChunkRequest, PlayMusicRequest, PlayStreamRequest,
    RegisterEffectRequest,
};
use crate::engine::{
    event_channel, spawn_stream, ChannelAtomics, ChannelState, EventReceiver, GroupQuery,
    MixerEngine, MixerEvent, MusicAtomics, StreamHandle,
};
use crate::error::{MixerError, MixerResult};
use crate::types::{OutputSpec, StereoSample, MAX_VOLUME};

/// Attempts to queue a command before giving up with `QueueFull`
const PUSH_RETRIES: usize = 10;

/// Backoff between queue attempts; the audio thread drains every tick
const PUSH_BACKOFF: Duration = Duration::from_millis(1);

/// Serialized control-side state
struct MixerControl {
    commands: rtrb::Producer<MixerCommand>,
    events: EventReceiver,
    next_seq: u64,
    next_effect_id: EffectId,
    registry: Arc<DecoderRegistry>,
    /// Keeps channel stream prefetch threads alive until replaced
    channel_streams: Vec<Option<StreamHandle>>,
    music_stream: Option<StreamHandle>,
    music_tracks: usize,
}

/// The mixer's application-facing handle
///
/// Cheap queries go straight to shared atomics; everything else locks the
/// internal control state briefly. Clone-free by design: wrap it in an
/// `Arc` to share across threads.
pub struct Mixer {
    inner: Mutex<MixerControl>,
    channels: Arc<[ChannelAtomics]>,
    music: Arc<MusicAtomics>,
    spec: OutputSpec,
}

impl Mixer {
    /// Build a mixer with no device attached, returning the engine for the
    /// caller to drive
    ///
    /// This is the constructor behind [`crate::audio::start_audio_system`];
    /// it is also the right entry point for offline rendering and tests,
    /// where the caller pulls windows out of the engine directly.
    pub fn offline(
        spec: OutputSpec,
        channels: usize,
        registry: Arc<DecoderRegistry>,
    ) -> (Self, MixerEngine) {
        let atomics: Arc<[ChannelAtomics]> =
            (0..channels).map(|_| ChannelAtomics::new()).collect();
        let music = Arc::new(MusicAtomics::new());
        let (command_tx, command_rx) = command_channel();
        let (event_tx, event_rx) = event_channel();

        let engine = MixerEngine::new(
            spec,
            Arc::clone(&atomics),
            Arc::clone(&music),
            command_rx,
            event_tx,
        );

        let mixer = Self {
            inner: Mutex::new(MixerControl {
                commands: command_tx,
                events: event_rx,
                next_seq: 1,
                next_effect_id: 1,
                registry,
                channel_streams: (0..channels).map(|_| None).collect(),
                music_stream: None,
                music_tracks: 0,
            }),
            channels: atomics,
            music,
            spec,
        };
        (mixer, engine)
    }

    /// Output format the engine mixes at
    pub fn spec(&self) -> OutputSpec {
        self.spec
    }

    /// Size of the channel pool, fixed at construction
    pub fn allocated_channels(&self) -> usize {
        self.channels.len()
    }

    // ─────────────────────────────────────────────────────────────
    // Loading
    // ─────────────────────────────────────────────────────────────

    /// Decode a whole stream into a [`Chunk`] at the engine rate
    pub fn load_chunk(&self, stream: Box<dyn MediaStream>) -> MixerResult<Chunk> {
        let registry = Arc::clone(&self.lock().registry);
        let decoder = registry.open(stream)?;
        Chunk::from_decoder(decoder, self.spec)
    }

    /// Decode a file into a [`Chunk`]
    pub fn load_chunk_file(&self, path: impl AsRef<Path>) -> MixerResult<Chunk> {
        let file = std::fs::File::open(path.as_ref())
            .map_err(|e| MixerError::InvalidArgument(format!("open {:?}: {}", path.as_ref(), e)))?;
        self.load_chunk(Box::new(file))
    }

    // ─────────────────────────────────────────────────────────────
    // Channel Playback
    // ─────────────────────────────────────────────────────────────

    /// Play a chunk on the first idle channel (or on `channel` if >= 0,
    /// replacing whatever it carries). Returns the channel index.
    ///
    /// `loops` counts extra plays after the first; -1 repeats forever.
    pub fn play(&self, channel: i32, chunk: &Chunk, loops: i32) -> MixerResult<usize> {
        self.start_chunk(channel, chunk, loops, None, None)
    }

    /// [`play`](Self::play) with a hard stop after `max_time` of unpaused
    /// playback
    pub fn play_timed(
        &self,
        channel: i32,
        chunk: &Chunk,
        loops: i32,
        max_time: Duration,
    ) -> MixerResult<usize> {
        self.start_chunk(channel, chunk, loops, None, Some(max_time))
    }

    /// [`play`](Self::play) with a linear fade-in over `fade`
    pub fn fade_in(
        &self,
        channel: i32,
        chunk: &Chunk,
        loops: i32,
        fade: Duration,
    ) -> MixerResult<usize> {
        self.start_chunk(channel, chunk, loops, Some(fade), None)
    }

    /// Fade in with a hard stop after `max_time`
    pub fn fade_in_timed(
        &self,
        channel: i32,
        chunk: &Chunk,
        loops: i32,
        fade: Duration,
        max_time: Duration,
    ) -> MixerResult<usize> {
        self.start_chunk(channel, chunk, loops, Some(fade), Some(max_time))
    }

    /// Stream a long source through a channel instead of preloading it
    ///
    /// The source decodes on its own prefetch thread; the channel consumes
    /// ready frames and substitutes silence on underrun.
    pub fn play_stream(
        &self,
        channel: i32,
        stream: Box<dyn MediaStream>,
        loops: i32,
    ) -> MixerResult<usize> {
        let mut control = self.lock();
        let decoder = control.registry.open(stream)?;
        let (source, handle) = spawn_stream(decoder, self.spec, loops)?;

        let index = self.claim(channel)?;
        self.channels[index].set_start_seq(control.next_seq);
        control.next_seq += 1;

        let command = MixerCommand::PlayStream(Box::new(PlayStreamRequest {
            channel: index,
            source,
            expire_frames: None,
            fade_frames: 0,
        }));
        if let Err(e) = push(&mut control.commands, command) {
            self.channels[index].cancel_reservation();
            return Err(e);
        }
        // The old handle (if any) drops here and stops its thread
        control.channel_streams[index] = Some(handle);
        Ok(index)
    }

    fn start_chunk(
        &self,
        channel: i32,
        chunk: &Chunk,
        loops: i32,
        fade: Option<Duration>,
        max_time: Option<Duration>,
    ) -> MixerResult<usize> {
        let mut control = self.lock();
        let index = self.claim(channel)?;
        self.channels[index].set_start_seq(control.next_seq);
        control.next_seq += 1;

        let command = MixerCommand::PlayChunk(Box::new(PlayChunkRequest {
            channel: index,
            chunk: chunk.data(),
            loops,
            expire_frames: max_time.map(|d| self.frames(d)),
            fade_frames: fade.map(|d| self.frames(d)).unwrap_or(0),
        }));
        if let Err(e) = push(&mut control.commands, command) {
            self.channels[index].cancel_reservation();
            return Err(e);
        }
        Ok(index)
    }

    /// Pick the channel that will carry a new playback
    ///
    /// A non-negative `channel` is used as-is (replacing a current sound);
    /// -1 claims the lowest-index idle channel.
    fn claim(&self, channel: i32) -> MixerResult<usize> {
        if channel >= 0 {
            let index = self.check_index(channel as usize)?;
            // Reserve if idle so a concurrent play(-1) cannot grab it; a
            // busy channel is simply replaced by the start command
            self.channels[index].try_reserve();
            return Ok(index);
        }
        self.channels
            .iter()
            .position(|c| c.try_reserve())
            .ok_or(MixerError::NoChannelAvailable)
    }

    /// Stop a channel at the next tick; -1 stops all channels
    pub fn halt(&self, channel: i32) -> MixerResult<()> {
        self.check_selector(channel)?;
        self.send(MixerCommand::HaltChannel { channel })
    }

    /// Stop every channel carrying `tag`
    pub fn halt_group(&self, tag: i32) -> MixerResult<()> {
        self.send(MixerCommand::HaltGroup { tag })
    }

    /// Fade a channel out over `fade`, then stop it; -1 fades all
    pub fn fade_out(&self, channel: i32, fade: Duration) -> MixerResult<()> {
        self.check_selector(channel)?;
        self.send(MixerCommand::FadeOutChannel { channel, frames: self.frames(fade) })
    }

    /// Fade out every channel carrying `tag`
    pub fn fade_out_group(&self, tag: i32, fade: Duration) -> MixerResult<()> {
        self.send(MixerCommand::FadeOutGroup { tag, frames: self.frames(fade) })
    }

    /// Hard-stop a channel after `timeout` of further unpaused playback
    pub fn expire_channel(&self, channel: i32, timeout: Duration) -> MixerResult<()> {
        self.check_selector(channel)?;
        self.send(MixerCommand::ExpireChannel { channel, frames: self.frames(timeout) })
    }

    /// Suspend a channel; -1 pauses all. Fades and expiry freeze too.
    pub fn pause(&self, channel: i32) -> MixerResult<()> {
        self.check_selector(channel)?;
        self.send(MixerCommand::PauseChannel { channel })
    }

    /// Resume a paused channel; -1 resumes all
    pub fn resume(&self, channel: i32) -> MixerResult<()> {
        self.check_selector(channel)?;
        self.send(MixerCommand::ResumeChannel { channel })
    }

    /// Suspend every channel carrying `tag`
    pub fn pause_group(&self, tag: i32) -> MixerResult<()> {
        self.send(MixerCommand::PauseGroup { tag })
    }

    /// Resume every paused channel carrying `tag`
    pub fn resume_group(&self, tag: i32) -> MixerResult<()> {
        self.send(MixerCommand::ResumeGroup { tag })
    }

    // ─────────────────────────────────────────────────────────────
    // Channel Queries and Parameters
    // ─────────────────────────────────────────────────────────────

    /// Current lifecycle state of a channel
    pub fn channel_state(&self, channel: usize) -> MixerResult<ChannelState> {
        Ok(self.channels[self.check_index(channel)?].state())
    }

    /// Whether a channel is occupied (paused counts as occupied)
    pub fn is_playing(&self, channel: usize) -> MixerResult<bool> {
        Ok(self.channel_state(channel)?.is_active())
    }

    /// Number of occupied channels
    pub fn playing_count(&self) -> usize {
        self.channels.iter().filter(|c| c.state().is_active()).count()
    }

    /// Whether a channel is paused
    pub fn is_paused(&self, channel: usize) -> MixerResult<bool> {
        Ok(self.channel_state(channel)? == ChannelState::Paused)
    }

    /// Number of paused channels
    pub fn paused_count(&self) -> usize {
        self.channels
            .iter()
            .filter(|c| c.state() == ChannelState::Paused)
            .count()
    }

    /// Whether a channel is mid-fade (in or out)
    pub fn is_fading(&self, channel: usize) -> MixerResult<bool> {
        Ok(matches!(
            self.channel_state(channel)?,
            ChannelState::FadingIn | ChannelState::FadingOut
        ))
    }

    /// Set a channel's volume (0-128, clamped), returning the previous value
    ///
    /// A negative `volume` queries without changing. A `channel` of -1
    /// applies to every channel and returns the average of the previous
    /// values.
    pub fn set_volume(&self, channel: i32, volume: i32) -> MixerResult<u8> {
        let clamped = volume.clamp(0, MAX_VOLUME as i32) as u8;
        if channel < 0 {
            if channel != -1 {
                return Err(MixerError::InvalidArgument(format!(
                    "bad channel selector {}",
                    channel
                )));
            }
            let mut sum: u32 = 0;
            for c in self.channels.iter() {
                sum += c.volume() as u32;
                if volume >= 0 {
                    c.set_volume(clamped);
                }
            }
            return Ok((sum / self.channels.len().max(1) as u32) as u8);
        }
        let index = self.check_index(channel as usize)?;
        let previous = self.channels[index].volume();
        if volume >= 0 {
            self.channels[index].set_volume(clamped);
        }
        Ok(previous)
    }

    /// Per-side stereo attenuation (255 = unity). `(255, 255)` removes the
    /// effect of earlier calls.
    pub fn set_panning(&self, channel: usize, left: u8, right: u8) -> MixerResult<()> {
        let channel = self.check_index(channel)?;
        self.send(MixerCommand::SetPanning { channel, left, right })
    }

    /// Distance attenuation (0 = next to the listener, 255 = inaudible)
    pub fn set_distance(&self, channel: usize, distance: u8) -> MixerResult<()> {
        let channel = self.check_index(channel)?;
        self.send(MixerCommand::SetDistance { channel, distance })
    }

    /// Place a source at `angle` degrees (0 = front, 90 = right) and
    /// `distance` from the listener
    ///
    /// Computed into pan and distance gains: the facing side stays at unity
    /// and the far side attenuates with the sine of the angle, so front and
    /// rear play full on both sides.
    pub fn set_position(&self, channel: usize, angle: i16, distance: u8) -> MixerResult<()> {
        let sin = (angle as f64).rem_euclid(360.0).to_radians().sin();
        let l = (1.0 - sin) / 2.0;
        let r = (1.0 + sin) / 2.0;
        let scale = 255.0 / l.max(r);
        self.set_panning(channel, (l * scale).round() as u8, (r * scale).round() as u8)?;
        self.set_distance(channel, distance)
    }

    // ─────────────────────────────────────────────────────────────
    // Groups
    // ─────────────────────────────────────────────────────────────

    /// Tag one channel; -1 removes it from any group
    pub fn group_channel(&self, channel: usize, tag: i32) -> MixerResult<()> {
        self.channels[self.check_index(channel)?].set_tag(tag);
        Ok(())
    }

    /// Tag an inclusive range of channels
    pub fn group_channels(&self, from: usize, to: usize, tag: i32) -> MixerResult<()> {
        self.check_index(from)?;
        self.check_index(to)?;
        for index in from..=to {
            self.channels[index].set_tag(tag);
        }
        Ok(())
    }

    /// Channels carrying `tag`, occupied or not (-1 counts the whole pool)
    pub fn group_count(&self, tag: i32) -> usize {
        GroupQuery::new(&self.channels).count(tag)
    }

    /// Occupied channels carrying `tag`
    pub fn group_active_count(&self, tag: i32) -> usize {
        GroupQuery::new(&self.channels).active_count(tag)
    }

    /// Lowest-index idle channel carrying `tag`
    pub fn group_available(&self, tag: i32) -> Option<usize> {
        GroupQuery::new(&self.channels).available(tag)
    }

    /// Occupied channel carrying `tag` that started earliest
    pub fn group_oldest(&self, tag: i32) -> Option<usize> {
        GroupQuery::new(&self.channels).oldest(tag)
    }

    /// Occupied channel carrying `tag` that started most recently
    pub fn group_newest(&self, tag: i32) -> Option<usize> {
        GroupQuery::new(&self.channels).newest(tag)
    }

    // ─────────────────────────────────────────────────────────────
    // Effects
    // ─────────────────────────────────────────────────────────────

    /// Append an effect to a channel's chain or the post chain
    ///
    /// Returns an id for later removal. When the effect eventually leaves
    /// its chain, by any route, one [`MixerEvent::EffectDone`] is reported.
    pub fn register_effect(
        &self,
        slot: EffectSlot,
        effect: impl Effect + 'static,
    ) -> MixerResult<EffectId> {
        if let EffectSlot::Channel(index) = slot {
            self.check_index(index)?;
        }
        let mut control = self.lock();
        let id = control.next_effect_id;
        control.next_effect_id += 1;
        push(
            &mut control.commands,
            MixerCommand::RegisterEffect(Box::new(RegisterEffectRequest {
                slot,
                id,
                effect: Box::new(effect),
            })),
        )?;
        Ok(id)
    }

    /// Remove one effect; the EffectDone event confirms the drop
    pub fn unregister_effect(&self, slot: EffectSlot, id: EffectId) -> MixerResult<()> {
        self.send(MixerCommand::UnregisterEffect { slot, id })
    }

    /// Remove a slot's whole chain
    pub fn unregister_all_effects(&self, slot: EffectSlot) -> MixerResult<()> {
        if let EffectSlot::Channel(index) = slot {
            self.check_index(index)?;
        }
        self.send(MixerCommand::UnregisterAllEffects { slot })
    }

    /// Install a hook observing (or rewriting) the final mix of every tick,
    /// after the post chain. `None` clears it.
    pub fn set_post_mix(
        &self,
        hook: Option<impl FnMut(&mut [StereoSample]) + Send + 'static>,
    ) -> MixerResult<()> {
        self.send(MixerCommand::SetPostMix {
            hook: match hook {
                Some(h) => Some(Box::new(h)),
                None => None,
            },
        })
    }

    // ─────────────────────────────────────────────────────────────
    // Music
    // ─────────────────────────────────────────────────────────────

    /// Stream a track through the music slot
    ///
    /// Any previous track is released first, prefetch thread joined and
    /// decoder dropped, before the new stream opens.
    pub fn play_music(&self, stream: Box<dyn MediaStream>, loops: i32) -> MixerResult<()> {
        self.start_music(stream, loops, None)
    }

    /// [`play_music`](Self::play_music) with a linear fade-in
    pub fn fade_in_music(
        &self,
        stream: Box<dyn MediaStream>,
        loops: i32,
        fade: Duration,
    ) -> MixerResult<()> {
        self.start_music(stream, loops, Some(fade))
    }

    fn start_music(
        &self,
        stream: Box<dyn MediaStream>,
        loops: i32,
        fade: Option<Duration>,
    ) -> MixerResult<()> {
        let mut control = self.lock();
        let had_previous = match control.music_stream.take() {
            Some(previous) => {
                previous.shutdown();
                true
            }
            None => false,
        };
        control.music_tracks = 0;

        let spec = self.spec;
        let opened = control.registry.open(stream).and_then(|decoder| {
            let tracks = decoder.track_count();
            let (source, handle) = spawn_stream(decoder, spec, loops)?;
            Ok((source, handle, tracks))
        });
        let (source, handle, tracks) = match opened {
            Ok(opened) => opened,
            Err(e) => {
                // The previous source is still installed audio-side but its
                // prefetch thread is gone; halt it so the slot reports
                // finished instead of sitting silent in Playing forever.
                if had_previous {
                    push(&mut control.commands, MixerCommand::HaltMusic)?;
                }
                return Err(e);
            }
        };
        push(
            &mut control.commands,
            MixerCommand::PlayMusic(Box::new(PlayMusicRequest {
                source,
                fade_frames: fade.map(|d| self.frames(d)).unwrap_or(0),
            })),
        )?;
        control.music_stream = Some(handle);
        control.music_tracks = tracks;
        Ok(())
    }

    /// Stop music at the next tick
    pub fn halt_music(&self) -> MixerResult<()> {
        self.send(MixerCommand::HaltMusic)
    }

    /// Fade music out over `fade`, then stop it
    pub fn fade_out_music(&self, fade: Duration) -> MixerResult<()> {
        self.send(MixerCommand::FadeOutMusic { frames: self.frames(fade) })
    }

    pub fn pause_music(&self) -> MixerResult<()> {
        self.send(MixerCommand::PauseMusic)
    }

    pub fn resume_music(&self) -> MixerResult<()> {
        self.send(MixerCommand::ResumeMusic)
    }

    /// Lifecycle state of the music slot (Idle when nothing is playing)
    pub fn music_state(&self) -> ChannelState {
        self.music.state()
    }

    /// Set the music volume (0-128, clamped), returning the previous value;
    /// negative queries without changing
    pub fn set_music_volume(&self, volume: i32) -> u8 {
        let previous = self.music.volume();
        if volume >= 0 {
            self.music.set_volume(volume.min(MAX_VOLUME as i32) as u8);
        }
        previous
    }

    /// Playback position of the current track
    pub fn music_position(&self) -> Duration {
        Duration::from_secs_f64(
            self.music.position_frames() as f64 / self.spec.sample_rate as f64,
        )
    }

    /// Seek the current track; errors if the decoder cannot seek
    pub fn set_music_position(&self, position: Duration) -> MixerResult<()> {
        let control = self.lock();
        match &control.music_stream {
            Some(handle) => handle.seek(position),
            None => Err(MixerError::InvalidArgument("no music playing".into())),
        }
    }

    /// Duration of the current track, if its decoder reported one
    pub fn music_duration(&self) -> Option<Duration> {
        self.lock().music_stream.as_ref().and_then(|h| h.duration())
    }

    /// Sub-tracks in the current music container (1 for plain files)
    pub fn music_track_count(&self) -> usize {
        let control = self.lock();
        if control.music_stream.is_some() {
            control.music_tracks
        } else {
            0
        }
    }

    /// Switch sub-track on a multi-track music container
    pub fn select_music_track(&self, track: usize) -> MixerResult<()> {
        let control = self.lock();
        match &control.music_stream {
            Some(handle) => handle.select_track(track),
            None => Err(MixerError::InvalidArgument("no music playing".into())),
        }
    }

    // ─────────────────────────────────────────────────────────────
    // Events
    // ─────────────────────────────────────────────────────────────

    /// Next completion event from the audio thread, if any
    pub fn poll_event(&self) -> Option<MixerEvent> {
        self.lock().events.poll()
    }

    /// Events lost to a full queue since startup
    pub fn events_dropped(&self) -> u64 {
        self.lock().events.dropped()
    }

    // ─────────────────────────────────────────────────────────────
    // Internals
    // ─────────────────────────────────────────────────────────────

    fn lock(&self) -> std::sync::MutexGuard<'_, MixerControl> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn send(&self, command: MixerCommand) -> MixerResult<()> {
        push(&mut self.lock().commands, command)
    }

    fn frames(&self, duration: Duration) -> u64 {
        (duration.as_secs_f64() * self.spec.sample_rate as f64) as u64
    }

    fn check_index(&self, channel: usize) -> MixerResult<usize> {
        if channel < self.channels.len() {
            Ok(channel)
        } else {
            Err(MixerError::InvalidArgument(format!(
                "channel {} out of range (pool has {})",
                channel,
                self.channels.len()
            )))
        }
    }

    fn check_selector(&self, channel: i32) -> MixerResult<()> {
        if channel == -1 {
            Ok(())
        } else if channel >= 0 {
            self.check_index(channel as usize).map(|_| ())
        } else {
            Err(MixerError::InvalidArgument(format!(
                "bad channel selector {}",
                channel
            )))
        }
    }
}

/// Queue a command with bounded retry; the audio thread drains every tick,
/// so a persistently full queue means it has stalled
fn push(producer: &mut rtrb::Producer<MixerCommand>, command: MixerCommand) -> MixerResult<()> {
    let mut command = command;
    for attempt in 0..PUSH_RETRIES {
        match producer.push(command) {
            Ok(()) => return Ok(()),
            Err(rtrb::PushError::Full(returned)) => {
                command = returned;
                if attempt + 1 < PUSH_RETRIES {
                    thread::sleep(PUSH_BACKOFF);
                }
            }
        }
    }
    log::error!("command queue stayed full after {} attempts", PUSH_RETRIES);
    Err(MixerError::QueueFull)
}
