//! The mixdown engine - owned exclusively by the audio thread
//!
//! One [`MixerEngine::process`] call renders one output window:
//!
//! 1. Drain the command queue and apply every pending command.
//! 2. Mix each active channel into the window (source frames, gains,
//!    fades, per-channel effect chain).
//! 3. Mix the music slot.
//! 4. Run the post effect chain over the summed window, then the raw
//!    post-mix hook.
//! 5. Advance the frame clock.
//!
//! Nothing in this path locks, blocks or allocates. All heap the tick
//! touches was allocated up front or arrives through commands; anything it
//! releases is either deferred through the collector or trivial to drop.

use std::sync::Arc;

use crate::effect::{EffectChain, EffectSlot};
use crate::types::{OutputSpec, StereoSample};

use super::channel::{Channel, ChannelAtomics};
use super::command::{MixerCommand, PostMixFn};
use super::events::{EventSender, MixerEvent};
use super::music::{MusicAtomics, MusicPlayer};

/// Largest window processed in one pass; bigger callbacks are split
pub const MAX_BUFFER_SIZE: usize = 8192;

pub struct MixerEngine {
    channels: Vec<Channel>,
    atomics: Arc<[ChannelAtomics]>,
    music: MusicPlayer,
    music_atomics: Arc<MusicAtomics>,
    post_chain: EffectChain,
    post_mix: Option<Box<PostMixFn>>,
    commands: rtrb::Consumer<MixerCommand>,
    events: EventSender,
    scratch: Vec<StereoSample>,
    frame_clock: u64,
    spec: OutputSpec,
}

impl MixerEngine {
    pub(crate) fn new(
        spec: OutputSpec,
        atomics: Arc<[ChannelAtomics]>,
        music_atomics: Arc<MusicAtomics>,
        commands: rtrb::Consumer<MixerCommand>,
        events: EventSender,
    ) -> Self {
        Self {
            channels: (0..atomics.len()).map(|_| Channel::new()).collect(),
            atomics,
            music: MusicPlayer::new(),
            music_atomics,
            post_chain: EffectChain::new(),
            post_mix: None,
            commands,
            events,
            scratch: vec![StereoSample::silence(); MAX_BUFFER_SIZE],
            frame_clock: 0,
            spec,
        }
    }

    pub fn spec(&self) -> OutputSpec {
        self.spec
    }

    /// Frames rendered since startup
    pub fn frame_clock(&self) -> u64 {
        self.frame_clock
    }

    /// Render one output window of silence-plus-everything-active
    pub fn process(&mut self, out: &mut [StereoSample]) {
        self.drain_commands();

        for window in out.chunks_mut(MAX_BUFFER_SIZE) {
            window.fill(StereoSample::silence());

            for index in 0..self.channels.len() {
                self.channels[index].mix(
                    index,
                    &self.atomics[index],
                    &mut self.scratch,
                    window,
                    &mut self.events,
                );
            }

            self.music.mix(
                &self.music_atomics,
                &mut self.scratch,
                window,
                &mut self.events,
            );

            self.post_chain.process(window);
            if let Some(hook) = &mut self.post_mix {
                hook(window);
            }

            self.frame_clock += window.len() as u64;
        }
    }

    fn drain_commands(&mut self) {
        while let Ok(command) = self.commands.pop() {
            self.apply(command);
        }
    }

    fn apply(&mut self, command: MixerCommand) {
        match command {
            MixerCommand::PlayChunk(req) => {
                let index = req.channel;
                // Replacing a busy channel still finishes its old playback
                self.channels[index].halt(index, &self.atomics[index], &mut self.events);
                self.channels[index].start_chunk(
                    &self.atomics[index],
                    req.chunk,
                    req.loops,
                    req.expire_frames,
                    req.fade_frames,
                );
            }
            MixerCommand::PlayStream(req) => {
                let index = req.channel;
                self.channels[index].halt(index, &self.atomics[index], &mut self.events);
                self.channels[index].start_stream(
                    &self.atomics[index],
                    req.source,
                    req.expire_frames,
                    req.fade_frames,
                );
            }
            MixerCommand::HaltChannel { channel } => {
                self.each_selected(channel, |c, i, a, ev| c.halt(i, a, ev));
            }
            MixerCommand::HaltGroup { tag } => {
                self.each_tagged(tag, |c, i, a, ev| c.halt(i, a, ev));
            }
            MixerCommand::FadeOutChannel { channel, frames } => {
                if frames == 0 {
                    self.each_selected(channel, |c, i, a, ev| c.halt(i, a, ev));
                } else {
                    self.each_selected(channel, |c, _, a, _| c.fade_out(a, frames));
                }
            }
            MixerCommand::FadeOutGroup { tag, frames } => {
                if frames == 0 {
                    self.each_tagged(tag, |c, i, a, ev| c.halt(i, a, ev));
                } else {
                    self.each_tagged(tag, |c, _, a, _| c.fade_out(a, frames));
                }
            }
            MixerCommand::ExpireChannel { channel, frames } => {
                if frames == 0 {
                    self.each_selected(channel, |c, i, a, ev| c.halt(i, a, ev));
                } else {
                    self.each_selected(channel, |c, _, _, _| c.expire_in(frames));
                }
            }
            MixerCommand::PauseChannel { channel } => {
                self.each_selected(channel, |c, _, a, _| c.pause(a));
            }
            MixerCommand::ResumeChannel { channel } => {
                self.each_selected(channel, |c, _, a, _| c.resume(a));
            }
            MixerCommand::PauseGroup { tag } => {
                self.each_tagged(tag, |c, _, a, _| c.pause(a));
            }
            MixerCommand::ResumeGroup { tag } => {
                self.each_tagged(tag, |c, _, a, _| c.resume(a));
            }
            MixerCommand::SetPanning { channel, left, right } => {
                self.channels[channel].set_panning(left, right);
            }
            MixerCommand::SetDistance { channel, distance } => {
                self.channels[channel].set_distance(distance);
            }
            MixerCommand::RegisterEffect(req) => match req.slot {
                EffectSlot::Channel(index) => {
                    self.channels[index].effects.register(req.id, req.effect);
                }
                EffectSlot::Post => {
                    self.post_chain.register(req.id, req.effect);
                }
            },
            MixerCommand::UnregisterEffect { slot, id } => {
                let removed = match slot {
                    EffectSlot::Channel(index) => self.channels[index].effects.unregister(id),
                    EffectSlot::Post => self.post_chain.unregister(id),
                };
                if removed {
                    self.events.send(MixerEvent::EffectDone { slot, id });
                }
            }
            MixerCommand::UnregisterAllEffects { slot } => {
                let events = &mut self.events;
                let chain = match slot {
                    EffectSlot::Channel(index) => &mut self.channels[index].effects,
                    EffectSlot::Post => &mut self.post_chain,
                };
                chain.unregister_all(|id| events.send(MixerEvent::EffectDone { slot, id }));
            }
            MixerCommand::SetPostMix { hook } => {
                self.post_mix = hook;
            }
            MixerCommand::PlayMusic(req) => {
                self.music.play(&self.music_atomics, req.source, req.fade_frames);
            }
            MixerCommand::HaltMusic => {
                self.music.halt(&self.music_atomics, &mut self.events);
            }
            MixerCommand::FadeOutMusic { frames } => {
                if frames == 0 {
                    self.music.halt(&self.music_atomics, &mut self.events);
                } else {
                    self.music.fade_out(&self.music_atomics, frames);
                }
            }
            MixerCommand::PauseMusic => {
                self.music.pause(&self.music_atomics);
            }
            MixerCommand::ResumeMusic => {
                self.music.resume(&self.music_atomics);
            }
        }
    }

    /// Apply `op` to one channel, or to all of them when `channel` is -1
    fn each_selected(
        &mut self,
        channel: i32,
        mut op: impl FnMut(&mut Channel, usize, &ChannelAtomics, &mut EventSender),
    ) {
        if channel < 0 {
            for index in 0..self.channels.len() {
                op(
                    &mut self.channels[index],
                    index,
                    &self.atomics[index],
                    &mut self.events,
                );
            }
        } else {
            let index = channel as usize;
            op(
                &mut self.channels[index],
                index,
                &self.atomics[index],
                &mut self.events,
            );
        }
    }

    /// Apply `op` to every channel carrying `tag` (-1 matches all)
    fn each_tagged(
        &mut self,
        tag: i32,
        mut op: impl FnMut(&mut Channel, usize, &ChannelAtomics, &mut EventSender),
    ) {
        for index in 0..self.channels.len() {
            if tag == -1 || self.atomics[index].tag() == tag {
                op(
                    &mut self.channels[index],
                    index,
                    &self.atomics[index],
                    &mut self.events,
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::Chunk;
    use crate::effect::FnEffect;
    use crate::engine::channel::ChannelState;
    use crate::engine::command::{command_channel, PlayChunkRequest, RegisterEffectRequest};
    use crate::engine::events::{event_channel, EventReceiver};

    struct Rig {
        engine: MixerEngine,
        atomics: Arc<[ChannelAtomics]>,
        commands: rtrb::Producer<MixerCommand>,
        events: EventReceiver,
    }

    fn rig(channels: usize) -> Rig {
        let atomics: Arc<[ChannelAtomics]> =
            (0..channels).map(|_| ChannelAtomics::new()).collect();
        let music = Arc::new(MusicAtomics::new());
        let (cmd_tx, cmd_rx) = command_channel();
        let (ev_tx, ev_rx) = event_channel();
        Rig {
            engine: MixerEngine::new(
                OutputSpec { sample_rate: 48000 },
                Arc::clone(&atomics),
                music,
                cmd_rx,
                ev_tx,
            ),
            atomics,
            commands: cmd_tx,
            events: ev_rx,
        }
    }

    fn play(rig: &mut Rig, channel: usize, value: f32, frames: usize) {
        assert!(rig.atomics[channel].try_reserve());
        rig.commands
            .push(MixerCommand::PlayChunk(Box::new(PlayChunkRequest {
                channel,
                chunk: Chunk::from_frames(vec![StereoSample::mono(value); frames]).data(),
                loops: 0,
                expire_frames: None,
                fade_frames: 0,
            })))
            .unwrap();
    }

    #[test]
    fn test_channels_sum_into_window() {
        let mut rig = rig(4);
        play(&mut rig, 0, 0.25, 1000);
        play(&mut rig, 2, 0.5, 1000);

        let mut out = vec![StereoSample::silence(); 64];
        rig.engine.process(&mut out);

        assert!((out[0].left - 0.75).abs() < 1e-6);
        assert_eq!(rig.atomics[0].state(), ChannelState::Playing);
        assert_eq!(rig.atomics[1].state(), ChannelState::Idle);
        assert_eq!(rig.engine.frame_clock(), 64);
    }

    #[test]
    fn test_halt_all_reports_each_channel() {
        let mut rig = rig(3);
        play(&mut rig, 0, 1.0, 10_000);
        play(&mut rig, 1, 1.0, 10_000);

        let mut out = vec![StereoSample::silence(); 64];
        rig.engine.process(&mut out);

        rig.commands
            .push(MixerCommand::HaltChannel { channel: -1 })
            .unwrap();
        rig.engine.process(&mut out);

        let mut finished: Vec<usize> = Vec::new();
        while let Some(event) = rig.events.poll() {
            if let MixerEvent::ChannelFinished { channel } = event {
                finished.push(channel);
            }
        }
        assert_eq!(finished, vec![0, 1]);
        assert_eq!(rig.atomics[0].state(), ChannelState::Idle);
    }

    #[test]
    fn test_group_fade_only_touches_tagged() {
        let mut rig = rig(4);
        play(&mut rig, 0, 1.0, 100_000);
        play(&mut rig, 1, 1.0, 100_000);
        rig.atomics[0].set_tag(7);

        let mut out = vec![StereoSample::silence(); 64];
        rig.engine.process(&mut out);

        rig.commands
            .push(MixerCommand::FadeOutGroup { tag: 7, frames: 64 })
            .unwrap();
        rig.engine.process(&mut out);

        assert_eq!(rig.atomics[0].state(), ChannelState::Idle);
        assert_eq!(rig.atomics[1].state(), ChannelState::Playing);
    }

    #[test]
    fn test_post_chain_shapes_summed_mix() {
        let mut rig = rig(2);
        play(&mut rig, 0, 0.5, 10_000);
        play(&mut rig, 1, 0.5, 10_000);

        rig.commands
            .push(MixerCommand::RegisterEffect(Box::new(RegisterEffectRequest {
                slot: EffectSlot::Post,
                id: 1,
                effect: Box::new(FnEffect::new("invert", |buf: &mut [StereoSample]| {
                    for s in buf.iter_mut() {
                        *s *= -1.0;
                    }
                })),
            })))
            .unwrap();

        let mut out = vec![StereoSample::silence(); 64];
        rig.engine.process(&mut out);
        assert!((out[0].left + 1.0).abs() < 1e-6);

        rig.commands
            .push(MixerCommand::UnregisterAllEffects { slot: EffectSlot::Post })
            .unwrap();
        rig.engine.process(&mut out);
        assert!((out[0].left - 1.0).abs() < 1e-6);

        let done: Vec<MixerEvent> = std::iter::from_fn(|| rig.events.poll()).collect();
        assert_eq!(
            done,
            vec![MixerEvent::EffectDone { slot: EffectSlot::Post, id: 1 }]
        );
    }

    #[test]
    fn test_post_mix_hook_sees_final_samples() {
        let mut rig = rig(1);
        play(&mut rig, 0, 0.5, 10_000);

        let captured = Arc::new(std::sync::Mutex::new(0.0f32));
        let probe = Arc::clone(&captured);
        rig.commands
            .push(MixerCommand::SetPostMix {
                hook: Some(Box::new(move |buf: &mut [StereoSample]| {
                    *probe.lock().unwrap() = buf[0].left;
                })),
            })
            .unwrap();

        let mut out = vec![StereoSample::silence(); 64];
        rig.engine.process(&mut out);
        assert_eq!(*captured.lock().unwrap(), 0.5);
    }

    #[test]
    fn test_large_callback_splits_into_windows() {
        let mut rig = rig(1);
        play(&mut rig, 0, 1.0, MAX_BUFFER_SIZE + 100);

        let mut out = vec![StereoSample::silence(); MAX_BUFFER_SIZE + 512];
        rig.engine.process(&mut out);

        assert_eq!(out[MAX_BUFFER_SIZE + 99].left, 1.0);
        assert_eq!(out[MAX_BUFFER_SIZE + 100].left, 0.0);
        assert_eq!(rig.engine.frame_clock(), (MAX_BUFFER_SIZE + 512) as u64);
    }
}
