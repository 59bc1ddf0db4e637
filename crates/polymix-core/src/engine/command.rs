//! Lock-free command queue for real-time mixer control
//!
//! The control thread pushes commands into a bounded SPSC ring; the audio
//! thread drains the ring once at the top of every mixdown tick. Neither
//! side ever blocks or allocates, so a burst of control calls cannot cause
//! an audible dropout.
//!
//! Commands only carry state changes the audio thread must apply at a tick
//! boundary. Continuously-read values (channel volume, tags, chunk volume)
//! live in shared atomics instead and never travel through the queue.

use basedrop::Shared;

use crate::chunk::ChunkData;
use crate::effect::{Effect, EffectId, EffectSlot};
use crate::types::StereoSample;

use super::stream::StreamSource;

/// Hook run over the final mix of every tick, after the post chain
pub type PostMixFn = dyn FnMut(&mut [StereoSample]) + Send;

/// Request data for starting chunk playback on a reserved channel
///
/// Boxed in the command enum to keep the enum itself small for
/// cache-efficient queueing.
pub struct PlayChunkRequest {
    pub channel: usize,
    pub chunk: Shared<ChunkData>,
    /// Extra plays after the first; -1 loops forever
    pub loops: i32,
    /// Hard stop after this many frames, counting only unpaused time
    pub expire_frames: Option<u64>,
    /// Fade-in ramp length; 0 starts at full gain
    pub fade_frames: u64,
}

/// Request data for starting streamed playback on a reserved channel
pub struct PlayStreamRequest {
    pub channel: usize,
    pub source: StreamSource,
    pub expire_frames: Option<u64>,
    pub fade_frames: u64,
}

/// Request data for attaching an effect to a slot's chain
pub struct RegisterEffectRequest {
    pub slot: EffectSlot,
    pub id: EffectId,
    pub effect: Box<dyn Effect>,
}

/// Request data for starting the music slot
pub struct PlayMusicRequest {
    pub source: StreamSource,
    pub fade_frames: u64,
}

/// Commands sent from the control thread to the audio thread
///
/// Each variant is one atomic operation, applied at the start of a tick so
/// no state changes mid-window. Channel indices arrive pre-validated; a
/// tag of -1 never matches, so group commands with it are no-ops.
pub enum MixerCommand {
    // ─────────────────────────────────────────────────────────────
    // Channel Playback
    // ─────────────────────────────────────────────────────────────
    /// Begin chunk playback on a channel the control thread reserved
    PlayChunk(Box<PlayChunkRequest>),
    /// Begin streamed playback on a channel the control thread reserved
    PlayStream(Box<PlayStreamRequest>),
    /// Stop a channel immediately; -1 stops every channel
    HaltChannel { channel: i32 },
    /// Stop every channel carrying `tag`
    HaltGroup { tag: i32 },
    /// Begin a fade-out; the channel stops when the ramp reaches zero
    FadeOutChannel { channel: i32, frames: u64 },
    /// Fade out every channel carrying `tag`
    FadeOutGroup { tag: i32, frames: u64 },
    /// Schedule a hard stop `frames` of unpaused playback from now
    ExpireChannel { channel: i32, frames: u64 },
    /// Suspend playback; position, fades and expiry all freeze
    PauseChannel { channel: i32 },
    /// Resume a paused channel exactly where it stopped
    ResumeChannel { channel: i32 },
    /// Pause every channel carrying `tag`
    PauseGroup { tag: i32 },
    /// Resume every paused channel carrying `tag`
    ResumeGroup { tag: i32 },

    // ─────────────────────────────────────────────────────────────
    // Spatial Parameters
    // ─────────────────────────────────────────────────────────────
    /// Set per-side attenuation (255 = unity, 0 = silent)
    SetPanning { channel: usize, left: u8, right: u8 },
    /// Set distance attenuation (0 = near, 255 = inaudible)
    SetDistance { channel: usize, distance: u8 },

    // ─────────────────────────────────────────────────────────────
    // Effects
    // ─────────────────────────────────────────────────────────────
    /// Append an effect to a slot's chain
    RegisterEffect(Box<RegisterEffectRequest>),
    /// Remove one effect from a slot's chain by id
    UnregisterEffect { slot: EffectSlot, id: EffectId },
    /// Drop a slot's whole chain, reporting each effect done
    UnregisterAllEffects { slot: EffectSlot },
    /// Install or clear the raw post-mix hook
    SetPostMix { hook: Option<Box<PostMixFn>> },

    // ─────────────────────────────────────────────────────────────
    // Music Slot
    // ─────────────────────────────────────────────────────────────
    /// Replace the music slot with a new stream
    PlayMusic(Box<PlayMusicRequest>),
    /// Stop music immediately and release its stream
    HaltMusic,
    /// Fade music out over `frames`, then stop
    FadeOutMusic { frames: u64 },
    /// Suspend music playback
    PauseMusic,
    /// Resume paused music
    ResumeMusic,
}

/// Capacity of the command queue
///
/// Bulk group operations fan out on the audio side, so even busy control
/// threads send a handful of commands per tick. 1024 gives headroom for
/// bursts like registering a full effect rack at load time.
pub const COMMAND_QUEUE_CAPACITY: usize = 1024;

/// Create the command channel (producer/consumer pair)
///
/// The producer side belongs to the control thread, the consumer to the
/// audio thread.
pub fn command_channel() -> (rtrb::Producer<MixerCommand>, rtrb::Consumer<MixerCommand>) {
    rtrb::RingBuffer::new(COMMAND_QUEUE_CAPACITY)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_channel_roundtrip() {
        let (mut tx, mut rx) = command_channel();

        tx.push(MixerCommand::HaltChannel { channel: 3 }).unwrap();

        let cmd = rx.pop().unwrap();
        assert!(matches!(cmd, MixerCommand::HaltChannel { channel: 3 }));
    }

    #[test]
    fn test_command_channel_empty() {
        let (_tx, mut rx) = command_channel();

        assert!(rx.pop().is_err());
    }

    #[test]
    fn test_command_size() {
        // Keep MixerCommand small for cache efficiency in the ringbuffer.
        // Play requests and effect registrations carry real payloads and
        // must stay boxed.
        let size = std::mem::size_of::<MixerCommand>();
        assert!(size <= 40, "MixerCommand is {} bytes, expected <= 40", size);
    }
}
