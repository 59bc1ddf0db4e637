//! Real-time mixdown engine
//!
//! Everything the audio thread owns lives here: the channel pool, the music
//! slot, the command and event queues, streamed-source plumbing and the
//! deferred-free collector. The control-thread surface is
//! [`crate::Mixer`]; the shared atomics types exported from this module are
//! how the two sides observe each other without locks.

mod channel;
#[allow(clippy::module_inception)]
mod engine;
mod events;
mod group;
mod music;
mod stream;

pub(crate) mod command;
pub(crate) mod gc;

pub use channel::{ChannelAtomics, ChannelState};
pub use engine::{MixerEngine, MAX_BUFFER_SIZE};
pub use events::MixerEvent;
pub use music::MusicAtomics;

pub(crate) use events::{event_channel, EventReceiver, EventSender};
pub(crate) use group::GroupQuery;
pub(crate) use stream::{spawn_stream, StreamHandle};
