//! Completion events flowing from the audio thread back to control
//!
//! The inverse of the command queue: a bounded SPSC ring the audio thread
//! pushes into and the control thread drains via [`crate::Mixer::poll_event`].
//! Pushing never blocks; if the control thread stops polling and the ring
//! fills up, further events are dropped and counted.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::effect::{EffectId, EffectSlot};

/// Things the audio thread finished on its own schedule
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MixerEvent {
    /// A channel reached the end of playback, by any route: natural end,
    /// halt, expiry, or a fade-out completing. Exactly one per playback.
    ChannelFinished { channel: usize },
    /// The music slot reached the end of playback
    MusicFinished,
    /// An effect left its chain and was dropped
    EffectDone { slot: EffectSlot, id: EffectId },
}

/// Capacity of the event queue
///
/// A full halt of a large channel pool with deep effect chains is the worst
/// burst; 256 covers it many times over.
pub const EVENT_QUEUE_CAPACITY: usize = 256;

/// Audio-thread side: pushes events, never blocks
pub struct EventSender {
    queue: rtrb::Producer<MixerEvent>,
    dropped: Arc<AtomicU64>,
}

impl EventSender {
    pub fn send(&mut self, event: MixerEvent) {
        if self.queue.push(event).is_err() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }
}

/// Control-thread side: drains events on demand
pub struct EventReceiver {
    queue: rtrb::Consumer<MixerEvent>,
    dropped: Arc<AtomicU64>,
}

impl EventReceiver {
    pub fn poll(&mut self) -> Option<MixerEvent> {
        self.queue.pop().ok()
    }

    /// Events lost to a full queue since startup
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Create the event channel (sender for the audio thread, receiver for
/// the control thread)
pub fn event_channel() -> (EventSender, EventReceiver) {
    let (tx, rx) = rtrb::RingBuffer::new(EVENT_QUEUE_CAPACITY);
    let dropped = Arc::new(AtomicU64::new(0));
    (
        EventSender { queue: tx, dropped: Arc::clone(&dropped) },
        EventReceiver { queue: rx, dropped },
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_roundtrip() {
        let (mut tx, mut rx) = event_channel();

        tx.send(MixerEvent::ChannelFinished { channel: 5 });
        tx.send(MixerEvent::MusicFinished);

        assert_eq!(rx.poll(), Some(MixerEvent::ChannelFinished { channel: 5 }));
        assert_eq!(rx.poll(), Some(MixerEvent::MusicFinished));
        assert_eq!(rx.poll(), None);
    }

    #[test]
    fn test_overflow_drops_and_counts() {
        let (mut tx, mut rx) = event_channel();

        for _ in 0..EVENT_QUEUE_CAPACITY + 3 {
            tx.send(MixerEvent::MusicFinished);
        }

        assert_eq!(rx.dropped(), 3);
        let mut received = 0;
        while rx.poll().is_some() {
            received += 1;
        }
        assert_eq!(received, EVENT_QUEUE_CAPACITY);
    }
}
