//! Group queries over the channel pool
//!
//! Groups are not stored anywhere: a group is just the set of channels
//! whose tag atomic currently holds a given value, so membership can never
//! drift out of sync with the channels themselves. Queries scan the shared
//! atomics and work identically from the control thread and the audio
//! thread. A tag of -1 selects every channel.

use super::channel::ChannelAtomics;

/// Read-only view answering group membership questions
pub struct GroupQuery<'a> {
    channels: &'a [ChannelAtomics],
}

impl<'a> GroupQuery<'a> {
    pub fn new(channels: &'a [ChannelAtomics]) -> Self {
        Self { channels }
    }

    fn matches(&self, index: usize, tag: i32) -> bool {
        tag == -1 || self.channels[index].tag() == tag
    }

    /// Channels carrying `tag`, active or not
    pub fn count(&self, tag: i32) -> usize {
        (0..self.channels.len())
            .filter(|&i| self.matches(i, tag))
            .count()
    }

    /// Active (playing, paused or fading) channels carrying `tag`
    pub fn active_count(&self, tag: i32) -> usize {
        (0..self.channels.len())
            .filter(|&i| self.matches(i, tag) && self.channels[i].state().is_active())
            .count()
    }

    /// Lowest-index idle channel carrying `tag`
    pub fn available(&self, tag: i32) -> Option<usize> {
        (0..self.channels.len())
            .find(|&i| self.matches(i, tag) && !self.channels[i].state().is_active())
    }

    /// Active channel carrying `tag` that started earliest
    pub fn oldest(&self, tag: i32) -> Option<usize> {
        (0..self.channels.len())
            .filter(|&i| self.matches(i, tag) && self.channels[i].state().is_active())
            .min_by_key(|&i| self.channels[i].start_seq())
    }

    /// Active channel carrying `tag` that started most recently
    pub fn newest(&self, tag: i32) -> Option<usize> {
        (0..self.channels.len())
            .filter(|&i| self.matches(i, tag) && self.channels[i].state().is_active())
            .max_by_key(|&i| self.channels[i].start_seq())
    }
}
