//! Effect system - in-place sample processors attached to channels or the
//! final mix
//!
//! Effects run on the audio thread, in registration order, on a channel's
//! post-volume sample window (or on the fully summed mix for the post slot).
//! Registration and removal travel through the command queue, so an effect is
//! never invoked after its unregister command has been drained, and removal
//! is reported back exactly once as an [`EffectDone`](crate::MixerEvent)
//! event.

use crate::types::StereoSample;

/// Maximum effects a single process pass is expected to carry per slot.
/// Used only to pre-size chain storage; chains grow beyond it if needed.
pub const EFFECTS_PER_SLOT_HINT: usize = 8;

/// Identifier returned by effect registration, unique per mixer instance
pub type EffectId = u64;

/// Where an effect chain hangs: one mixing channel, or the summed mix
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EffectSlot {
    /// A channel's post-volume window
    Channel(usize),
    /// The fully summed mix, after all per-channel chains
    Post,
}

/// An in-place sample transform
///
/// `process` must not assume a fixed window length and must not resize the
/// window; it is called from the audio thread, so it must not block or
/// allocate.
pub trait Effect: Send {
    /// Name for logs and diagnostics
    fn name(&self) -> &str;

    /// Transform the window in place
    fn process(&mut self, buffer: &mut [StereoSample]);
}

/// Adapter turning a closure into an [`Effect`]
pub struct FnEffect<F: FnMut(&mut [StereoSample]) + Send> {
    name: String,
    f: F,
}

impl<F: FnMut(&mut [StereoSample]) + Send> FnEffect<F> {
    pub fn new(name: impl Into<String>, f: F) -> Self {
        Self { name: name.into(), f }
    }
}

impl<F: FnMut(&mut [StereoSample]) + Send> Effect for FnEffect<F> {
    fn name(&self) -> &str {
        &self.name
    }

    fn process(&mut self, buffer: &mut [StereoSample]) {
        (self.f)(buffer)
    }
}

/// Ordered effect chain for one slot
///
/// Owned by the audio thread; all mutation happens while draining commands,
/// never during sample summation.
pub struct EffectChain {
    effects: Vec<(EffectId, Box<dyn Effect>)>,
}

impl EffectChain {
    /// Create an empty chain
    pub fn new() -> Self {
        Self {
            effects: Vec::with_capacity(EFFECTS_PER_SLOT_HINT),
        }
    }

    /// Append an effect; it runs after everything already registered
    pub fn register(&mut self, id: EffectId, effect: Box<dyn Effect>) {
        self.effects.push((id, effect));
    }

    /// Remove one effect by id, returning whether it was present
    ///
    /// The box is dropped in place; removal only ever happens at the tick
    /// boundary, between sample windows.
    pub fn unregister(&mut self, id: EffectId) -> bool {
        let before = self.effects.len();
        self.effects.retain(|(eid, _)| *eid != id);
        self.effects.len() != before
    }

    /// Remove all effects, invoking `on_removed` once per effect in order
    pub fn unregister_all(&mut self, mut on_removed: impl FnMut(EffectId)) {
        for (id, _) in self.effects.drain(..) {
            on_removed(id);
        }
    }

    /// Run the chain over the window, in registration order
    pub fn process(&mut self, buffer: &mut [StereoSample]) {
        for (_, effect) in &mut self.effects {
            effect.process(buffer);
        }
    }

    /// Number of registered effects
    pub fn len(&self) -> usize {
        self.effects.len()
    }

    /// Check if the chain is empty
    pub fn is_empty(&self) -> bool {
        self.effects.is_empty()
    }
}

impl Default for EffectChain {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gain_effect(id: &str, factor: f32) -> Box<dyn Effect> {
        Box::new(FnEffect::new(id, move |buf: &mut [StereoSample]| {
            for s in buf.iter_mut() {
                *s *= factor;
            }
        }))
    }

    #[test]
    fn test_chain_runs_in_registration_order() {
        let mut chain = EffectChain::new();
        // +1 then *2: order-sensitive
        chain.register(
            1,
            Box::new(FnEffect::new("add", |buf: &mut [StereoSample]| {
                for s in buf.iter_mut() {
                    s.left += 1.0;
                    s.right += 1.0;
                }
            })),
        );
        chain.register(2, gain_effect("double", 2.0));

        let mut window = [StereoSample::mono(1.0); 4];
        chain.process(&mut window);
        assert_eq!(window[0].left, 4.0); // (1 + 1) * 2
    }

    #[test]
    fn test_unregister_removes_exactly_one() {
        let mut chain = EffectChain::new();
        chain.register(7, gain_effect("a", 2.0));
        chain.register(8, gain_effect("b", 3.0));

        assert!(chain.unregister(7));
        assert!(!chain.unregister(7));
        assert_eq!(chain.len(), 1);

        let mut window = [StereoSample::mono(1.0); 2];
        chain.process(&mut window);
        assert_eq!(window[0].left, 3.0);
    }

    #[test]
    fn test_unregister_all_reports_each_once() {
        let mut chain = EffectChain::new();
        chain.register(1, gain_effect("a", 1.0));
        chain.register(2, gain_effect("b", 1.0));

        let mut removed = Vec::new();
        chain.unregister_all(|id| removed.push(id));
        assert_eq!(removed, vec![1, 2]);
        assert!(chain.is_empty());
    }
}
