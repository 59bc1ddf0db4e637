//! Decoder backends for the polymix engine
//!
//! Two backends cover the common formats: [`wav::WavBackend`] decodes RIFF
//! WAV via hound, [`symphonia::SymphoniaBackend`] handles mp3, ogg/vorbis,
//! flac and mp4/aac. Both plug into `polymix_core`'s [`DecoderRegistry`];
//! [`default_registry`] wires them up in the usual order.
//!
//! ```no_run
//! use polymix_codecs::default_registry;
//! use std::sync::Arc;
//!
//! let registry = Arc::new(default_registry());
//! ```

pub mod symphonia;
pub mod wav;

pub use crate::symphonia::SymphoniaBackend;
pub use crate::wav::WavBackend;

use polymix_core::decode::DecoderRegistry;

/// Registry with every built-in backend registered
///
/// WAV is registered first so it wins probe ties over symphonia's own
/// RIFF support.
pub fn default_registry() -> DecoderRegistry {
    let mut registry = DecoderRegistry::new();
    registry.register(Box::new(WavBackend));
    registry.register(Box::new(SymphoniaBackend));
    registry
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_registry_has_all_backends() {
        let registry = default_registry();
        assert_eq!(registry.len(), 2);
    }
}
