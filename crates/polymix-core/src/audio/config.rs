//! Audio backend configuration

use crate::types::DEFAULT_CHANNELS;

/// Default buffer size when no preference is specified (frames)
///
/// 512 frames is a safe default that works on most systems
/// (~10.7ms at 48kHz).
pub const DEFAULT_BUFFER_SIZE: u32 = 512;

/// Preferred buffer size for the output stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BufferSize {
    /// Let the system choose
    #[default]
    Default,
    /// Request a specific size in frames (the device may adjust it)
    Fixed(u32),
}

impl BufferSize {
    /// Buffer size in frames, or None for system default
    pub fn as_frames(&self) -> Option<u32> {
        match self {
            BufferSize::Default => None,
            BufferSize::Fixed(frames) => Some(*frames),
        }
    }
}

/// Audio device identifier
///
/// Carries both the device name and the host backend (ALSA, WASAPI,
/// CoreAudio, ...) so devices can be told apart on systems with several
/// hosts available.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceId {
    /// Device name as reported by the system
    pub name: String,
    /// Audio host identifier; None uses the default host
    pub host: Option<String>,
}

impl DeviceId {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), host: None }
    }

    pub fn with_host(name: &str, host: &str) -> Self {
        Self {
            name: name.to_string(),
            host: Some(host.to_string()),
        }
    }

    /// Display label including the host if known
    pub fn display_label(&self) -> String {
        match &self.host {
            Some(host) => format!("[{}] {}", host, self.name),
            None => self.name.clone(),
        }
    }
}

/// Configuration for the audio output
#[derive(Debug, Clone)]
pub struct AudioConfig {
    /// Output device (None = system default)
    pub device: Option<DeviceId>,
    /// Preferred sample rate; the device rate wins if it differs, and
    /// sources are resampled at load/stream time
    pub sample_rate: Option<u32>,
    /// Preferred stream buffer size
    pub buffer_size: BufferSize,
    /// Size of the mixing channel pool
    pub channels: usize,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            device: None,
            sample_rate: None,
            buffer_size: BufferSize::Default,
            channels: DEFAULT_CHANNELS,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_id_labels() {
        assert_eq!(DeviceId::new("Speakers").display_label(), "Speakers");
        assert_eq!(
            DeviceId::with_host("hw:0,0", "ALSA").display_label(),
            "[ALSA] hw:0,0"
        );
    }

    #[test]
    fn test_buffer_size_frames() {
        assert_eq!(BufferSize::Default.as_frames(), None);
        assert_eq!(BufferSize::Fixed(256).as_frames(), Some(256));
    }
}
