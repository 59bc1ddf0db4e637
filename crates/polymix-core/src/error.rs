//! Engine error taxonomy
//!
//! Control-thread API calls return `Result<_, MixerError>`. The mixdown tick
//! itself never produces user-visible errors: decode faults and underruns
//! degrade to silence and are observable only through logs and counters.

use thiserror::Error;

/// Errors returned by the control-facing mixer API
#[derive(Error, Debug)]
pub enum MixerError {
    /// No decoder backend recognized the stream
    #[error("unsupported audio format: {0}")]
    UnsupportedFormat(String),

    /// All channels are busy and no specific channel was requested
    #[error("no idle channel available")]
    NoChannelAvailable,

    /// The operation is not meaningful for this decoder or channel
    /// (e.g. seeking a non-seekable stream). A capability gap, not a fault.
    #[error("operation not supported: {0}")]
    Unsupported(&'static str),

    /// Out-of-range channel index, tag, or parameter
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Corrupt data mid-stream. During playback this is treated as
    /// end-of-stream and never surfaces here; loading a chunk from corrupt
    /// data reports it directly.
    #[error("decode fault: {0}")]
    DecodeFault(String),

    /// The command queue stayed full for the bounded retry window, which
    /// means the audio thread is not draining (stalled or not running)
    #[error("command queue full; audio thread not draining")]
    QueueFull,

    /// Device boundary failure
    #[error(transparent)]
    Device(#[from] crate::audio::AudioError),
}

/// Result type for mixer operations
pub type MixerResult<T> = Result<T, MixerError>;
