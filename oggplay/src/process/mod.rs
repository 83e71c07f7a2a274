/// Page synchronisation over a chunked byte stream.
///
/// Provides the [`PageSync`](sync::PageSync) iterator, which recovers
/// checksummed [`Page`](crate::structs::page::Page) objects from arbitrary
/// chunks and resynchronises after corruption or repositioning.
pub mod sync;

/// Packet assembly per logical stream.
pub mod stream;

/// Stream classification and header negotiation.
///
/// Provides the [`Negotiator`](negotiate::Negotiator), which claims each
/// beginning-of-stream page for a codec and runs its header bootstrap.
pub mod negotiate;

/// Queries against a negotiated index stream.
pub mod index;

/// Steady-state decoding to timestamped buffers.
///
/// Provides the [`Decoder`](decode::Decoder) facade that owns the whole
/// pipeline, from raw input bytes to [`FrameBuffer`](crate::structs::frame::FrameBuffer)
/// and [`AudioBuffer`](crate::structs::audio::AudioBuffer) output.
pub mod decode;

/// Which stream kinds the decoder negotiates, and how strictly anomalies
/// are treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecoderOptions {
    /// Claim video streams. When false they are ignored like unknown ones.
    pub video: bool,
    /// Claim audio streams.
    pub audio: bool,
    /// Anomalies at or above this level are returned as errors instead of
    /// being logged.
    pub fail_level: log::Level,
}

impl Default for DecoderOptions {
    fn default() -> Self {
        Self {
            video: true,
            audio: true,
            fail_level: log::Level::Error,
        }
    }
}
