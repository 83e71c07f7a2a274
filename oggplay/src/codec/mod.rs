//! Boundary to external bitstream decoders.
//!
//! The demuxer never decodes codec payloads itself. Once headers are
//! negotiated it asks a [`CodecBackend`] for one decoder per elementary
//! stream and feeds it packets in arrival order.

use crate::structs::audio::AudioCodecInfo;
use crate::structs::frame::{FrameLayout, PlaneBuffer};
use crate::structs::packet::Packet;
use crate::structs::theora::TheoraInfo;
use crate::utils::errors::CodecError;

pub mod null;

/// Result of decoding one video packet.
#[derive(Debug, Clone)]
pub enum DecodedPicture {
    /// Luma and two chroma planes.
    Picture([PlaneBuffer; 3]),
    /// The packet repeats the previous picture.
    Duplicate,
}

pub trait VideoDecoder {
    fn decode(&mut self, packet: &Packet) -> Result<DecodedPicture, CodecError>;

    /// Called on flush; the next packet may not follow the previous one.
    fn reset(&mut self) {}
}

pub trait AudioDecoder {
    /// Decodes one packet to non-interleaved samples, one `Vec` per channel.
    fn decode(&mut self, packet: &Packet) -> Result<Vec<Vec<f32>>, CodecError>;

    fn reset(&mut self) {}
}

/// Negotiated video stream description handed to the backend.
pub struct VideoSetup<'a> {
    pub info: &'a TheoraInfo,
    pub layout: &'a FrameLayout,
    /// Header packets in stream order.
    pub headers: &'a [Packet],
}

/// Negotiated audio stream description handed to the backend.
pub struct AudioSetup<'a> {
    pub info: &'a AudioCodecInfo,
    pub headers: &'a [Packet],
}

pub trait CodecBackend {
    fn video_decoder(&self, setup: &VideoSetup) -> Result<Box<dyn VideoDecoder>, CodecError>;

    fn audio_decoder(&self, setup: &AudioSetup) -> Result<Box<dyn AudioDecoder>, CodecError>;
}
