use std::sync::Arc;

use crate::structs::opus::{self, OPUS_SAMPLE_RATE, OpusHead};
use crate::structs::vorbis::{self, VorbisInfo};

/// Channel count and output sample rate, fixed once audio headers are
/// complete.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AudioLayout {
    pub channels: u8,
    pub sample_rate: u32,
}

/// Identification data of the negotiated audio codec.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AudioCodecInfo {
    Vorbis(VorbisInfo),
    Opus(OpusHead),
}

impl AudioCodecInfo {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Vorbis(_) => "vorbis",
            Self::Opus(_) => "opus",
        }
    }

    pub fn layout(&self) -> AudioLayout {
        match self {
            Self::Vorbis(info) => AudioLayout {
                channels: info.channels,
                sample_rate: info.rate,
            },
            Self::Opus(head) => AudioLayout {
                channels: head.channels,
                sample_rate: OPUS_SAMPLE_RATE,
            },
        }
    }

    /// Samples to drop from the start of the stream.
    pub fn pre_skip(&self) -> u64 {
        match self {
            Self::Vorbis(_) => 0,
            Self::Opus(head) => head.pre_skip as u64,
        }
    }

    pub fn granule_time(&self, granule: i64) -> f64 {
        match self {
            Self::Vorbis(info) => info.granule_time(granule),
            Self::Opus(head) => head.granule_time(granule),
        }
    }

    /// Samples `data` decodes to, when that follows from the packet alone.
    /// Vorbis block sizes depend on the setup header modes, so they are not
    /// known here.
    pub fn packet_samples(&self, data: &[u8]) -> Option<i64> {
        match self {
            Self::Vorbis(_) => None,
            Self::Opus(_) => opus::packet_samples(data).map(|n| n as i64),
        }
    }

    /// Whether `data` has the shape of one of this codec's header packets.
    pub fn is_header_packet(&self, data: &[u8]) -> bool {
        match self {
            Self::Vorbis(_) => vorbis::is_header_packet(data),
            Self::Opus(_) => data.starts_with(b"Opus"),
        }
    }
}

/// A block of decoded audio, one sample sequence per channel.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioBuffer {
    pub layout: Arc<AudioLayout>,
    pub sample_count: usize,
    pub samples: Vec<Vec<f32>>,
    /// Time of the first sample, when the stream position is known.
    pub timestamp: Option<f64>,
}

impl AudioBuffer {
    pub fn duration(&self) -> f64 {
        self.sample_count as f64 / self.layout.sample_rate as f64
    }
}

#[test]
fn opus_layout_is_48k() {
    let info = AudioCodecInfo::Opus(OpusHead {
        channels: 1,
        pre_skip: 3840,
        ..Default::default()
    });
    assert_eq!(info.layout().sample_rate, 48_000);
    assert_eq!(info.pre_skip(), 3840);
    assert_eq!(info.granule_time(3840), 0.0);
}
