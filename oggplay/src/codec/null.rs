//! Reference backend that produces correctly shaped output without decoding.
//!
//! Pictures are blank (black luma, neutral chroma) at the negotiated
//! geometry. Audio is silence whose length follows the packet: Opus packets
//! report their duration in the TOC byte; Vorbis packet lengths depend on
//! the setup header, so short blocks are assumed and the decode adapter
//! clips to the page granule.

use crate::codec::{
    AudioDecoder, AudioSetup, CodecBackend, DecodedPicture, VideoDecoder, VideoSetup,
};
use crate::structs::audio::AudioCodecInfo;
use crate::structs::frame::{FrameLayout, PlaneBuffer};
use crate::structs::opus::packet_samples;
use crate::structs::packet::Packet;
use crate::structs::vorbis::VorbisInfo;
use crate::utils::errors::CodecError;

#[derive(Debug, Default, Clone, Copy)]
pub struct NullBackend;

impl CodecBackend for NullBackend {
    fn video_decoder(&self, setup: &VideoSetup) -> Result<Box<dyn VideoDecoder>, CodecError> {
        Ok(Box::new(NullVideo {
            layout: *setup.layout,
        }))
    }

    fn audio_decoder(&self, setup: &AudioSetup) -> Result<Box<dyn AudioDecoder>, CodecError> {
        Ok(match setup.info {
            AudioCodecInfo::Opus(head) => Box::new(NullOpus {
                channels: head.channels as usize,
            }),
            AudioCodecInfo::Vorbis(info) => Box::new(NullVorbis::new(info)),
        })
    }
}

struct NullVideo {
    layout: FrameLayout,
}

impl VideoDecoder for NullVideo {
    fn decode(&mut self, packet: &Packet) -> Result<DecodedPicture, CodecError> {
        if packet.is_empty() {
            return Ok(DecodedPicture::Duplicate);
        }

        let luma = self.layout.frame;
        let chroma = self.layout.chroma_size();
        let (w, h) = (luma.width as usize, luma.height as usize);
        let (cw, ch) = (chroma.width as usize, chroma.height as usize);

        Ok(DecodedPicture::Picture([
            PlaneBuffer::filled(w, h, 16),
            PlaneBuffer::filled(cw, ch, 128),
            PlaneBuffer::filled(cw, ch, 128),
        ]))
    }
}

struct NullOpus {
    channels: usize,
}

impl AudioDecoder for NullOpus {
    fn decode(&mut self, packet: &Packet) -> Result<Vec<Vec<f32>>, CodecError> {
        let samples = packet_samples(&packet.data).ok_or_else(|| CodecError::Rejected {
            packet_no: packet.packet_no,
            reason: "invalid TOC".into(),
        })?;

        Ok(vec![vec![0.0; samples]; self.channels])
    }
}

struct NullVorbis {
    channels: usize,
    block: usize,
    primed: bool,
}

impl NullVorbis {
    fn new(info: &VorbisInfo) -> Self {
        Self {
            channels: info.channels as usize,
            block: info.blocksize_0 as usize / 2,
            primed: false,
        }
    }
}

impl AudioDecoder for NullVorbis {
    fn decode(&mut self, packet: &Packet) -> Result<Vec<Vec<f32>>, CodecError> {
        if packet.data.first().is_none_or(|b| b & 1 != 0) {
            return Err(CodecError::Rejected {
                packet_no: packet.packet_no,
                reason: "not an audio packet".into(),
            });
        }

        // The first packet after a reset only primes the overlap window.
        let samples = if std::mem::replace(&mut self.primed, true) {
            self.block
        } else {
            0
        };

        Ok(vec![vec![0.0; samples]; self.channels])
    }

    fn reset(&mut self) {
        self.primed = false;
    }
}

#[test]
fn blank_pictures_match_layout() -> anyhow::Result<()> {
    use crate::utils::testing::test_theora_info;

    let info = test_theora_info((25, 1), 6);
    let layout = FrameLayout::from_theora(&info);
    let mut video = NullBackend.video_decoder(&VideoSetup {
        info: &info,
        layout: &layout,
        headers: &[],
    })?;

    let DecodedPicture::Picture([y, cb, _]) = video.decode(&Packet::new(vec![0u8; 4]))? else {
        panic!("expected a picture");
    };
    assert_eq!((y.stride, y.height), (32, 32));
    assert_eq!((cb.stride, cb.height), (16, 16));
    assert!(matches!(
        video.decode(&Packet::new(Vec::new()))?,
        DecodedPicture::Duplicate
    ));
    Ok(())
}

#[test]
fn silent_audio_lengths() -> anyhow::Result<()> {
    use crate::structs::opus::OpusHead;

    let info = AudioCodecInfo::Opus(OpusHead {
        channels: 2,
        ..Default::default()
    });
    let mut opus = NullBackend.audio_decoder(&AudioSetup {
        info: &info,
        headers: &[],
    })?;
    let pcm = opus.decode(&Packet::new(vec![31 << 3, 0, 0]))?;
    assert_eq!(pcm.len(), 2);
    assert_eq!(pcm[0].len(), 960);
    assert!(opus.decode(&Packet::new(Vec::new())).is_err());

    let info = AudioCodecInfo::Vorbis(VorbisInfo {
        channels: 1,
        rate: 44100,
        blocksize_0: 256,
        blocksize_1: 2048,
        ..Default::default()
    });
    let mut vorbis = NullBackend.audio_decoder(&AudioSetup {
        info: &info,
        headers: &[],
    })?;
    assert_eq!(vorbis.decode(&Packet::new(vec![0u8]))?[0].len(), 0);
    assert_eq!(vorbis.decode(&Packet::new(vec![0u8]))?[0].len(), 128);
    vorbis.reset();
    assert_eq!(vorbis.decode(&Packet::new(vec![0u8]))?[0].len(), 0);
    Ok(())
}
