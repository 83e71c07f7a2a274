use std::sync::Arc;

use crate::structs::theora::TheoraInfo;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Size {
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Point {
    pub x: u32,
    pub y: u32,
}

/// Decoded picture geometry, fixed once the video headers are complete.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct FrameLayout {
    /// Coded frame size.
    pub frame: Size,
    /// Visible picture size.
    pub picture: Size,
    /// Top-left corner of the visible picture inside the coded frame.
    pub offset: Point,
    /// Chroma decimation as a shift per axis.
    pub subsampling: Point,
    pub aspect_ratio: f64,
    pub fps: f64,
}

impl FrameLayout {
    pub fn from_theora(info: &TheoraInfo) -> Self {
        let (hdec, vdec) = info.pixel_format.chroma_shift();

        Self {
            frame: Size {
                width: info.frame_width,
                height: info.frame_height,
            },
            picture: Size {
                width: info.pic_width,
                height: info.pic_height,
            },
            offset: Point {
                x: info.pic_x,
                y: info.pic_y,
            },
            subsampling: Point { x: hdec, y: vdec },
            aspect_ratio: info.aspect_ratio(),
            fps: info.fps(),
        }
    }

    pub fn chroma_size(&self) -> Size {
        Size {
            width: self.frame.width >> self.subsampling.x,
            height: self.frame.height >> self.subsampling.y,
        }
    }
}

/// One plane of pixel data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlaneBuffer {
    pub bytes: Arc<[u8]>,
    pub stride: usize,
    pub height: usize,
}

impl PlaneBuffer {
    /// A plane of `width` x `height` filled with `value`, with the stride
    /// equal to the width.
    pub fn filled(width: usize, height: usize, value: u8) -> Self {
        Self {
            bytes: vec![value; width * height].into(),
            stride: width,
            height,
        }
    }

    pub fn row(&self, y: usize) -> Option<&[u8]> {
        let start = y.checked_mul(self.stride)?;
        self.bytes.get(start..start + self.stride)
    }
}

/// One decoded picture. Ownership passes to the caller on dequeue.
#[derive(Debug, Clone)]
pub struct FrameBuffer {
    pub layout: Arc<FrameLayout>,
    pub timestamp: f64,
    /// Time of the latest keyframe at or before this frame, when known.
    pub keyframe_timestamp: Option<f64>,
    pub y: PlaneBuffer,
    pub cb: PlaneBuffer,
    pub cr: PlaneBuffer,
}

#[test]
fn layout_from_identification() {
    use crate::structs::theora::PixelFormat;

    let info = TheoraInfo {
        frame_width: 320,
        frame_height: 240,
        pic_width: 318,
        pic_height: 238,
        pic_x: 1,
        pic_y: 1,
        fps_numerator: 30000,
        fps_denominator: 1001,
        pixel_format: PixelFormat::Yuv422,
        ..Default::default()
    };

    let layout = FrameLayout::from_theora(&info);
    assert_eq!(layout.subsampling, Point { x: 1, y: 0 });
    assert_eq!(layout.chroma_size(), Size { width: 160, height: 240 });
    assert_eq!(layout.aspect_ratio, 1.0);
    assert!((layout.fps - 29.97).abs() < 0.01);
}

#[test]
fn plane_rows() {
    let plane = PlaneBuffer::filled(4, 2, 16);
    assert_eq!(plane.row(1), Some(&[16u8; 4][..]));
    assert_eq!(plane.row(2), None);
}
