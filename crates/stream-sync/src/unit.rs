//! Elementary units produced by a live source, and the presentation bitmap.

use crate::error::FormatError;

/// One decoded unit pulled from a live source.
#[derive(Clone, Debug)]
pub enum ElementaryUnit {
    Audio(AudioUnit),
    Video(VideoUnit),
}

impl ElementaryUnit {
    pub fn is_audio(&self) -> bool {
        matches!(self, Self::Audio(_))
    }
}

/// Decoded audio in whatever layout the decoder emitted.
#[derive(Clone, Debug)]
pub struct AudioUnit {
    pub sample_rate: u32,
    pub samples: AudioSamples,
}

#[derive(Clone, Debug)]
pub enum AudioSamples {
    /// One `Vec` per channel, float in `[-1, 1]`.
    F32Planar(Vec<Vec<f32>>),
    F32Interleaved { channels: usize, data: Vec<f32> },
    S16Planar(Vec<Vec<i16>>),
    S16Interleaved { channels: usize, data: Vec<i16> },
}

impl AudioSamples {
    pub fn channels(&self) -> usize {
        match self {
            Self::F32Planar(planes) => planes.len(),
            Self::S16Planar(planes) => planes.len(),
            Self::F32Interleaved { channels, .. } | Self::S16Interleaved { channels, .. } => {
                *channels
            }
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PixelLayout {
    Rgba8,
    Bgra8,
    Rgb8,
}

impl PixelLayout {
    pub fn bytes_per_pixel(self) -> usize {
        match self {
            Self::Rgba8 | Self::Bgra8 => 4,
            Self::Rgb8 => 3,
        }
    }
}

/// Decoded picture as delivered by the source.
#[derive(Clone, Debug)]
pub struct VideoUnit {
    pub width: u32,
    pub height: u32,
    /// Bytes per row; `0` means tightly packed.
    pub stride: usize,
    pub layout: PixelLayout,
    /// Rows are stored last-to-first.
    pub bottom_up: bool,
    pub data: Vec<u8>,
}

/// Tightly packed RGBA8 frame, rows top to bottom.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RgbaFrame {
    pub width: u32,
    pub height: u32,
    pub data: Vec<u8>,
}

impl RgbaFrame {
    /// Convert a decoded picture into the presentation layout.
    pub fn from_unit(unit: VideoUnit) -> Result<Self, FormatError> {
        if unit.width == 0 || unit.height == 0 {
            return Err(FormatError::EmptyBitmap {
                width: unit.width,
                height: unit.height,
            });
        }
        let width = unit.width as usize;
        let height = unit.height as usize;
        let bpp = unit.layout.bytes_per_pixel();
        let row_bytes = width * bpp;
        let stride = if unit.stride == 0 { row_bytes } else { unit.stride.max(row_bytes) };
        let need = stride * (height - 1) + row_bytes;
        if unit.data.len() < need {
            return Err(FormatError::ShortBitmap {
                need,
                have: unit.data.len(),
            });
        }

        if unit.layout == PixelLayout::Rgba8 && stride == row_bytes && !unit.bottom_up {
            let mut data = unit.data;
            data.truncate(row_bytes * height);
            return Ok(Self {
                width: unit.width,
                height: unit.height,
                data,
            });
        }

        let mut data = Vec::with_capacity(width * height * 4);
        for row in 0..height {
            let src_row = if unit.bottom_up { height - 1 - row } else { row };
            let line = &unit.data[src_row * stride..src_row * stride + row_bytes];
            for px in line.chunks_exact(bpp) {
                match unit.layout {
                    PixelLayout::Rgba8 => data.extend_from_slice(px),
                    PixelLayout::Bgra8 => data.extend_from_slice(&[px[2], px[1], px[0], px[3]]),
                    PixelLayout::Rgb8 => data.extend_from_slice(&[px[0], px[1], px[2], 0xff]),
                }
            }
        }
        Ok(Self {
            width: unit.width,
            height: unit.height,
            data,
        })
    }
}
