//! Typed, zero-copy views over locked driver buffers.
//!
//! A closed set of pixel formats is supported. Each format maps to exactly one
//! driver color mode and one [`ImageView`] variant:
//!
//! | Format   | Driver mode      | Sample | Channels |
//! |----------|------------------|--------|----------|
//! | `Mono8`  | `Mono8`          | `u8`   | 1        |
//! | `Mono16` | `Mono16`         | `u16`  | 1        |
//! | `Rgb8`   | `Rgb8Packed`     | `u8`   | 3        |
//! | `Rgb16`  | `Rgb12Unpacked`  | `u16`  | 3        |
//!
//! `Rgb16` is delivered by the hardware as 12-bit samples in 16-bit
//! containers; [`ImageView::apply_depth_correction`] rescales them to the full
//! 16-bit range.

use crate::driver::ColorMode;
use crate::error::{AppResult, CaptureError};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Multiplier taking a 12-bit sample to the 16-bit range.
pub const RGB12_TO_16_SCALE: u16 = (65_536 / 4_096) as u16;

/// Pixel format requested from the device.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PixelFormat {
    /// 8-bit monochrome.
    Mono8,
    /// 16-bit monochrome.
    Mono16,
    /// 8-bit RGB.
    Rgb8,
    /// 16-bit RGB (12 significant bits from the sensor).
    #[default]
    Rgb16,
}

impl PixelFormat {
    /// Samples per pixel.
    pub fn channels(self) -> usize {
        match self {
            PixelFormat::Mono8 | PixelFormat::Mono16 => 1,
            PixelFormat::Rgb8 | PixelFormat::Rgb16 => 3,
        }
    }

    /// Bytes per sample.
    pub fn bytes_per_sample(self) -> usize {
        match self {
            PixelFormat::Mono8 | PixelFormat::Rgb8 => 1,
            PixelFormat::Mono16 | PixelFormat::Rgb16 => 2,
        }
    }

    /// Bits per pixel as passed to buffer allocation.
    pub fn bits_per_pixel(self) -> u32 {
        (self.channels() * self.bytes_per_sample() * 8) as u32
    }

    /// Bytes needed for a `width` x `height` frame.
    pub fn frame_bytes(self, width: u32, height: u32) -> usize {
        width as usize * height as usize * self.channels() * self.bytes_per_sample()
    }

    /// Whether the format carries color.
    pub fn is_color(self) -> bool {
        self.channels() == 3
    }

    /// Driver color mode producing this format.
    pub fn color_mode(self) -> ColorMode {
        match self {
            PixelFormat::Mono8 => ColorMode::Mono8,
            PixelFormat::Mono16 => ColorMode::Mono16,
            PixelFormat::Rgb8 => ColorMode::Rgb8Packed,
            PixelFormat::Rgb16 => ColorMode::Rgb12Unpacked,
        }
    }
}

impl std::fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            PixelFormat::Mono8 => "mono8",
            PixelFormat::Mono16 => "mono16",
            PixelFormat::Rgb8 => "rgb8",
            PixelFormat::Rgb16 => "rgb16",
        })
    }
}

impl FromStr for PixelFormat {
    type Err = CaptureError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "mono8" => Ok(PixelFormat::Mono8),
            "mono16" => Ok(PixelFormat::Mono16),
            "rgb8" => Ok(PixelFormat::Rgb8),
            "rgb16" => Ok(PixelFormat::Rgb16),
            other => Err(CaptureError::Configuration(format!(
                "Invalid pixel format '{}'. Must be one of: mono8, mono16, rgb8, rgb16",
                other
            ))),
        }
    }
}

/// Row-major interleaved samples of one frame.
#[derive(Debug)]
pub struct ImageBuffer<'a, T> {
    data: &'a mut [T],
    width: u32,
    height: u32,
    channels: usize,
}

impl<'a, T> ImageBuffer<'a, T> {
    /// Frame width in pixels.
    pub fn width(&self) -> u32 {
        self.width
    }

    /// Frame height in pixels.
    pub fn height(&self) -> u32 {
        self.height
    }

    /// Samples per pixel.
    pub fn channels(&self) -> usize {
        self.channels
    }

    /// All samples.
    pub fn as_slice(&self) -> &[T] {
        &*self.data
    }

    /// All samples, mutable.
    pub fn as_mut_slice(&mut self) -> &mut [T] {
        &mut *self.data
    }

    /// Samples of row `y`.
    pub fn row(&self, y: u32) -> Option<&[T]> {
        let stride = self.width as usize * self.channels;
        let start = y as usize * stride;
        self.data.get(start..start + stride)
    }

    /// Samples of the pixel at (`x`, `y`).
    pub fn pixel(&self, x: u32, y: u32) -> Option<&[T]> {
        if x >= self.width {
            return None;
        }
        let start = x as usize * self.channels;
        self.row(y).map(|row| &row[start..start + self.channels])
    }
}

/// Typed view of a frame, one variant per [`PixelFormat`].
#[derive(Debug)]
pub enum ImageView<'a> {
    /// 8-bit monochrome, W×H×1.
    Mono8(ImageBuffer<'a, u8>),
    /// 16-bit monochrome, W×H×1.
    Mono16(ImageBuffer<'a, u16>),
    /// 8-bit RGB, W×H×3.
    Rgb8(ImageBuffer<'a, u8>),
    /// 16-bit RGB, W×H×3.
    Rgb16(ImageBuffer<'a, u16>),
}

impl<'a> ImageView<'a> {
    /// View `bytes` as a `width` x `height` frame of `format`.
    ///
    /// Trailing bytes beyond the frame are ignored. Fails when the slice is
    /// too short or not aligned for 16-bit samples.
    pub fn from_bytes(
        format: PixelFormat,
        bytes: &'a mut [u8],
        width: u32,
        height: u32,
    ) -> AppResult<Self> {
        let needed = format.frame_bytes(width, height);
        if bytes.len() < needed {
            return Err(CaptureError::ImageLayout(format!(
                "{} frame of {}x{} needs {} bytes, buffer has {}",
                format,
                width,
                height,
                needed,
                bytes.len()
            )));
        }
        let bytes = &mut bytes[..needed];
        let channels = format.channels();

        Ok(match format {
            PixelFormat::Mono8 => ImageView::Mono8(ImageBuffer {
                data: bytes,
                width,
                height,
                channels,
            }),
            PixelFormat::Rgb8 => ImageView::Rgb8(ImageBuffer {
                data: bytes,
                width,
                height,
                channels,
            }),
            PixelFormat::Mono16 | PixelFormat::Rgb16 => {
                let data: &mut [u16] = bytemuck::try_cast_slice_mut(bytes).map_err(|e| {
                    CaptureError::ImageLayout(format!("cannot view buffer as u16 samples: {e:?}"))
                })?;
                let buffer = ImageBuffer {
                    data,
                    width,
                    height,
                    channels,
                };
                if format == PixelFormat::Mono16 {
                    ImageView::Mono16(buffer)
                } else {
                    ImageView::Rgb16(buffer)
                }
            }
        })
    }

    /// View raw driver memory.
    ///
    /// # Safety
    ///
    /// `ptr` must point to at least `len` bytes that stay valid, and are not
    /// accessed through any other path, for the whole lifetime `'a`.
    #[allow(unsafe_code)]
    pub unsafe fn from_raw(
        format: PixelFormat,
        ptr: *mut u8,
        len: usize,
        width: u32,
        height: u32,
    ) -> AppResult<Self> {
        if ptr.is_null() {
            return Err(CaptureError::ImageLayout("null buffer address".to_string()));
        }
        // SAFETY: guaranteed by the caller.
        let bytes = unsafe { std::slice::from_raw_parts_mut(ptr, len) };
        Self::from_bytes(format, bytes, width, height)
    }

    /// Pixel format of the view.
    pub fn format(&self) -> PixelFormat {
        match self {
            ImageView::Mono8(_) => PixelFormat::Mono8,
            ImageView::Mono16(_) => PixelFormat::Mono16,
            ImageView::Rgb8(_) => PixelFormat::Rgb8,
            ImageView::Rgb16(_) => PixelFormat::Rgb16,
        }
    }

    /// Frame width in pixels.
    pub fn width(&self) -> u32 {
        match self {
            ImageView::Mono8(b) | ImageView::Rgb8(b) => b.width(),
            ImageView::Mono16(b) | ImageView::Rgb16(b) => b.width(),
        }
    }

    /// Frame height in pixels.
    pub fn height(&self) -> u32 {
        match self {
            ImageView::Mono8(b) | ImageView::Rgb8(b) => b.height(),
            ImageView::Mono16(b) | ImageView::Rgb16(b) => b.height(),
        }
    }

    /// Fix up samples whose hardware depth differs from the nominal one.
    ///
    /// Only `Rgb16` is affected: 12-bit samples are scaled to 16 bits.
    pub fn apply_depth_correction(&mut self) {
        if let ImageView::Rgb16(buffer) = self {
            rescale_12_to_16(buffer.as_mut_slice());
        }
    }
}

/// Scale 12-bit samples in place to the 16-bit range.
pub fn rescale_12_to_16(samples: &mut [u16]) {
    for sample in samples {
        *sample = sample.saturating_mul(RGB12_TO_16_SCALE);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_geometry() {
        assert_eq!(PixelFormat::Mono8.bits_per_pixel(), 8);
        assert_eq!(PixelFormat::Mono16.bits_per_pixel(), 16);
        assert_eq!(PixelFormat::Rgb8.bits_per_pixel(), 24);
        assert_eq!(PixelFormat::Rgb16.bits_per_pixel(), 48);
        assert_eq!(PixelFormat::Rgb16.frame_bytes(4, 2), 48);
        assert_eq!(PixelFormat::Rgb16.color_mode(), ColorMode::Rgb12Unpacked);
    }

    #[test]
    fn test_parse_pixel_format() {
        assert_eq!("MONO8".parse::<PixelFormat>().unwrap(), PixelFormat::Mono8);
        assert_eq!("rgb16".parse::<PixelFormat>().unwrap(), PixelFormat::Rgb16);
        assert!("bgr10".parse::<PixelFormat>().is_err());
    }

    #[test]
    fn test_mono8_view_shape() {
        let mut bytes: Vec<u8> = (0..12).collect();
        let view = ImageView::from_bytes(PixelFormat::Mono8, &mut bytes, 4, 3).unwrap();
        assert_eq!(view.format(), PixelFormat::Mono8);
        match view {
            ImageView::Mono8(buffer) => {
                assert_eq!(buffer.as_slice().len(), 4 * 3);
                assert_eq!(buffer.channels(), 1);
                assert_eq!(buffer.row(1), Some(&[4u8, 5, 6, 7][..]));
                assert_eq!(buffer.pixel(3, 2), Some(&[11u8][..]));
                assert_eq!(buffer.pixel(4, 0), None);
            }
            other => panic!("unexpected view {other:?}"),
        }
    }

    #[test]
    fn test_rgb16_view_rescales_12_bit_samples() {
        let mut backing = vec![0u64; 3];
        let bytes: &mut [u8] = bytemuck::cast_slice_mut(&mut backing[..]);
        {
            let samples: &mut [u16] = bytemuck::cast_slice_mut(&mut *bytes);
            for (i, s) in samples.iter_mut().enumerate() {
                *s = [0, 1, 2048, 4095][i % 4];
            }
        }

        let mut view = ImageView::from_bytes(PixelFormat::Rgb16, bytes, 2, 2).unwrap();
        view.apply_depth_correction();
        match view {
            ImageView::Rgb16(buffer) => {
                assert_eq!(buffer.as_slice().len(), 2 * 2 * 3);
                assert_eq!(&buffer.as_slice()[..4], &[0, 16, 32_768, 65_520]);
            }
            other => panic!("unexpected view {other:?}"),
        }
    }

    #[test]
    fn test_mono16_is_not_rescaled() {
        let mut backing = vec![0u64; 1];
        let bytes: &mut [u8] = bytemuck::cast_slice_mut(&mut backing[..]);
        bytemuck::cast_slice_mut::<u8, u16>(&mut *bytes)[0] = 4095;

        let mut view = ImageView::from_bytes(PixelFormat::Mono16, bytes, 2, 2).unwrap();
        view.apply_depth_correction();
        match view {
            ImageView::Mono16(buffer) => assert_eq!(buffer.as_slice()[0], 4095),
            other => panic!("unexpected view {other:?}"),
        }
    }

    #[test]
    fn test_short_buffer_rejected() {
        let mut bytes = vec![0u8; 5];
        let err = ImageView::from_bytes(PixelFormat::Rgb8, &mut bytes, 2, 1).unwrap_err();
        assert!(matches!(err, CaptureError::ImageLayout(_)));
    }

    #[test]
    fn test_misaligned_u16_rejected() {
        let mut backing = vec![0u64; 2];
        let bytes: &mut [u8] = bytemuck::cast_slice_mut(&mut backing[..]);
        let err = ImageView::from_bytes(PixelFormat::Mono16, &mut bytes[1..], 2, 2).unwrap_err();
        assert!(matches!(err, CaptureError::ImageLayout(_)));
    }
}
