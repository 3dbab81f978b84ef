//! Frame encoder: any captured format -> rotated JPEG data URL
//!
//! ```text
//! MJPEG ──turbojpeg──┐
//! YUYV/BGR/GREY ─────┼──> RGB24 ──rotate 180°──turbojpeg──> JPEG ──base64──> data URL
//! RGB24 ─────────────┘
//! ```

use base64::prelude::*;
use turbojpeg::{Compressor, Decompressor, Image, PixelFormat as TJPixelFormat, Subsamp};

use super::format::PixelFormat;
use super::frame::VideoFrame;
use crate::error::{AppError, Result};

/// Prefix of every outbound frame
pub const DATA_URL_PREFIX: &str = "data:image/jpeg;base64,";

/// Default JPEG quality
pub const DEFAULT_JPEG_QUALITY: u8 = 80;

/// An encoded outbound frame. Only `data_url` goes on the wire.
#[derive(Debug, Clone)]
pub struct EncodedFrame {
    pub data_url: String,
    pub width: u32,
    pub height: u32,
    pub sequence: u64,
}

impl EncodedFrame {
    /// Decode the JPEG payload back out of the data URL
    pub fn jpeg_bytes(&self) -> Result<Vec<u8>> {
        let payload = self
            .data_url
            .strip_prefix(DATA_URL_PREFIX)
            .ok_or_else(|| AppError::EncodeError("not a JPEG data URL".to_string()))?;
        BASE64_STANDARD
            .decode(payload)
            .map_err(|e| AppError::EncodeError(format!("invalid base64 payload: {}", e)))
    }
}

/// JPEG encoder using turbojpeg
///
/// Holds turbojpeg handles, so use it from one task at a time.
pub struct JpegEncoder {
    compressor: Compressor,
    decompressor: Decompressor,
    quality: u8,
    rotate_180: bool,
    /// RGB24 scratch buffer, reused across frames
    rgb: Vec<u8>,
}

impl JpegEncoder {
    pub fn new(quality: u8, rotate_180: bool) -> Result<Self> {
        let mut compressor = Compressor::new().map_err(|e| {
            AppError::EncodeError(format!("Failed to create turbojpeg compressor: {}", e))
        })?;
        compressor
            .set_quality(quality.clamp(1, 100) as i32)
            .map_err(|e| AppError::EncodeError(format!("Failed to set JPEG quality: {}", e)))?;
        compressor
            .set_subsamp(Subsamp::Sub2x2)
            .map_err(|e| AppError::EncodeError(format!("Failed to set subsampling: {}", e)))?;

        let decompressor = Decompressor::new().map_err(|e| {
            AppError::EncodeError(format!("Failed to create turbojpeg decoder: {}", e))
        })?;

        Ok(Self {
            compressor,
            decompressor,
            quality: quality.clamp(1, 100),
            rotate_180,
            rgb: Vec::new(),
        })
    }

    pub fn quality(&self) -> u8 {
        self.quality
    }

    /// Encode one frame to a data URL
    pub fn encode(&mut self, frame: &VideoFrame) -> Result<EncodedFrame> {
        let (width, height) = self.to_rgb(frame)?;

        if self.rotate_180 {
            rotate_180(&mut self.rgb, 3);
        }

        let image = Image {
            pixels: self.rgb.as_slice(),
            width,
            pitch: width * 3,
            height,
            format: TJPixelFormat::RGB,
        };
        let jpeg = self
            .compressor
            .compress_to_vec(image)
            .map_err(|e| AppError::EncodeError(format!("JPEG compression failed: {}", e)))?;

        Ok(EncodedFrame {
            data_url: to_data_url(&jpeg),
            width: width as u32,
            height: height as u32,
            sequence: frame.sequence,
        })
    }

    /// Fill the scratch buffer with tightly packed RGB24; returns (width, height)
    fn to_rgb(&mut self, frame: &VideoFrame) -> Result<(usize, usize)> {
        match frame.format {
            PixelFormat::Mjpeg | PixelFormat::Jpeg => self.decode_jpeg(frame.data()),
            PixelFormat::Rgb24 | PixelFormat::Bgr24 | PixelFormat::Grey | PixelFormat::Yuyv => {
                let width = frame.width() as usize;
                let height = frame.height() as usize;
                let bpp = frame.format.bytes_per_pixel().unwrap_or(3);
                let stride = if frame.stride == 0 {
                    width * bpp
                } else {
                    frame.stride as usize
                };
                let data = frame.data();
                let needed = stride * height.saturating_sub(1) + width * bpp;
                if width == 0 || height == 0 || data.len() < needed {
                    return Err(AppError::EncodeError(format!(
                        "{} frame too small: {} < {} bytes",
                        frame.format,
                        data.len(),
                        needed
                    )));
                }

                self.rgb.clear();
                self.rgb.reserve(width * height * 3);
                for row in data.chunks(stride).take(height) {
                    let row = &row[..width * bpp];
                    match frame.format {
                        PixelFormat::Rgb24 => self.rgb.extend_from_slice(row),
                        PixelFormat::Bgr24 => {
                            for px in row.chunks_exact(3) {
                                self.rgb.extend_from_slice(&[px[2], px[1], px[0]]);
                            }
                        }
                        PixelFormat::Grey => {
                            for &y in row {
                                self.rgb.extend_from_slice(&[y, y, y]);
                            }
                        }
                        _ => yuyv_row_to_rgb(row, &mut self.rgb),
                    }
                }
                Ok((width, height))
            }
        }
    }

    fn decode_jpeg(&mut self, jpeg: &[u8]) -> Result<(usize, usize)> {
        let header = self
            .decompressor
            .read_header(jpeg)
            .map_err(|e| AppError::EncodeError(format!("turbojpeg read_header failed: {}", e)))?;

        let pitch = header.width * 3;
        self.rgb.clear();
        self.rgb.resize(header.height * pitch, 0);

        let image = Image {
            pixels: self.rgb.as_mut_slice(),
            width: header.width,
            pitch,
            height: header.height,
            format: TJPixelFormat::RGB,
        };
        self.decompressor
            .decompress(jpeg, image)
            .map_err(|e| AppError::EncodeError(format!("turbojpeg decode failed: {}", e)))?;

        Ok((header.width, header.height))
    }
}

/// Wrap JPEG bytes as a data URL
pub fn to_data_url(jpeg: &[u8]) -> String {
    let mut url = String::with_capacity(DATA_URL_PREFIX.len() + jpeg.len() * 4 / 3 + 4);
    url.push_str(DATA_URL_PREFIX);
    BASE64_STANDARD.encode_string(jpeg, &mut url);
    url
}

/// Rotate a tightly packed image by 180° in place.
///
/// Pixel i maps to pixel n-1-i, which flips both axes at once.
pub fn rotate_180(pixels: &mut [u8], bytes_per_pixel: usize) {
    let n = pixels.len() / bytes_per_pixel;
    for i in 0..n / 2 {
        let j = n - 1 - i;
        for k in 0..bytes_per_pixel {
            pixels.swap(i * bytes_per_pixel + k, j * bytes_per_pixel + k);
        }
    }
}

/// BT.601 limited-range YUYV (4:2:2) to RGB24
fn yuyv_row_to_rgb(row: &[u8], out: &mut Vec<u8>) {
    for chunk in row.chunks_exact(4) {
        let (y0, u, y1, v) = (chunk[0], chunk[1], chunk[2], chunk[3]);
        out.extend_from_slice(&yuv_to_rgb(y0, u, v));
        out.extend_from_slice(&yuv_to_rgb(y1, u, v));
    }
}

#[inline]
fn yuv_to_rgb(y: u8, u: u8, v: u8) -> [u8; 3] {
    let c = (y as i32 - 16).max(0) * 298;
    let d = u as i32 - 128;
    let e = v as i32 - 128;
    let clamp = |x: i32| ((x + 128) >> 8).clamp(0, 255) as u8;
    [
        clamp(c + 409 * e),
        clamp(c - 100 * d - 208 * e),
        clamp(c + 516 * d),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::video::format::Resolution;

    fn solid_rgb(width: u32, height: u32, rgb: [u8; 3]) -> VideoFrame {
        let data: Vec<u8> = (0..width * height).flat_map(|_| rgb).collect();
        VideoFrame::from_vec(data, Resolution::new(width, height), PixelFormat::Rgb24, width * 3, 7)
    }

    #[test]
    fn test_rotate_180() {
        // 2x2 image, pixels labelled 1..4 row-major
        let mut px = vec![1, 1, 1, 2, 2, 2, 3, 3, 3, 4, 4, 4];
        rotate_180(&mut px, 3);
        assert_eq!(px, vec![4, 4, 4, 3, 3, 3, 2, 2, 2, 1, 1, 1]);

        // Odd pixel count keeps the centre in place
        let mut odd = vec![1, 2, 3];
        rotate_180(&mut odd, 1);
        assert_eq!(odd, vec![3, 2, 1]);
    }

    #[test]
    fn test_encode_produces_jpeg_data_url() {
        let mut encoder = JpegEncoder::new(80, true).unwrap();
        let encoded = encoder.encode(&solid_rgb(32, 16, [200, 40, 40])).unwrap();

        assert!(encoded.data_url.starts_with(DATA_URL_PREFIX));
        assert_eq!((encoded.width, encoded.height), (32, 16));
        assert_eq!(encoded.sequence, 7);

        let jpeg = encoded.jpeg_bytes().unwrap();
        assert_eq!(&jpeg[..2], &[0xFF, 0xD8]);
    }

    #[test]
    fn test_rotation_moves_content() {
        // Left half white, right half black
        let (w, h) = (16u32, 16u32);
        let mut data = Vec::new();
        for _ in 0..h {
            for x in 0..w {
                let v = if x < w / 2 { 255 } else { 0 };
                data.extend_from_slice(&[v, v, v]);
            }
        }
        let frame = VideoFrame::from_vec(data, Resolution::new(w, h), PixelFormat::Rgb24, w * 3, 0);

        let mut encoder = JpegEncoder::new(95, true).unwrap();
        let jpeg = encoder.encode(&frame).unwrap().jpeg_bytes().unwrap();
        let decoded = turbojpeg::decompress(&jpeg, TJPixelFormat::RGB).unwrap();

        let left = decoded.pixels[(8 * decoded.pitch) + 3 * 3];
        let right = decoded.pixels[(8 * decoded.pitch) + 12 * 3];
        assert!(left < 64, "left side should be dark after rotation, got {}", left);
        assert!(right > 192, "right side should be bright after rotation, got {}", right);
    }

    #[test]
    fn test_yuyv_and_grey_convert() {
        let res = Resolution::new(4, 2);
        let yuyv = VideoFrame::from_vec(vec![128u8; 4 * 2 * 2], res, PixelFormat::Yuyv, 8, 1);
        let grey = VideoFrame::from_vec(vec![90u8; 4 * 2], res, PixelFormat::Grey, 4, 2);

        let mut encoder = JpegEncoder::new(80, false).unwrap();
        assert_eq!(encoder.encode(&yuyv).unwrap().width, 4);
        assert_eq!(encoder.encode(&grey).unwrap().height, 2);
    }

    #[test]
    fn test_short_buffer_rejected() {
        let frame = VideoFrame::from_vec(vec![0u8; 10], Resolution::new(8, 8), PixelFormat::Rgb24, 24, 0);
        let mut encoder = JpegEncoder::new(80, true).unwrap();
        assert!(matches!(encoder.encode(&frame), Err(AppError::EncodeError(_))));
    }

    #[test]
    fn test_mjpeg_input_reencoded() {
        let mut encoder = JpegEncoder::new(80, false).unwrap();
        let jpeg = encoder
            .encode(&solid_rgb(24, 24, [10, 200, 10]))
            .unwrap()
            .jpeg_bytes()
            .unwrap();

        let mjpeg = VideoFrame::from_vec(jpeg, Resolution::new(24, 24), PixelFormat::Mjpeg, 0, 3);
        let encoded = JpegEncoder::new(60, true).unwrap().encode(&mjpeg).unwrap();
        assert_eq!((encoded.width, encoded.height, encoded.sequence), (24, 24, 3));
    }

    #[test]
    fn test_invalid_mjpeg_is_encode_error() {
        let junk = VideoFrame::from_vec(vec![0xAB; 512], Resolution::new(8, 8), PixelFormat::Mjpeg, 0, 0);
        let mut encoder = JpegEncoder::new(80, true).unwrap();
        assert!(matches!(encoder.encode(&junk), Err(AppError::EncodeError(_))));
    }
}
