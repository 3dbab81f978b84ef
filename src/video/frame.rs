//! Video frame data structures

use bytes::Bytes;
use std::time::{Duration, Instant};

use super::format::{PixelFormat, Resolution};

/// A captured video frame with metadata
///
/// Cloning is cheap: the pixel data is reference counted.
#[derive(Debug, Clone)]
pub struct VideoFrame {
    /// Raw frame data
    data: Bytes,
    /// Frame resolution
    pub resolution: Resolution,
    /// Pixel format
    pub format: PixelFormat,
    /// Stride (bytes per line, 0 for compressed formats)
    pub stride: u32,
    /// Frame sequence number reported by the driver
    pub sequence: u64,
    /// Timestamp when frame was captured
    pub capture_ts: Instant,
}

impl VideoFrame {
    /// Create a new video frame
    pub fn new(
        data: Bytes,
        resolution: Resolution,
        format: PixelFormat,
        stride: u32,
        sequence: u64,
    ) -> Self {
        Self {
            data,
            resolution,
            format,
            stride,
            sequence,
            capture_ts: Instant::now(),
        }
    }

    /// Create a frame from a Vec<u8>
    pub fn from_vec(
        data: Vec<u8>,
        resolution: Resolution,
        format: PixelFormat,
        stride: u32,
        sequence: u64,
    ) -> Self {
        Self::new(Bytes::from(data), resolution, format, stride, sequence)
    }

    /// Get frame data as bytes slice
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn width(&self) -> u32 {
        self.resolution.width
    }

    pub fn height(&self) -> u32 {
        self.resolution.height
    }

    /// Time since capture
    pub fn age(&self) -> Duration {
        self.capture_ts.elapsed()
    }

    /// Check if this frame is still fresh (within threshold)
    pub fn is_fresh(&self, max_age: Duration) -> bool {
        self.age() < max_age
    }

    /// Check JPEG SOI/EOI markers for compressed frames
    pub fn is_valid_jpeg(&self) -> bool {
        if !self.format.is_compressed() || self.data.len() < 125 {
            return false;
        }
        let start_marker = ((self.data[0] as u16) << 8) | self.data[1] as u16;
        if start_marker != 0xFFD8 {
            return false;
        }
        let end = self.data.len();
        let end_marker = ((self.data[end - 2] as u16) << 8) | self.data[end - 1] as u16;
        // Some UVC devices pad after EOI
        matches!(end_marker, 0xFFD9 | 0xD900 | 0x0000)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_jpeg() {
        let mut data = vec![0xFF, 0xD8];
        data.extend(vec![0u8; 200]);
        data.extend([0xFF, 0xD9]);
        let frame = VideoFrame::from_vec(data, Resolution::VGA, PixelFormat::Mjpeg, 0, 1);
        assert!(frame.is_valid_jpeg());

        let small = VideoFrame::from_vec(
            vec![0xFF, 0xD8, 0xFF, 0xD9],
            Resolution::VGA,
            PixelFormat::Mjpeg,
            0,
            2,
        );
        assert!(!small.is_valid_jpeg());

        let raw = VideoFrame::from_vec(vec![0u8; 300], Resolution::VGA, PixelFormat::Yuyv, 0, 3);
        assert!(!raw.is_valid_jpeg());
    }

    #[test]
    fn test_freshness() {
        let frame = VideoFrame::from_vec(vec![1, 2, 3], Resolution::new(1, 1), PixelFormat::Rgb24, 3, 0);
        assert!(frame.is_fresh(Duration::from_secs(5)));
        assert!(!frame.is_fresh(Duration::ZERO));
    }
}
