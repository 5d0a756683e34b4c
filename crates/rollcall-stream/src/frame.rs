//! Decoded video frame type.

use std::time::Instant;

/// One decoded RGB24 frame.
#[derive(Clone)]
pub struct Frame {
    /// Packed RGB pixel data, `width * height * 3` bytes.
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    /// When the frame left the decoder, not when the camera shot it.
    pub captured_at: Instant,
    /// Monotonic counter over the life of one stream session; resets on
    /// reconnect.
    pub sequence: u64,
}

impl Frame {
    /// Byte length of a packed RGB24 frame at the given geometry.
    pub fn byte_len(width: u32, height: u32) -> usize {
        width as usize * height as usize * 3
    }

    pub fn is_well_formed(&self) -> bool {
        self.data.len() == Self::byte_len(self.width, self.height)
    }
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("sequence", &self.sequence)
            .field("bytes", &self.data.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_byte_len() {
        assert_eq!(Frame::byte_len(1920, 1080), 1920 * 1080 * 3);
        assert_eq!(Frame::byte_len(0, 1080), 0);
    }

    #[test]
    fn test_well_formed() {
        let frame = Frame {
            data: vec![0u8; 4 * 2 * 3],
            width: 4,
            height: 2,
            captured_at: Instant::now(),
            sequence: 0,
        };
        assert!(frame.is_well_formed());

        let short = Frame { data: vec![0u8; 5], ..frame };
        assert!(!short.is_well_formed());
    }
}
