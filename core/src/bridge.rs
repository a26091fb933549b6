//! Serial framing of the radio co-processor link
//!
//! The short-range radio runs on a co-processor that forwards every frame
//! it receives over UART as `[len: u8][payload: len bytes]`. The hub talks
//! back with control frames in the same shape; the only one in use selects
//! the radio channel.

use heapless::Vec;

/// Largest payload the radio can carry
pub const MAX_FRAME: usize = 250;

/// Control frame tag selecting the radio channel
pub const CHANNEL_SELECT: u8 = b'C';

/// Control frame asking the co-processor to listen on `channel`
pub const fn channel_select(channel: u8) -> [u8; 3] {
    [2, CHANNEL_SELECT, channel]
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Length,
    Payload { remaining: usize },
    Skip { remaining: usize },
}

/// Byte-at-a-time decoder for co-processor frames
///
/// Zero-length frames are dropped silently. Frames longer than
/// [`MAX_FRAME`] cannot come from the radio, so their payload is skipped
/// and counted.
#[derive(Debug)]
pub struct FrameDecoder {
    state: State,
    frame: Vec<u8, MAX_FRAME>,
    skipped: u32,
}

impl FrameDecoder {
    pub const fn new() -> Self {
        Self {
            state: State::Length,
            frame: Vec::new(),
            skipped: 0,
        }
    }

    /// Feed one byte; returns the payload when it completes a frame
    pub fn push(&mut self, byte: u8) -> Option<&[u8]> {
        match self.state {
            State::Length => {
                self.frame.clear();
                let len = byte as usize;
                if len > MAX_FRAME {
                    warn!("bridge frame of {} bytes skipped", len);
                    self.skipped += 1;
                    self.state = State::Skip { remaining: len };
                } else if len > 0 {
                    self.state = State::Payload { remaining: len };
                }
                None
            }
            State::Payload { remaining } => {
                // Cannot fail: `remaining` was bounded by MAX_FRAME
                let _ = self.frame.push(byte);
                if remaining == 1 {
                    self.state = State::Length;
                    Some(self.frame.as_slice())
                } else {
                    self.state = State::Payload {
                        remaining: remaining - 1,
                    };
                    None
                }
            }
            State::Skip { remaining } => {
                self.state = if remaining == 1 {
                    State::Length
                } else {
                    State::Skip {
                        remaining: remaining - 1,
                    }
                };
                None
            }
        }
    }

    /// Drop any partial frame, e.g. after the UART lost bytes
    pub fn reset(&mut self) {
        self.state = State::Length;
        self.frame.clear();
    }

    /// Oversized frames skipped since boot
    pub fn skipped(&self) -> u32 {
        self.skipped
    }
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode(decoder: &mut FrameDecoder, bytes: &[u8]) -> std::vec::Vec<std::vec::Vec<u8>> {
        let mut frames = std::vec::Vec::new();
        for &byte in bytes {
            if let Some(frame) = decoder.push(byte) {
                frames.push(frame.to_vec());
            }
        }
        frames
    }

    #[test]
    fn test_back_to_back_frames() {
        let mut decoder = FrameDecoder::new();
        let frames = decode(&mut decoder, &[3, 1, 2, 3, 0, 1, 9, 2, 7, 7]);
        assert_eq!(frames, vec![vec![1, 2, 3], vec![9], vec![7, 7]]);
    }

    #[test]
    fn test_frame_split_across_reads() {
        let mut decoder = FrameDecoder::new();
        assert!(decode(&mut decoder, &[4, 0xAA, 0xBB]).is_empty());
        assert_eq!(decode(&mut decoder, &[0xCC, 0xDD]), vec![vec![0xAA, 0xBB, 0xCC, 0xDD]]);
    }

    #[test]
    fn test_oversized_frame_is_skipped() {
        let mut stream = vec![251u8];
        stream.extend(core::iter::repeat(0x55).take(251));
        stream.extend([2, b'o', b'k']);

        let mut decoder = FrameDecoder::new();
        assert_eq!(decode(&mut decoder, &stream), vec![b"ok".to_vec()]);
        assert_eq!(decoder.skipped(), 1);
    }

    #[test]
    fn test_full_size_frame() {
        let mut stream = vec![MAX_FRAME as u8];
        stream.extend((0..MAX_FRAME).map(|i| i as u8));

        let mut decoder = FrameDecoder::new();
        let frames = decode(&mut decoder, &stream);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].len(), MAX_FRAME);
        assert_eq!(decoder.skipped(), 0);
    }

    #[test]
    fn test_reset_drops_partial_frame() {
        let mut decoder = FrameDecoder::new();
        decode(&mut decoder, &[5, 1, 2]);
        decoder.reset();
        assert_eq!(decode(&mut decoder, &[1, 42]), vec![vec![42]]);
    }

    #[test]
    fn test_channel_select_frame() {
        assert_eq!(channel_select(6), [2, b'C', 6]);
        let mut decoder = FrameDecoder::new();
        assert_eq!(decode(&mut decoder, &channel_select(1)), vec![vec![b'C', 1]]);
    }
}
