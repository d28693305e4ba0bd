//! Frame scanner: slices receive blocks into dialog frames.
//!
//! Implements a state machine over incoming [`BufSlice`] roots:
//! - `WaitingForHeader`: need at least 11 bytes
//! - `WaitingForPayload`: header parsed, need N more payload bytes
//!
//! A frame that is fully contained in one receive block is forked out
//! of the root zero-copy. Bytes of a frame that straddles block
//! boundaries are copied into a carry buffer and the completed payload
//! is rooted over the reassembled copy; only boundary frames pay the
//! copy.
//!
//! # Example
//!
//! ```ignore
//! let mut scanner = FrameScanner::new();
//! let mut root = BufSlice::root_pooled(block, pool, "receive block");
//!
//! for frame in scanner.push(&mut root)? {
//!     dispatch(frame);
//! }
//! root.mark_free();
//! ```

use bytes::{Bytes, BytesMut};

use crate::buffer::BufSlice;
use crate::error::Result;

use super::frame::DialogFrame;
use super::wire_format::{DialogHeader, DEFAULT_MAX_PAYLOAD_SIZE, HEADER_SIZE};

/// State machine for frame scanning.
#[derive(Debug, Clone, Copy)]
enum ScanState {
    /// Waiting for a complete header (need 11 bytes).
    WaitingForHeader,
    /// Header parsed, waiting for payload bytes.
    WaitingForPayload { header: DialogHeader },
}

/// Scanner extracting complete dialog frames from receive blocks.
///
/// One scanner per connection; it is driven from the connection's read
/// loop only and needs no internal synchronization.
pub struct FrameScanner {
    /// Current parsing state.
    state: ScanState,
    /// Bytes of a frame straddling block boundaries.
    carry: BytesMut,
    /// Maximum allowed payload size.
    max_payload_size: u32,
}

impl FrameScanner {
    /// Create a scanner with the default payload limit.
    pub fn new() -> Self {
        Self::with_max_payload(DEFAULT_MAX_PAYLOAD_SIZE)
    }

    /// Create a scanner with a custom payload limit.
    pub fn with_max_payload(max_payload_size: u32) -> Self {
        Self {
            state: ScanState::WaitingForHeader,
            carry: BytesMut::new(),
            max_payload_size,
        }
    }

    /// Scan one receive block and extract all complete frames.
    ///
    /// The caller keeps ownership of `root` and marks it free after the
    /// returned frames have been handed off; the block itself is
    /// collected once every forked payload has been released.
    ///
    /// # Errors
    ///
    /// `Protocol` if a header fails validation (reserved type, reserved
    /// flags, oversized payload). The connection is expected to be torn
    /// down on error; the scanner is not resynchronized.
    pub fn push(&mut self, root: &mut BufSlice) -> Result<Vec<DialogFrame>> {
        let mut frames = Vec::new();

        loop {
            match self.state {
                ScanState::WaitingForHeader => {
                    if self.carry.len() + root.remaining() < HEADER_SIZE {
                        self.stash_rest(root)?;
                        break;
                    }

                    let header = self.take_header(root)?;

                    if let Err(e) = header.validate(self.max_payload_size) {
                        self.log_rejected_header(root);
                        return Err(e);
                    }

                    self.state = ScanState::WaitingForPayload { header };
                }

                ScanState::WaitingForPayload { header } => {
                    let len = header.payload_length as usize;

                    if len == 0 {
                        frames.push(DialogFrame::new(
                            header,
                            BufSlice::root(Bytes::new(), "empty payload"),
                        ));
                        self.state = ScanState::WaitingForHeader;
                        continue;
                    }

                    // Fast path: whole payload inside this block.
                    if self.carry.is_empty() && root.remaining() >= len {
                        let payload = root.fork_and_advance(len, "dialog payload")?;
                        frames.push(DialogFrame::new(header, payload));
                        self.state = ScanState::WaitingForHeader;
                        continue;
                    }

                    if self.carry.len() + root.remaining() >= len {
                        let need = len - self.carry.len();
                        if need > 0 {
                            let tail = root.fork_and_advance(need, "payload carry")?;
                            self.carry.extend_from_slice(tail.buf());
                            tail.mark_free();
                        }
                        let block = self.carry.split().freeze();
                        frames.push(DialogFrame::new(
                            header,
                            BufSlice::root(block, "reassembled payload"),
                        ));
                        self.state = ScanState::WaitingForHeader;
                        continue;
                    }

                    self.stash_rest(root)?;
                    break;
                }
            }
        }

        Ok(frames)
    }

    /// Consume one header's worth of bytes from carry + block.
    fn take_header(&mut self, root: &mut BufSlice) -> Result<DialogHeader> {
        if self.carry.is_empty() {
            let slice = root.fork_and_advance(HEADER_SIZE, "dialog header")?;
            let header = decode_header(slice.buf())?;
            slice.mark_free();
            return Ok(header);
        }

        let need = HEADER_SIZE - self.carry.len();
        let tail = root.fork_and_advance(need, "header carry")?;
        self.carry.extend_from_slice(tail.buf());
        tail.mark_free();

        let header = decode_header(&self.carry)?;
        self.carry.clear();
        Ok(header)
    }

    /// Copy whatever is left of the block into the carry buffer.
    fn stash_rest(&mut self, root: &mut BufSlice) -> Result<()> {
        let rest = root.remaining();
        if rest > 0 {
            let tail = root.fork_and_advance(rest, "frame carry")?;
            self.carry.extend_from_slice(tail.buf());
            tail.mark_free();
        }
        Ok(())
    }

    /// Re-capture the raw bytes of a header that failed validation.
    ///
    /// Only possible when the header was consumed from this block; a
    /// header reassembled from carry is logged without raw bytes.
    fn log_rejected_header(&self, root: &mut BufSlice) {
        if root.cursor() < HEADER_SIZE {
            return;
        }
        if let Ok(raw) = root.fork_backwards(HEADER_SIZE, "rejected header") {
            tracing::error!(header_bytes = ?raw.buf(), "rejecting malformed frame header");
            raw.mark_free();
        }
    }

    /// Number of straddling bytes currently buffered.
    pub fn carry_len(&self) -> usize {
        self.carry.len()
    }

    /// Get the current state for debugging.
    #[cfg(test)]
    fn state_name(&self) -> &'static str {
        match self.state {
            ScanState::WaitingForHeader => "WaitingForHeader",
            ScanState::WaitingForPayload { .. } => "WaitingForPayload",
        }
    }
}

impl Default for FrameScanner {
    fn default() -> Self {
        Self::new()
    }
}

fn decode_header(buf: &[u8]) -> Result<DialogHeader> {
    DialogHeader::decode(buf)
        .ok_or_else(|| crate::error::MeshwireError::Protocol("Truncated frame header".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::BlockPool;
    use crate::protocol::wire_format::{build_frame, flags};

    fn make_frame_bytes(dialog_type: u16, flags: u8, dialog_id: u32, payload: &[u8]) -> Vec<u8> {
        let header = DialogHeader::new(dialog_type, flags, dialog_id, payload.len() as u32);
        build_frame(&header, payload)
    }

    fn root_over(bytes: &[u8]) -> BufSlice {
        BufSlice::root(Bytes::copy_from_slice(bytes), "test block")
    }

    #[test]
    fn test_single_complete_frame() {
        let mut scanner = FrameScanner::new();
        let mut root = root_over(&make_frame_bytes(1, 0, 42, b"hello"));

        let frames = scanner.push(&mut root).unwrap();

        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].dialog_type(), 1);
        assert_eq!(frames[0].dialog_id(), 42);
        assert_eq!(frames[0].payload.buf(), b"hello");
        assert_eq!(scanner.carry_len(), 0);
    }

    #[test]
    fn test_multiple_frames_in_one_block() {
        let mut scanner = FrameScanner::new();
        let mut combined = Vec::new();
        combined.extend(make_frame_bytes(1, 0, 1, b"first"));
        combined.extend(make_frame_bytes(2, 0, 2, b"second"));
        combined.extend(make_frame_bytes(3, 0, 3, b"third"));
        let mut root = root_over(&combined);

        let frames = scanner.push(&mut root).unwrap();

        assert_eq!(frames.len(), 3);
        assert_eq!(frames[0].dialog_type(), 1);
        assert_eq!(frames[1].dialog_type(), 2);
        assert_eq!(frames[2].dialog_type(), 3);
        assert_eq!(frames[2].payload.buf(), b"third");
    }

    #[test]
    fn test_empty_payload_frame() {
        let mut scanner = FrameScanner::new();
        let mut root = root_over(&make_frame_bytes(1, flags::FINAL_REQUEST, 7, b""));

        let frames = scanner.push(&mut root).unwrap();

        assert_eq!(frames.len(), 1);
        assert!(frames[0].payload.is_empty());
        assert!(frames[0].is_dialog_end());
    }

    #[test]
    fn test_fragmented_header_across_blocks() {
        let mut scanner = FrameScanner::new();
        let bytes = make_frame_bytes(1, 0, 42, b"test");

        let mut first = root_over(&bytes[..5]);
        let frames = scanner.push(&mut first).unwrap();
        assert!(frames.is_empty());
        assert_eq!(scanner.state_name(), "WaitingForHeader");
        assert_eq!(scanner.carry_len(), 5);

        let mut second = root_over(&bytes[5..]);
        let frames = scanner.push(&mut second).unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].payload.buf(), b"test");
        assert_eq!(scanner.carry_len(), 0);
    }

    #[test]
    fn test_fragmented_payload_across_blocks() {
        let mut scanner = FrameScanner::new();
        let payload = b"a longer payload that will straddle two receive blocks";
        let bytes = make_frame_bytes(1, 0, 42, payload);
        let split = HEADER_SIZE + 10;

        let mut first = root_over(&bytes[..split]);
        let frames = scanner.push(&mut first).unwrap();
        assert!(frames.is_empty());
        assert_eq!(scanner.state_name(), "WaitingForPayload");
        assert_eq!(scanner.carry_len(), 10);

        let mut second = root_over(&bytes[split..]);
        let frames = scanner.push(&mut second).unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].payload.buf(), &payload[..]);
    }

    #[test]
    fn test_byte_at_a_time() {
        let mut scanner = FrameScanner::new();
        let bytes = make_frame_bytes(1, 0, 42, b"hi");
        let mut all = Vec::new();

        for byte in &bytes {
            let mut root = root_over(&[*byte]);
            all.extend(scanner.push(&mut root).unwrap());
        }

        assert_eq!(all.len(), 1);
        assert_eq!(all[0].payload.buf(), b"hi");
    }

    #[test]
    fn test_mixed_complete_and_partial() {
        let mut scanner = FrameScanner::new();
        let frame1 = make_frame_bytes(1, 0, 1, b"first");
        let frame2 = make_frame_bytes(2, 0, 2, b"second");

        let mut data = frame1.clone();
        data.extend_from_slice(&frame2[..5]);
        let mut root = root_over(&data);

        let frames = scanner.push(&mut root).unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].dialog_type(), 1);

        let mut rest = root_over(&frame2[5..]);
        let frames = scanner.push(&mut rest).unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].dialog_type(), 2);
    }

    #[test]
    fn test_oversized_payload_rejected() {
        let mut scanner = FrameScanner::with_max_payload(100);
        let header = DialogHeader::new(1, 0, 42, 1000);
        let mut root = root_over(&header.encode());

        let result = scanner.push(&mut root);

        assert!(result.is_err());
        assert!(result
            .unwrap_err()
            .to_string()
            .contains("exceeds maximum"));
    }

    #[test]
    fn test_reserved_flags_rejected() {
        let mut scanner = FrameScanner::new();
        let header = DialogHeader::new(1, 0b0100_0000, 42, 0);
        let mut root = root_over(&header.encode());

        assert!(scanner.push(&mut root).is_err());
    }

    #[test]
    fn test_zero_copy_fast_path_shares_block() {
        let pool = BlockPool::with_config(4096, 4);
        let mut scanner = FrameScanner::new();

        let mut block = pool.acquire();
        block.extend_from_slice(&make_frame_bytes(1, 0, 9, b"zero copy payload"));
        let mut root = BufSlice::root_pooled(block.freeze(), pool.clone(), "receive block");

        let mut frames = scanner.push(&mut root).unwrap();
        let frame = frames.pop().unwrap();
        root.mark_free();

        // Block stays out of the pool while the payload fork is live.
        assert_eq!(pool.pooled_blocks(), 0);
        assert_eq!(frame.payload.buf(), b"zero copy payload");

        drop(frame);
        assert_eq!(pool.pooled_blocks(), 1);
    }

    #[test]
    fn test_block_collected_after_all_frames_released() {
        let pool = BlockPool::with_config(4096, 4);
        let mut scanner = FrameScanner::new();

        let mut combined = Vec::new();
        combined.extend(make_frame_bytes(1, 0, 1, b"one"));
        combined.extend(make_frame_bytes(1, 0, 2, b"two"));

        let mut block = pool.acquire();
        block.extend_from_slice(&combined);
        let mut root = BufSlice::root_pooled(block.freeze(), pool.clone(), "receive block");

        let frames = scanner.push(&mut root).unwrap();
        root.mark_free();
        assert_eq!(pool.pooled_blocks(), 0);

        for frame in frames {
            frame.into_payload().mark_free();
        }
        assert_eq!(pool.pooled_blocks(), 1);
    }
}
