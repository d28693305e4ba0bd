//! Protocol module - wire format, frame scanning, and frame types.
//!
//! This module implements the binary framing for dialog multiplexing:
//! - 11-byte header encoding/decoding
//! - Frame scanner slicing receive blocks into frames
//! - Frame struct with typed accessors

mod frame;
mod scanner;
mod wire_format;

pub use frame::DialogFrame;
pub use scanner::FrameScanner;
pub use wire_format::{
    build_frame, flags, DialogHeader, ABSOLUTE_MAX_PAYLOAD_SIZE, DEFAULT_MAX_PAYLOAD_SIZE,
    HEADER_SIZE, RESERVED_DIALOG_TYPE,
};
