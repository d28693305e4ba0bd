//! Per-dialog context handed to handlers.
//!
//! Provides methods for sending frames back on the dialog's endpoint:
//! - `respond` / `respond_bytes` - intermediate response frame
//! - `complete_bytes` - final response frame, closing the dialog
//! - `end` - close the dialog with an empty final frame
//! - `error` - error response, closing the dialog
//!
//! Payloads are opaque bytes; serialization belongs to the layer above.

use bytes::Bytes;

use crate::error::Result;
use crate::protocol::{flags, DialogHeader};
use crate::writer::{OutboundFrame, WriterHandle};

/// Context passed to dialog handlers.
///
/// `Clone` and cheap to share across tasks; the underlying writer is
/// channel-based, so responses from concurrent dialogs never contend on
/// a lock.
#[derive(Clone)]
pub struct DialogContext {
    /// Dialog type of this exchange.
    dialog_type: u16,
    /// Dialog ID correlating request and response frames.
    dialog_id: u32,
    /// Writer handle for the owning endpoint; absent in tests.
    writer: Option<WriterHandle>,
}

impl DialogContext {
    /// Create a detached context (for testing without a writer).
    pub fn detached(dialog_type: u16, dialog_id: u32) -> Self {
        Self {
            dialog_type,
            dialog_id,
            writer: None,
        }
    }

    /// Create a context bound to an endpoint's writer.
    pub fn with_writer(dialog_type: u16, dialog_id: u32, writer: WriterHandle) -> Self {
        Self {
            dialog_type,
            dialog_id,
            writer: Some(writer),
        }
    }

    /// Get the dialog type.
    #[inline]
    pub fn dialog_type(&self) -> u16 {
        self.dialog_type
    }

    /// Get the dialog ID.
    #[inline]
    pub fn dialog_id(&self) -> u32 {
        self.dialog_id
    }

    /// Send an intermediate response (copies the payload).
    pub async fn respond(&self, payload: &[u8]) -> Result<()> {
        self.send_frame(flags::RESPONSE, Bytes::copy_from_slice(payload))
            .await
    }

    /// Send an intermediate response with pre-allocated bytes (zero-copy).
    pub async fn respond_bytes(&self, payload: Bytes) -> Result<()> {
        self.send_frame(flags::RESPONSE, payload).await
    }

    /// Send the final response, closing the dialog.
    pub async fn complete_bytes(&self, payload: Bytes) -> Result<()> {
        self.send_frame(flags::FINAL_RESPONSE, payload).await
    }

    /// Close the dialog with an empty final frame.
    pub async fn end(&self) -> Result<()> {
        self.send_frame(flags::FINAL_RESPONSE, Bytes::new()).await
    }

    /// Send an error response, closing the dialog.
    ///
    /// The message travels as UTF-8 bytes for the peer's diagnostics.
    pub async fn error(&self, message: &str) -> Result<()> {
        self.send_frame(
            flags::ERROR_RESPONSE,
            Bytes::copy_from_slice(message.as_bytes()),
        )
        .await
    }

    /// Send a frame with the given flags and payload.
    async fn send_frame(&self, frame_flags: u8, payload: Bytes) -> Result<()> {
        let writer = match &self.writer {
            Some(w) => w,
            // Detached context (testing mode).
            None => return Ok(()),
        };

        let header = DialogHeader::new(
            self.dialog_type,
            frame_flags,
            self.dialog_id,
            payload.len() as u32,
        );
        writer.send(OutboundFrame::new(&header, payload)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_detached_context_swallows_frames() {
        let ctx = DialogContext::detached(1, 42);

        assert_eq!(ctx.dialog_type(), 1);
        assert_eq!(ctx.dialog_id(), 42);
        ctx.respond(b"data").await.unwrap();
        ctx.error("boom").await.unwrap();
        ctx.end().await.unwrap();
    }
}
