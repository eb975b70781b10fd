//! # Ingress Gateway
//!
//! Reads the producer ("app") connection until it ends. Each data frame is
//! decoded as an [`Event`]; decoded events are appended to the shared buffer
//! one at a time, and every raw frame (decodable or not) is published on the
//! buffer's live feed. The next frame is not read until every pass-through
//! worker has room for the current one. A frame that fails to decode is logged and dropped
//! without ending the connection.
//!
//! There is no reconnection: once the stream yields an error or ends, this
//! gateway is done for good.

use std::sync::Arc;

use futures_util::{Stream, StreamExt};

use crate::core::event::{Event, Frame};
use crate::core::event_buffer::EventBuffer;
use crate::error::RelayError;

pub struct IngressGateway {
    connection_id: u64,
    buffer: Arc<EventBuffer>,
    accepted: usize,
    dropped: usize,
}

impl IngressGateway {
    pub fn new(connection_id: u64, buffer: Arc<EventBuffer>) -> Self {
        Self {
            connection_id,
            buffer,
            accepted: 0,
            dropped: 0,
        }
    }

    /// Consumes `source` until it closes (`Ok`) or fails (`Err`).
    pub async fn run<St>(mut self, mut source: St) -> Result<(), RelayError>
    where
        St: Stream<Item = Result<Frame, RelayError>> + Unpin,
    {
        while let Some(next) = source.next().await {
            match next {
                Ok(frame) => self.handle_frame(frame).await,
                Err(e) => {
                    log::warn!("App connection {} closed: {}", self.connection_id, e);
                    self.log_summary();
                    return Err(e);
                }
            }
        }

        log::info!("App connection {} closed by peer", self.connection_id);
        self.log_summary();
        Ok(())
    }

    async fn handle_frame(&mut self, frame: Frame) {
        match Event::decode(&frame) {
            Ok(event) => {
                log::trace!("Event '{}' received ({} bytes)", event.id, frame.len());
                self.buffer.ingest(frame, Some(event)).await;
                self.accepted += 1;
            }
            Err(e) => {
                log::warn!("Invalid event format: {}", e);
                self.buffer.ingest(frame, None).await;
                self.dropped += 1;
            }
        }
    }

    fn log_summary(&self) {
        log::info!(
            "App connection {}: {} events buffered, {} malformed frames dropped",
            self.connection_id,
            self.accepted,
            self.dropped
        );
    }
}
