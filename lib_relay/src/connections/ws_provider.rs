//! # WebSocket Provider Connector
//!
//! Dials provider endpoints with `tokio-tungstenite` and exposes the write half
//! as a [`BoxFrameSink`]. Nothing is ever read back from a provider: delivery is
//! fire-and-forget.

use futures_util::{future, SinkExt};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::protocol::Message as WsMessage;

use crate::core::controller::ProviderConnector;
use crate::core::event::{BoxFrameSink, Frame};
use crate::error::RelayError;

impl From<Frame> for WsMessage {
    fn from(frame: Frame) -> Self {
        match frame {
            Frame::Text(text) => WsMessage::text(text),
            Frame::Binary(bytes) => WsMessage::binary(bytes),
        }
    }
}

/// Connects to `ws://` and `wss://` provider endpoints.
#[derive(Debug, Clone, Copy, Default)]
pub struct WsProviderConnector;

impl ProviderConnector for WsProviderConnector {
    async fn connect(&self, endpoint: &str) -> Result<BoxFrameSink, RelayError> {
        let (ws_stream, response) = connect_async(endpoint).await.map_err(|e| RelayError::Dial {
            endpoint: endpoint.to_string(),
            reason: e.to_string(),
        })?;
        log::info!(
            "Connected to provider {} (HTTP {})",
            endpoint,
            response.status()
        );

        let sink = ws_stream
            .sink_map_err(RelayError::from)
            .with(|frame: Frame| future::ready(Ok::<_, RelayError>(WsMessage::from(frame))));
        Ok(Box::pin(sink))
    }
}
