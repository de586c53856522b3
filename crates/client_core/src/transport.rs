use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, warn};

use crate::error::TransportError;

/// What the reader side of an open transport reports.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Frame(String),
    Error(String),
    Closed,
}

/// An open socket, split into an outbound text sink and an inbound event
/// stream. Dropping `outbound` closes the socket.
pub struct Transport {
    pub outbound: mpsc::UnboundedSender<String>,
    pub inbound: mpsc::UnboundedReceiver<TransportEvent>,
}

#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> Result<Transport, TransportError>;
}

pub struct WebSocketConnector {
    url: String,
}

impl WebSocketConnector {
    pub fn new(url: impl Into<String>) -> Result<Self, TransportError> {
        let url = websocket_url(&url.into())?;
        Ok(Self { url })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl Connector for WebSocketConnector {
    async fn connect(&self) -> Result<Transport, TransportError> {
        let (ws_stream, _) = connect_async(self.url.as_str())
            .await
            .map_err(|err| TransportError::Connect(format!("{}: {err}", self.url)))?;
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<String>();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();

        let writer_events = inbound_tx.clone();
        tokio::spawn(async move {
            while let Some(text) = outbound_rx.recv().await {
                if let Err(err) = ws_writer.send(Message::Text(text)).await {
                    warn!(error = %err, "websocket send failed");
                    let _ = writer_events.send(TransportEvent::Error(err.to_string()));
                    return;
                }
            }
            debug!("outbound channel dropped; closing websocket");
            let _ = ws_writer.close().await;
        });

        tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(Message::Text(text)) => {
                        if inbound_tx.send(TransportEvent::Frame(text)).is_err() {
                            return;
                        }
                    }
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(err) => {
                        let _ = inbound_tx.send(TransportEvent::Error(format!(
                            "websocket receive failed: {err}"
                        )));
                        return;
                    }
                }
            }
            let _ = inbound_tx.send(TransportEvent::Closed);
        });

        Ok(Transport {
            outbound: outbound_tx,
            inbound: inbound_rx,
        })
    }
}

/// Accepts `ws(s)://` as is and maps `http(s)://` onto the websocket scheme.
pub fn websocket_url(raw: &str) -> Result<String, TransportError> {
    let raw = raw.trim();
    let url = if raw.starts_with("ws://") || raw.starts_with("wss://") {
        raw.to_string()
    } else if raw.starts_with("https://") {
        raw.replacen("https://", "wss://", 1)
    } else if raw.starts_with("http://") {
        raw.replacen("http://", "ws://", 1)
    } else {
        return Err(TransportError::InvalidUrl(raw.to_string()));
    };
    url::Url::parse(&url).map_err(|_| TransportError::InvalidUrl(raw.to_string()))?;
    Ok(url)
}

#[cfg(test)]
#[path = "tests/transport_tests.rs"]
mod tests;
