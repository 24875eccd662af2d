//! Transport seam between the connection manager and the wire.
//!
//! [`Transport`] abstracts dialing; the returned writer/reader halves carry
//! the session. Production uses [`WsTransport`] (tokio-tungstenite); tests
//! substitute scripted fakes.

use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

use crate::error::TransportError;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// An event surfaced by the read half of a transport.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TransportEvent {
    /// A complete text payload.
    Text(String),
    /// The peer closed the stream, with an optional reason.
    Closed(Option<String>),
}

/// Dials a feed URL and returns the two halves of the session.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Establish a session, returning the write and read halves.
    async fn connect(
        &self,
        url: &str,
    ) -> Result<(Box<dyn TransportWriter>, Box<dyn TransportReader>), TransportError>;
}

/// Write half of a transport session.
#[async_trait]
pub trait TransportWriter: Send {
    /// Send a text payload.
    async fn send_text(&mut self, text: String) -> Result<(), TransportError>;

    /// Close the session. Errors are ignored; the session is over either way.
    async fn close(&mut self);
}

/// Read half of a transport session.
#[async_trait]
pub trait TransportReader: Send {
    /// Next event, or `None` once the stream is exhausted.
    async fn next_event(&mut self) -> Option<Result<TransportEvent, TransportError>>;
}

// ─────────────────────────────────────────────────────────────────────────────
// WebSocket implementation
// ─────────────────────────────────────────────────────────────────────────────

/// WebSocket transport backed by tokio-tungstenite.
#[derive(Clone, Copy, Debug, Default)]
pub struct WsTransport;

#[async_trait]
impl Transport for WsTransport {
    async fn connect(
        &self,
        url: &str,
    ) -> Result<(Box<dyn TransportWriter>, Box<dyn TransportReader>), TransportError> {
        let (stream, _response) = connect_async(url)
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        let (sink, stream) = stream.split();
        Ok((Box::new(WsWriter { sink }), Box::new(WsReader { stream })))
    }
}

struct WsWriter {
    sink: SplitSink<WsStream, Message>,
}

#[async_trait]
impl TransportWriter for WsWriter {
    async fn send_text(&mut self, text: String) -> Result<(), TransportError> {
        self.sink
            .send(Message::Text(text.into()))
            .await
            .map_err(|e| TransportError::Stream(e.to_string()))
    }

    async fn close(&mut self) {
        let _ = self.sink.send(Message::Close(None)).await;
        let _ = self.sink.close().await;
    }
}

struct WsReader {
    stream: SplitStream<WsStream>,
}

#[async_trait]
impl TransportReader for WsReader {
    async fn next_event(&mut self) -> Option<Result<TransportEvent, TransportError>> {
        loop {
            match self.stream.next().await? {
                Ok(Message::Text(text)) => {
                    return Some(Ok(TransportEvent::Text(text.to_string())));
                }
                Ok(Message::Close(frame)) => {
                    return Some(Ok(TransportEvent::Closed(
                        frame.map(|f| f.reason.to_string()),
                    )));
                }
                // Protocol pings and pongs are answered by the stack; binary
                // payloads are not part of the feed.
                Ok(_) => {}
                Err(e) => return Some(Err(TransportError::Stream(e.to_string()))),
            }
        }
    }
}
