//! [`Transport`] over an axum WebSocket.
//!
//! The socket is split: reads go straight to the stream half, writes are
//! queued on an mpsc channel drained by a dedicated send task. Closing queues
//! a close frame behind any pending messages, so a final status message is
//! always flushed before the connection goes away.

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket};
use futures::stream::SplitStream;
use futures::{SinkExt, StreamExt};
use tokio::sync::{mpsc, Mutex};
use tracing::debug;

use super::{ServerMessage, Transport, TransportError};

pub struct WsTransport {
    inbound: Mutex<SplitStream<WebSocket>>,
    outbound: mpsc::Sender<Message>,
    closed: AtomicBool,
}

impl WsTransport {
    pub fn new(socket: WebSocket) -> Self {
        let (mut ws_sink, ws_stream) = socket.split();
        let (tx, mut rx) = mpsc::channel::<Message>(64);

        tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                let closing = matches!(msg, Message::Close(_));
                if let Err(e) = ws_sink.send(msg).await {
                    debug!("WebSocket send failed: {e}");
                    break;
                }
                if closing {
                    break;
                }
            }
            let _ = ws_sink.close().await;
        });

        Self {
            inbound: Mutex::new(ws_stream),
            outbound: tx,
            closed: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl Transport for WsTransport {
    async fn recv(&self) -> Result<String, TransportError> {
        let mut stream = self.inbound.lock().await;
        loop {
            match stream.next().await {
                Some(Ok(Message::Text(text))) => return Ok(text.as_str().to_owned()),
                Some(Ok(Message::Binary(data))) => {
                    return String::from_utf8(data.to_vec())
                        .map_err(|e| TransportError::Malformed(e.to_string()));
                }
                Some(Ok(Message::Close(_))) | None => return Err(TransportError::Closed),
                Some(Ok(_)) => {}
                Some(Err(e)) => return Err(TransportError::Io(e.to_string())),
            }
        }
    }

    async fn send(&self, message: ServerMessage) -> Result<(), TransportError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }
        let text =
            serde_json::to_string(&message).map_err(|e| TransportError::Malformed(e.to_string()))?;
        self.outbound
            .send(Message::Text(text.into()))
            .await
            .map_err(|_| TransportError::Closed)
    }

    async fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            let _ = self.outbound.send(Message::Close(None)).await;
        }
    }
}
