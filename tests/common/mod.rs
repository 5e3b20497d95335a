//! In-process WebSocket server standing in for an audio node

#![allow(dead_code)]

use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::HeaderMap;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;

pub const WAIT: Duration = Duration::from_secs(5);

/// Accepts node connections on a random local port
pub struct TestNode {
    pub port: u16,
    connections: mpsc::UnboundedReceiver<ServerConnection>,
}

/// Server side of one accepted connection
pub struct ServerConnection {
    pub headers: HeaderMap,
    frames: mpsc::UnboundedReceiver<Value>,
    control: mpsc::UnboundedSender<Message>,
}

impl TestNode {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let (conn_tx, connections) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let captured = Arc::new(Mutex::new(HeaderMap::new()));
                let sink = captured.clone();
                let callback = move |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
                    *sink.lock().unwrap() = request.headers().clone();
                    Ok(response)
                };

                let Ok(ws) = tokio_tungstenite::accept_hdr_async(stream, callback).await else {
                    continue;
                };

                let (frame_tx, frames) = mpsc::unbounded_channel();
                let (control, mut control_rx) = mpsc::unbounded_channel::<Message>();
                let headers = captured.lock().unwrap().clone();

                tokio::spawn(async move {
                    let (mut write, mut read) = ws.split();
                    loop {
                        tokio::select! {
                            outgoing = control_rx.recv() => {
                                let Some(msg) = outgoing else { break };
                                let closing = matches!(msg, Message::Close(_));
                                if write.send(msg).await.is_err() || closing {
                                    break;
                                }
                            }
                            incoming = read.next() => {
                                match incoming {
                                    Some(Ok(Message::Text(text))) => {
                                        if let Ok(value) = serde_json::from_str(&text) {
                                            let _ = frame_tx.send(value);
                                        }
                                    }
                                    Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                                    Some(Ok(_)) => {}
                                }
                            }
                        }
                    }
                });

                if conn_tx
                    .send(ServerConnection {
                        headers,
                        frames,
                        control,
                    })
                    .is_err()
                {
                    break;
                }
            }
        });

        Self { port, connections }
    }

    /// Wait for the next client connection
    pub async fn accept(&mut self) -> ServerConnection {
        tokio::time::timeout(WAIT, self.connections.recv())
            .await
            .expect("timed out waiting for a connection")
            .expect("server stopped")
    }
}

impl ServerConnection {
    pub fn header(&self, name: &str) -> Option<String> {
        self.headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    }

    pub fn send_json(&self, value: Value) {
        let _ = self.control.send(Message::Text(value.to_string()));
    }

    pub fn send_raw(&self, text: &str) {
        let _ = self.control.send(Message::Text(text.to_string()));
    }

    /// Close the socket from the server side with code 1001
    pub fn close(&self) {
        let _ = self.control.send(Message::Close(Some(CloseFrame {
            code: CloseCode::Away,
            reason: "going away".into(),
        })));
    }

    /// Next JSON frame sent by the client, or `None` once it disconnected
    pub async fn next_frame(&mut self) -> Option<Value> {
        tokio::time::timeout(WAIT, self.frames.recv())
            .await
            .expect("timed out waiting for a frame")
    }
}

/// A local port with nothing listening on it
pub async fn closed_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}
