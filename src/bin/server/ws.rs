//! Socket pump shared by all accepted WebSocket connections.
//!
//! Each accepted socket becomes one task: outbound frames come from the
//! adapter through the registry channel; inbound binary frames (SFU media)
//! are forwarded to the adapter through an optional channel. Pings are
//! answered in place so keepalives never reach adapter logic.

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use mediabridge::ClientFrame;
use tokio::sync::mpsc;

pub async fn pump_socket(
    socket: WebSocket,
    mut outbound: mpsc::Receiver<ClientFrame>,
    inbound: Option<mpsc::Sender<Vec<u8>>>,
) {
    let (mut sender, mut receiver) = socket.split();

    loop {
        tokio::select! {
            frame = outbound.recv() => {
                match frame {
                    Some(ClientFrame::Text(text)) => {
                        if sender.send(Message::Text(text)).await.is_err() {
                            break;
                        }
                    }
                    Some(ClientFrame::Binary(bytes)) => {
                        if sender.send(Message::Binary(bytes.to_vec())).await.is_err() {
                            break;
                        }
                    }
                    Some(ClientFrame::Close { code, reason }) => {
                        let _ = sender
                            .send(Message::Close(Some(CloseFrame {
                                code,
                                reason: reason.into(),
                            })))
                            .await;
                        break;
                    }
                    // Registry dropped us (superseded or role closed).
                    None => {
                        let _ = sender.send(Message::Close(None)).await;
                        break;
                    }
                }
            }
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Binary(data))) => {
                        if let Some(tx) = &inbound {
                            if tx.send(data).await.is_err() {
                                break;
                            }
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if sender.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(_)) => break,
                    _ => {}
                }
            }
        }
    }
}
