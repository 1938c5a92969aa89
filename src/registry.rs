//! Registry of accepted client WebSockets.
//!
//! The adapter never touches sockets directly: each accepted connection is a
//! task in the server shell holding the socket, reachable through a bounded
//! channel of outbound frames. The registry tracks the channel ends with a
//! typed attachment per socket and enforces the single-subscriber policy for
//! the SFU-facing roles.

use bytes::Bytes;
use std::sync::Mutex;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Close code and reason used when a newer subscriber takes over a
/// single-subscriber role.
pub const SUPERSEDED_REASON: &str = "Superseded by newer subscriber";

/// Outbound frame for a client socket task.
#[derive(Debug, Clone)]
pub enum ClientFrame {
    Text(String),
    Binary(Bytes),
    Close { code: u16, reason: String },
}

/// Typed role of an accepted socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientRole {
    /// SFU pulling the synthesized TTS track (single subscriber).
    SfuSubscriber,
    /// SFU pushing microphone PCM (single subscriber).
    SfuAudio,
    /// SFU pushing camera JPEG frames (single subscriber).
    SfuVideo,
    /// Browser clients receiving transcripts (unbounded).
    TranscriptionStream,
    /// Browser clients receiving JPEG frames (unbounded).
    Viewer,
}

impl ClientRole {
    pub fn is_single_subscriber(&self) -> bool {
        matches!(
            self,
            ClientRole::SfuSubscriber | ClientRole::SfuAudio | ClientRole::SfuVideo
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ClientRole::SfuSubscriber => "sfu-subscriber",
            ClientRole::SfuAudio => "sfu-audio",
            ClientRole::SfuVideo => "sfu-video",
            ClientRole::TranscriptionStream => "transcription-stream",
            ClientRole::Viewer => "viewer",
        }
    }
}

struct ClientEntry {
    id: Uuid,
    role: ClientRole,
    created_at: u64,
    tx: mpsc::Sender<ClientFrame>,
}

impl ClientEntry {
    fn is_open(&self) -> bool {
        !self.tx.is_closed()
    }
}

#[derive(Default)]
pub struct ClientRegistry {
    clients: Mutex<Vec<ClientEntry>>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a socket. For single-subscriber roles any previous socket of
    /// the same role is closed with 1000 and dropped. Returns the socket id
    /// and the receiver its task drains.
    pub fn accept(&self, role: ClientRole) -> (Uuid, mpsc::Receiver<ClientFrame>) {
        let id = Uuid::new_v4();
        let (tx, rx) = mpsc::channel(64);
        let mut clients = self.clients.lock().unwrap();

        if role.is_single_subscriber() {
            for old in clients.iter().filter(|c| c.role == role && c.is_open()) {
                eprintln!(
                    "[Registry] Superseding {} socket {}",
                    role.as_str(),
                    old.id
                );
                let _ = old.tx.try_send(ClientFrame::Close {
                    code: 1000,
                    reason: SUPERSEDED_REASON.to_string(),
                });
            }
            clients.retain(|c| c.role != role);
        }

        clients.push(ClientEntry {
            id,
            role,
            created_at: crate::store::now_ms(),
            tx,
        });
        (id, rx)
    }

    /// Drop a socket from the registry (its task has ended).
    pub fn remove(&self, id: Uuid) -> bool {
        let mut clients = self.clients.lock().unwrap();
        let before = clients.len();
        clients.retain(|c| c.id != id);
        clients.len() != before
    }

    /// Send a frame to every open socket of the role. Slow clients that
    /// cannot take the frame are skipped. Returns the number of deliveries.
    pub fn fan_out(&self, role: ClientRole, frame: ClientFrame) -> usize {
        let clients = self.clients.lock().unwrap();
        let mut sent = 0;
        for c in clients.iter().filter(|c| c.role == role && c.is_open()) {
            match c.tx.try_send(frame.clone()) {
                Ok(_) => sent += 1,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    eprintln!(
                        "[Registry] {} socket {} lagging, dropping frame",
                        role.as_str(),
                        c.id
                    );
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {}
            }
        }
        sent
    }

    /// Deliver to a single socket.
    pub fn send_to(&self, id: Uuid, frame: ClientFrame) -> bool {
        let clients = self.clients.lock().unwrap();
        clients
            .iter()
            .find(|c| c.id == id && c.is_open())
            .map(|c| c.tx.try_send(frame).is_ok())
            .unwrap_or(false)
    }

    /// Close every open socket of the role and drop the entries.
    pub fn close_role(&self, role: ClientRole, code: u16, reason: &str) {
        let mut clients = self.clients.lock().unwrap();
        for c in clients.iter().filter(|c| c.role == role && c.is_open()) {
            let _ = c.tx.try_send(ClientFrame::Close {
                code,
                reason: reason.to_string(),
            });
        }
        clients.retain(|c| c.role != role);
    }

    /// Close everything (destroy path).
    pub fn close_all(&self, code: u16, reason: &str) {
        let mut clients = self.clients.lock().unwrap();
        for c in clients.iter().filter(|c| c.is_open()) {
            let _ = c.tx.try_send(ClientFrame::Close {
                code,
                reason: reason.to_string(),
            });
        }
        clients.clear();
    }

    /// Open sockets of one role.
    pub fn open_count(&self, role: ClientRole) -> usize {
        let mut clients = self.clients.lock().unwrap();
        clients.retain(|c| c.is_open());
        clients.iter().filter(|c| c.role == role).count()
    }

    /// Open sockets of any role.
    pub fn total_open(&self) -> usize {
        let mut clients = self.clients.lock().unwrap();
        clients.retain(|c| c.is_open());
        clients.len()
    }

    /// Age of a socket in milliseconds, if still registered.
    pub fn created_at(&self, id: Uuid) -> Option<u64> {
        let clients = self.clients.lock().unwrap();
        clients.iter().find(|c| c.id == id).map(|c| c.created_at)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_subscriber_superseded() {
        let reg = ClientRegistry::new();
        let (_id1, mut rx1) = reg.accept(ClientRole::SfuAudio);
        let (_id2, _rx2) = reg.accept(ClientRole::SfuAudio);
        assert_eq!(reg.open_count(ClientRole::SfuAudio), 1);

        // The first socket got the close frame before being dropped.
        match rx1.try_recv() {
            Ok(ClientFrame::Close { code, reason }) => {
                assert_eq!(code, 1000);
                assert_eq!(reason, SUPERSEDED_REASON);
            }
            other => panic!("expected close frame, got {:?}", other),
        }
    }

    #[test]
    fn test_unbounded_roles_accumulate() {
        let reg = ClientRegistry::new();
        let (_a, _rx_a) = reg.accept(ClientRole::Viewer);
        let (_b, _rx_b) = reg.accept(ClientRole::Viewer);
        let (_c, _rx_c) = reg.accept(ClientRole::TranscriptionStream);
        assert_eq!(reg.open_count(ClientRole::Viewer), 2);
        assert_eq!(reg.open_count(ClientRole::TranscriptionStream), 1);
        assert_eq!(reg.total_open(), 3);
    }

    #[test]
    fn test_fan_out_reaches_open_sockets_only() {
        let reg = ClientRegistry::new();
        let (_a, mut rx_a) = reg.accept(ClientRole::Viewer);
        let (_b, rx_b) = reg.accept(ClientRole::Viewer);
        drop(rx_b); // socket task gone
        let sent = reg.fan_out(ClientRole::Viewer, ClientFrame::Binary(Bytes::from_static(&[9])));
        assert_eq!(sent, 1);
        assert!(matches!(rx_a.try_recv(), Ok(ClientFrame::Binary(_))));
    }

    #[test]
    fn test_close_role() {
        let reg = ClientRegistry::new();
        let (_a, mut rx_a) = reg.accept(ClientRole::TranscriptionStream);
        let (_b, _rx_v) = reg.accept(ClientRole::Viewer);
        reg.close_role(ClientRole::TranscriptionStream, 1000, "Transcription complete");
        assert_eq!(reg.open_count(ClientRole::TranscriptionStream), 0);
        assert_eq!(reg.open_count(ClientRole::Viewer), 1);
        match rx_a.try_recv() {
            Ok(ClientFrame::Close { reason, .. }) => {
                assert_eq!(reason, "Transcription complete");
            }
            other => panic!("expected close frame, got {:?}", other),
        }
    }

    #[test]
    fn test_remove_and_counts() {
        let reg = ClientRegistry::new();
        let (id, _rx) = reg.accept(ClientRole::SfuVideo);
        assert!(reg.remove(id));
        assert!(!reg.remove(id));
        assert_eq!(reg.total_open(), 0);
    }
}
