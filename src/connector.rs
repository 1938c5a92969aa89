//! Deduplicated upstream connection attempts.
//!
//! During reconnect storms several callers (drain loop, alarm reducer,
//! request handlers) may all want the upstream socket at once. The connector
//! guarantees at most one connect attempt is in flight: the first caller
//! runs it, everyone else awaits the same outcome.

use crate::error::{Error, Result};
use crate::upstream::UpstreamHandle;
use std::future::Future;
use tokio::sync::{watch, Mutex};

type ConnectOutcome = std::result::Result<UpstreamHandle, String>;

#[derive(Default)]
struct Slot {
    current: Option<UpstreamHandle>,
    inflight: Option<watch::Receiver<Option<ConnectOutcome>>>,
}

#[derive(Default)]
pub struct DedupedConnector {
    slot: Mutex<Slot>,
}

impl DedupedConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// The current handle, if the socket is still open.
    pub async fn current(&self) -> Option<UpstreamHandle> {
        let mut slot = self.slot.lock().await;
        match &slot.current {
            Some(h) if h.is_open() => Some(h.clone()),
            Some(_) => {
                slot.current = None;
                None
            }
            None => None,
        }
    }

    /// Return the open socket, join an in-flight attempt, or run a fresh one.
    /// Failures propagate to every awaiter.
    pub async fn connect<F, Fut>(&self, connect_fn: F) -> Result<UpstreamHandle>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<UpstreamHandle>>,
    {
        let tx = {
            let mut slot = self.slot.lock().await;
            if let Some(h) = &slot.current {
                if h.is_open() {
                    return Ok(h.clone());
                }
                slot.current = None;
            }
            if let Some(rx) = &slot.inflight {
                let mut rx = rx.clone();
                drop(slot);
                return Self::await_outcome(&mut rx).await;
            }
            let (tx, rx) = watch::channel(None);
            slot.inflight = Some(rx);
            tx
        };

        let outcome = connect_fn().await;
        let result = {
            let mut slot = self.slot.lock().await;
            slot.inflight = None;
            match outcome {
                Ok(handle) => {
                    slot.current = Some(handle.clone());
                    let _ = tx.send(Some(Ok(handle.clone())));
                    Ok(handle)
                }
                Err(e) => {
                    let msg = e.to_string();
                    let _ = tx.send(Some(Err(msg.clone())));
                    Err(Error::UpstreamUnavailable(msg))
                }
            }
        };
        result
    }

    /// Remove and return the current handle (for teardown).
    pub async fn take(&self) -> Option<UpstreamHandle> {
        self.slot.lock().await.current.take()
    }

    async fn await_outcome(
        rx: &mut watch::Receiver<Option<ConnectOutcome>>,
    ) -> Result<UpstreamHandle> {
        loop {
            if let Some(outcome) = rx.borrow().clone() {
                return outcome.map_err(Error::UpstreamUnavailable);
            }
            if rx.changed().await.is_err() {
                return Err(Error::UpstreamUnavailable(
                    "connect attempt abandoned".into(),
                ));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_concurrent_callers_share_one_attempt() {
        let connector = Arc::new(DedupedConnector::new());
        let attempts = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..4 {
            let connector = connector.clone();
            let attempts = attempts.clone();
            handles.push(tokio::spawn(async move {
                connector
                    .connect(|| async move {
                        attempts.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        let (handle, _rx) = UpstreamHandle::pipe(8);
                        Ok(handle)
                    })
                    .await
            }));
        }
        for h in handles {
            assert!(h.await.unwrap().is_ok());
        }
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_open_socket_returned_without_attempt() {
        let connector = DedupedConnector::new();
        let (handle, _rx) = UpstreamHandle::pipe(8);
        let first = connector
            .connect(|| async move { Ok(handle) })
            .await
            .unwrap();
        let second = connector
            .connect(|| async move {
                panic!("should not run");
            })
            .await
            .unwrap();
        assert!(first.is_open());
        assert!(second.is_open());
    }

    #[tokio::test]
    async fn test_failure_propagates_to_all_awaiters() {
        let connector = Arc::new(DedupedConnector::new());
        let c1 = connector.clone();
        let t1 = tokio::spawn(async move {
            c1.connect(|| async {
                tokio::time::sleep(Duration::from_millis(30)).await;
                Err(crate::error::Error::UpstreamUnavailable("boom".into()))
            })
            .await
        });
        tokio::time::sleep(Duration::from_millis(5)).await;
        let c2 = connector.clone();
        let t2 = tokio::spawn(async move {
            c2.connect(|| async {
                panic!("second attempt must not start while one is in flight");
            })
            .await
        });
        assert!(t1.await.unwrap().is_err());
        assert!(t2.await.unwrap().is_err());
    }

    #[tokio::test]
    async fn test_closed_socket_triggers_fresh_attempt() {
        let connector = DedupedConnector::new();
        let (handle, _rx) = UpstreamHandle::pipe(8);
        handle.mark_closed();
        let first = connector
            .connect(|| async move { Ok(handle) })
            .await
            .unwrap();
        assert!(!first.is_open());
        // current() prunes it, and connect runs a new attempt.
        assert!(connector.current().await.is_none());
        let ran = Arc::new(AtomicUsize::new(0));
        let ran_clone = ran.clone();
        let _ = connector
            .connect(|| async move {
                ran_clone.fetch_add(1, Ordering::SeqCst);
                let (h, _rx) = UpstreamHandle::pipe(8);
                Ok(h)
            })
            .await
            .unwrap();
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }
}
