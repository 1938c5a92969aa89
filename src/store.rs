//! Durable per-session storage and the deadline-driven alarm.
//!
//! A session persists exactly one record (the `AdapterState` under the
//! `"state"` key) plus an orthogonal alarm slot holding the next instant the
//! alarm reducer must run. `StateStore` keeps an in-memory mirror, persists
//! every mutation, and recomputes the alarm as the minimum of the defined
//! deadline fields. Adapters never arm the alarm directly; they only write
//! deadline fields.

use crate::error::Result;
use crate::state::{AdapterState, StatePatch};
use std::collections::HashMap;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Mutex as StdMutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::{watch, RwLock};

/// The single logical key the record is stored under.
pub const STATE_KEY: &str = "state";

/// Grace period between a client disconnect and the occupancy re-check.
pub const CLEANUP_GRACE_MS: u64 = 100;

/// Idle time before a session winds itself down.
pub const DEFAULT_INACTIVITY_TIMEOUT_MS: u64 = 10 * 60 * 1000;

/// Alarm is not re-armed when the new minimum is later than the armed
/// instant by less than this.
pub const ALARM_CHURN_GUARD_MS: u64 = 250;

/// Inactivity deadline is not rewritten for extensions smaller than this.
pub const INACTIVITY_CHURN_GUARD_MS: u64 = 1000;

/// Milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// In-memory backend for tests.
#[derive(Default)]
pub struct MemoryStore {
    data: StdMutex<HashMap<String, Vec<u8>>>,
    alarm: StdMutex<Option<u64>>,
}

/// File-backed backend: one directory per session, one JSON file per key,
/// atomic overwrite via temp file + rename.
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    pub fn new(state_dir: &PathBuf, session_name: &str) -> Self {
        Self {
            dir: state_dir.join(session_name),
        }
    }

    fn key_path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.json", key))
    }

    fn alarm_path(&self) -> PathBuf {
        self.dir.join("alarm")
    }

    async fn write_atomic(&self, path: &PathBuf, value: &[u8]) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, value).await?;
        tokio::fs::rename(&tmp, path).await?;
        Ok(())
    }
}

/// The durable store a session adapter persists through.
pub enum StoreBackend {
    Memory(MemoryStore),
    File(FileStore),
}

impl StoreBackend {
    pub fn memory() -> Self {
        StoreBackend::Memory(MemoryStore::default())
    }

    pub fn file(state_dir: &PathBuf, session_name: &str) -> Self {
        StoreBackend::File(FileStore::new(state_dir, session_name))
    }

    pub async fn put(&self, key: &str, value: Vec<u8>) -> Result<()> {
        match self {
            StoreBackend::Memory(m) => {
                m.data.lock().unwrap().insert(key.to_string(), value);
                Ok(())
            }
            StoreBackend::File(f) => f.write_atomic(&f.key_path(key), &value).await,
        }
    }

    pub async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        match self {
            StoreBackend::Memory(m) => Ok(m.data.lock().unwrap().get(key).cloned()),
            StoreBackend::File(f) => match tokio::fs::read(f.key_path(key)).await {
                Ok(bytes) => Ok(Some(bytes)),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
                Err(e) => Err(e.into()),
            },
        }
    }

    pub async fn delete(&self, key: &str) -> Result<bool> {
        match self {
            StoreBackend::Memory(m) => Ok(m.data.lock().unwrap().remove(key).is_some()),
            StoreBackend::File(f) => match tokio::fs::remove_file(f.key_path(key)).await {
                Ok(_) => Ok(true),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
                Err(e) => Err(e.into()),
            },
        }
    }

    pub async fn delete_all(&self) -> Result<()> {
        match self {
            StoreBackend::Memory(m) => {
                m.data.lock().unwrap().clear();
                *m.alarm.lock().unwrap() = None;
                Ok(())
            }
            StoreBackend::File(f) => match tokio::fs::remove_dir_all(&f.dir).await {
                Ok(_) => Ok(()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                Err(e) => Err(e.into()),
            },
        }
    }

    pub async fn set_alarm(&self, at_ms: u64) -> Result<()> {
        match self {
            StoreBackend::Memory(m) => {
                *m.alarm.lock().unwrap() = Some(at_ms);
                Ok(())
            }
            StoreBackend::File(f) => {
                f.write_atomic(&f.alarm_path(), at_ms.to_string().as_bytes())
                    .await
            }
        }
    }

    pub async fn delete_alarm(&self) -> Result<()> {
        match self {
            StoreBackend::Memory(m) => {
                *m.alarm.lock().unwrap() = None;
                Ok(())
            }
            StoreBackend::File(f) => match tokio::fs::remove_file(f.alarm_path()).await {
                Ok(_) => Ok(()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                Err(e) => Err(e.into()),
            },
        }
    }

    pub async fn get_alarm(&self) -> Result<Option<u64>> {
        match self {
            StoreBackend::Memory(m) => Ok(*m.alarm.lock().unwrap()),
            StoreBackend::File(f) => match tokio::fs::read_to_string(f.alarm_path()).await {
                Ok(s) => Ok(s.trim().parse().ok()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
                Err(e) => Err(e.into()),
            },
        }
    }
}

/// In-memory mirror over a `StoreBackend`, with alarm recomputation.
pub struct StateStore {
    backend: StoreBackend,
    state: RwLock<AdapterState>,
    alarm_tx: watch::Sender<Option<u64>>,
    label: String,
}

impl StateStore {
    /// Load the persisted record and alarm before the store is handed to
    /// anyone. The caller publishes the adapter only after this returns, so
    /// no handler can observe pre-restore state.
    pub async fn restore(backend: StoreBackend, label: &str) -> Result<Self> {
        let state = match backend.get(STATE_KEY).await? {
            Some(bytes) => serde_json::from_slice(&bytes)?,
            None => AdapterState::default(),
        };
        let alarm = backend.get_alarm().await?;
        if let Some(at) = alarm {
            eprintln!("[State {}] Restored with alarm armed at {}", label, at);
        }
        let (alarm_tx, _) = watch::channel(alarm);
        Ok(Self {
            backend,
            state: RwLock::new(state),
            alarm_tx,
            label: label.to_string(),
        })
    }

    pub async fn snapshot(&self) -> AdapterState {
        self.state.read().await.clone()
    }

    /// Receiver for the alarm task; carries the armed instant.
    pub fn alarm_rx(&self) -> watch::Receiver<Option<u64>> {
        self.alarm_tx.subscribe()
    }

    /// Merge a patch into the mirror, persist, and (unless suppressed)
    /// recompute the alarm.
    pub async fn update(&self, patch: StatePatch, skip_alarm_reschedule: bool) -> Result<AdapterState> {
        let snapshot = {
            let mut state = self.state.write().await;
            state.apply(patch);
            state.clone()
        };
        self.persist(&snapshot).await?;
        if !skip_alarm_reschedule {
            self.reschedule_alarm_for(&snapshot).await?;
        }
        Ok(snapshot)
    }

    /// Arm (or extend) the inactivity deadline. Earliest-wins monotonic: an
    /// armed deadline is never shortened, and extensions under the churn
    /// guard are skipped.
    pub async fn schedule_inactivity(&self, deadline_ms: u64) -> Result<()> {
        {
            let state = self.state.read().await;
            if let Some(current) = state.inactivity_deadline {
                if deadline_ms <= current
                    || deadline_ms - current < INACTIVITY_CHURN_GUARD_MS
                {
                    return Ok(());
                }
            }
        }
        self.update(
            StatePatch {
                inactivity_deadline: Some(Some(deadline_ms)),
                ..Default::default()
            },
            false,
        )
        .await?;
        Ok(())
    }

    /// Arm the post-disconnect cleanup check. Idempotent: an earlier armed
    /// cleanup wins.
    pub async fn schedule_cleanup(&self) -> Result<()> {
        let deadline = now_ms() + CLEANUP_GRACE_MS;
        {
            let state = self.state.read().await;
            if let Some(current) = state.cleanup_deadline {
                if current <= deadline {
                    return Ok(());
                }
            }
        }
        self.update(
            StatePatch {
                cleanup_deadline: Some(Some(deadline)),
                ..Default::default()
            },
            false,
        )
        .await?;
        Ok(())
    }

    /// Recompute the alarm from the current mirror.
    pub async fn reschedule_alarm(&self) -> Result<()> {
        let snapshot = self.snapshot().await;
        self.reschedule_alarm_for(&snapshot).await
    }

    /// Drop the persisted record and alarm. The mirror is wiped too so a
    /// handler resuming mid-destroy observes missing fields.
    pub async fn destroy(&self) -> Result<()> {
        {
            let mut state = self.state.write().await;
            *state = AdapterState {
                session_name: state.session_name.clone(),
                ..Default::default()
            };
        }
        self.backend.delete_alarm().await?;
        self.alarm_tx.send_replace(None);
        self.backend.delete_all().await?;
        eprintln!("[State {}] Record and alarm deleted", self.label);
        Ok(())
    }

    pub async fn persisted_record_exists(&self) -> Result<bool> {
        Ok(self.backend.get(STATE_KEY).await?.is_some())
    }

    async fn persist(&self, snapshot: &AdapterState) -> Result<()> {
        let bytes = serde_json::to_vec(snapshot)?;
        self.backend.put(STATE_KEY, bytes).await
    }

    async fn reschedule_alarm_for(&self, snapshot: &AdapterState) -> Result<()> {
        let next = snapshot.earliest_deadline();
        let armed = *self.alarm_tx.borrow();
        match (armed, next) {
            (Some(cur), Some(n)) => {
                // An armed alarm slightly earlier than the new minimum is
                // left alone; the reducer re-arms after a no-op firing. An
                // earlier required deadline always wins.
                if cur <= n && n - cur < ALARM_CHURN_GUARD_MS {
                    return Ok(());
                }
                if cur != n {
                    self.backend.set_alarm(n).await?;
                    self.alarm_tx.send_replace(Some(n));
                }
            }
            (None, Some(n)) => {
                self.backend.set_alarm(n).await?;
                self.alarm_tx.send_replace(Some(n));
            }
            (Some(_), None) => {
                self.backend.delete_alarm().await?;
                self.alarm_tx.send_replace(None);
            }
            (None, None) => {}
        }
        Ok(())
    }
}

/// Drive an alarm reducer from a `StateStore`'s alarm signal. Fires the
/// callback whenever the armed instant passes; tolerates spurious wakes and
/// re-arms from whatever the reducer left behind.
pub fn spawn_alarm_task<F, Fut>(
    mut rx: watch::Receiver<Option<u64>>,
    label: String,
    on_fire: F,
) -> tokio::task::JoinHandle<()>
where
    F: Fn() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send,
{
    tokio::spawn(async move {
        loop {
            let armed = *rx.borrow_and_update();
            match armed {
                None => {
                    if rx.changed().await.is_err() {
                        break;
                    }
                }
                Some(at_ms) => {
                    let now = now_ms();
                    if at_ms <= now {
                        on_fire().await;
                        // The reducer's merged update moves or clears the
                        // alarm; guard against a wedged value.
                        tokio::select! {
                            r = rx.changed() => {
                                if r.is_err() {
                                    break;
                                }
                            }
                            _ = tokio::time::sleep(Duration::from_millis(50)) => {}
                        }
                    } else {
                        tokio::select! {
                            _ = tokio::time::sleep(Duration::from_millis(at_ms - now)) => {
                                on_fire().await;
                            }
                            r = rx.changed() => {
                                if r.is_err() {
                                    break;
                                }
                            }
                        }
                    }
                }
            }
        }
        eprintln!("[Alarm {}] task exiting", label);
    })
}
