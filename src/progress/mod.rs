pub mod store;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::error::{StoreResult, VerifyError};
use crate::footnotes::types::{ProgressSnapshot, RunStatus};

use store::SnapshotStore;

const COMMAND_BUFFER: usize = 64;

enum ProgressCommand {
    Get {
        reply: oneshot::Sender<StoreResult<Option<ProgressSnapshot>>>,
    },
    Set {
        snapshot: ProgressSnapshot,
        reply: oneshot::Sender<StoreResult<ProgressSnapshot>>,
    },
    Begin {
        snapshot: ProgressSnapshot,
        reply: oneshot::Sender<StoreResult<Option<ProgressSnapshot>>>,
    },
    Subscribe {
        subscriber: mpsc::UnboundedSender<ProgressSnapshot>,
        reply: oneshot::Sender<StoreResult<()>>,
    },
}

/// Address of one document's progress actor. Cheap to clone.
///
/// The actor task is the only writer of the snapshot; every read, write and
/// subscription is a message to it, handled one at a time.
#[derive(Clone)]
pub struct ProgressHandle {
    document_id: Arc<str>,
    tx: mpsc::Sender<ProgressCommand>,
}

impl ProgressHandle {
    /// Spawn the actor for `document_id`. It stops once every handle is
    /// dropped; the hub only keeps weak references.
    pub fn spawn(document_id: &str, store: Arc<dyn SnapshotStore>) -> Self {
        let (tx, rx) = mpsc::channel(COMMAND_BUFFER);
        let actor = ProgressActor {
            document_id: document_id.to_string(),
            store,
            current: None,
            loaded: false,
            subscribers: Vec::new(),
        };
        tokio::spawn(actor.run(rx));
        Self {
            document_id: document_id.into(),
            tx,
        }
    }

    pub fn document_id(&self) -> &str {
        &self.document_id
    }

    /// Current snapshot, or `None` before the first `set`.
    pub async fn get(&self) -> Result<Option<ProgressSnapshot>, VerifyError> {
        let (reply, rx) = oneshot::channel();
        self.request(ProgressCommand::Get { reply }, rx).await
    }

    /// Replace the whole snapshot; returns it as stored.
    pub async fn set(&self, snapshot: ProgressSnapshot) -> Result<ProgressSnapshot, VerifyError> {
        let (reply, rx) = oneshot::channel();
        self.request(ProgressCommand::Set { snapshot, reply }, rx).await
    }

    /// Store `snapshot` unless a run is already `processing`, checked and
    /// applied in one actor step. `None` means another run holds the document.
    pub async fn begin(&self, snapshot: ProgressSnapshot) -> Result<Option<ProgressSnapshot>, VerifyError> {
        let (reply, rx) = oneshot::channel();
        self.request(ProgressCommand::Begin { snapshot, reply }, rx).await
    }

    /// Attach a live subscriber. The current snapshot, if any, is the first
    /// message; every later `set` follows in order.
    pub async fn subscribe(&self) -> Result<mpsc::UnboundedReceiver<ProgressSnapshot>, VerifyError> {
        let (subscriber, updates) = mpsc::unbounded_channel();
        let (reply, rx) = oneshot::channel();
        self.request(ProgressCommand::Subscribe { subscriber, reply }, rx)
            .await?;
        Ok(updates)
    }

    async fn request<T>(
        &self,
        command: ProgressCommand,
        rx: oneshot::Receiver<StoreResult<T>>,
    ) -> Result<T, VerifyError> {
        self.tx
            .send(command)
            .await
            .map_err(|_| VerifyError::ActorGone(self.document_id.to_string()))?;
        let result = rx
            .await
            .map_err(|_| VerifyError::ActorGone(self.document_id.to_string()))?;
        Ok(result?)
    }
}

struct ProgressActor {
    document_id: String,
    store: Arc<dyn SnapshotStore>,
    current: Option<ProgressSnapshot>,
    loaded: bool,
    subscribers: Vec<mpsc::UnboundedSender<ProgressSnapshot>>,
}

impl ProgressActor {
    async fn run(mut self, mut rx: mpsc::Receiver<ProgressCommand>) {
        while let Some(command) = rx.recv().await {
            match command {
                ProgressCommand::Get { reply } => {
                    let result = self.load().await.map(|_| self.current.clone());
                    let _ = reply.send(result);
                }
                ProgressCommand::Set { snapshot, reply } => {
                    let result = self.store_and_broadcast(snapshot).await;
                    let _ = reply.send(result);
                }
                ProgressCommand::Begin { snapshot, reply } => {
                    let result = self.begin(snapshot).await;
                    let _ = reply.send(result);
                }
                ProgressCommand::Subscribe { subscriber, reply } => {
                    let result = self.load().await;
                    if result.is_ok() {
                        let delivered = match &self.current {
                            Some(snapshot) => subscriber.send(snapshot.clone()).is_ok(),
                            None => true,
                        };
                        if delivered {
                            self.subscribers.push(subscriber);
                        }
                        debug!(
                            document_id = %self.document_id,
                            subscribers = self.subscribers.len(),
                            "progress subscriber attached"
                        );
                    }
                    let _ = reply.send(result);
                }
            }
        }
        debug!(document_id = %self.document_id, "progress actor stopped");
    }

    /// Read the persisted snapshot once, on first use.
    async fn load(&mut self) -> StoreResult<()> {
        if !self.loaded {
            self.current = self.store.load(&self.document_id).await?;
            self.loaded = true;
        }
        Ok(())
    }

    async fn begin(&mut self, snapshot: ProgressSnapshot) -> StoreResult<Option<ProgressSnapshot>> {
        self.load().await?;
        if let Some(current) = &self.current {
            if current.status == RunStatus::Processing {
                debug!(document_id = %self.document_id, "run already in progress");
                return Ok(None);
            }
        }
        self.store_and_broadcast(snapshot).await.map(Some)
    }

    async fn store_and_broadcast(&mut self, mut snapshot: ProgressSnapshot) -> StoreResult<ProgressSnapshot> {
        if snapshot.updated_at.is_none() {
            snapshot.updated_at = Some(Utc::now());
        }
        self.store.save(&self.document_id, &snapshot).await?;
        self.current = Some(snapshot.clone());
        self.loaded = true;

        let before = self.subscribers.len();
        self.subscribers
            .retain(|subscriber| subscriber.send(snapshot.clone()).is_ok());
        let dropped = before - self.subscribers.len();
        if dropped > 0 {
            warn!(document_id = %self.document_id, dropped, "dropped disconnected progress subscribers");
        }
        Ok(snapshot)
    }
}

/// One actor per document id, spawned on first use and respawned after it
/// has stopped.
pub struct ProgressHub {
    store: Arc<dyn SnapshotStore>,
    actors: Mutex<HashMap<String, mpsc::WeakSender<ProgressCommand>>>,
}

impl ProgressHub {
    pub fn new(store: Arc<dyn SnapshotStore>) -> Self {
        Self {
            store,
            actors: Mutex::new(HashMap::new()),
        }
    }

    pub fn handle(&self, document_id: &str) -> ProgressHandle {
        let mut actors = self.actors.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(tx) = actors.get(document_id).and_then(mpsc::WeakSender::upgrade) {
            return ProgressHandle {
                document_id: document_id.into(),
                tx,
            };
        }

        actors.retain(|_, tx| tx.upgrade().is_some());
        let handle = ProgressHandle::spawn(document_id, self.store.clone());
        actors.insert(document_id.to_string(), handle.tx.downgrade());
        handle
    }

    #[cfg(test)]
    fn tracked(&self) -> usize {
        self.actors.lock().unwrap_or_else(|p| p.into_inner()).len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::footnotes::types::{RunStatus, Verification};
    use store::MemorySnapshotStore;

    fn memory() -> Arc<dyn SnapshotStore> {
        Arc::new(MemorySnapshotStore::default())
    }

    #[tokio::test]
    async fn test_get_before_and_after_set() {
        let handle = ProgressHandle::spawn("doc-1", memory());
        assert!(handle.get().await.unwrap().is_none());

        let stored = handle.set(ProgressSnapshot::processing(2, Vec::new())).await.unwrap();
        assert!(stored.updated_at.is_some());
        assert_eq!(handle.get().await.unwrap(), Some(stored));
    }

    #[tokio::test]
    async fn test_explicit_update_time_is_kept() {
        let handle = ProgressHandle::spawn("doc-1", memory());
        let at = Utc::now() - chrono::Duration::hours(1);
        let mut snapshot = ProgressSnapshot::complete(Vec::new());
        snapshot.updated_at = Some(at);
        assert_eq!(handle.set(snapshot).await.unwrap().updated_at, Some(at));
    }

    #[tokio::test]
    async fn test_late_subscriber_receives_current_snapshot() {
        let handle = ProgressHandle::spawn("doc-1", memory());
        handle
            .set(ProgressSnapshot::processing(3, vec![Verification::unavailable("fn-1", "x")]))
            .await
            .unwrap();

        let mut updates = handle.subscribe().await.unwrap();
        let first = updates.recv().await.unwrap();
        assert_eq!(first.verifications.len(), 1);
        assert_eq!(first.status, RunStatus::Processing);
    }

    #[tokio::test]
    async fn test_set_reaches_every_live_subscriber_in_order() {
        let handle = ProgressHandle::spawn("doc-1", memory());
        let mut a = handle.subscribe().await.unwrap();
        let b = handle.subscribe().await.unwrap();
        let mut c = handle.subscribe().await.unwrap();
        drop(b);

        handle.set(ProgressSnapshot::processing(2, Vec::new())).await.unwrap();
        handle.set(ProgressSnapshot::complete(Vec::new())).await.unwrap();

        for rx in [&mut a, &mut c] {
            assert_eq!(rx.recv().await.unwrap().status, RunStatus::Processing);
            assert_eq!(rx.recv().await.unwrap().status, RunStatus::Complete);
        }
        assert_eq!(
            handle.get().await.unwrap().map(|s| s.status),
            Some(RunStatus::Complete)
        );
    }

    #[tokio::test]
    async fn test_snapshot_survives_actor_restart() {
        let store = memory();
        let first = ProgressHandle::spawn("doc-1", store.clone());
        first.set(ProgressSnapshot::failed(4, "no key")).await.unwrap();
        drop(first);

        let second = ProgressHandle::spawn("doc-1", store);
        let snapshot = second.get().await.unwrap().unwrap();
        assert_eq!(snapshot.status, RunStatus::Failed);
        assert_eq!(snapshot.error.as_deref(), Some("no key"));
    }

    #[tokio::test]
    async fn test_hub_addresses_one_actor_per_document() {
        let hub = ProgressHub::new(memory());
        hub.handle("doc-a")
            .set(ProgressSnapshot::complete(Vec::new()))
            .await
            .unwrap();
        assert!(hub.handle("doc-a").get().await.unwrap().is_some());
        assert!(hub.handle("doc-b").get().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_concurrent_begins_admit_one_run() {
        let handle = ProgressHandle::spawn("doc-1", memory());
        let (a, b) = tokio::join!(
            handle.begin(ProgressSnapshot::processing(3, Vec::new())),
            handle.begin(ProgressSnapshot::processing(3, Vec::new())),
        );
        let started = [a.unwrap(), b.unwrap()].iter().filter(|r| r.is_some()).count();
        assert_eq!(started, 1);

        handle.set(ProgressSnapshot::complete(Vec::new())).await.unwrap();
        assert!(handle
            .begin(ProgressSnapshot::processing(3, Vec::new()))
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn test_hub_actor_stops_when_unused_and_respawns() {
        let hub = ProgressHub::new(memory());
        let handle = hub.handle("doc-a");
        handle.set(ProgressSnapshot::complete(Vec::new())).await.unwrap();
        let mut updates = handle.subscribe().await.unwrap();
        assert_eq!(updates.recv().await.unwrap().status, RunStatus::Complete);

        drop(handle);
        // The actor exits and drops its subscribers.
        assert!(updates.recv().await.is_none());

        let revived = hub.handle("doc-a");
        assert_eq!(
            revived.get().await.unwrap().map(|s| s.status),
            Some(RunStatus::Complete)
        );
        drop(revived);
        let _other = hub.handle("doc-b");
        assert_eq!(hub.tracked(), 1);
    }
}
