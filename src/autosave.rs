//! Debounced, coalescing persistence of one document.
//!
//! An [AutoSaver] owns a worker task holding two snapshots of the document: the one last
//! written to the store and the most recent one handed to [AutoSaver::update]. Each update
//! restarts the debounce timer. When the timer fires, the worker diffs the two snapshots with
//! [Patch::between] and writes only the changed fields. Updates travel through a single
//! channel, so the worker sees them in send order and the last one always wins.
//!
//! A failed write leaves the document dirty and is retried on the next timer or flush. Dropping
//! the saver closes the channel, which the worker treats as a request for one last flush.
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::{
    sync::{mpsc::Sender, Arc},
    time::Duration,
};
use tokio::{
    runtime::Handle,
    sync::{
        mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender},
        oneshot,
    },
    task::JoinHandle,
    time::{sleep_until, Instant},
};

use crate::{
    diff::Patch,
    error::JobsiteError,
    event::{Event, StoreEvent},
    properties::DocId,
    store::DocumentStore,
};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AutoSaveStats {
    pub updates: u64,
    /// Successful writes of a non-empty patch
    pub flushes: u64,
    pub ops_written: u64,
    pub failures: u64,
}

type FlushReply = oneshot::Sender<Result<usize, JobsiteError>>;

enum Command {
    Update(Value),
    Flush(FlushReply),
    Shutdown(FlushReply),
}

pub struct AutoSaver<T> {
    id: DocId,
    tx: UnboundedSender<Command>,
    stats: Arc<Mutex<AutoSaveStats>>,
    handle: Option<JoinHandle<()>>,
    _doc: std::marker::PhantomData<fn(&T)>,
}

impl<T: Serialize> AutoSaver<T> {
    /// Start a saver on the current tokio runtime. `initial` must be what the store holds now.
    pub fn spawn<S>(
        store: S,
        collection: &str,
        id: &DocId,
        initial: &T,
        debounce: Duration,
        events: Option<Sender<Event>>,
    ) -> Result<AutoSaver<T>, JobsiteError>
    where
        S: DocumentStore + Send + 'static,
    {
        AutoSaver::spawn_on(&Handle::current(), store, collection, id, initial, debounce, events)
    }

    pub fn spawn_on<S>(
        runtime: &Handle,
        store: S,
        collection: &str,
        id: &DocId,
        initial: &T,
        debounce: Duration,
        events: Option<Sender<Event>>,
    ) -> Result<AutoSaver<T>, JobsiteError>
    where
        S: DocumentStore + Send + 'static,
    {
        let (tx, rx) = unbounded_channel::<Command>();
        let stats = Arc::new(Mutex::new(AutoSaveStats::default()));
        let worker = SaveWorker {
            store,
            collection: collection.to_string(),
            id: id.clone(),
            persisted: serde_json::to_value(initial)?,
            pending: None,
            debounce,
            events,
            stats: stats.clone(),
        };
        let handle = runtime.spawn(worker.run(rx));
        tracing::debug!("[AutoSaver] started for {collection}/{id}, debounce {debounce:?}");
        Ok(AutoSaver {
            id: id.clone(),
            tx,
            stats,
            handle: Some(handle),
            _doc: std::marker::PhantomData,
        })
    }

    pub fn id(&self) -> &DocId {
        &self.id
    }

    /// Replace the pending snapshot and restart the debounce timer.
    pub fn update(&self, snapshot: &T) -> Result<(), JobsiteError> {
        let value = serde_json::to_value(snapshot)?;
        self.stats.lock().updates += 1;
        self.tx
            .send(Command::Update(value))
            .map_err(|_| JobsiteError::Custom(format!("auto-saver for {} has stopped", self.id)))
    }

    /// Write any pending changes now. Returns the number of patch operations written.
    pub async fn flush(&self) -> Result<usize, JobsiteError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(Command::Flush(reply_tx))
            .map_err(|_| JobsiteError::Custom(format!("auto-saver for {} has stopped", self.id)))?;
        reply_rx
            .await
            .map_err(|_| JobsiteError::Custom(format!("auto-saver for {} has stopped", self.id)))?
    }

    /// Final flush, then stop the worker.
    pub async fn shutdown(mut self) -> Result<usize, JobsiteError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(Command::Shutdown(reply_tx))
            .map_err(|_| JobsiteError::Custom(format!("auto-saver for {} has stopped", self.id)))?;
        let result = reply_rx
            .await
            .map_err(|_| JobsiteError::Custom(format!("auto-saver for {} has stopped", self.id)))?;
        if let Some(handle) = self.handle.take() {
            if let Err(e) = handle.await {
                tracing::warn!("[AutoSaver] worker for {} ended abnormally: {e}", self.id);
            }
        }
        result
    }

    pub fn stats(&self) -> AutoSaveStats {
        *self.stats.lock()
    }
}

impl<T> Drop for AutoSaver<T> {
    fn drop(&mut self) {
        if self.handle.is_some() {
            // Closing the channel makes the worker flush once more and exit.
            tracing::debug!("[AutoSaver] {} dropped, final flush requested", self.id);
        }
    }
}

struct SaveWorker<S> {
    store: S,
    collection: String,
    id: DocId,
    persisted: Value,
    pending: Option<Value>,
    debounce: Duration,
    events: Option<Sender<Event>>,
    stats: Arc<Mutex<AutoSaveStats>>,
}

impl<S: DocumentStore> SaveWorker<S> {
    async fn run(mut self, mut rx: UnboundedReceiver<Command>) {
        let mut deadline: Option<Instant> = None;
        loop {
            let command = match deadline {
                Some(at) => {
                    tokio::select! {
                        command = rx.recv() => command,
                        _ = sleep_until(at) => {
                            deadline = None;
                            if self.write().await.is_err() {
                                deadline = Some(Instant::now() + self.debounce);
                            }
                            continue;
                        }
                    }
                }
                None => rx.recv().await,
            };
            match command {
                Some(Command::Update(value)) => {
                    self.pending = Some(value);
                    deadline = Some(Instant::now() + self.debounce);
                }
                Some(Command::Flush(reply)) => {
                    let result = self.write().await;
                    deadline = result
                        .is_err()
                        .then(|| Instant::now() + self.debounce);
                    let _ = reply.send(result);
                }
                Some(Command::Shutdown(reply)) => {
                    let result = self.write().await;
                    let _ = reply.send(result);
                    break;
                }
                None => {
                    if let Err(e) = self.write().await {
                        tracing::warn!(
                            "[AutoSaver] final flush of {}/{} failed: {e}",
                            self.collection,
                            self.id
                        );
                    }
                    break;
                }
            }
        }
        tracing::debug!("[AutoSaver] stopped for {}/{}", self.collection, self.id);
    }

    async fn write(&mut self) -> Result<usize, JobsiteError> {
        let Some(pending) = self.pending.take() else {
            return Ok(0);
        };
        let patch = Patch::between(&self.persisted, &pending);
        if patch.is_empty() {
            self.persisted = pending;
            return Ok(0);
        }
        match self.store.patch(&self.collection, &self.id, &patch).await {
            Ok(_) => {
                let written = patch.len();
                {
                    let mut stats = self.stats.lock();
                    stats.flushes += 1;
                    stats.ops_written += written as u64;
                }
                tracing::debug!(
                    "[AutoSaver] wrote {written} ops to {}/{}",
                    self.collection,
                    self.id
                );
                self.persisted = pending;
                if let Some(tx) = self.events.as_ref() {
                    let event = StoreEvent::Patched(self.collection.clone(), self.id.clone(), patch);
                    if tx.send(Event::Store(event)).is_err() {
                        tracing::debug!("[AutoSaver] event receiver is gone");
                    }
                }
                Ok(written)
            }
            Err(e) => {
                self.stats.lock().failures += 1;
                tracing::warn!(
                    "[AutoSaver] write to {}/{} failed, will retry: {e}",
                    self.collection,
                    self.id
                );
                self.pending = Some(pending);
                Err(e)
            }
        }
    }
}
