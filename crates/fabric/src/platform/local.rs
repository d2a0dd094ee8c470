// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! In-process reference platform.
//!
//! Queues are `VecDeque`s behind a registry keyed by queue id; containers
//! are spawned tokio tasks whose emitted lines and scripted task-state
//! transitions flow through an unbounded channel into the app log feed.
//! Used by unit tests, the specs crate, and local development.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::{mpsc, Notify};
use tokio::task::AbortHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{
    AppHandle, AppInfo, Platform, PlatformError, RegisteredFunction, SharedQueue, WorkerContext,
    QUEUE_MAX_LEN,
};
use crate::output::{now_ms, Fd, LogEntry, LogLine, StateUpdate};
use crate::task_state::TaskPhase;
use crate::urn::short_id;

type QueueRegistry = Mutex<HashMap<String, Arc<LocalQueue>>>;

/// An in-process hosting platform.
pub struct LocalPlatform {
    queues: Arc<QueueRegistry>,
    queue_capacity: usize,
    deny_auth: bool,
}

impl LocalPlatform {
    pub fn new() -> Self {
        Self {
            queues: Arc::new(Mutex::new(HashMap::new())),
            queue_capacity: QUEUE_MAX_LEN,
            deny_auth: false,
        }
    }

    /// Lower the per-partition capacity (for backpressure tests).
    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    /// Make `start_app` fail authentication (for error-path tests).
    pub fn deny_auth(mut self) -> Self {
        self.deny_auth = true;
        self
    }

    /// Number of live queues. Zero once every channel has been released.
    pub fn queue_count(&self) -> usize {
        self.queues.lock().len()
    }
}

impl Default for LocalPlatform {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Platform for LocalPlatform {
    async fn queue(&self) -> Result<Arc<dyn SharedQueue>, PlatformError> {
        let id = format!("qu-{}", short_id());
        let queue = Arc::new(LocalQueue {
            id: id.clone(),
            capacity: self.queue_capacity,
            state: Mutex::new(QueueState::default()),
            push: Notify::new(),
            pop: Notify::new(),
            registry: Arc::downgrade(&self.queues),
        });
        self.queues.lock().insert(id, queue.clone());
        Ok(queue)
    }

    async fn open_queue(&self, id: &str) -> Result<Arc<dyn SharedQueue>, PlatformError> {
        let queue = self
            .queues
            .lock()
            .get(id)
            .cloned()
            .ok_or_else(|| PlatformError::NoSuchQueue(id.to_owned()))?;
        Ok(queue)
    }

    async fn start_app(
        &self,
        name: &str,
        functions: Vec<RegisteredFunction>,
    ) -> Result<Arc<dyn AppHandle>, PlatformError> {
        if self.deny_auth {
            return Err(PlatformError::Auth("token rejected by platform".to_owned()));
        }

        let id = format!("ap-{}", short_id());
        let (log_tx, log_rx) = mpsc::unbounded_channel();
        debug!(app_id = %id, name, functions = functions.len(), "starting local app");
        Ok(Arc::new(LocalApp {
            info: AppInfo {
                url: format!("https://local.invalid/apps/{id}"),
                id,
                name: name.to_owned(),
            },
            functions: functions
                .into_iter()
                .map(|f| (f.fn_id.clone(), f))
                .collect(),
            log_tx: Mutex::new(Some(log_tx)),
            log_rx: Mutex::new(Some(log_rx)),
            task_seq: AtomicU64::new(0),
            containers: Mutex::new(Vec::new()),
            shutdown: CancellationToken::new(),
        }))
    }
}

#[derive(Default)]
struct QueueState {
    closed: bool,
    partitions: HashMap<String, VecDeque<Bytes>>,
}

struct LocalQueue {
    id: String,
    capacity: usize,
    state: Mutex<QueueState>,
    /// Woken when values are appended.
    push: Notify,
    /// Woken when values are taken, cleared, or the queue closes.
    pop: Notify,
    registry: Weak<QueueRegistry>,
}

impl LocalQueue {
    fn take(
        &self,
        partition: &str,
        max: usize,
    ) -> Result<Option<Vec<Bytes>>, PlatformError> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(PlatformError::QueueClosed(self.id.clone()));
        }
        let Some(part) = state.partitions.get_mut(partition) else {
            return Ok(None);
        };
        if part.is_empty() {
            return Ok(None);
        }
        let n = part.len().min(max);
        let values: Vec<Bytes> = part.drain(..n).collect();
        self.pop.notify_waiters();
        Ok(Some(values))
    }
}

#[async_trait]
impl SharedQueue for LocalQueue {
    fn id(&self) -> &str {
        &self.id
    }

    async fn put(&self, partition: &str, value: Bytes) -> Result<(), PlatformError> {
        self.put_many(partition, vec![value]).await
    }

    async fn put_many(&self, partition: &str, values: Vec<Bytes>) -> Result<(), PlatformError> {
        if values.is_empty() {
            return Ok(());
        }
        let mut values = Some(values);
        loop {
            let notified = self.pop.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut state = self.state.lock();
                if state.closed {
                    return Err(PlatformError::QueueClosed(self.id.clone()));
                }
                let part = state.partitions.entry(partition.to_owned()).or_default();
                if part.len() < self.capacity {
                    if let Some(values) = values.take() {
                        part.extend(values);
                    }
                    self.push.notify_waiters();
                    return Ok(());
                }
            }
            notified.await;
        }
    }

    async fn get_many(&self, partition: &str, max: usize) -> Result<Vec<Bytes>, PlatformError> {
        loop {
            let notified = self.push.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if let Some(values) = self.take(partition, max)? {
                return Ok(values);
            }
            notified.await;
        }
    }

    async fn try_get_many(
        &self,
        partition: &str,
        max: usize,
    ) -> Result<Vec<Bytes>, PlatformError> {
        Ok(self.take(partition, max)?.unwrap_or_default())
    }

    async fn clear(&self) -> Result<(), PlatformError> {
        let mut state = self.state.lock();
        state.partitions.clear();
        self.pop.notify_waiters();
        Ok(())
    }

    async fn release(&self) -> Result<(), PlatformError> {
        {
            let mut state = self.state.lock();
            state.closed = true;
            state.partitions.clear();
        }
        if let Some(registry) = self.registry.upgrade() {
            registry.lock().remove(&self.id);
        }
        self.push.notify_waiters();
        self.pop.notify_waiters();
        Ok(())
    }
}

struct LocalApp {
    info: AppInfo,
    functions: HashMap<String, RegisteredFunction>,
    log_tx: Mutex<Option<mpsc::UnboundedSender<LogEntry>>>,
    log_rx: Mutex<Option<mpsc::UnboundedReceiver<LogEntry>>>,
    task_seq: AtomicU64,
    containers: Mutex<Vec<AbortHandle>>,
    shutdown: CancellationToken,
}

impl LocalApp {
    fn send_state(
        &self,
        tx: &mpsc::UnboundedSender<LogEntry>,
        task_id: &str,
        fn_id: &str,
        phase: TaskPhase,
    ) {
        let _ = tx.send(LogEntry::State(StateUpdate {
            task_id: task_id.to_owned(),
            root_function_id: fn_id.to_owned(),
            phase,
            timestamp_ms: now_ms(),
        }));
    }
}

#[async_trait]
impl AppHandle for LocalApp {
    fn info(&self) -> AppInfo {
        self.info.clone()
    }

    async fn invoke(&self, fn_id: &str, payload: Bytes) -> Result<Bytes, PlatformError> {
        let function = self
            .functions
            .get(fn_id)
            .cloned()
            .ok_or_else(|| PlatformError::NoSuchFunction(fn_id.to_owned()))?;
        let Some(tx) = self.log_tx.lock().clone() else {
            return Err(PlatformError::Other("app is stopped".to_owned()));
        };

        let seq = self.task_seq.fetch_add(1, Ordering::Relaxed);
        let task_id = format!("ta-{:04}", seq);
        self.send_state(&tx, &task_id, fn_id, TaskPhase::Pending);
        self.send_state(&tx, &task_id, fn_id, TaskPhase::Creating);

        let emit = {
            let tx = tx.clone();
            let task_id = task_id.clone();
            let fn_id = fn_id.to_owned();
            Arc::new(move |fd: Fd, data: String| {
                let _ = tx.send(LogEntry::Line(LogLine {
                    task_id: task_id.clone(),
                    root_function_id: fn_id.clone(),
                    fd,
                    data,
                    timestamp_ms: now_ms(),
                }));
            })
        };
        let ctx = WorkerContext::new(task_id.clone(), fn_id, emit);

        self.send_state(&tx, &task_id, fn_id, TaskPhase::Active);
        let body = function.body.clone();
        let container = tokio::spawn(async move { body(ctx, payload).await });
        self.containers.lock().push(container.abort_handle());

        let result = container.await;
        self.send_state(&tx, &task_id, fn_id, TaskPhase::Completed);
        result.map_err(|err| {
            PlatformError::Other(format!("container for task {task_id} terminated: {err}"))
        })
    }

    async fn logs(&self) -> Result<mpsc::UnboundedReceiver<LogEntry>, PlatformError> {
        self.log_rx
            .lock()
            .take()
            .ok_or_else(|| PlatformError::Other("log feed already taken".to_owned()))
    }

    async fn stop(&self) -> Result<(), PlatformError> {
        debug!(app_id = %self.info.id, "stopping local app");
        self.shutdown.cancel();
        for container in self.containers.lock().drain(..) {
            container.abort();
        }
        // Drop the app's feed sender; the stream ends once every
        // container-held clone is gone.
        self.log_tx.lock().take();
        Ok(())
    }
}

#[cfg(test)]
#[path = "local_tests.rs"]
mod tests;
