// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Seam between the fabric and the hosting platform.
//!
//! The fabric consumes exactly three things from a platform: shared
//! partitioned queues addressable by id from any process, an app that can
//! run registered functions in remote containers, and the app's log feed.
//! [`local`] provides the in-process reference implementation.

pub mod local;

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use crate::config::FunctionOptions;
use crate::output::{Fd, LogEntry};

/// Maximum items a queue partition holds before single puts block.
pub const QUEUE_MAX_LEN: usize = 5_000;

/// Errors surfaced by a platform implementation.
#[derive(Debug, thiserror::Error)]
pub enum PlatformError {
    #[error("queue {0} is closed")]
    QueueClosed(String),
    #[error("no such queue: {0}")]
    NoSuchQueue(String),
    #[error("unsupported codec: {0}")]
    Codec(String),
    #[error("no such function: {0}")]
    NoSuchFunction(String),
    #[error("authentication failed: {0}")]
    Auth(String),
    #[error(transparent)]
    Serde(#[from] serde_json::Error),
    #[error("{0}")]
    Other(String),
}

/// Metadata for a running app.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppInfo {
    pub id: String,
    pub name: String,
    pub url: String,
}

/// The body of a remote function as deployed to the platform: it receives
/// the container context plus the serialized call envelope and returns
/// the serialized reply. Failures are encoded in the reply payload, so
/// the platform only ever transports bytes.
pub type RemoteBody = Arc<
    dyn Fn(WorkerContext, Bytes) -> Pin<Box<dyn Future<Output = Bytes> + Send>> + Send + Sync,
>;

/// A remote function as handed to [`Platform::start_app`].
#[derive(Clone)]
pub struct RegisteredFunction {
    pub fn_id: String,
    pub name: String,
    pub options: FunctionOptions,
    pub body: RemoteBody,
}

impl fmt::Debug for RegisteredFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegisteredFunction")
            .field("fn_id", &self.fn_id)
            .field("name", &self.name)
            .field("options", &self.options)
            .finish()
    }
}

/// Hosting platform entry points consumed by the fabric.
#[async_trait]
pub trait Platform: Send + Sync + 'static {
    /// Create a fresh shared queue with a unique id.
    async fn queue(&self) -> Result<Arc<dyn SharedQueue>, PlatformError>;

    /// Open an existing shared queue by id, from any process.
    async fn open_queue(&self, id: &str) -> Result<Arc<dyn SharedQueue>, PlatformError>;

    /// Start an app hosting the given remote functions.
    async fn start_app(
        &self,
        name: &str,
        functions: Vec<RegisteredFunction>,
    ) -> Result<Arc<dyn AppHandle>, PlatformError>;
}

/// A partitioned, bounded, many-producer queue shared across processes.
#[async_trait]
pub trait SharedQueue: Send + Sync {
    fn id(&self) -> &str;

    /// Append one value; blocks while the partition is at capacity.
    async fn put(&self, partition: &str, value: Bytes) -> Result<(), PlatformError>;

    /// Append a batch; waits for headroom, then appends the whole batch.
    /// Only a multi-put may push a partition past its capacity.
    async fn put_many(&self, partition: &str, values: Vec<Bytes>) -> Result<(), PlatformError>;

    /// Take up to `max` values, waiting until at least one is available.
    async fn get_many(&self, partition: &str, max: usize) -> Result<Vec<Bytes>, PlatformError>;

    /// Take up to `max` values without waiting.
    async fn try_get_many(&self, partition: &str, max: usize)
        -> Result<Vec<Bytes>, PlatformError>;

    /// Drop all values in every partition.
    async fn clear(&self) -> Result<(), PlatformError>;

    /// Close the queue and unregister it from the platform. Blocked
    /// producers and consumers are woken with [`PlatformError::QueueClosed`].
    async fn release(&self) -> Result<(), PlatformError>;
}

/// A running app on the hosting platform.
#[async_trait]
pub trait AppHandle: Send + Sync {
    fn info(&self) -> AppInfo;

    /// Schedule one invocation of a registered function in a fresh
    /// container task and await its reply payload.
    async fn invoke(&self, fn_id: &str, payload: Bytes) -> Result<Bytes, PlatformError>;

    /// Take the app's log feed. There is exactly one consumer per run.
    async fn logs(&self) -> Result<mpsc::UnboundedReceiver<LogEntry>, PlatformError>;

    /// Ask the app to stop. Outstanding containers are torn down and the
    /// log feed ends once their output has been flushed.
    async fn stop(&self) -> Result<(), PlatformError>;
}

/// Container-side context handed to a [`RemoteBody`].
///
/// Carries the identifiers the wrapper needs for its stdout events plus
/// the line emitter wired into the app's log feed.
#[derive(Clone)]
pub struct WorkerContext {
    task_id: String,
    fn_id: String,
    emit: Arc<dyn Fn(Fd, String) + Send + Sync>,
}

impl WorkerContext {
    pub fn new(
        task_id: impl Into<String>,
        fn_id: impl Into<String>,
        emit: Arc<dyn Fn(Fd, String) + Send + Sync>,
    ) -> Self {
        Self {
            task_id: task_id.into(),
            fn_id: fn_id.into(),
            emit,
        }
    }

    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    pub fn fn_id(&self) -> &str {
        &self.fn_id
    }

    /// Write one line to the container's stdout.
    pub fn emit_line(&self, line: impl Into<String>) {
        let mut line = line.into();
        line.push('\n');
        (self.emit)(Fd::Stdout, line);
    }
}

impl fmt::Debug for WorkerContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerContext")
            .field("task_id", &self.task_id)
            .field("fn_id", &self.fn_id)
            .finish()
    }
}
