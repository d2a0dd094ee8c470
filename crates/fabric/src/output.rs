// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Structured log feed shared between the platform and the driver.
//!
//! The platform delivers a single stream of entries per app: coarse task
//! state changes and raw output lines tagged with the file descriptor
//! they were written to inside the container.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::task_state::TaskPhase;

/// Which stream inside the container a line was written to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Fd {
    Stdout,
    Stderr,
    /// Messages from the hosting platform itself, not from user code.
    Info,
}

/// One raw output line (or chunk) from a container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogLine {
    pub task_id: String,
    pub root_function_id: String,
    pub fd: Fd,
    pub data: String,
    pub timestamp_ms: u64,
}

/// A coarse task state change reported by the platform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateUpdate {
    pub task_id: String,
    pub root_function_id: String,
    pub phase: TaskPhase,
    pub timestamp_ms: u64,
}

/// One entry in the app log feed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogEntry {
    State(StateUpdate),
    Line(LogLine),
}

/// Handler for plain output lines, carried explicitly in the run context.
pub type OutputHandler = Arc<dyn Fn(&LogLine) + Send + Sync>;

/// Default output handler: stdout and stderr lines go to the matching
/// local stream, infra messages to the debug log.
pub fn basic_output_handler() -> OutputHandler {
    Arc::new(|line: &LogLine| match line.fd {
        Fd::Stdout => print!("{}", line.data),
        Fd::Stderr => eprint!("{}", line.data),
        Fd::Info => debug!(task_id = %line.task_id, "infra message: {}", line.data.trim_end()),
    })
}

/// Milliseconds since the epoch, for log feed timestamps.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}
