// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Tracks the lifecycle of platform tasks for the UI.

use std::fmt;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::output::StateUpdate;

/// Coarse task state, as reported by the hosting platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskPhase {
    Pending,
    Creating,
    Active,
    Completed,
}

impl TaskPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Creating => "creating",
            Self::Active => "active",
            Self::Completed => "completed",
        }
    }
}

impl fmt::Display for TaskPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Mutable per-task record owned by the tracker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskInfo {
    pub task_id: String,
    pub root_function_id: String,
    pub phase: TaskPhase,
    pub last_update_ms: u64,
}

/// Maintains one [`TaskInfo`] per task id, in arrival order.
#[derive(Debug, Default)]
pub struct TaskTracker {
    tasks: IndexMap<String, TaskInfo>,
}

impl TaskTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Process a state change from the log feed.
    pub fn update(&mut self, item: &StateUpdate) {
        if item.task_id.is_empty() {
            // Some log entries are not tied to a specific task.
            return;
        }

        if let Some(task) = self.tasks.get_mut(&item.task_id) {
            if task.root_function_id != item.root_function_id {
                warn!(
                    task_id = %item.task_id,
                    from = %task.root_function_id,
                    to = %item.root_function_id,
                    "task function id changed",
                );
                task.root_function_id = item.root_function_id.clone();
            }
            if task.phase != item.phase {
                info!(task_id = %item.task_id, from = %task.phase, to = %item.phase, "task state");
                task.phase = item.phase;
                task.last_update_ms = item.timestamp_ms;
            }
        } else {
            info!(task_id = %item.task_id, phase = %item.phase, "task initialized");
            self.tasks.insert(
                item.task_id.clone(),
                TaskInfo {
                    task_id: item.task_id.clone(),
                    root_function_id: item.root_function_id.clone(),
                    phase: item.phase,
                    last_update_ms: item.timestamp_ms,
                },
            );
        }
    }

    /// Snapshot of all tracked tasks, in arrival order.
    pub fn tasks(&self) -> Vec<TaskInfo> {
        self.tasks.values().cloned().collect()
    }
}

#[cfg(test)]
#[path = "task_state_tests.rs"]
mod tests;
