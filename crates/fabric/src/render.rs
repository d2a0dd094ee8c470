// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Rate-limited task telemetry rendering.
//!
//! The driver pushes [`TaskSnapshot`]s onto a broadcast bus; a renderer
//! subscribes and converts them to the user's sink. There is no link back
//! from the renderer to the driver.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::platform::AppInfo;
use crate::task_state::{TaskInfo, TaskPhase};

/// One update pushed by the driver: the current task list plus a free-form
/// status message.
#[derive(Debug, Clone)]
pub struct TaskSnapshot {
    pub tasks: Vec<TaskInfo>,
    pub message: String,
}

/// Converts snapshots to the user's chosen sink.
pub trait Renderer: Send + 'static {
    fn render(&mut self, snapshot: &TaskSnapshot);
}

/// Human-readable title and icon for one task.
pub fn describe_task(task: &TaskInfo) -> (&'static str, &'static str) {
    match task.phase {
        TaskPhase::Pending => ("Pending", "\u{1F51C}"),
        TaskPhase::Creating => {
            if task.root_function_id.is_empty() {
                // A task with no function id is probably building an image.
                ("Building image", "\u{1F528}")
            } else {
                ("Creating task for function", "\u{2699}\u{FE0F}")
            }
        }
        TaskPhase::Active => ("Running", "\u{25B6}\u{FE0F}"),
        TaskPhase::Completed => ("Completed", "\u{2705}"),
    }
}

/// Plain-text renderer for terminal sinks.
pub struct TextRenderer {
    name: String,
    sink: Arc<dyn Fn(String) + Send + Sync>,
}

impl TextRenderer {
    /// Render to stdout, one line per update.
    pub fn stdout(name: impl Into<String>) -> Self {
        Self::with_sink(name, Arc::new(|line| println!("{line}")))
    }

    pub fn with_sink(name: impl Into<String>, sink: Arc<dyn Fn(String) + Send + Sync>) -> Self {
        Self {
            name: name.into(),
            sink,
        }
    }
}

impl Renderer for TextRenderer {
    fn render(&mut self, snapshot: &TaskSnapshot) {
        let icons: String = snapshot
            .tasks
            .iter()
            .map(|task| describe_task(task).1)
            .collect();
        let icons = if icons.is_empty() { "...".to_owned() } else { icons };
        let mut line = format!("{} | tasks: {}", self.name, icons);
        if !snapshot.message.is_empty() {
            line.push_str(" | ");
            line.push_str(&snapshot.message);
        }
        (self.sink)(line);
    }
}

/// HTML renderer for notebook sinks.
pub struct HtmlRenderer {
    app: AppInfo,
    sink: Arc<dyn Fn(String) + Send + Sync>,
}

const UL_STYLE: &str = "display: inline-block; list-style-type: none; padding: 0; margin: 0;";
const LI_STYLE: &str = "display: inline-block; margin-right: 10px; font-size: 1.2em;";

impl HtmlRenderer {
    pub fn new(app: AppInfo, sink: Arc<dyn Fn(String) + Send + Sync>) -> Self {
        Self { app, sink }
    }
}

impl Renderer for HtmlRenderer {
    fn render(&mut self, snapshot: &TaskSnapshot) {
        let items: String = if snapshot.tasks.is_empty() {
            format!(r#"<li title="No tasks" style="{LI_STYLE}">...</li>"#)
        } else {
            snapshot
                .tasks
                .iter()
                .map(|task| {
                    let (title, icon) = describe_task(task);
                    format!(r#"<li title="{}" style="{LI_STYLE}">{icon}</li>"#, escape(title))
                })
                .collect()
        };
        let message = if snapshot.message.is_empty() {
            "&nbsp;".to_owned()
        } else {
            escape(&snapshot.message)
        };
        let html = format!(
            concat!(
                r#"<a href="{url}" title="View the platform dashboard for this app">Running {name}</a>. "#,
                r#"Tasks: <ul style="{ul}">{items}</ul><p>{message}</p>"#,
            ),
            url = escape(&self.app.url),
            name = escape(&self.app.name),
            ul = UL_STYLE,
            items = items,
            message = message,
        );
        (self.sink)(html);
    }
}

/// Minimal HTML escape for text and attribute values.
fn escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

/// Drive a renderer from the snapshot bus.
///
/// The first change after a quiet window renders immediately; later
/// changes render at most once per `rate_limit`, and scheduled updates
/// coalesce to the newest snapshot. A pending snapshot is flushed on
/// shutdown.
pub fn spawn_renderer(
    mut rx: broadcast::Receiver<TaskSnapshot>,
    mut renderer: Box<dyn Renderer>,
    rate_limit: Duration,
    stop: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut last_render: Option<tokio::time::Instant> = None;
        let mut pending: Option<TaskSnapshot> = None;
        loop {
            let next_slot = last_render.map(|at| at + rate_limit);
            tokio::select! {
                _ = stop.cancelled() => break,
                update = rx.recv() => match update {
                    Ok(snapshot) => {
                        let now = tokio::time::Instant::now();
                        let due = next_slot.map_or(true, |slot| now >= slot);
                        if due {
                            renderer.render(&snapshot);
                            last_render = Some(now);
                        } else {
                            pending = Some(snapshot);
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                _ = async {
                    match next_slot {
                        Some(slot) => tokio::time::sleep_until(slot).await,
                        None => std::future::pending::<()>().await,
                    }
                }, if pending.is_some() => {
                    if let Some(snapshot) = pending.take() {
                        renderer.render(&snapshot);
                        last_render = Some(tokio::time::Instant::now());
                    }
                }
            }
        }
        if let Some(snapshot) = pending.take() {
            renderer.render(&snapshot);
        }
    })
}

#[cfg(test)]
#[path = "render_tests.rs"]
mod tests;
