// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The experiment driver: app lifecycle, remote-function registration,
//! the log-pump task, and run-scope shutdown.
//!
//! A run scope owns one app, one run id, one call tracker, and one
//! log-pump task. Entering starts the app and the pump; exiting asks the
//! app to stop, awaits the pump within a bounded window, and releases
//! everything. Cleanup errors are logged, never propagated.

use std::future::Future;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::call_state::{CallState, CallTracker};
use crate::config::{Config, FunctionOptions};
use crate::error::Error;
use crate::guards::{Guard, GuardRegistry};
use crate::output::{basic_output_handler, Fd, LogEntry, LogLine, OutputHandler};
use crate::platform::{AppHandle, AppInfo, Platform, PlatformError, RegisteredFunction};
use crate::render::{spawn_renderer, Renderer, TaskSnapshot};
use crate::task_state::TaskTracker;
use crate::thither::{make_remote_body, RemoteError, RemoteFunction};
use crate::urn::{is_experiment_urn, short_id};

/// Remediation hint attached to platform authentication failures.
const AUTH_HINT: &str =
    "run your platform's login flow and check that its credentials have not expired";

/// The run currently in scope, shared with every registered stub.
#[derive(Default)]
pub struct RunSlot {
    active: RwLock<Option<Arc<ActiveRun>>>,
}

/// Handles a stub needs to schedule a call on the active run.
pub struct ActiveRun {
    pub(crate) run_id: String,
    pub(crate) app: Arc<dyn AppHandle>,
}

impl RunSlot {
    pub(crate) fn set(&self, run_id: String, app: Arc<dyn AppHandle>) {
        *self.active.write() = Some(Arc::new(ActiveRun { run_id, app }));
    }

    pub(crate) fn clear(&self) {
        *self.active.write() = None;
    }

    pub(crate) fn current(&self) -> Option<Arc<ActiveRun>> {
        self.active.read().clone()
    }
}

/// An experiment: a named collection of remote functions and guards plus
/// the configuration their runs inherit.
pub struct Experiment {
    name: String,
    platform: Arc<dyn Platform>,
    config: Config,
    output: OutputHandler,
    guards: Arc<GuardRegistry>,
    functions: Mutex<Vec<RegisteredFunction>>,
    renderer: Mutex<Option<Box<dyn Renderer>>>,
    runs: Arc<RunSlot>,
}

impl Experiment {
    pub fn new(name: impl Into<String>, platform: Arc<dyn Platform>) -> Self {
        Self {
            name: name.into(),
            platform,
            config: Config::default(),
            output: basic_output_handler(),
            guards: Arc::new(GuardRegistry::default()),
            functions: Mutex::new(Vec::new()),
            renderer: Mutex::new(None),
            runs: Arc::new(RunSlot::default()),
        }
    }

    pub fn with_config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    /// Default container image inherited by every remote function.
    pub fn with_image(mut self, image: impl Into<String>) -> Self {
        self.config.image = Some(image.into());
        self
    }

    /// Default volume mount inherited by every remote function.
    pub fn with_volume(mut self, path: impl Into<String>, name: impl Into<String>) -> Self {
        self.config.volumes.insert(path.into(), name.into());
        self
    }

    /// Handler for plain container output lines.
    pub fn with_output(mut self, output: OutputHandler) -> Self {
        self.output = output;
        self
    }

    /// Renderer for task telemetry; driven by the next run.
    pub fn with_renderer(mut self, renderer: Box<dyn Renderer>) -> Self {
        *self.renderer.lock() = Some(renderer);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Register a guard applied to every remote function.
    pub fn guard_global(&self, guard: Guard) {
        self.guards.add_global(guard);
    }

    /// Register a guard applied to one remote function.
    pub fn guard_fn<A, R>(&self, function: &RemoteFunction<A, R>, guard: Guard)
    where
        A: serde::Serialize + Send,
        R: serde::de::DeserializeOwned + Send,
    {
        self.guards.add_for(function.fn_id(), guard);
    }

    /// Register a function that always runs remotely.
    ///
    /// The returned stub must be called inside a run scope. Options are
    /// forwarded to the hosting platform verbatim, with unset fields
    /// inherited from the run defaults.
    pub fn thither<A, R, F, Fut>(
        &self,
        name: &str,
        options: FunctionOptions,
        target: F,
    ) -> RemoteFunction<A, R>
    where
        A: serde::Serialize + serde::de::DeserializeOwned + Send + 'static,
        R: serde::Serialize + serde::de::DeserializeOwned + Send + 'static,
        F: Fn(A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, RemoteError>> + Send + 'static,
    {
        let fn_id = short_id();
        debug!(name, fn_id = %fn_id, "registering remote function");
        let body = make_remote_body::<A, R, F, Fut>(
            name.to_owned(),
            fn_id.clone(),
            self.guards.clone(),
            target,
        );
        self.functions.lock().push(RegisteredFunction {
            fn_id: fn_id.clone(),
            name: name.to_owned(),
            options: options.inherit(&self.config),
            body,
        });
        RemoteFunction::new(name.to_owned(), fn_id, self.runs.clone())
    }

    /// Enter a run scope: start the app, assign a fresh run id, and
    /// launch the log-pump task.
    pub async fn start(&self) -> Result<Run, Error> {
        let functions = self.functions.lock().clone();
        let app = self
            .platform
            .start_app(&self.name, functions)
            .await
            .map_err(|err| match err {
                PlatformError::Auth(message) => Error::Auth {
                    message,
                    hint: AUTH_HINT.to_owned(),
                },
                other => Error::Platform(other),
            })?;

        let run_id = short_id();
        info!(run_id = %run_id, app_id = %app.info().id, "run started");

        let tracker = Arc::new(Mutex::new(CallTracker::new(run_id.clone())));
        let task_tracker = Arc::new(Mutex::new(TaskTracker::new()));
        let (snapshot_tx, _) = broadcast::channel(64);

        let logs = app.logs().await?;
        let pump = tokio::spawn(pump_logs(
            logs,
            tracker.clone(),
            task_tracker.clone(),
            snapshot_tx.clone(),
            self.output.clone(),
        ));

        let render_stop = CancellationToken::new();
        let render_task = self.renderer.lock().take().map(|renderer| {
            spawn_renderer(
                snapshot_tx.subscribe(),
                renderer,
                self.config.rate_limit,
                render_stop.clone(),
            )
        });

        self.runs.set(run_id.clone(), app.clone());
        Ok(Run {
            run_id,
            app,
            tracker,
            task_tracker,
            snapshot_tx,
            pump: Some(pump),
            render_task,
            render_stop,
            runs: self.runs.clone(),
            config: self.config.clone(),
        })
    }
}

/// One activation of an experiment scope. Dropping without calling
/// [`Run::finish`] skips the orderly shutdown; always finish.
pub struct Run {
    run_id: String,
    app: Arc<dyn AppHandle>,
    tracker: Arc<Mutex<CallTracker>>,
    task_tracker: Arc<Mutex<TaskTracker>>,
    snapshot_tx: broadcast::Sender<TaskSnapshot>,
    pump: Option<JoinHandle<()>>,
    render_task: Option<JoinHandle<()>>,
    render_stop: CancellationToken,
    runs: Arc<RunSlot>,
    config: Config,
}

impl Run {
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn app_info(&self) -> AppInfo {
        self.app.info()
    }

    /// Subscribe to task telemetry snapshots.
    pub fn subscribe_tasks(&self) -> broadcast::Receiver<TaskSnapshot> {
        self.snapshot_tx.subscribe()
    }

    /// Push a status message to telemetry subscribers.
    pub fn announce(&self, message: &str) {
        let tasks = self.task_tracker.lock().tasks();
        let _ = self.snapshot_tx.send(TaskSnapshot {
            tasks,
            message: message.to_owned(),
        });
    }

    /// Whether any tracked call is in the `start` phase.
    pub fn any_running(&self) -> bool {
        self.tracker.lock().any_running()
    }

    /// Whether any tracked call has not reached `end`.
    pub fn any_active(&self) -> bool {
        self.tracker.lock().any_active()
    }

    /// Every call-state event observed so far, in arrival order.
    pub fn call_history(&self) -> Vec<CallState> {
        self.tracker.lock().history().to_vec()
    }

    /// Exit the run scope: stop the app, await the log pump within the
    /// shutdown window, and release all resources.
    pub async fn finish(mut self) -> Result<(), Error> {
        self.runs.clear();

        if let Err(err) = self.app.stop().await {
            warn!(run_id = %self.run_id, "app stop failed: {err}");
        }

        if let Some(mut pump) = self.pump.take() {
            let window = self.config.shutdown_timeout;
            if tokio::time::timeout(window, &mut pump).await.is_err() {
                warn!(
                    run_id = %self.run_id,
                    "log stream did not finish within {window:?}; cancelling",
                );
                pump.abort();
            }
        }

        self.render_stop.cancel();
        if let Some(render_task) = self.render_task.take() {
            let _ = render_task.await;
        }

        info!(run_id = %self.run_id, "run finished");
        Ok(())
    }
}

/// Consume the app log feed: task state changes go to the task tracker,
/// call-state URNs to the call tracker, everything else to the output
/// handler while a call is running.
async fn pump_logs(
    mut logs: mpsc::UnboundedReceiver<LogEntry>,
    tracker: Arc<Mutex<CallTracker>>,
    task_tracker: Arc<Mutex<TaskTracker>>,
    snapshot_tx: broadcast::Sender<TaskSnapshot>,
    output: OutputHandler,
) {
    while let Some(entry) = logs.recv().await {
        match entry {
            LogEntry::State(update) => {
                let tasks = {
                    let mut task_tracker = task_tracker.lock();
                    task_tracker.update(&update);
                    task_tracker.tasks()
                };
                let _ = snapshot_tx.send(TaskSnapshot {
                    tasks,
                    message: String::new(),
                });
            }
            LogEntry::Line(line) => handle_line(&line, &tracker, &output),
        }
    }
    debug!("log stream ended");
}

fn handle_line(line: &LogLine, tracker: &Mutex<CallTracker>, output: &OutputHandler) {
    if line.fd == Fd::Info {
        debug!(task_id = %line.task_id, "infra message: {}", line.data.trim_end());
        return;
    }

    for raw in line.data.lines() {
        let trimmed = raw.trim();
        if CallState::matches(trimmed) {
            // Call-state lines are consumed, never passed to output.
            match CallState::from_urn(trimmed) {
                Ok(state) => {
                    if let Err(err) = tracker.lock().handle(state) {
                        error!(task_id = %line.task_id, "{err}");
                    }
                }
                Err(err) => debug!("{err}"),
            }
            continue;
        }
        if is_experiment_urn(trimmed) {
            // Reserved for future experiment messages.
            debug!("ignoring experiment line: {trimmed}");
            continue;
        }
        if tracker.lock().any_running() {
            (output)(&LogLine {
                data: format!("{raw}\n"),
                ..line.clone()
            });
        }
    }
}

#[cfg(test)]
#[path = "experiment_tests.rs"]
mod tests;
