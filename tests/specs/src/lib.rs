// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Test harness for end-to-end fabric scenarios.
//!
//! Builds an experiment against the in-process platform with the output
//! stream captured, so scenarios can assert on what the driver would have
//! printed.

use std::sync::{Arc, Once};
use std::time::Duration;

use parking_lot::Mutex;

use minirun::output::{LogLine, OutputHandler};
use minirun::platform::{local::LocalPlatform, Platform};
use minirun::Experiment;

static TRACING_INIT: Once = Once::new();

/// Install a test subscriber honoring `RUST_LOG`. Safe to call multiple
/// times — only the first call has effect.
pub fn init_tracing() {
    TRACING_INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// Lines the driver passed to the output handler.
pub type CapturedLines = Arc<Mutex<Vec<String>>>;

/// An output handler that records lines instead of printing them.
pub fn capturing_output() -> (OutputHandler, CapturedLines) {
    let lines: CapturedLines = Arc::new(Mutex::new(Vec::new()));
    let handler: OutputHandler = {
        let lines = lines.clone();
        Arc::new(move |line: &LogLine| lines.lock().push(line.data.clone()))
    };
    (handler, lines)
}

/// A fully-wired experiment on a fresh local platform.
pub struct TestBed {
    pub platform: Arc<dyn Platform>,
    pub local: Arc<LocalPlatform>,
    pub experiment: Experiment,
    pub output: CapturedLines,
}

impl TestBed {
    pub fn new(name: &str) -> Self {
        init_tracing();
        let local = Arc::new(LocalPlatform::new());
        let platform: Arc<dyn Platform> = local.clone();
        let (handler, output) = capturing_output();
        let experiment = Experiment::new(name, platform.clone()).with_output(handler);
        Self {
            platform,
            local,
            experiment,
            output,
        }
    }
}

/// Poll a condition until it holds or a two-second deadline passes.
pub async fn wait_for<F: Fn() -> bool>(cond: F) -> anyhow::Result<()> {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !cond() {
        if tokio::time::Instant::now() > deadline {
            anyhow::bail!("condition not reached in time");
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    Ok(())
}
