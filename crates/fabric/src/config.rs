// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Run configuration and per-function platform options.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// How to treat a trailing-drain timeout on channel close.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorPolicy {
    /// Return the timeout as an error.
    Throw,
    /// Log a warning and continue (default).
    #[default]
    Log,
}

/// Driver-wide configuration for a run.
#[derive(Debug, Clone)]
pub struct Config {
    /// Bound on awaiting the log-pump task after the app stops.
    pub shutdown_timeout: Duration,
    /// Bound on draining a channel on scope exit. `None` waits forever.
    pub trailing_timeout: Option<Duration>,
    /// What to do when the trailing drain times out.
    pub errors: ErrorPolicy,
    /// Minimum interval between task-tracker renders.
    pub rate_limit: Duration,
    /// Default container image for remote functions.
    pub image: Option<String>,
    /// Default volume mounts for remote functions.
    pub volumes: BTreeMap<String, String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            shutdown_timeout: Duration::from_secs(10),
            trailing_timeout: Some(Duration::from_secs(5)),
            errors: ErrorPolicy::Log,
            rate_limit: Duration::from_secs(1),
            image: None,
            volumes: BTreeMap::new(),
        }
    }
}

impl Config {
    /// Channel options derived from this config.
    pub fn channel_options(&self) -> ChannelOptions {
        ChannelOptions {
            trailing_timeout: self.trailing_timeout,
            errors: self.errors,
        }
    }
}

/// Options for one producer/consumer channel.
#[derive(Debug, Clone, Copy)]
pub struct ChannelOptions {
    pub trailing_timeout: Option<Duration>,
    pub errors: ErrorPolicy,
}

impl Default for ChannelOptions {
    fn default() -> Self {
        Config::default().channel_options()
    }
}

/// Platform options for one remote function, forwarded verbatim to the
/// hosting platform. Unset fields inherit the run defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FunctionOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub volumes: BTreeMap<String, String>,
    /// Any further platform-specific options, passed through untouched.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl FunctionOptions {
    /// Fill unset fields from the run defaults. Function-level volumes
    /// shadow run-level mounts at the same path.
    pub fn inherit(mut self, config: &Config) -> Self {
        if self.image.is_none() {
            self.image = config.image.clone();
        }
        let mut volumes = config.volumes.clone();
        volumes.extend(std::mem::take(&mut self.volumes));
        self.volumes = volumes;
        self
    }
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;
