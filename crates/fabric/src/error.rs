// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Fabric-wide error kinds.
//!
//! Driver-side failures never crash a run scope's cleanup path; the
//! variants here mark the few places where an error is surfaced to the
//! caller instead of logged.

use std::time::Duration;

use crate::call_state::CallStateError;
use crate::platform::PlatformError;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A line looked like a call-state URN but failed to parse, or an
    /// event arrived out of order.
    #[error(transparent)]
    CallState(#[from] CallStateError),

    /// The consumer did not drain within the configured trailing window.
    #[error("timed out waiting for trailing messages")]
    TrailingDrain,

    /// The log-pump task did not finish within the shutdown window.
    #[error("log stream did not finish within {timeout:?}")]
    ShutdownTimeout { timeout: Duration },

    /// Authentication with the hosting platform failed.
    #[error("platform authentication failed: {message}\nhint: {hint}")]
    Auth { message: String, hint: String },

    /// A remote-function stub was invoked outside a run scope.
    #[error("`{name}` was called outside a run scope")]
    NotRunning { name: String },

    /// The remote target failed; kind and message are preserved verbatim.
    #[error("{kind}: {message}")]
    Remote { kind: String, message: String },

    #[error(transparent)]
    Platform(#[from] PlatformError),
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Platform(PlatformError::from(err))
    }
}
