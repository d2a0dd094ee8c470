// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Per-call state machine driven by URN events parsed out of container
//! stdout.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::urn::{matches_urn, parse_urn, to_urn};

/// Pattern a call-state URN must match before parsing is attempted.
const CALL_STATE_PATTERN: &str = "mini:run:*:fn:*:*:call:*:*";

/// Lifecycle phase of one remote call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallPhase {
    Guard,
    Start,
    Error,
    End,
}

impl CallPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Guard => "guard",
            Self::Start => "start",
            Self::Error => "error",
            Self::End => "end",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "guard" => Some(Self::Guard),
            "start" => Some(Self::Start),
            "error" => Some(Self::Error),
            "end" => Some(Self::End),
            _ => None,
        }
    }

    /// Phases a call may be in immediately before entering this one.
    /// `None` means "not yet seen".
    fn allowed_from(&self) -> &'static [Option<CallPhase>] {
        match self {
            Self::Guard => &[None],
            Self::Start => &[Some(Self::Guard)],
            Self::Error => &[Some(Self::Guard), Some(Self::Start)],
            Self::End => &[Some(Self::Start), Some(Self::Error)],
        }
    }
}

impl fmt::Display for CallPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors from parsing or applying call-state events.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CallStateError {
    #[error("invalid call state format: {0}")]
    Format(String),
    #[error("invalid state transition: {prev:?} -> {next} ({urn})")]
    Transition {
        prev: Option<CallPhase>,
        next: CallPhase,
        urn: String,
    },
}

/// One call-state event emitted by a remote wrapper.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallState {
    pub run_id: String,
    pub fn_name: String,
    pub fn_id: String,
    pub call_id: String,
    pub phase: CallPhase,
    pub msg: String,
}

impl CallState {
    /// Serialize to the wire form embedded in stdout.
    pub fn to_urn(&self) -> String {
        to_urn(&[
            "mini",
            "run",
            &self.run_id,
            "fn",
            &self.fn_name,
            &self.fn_id,
            "call",
            &self.call_id,
            self.phase.as_str(),
            &self.msg,
        ])
    }

    /// Quick structural check, run on every stdout line before parsing.
    pub fn matches(line: &str) -> bool {
        matches_urn(line, CALL_STATE_PATTERN)
    }

    /// Parse the wire form. Requires exactly ten parts with the fixed
    /// literals and a known phase.
    pub fn from_urn(line: &str) -> Result<Self, CallStateError> {
        let parts = parse_urn(line);
        match parts.as_slice() {
            [mini, run, run_id, fnl, fn_name, fn_id, call, call_id, phase, msg]
                if mini == "mini" && run == "run" && fnl == "fn" && call == "call" =>
            {
                let Some(phase) = CallPhase::parse(phase) else {
                    return Err(CallStateError::Format(line.to_owned()));
                };
                Ok(Self {
                    run_id: run_id.clone(),
                    fn_name: fn_name.clone(),
                    fn_id: fn_id.clone(),
                    call_id: call_id.clone(),
                    phase,
                    msg: msg.clone(),
                })
            }
            _ => Err(CallStateError::Format(line.to_owned())),
        }
    }
}

impl fmt::Display for CallState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_urn())
    }
}

/// Tracks the state of remotely executing calls for one run.
///
/// Single-threaded by contract: all updates happen on the log-pump task.
#[derive(Debug)]
pub struct CallTracker {
    run_id: String,
    calls: HashMap<String, CallPhase>,
    counts: HashMap<CallPhase, usize>,
    history: Vec<CallState>,
}

impl CallTracker {
    pub fn new(run_id: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            calls: HashMap::new(),
            counts: HashMap::new(),
            history: Vec::new(),
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Apply one event. The event is recorded in the history even when the
    /// transition is rejected, so a buggy worker leaves a trace.
    pub fn handle(&mut self, state: CallState) -> Result<(), CallStateError> {
        self.history.push(state.clone());

        let prev = self.calls.get(&state.call_id).copied();
        debug!(
            fn_name = %state.fn_name,
            fn_id = %state.fn_id,
            call_id = %state.call_id,
            ?prev,
            next = %state.phase,
            "call state",
        );
        if !state.phase.allowed_from().contains(&prev) {
            return Err(CallStateError::Transition {
                prev,
                next: state.phase,
                urn: state.to_urn(),
            });
        }

        if let Some(prev) = prev {
            if let Some(count) = self.counts.get_mut(&prev) {
                *count = count.saturating_sub(1);
            }
        }
        *self.counts.entry(state.phase).or_insert(0) += 1;
        self.calls.insert(state.call_id.clone(), state.phase);
        Ok(())
    }

    /// Whether any observed call has not yet reached `end`.
    pub fn any_active(&self) -> bool {
        self.calls.values().any(|phase| *phase != CallPhase::End)
    }

    /// Whether any observed call is currently in the `start` phase.
    pub fn any_running(&self) -> bool {
        self.counts.get(&CallPhase::Start).copied().unwrap_or(0) > 0
    }

    /// Latest phase observed for a call, if any.
    pub fn phase_of(&self, call_id: &str) -> Option<CallPhase> {
        self.calls.get(call_id).copied()
    }

    /// Every event seen, in arrival order, including rejected ones.
    pub fn history(&self) -> &[CallState] {
        &self.history
    }
}

#[cfg(test)]
#[path = "call_state_tests.rs"]
mod tests;
