// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Remote execution of registered functions, wrapped by ordered guards.
//!
//! The remote wrapper emits call-state URNs to the container's stdout at
//! each phase; the local stub forwards arguments together with the run id
//! and a fresh call id, and re-raises remote failures with their original
//! kind and message.

use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::call_state::{CallPhase, CallState};
use crate::error::Error;
use crate::experiment::RunSlot;
use crate::guards::{run_guarded, FnInfo, GuardRegistry};
use crate::platform::{RemoteBody, WorkerContext};
use crate::urn::short_id;

/// A failure raised by a remote target. Kind and message travel back to
/// the local caller unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct RemoteError {
    pub kind: String,
    pub message: String,
}

impl RemoteError {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
        }
    }
}

impl From<crate::platform::PlatformError> for RemoteError {
    fn from(err: crate::platform::PlatformError) -> Self {
        Self::new("PlatformError", err.to_string())
    }
}

/// Envelope sent from the local stub to the remote invoker.
#[derive(Debug, Serialize, Deserialize)]
struct CallRequest {
    run_id: String,
    call_id: String,
    args: serde_json::Value,
}

/// Envelope returned by the remote wrapper.
#[derive(Debug, Serialize, Deserialize)]
enum CallReply {
    Ok(serde_json::Value),
    Err(RemoteError),
}

/// Local stub for a registered remote function. Calling it inside a run
/// scope schedules one invocation on a remote worker.
pub struct RemoteFunction<A, R> {
    name: String,
    fn_id: String,
    runs: Arc<RunSlot>,
    _marker: PhantomData<fn(A) -> R>,
}

impl<A, R> RemoteFunction<A, R>
where
    A: Serialize + Send,
    R: DeserializeOwned + Send,
{
    pub(crate) fn new(name: String, fn_id: String, runs: Arc<RunSlot>) -> Self {
        Self {
            name,
            fn_id,
            runs,
            _marker: PhantomData,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Stable id of the registered function, for per-function guards.
    pub fn fn_id(&self) -> &str {
        &self.fn_id
    }

    /// Invoke the function remotely and await its result.
    pub async fn call(&self, args: A) -> Result<R, Error> {
        let Some(run) = self.runs.current() else {
            return Err(Error::NotRunning {
                name: self.name.clone(),
            });
        };
        let call_id = short_id();
        debug!(name = %self.name, fn_id = %self.fn_id, call_id = %call_id, "remote call");

        let request = CallRequest {
            run_id: run.run_id.clone(),
            call_id,
            args: serde_json::to_value(&args)?,
        };
        let payload = Bytes::from(serde_json::to_vec(&request)?);
        let reply = run.app.invoke(&self.fn_id, payload).await?;
        match serde_json::from_slice::<CallReply>(&reply)? {
            CallReply::Ok(value) => Ok(serde_json::from_value(value)?),
            CallReply::Err(err) => Err(Error::Remote {
                kind: err.kind,
                message: err.message,
            }),
        }
    }
}

/// Emits the `end` URN when dropped, so a panicking target still
/// finalizes its call state.
struct EndSentinel {
    ctx: WorkerContext,
    urn: String,
}

impl Drop for EndSentinel {
    fn drop(&mut self) {
        self.ctx.emit_line(std::mem::take(&mut self.urn));
    }
}

/// Build the platform-deployable body for one registered function.
pub(crate) fn make_remote_body<A, R, F, Fut>(
    fn_name: String,
    fn_id: String,
    guards: Arc<GuardRegistry>,
    target: F,
) -> RemoteBody
where
    A: DeserializeOwned + Send + 'static,
    R: Serialize + Send + 'static,
    F: Fn(A) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<R, RemoteError>> + Send + 'static,
{
    let target = Arc::new(target);
    Arc::new(move |ctx: WorkerContext, payload: Bytes| {
        let fn_name = fn_name.clone();
        let fn_id = fn_id.clone();
        let guards = guards.clone();
        let target = target.clone();
        Box::pin(async move {
            let reply = run_remote_call(ctx, fn_name, fn_id, guards, target, payload).await;
            encode_reply(reply)
        })
    })
}

/// The wrapper that runs inside the container around the user target.
async fn run_remote_call<A, R, F, Fut>(
    ctx: WorkerContext,
    fn_name: String,
    fn_id: String,
    guards: Arc<GuardRegistry>,
    target: Arc<F>,
    payload: Bytes,
) -> CallReply
where
    A: DeserializeOwned + Send + 'static,
    R: Serialize + Send + 'static,
    F: Fn(A) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<R, RemoteError>> + Send + 'static,
{
    let request: CallRequest = match serde_json::from_slice(&payload) {
        Ok(request) => request,
        Err(err) => {
            return CallReply::Err(RemoteError::new("DecodeError", err.to_string()));
        }
    };

    let state = |phase: CallPhase, msg: &str| {
        CallState {
            run_id: request.run_id.clone(),
            fn_name: fn_name.clone(),
            fn_id: fn_id.clone(),
            call_id: request.call_id.clone(),
            phase,
            msg: msg.to_owned(),
        }
        .to_urn()
    };

    ctx.emit_line(state(CallPhase::Guard, ""));
    let end = EndSentinel {
        ctx: ctx.clone(),
        urn: state(CallPhase::End, ""),
    };

    let args: A = match serde_json::from_value(request.args.clone()) {
        Ok(args) => args,
        Err(err) => {
            let failure = RemoteError::new("DecodeError", err.to_string());
            ctx.emit_line(state(CallPhase::Error, &failure.message));
            drop(end);
            return CallReply::Err(failure);
        }
    };

    ctx.emit_line(state(CallPhase::Start, ""));
    let fn_info = FnInfo {
        name: fn_name.clone(),
        fn_id: fn_id.clone(),
    };
    let composed = guards.snapshot(&fn_id);
    let result = run_guarded(&composed, &fn_info, (*target)(args)).await;

    let reply = match result {
        Ok(value) => match serde_json::to_value(&value) {
            Ok(value) => CallReply::Ok(value),
            Err(err) => {
                let failure = RemoteError::new("EncodeError", err.to_string());
                ctx.emit_line(state(CallPhase::Error, &failure.message));
                CallReply::Err(failure)
            }
        },
        Err(failure) => {
            ctx.emit_line(state(CallPhase::Error, &failure.message));
            CallReply::Err(failure)
        }
    };
    drop(end);
    reply
}

fn encode_reply(reply: CallReply) -> Bytes {
    match serde_json::to_vec(&reply) {
        Ok(bytes) => Bytes::from(bytes),
        Err(err) => {
            let fallback = CallReply::Err(RemoteError::new("EncodeError", err.to_string()));
            Bytes::from(serde_json::to_vec(&fallback).unwrap_or_default())
        }
    }
}

#[cfg(test)]
#[path = "thither_tests.rs"]
mod tests;
