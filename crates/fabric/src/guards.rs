// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Before/after guards composed around remote invocations.
//!
//! A guard is a scoped resource running in the remote container: `enter`
//! fires before the target, `exit` after it, with exception info when the
//! target failed. Global guards wrap per-function guards, which wrap the
//! target; release order is the reverse of acquire order.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::thither::RemoteError;

/// Exception details passed by value to `after` guards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExceptionInfo {
    pub kind: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cause: Option<String>,
}

impl ExceptionInfo {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
            cause: None,
        }
    }
}

impl From<&RemoteError> for ExceptionInfo {
    fn from(err: &RemoteError) -> Self {
        Self::new(err.kind.clone(), err.message.clone())
    }
}

/// Identity of the function a guard wraps.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FnInfo {
    pub name: String,
    pub fn_id: String,
}

/// Scoped resource run around a remote invocation.
pub trait GuardScope: Send + Sync {
    fn enter(&self, fn_info: &FnInfo);
    fn exit(&self, fn_info: &FnInfo, exc: Option<&ExceptionInfo>);
}

/// A guard value: cheap to clone, held by the driver, borrowed by each
/// invocation while the wrapping is in effect.
#[derive(Clone)]
pub struct Guard(Arc<dyn GuardScope>);

impl Guard {
    pub fn enter(&self, fn_info: &FnInfo) {
        self.0.enter(fn_info);
    }

    pub fn exit(&self, fn_info: &FnInfo, exc: Option<&ExceptionInfo>) {
        self.0.exit(fn_info, exc);
    }
}

impl std::fmt::Debug for Guard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Guard(..)")
    }
}

/// Wrap a custom scoped resource as a guard.
pub fn scoped(scope: impl GuardScope + 'static) -> Guard {
    Guard(Arc::new(scope))
}

/// A guard that runs before the function is executed.
pub fn before(callback: impl Fn() + Send + Sync + 'static) -> Guard {
    struct Before<F>(F);
    impl<F: Fn() + Send + Sync> GuardScope for Before<F> {
        fn enter(&self, _fn_info: &FnInfo) {
            (self.0)();
        }
        fn exit(&self, _fn_info: &FnInfo, _exc: Option<&ExceptionInfo>) {}
    }
    Guard(Arc::new(Before(callback)))
}

/// A before guard that receives the function being called.
pub fn before_fn(callback: impl Fn(&FnInfo) + Send + Sync + 'static) -> Guard {
    struct BeforeFn<F>(F);
    impl<F: Fn(&FnInfo) + Send + Sync> GuardScope for BeforeFn<F> {
        fn enter(&self, fn_info: &FnInfo) {
            (self.0)(fn_info);
        }
        fn exit(&self, _fn_info: &FnInfo, _exc: Option<&ExceptionInfo>) {}
    }
    Guard(Arc::new(BeforeFn(callback)))
}

/// A guard that runs after the function has executed.
pub fn after(callback: impl Fn() + Send + Sync + 'static) -> Guard {
    struct After<F>(F);
    impl<F: Fn() + Send + Sync> GuardScope for After<F> {
        fn enter(&self, _fn_info: &FnInfo) {}
        fn exit(&self, _fn_info: &FnInfo, _exc: Option<&ExceptionInfo>) {
            (self.0)();
        }
    }
    Guard(Arc::new(After(callback)))
}

/// An after guard that receives the function being called.
pub fn after_fn(callback: impl Fn(&FnInfo) + Send + Sync + 'static) -> Guard {
    struct AfterFn<F>(F);
    impl<F: Fn(&FnInfo) + Send + Sync> GuardScope for AfterFn<F> {
        fn enter(&self, _fn_info: &FnInfo) {}
        fn exit(&self, fn_info: &FnInfo, _exc: Option<&ExceptionInfo>) {
            (self.0)(fn_info);
        }
    }
    Guard(Arc::new(AfterFn(callback)))
}

/// An after guard that receives the exception raised by the target, if
/// any.
pub fn after_exc(callback: impl Fn(Option<&ExceptionInfo>) + Send + Sync + 'static) -> Guard {
    struct AfterExc<F>(F);
    impl<F: Fn(Option<&ExceptionInfo>) + Send + Sync> GuardScope for AfterExc<F> {
        fn enter(&self, _fn_info: &FnInfo) {}
        fn exit(&self, _fn_info: &FnInfo, exc: Option<&ExceptionInfo>) {
            (self.0)(exc);
        }
    }
    Guard(Arc::new(AfterExc(callback)))
}

/// An after guard that receives both the function and the exception.
pub fn after_fn_exc(
    callback: impl Fn(&FnInfo, Option<&ExceptionInfo>) + Send + Sync + 'static,
) -> Guard {
    struct AfterFnExc<F>(F);
    impl<F: Fn(&FnInfo, Option<&ExceptionInfo>) + Send + Sync> GuardScope for AfterFnExc<F> {
        fn enter(&self, _fn_info: &FnInfo) {}
        fn exit(&self, fn_info: &FnInfo, exc: Option<&ExceptionInfo>) {
            (self.0)(fn_info, exc);
        }
    }
    Guard(Arc::new(AfterFnExc(callback)))
}

/// Ordered guard lists held by the driver: global guards wrap the
/// per-function ones.
#[derive(Default)]
pub struct GuardRegistry {
    global: RwLock<Vec<Guard>>,
    by_fn: RwLock<HashMap<String, Vec<Guard>>>,
}

impl GuardRegistry {
    pub fn add_global(&self, guard: Guard) {
        self.global.write().push(guard);
    }

    pub fn add_for(&self, fn_id: &str, guard: Guard) {
        self.by_fn
            .write()
            .entry(fn_id.to_owned())
            .or_default()
            .push(guard);
    }

    /// Composition order for one invocation: global guards first, then
    /// the function's own, outermost first.
    pub fn snapshot(&self, fn_id: &str) -> Vec<Guard> {
        let mut guards = self.global.read().clone();
        if let Some(specific) = self.by_fn.read().get(fn_id) {
            guards.extend(specific.iter().cloned());
        }
        guards
    }
}

/// Run a target future wrapped by the given guards: enter in order, exit
/// in reverse order. An `Err` from the target is observed by every exit
/// exactly once and continues to propagate.
pub async fn run_guarded<T, F>(
    guards: &[Guard],
    fn_info: &FnInfo,
    target: F,
) -> Result<T, RemoteError>
where
    F: Future<Output = Result<T, RemoteError>>,
{
    for guard in guards {
        guard.enter(fn_info);
    }
    let result = target.await;
    let exc = result.as_ref().err().map(ExceptionInfo::from);
    for guard in guards.iter().rev() {
        guard.exit(fn_info, exc.as_ref());
    }
    result
}

#[cfg(test)]
#[path = "guards_tests.rs"]
mod tests;
