// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Local-callback dispatcher: run a callback on the driver even when it
//! is invoked from a remote worker.
//!
//! A callback is given in one of four shapes, all adapted to the same
//! contract: a channel consumer invokes the real callback locally while
//! remote workers hold nothing but a [`Producer`] for the channel. The
//! unbatched variant relays one invocation per sent value; the batched
//! variant hands the callback whatever groupings the queue delivers.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

use crate::channel::{BatchReceiver, Producer, SendTo};
use crate::config::ChannelOptions;
use crate::error::Error;
use crate::platform::Platform;

/// The uniform callback type every shape resolves to.
pub type LocalCallback<T> = Box<dyn FnMut(T) -> BoxFuture<'static, ()> + Send>;

/// A scoped resource that yields a callback on acquire and tears it down
/// on release.
#[async_trait]
pub trait ScopedCallback<T>: Send {
    async fn acquire(&mut self) -> LocalCallback<T>;
    async fn release(&mut self);
}

/// The four accepted callback shapes, as an explicit tagged sum.
/// Construct with [`callback`], [`factory`], [`scoped`], or
/// [`scoped_factory`].
pub enum CallbackShape<T> {
    Bare(LocalCallback<T>),
    Factory(Box<dyn FnOnce() -> LocalCallback<T> + Send>),
    Scoped(Box<dyn ScopedCallback<T>>),
    ScopedFactory(Box<dyn FnOnce() -> Box<dyn ScopedCallback<T>> + Send>),
}

/// A bare async callback.
pub fn callback<T, F, Fut>(mut f: F) -> CallbackShape<T>
where
    F: FnMut(T) -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    CallbackShape::Bare(Box::new(move |value| Box::pin(f(value))))
}

/// A factory invoked once, at channel open, to build the callback.
pub fn factory<T, M, F, Fut>(mk: M) -> CallbackShape<T>
where
    M: FnOnce() -> F + Send + 'static,
    F: FnMut(T) -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    CallbackShape::Factory(Box::new(move || -> LocalCallback<T> {
        let mut f = mk();
        Box::new(move |value| Box::pin(f(value)))
    }))
}

/// A scoped resource with acquire/release hooks around the callback.
pub fn scoped<T>(scope: impl ScopedCallback<T> + 'static) -> CallbackShape<T> {
    CallbackShape::Scoped(Box::new(scope))
}

/// A factory invoked once to build the scoped resource.
pub fn scoped_factory<T, M, S>(mk: M) -> CallbackShape<T>
where
    M: FnOnce() -> S + Send + 'static,
    S: ScopedCallback<T> + 'static,
{
    CallbackShape::ScopedFactory(Box::new(move || -> Box<dyn ScopedCallback<T>> {
        Box::new(mk())
    }))
}

/// Resolve a shape into its callback plus the scope to release later.
async fn resolve<T>(
    shape: CallbackShape<T>,
) -> (LocalCallback<T>, Option<Box<dyn ScopedCallback<T>>>) {
    match shape {
        CallbackShape::Bare(cb) => (cb, None),
        CallbackShape::Factory(mk) => (mk(), None),
        CallbackShape::Scoped(mut scope) => {
            let cb = scope.acquire().await;
            (cb, Some(scope))
        }
        CallbackShape::ScopedFactory(mk) => {
            let mut scope = mk();
            let cb = scope.acquire().await;
            (cb, Some(scope))
        }
    }
}

/// Invokes the callback once per delivered item, in delivery order.
struct ItemReceiver<T> {
    cb: LocalCallback<T>,
}

#[async_trait]
impl<T: Send + 'static> BatchReceiver<T> for ItemReceiver<T> {
    async fn receive(&mut self, values: Vec<T>) {
        for value in values {
            (self.cb)(value).await;
        }
    }
}

/// Hands each delivered grouping to the callback whole.
struct WholeBatchReceiver<T> {
    cb: LocalCallback<Vec<T>>,
}

#[async_trait]
impl<T: Send + 'static> BatchReceiver<T> for WholeBatchReceiver<T> {
    async fn receive(&mut self, values: Vec<T>) {
        (self.cb)(values).await;
    }
}

enum ScopeSlot<T> {
    None,
    Item(Box<dyn ScopedCallback<T>>),
    Batch(Box<dyn ScopedCallback<Vec<T>>>),
}

/// A running local-callback dispatcher. Producers obtained from
/// [`Hither::producer`] are safe to hand to remote workers.
pub struct Hither<T> {
    channel: SendTo<T>,
    scope: ScopeSlot<T>,
}

impl<T> Hither<T>
where
    T: Serialize + DeserializeOwned + Send + 'static,
{
    /// Open an unbatched dispatcher: one callback invocation per value.
    pub async fn unbatched(
        platform: &Arc<dyn Platform>,
        shape: CallbackShape<T>,
        options: ChannelOptions,
    ) -> Result<Self, Error> {
        debug!("starting producer and consumer for unbatched callback");
        let (cb, scope) = resolve(shape).await;
        let channel = SendTo::open(platform, Box::new(ItemReceiver { cb }), options).await?;
        Ok(Self {
            channel,
            scope: scope.map_or(ScopeSlot::None, ScopeSlot::Item),
        })
    }

    /// Open a batched dispatcher: the callback takes a list and receives
    /// values in whatever groupings the queue delivers.
    pub async fn batched(
        platform: &Arc<dyn Platform>,
        shape: CallbackShape<Vec<T>>,
        options: ChannelOptions,
    ) -> Result<Self, Error> {
        debug!("starting producer and consumer for batched callback");
        let (cb, scope) = resolve(shape).await;
        let channel = SendTo::open(platform, Box::new(WholeBatchReceiver { cb }), options).await?;
        Ok(Self {
            channel,
            scope: scope.map_or(ScopeSlot::None, ScopeSlot::Batch),
        })
    }

    /// A producer for this dispatcher. Sends one value per call and
    /// returns as soon as the value is queued.
    pub fn producer(&self) -> Producer<T> {
        self.channel.producer()
    }

    /// Tear down with the trailing-drain discipline, then release the
    /// scoped resource. The drain verdict is reported after the release
    /// has run.
    pub async fn close(self) -> Result<(), Error> {
        let drained = self.channel.close().await;
        match self.scope {
            ScopeSlot::None => {}
            ScopeSlot::Item(mut scope) => scope.release().await,
            ScopeSlot::Batch(mut scope) => scope.release().await,
        }
        drained
    }
}

#[cfg(test)]
#[path = "hither_tests.rs"]
mod tests;
