// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Many-producer, one-consumer channel over a shared platform queue.
//!
//! Producers append serialized values to the `default` partition and post
//! one wake token per batch on the `signal` partition, so the consumer
//! never polls. The consumer races the signal wait against a stop token;
//! after either resolves it drains the payload partition non-blockingly
//! and hands the batch to the receiver. On close, messages already queued
//! are delivered within a bounded trailing window.

use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::{ChannelOptions, ErrorPolicy};
use crate::error::Error;
use crate::platform::{Platform, PlatformError, SharedQueue, QUEUE_MAX_LEN};

/// Payload partition name.
pub const PAYLOAD_PARTITION: &str = "default";
/// Wake-token partition name.
pub const SIGNAL_PARTITION: &str = "signal";

/// Wire codec used for queue payloads.
const CODEC_JSON: &str = "json";

/// Consumer side of a batch channel: called once per delivered batch,
/// sequentially, on the channel's single consumer task.
#[async_trait]
pub trait BatchReceiver<T>: Send {
    async fn receive(&mut self, values: Vec<T>);
}

/// Adapt a closure returning a boxed future into a [`BatchReceiver`].
pub fn batch_receiver<T, F>(f: F) -> Box<dyn BatchReceiver<T>>
where
    T: Send + 'static,
    F: FnMut(Vec<T>) -> futures_util::future::BoxFuture<'static, ()> + Send + 'static,
{
    struct FnReceiver<T, F> {
        f: F,
        _marker: PhantomData<fn(T)>,
    }

    #[async_trait]
    impl<T, F> BatchReceiver<T> for FnReceiver<T, F>
    where
        T: Send + 'static,
        F: FnMut(Vec<T>) -> futures_util::future::BoxFuture<'static, ()> + Send + 'static,
    {
        async fn receive(&mut self, values: Vec<T>) {
            (self.f)(values).await;
        }
    }

    Box::new(FnReceiver {
        f,
        _marker: PhantomData,
    })
}

/// Serializable handle from which a producer can be rebuilt in another
/// process. Producers close over nothing but this ref and the platform's
/// queue handle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProducerRef {
    pub queue_id: String,
    pub payload_partition: String,
    pub signal_partition: String,
    pub codec: String,
}

/// Producer end of a channel. Cheap to clone; safe to hand to remote
/// workers by way of [`Producer::to_ref`].
pub struct Producer<T> {
    queue: Arc<dyn SharedQueue>,
    _marker: PhantomData<fn(T)>,
}

impl<T> Clone for Producer<T> {
    fn clone(&self) -> Self {
        Self {
            queue: self.queue.clone(),
            _marker: PhantomData,
        }
    }
}

impl<T: Serialize + Send> Producer<T> {
    fn new(queue: Arc<dyn SharedQueue>) -> Self {
        Self {
            queue,
            _marker: PhantomData,
        }
    }

    /// Rebuild a producer from a serialized ref, typically inside a
    /// remote worker.
    pub async fn connect(
        platform: &Arc<dyn Platform>,
        pref: &ProducerRef,
    ) -> Result<Self, PlatformError> {
        if pref.codec != CODEC_JSON {
            return Err(PlatformError::Codec(pref.codec.clone()));
        }
        let queue = platform.open_queue(&pref.queue_id).await?;
        Ok(Self::new(queue))
    }

    /// The serializable handle for this producer.
    pub fn to_ref(&self) -> ProducerRef {
        ProducerRef {
            queue_id: self.queue.id().to_owned(),
            payload_partition: PAYLOAD_PARTITION.to_owned(),
            signal_partition: SIGNAL_PARTITION.to_owned(),
            codec: CODEC_JSON.to_owned(),
        }
    }

    /// Send one value (a one-element batch on the wire).
    pub async fn send(&self, value: T) -> Result<(), PlatformError> {
        self.send_many(vec![value]).await
    }

    /// Send a batch: append every value to the payload partition, then
    /// post a single wake token.
    pub async fn send_many(&self, values: Vec<T>) -> Result<(), PlatformError> {
        if values.is_empty() {
            return Ok(());
        }
        let mut payload = Vec::with_capacity(values.len());
        for value in &values {
            payload.push(Bytes::from(serde_json::to_vec(value)?));
        }
        self.queue.put_many(PAYLOAD_PARTITION, payload).await?;
        self.queue
            .put(SIGNAL_PARTITION, Bytes::from_static(b"1"))
            .await
    }
}

/// Local end of a channel: owns the queue and the single consumer task
/// from creation to release.
pub struct SendTo<T> {
    producer: Producer<T>,
    queue: Arc<dyn SharedQueue>,
    stop: CancellationToken,
    consumer: JoinHandle<()>,
    options: ChannelOptions,
}

impl<T> SendTo<T>
where
    T: Serialize + DeserializeOwned + Send + 'static,
{
    /// Create the shared queue and start the consumer task.
    pub async fn open(
        platform: &Arc<dyn Platform>,
        receiver: Box<dyn BatchReceiver<T>>,
        options: ChannelOptions,
    ) -> Result<Self, Error> {
        let queue = platform.queue().await.map_err(Error::Platform)?;
        let stop = CancellationToken::new();
        debug!(queue_id = %queue.id(), "starting consumer task");
        let consumer = tokio::spawn(consume(queue.clone(), receiver, stop.clone()));
        Ok(Self {
            producer: Producer::new(queue.clone()),
            queue,
            stop,
            consumer,
            options,
        })
    }

    /// A producer for this channel.
    pub fn producer(&self) -> Producer<T> {
        self.producer.clone()
    }

    /// Stop the consumer, giving it the trailing-drain window to deliver
    /// messages already queued, then release the queue.
    ///
    /// On a drain timeout the consumer task is cancelled and the outcome
    /// follows the `errors` policy: log a warning (default) or return
    /// [`Error::TrailingDrain`].
    pub async fn close(mut self) -> Result<(), Error> {
        debug!(queue_id = %self.queue.id(), "stopping consumer task");
        self.stop.cancel();

        let drained = match self.options.trailing_timeout {
            Some(window) => tokio::time::timeout(window, &mut self.consumer)
                .await
                .is_ok(),
            None => {
                let _ = (&mut self.consumer).await;
                true
            }
        };
        if !drained {
            self.consumer.abort();
        }
        let _ = self.queue.release().await;

        if drained {
            Ok(())
        } else {
            match self.options.errors {
                ErrorPolicy::Throw => Err(Error::TrailingDrain),
                ErrorPolicy::Log => {
                    warn!(queue_id = %self.queue.id(), "timed out waiting for trailing messages");
                    Ok(())
                }
            }
        }
    }
}

/// The single consumer loop. Exactly one per channel; always runs
/// locally.
async fn consume<T>(
    queue: Arc<dyn SharedQueue>,
    mut receiver: Box<dyn BatchReceiver<T>>,
    stop: CancellationToken,
) where
    T: DeserializeOwned + Send + 'static,
{
    loop {
        // Wait until values are produced or a stop is requested. Checking
        // which one won the race here, rather than after the drain, keeps
        // a batch that raced the stop from being dropped.
        let stopping = tokio::select! {
            _ = stop.cancelled() => true,
            signal = queue.get_many(SIGNAL_PARTITION, QUEUE_MAX_LEN) => match signal {
                Ok(_) => false,
                Err(err) => {
                    debug!("signal wait ended: {err}");
                    true
                }
            },
        };

        // Either way, take all available payload. Spurious wakeups drain
        // an empty batch and are harmless.
        loop {
            let raw = match queue.try_get_many(PAYLOAD_PARTITION, QUEUE_MAX_LEN).await {
                Ok(raw) => raw,
                Err(err) => {
                    debug!("payload drain ended: {err}");
                    return;
                }
            };
            if raw.is_empty() {
                break;
            }
            let values = decode_batch(&raw);
            if !values.is_empty() {
                receiver.receive(values).await;
            }
            if !stopping {
                // One drain per wakeup while running; the next signal
                // token will wake us again.
                break;
            }
        }

        if stopping {
            let _ = queue.clear().await;
            return;
        }
    }
}

fn decode_batch<T: DeserializeOwned>(raw: &[Bytes]) -> Vec<T> {
    let mut values = Vec::with_capacity(raw.len());
    for bytes in raw {
        match serde_json::from_slice(bytes) {
            Ok(value) => values.push(value),
            Err(err) => warn!("dropping undecodable value: {err}"),
        }
    }
    values
}

#[cfg(test)]
#[path = "channel_tests.rs"]
mod tests;
