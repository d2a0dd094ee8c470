// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;

use super::{batch_receiver, Producer, SendTo, PAYLOAD_PARTITION, SIGNAL_PARTITION};
use crate::config::{ChannelOptions, ErrorPolicy};
use crate::error::Error;
use crate::platform::{local::LocalPlatform, Platform};

fn test_platform() -> Arc<dyn Platform> {
    Arc::new(LocalPlatform::new())
}

/// Receiver that appends every delivered value to a shared list.
fn collector<T: Send + 'static>(
    into: Arc<Mutex<Vec<T>>>,
) -> Box<dyn super::BatchReceiver<T>> {
    batch_receiver(move |values: Vec<T>| {
        let into = into.clone();
        Box::pin(async move {
            into.lock().extend(values);
        })
    })
}

async fn wait_for<F: Fn() -> bool>(cond: F) -> anyhow::Result<()> {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !cond() {
        if tokio::time::Instant::now() > deadline {
            anyhow::bail!("condition not reached in time");
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    Ok(())
}

#[tokio::test]
async fn delivers_each_value_exactly_once() -> anyhow::Result<()> {
    let platform = test_platform();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let channel =
        SendTo::open(&platform, collector(seen.clone()), ChannelOptions::default()).await?;

    let producer = channel.producer();
    for i in 0..10u32 {
        producer.send(i).await?;
    }

    wait_for(|| seen.lock().len() == 10).await?;
    channel.close().await?;
    assert_eq!(*seen.lock(), (0..10).collect::<Vec<u32>>());
    Ok(())
}

#[tokio::test]
async fn preserves_order_within_one_producer() -> anyhow::Result<()> {
    let platform = test_platform();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let channel =
        SendTo::open(&platform, collector(seen.clone()), ChannelOptions::default()).await?;

    let producer = channel.producer();
    producer
        .send_many((0..100u32).collect::<Vec<_>>())
        .await?;
    channel.close().await?;

    assert_eq!(*seen.lock(), (0..100).collect::<Vec<u32>>());
    Ok(())
}

#[tokio::test]
async fn interleaves_producers_without_losing_values() -> anyhow::Result<()> {
    let platform = test_platform();
    let seen: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let channel =
        SendTo::open(&platform, collector(seen.clone()), ChannelOptions::default()).await?;

    let a = channel.producer();
    let b = channel.producer();
    let send_a = tokio::spawn(async move {
        for i in 0..50 {
            a.send(format!("A{i}")).await?;
        }
        Ok::<_, crate::platform::PlatformError>(())
    });
    let send_b = tokio::spawn(async move {
        for i in 0..50 {
            b.send(format!("B{i}")).await?;
        }
        Ok::<_, crate::platform::PlatformError>(())
    });
    send_a.await??;
    send_b.await??;
    channel.close().await?;

    let seen = seen.lock();
    assert_eq!(seen.len(), 100);
    let of = |prefix: char| -> Vec<String> {
        seen.iter()
            .filter(|v| v.starts_with(prefix))
            .cloned()
            .collect()
    };
    assert_eq!(of('A'), (0..50).map(|i| format!("A{i}")).collect::<Vec<_>>());
    assert_eq!(of('B'), (0..50).map(|i| format!("B{i}")).collect::<Vec<_>>());
    Ok(())
}

#[tokio::test]
async fn tolerates_spurious_wakeups() -> anyhow::Result<()> {
    let platform = test_platform();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let channel =
        SendTo::open(&platform, collector(seen.clone()), ChannelOptions::default()).await?;

    // A wake token with no payload behind it.
    let queue = platform.open_queue(&channel.producer().to_ref().queue_id).await?;
    queue.put(SIGNAL_PARTITION, Bytes::from_static(b"1")).await?;
    tokio::time::sleep(Duration::from_millis(20)).await;

    channel.producer().send(7u32).await?;
    wait_for(|| seen.lock().as_slice() == [7u32]).await?;
    channel.close().await?;
    Ok(())
}

#[tokio::test]
async fn drops_undecodable_values_and_continues() -> anyhow::Result<()> {
    let platform = test_platform();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let channel =
        SendTo::open(&platform, collector(seen.clone()), ChannelOptions::default()).await?;

    let queue = platform.open_queue(&channel.producer().to_ref().queue_id).await?;
    queue
        .put(PAYLOAD_PARTITION, Bytes::from_static(b"not json"))
        .await?;
    queue.put(SIGNAL_PARTITION, Bytes::from_static(b"1")).await?;

    channel.producer().send(1u32).await?;
    wait_for(|| seen.lock().as_slice() == [1u32]).await?;
    channel.close().await?;
    Ok(())
}

#[tokio::test]
async fn close_delivers_trailing_messages() -> anyhow::Result<()> {
    let platform = test_platform();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let channel =
        SendTo::open(&platform, collector(seen.clone()), ChannelOptions::default()).await?;

    // Close immediately after sending; the trailing window must flush.
    let producer = channel.producer();
    producer.send_many((0..10u32).collect::<Vec<_>>()).await?;
    channel.close().await?;

    assert_eq!(*seen.lock(), (0..10).collect::<Vec<u32>>());
    Ok(())
}

#[tokio::test]
async fn zero_window_with_throw_policy_raises() -> anyhow::Result<()> {
    let platform = test_platform();
    let seen: Arc<Mutex<Vec<u32>>> = Arc::new(Mutex::new(Vec::new()));
    let options = ChannelOptions {
        trailing_timeout: Some(Duration::ZERO),
        errors: ErrorPolicy::Throw,
    };
    let channel = SendTo::open(&platform, collector(seen.clone()), options).await?;

    channel.producer().send_many((0..10u32).collect()).await?;
    let result = channel.close().await;
    assert!(matches!(result, Err(Error::TrailingDrain)));
    Ok(())
}

#[tokio::test]
async fn zero_window_with_log_policy_closes_cleanly() -> anyhow::Result<()> {
    let platform = test_platform();
    let seen: Arc<Mutex<Vec<u32>>> = Arc::new(Mutex::new(Vec::new()));
    let options = ChannelOptions {
        trailing_timeout: Some(Duration::ZERO),
        errors: ErrorPolicy::Log,
    };
    let channel = SendTo::open(&platform, collector(seen.clone()), options).await?;
    channel.producer().send_many((0..10u32).collect()).await?;
    channel.close().await?;
    Ok(())
}

#[tokio::test]
async fn close_releases_the_queue() -> anyhow::Result<()> {
    let local = Arc::new(LocalPlatform::new());
    let platform: Arc<dyn Platform> = local.clone();
    let seen: Arc<Mutex<Vec<u32>>> = Arc::new(Mutex::new(Vec::new()));
    let channel =
        SendTo::open(&platform, collector(seen.clone()), ChannelOptions::default()).await?;
    assert_eq!(local.queue_count(), 1);
    channel.close().await?;
    assert_eq!(local.queue_count(), 0);
    Ok(())
}

#[tokio::test]
async fn producer_rebuilds_from_its_ref() -> anyhow::Result<()> {
    let platform = test_platform();
    let seen: Arc<Mutex<Vec<u32>>> = Arc::new(Mutex::new(Vec::new()));
    let channel =
        SendTo::open(&platform, collector(seen.clone()), ChannelOptions::default()).await?;

    let pref = channel.producer().to_ref();
    let json = serde_json::to_string(&pref)?;
    let restored: super::ProducerRef = serde_json::from_str(&json)?;

    // A "remote" producer built from nothing but the ref.
    let remote = {
        let platform = platform.clone();
        tokio::spawn(async move {
            let producer: Producer<u32> = Producer::connect(&platform, &restored).await?;
            producer.send(42).await?;
            Ok::<_, crate::platform::PlatformError>(())
        })
    };
    remote.await??;

    wait_for(|| seen.lock().as_slice() == [42u32]).await?;
    channel.close().await?;
    Ok(())
}

#[tokio::test]
async fn connect_rejects_unknown_codec() -> anyhow::Result<()> {
    let platform = test_platform();
    let seen: Arc<Mutex<Vec<u32>>> = Arc::new(Mutex::new(Vec::new()));
    let channel =
        SendTo::open(&platform, collector(seen.clone()), ChannelOptions::default()).await?;

    let mut pref = channel.producer().to_ref();
    pref.codec = "pickle".to_owned();
    let result = Producer::<u32>::connect(&platform, &pref).await;
    assert!(matches!(
        result.map(|_| ()),
        Err(crate::platform::PlatformError::Codec(_))
    ));
    channel.close().await?;
    Ok(())
}
