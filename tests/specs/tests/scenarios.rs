// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! End-to-end scenarios: remote functions invoking local callbacks over
//! the shared queue, guard composition, failure propagation, trailing
//! drain, and run-scope shutdown.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use minirun::call_state::CallPhase;
use minirun::channel::{Producer, ProducerRef};
use minirun::config::{ChannelOptions, ErrorPolicy};
use minirun::guards::{scoped, ExceptionInfo, FnInfo, Guard, GuardScope};
use minirun::hither::{callback, Hither};
use minirun::task_state::TaskPhase;
use minirun::{Error, RemoteError};

use minirun_specs::{wait_for, TestBed};

type Transcript = Arc<Mutex<Vec<String>>>;

/// A guard that records `{label}-in` / `{label}-out` around the call.
fn recording_guard(transcript: &Transcript, label: &str) -> Guard {
    struct Recording {
        transcript: Transcript,
        label: String,
    }
    impl GuardScope for Recording {
        fn enter(&self, _fn_info: &FnInfo) {
            self.transcript.lock().push(format!("{}-in", self.label));
        }
        fn exit(&self, _fn_info: &FnInfo, _exc: Option<&ExceptionInfo>) {
            self.transcript.lock().push(format!("{}-out", self.label));
        }
    }
    scoped(Recording {
        transcript: transcript.clone(),
        label: label.to_owned(),
    })
}

/// A collecting unbatched dispatcher over `T`.
async fn collecting_hither<T>(
    bed: &TestBed,
    options: ChannelOptions,
) -> anyhow::Result<(Hither<T>, Arc<Mutex<Vec<T>>>)>
where
    T: serde::Serialize + serde::de::DeserializeOwned + Send + 'static,
{
    let seen: Arc<Mutex<Vec<T>>> = Arc::new(Mutex::new(Vec::new()));
    let hither = Hither::unbatched(
        &bed.platform,
        callback({
            let seen = seen.clone();
            move |value: T| {
                let seen = seen.clone();
                async move {
                    seen.lock().push(value);
                }
            }
        }),
        options,
    )
    .await?;
    Ok((hither, seen))
}

#[tokio::test]
async fn s1_echo_accumulates_in_order() -> anyhow::Result<()> {
    let bed = TestBed::new("echo");
    let emit = bed.experiment.thither("emit", Default::default(), {
        let platform = bed.platform.clone();
        move |pref: ProducerRef| {
            let platform = platform.clone();
            async move {
                let producer = Producer::<u32>::connect(&platform, &pref).await?;
                for i in 1..=100u32 {
                    producer.send(i).await?;
                }
                Ok::<_, RemoteError>(())
            }
        }
    });

    let run = bed.experiment.start().await?;
    let (hither, seen) = collecting_hither::<u32>(&bed, ChannelOptions::default()).await?;

    emit.call(hither.producer().to_ref()).await?;
    hither.close().await?;
    run.finish().await?;

    assert_eq!(*seen.lock(), (1..=100).collect::<Vec<u32>>());
    assert_eq!(bed.local.queue_count(), 0, "channel released its queue");
    Ok(())
}

#[tokio::test]
async fn s2_interleaved_producers_preserve_per_producer_order() -> anyhow::Result<()> {
    let bed = TestBed::new("interleaved");
    let make_emitter = |label: &'static str| {
        bed.experiment.thither(label, Default::default(), {
            let platform = bed.platform.clone();
            move |pref: ProducerRef| {
                let platform = platform.clone();
                async move {
                    let producer = Producer::<String>::connect(&platform, &pref).await?;
                    for i in 1..=50u32 {
                        producer.send(format!("{label}{i}")).await?;
                    }
                    Ok::<_, RemoteError>(())
                }
            }
        })
    };
    let emit_a = make_emitter("A");
    let emit_b = make_emitter("B");

    let run = bed.experiment.start().await?;
    let (hither, seen) = collecting_hither::<String>(&bed, ChannelOptions::default()).await?;

    let pref = hither.producer().to_ref();
    let (ra, rb) = tokio::join!(emit_a.call(pref.clone()), emit_b.call(pref));
    ra?;
    rb?;
    hither.close().await?;
    run.finish().await?;

    let seen = seen.lock();
    assert_eq!(seen.len(), 100);
    let of = |prefix: &str| -> Vec<String> {
        seen.iter()
            .filter(|v| v.starts_with(prefix))
            .cloned()
            .collect()
    };
    assert_eq!(of("A"), (1..=50).map(|i| format!("A{i}")).collect::<Vec<_>>());
    assert_eq!(of("B"), (1..=50).map(|i| format!("B{i}")).collect::<Vec<_>>());
    Ok(())
}

#[tokio::test]
async fn s3_guard_ordering_around_the_target() -> anyhow::Result<()> {
    let bed = TestBed::new("guards");
    let transcript: Transcript = Arc::new(Mutex::new(Vec::new()));

    let work = bed.experiment.thither("work", Default::default(), {
        let transcript = transcript.clone();
        move |_: ()| {
            let transcript = transcript.clone();
            async move {
                transcript.lock().push("f".to_owned());
                Ok::<_, RemoteError>(())
            }
        }
    });
    bed.experiment.guard_global(recording_guard(&transcript, "g1"));
    bed.experiment.guard_global(recording_guard(&transcript, "g2"));
    bed.experiment.guard_fn(&work, recording_guard(&transcript, "s"));

    let run = bed.experiment.start().await?;
    work.call(()).await?;
    run.finish().await?;

    assert_eq!(
        *transcript.lock(),
        vec!["g1-in", "g2-in", "s-in", "f", "s-out", "g2-out", "g1-out"],
    );
    Ok(())
}

#[tokio::test]
async fn s4_remote_failure_propagates_and_tracks() -> anyhow::Result<()> {
    let bed = TestBed::new("failure");
    let boom = bed
        .experiment
        .thither("boom", Default::default(), |_: ()| async move {
            Err::<(), _>(RemoteError::new("RuntimeError", "boom"))
        });

    let run = bed.experiment.start().await?;
    match boom.call(()).await {
        Err(Error::Remote { kind, message }) => {
            assert_eq!(kind, "RuntimeError");
            assert!(message.contains("boom"));
        }
        Err(other) => anyhow::bail!("unexpected error: {other}"),
        Ok(()) => anyhow::bail!("expected the remote call to fail"),
    }

    // The stdout stream is consumed asynchronously; wait for the final
    // event before asserting the whole path.
    wait_for(|| {
        run.call_history()
            .iter()
            .any(|s| s.phase == CallPhase::End)
    })
    .await?;
    let phases: Vec<CallPhase> = run.call_history().iter().map(|s| s.phase).collect();
    assert_eq!(
        phases,
        vec![
            CallPhase::Guard,
            CallPhase::Start,
            CallPhase::Error,
            CallPhase::End,
        ],
    );
    assert!(!run.any_active());
    run.finish().await?;
    Ok(())
}

#[tokio::test]
async fn s6_trailing_drain_delivers_queued_values() -> anyhow::Result<()> {
    let bed = TestBed::new("drain");
    let emit = bed.experiment.thither("emit", Default::default(), {
        let platform = bed.platform.clone();
        move |pref: ProducerRef| {
            let platform = platform.clone();
            async move {
                let producer = Producer::<u32>::connect(&platform, &pref).await?;
                producer.send_many((0..10u32).collect()).await?;
                Ok::<_, RemoteError>(())
            }
        }
    });

    let run = bed.experiment.start().await?;
    let (hither, seen) = collecting_hither::<u32>(&bed, ChannelOptions::default()).await?;

    // Close immediately after the producer returns; the trailing window
    // must flush everything already queued.
    emit.call(hither.producer().to_ref()).await?;
    hither.close().await?;
    run.finish().await?;

    assert_eq!(*seen.lock(), (0..10).collect::<Vec<u32>>());
    Ok(())
}

#[tokio::test]
async fn s6_zero_trailing_window_raises_under_throw_policy() -> anyhow::Result<()> {
    let bed = TestBed::new("drain-throw");
    let emit = bed.experiment.thither("emit", Default::default(), {
        let platform = bed.platform.clone();
        move |pref: ProducerRef| {
            let platform = platform.clone();
            async move {
                let producer = Producer::<u32>::connect(&platform, &pref).await?;
                producer.send_many((0..10u32).collect()).await?;
                Ok::<_, RemoteError>(())
            }
        }
    });

    let run = bed.experiment.start().await?;
    // A deliberately slow callback keeps values queued at close time.
    let seen: Arc<Mutex<Vec<u32>>> = Arc::new(Mutex::new(Vec::new()));
    let hither = Hither::unbatched(
        &bed.platform,
        callback({
            let seen = seen.clone();
            move |value: u32| {
                let seen = seen.clone();
                async move {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    seen.lock().push(value);
                }
            }
        }),
        ChannelOptions {
            trailing_timeout: Some(Duration::ZERO),
            errors: ErrorPolicy::Throw,
        },
    )
    .await?;

    emit.call(hither.producer().to_ref()).await?;
    let result = hither.close().await;
    assert!(matches!(result, Err(Error::TrailingDrain)));
    run.finish().await?;
    Ok(())
}

#[tokio::test]
async fn task_telemetry_reaches_subscribers() -> anyhow::Result<()> {
    let bed = TestBed::new("telemetry");
    let noop = bed
        .experiment
        .thither("noop", Default::default(), |_: ()| async move {
            Ok::<_, RemoteError>(())
        });

    let run = bed.experiment.start().await?;
    let mut snapshots = run.subscribe_tasks();
    noop.call(()).await?;

    let completed = tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            let snapshot = match snapshots.recv().await {
                Ok(snapshot) => snapshot,
                Err(_) => return false,
            };
            if snapshot
                .tasks
                .iter()
                .any(|t| t.phase == TaskPhase::Completed)
            {
                return true;
            }
        }
    })
    .await?;
    assert!(completed, "a task must reach the completed phase");

    run.announce("all done");
    let message = tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            match snapshots.recv().await {
                Ok(snapshot) if snapshot.message == "all done" => return true,
                Ok(_) => continue,
                Err(_) => return false,
            }
        }
    })
    .await?;
    assert!(message, "announced message must reach subscribers");

    run.finish().await?;
    Ok(())
}

#[tokio::test]
async fn shutdown_releases_every_resource() -> anyhow::Result<()> {
    let bed = TestBed::new("shutdown");
    let emit = bed.experiment.thither("emit", Default::default(), {
        let platform = bed.platform.clone();
        move |pref: ProducerRef| {
            let platform = platform.clone();
            async move {
                let producer = Producer::<u32>::connect(&platform, &pref).await?;
                producer.send(1).await?;
                Ok::<_, RemoteError>(())
            }
        }
    });

    let run = bed.experiment.start().await?;
    let (hither, _seen) = collecting_hither::<u32>(&bed, ChannelOptions::default()).await?;
    emit.call(hither.producer().to_ref()).await?;
    hither.close().await?;
    run.finish().await?;

    assert_eq!(bed.local.queue_count(), 0);
    assert!(matches!(
        emit.call(hither_ref_placeholder()).await,
        Err(Error::NotRunning { .. })
    ));
    Ok(())
}

/// A syntactically valid producer ref for calls that must fail before
/// reaching the queue.
fn hither_ref_placeholder() -> ProducerRef {
    ProducerRef {
        queue_id: "qu-gone".to_owned(),
        payload_partition: "default".to_owned(),
        signal_partition: "signal".to_owned(),
        codec: "json".to_owned(),
    }
}
