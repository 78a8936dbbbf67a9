//! End-to-end scenarios composing processors, services, batches and
//! catchable blocks the way a host application would.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use taskwarden::{Batch, Catchable, Processor, Service, Task};

/// Submits a quick counting task, retrying while the service is still
/// coming up.
async fn feed(service: &Service, counter: &Arc<AtomicUsize>) {
    for _ in 0..100 {
        let served = counter.clone();
        let task = Task::acquire().handler_fn(move |_ctx| {
            let served = served.clone();
            async move {
                served.fetch_add(1, Ordering::SeqCst);
                None
            }
        });
        if service.add(task).await.is_ok() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("service never accepted the task");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn a_processor_tree_drives_catchable_batch_and_service() {
    let batched = Arc::new(AtomicUsize::new(0));
    let served = Arc::new(AtomicUsize::new(0));
    let batch_counts: Arc<Mutex<Option<(u64, u64)>>> = Arc::new(Mutex::new(None));
    let isolated: Arc<Mutex<Option<String>>> = Arc::new(Mutex::new(None));

    // A child processor that runs an accepting queue for exactly as long as
    // its iteration lives.
    let service = Service::acquire();
    service.set_parallel(2);
    let child = Processor::new("queue");
    let service_for_child = service.clone();
    child.callback(move |ctx| {
        let service = service_for_child.clone();
        async move {
            let _ = service.start(ctx).await;
            false
        }
    });

    let pipeline = Processor::new("pipeline");
    pipeline.add(&child);

    let service_for_main = service.clone();
    let batched_in = batched.clone();
    let served_in = served.clone();
    let batch_counts_in = batch_counts.clone();
    let isolated_in = isolated.clone();
    pipeline.callback(move |ctx| {
        let service = service_for_main.clone();
        let batched = batched_in.clone();
        let served = served_in.clone();
        let batch_counts = batch_counts_in.clone();
        let isolated = isolated_in.clone();
        async move {
            // Fan out a fixed set of tasks and wait for them.
            let batch = Batch::acquire();
            batch.set_parallel(2);
            for _ in 0..6 {
                let batched = batched.clone();
                batch.add(Task::acquire().context(ctx.clone()).handler_fn(move |_ctx| {
                    let batched = batched.clone();
                    async move {
                        batched.fetch_add(1, Ordering::SeqCst);
                        None
                    }
                }));
            }
            *batch_counts.lock().unwrap() = Some(batch.run().await);

            // Feed the child's queue.
            for _ in 0..4 {
                feed(&service, &served).await;
            }

            // A failing step stays isolated inside its block.
            let outcome = Catchable::acquire()
                .body(|_ctx| async move { panic!("flaky step") })
                .catch({
                    let isolated = isolated.clone();
                    move |_ctx, fault| {
                        let isolated = isolated.clone();
                        async move {
                            *isolated.lock().unwrap() = Some(fault.to_string());
                            false
                        }
                    }
                })
                .run(ctx.clone())
                .await;
            assert!(outcome.is_err());

            ctx.cancelled().await;
            false
        }
    });

    let runner = pipeline.clone();
    let token = CancellationToken::new();
    let outer = token.clone();
    let handle = tokio::spawn(async move { runner.start(outer).await });

    tokio::time::sleep(Duration::from_millis(400)).await;
    pipeline.stop();
    handle.await.unwrap().unwrap();

    assert!(pipeline.stopped());
    assert!(child.stopped());
    assert_eq!(batched.load(Ordering::SeqCst), 6);
    assert_eq!(*batch_counts.lock().unwrap(), Some((6, 6)));
    assert_eq!(served.load(Ordering::SeqCst), 4);
    assert_eq!(service.counters(), (4, 4));
    assert!(isolated
        .lock()
        .unwrap()
        .as_deref()
        .unwrap()
        .contains("flaky step"));

    service.release();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn restart_starts_stopped_children_again() {
    let child_runs = Arc::new(AtomicUsize::new(0));

    let child = Processor::new("one-shot");
    let runs = child_runs.clone();
    child.callback(move |_ctx| {
        let runs = runs.clone();
        async move {
            runs.fetch_add(1, Ordering::SeqCst);
            false
        }
    });

    let root = Processor::new("root");
    root.add(&child);
    root.callback(|ctx| async move {
        ctx.cancelled().await;
        false
    });

    let runner = root.clone();
    let token = CancellationToken::new();
    let outer = token.clone();
    let handle = tokio::spawn(async move { runner.start(outer).await });

    tokio::time::sleep(Duration::from_millis(150)).await;
    root.restart();
    tokio::time::sleep(Duration::from_millis(150)).await;
    root.stop();
    handle.await.unwrap().unwrap();

    // The child stops on its own each iteration, so each parent iteration
    // starts it afresh.
    assert_eq!(child_runs.load(Ordering::SeqCst), 2);
}
