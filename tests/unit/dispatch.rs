//! Dispatcher semantics: queue keying, Delete flushing, worker
//! assignment stability and per-worker serialization.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use postgresql_operator::controller::dispatch::WorkerQueue;
use postgresql_operator::controller::{ClusterEvent, EventType};
use postgresql_operator::util::{NamespacedName, cluster_worker_id};

fn event(event_type: EventType, uid: &str, name: &str) -> ClusterEvent {
    ClusterEvent {
        event_type,
        uid: uid.to_string(),
        cluster_name: NamespacedName::new("default", name),
        old_spec: None,
        new_spec: None,
        worker_id: 0,
    }
}

#[test]
fn worker_assignment_is_a_pure_function() {
    for workers in [1u32, 2, 4, 8, 16] {
        for (ns, name) in [
            ("default", "acid-minimal"),
            ("prod", "acid-minimal"),
            ("default", "team-a-db"),
        ] {
            let cluster = NamespacedName::new(ns, name);
            let id = cluster_worker_id(&cluster, workers);
            assert!(id < workers);
            for _ in 0..50 {
                assert_eq!(cluster_worker_id(&cluster, workers), id);
            }
        }
    }
}

#[test]
fn add_events_are_deduplicated_per_cluster() {
    let queue = WorkerQueue::default();
    queue.add(event(EventType::Add, "uid-1", "acid-a"));
    queue.add(event(EventType::Add, "uid-1", "acid-a"));
    queue.add(event(EventType::Add, "uid-2", "acid-b"));
    assert_eq!(queue.dump().len(), 2);
}

#[test]
fn delete_flushes_all_earlier_events_of_the_cluster() {
    let queue = WorkerQueue::default();
    queue.add(event(EventType::Add, "uid-1", "acid-a"));
    queue.add(event(EventType::Update, "uid-1", "acid-a"));
    queue.add(event(EventType::Sync, "uid-1", "acid-a"));
    queue.add(event(EventType::Update, "uid-2", "acid-b"));
    queue.add(event(EventType::Delete, "uid-1", "acid-a"));

    let dump = queue.dump();
    assert_eq!(dump.len(), 2);
    assert!(dump.iter().all(|e| e.uid != "uid-1" || e.event_type == EventType::Delete));
}

/// Events popped from one queue never overlap: the consumer finishes one
/// before it sees the next.
#[tokio::test]
async fn queue_consumption_is_serial() {
    let queue = Arc::new(WorkerQueue::default());
    for i in 0..100 {
        queue.add(event(EventType::Sync, &format!("uid-{i}"), "acid-a"));
    }

    let in_flight = Arc::new(AtomicBool::new(false));
    let processed = Arc::new(AtomicUsize::new(0));

    let consumer = {
        let queue = Arc::clone(&queue);
        let in_flight = Arc::clone(&in_flight);
        let processed = Arc::clone(&processed);
        tokio::spawn(async move {
            while processed.load(Ordering::SeqCst) < 100 {
                let _event = queue.pop().await;
                assert!(
                    !in_flight.swap(true, Ordering::SeqCst),
                    "two events processed concurrently"
                );
                tokio::task::yield_now().await;
                in_flight.store(false, Ordering::SeqCst);
                processed.fetch_add(1, Ordering::SeqCst);
            }
        })
    };

    consumer.await.unwrap();
    assert_eq!(processed.load(Ordering::SeqCst), 100);
    assert!(queue.is_empty());
}
