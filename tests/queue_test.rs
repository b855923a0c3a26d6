//! Integration tests for the queue's grant/defer/confirm protocol.

use std::time::Duration;

use keyq::error::Error;
use keyq::event::EventKind;
use keyq::model::{Message, MessageId, Operation, WorkerId};
use keyq::queue::{OrderingMode, Poll, Queue, QueueConfig, QueueStats};

fn msg(id: &str, key: &str, op: Operation, operand: f64) -> Message {
    Message::with_id(id, key, op, operand)
}

fn granted(poll: Poll) -> Message {
    match poll {
        Poll::Grant(message) => message,
        other => panic!("expected Grant, got {other:?}"),
    }
}

fn relaxed() -> Queue {
    Queue::with_config(QueueConfig {
        ordering: OrderingMode::Relaxed,
        ..QueueConfig::default()
    })
}

// ---------------------------------------------------------------------------
// Basic protocol
// ---------------------------------------------------------------------------

#[test]
fn empty_queue_is_drained() {
    let queue = Queue::new();
    assert_eq!(queue.request_work(&WorkerId::from("w")), Poll::Drained);
}

#[test]
fn enqueue_grant_confirm_drain() {
    let queue = Queue::new();
    let w = WorkerId::from("w");
    queue.enqueue(msg("a", "k1", Operation::Add, 5.0));
    assert_eq!(queue.size(), 1);

    let m = granted(queue.request_work(&w));
    assert_eq!(m.id, MessageId::from("a"));
    assert_eq!(queue.size(), 0);
    assert_eq!(
        queue.stats(),
        QueueStats {
            pending: 0,
            deferred: 0,
            in_flight: 1,
            busy_keys: 1,
        }
    );

    queue.confirm(&w, &m.id).unwrap();
    assert_eq!(queue.stats(), QueueStats::default());
    assert_eq!(queue.request_work(&w), Poll::Drained);
}

#[test]
fn single_worker_drains_mixed_keys() {
    let queue = Queue::new();
    let w = WorkerId::from("w");
    queue.enqueue(msg("a", "k1", Operation::Add, 5.0));
    queue.enqueue(msg("b", "k1", Operation::Sub, 2.0));
    queue.enqueue(msg("c", "k2", Operation::Add, 1.0));

    let mut totals = std::collections::HashMap::new();
    let mut polls = 0;
    loop {
        polls += 1;
        assert!(polls < 100, "single worker failed to drain");
        match queue.request_work(&w) {
            Poll::Grant(m) => {
                let value = totals.entry(m.key.clone()).or_insert(0.0);
                *value = m.operation.apply(Some(*value), m.operand);
                queue.confirm(&w, &m.id).unwrap();
            }
            Poll::NoneAvailable => {}
            Poll::Drained => break,
        }
    }

    assert_eq!(totals["k1"], 3.0);
    assert_eq!(totals["k2"], 1.0);
}

#[test]
fn busy_key_is_never_granted_to_second_worker() {
    let queue = Queue::new();
    let a = WorkerId::from("a");
    let b = WorkerId::from("b");
    queue.enqueue(msg("a1", "k1", Operation::Add, 1.0));
    queue.enqueue(msg("a2", "k1", Operation::Add, 1.0));

    let first = granted(queue.request_work(&a));
    assert_eq!(first.id.as_str(), "a1");

    // B keeps polling; it must never see a2 while A holds k1.
    for _ in 0..5 {
        assert_eq!(queue.request_work(&b), Poll::NoneAvailable);
    }

    queue.confirm(&a, &first.id).unwrap();
    let second = granted(queue.request_work(&b));
    assert_eq!(second.id.as_str(), "a2");
}

#[test]
fn busy_key_does_not_block_other_keys() {
    let queue = Queue::new();
    let a = WorkerId::from("a");
    let b = WorkerId::from("b");
    queue.enqueue(msg("a1", "k1", Operation::Add, 1.0));
    queue.enqueue(msg("a2", "k1", Operation::Add, 1.0));
    queue.enqueue(msg("c1", "k2", Operation::Add, 1.0));

    granted(queue.request_work(&a));
    let other = granted(queue.request_work(&b));
    assert_eq!(other.id.as_str(), "c1");
    assert_eq!(queue.stats().deferred, 1);
}

// ---------------------------------------------------------------------------
// NoneAvailable vs Drained
// ---------------------------------------------------------------------------

#[test]
fn none_available_while_only_in_flight_work_remains() {
    let queue = Queue::new();
    let a = WorkerId::from("a");
    let b = WorkerId::from("b");
    queue.enqueue(msg("a1", "k1", Operation::Add, 1.0));

    let m = granted(queue.request_work(&a));
    // Nothing pending or deferred, but a grant is outstanding.
    assert_eq!(queue.request_work(&b), Poll::NoneAvailable);

    queue.confirm(&a, &m.id).unwrap();
    assert_eq!(queue.request_work(&b), Poll::Drained);
}

#[test]
fn deferred_work_is_flushed_back_not_dropped() {
    let queue = Queue::new();
    let a = WorkerId::from("a");
    let b = WorkerId::from("b");
    queue.enqueue(msg("a1", "k1", Operation::Add, 1.0));
    queue.enqueue(msg("a2", "k1", Operation::Add, 1.0));

    let m = granted(queue.request_work(&a));

    // a2 goes to deferred during the scan, then is flushed back to pending.
    assert_eq!(queue.request_work(&b), Poll::NoneAvailable);
    assert_eq!(queue.stats().pending, 1);
    assert_eq!(queue.stats().deferred, 0);

    queue.confirm(&a, &m.id).unwrap();
    assert_eq!(granted(queue.request_work(&b)).id.as_str(), "a2");
}

#[test]
fn enqueue_after_drained_restarts_work() {
    let queue = Queue::new();
    let w = WorkerId::from("w");
    assert_eq!(queue.request_work(&w), Poll::Drained);

    queue.enqueue(msg("late", "k1", Operation::Set, 3.0));
    assert_eq!(granted(queue.request_work(&w)).id.as_str(), "late");
}

// ---------------------------------------------------------------------------
// Protocol violations
// ---------------------------------------------------------------------------

#[test]
fn confirm_unknown_id_is_a_violation_and_changes_nothing() {
    let queue = Queue::new();
    let a = WorkerId::from("a");
    queue.enqueue(msg("a1", "k1", Operation::Add, 1.0));
    queue.enqueue(msg("a2", "k1", Operation::Add, 1.0));
    granted(queue.request_work(&a));
    let before = queue.stats();

    let err = queue.confirm(&a, &MessageId::from("nope")).unwrap_err();
    assert!(err.is_protocol_violation());
    assert_eq!(queue.stats(), before);
}

#[test]
fn double_confirm_is_a_violation() {
    let queue = Queue::new();
    let a = WorkerId::from("a");
    queue.enqueue(msg("a1", "k1", Operation::Add, 1.0));
    let m = granted(queue.request_work(&a));

    queue.confirm(&a, &m.id).unwrap();
    let err = queue.confirm(&a, &m.id).unwrap_err();
    match err {
        Error::ProtocolViolation {
            worker_id,
            message_id,
            ..
        } => {
            assert_eq!(worker_id, a);
            assert_eq!(message_id, m.id);
        }
        other => panic!("expected ProtocolViolation, got {other:?}"),
    }
    assert_eq!(queue.stats(), QueueStats::default());
}

#[test]
fn confirm_by_other_worker_is_a_violation() {
    let queue = Queue::new();
    let a = WorkerId::from("a");
    let b = WorkerId::from("b");
    queue.enqueue(msg("a1", "k1", Operation::Add, 1.0));
    let m = granted(queue.request_work(&a));
    let before = queue.stats();

    assert!(queue.confirm(&b, &m.id).unwrap_err().is_protocol_violation());
    assert_eq!(queue.stats(), before);

    // The rightful holder can still confirm.
    queue.confirm(&a, &m.id).unwrap();
}

// ---------------------------------------------------------------------------
// Size / stats
// ---------------------------------------------------------------------------

#[test]
fn size_is_idempotent() {
    let queue = Queue::new();
    queue.enqueue(msg("a1", "k1", Operation::Add, 1.0));
    queue.enqueue(msg("a2", "k2", Operation::Add, 1.0));

    let first = queue.size();
    let stats = queue.stats();
    for _ in 0..10 {
        assert_eq!(queue.size(), first);
    }
    assert_eq!(first, 2);
    assert_eq!(queue.stats(), stats);
}

// ---------------------------------------------------------------------------
// Ordering
// ---------------------------------------------------------------------------

/// Sets up: m1(k1) granted to A, m2(k1) deferred while B takes m3(k2),
/// then m4(k1) arrives and A confirms. Returns the queue and the ids of the
/// next k1 grant.
fn overtaking_scenario(queue: &Queue) -> Vec<String> {
    let a = WorkerId::from("a");
    let b = WorkerId::from("b");
    let c = WorkerId::from("c");
    queue.enqueue(msg("m1", "k1", Operation::Set, 10.0));
    queue.enqueue(msg("m2", "k1", Operation::Add, 1.0));
    queue.enqueue(msg("m3", "k2", Operation::Add, 1.0));

    let m1 = granted(queue.request_work(&a));
    let m3 = granted(queue.request_work(&b));
    assert_eq!(m3.id.as_str(), "m3");
    assert_eq!(queue.stats().deferred, 1);

    queue.enqueue(msg("m4", "k1", Operation::Set, 0.0));
    queue.confirm(&a, &m1.id).unwrap();
    queue.confirm(&b, &m3.id).unwrap();

    let mut order = Vec::new();
    for _ in 0..10 {
        match queue.request_work(&c) {
            Poll::Grant(m) => {
                order.push(m.id.0.clone());
                queue.confirm(&c, &m.id).unwrap();
            }
            Poll::NoneAvailable => {}
            Poll::Drained => break,
        }
    }
    order
}

#[test]
fn strict_ordering_keeps_per_key_fifo_across_deferral() {
    let queue = Queue::new();
    assert_eq!(overtaking_scenario(&queue), vec!["m2", "m4"]);
}

#[test]
fn relaxed_ordering_lets_later_message_overtake_deferred_one() {
    // Harmless for ADD/SUB, wrong for SET: this is why relaxed mode is
    // restricted to commutative operations.
    let queue = relaxed();
    assert_eq!(overtaking_scenario(&queue), vec!["m4", "m2"]);
}

#[test]
fn commutativity_of_operations() {
    assert!(Operation::Add.is_commutative());
    assert!(Operation::Sub.is_commutative());
    assert!(!Operation::Set.is_commutative());
}

// ---------------------------------------------------------------------------
// Release
// ---------------------------------------------------------------------------

#[test]
fn release_returns_message_to_front() {
    let queue = Queue::new();
    let a = WorkerId::from("a");
    queue.enqueue(msg("m1", "k1", Operation::Add, 1.0));
    queue.enqueue(msg("m2", "k2", Operation::Add, 1.0));

    let m1 = granted(queue.request_work(&a));
    queue.release(&a, &m1.id).unwrap();
    assert_eq!(queue.stats().in_flight, 0);
    assert_eq!(queue.stats().busy_keys, 0);

    assert_eq!(granted(queue.request_work(&a)).id.as_str(), "m1");
}

#[test]
fn release_goes_ahead_of_deferred_messages_for_same_key() {
    let queue = Queue::new();
    let a = WorkerId::from("a");
    let b = WorkerId::from("b");
    queue.enqueue(msg("m1", "k1", Operation::Set, 1.0));
    queue.enqueue(msg("m2", "k1", Operation::Add, 1.0));
    queue.enqueue(msg("m3", "k2", Operation::Add, 1.0));

    let m1 = granted(queue.request_work(&a));
    // m2 deferred, m3 granted; deferred is not flushed yet.
    granted(queue.request_work(&b));
    queue.release(&a, &m1.id).unwrap();

    let mut next = None;
    for _ in 0..3 {
        if let Poll::Grant(m) = queue.request_work(&a) {
            next = Some(m);
            break;
        }
    }
    assert_eq!(next.expect("k1 should be granted").id.as_str(), "m1");
}

#[test]
fn release_of_unheld_message_is_a_violation() {
    let queue = Queue::new();
    let a = WorkerId::from("a");
    let before = queue.stats();
    assert!(
        queue
            .release(&a, &MessageId::from("ghost"))
            .unwrap_err()
            .is_protocol_violation()
    );
    assert_eq!(queue.stats(), before);
}

// ---------------------------------------------------------------------------
// Leases
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn expired_lease_is_reclaimed_and_stale_confirm_rejected() {
    let queue = Queue::with_config(QueueConfig {
        lease: Some(Duration::from_secs(5)),
        ..QueueConfig::default()
    });
    let crashed = WorkerId::from("crashed");
    let healthy = WorkerId::from("healthy");
    queue.enqueue(msg("m1", "k1", Operation::Add, 1.0));

    let m1 = granted(queue.request_work(&crashed));
    assert_eq!(queue.request_work(&healthy), Poll::NoneAvailable);

    tokio::time::advance(Duration::from_secs(4)).await;
    assert_eq!(queue.request_work(&healthy), Poll::NoneAvailable);

    tokio::time::advance(Duration::from_secs(2)).await;
    let regranted = granted(queue.request_work(&healthy));
    assert_eq!(regranted.id, m1.id);

    assert!(
        queue
            .confirm(&crashed, &m1.id)
            .unwrap_err()
            .is_protocol_violation()
    );
    queue.confirm(&healthy, &m1.id).unwrap();
    assert_eq!(queue.request_work(&healthy), Poll::Drained);
}

#[tokio::test(start_paused = true)]
async fn without_lease_grants_never_expire() {
    let queue = Queue::new();
    let a = WorkerId::from("a");
    let b = WorkerId::from("b");
    queue.enqueue(msg("m1", "k1", Operation::Add, 1.0));
    granted(queue.request_work(&a));

    tokio::time::advance(Duration::from_secs(3600)).await;
    assert_eq!(queue.request_work(&b), Poll::NoneAvailable);
    assert_eq!(queue.stats().busy_keys, 1);
}

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

#[test]
fn events_describe_the_lifecycle() {
    let queue = Queue::new();
    let mut events = queue.subscribe();
    let a = WorkerId::from("a");
    let b = WorkerId::from("b");
    queue.enqueue(msg("m1", "k1", Operation::Add, 1.0));
    queue.enqueue(msg("m2", "k1", Operation::Add, 1.0));

    let m1 = granted(queue.request_work(&a));
    assert_eq!(queue.request_work(&b), Poll::NoneAvailable);
    queue.confirm(&a, &m1.id).unwrap();

    let mut kinds = Vec::new();
    let mut last_seq = 0;
    while let Ok(event) = events.try_recv() {
        assert!(event.seq > last_seq, "sequence numbers must increase");
        last_seq = event.seq;
        kinds.push(event.kind);
    }

    assert_eq!(
        kinds,
        vec![
            EventKind::Enqueued {
                id: "m1".into(),
                key: "k1".to_string(),
            },
            EventKind::Enqueued {
                id: "m2".into(),
                key: "k1".to_string(),
            },
            EventKind::Granted {
                id: "m1".into(),
                key: "k1".to_string(),
                worker_id: a.clone(),
            },
            EventKind::Deferred {
                id: "m2".into(),
                key: "k1".to_string(),
            },
            EventKind::Flushed { count: 1 },
            EventKind::Confirmed {
                id: "m1".into(),
                key: "k1".to_string(),
                worker_id: a,
            },
        ]
    );
}

// ---------------------------------------------------------------------------
// Message
// ---------------------------------------------------------------------------

#[test]
fn generated_message_ids_are_unique_and_key_prefixed() {
    let a = Message::new("item0", Operation::Add, 1.0);
    let b = Message::new("item0", Operation::Add, 1.0);
    assert_ne!(a.id, b.id);
    assert!(a.id.as_str().starts_with("item0:"));
}

#[test]
fn message_json_shape() {
    let m: Message = serde_json::from_str(
        r#"{"id": "x", "key": "item1", "operation": "sub", "operand": 2.5}"#,
    )
    .unwrap();
    assert_eq!(m, msg("x", "item1", Operation::Sub, 2.5));
}
