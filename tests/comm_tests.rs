//! Communicator integration tests over real localhost TCP groups:
//! point-to-point ordering, star routing, collectives, and failure
//! detection.


use std::time::Duration;

use flotilla::comm::{Communicator, ReduceOp};
use flotilla::protocol::Payload;
use flotilla::FlotillaError;
use test_harness::{assert_eventually, wire_group, wire_group_with};

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn point_to_point_delivery_is_fifo() {
    let group = wire_group(1).await;
    let worker = group.workers[0].comm.clone();

    let sender = tokio::spawn(async move {
        for i in 0..100i64 {
            worker.send(0, Payload::Int(i)).await.unwrap();
        }
    });

    for expected in 0..100i64 {
        let payload = group.master.recv(1).await.unwrap();
        assert_eq!(payload, Payload::Int(expected));
    }
    sender.await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn worker_to_worker_traffic_routes_through_master() {
    let group = wire_group(2).await;
    let w1 = group.workers[0].comm.clone();
    let w2 = group.workers[1].comm.clone();

    let sender = tokio::spawn(async move {
        for i in 0..20i64 {
            w1.send(2, Payload::Int(i)).await.unwrap();
        }
    });

    for expected in 0..20i64 {
        let payload = w2.recv(1).await.unwrap();
        assert_eq!(payload, Payload::Int(expected));
    }
    sender.await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn gather_orders_contributions_by_rank() {
    let group = wire_group(2).await;

    let mut tasks = Vec::new();
    for worker in &group.workers {
        let comm = worker.comm.clone();
        let rank = worker.rank;
        tasks.push(tokio::spawn(async move {
            let out = comm.gather(0, Payload::Int(rank as i64 * 10)).await.unwrap();
            assert!(out.is_none());
        }));
    }

    let gathered = group
        .master
        .gather(0, Payload::Int(0))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(
        gathered,
        vec![Payload::Int(0), Payload::Int(10), Payload::Int(20)]
    );
    for task in tasks {
        task.await.unwrap();
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn bcast_returns_root_value_everywhere() {
    let group = wire_group(2).await;

    let mut tasks = Vec::new();
    for worker in &group.workers {
        let comm = worker.comm.clone();
        tasks.push(tokio::spawn(async move { comm.bcast(0, None).await }));
    }

    let value = Payload::List(vec![Payload::Int(7), Payload::Bool(true)]);
    let at_root = group.master.bcast(0, Some(value.clone())).await.unwrap();
    assert_eq!(at_root, value);

    for task in tasks {
        assert_eq!(task.await.unwrap().unwrap(), value);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn scatter_delivers_indexed_chunks() {
    let group = wire_group(2).await;

    let mut tasks = Vec::new();
    for worker in &group.workers {
        let comm = worker.comm.clone();
        let rank = worker.rank;
        tasks.push(tokio::spawn(async move {
            let chunk = comm.scatter(0, None).await.unwrap();
            assert_eq!(chunk, Payload::Int(rank as i64));
        }));
    }

    let chunks = vec![Payload::Int(0), Payload::Int(1), Payload::Int(2)];
    let own = group.master.scatter(0, Some(chunks)).await.unwrap();
    assert_eq!(own, Payload::Int(0));
    for task in tasks {
        task.await.unwrap();
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn reduce_folds_left_to_right_by_ascending_rank() {
    let group = wire_group(2).await;

    // Non-associative float inputs: only the ascending-rank fold
    // (1e16 + 1.0) + -1e16 gives exactly 0.0.
    let values = [1e16, 1.0, -1e16];
    let mut tasks = Vec::new();
    for worker in &group.workers {
        let comm = worker.comm.clone();
        let value = values[worker.rank as usize];
        tasks.push(tokio::spawn(async move {
            comm.reduce(0, Payload::Float(value), ReduceOp::Sum)
                .await
                .unwrap()
        }));
    }

    let reduced = group
        .master
        .reduce(0, Payload::Float(values[0]), ReduceOp::Sum)
        .await
        .unwrap()
        .unwrap();
    let expected = (values[0] + values[1]) + values[2];
    assert_eq!(reduced, Payload::Float(expected));
    assert_eq!(expected, 0.0);
    for task in tasks {
        assert!(task.await.unwrap().is_none());
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn barrier_and_following_collective_stay_matched() {
    let group = wire_group(2).await;

    let mut tasks = Vec::new();
    for worker in &group.workers {
        let comm = worker.comm.clone();
        let rank = worker.rank;
        tasks.push(tokio::spawn(async move {
            comm.barrier().await.unwrap();
            comm.gather(0, Payload::Int(rank as i64)).await.unwrap();
            comm.barrier().await.unwrap();
        }));
    }

    group.master.barrier().await.unwrap();
    let gathered = group
        .master
        .gather(0, Payload::Int(0))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(gathered.len(), 3);
    group.master.barrier().await.unwrap();
    for task in tasks {
        task.await.unwrap();
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn collective_timeout_reports_mismatch() {
    let group = wire_group_with(1, Some(Duration::from_millis(100)), test_harness::TEST_DRAIN).await;

    // The worker never joins the collective.
    let err = group.master.gather(0, Payload::Empty).await.unwrap_err();
    assert!(matches!(err, FlotillaError::CollectiveMismatch(_)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn cancellation_wakes_a_blocked_recv() {
    let group = wire_group(1).await;

    let master = group.master.clone();
    let blocked = tokio::spawn(async move { master.recv(1).await });

    tokio::time::sleep(Duration::from_millis(50)).await;
    group.master_cancel.set();

    let err = blocked.await.unwrap().unwrap_err();
    assert!(matches!(err, FlotillaError::Cancelled));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn cancellation_set_on_master_reaches_every_worker() {
    let group = wire_group(3).await;
    group.master_cancel.set();

    for worker in &group.workers {
        let flag = worker.cancel.clone();
        assert_eventually(
            || flag.is_set(),
            Duration::from_secs(2),
            "worker cancellation flag",
        )
        .await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn in_flight_data_still_lands_after_cancellation() {
    let group = wire_group(1).await;
    let worker = group.workers[0].comm.clone();

    worker.send(0, Payload::Int(42)).await.unwrap();
    // Give the frame time to cross before cancelling.
    tokio::time::sleep(Duration::from_millis(50)).await;
    group.master_cancel.set();

    // Data queued before cancellation is still delivered.
    assert_eq!(group.master.recv(1).await.unwrap(), Payload::Int(42));
    // A subsequent empty wait fails with Cancelled.
    assert!(matches!(
        group.master.recv(1).await,
        Err(FlotillaError::Cancelled)
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn dead_worker_is_detected_and_fatal() {
    let mut group = wire_group(2).await;

    // Worker 1 dies mid-job.
    let dead = group.workers.remove(0);
    drop(dead);

    let tracker = group.tracker.clone();
    assert_eventually(
        || tracker.first_lost() == Some(1),
        Duration::from_secs(2),
        "lost worker detection",
    )
    .await;
    assert!(group.master_cancel.is_set());

    let err = group.master.recv(1).await.unwrap_err();
    assert!(matches!(
        err,
        FlotillaError::PeerLost(1) | FlotillaError::Cancelled
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn self_and_out_of_range_destinations_are_rejected() {
    let group = wire_group(1).await;
    assert!(group.master.send(0, Payload::Empty).await.is_err());
    assert!(group.master.send(9, Payload::Empty).await.is_err());
    assert!(group.master.recv(0).await.is_err());
}
