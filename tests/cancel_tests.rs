//! Cancellation and job-lifecycle behavior: cooperative interruption,
//! drain, lock release, and dead-peer abort.


use std::time::Duration;

use flotilla::kernels;
use flotilla::kernels::monte_carlo::MonteCarloParams;
use flotilla::launcher::Launch;
use flotilla::protocol::KernelSpec;
use flotilla::runtime::JobState;
use flotilla::{FlotillaError, Runtime};
use test_harness::{assert_eventually, start_cluster, wire_group};

/// A Mersenne prime large enough that its divisor scan runs for a long
/// time, leaving a wide window to cancel into.
const LONG_SCAN_PRIME: u64 = (1u64 << 61) - 1;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn cancelling_a_distributed_prime_drains_the_whole_group() {
    let cluster = start_cluster(2, KernelSpec::Prime { n: LONG_SCAN_PRIME }).await;
    let comm = cluster.launch.comm.clone();
    let cancel = cluster.launch.cancel.clone();

    let kernel = tokio::spawn(async move {
        kernels::is_prime(&comm, &cancel, LONG_SCAN_PRIME).await
    });

    tokio::time::sleep(Duration::from_millis(100)).await;
    cluster.launch.cancel.set();

    let kernel_result = kernel.await.unwrap();
    assert!(matches!(kernel_result, Err(FlotillaError::Cancelled)));

    let (outcome, workers) = cluster.finish(kernel_result).await;
    assert!(matches!(outcome, Err(FlotillaError::Cancelled)));
    for worker in workers {
        let err = worker.unwrap_err();
        assert!(matches!(err, FlotillaError::Cancelled));
        assert_eq!(err.exit_code(), 2);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn user_cancellation_collapses_to_none_and_releases_the_lock() {
    let rt = Runtime::local();

    let worker = {
        let rt = rt.clone();
        tokio::spawn(async move { rt.is_prime(LONG_SCAN_PRIME).await })
    };

    // The job registers shortly after the task starts.
    assert_eventually(
        || rt.cancel().is_ok(),
        Duration::from_secs(2),
        "job accepts cancellation",
    )
    .await;

    let outcome = worker.await.unwrap().unwrap();
    assert_eq!(outcome, None);

    // The lock is released and the next job runs normally.
    assert_eq!(rt.job_state(), JobState::Idle);
    assert_eq!(rt.is_prime(999_983).await.unwrap(), Some(true));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn a_second_job_is_rejected_while_one_runs() {
    let rt = Runtime::local();

    let long_job = {
        let rt = rt.clone();
        tokio::spawn(async move { rt.is_prime(LONG_SCAN_PRIME).await })
    };

    assert_eventually(
        || matches!(rt.job_state(), JobState::Running { .. }),
        Duration::from_secs(2),
        "first job starts",
    )
    .await;
    assert!(matches!(
        rt.is_prime(17).await,
        Err(FlotillaError::Busy)
    ));

    rt.cancel().unwrap();
    assert_eq!(long_job.await.unwrap().unwrap(), None);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn cancelled_monte_carlo_yields_no_result() {
    let rt = Runtime::local();
    let params = MonteCarloParams::new(u64::MAX / 2).with_seed(9);

    let job = {
        let rt = rt.clone();
        tokio::spawn(async move { rt.monte_carlo(&params, "uniform").await })
    };

    assert_eventually(
        || rt.cancel().is_ok(),
        Duration::from_secs(2),
        "job accepts cancellation",
    )
    .await;
    assert_eq!(job.await.unwrap().unwrap(), None);
    assert_eq!(rt.job_state(), JobState::Idle);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn a_lost_peer_surfaces_as_peer_lost_after_drain() {
    let mut group = wire_group(2).await;

    let dead = group.workers.remove(0);
    drop(dead);

    let tracker = group.tracker.clone();
    assert_eventually(
        || tracker.first_lost() == Some(1),
        Duration::from_secs(2),
        "lost worker detection",
    )
    .await;

    let launch = Launch {
        job_id: uuid::Uuid::new_v4(),
        comm: group.master.clone(),
        tracker: group.tracker.clone(),
        cancel: group.master_cancel.clone(),
        children: Vec::new(),
        drain: Duration::from_millis(300),
    };
    let outcome: flotilla::Result<Option<()>> =
        launch.finish(Err(FlotillaError::Cancelled)).await;
    assert!(matches!(outcome, Err(FlotillaError::PeerLost(1))));
}
