//! Process-wide runtime state and the kernel entry points.
//!
//! A [`Runtime`] is a cheap-clone handle created once per process, either
//! [`local`](Runtime::local) (no cluster; kernels run in-process on the
//! single-rank fallback) or [`configure`](Runtime::configure)d with a
//! validated cluster description. Entry points acquire the job lock, run
//! the kernel distributed or locally, and return the rank-0 value.
//! User-initiated cancellation collapses to `Ok(None)` at this surface.

pub mod job;

pub use job::{JobLock, JobState};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use uuid::Uuid;

use crate::cancel::CancelFlag;
use crate::comm::LocalComm;
use crate::config::ClusterConfig;
use crate::error::{FlotillaError, Result};
use crate::kernels::monte_carlo::{
    monte_carlo, monte_carlo_stats, resolve_estimator, resolve_reducer, MonteCarloParams,
    MonteCarloResult,
};
use crate::kernels::{self, Matrix};
use crate::launcher::Launch;
use crate::protocol::{KernelSpec, Payload};
use crate::runtime::job::JobGuard;

#[derive(Clone)]
pub struct Runtime {
    inner: Arc<RuntimeInner>,
}

struct RuntimeInner {
    config: Option<ClusterConfig>,
    lock: JobLock,
    active: Mutex<Option<ActiveJob>>,
}

struct ActiveJob {
    job_id: Uuid,
    cancel: CancelFlag,
    user_cancelled: Arc<AtomicBool>,
}

/// Book-keeping for one entry-point invocation. The job lock guard rides
/// here so release happens on every exit path.
struct JobHandle {
    _guard: JobGuard,
    job_id: Uuid,
    cancel: CancelFlag,
    user_cancelled: Arc<AtomicBool>,
    started: Instant,
}

impl Runtime {
    /// A runtime with no cluster: kernels run on the in-process
    /// single-rank fallback.
    pub fn local() -> Self {
        Self {
            inner: Arc::new(RuntimeInner {
                config: None,
                lock: JobLock::new(),
                active: Mutex::new(None),
            }),
        }
    }

    /// A runtime backed by a validated cluster configuration.
    pub fn configure(config: ClusterConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            inner: Arc::new(RuntimeInner {
                config: Some(config),
                lock: JobLock::new(),
                active: Mutex::new(None),
            }),
        })
    }

    pub fn config(&self) -> Option<&ClusterConfig> {
        self.inner.config.as_ref()
    }

    pub fn job_state(&self) -> JobState {
        self.inner.lock.state()
    }

    /// Request cancellation of the active job. The flag fans out to every
    /// rank and the entry point returns `Ok(None)`.
    pub fn cancel(&self) -> Result<()> {
        let active = self.inner.active.lock().unwrap_or_else(|e| e.into_inner());
        match active.as_ref() {
            Some(job) => {
                tracing::info!(job_id = %job.job_id, "cancellation requested");
                job.user_cancelled.store(true, Ordering::SeqCst);
                job.cancel.set();
                Ok(())
            }
            None => Err(FlotillaError::Internal("no active job to cancel".into())),
        }
    }

    pub fn cancel_requested(&self) -> bool {
        let active = self.inner.active.lock().unwrap_or_else(|e| e.into_inner());
        active.as_ref().map(|job| job.cancel.is_set()).unwrap_or(false)
    }

    /// Distributed primality test. Returns `Ok(None)` when the job was
    /// cancelled by the user.
    pub async fn is_prime(&self, n: u64) -> Result<Option<bool>> {
        let job = self.begin_job()?;
        let result = match &self.inner.config {
            None => {
                let comm = LocalComm::new(job.cancel.clone());
                kernels::prime::is_prime(&comm, &job.cancel, n).await
            }
            Some(cfg) => {
                match Launch::start(cfg, KernelSpec::Prime { n }, job.job_id, job.cancel.clone())
                    .await
                {
                    Err(e) => Err(e),
                    Ok(launch) => {
                        let outcome = kernels::prime::is_prime(&launch.comm, &job.cancel, n).await;
                        launch.finish(outcome).await
                    }
                }
            }
        };
        self.finish_job(job, result)
    }

    /// Distributed dense matrix product `a * b`. Both inputs live on the
    /// caller (rank 0); workers receive their strips by scatter.
    pub async fn mat_mul(&self, a: &Matrix, b: &Matrix) -> Result<Option<Matrix>> {
        let job = self.begin_job()?;
        let result = match &self.inner.config {
            None => {
                let comm = LocalComm::new(job.cancel.clone());
                kernels::matmul::mat_mul(&comm, &job.cancel, Some((a, b))).await
            }
            Some(cfg) => {
                match Launch::start(cfg, KernelSpec::MatMul, job.job_id, job.cancel.clone()).await {
                    Err(e) => Err(e),
                    Ok(launch) => {
                        let outcome =
                            kernels::matmul::mat_mul(&launch.comm, &job.cancel, Some((a, b))).await;
                        launch.finish(outcome).await
                    }
                }
            }
        };
        self.finish_job(job, result)
    }

    /// Monte Carlo with the default statistics reducer. `estimator` names
    /// a registered estimator, present on every node.
    pub async fn monte_carlo(
        &self,
        params: &MonteCarloParams,
        estimator: &str,
    ) -> Result<Option<MonteCarloResult>> {
        let est = resolve_estimator(estimator)?;
        let job = self.begin_job()?;
        let result = match &self.inner.config {
            None => {
                let comm = LocalComm::new(job.cancel.clone());
                monte_carlo_stats(&comm, &job.cancel, params, est.as_ref()).await
            }
            Some(cfg) => {
                let spec = monte_carlo_spec(params, estimator, "default_stats");
                match Launch::start(cfg, spec, job.job_id, job.cancel.clone()).await {
                    Err(e) => Err(e),
                    Ok(launch) => {
                        let outcome =
                            monte_carlo_stats(&launch.comm, &job.cancel, params, est.as_ref())
                                .await;
                        launch.finish(outcome).await
                    }
                }
            }
        };
        self.finish_job(job, result)
    }

    /// Monte Carlo with a named reducer; returns the finalized payload.
    pub async fn monte_carlo_with(
        &self,
        params: &MonteCarloParams,
        estimator: &str,
        reducer: &str,
    ) -> Result<Option<Payload>> {
        let est = resolve_estimator(estimator)?;
        let red = resolve_reducer(reducer)?;
        let job = self.begin_job()?;
        let result = match &self.inner.config {
            None => {
                let comm = LocalComm::new(job.cancel.clone());
                monte_carlo(&comm, &job.cancel, params, est.as_ref(), red.as_ref()).await
            }
            Some(cfg) => {
                let spec = monte_carlo_spec(params, estimator, reducer);
                match Launch::start(cfg, spec, job.job_id, job.cancel.clone()).await {
                    Err(e) => Err(e),
                    Ok(launch) => {
                        let outcome =
                            monte_carlo(&launch.comm, &job.cancel, params, est.as_ref(), red.as_ref())
                                .await;
                        launch.finish(outcome).await
                    }
                }
            }
        };
        self.finish_job(job, result)
    }

    fn begin_job(&self) -> Result<JobHandle> {
        let job_id = Uuid::new_v4();
        let guard = self.inner.lock.acquire(job_id)?;
        let cancel = CancelFlag::new();
        let user_cancelled = Arc::new(AtomicBool::new(false));
        {
            let mut active = self.inner.active.lock().unwrap_or_else(|e| e.into_inner());
            *active = Some(ActiveJob {
                job_id,
                cancel: cancel.clone(),
                user_cancelled: user_cancelled.clone(),
            });
        }
        Ok(JobHandle {
            _guard: guard,
            job_id,
            cancel,
            user_cancelled,
            started: Instant::now(),
        })
    }

    fn finish_job<T>(&self, job: JobHandle, result: Result<Option<T>>) -> Result<Option<T>> {
        {
            let mut active = self.inner.active.lock().unwrap_or_else(|e| e.into_inner());
            *active = None;
        }

        let result = match result {
            // User-initiated cancellation is not an error to the caller.
            Err(FlotillaError::Cancelled) if job.user_cancelled.load(Ordering::SeqCst) => Ok(None),
            other => other,
        };

        let timed = self
            .inner
            .config
            .as_ref()
            .map(|cfg| cfg.time_job)
            .unwrap_or(false);
        if timed {
            tracing::info!(
                job_id = %job.job_id,
                elapsed_ms = job.started.elapsed().as_millis() as u64,
                "job finished"
            );
        }
        result
    }
}

fn monte_carlo_spec(params: &MonteCarloParams, estimator: &str, reducer: &str) -> KernelSpec {
    KernelSpec::MonteCarlo {
        num_samples: params.num_samples,
        estimator: estimator.to_string(),
        reducer: reducer.to_string(),
        seed: params.seed,
        cancel_check_every: params.cancel_check_every,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn local_runtime_runs_kernels() {
        let rt = Runtime::local();
        assert_eq!(rt.is_prime(999_983).await.unwrap(), Some(true));
        assert_eq!(rt.is_prime(1_000_000).await.unwrap(), Some(false));

        let a = Matrix::from_rows(vec![vec![1.0, 2.0], vec![3.0, 4.0]]).unwrap();
        let b = Matrix::from_rows(vec![vec![5.0], vec![6.0]]).unwrap();
        let c = rt.mat_mul(&a, &b).await.unwrap().unwrap();
        assert_eq!(c, a.multiply(&b).unwrap());

        let params = MonteCarloParams::new(10_000).with_seed(1234);
        let stats = rt.monte_carlo(&params, "uniform").await.unwrap().unwrap();
        assert!((stats.mean - 0.5).abs() < 0.02);
    }

    #[tokio::test]
    async fn lock_released_between_jobs() {
        let rt = Runtime::local();
        assert_eq!(rt.job_state(), JobState::Idle);
        rt.is_prime(17).await.unwrap();
        assert_eq!(rt.job_state(), JobState::Idle);
        rt.is_prime(18).await.unwrap();
        assert_eq!(rt.job_state(), JobState::Idle);
    }

    #[tokio::test]
    async fn cancel_without_active_job_is_an_error() {
        let rt = Runtime::local();
        assert!(rt.cancel().is_err());
        assert!(!rt.cancel_requested());
    }

    #[tokio::test]
    async fn configure_rejects_invalid_config() {
        let cfg = ClusterConfig {
            master_node: String::new(),
            per_node_cores: 1,
            per_node_threads: None,
            num_worker_nodes: 1,
            hosts: vec!["w1".into()],
            ssh_user: "u".into(),
            python_executable: "flotilla".into(),
            working_dir: "/tmp".into(),
            time_job: false,
            progress_to_terminal: false,
            timeouts: Default::default(),
        };
        assert!(matches!(
            Runtime::configure(cfg),
            Err(FlotillaError::InvalidConfig(_))
        ));
    }
}
