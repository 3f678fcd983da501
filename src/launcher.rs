//! Remote launch and the master-side job lifecycle.
//!
//! The launcher opens an ephemeral listener, fans out one ssh invocation
//! per worker host, accepts the workers dialing home, validates their
//! `Hello` against the job id and a one-shot nonce, and hands each its
//! job descriptor. Launch is all-or-nothing: any worker missing the
//! bootstrap deadline aborts the whole group.

use std::collections::HashMap;
use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::process::{Child, Command};
use tokio::time::{timeout, Instant};
use uuid::Uuid;

use crate::cancel::CancelFlag;
use crate::comm::{ClusterComm, Communicator, JobTracker};
use crate::config::ClusterConfig;
use crate::error::{FlotillaError, Result};
use crate::protocol::frame::read_frame;
use crate::protocol::{JobDescriptor, KernelSpec, Message, Rank};

/// The remote shell line that bootstraps one worker.
pub fn worker_command(
    cfg: &ClusterConfig,
    rank: Rank,
    master_port: u16,
    job_id: Uuid,
    nonce: Uuid,
) -> String {
    format!(
        "cd '{}' && exec '{}' --master-host {} --master-port {} --rank {} --size {} --job-id {} --nonce {}",
        cfg.working_dir,
        cfg.python_executable,
        cfg.master_node,
        master_port,
        rank,
        cfg.group_size(),
        job_id,
        nonce,
    )
}

/// Spawn the remote shells for every worker host in parallel. Worker
/// stderr is forwarded into the log for diagnostic attribution.
pub async fn spawn_remote_workers(
    cfg: &ClusterConfig,
    master_port: u16,
    job_id: Uuid,
    nonce: Uuid,
) -> Result<Vec<Child>> {
    let mut children = Vec::with_capacity(cfg.hosts.len());
    for (i, host) in cfg.hosts.iter().enumerate() {
        let rank = (i + 1) as Rank;
        let remote = worker_command(cfg, rank, master_port, job_id, nonce);
        let mut child = Command::new("ssh")
            .arg(format!("{}@{}", cfg.ssh_user, host))
            .arg(remote)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        if let Some(stderr) = child.stderr.take() {
            let host = host.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    tracing::debug!(rank, %host, line, "worker stderr");
                }
            });
        }

        if cfg.progress_to_terminal {
            tracing::info!(rank, %host, "launched worker");
        }
        children.push(child);
    }
    Ok(children)
}

/// Accept `expected` worker connections, each opening with a valid
/// `Hello`, within the bootstrap deadline.
pub async fn accept_workers(
    listener: &TcpListener,
    size: u32,
    job_id: Uuid,
    nonce: Uuid,
    deadline: Duration,
) -> Result<Vec<(Rank, TcpStream)>> {
    let expected = size - 1;
    let deadline = Instant::now() + deadline;
    let mut accepted: HashMap<Rank, TcpStream> = HashMap::new();

    while (accepted.len() as u32) < expected {
        let remaining = deadline
            .checked_duration_since(Instant::now())
            .ok_or_else(|| bootstrap_timeout(&accepted, expected))?;
        let (mut stream, addr) = timeout(remaining, listener.accept())
            .await
            .map_err(|_| bootstrap_timeout(&accepted, expected))??;

        let remaining = deadline
            .checked_duration_since(Instant::now())
            .unwrap_or(Duration::from_millis(1));
        let envelope = timeout(remaining, read_frame(&mut stream))
            .await
            .map_err(|_| bootstrap_timeout(&accepted, expected))??;

        match envelope.message {
            Message::Hello {
                job_id: their_job,
                nonce: their_nonce,
                claimed_rank,
            } => {
                if their_job != job_id || their_nonce != nonce {
                    return Err(FlotillaError::HandshakeFailure(format!(
                        "credentials mismatch from {addr}"
                    )));
                }
                if claimed_rank == 0 || claimed_rank >= size {
                    return Err(FlotillaError::HandshakeFailure(format!(
                        "claimed rank {claimed_rank} outside group of {size}"
                    )));
                }
                if accepted.contains_key(&claimed_rank) {
                    return Err(FlotillaError::HandshakeFailure(format!(
                        "duplicate rank {claimed_rank}"
                    )));
                }
                tracing::debug!(rank = claimed_rank, %addr, "worker connected");
                accepted.insert(claimed_rank, stream);
            }
            other => {
                return Err(FlotillaError::HandshakeFailure(format!(
                    "first frame from {addr} was {}, not HELLO",
                    other.kind()
                )));
            }
        }
    }

    let mut streams: Vec<(Rank, TcpStream)> = accepted.into_iter().collect();
    streams.sort_by_key(|(rank, _)| *rank);
    Ok(streams)
}

fn bootstrap_timeout(accepted: &HashMap<Rank, TcpStream>, expected: u32) -> FlotillaError {
    FlotillaError::BootstrapTimeout(format!(
        "{} of {expected} workers connected",
        accepted.len()
    ))
}

/// A launched job: the master communicator, the worker lifecycle tracker,
/// and the remote shells to reap on exit.
pub struct Launch {
    pub job_id: Uuid,
    pub comm: ClusterComm,
    pub tracker: std::sync::Arc<JobTracker>,
    pub cancel: CancelFlag,
    pub children: Vec<Child>,
    pub drain: Duration,
}

impl Launch {
    /// Bootstrap a full group: listen, fan out, accept, handshake. On any
    /// failure every started worker is torn down; no partial groups.
    pub async fn start(
        cfg: &ClusterConfig,
        kernel: KernelSpec,
        job_id: Uuid,
        cancel: CancelFlag,
    ) -> Result<Launch> {
        let listener = TcpListener::bind(("0.0.0.0", 0)).await?;
        let master_port = listener.local_addr()?.port();
        let nonce = Uuid::new_v4();
        let size = cfg.group_size() as u32;

        tracing::info!(%job_id, master_port, size, kernel = kernel.name(), "launching job");

        let mut children = spawn_remote_workers(cfg, master_port, job_id, nonce).await?;

        let streams =
            match accept_workers(&listener, size, job_id, nonce, cfg.timeouts.bootstrap).await {
                Ok(streams) => streams,
                Err(e) => {
                    reap(&mut children).await;
                    return Err(e);
                }
            };

        let (comm, tracker) = ClusterComm::master(
            streams,
            size,
            cancel.clone(),
            cfg.timeouts.collective,
            cfg.timeouts.drain,
        );

        let launch = Launch {
            job_id,
            comm,
            tracker,
            cancel,
            children,
            drain: cfg.timeouts.drain,
        };
        match launch.handshake(&kernel, size, cfg.timeouts.bootstrap).await {
            Ok(()) => Ok(launch),
            Err(e) => {
                launch.abort().await;
                Err(e)
            }
        }
    }

    /// Send every worker its descriptor and `Go`, then wait for all
    /// `Ready`s.
    pub async fn handshake(&self, kernel: &KernelSpec, size: u32, deadline: Duration) -> Result<()> {
        for rank in 1..size {
            let descriptor = JobDescriptor {
                job_id: self.job_id,
                kernel: kernel.clone(),
                size,
                rank,
            };
            self.comm
                .send_control(rank, Message::JobDescriptor(descriptor))
                .await?;
            self.comm.send_control(rank, Message::Go).await?;
        }
        if !self
            .tracker
            .wait_until(|s| s.ready.len() as u32 == size - 1, deadline)
            .await
        {
            return Err(FlotillaError::BootstrapTimeout(
                "not all workers reported READY".into(),
            ));
        }
        tracing::debug!(job_id = %self.job_id, "all workers ready");
        Ok(())
    }

    /// Orderly teardown after the rank-0 kernel returns (or fails), then
    /// fold the workers' fate into the final job outcome.
    pub async fn finish<T>(mut self, kernel_result: Result<Option<T>>) -> Result<Option<T>> {
        let size = self.comm.size();
        for rank in 1..size {
            let _ = self.comm.send_control(rank, Message::Shutdown).await;
        }
        let all_in = self
            .tracker
            .wait_until(|s| (1..size).all(|r| s.accounted(r)), self.drain)
            .await;
        if !all_in {
            tracing::warn!(job_id = %self.job_id, "drain timeout expired; forcing close");
        }

        self.tracker.set_shutting_down();
        self.comm.close(Duration::from_secs(2)).await;
        reap(&mut self.children).await;

        if let Some(fault) = self.tracker.take_fault() {
            return Err(fault);
        }
        let worker_cause = self
            .tracker
            .first_lost()
            .map(FlotillaError::PeerLost)
            .or_else(|| {
                self.tracker
                    .first_failure()
                    .map(|(rank, reason)| FlotillaError::KernelError { rank, reason })
            });
        match (kernel_result, worker_cause) {
            // A cancelled rank-0 kernel is a symptom; report the cause
            // when a worker supplied one.
            (Err(FlotillaError::Cancelled), Some(cause)) => Err(cause),
            (Ok(_), Some(cause)) => Err(cause),
            (other, _) => other,
        }
    }

    /// Tear down a partially started group.
    pub async fn abort(mut self) {
        let size = self.comm.size();
        for rank in 1..size {
            let _ = self.comm.send_control(rank, Message::Shutdown).await;
        }
        self.tracker.set_shutting_down();
        self.comm.close(Duration::from_secs(2)).await;
        reap(&mut self.children).await;
    }
}

async fn reap(children: &mut Vec<Child>) {
    for child in children.iter_mut() {
        match timeout(Duration::from_secs(2), child.wait()).await {
            Ok(Ok(status)) => {
                tracing::debug!(code = status.code(), "remote shell exited");
            }
            _ => {
                let _ = child.kill().await;
            }
        }
    }
    children.clear();
}
