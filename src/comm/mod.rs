//! Message passing between ranks.
//!
//! [`Communicator`] is the surface kernels program against: blocking
//! point-to-point `send`/`recv` plus the collectives, which every rank
//! must call in matching program order (no tags, no reordering — the k-th
//! collective on one rank pairs with the k-th on every other). The
//! collectives are implemented here over `send`/`recv`; per-pair FIFO
//! delivery is what makes program-order matching sound.
//!
//! Two implementations exist: [`cluster::ClusterComm`] (star-routed TCP)
//! and [`local::LocalComm`] (size 1, for unconfigured runs and unit
//! tests).

pub mod cluster;
pub mod local;

pub use cluster::{ClusterComm, JobTracker, WorkerSignals};
pub use local::LocalComm;

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{FlotillaError, Result};
use crate::protocol::{Payload, Rank};

/// Built-in reduction operators. Reduction order is fixed to ascending
/// rank so floating-point results are bit-identical across runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReduceOp {
    Sum,
    Prod,
    Min,
    Max,
    All,
    Any,
}

impl ReduceOp {
    pub fn apply(self, left: Payload, right: Payload) -> Result<Payload> {
        use Payload::{Bool, Float, Int};
        match (self, left, right) {
            (ReduceOp::Sum, Int(a), Int(b)) => Ok(Int(a + b)),
            (ReduceOp::Sum, Float(a), Float(b)) => Ok(Float(a + b)),
            (ReduceOp::Prod, Int(a), Int(b)) => Ok(Int(a * b)),
            (ReduceOp::Prod, Float(a), Float(b)) => Ok(Float(a * b)),
            (ReduceOp::Min, Int(a), Int(b)) => Ok(Int(a.min(b))),
            (ReduceOp::Min, Float(a), Float(b)) => Ok(Float(a.min(b))),
            (ReduceOp::Max, Int(a), Int(b)) => Ok(Int(a.max(b))),
            (ReduceOp::Max, Float(a), Float(b)) => Ok(Float(a.max(b))),
            (ReduceOp::All, Bool(a), Bool(b)) => Ok(Bool(a && b)),
            (ReduceOp::Any, Bool(a), Bool(b)) => Ok(Bool(a || b)),
            (op, left, right) => Err(FlotillaError::Internal(format!(
                "reduce op {op:?} is not defined for payloads {left:?} and {right:?}"
            ))),
        }
    }
}

#[allow(async_fn_in_trait)]
pub trait Communicator {
    fn rank(&self) -> Rank;

    fn size(&self) -> u32;

    /// Blocking point-to-point send. Returns once the envelope is accepted
    /// by the local link (not on peer receive); suspends while the
    /// outbound queue is full.
    async fn send(&self, to: Rank, payload: Payload) -> Result<()>;

    /// Blocking point-to-point receive: the next `Data` payload from
    /// `from`, in per-pair FIFO order.
    async fn recv(&self, from: Rank) -> Result<Payload>;

    /// Ask for job-wide cancellation. On workers this is carried to the
    /// master, which fans the request out to every rank.
    async fn request_cancel(&self) -> Result<()>;

    /// Deadline applied to each blocking receive inside a collective.
    /// `None` disables mismatch detection.
    fn collective_deadline(&self) -> Option<Duration> {
        None
    }

    async fn recv_collective(&self, from: Rank) -> Result<Payload> {
        match self.collective_deadline() {
            None => self.recv(from).await,
            Some(d) => match tokio::time::timeout(d, self.recv(from)).await {
                Ok(res) => res,
                Err(_) => Err(FlotillaError::CollectiveMismatch(format!(
                    "no contribution from rank {from} within {d:?}"
                ))),
            },
        }
    }

    /// All ranks call. On `root`, `value` must be `Some` and is sent to
    /// every other rank; elsewhere `value` is ignored and the root's value
    /// is returned.
    async fn bcast(&self, root: Rank, value: Option<Payload>) -> Result<Payload> {
        if self.rank() == root {
            let value = value.ok_or_else(|| {
                FlotillaError::Internal("bcast requires a value on the root rank".into())
            })?;
            for r in 0..self.size() {
                if r != root {
                    self.send(r, value.clone()).await?;
                }
            }
            Ok(value)
        } else {
            self.recv_collective(root).await
        }
    }

    /// On `root`, `chunks` must hold exactly `size` payloads; rank `i`
    /// receives `chunks[i]`. On non-root ranks `chunks` is ignored.
    async fn scatter(&self, root: Rank, chunks: Option<Vec<Payload>>) -> Result<Payload> {
        if self.rank() == root {
            let chunks = chunks.ok_or_else(|| {
                FlotillaError::Internal("scatter requires chunks on the root rank".into())
            })?;
            if chunks.len() != self.size() as usize {
                return Err(FlotillaError::InvalidShape(format!(
                    "scatter got {} chunks for a group of {}",
                    chunks.len(),
                    self.size()
                )));
            }
            let mut own = None;
            for (r, chunk) in chunks.into_iter().enumerate() {
                if r as Rank == root {
                    own = Some(chunk);
                } else {
                    self.send(r as Rank, chunk).await?;
                }
            }
            own.ok_or_else(|| FlotillaError::Internal("root chunk missing".into()))
        } else {
            self.recv_collective(root).await
        }
    }

    /// Every rank submits one value; the root returns them ordered by
    /// ascending rank, non-root ranks return `None`.
    async fn gather(&self, root: Rank, value: Payload) -> Result<Option<Vec<Payload>>> {
        if self.rank() == root {
            let mut own = Some(value);
            let mut gathered = Vec::with_capacity(self.size() as usize);
            for r in 0..self.size() {
                if r == root {
                    gathered.push(
                        own.take()
                            .ok_or_else(|| FlotillaError::Internal("root value missing".into()))?,
                    );
                } else {
                    gathered.push(self.recv_collective(r).await?);
                }
            }
            Ok(Some(gathered))
        } else {
            self.send(root, value).await?;
            Ok(None)
        }
    }

    /// Gather, then fold left-to-right by ascending rank.
    async fn reduce(&self, root: Rank, value: Payload, op: ReduceOp) -> Result<Option<Payload>> {
        match self.gather(root, value).await? {
            None => Ok(None),
            Some(gathered) => {
                let mut iter = gathered.into_iter();
                let first = iter
                    .next()
                    .ok_or_else(|| FlotillaError::Internal("empty reduction".into()))?;
                let mut acc = first;
                for item in iter {
                    acc = op.apply(acc, item)?;
                }
                Ok(Some(acc))
            }
        }
    }

    /// All ranks block until all have entered: gather-then-broadcast of a
    /// sentinel through rank 0.
    async fn barrier(&self) -> Result<()> {
        self.gather(0, Payload::Empty).await?;
        let sentinel = if self.rank() == 0 {
            Some(Payload::Empty)
        } else {
            None
        };
        self.bcast(0, sentinel).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reduce_ops_fold_scalars() {
        use Payload::{Bool, Float, Int};
        assert_eq!(
            ReduceOp::Sum.apply(Int(2), Int(3)).unwrap(),
            Int(5)
        );
        assert_eq!(
            ReduceOp::Prod.apply(Float(2.0), Float(4.0)).unwrap(),
            Float(8.0)
        );
        assert_eq!(ReduceOp::Min.apply(Int(2), Int(-3)).unwrap(), Int(-3));
        assert_eq!(
            ReduceOp::Max.apply(Float(1.5), Float(0.5)).unwrap(),
            Float(1.5)
        );
        assert_eq!(
            ReduceOp::All.apply(Bool(true), Bool(false)).unwrap(),
            Bool(false)
        );
        assert_eq!(
            ReduceOp::Any.apply(Bool(false), Bool(true)).unwrap(),
            Bool(true)
        );
    }

    #[test]
    fn reduce_rejects_mixed_types() {
        assert!(ReduceOp::Sum
            .apply(Payload::Int(1), Payload::Float(2.0))
            .is_err());
        assert!(ReduceOp::Any
            .apply(Payload::Int(1), Payload::Bool(true))
            .is_err());
    }
}
