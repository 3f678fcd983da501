//! In-process fallback communicator with a single rank.
//!
//! Used when no cluster is configured, so kernel code runs unmodified in
//! unit tests and single-machine runs. Collectives degenerate to
//! identity; point-to-point operations have no peer to talk to.

use crate::cancel::CancelFlag;
use crate::comm::{Communicator, ReduceOp};
use crate::error::{FlotillaError, Result};
use crate::protocol::{Payload, Rank, MASTER_RANK};

#[derive(Debug, Clone, Default)]
pub struct LocalComm {
    cancel: CancelFlag,
}

impl LocalComm {
    pub fn new(cancel: CancelFlag) -> Self {
        Self { cancel }
    }
}

impl Communicator for LocalComm {
    fn rank(&self) -> Rank {
        MASTER_RANK
    }

    fn size(&self) -> u32 {
        1
    }

    async fn send(&self, _to: Rank, _payload: Payload) -> Result<()> {
        Err(FlotillaError::NoPeer)
    }

    async fn recv(&self, _from: Rank) -> Result<Payload> {
        Err(FlotillaError::NoPeer)
    }

    async fn request_cancel(&self) -> Result<()> {
        self.cancel.set();
        Ok(())
    }

    async fn bcast(&self, root: Rank, value: Option<Payload>) -> Result<Payload> {
        check_root(root)?;
        value.ok_or_else(|| FlotillaError::Internal("bcast requires a value on the root".into()))
    }

    async fn scatter(&self, root: Rank, chunks: Option<Vec<Payload>>) -> Result<Payload> {
        check_root(root)?;
        let chunks = chunks
            .ok_or_else(|| FlotillaError::Internal("scatter requires chunks on the root".into()))?;
        if chunks.len() != 1 {
            return Err(FlotillaError::InvalidShape(format!(
                "scatter got {} chunks for a group of 1",
                chunks.len()
            )));
        }
        chunks
            .into_iter()
            .next()
            .ok_or_else(|| FlotillaError::Internal("missing chunk".into()))
    }

    async fn gather(&self, root: Rank, value: Payload) -> Result<Option<Vec<Payload>>> {
        check_root(root)?;
        Ok(Some(vec![value]))
    }

    async fn reduce(&self, root: Rank, value: Payload, _op: ReduceOp) -> Result<Option<Payload>> {
        check_root(root)?;
        Ok(Some(value))
    }

    async fn barrier(&self) -> Result<()> {
        Ok(())
    }
}

fn check_root(root: Rank) -> Result<()> {
    if root != MASTER_RANK {
        return Err(FlotillaError::Internal(format!(
            "root rank {root} outside group of 1"
        )));
    }
    Ok(())
}
