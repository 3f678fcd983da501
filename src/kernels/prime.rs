//! Distributed primality test by divisor-range partitioning.
//!
//! The divisor space is the odd integers in `[3, isqrt(n)]`, split into
//! `size` contiguous sub-ranges of near-equal length with the remainder
//! going to the lowest ranks. A rank that finds a divisor requests
//! job-wide cancellation so its peers stop scanning early; the verdicts
//! are then combined with `reduce(any)` on rank 0.

use crate::cancel::CancelFlag;
use crate::comm::{Communicator, ReduceOp};
use crate::error::{FlotillaError, Result};
use crate::protocol::{Payload, Rank, MASTER_RANK};

const CANCEL_POLL_EVERY: u64 = 1024;

/// Split `total` items into `parts` contiguous counts, remainder to the
/// lowest parts.
pub fn partition_counts(total: u64, parts: u64) -> Vec<u64> {
    let base = total / parts;
    let remainder = total % parts;
    (0..parts)
        .map(|i| base + u64::from(i < remainder))
        .collect()
}

/// SPMD primality kernel. Every rank calls it with the same `n`; only
/// rank 0's return value is meaningful in distributed mode (other ranks
/// yield `None`).
pub async fn is_prime<C: Communicator>(
    comm: &C,
    cancel: &CancelFlag,
    n: u64,
) -> Result<Option<bool>> {
    let rank = comm.rank();

    // Trivial cases are decided on rank 0 and broadcast as a
    // short-circuit marker; Empty means the divisor scan is needed.
    let trivial = trivial_answer(n);
    let marker = if rank == MASTER_RANK {
        let payload = match trivial {
            Some(answer) => Payload::Bool(answer),
            None => Payload::Empty,
        };
        comm.bcast(MASTER_RANK, Some(payload)).await?
    } else {
        comm.bcast(MASTER_RANK, None).await?
    };
    if let Payload::Bool(answer) = marker {
        return Ok(at_root(rank, answer));
    }

    let limit = n.isqrt();
    let total_odds = (limit - 1) / 2;
    let counts = partition_counts(total_odds, u64::from(comm.size()));
    let offset: u64 = counts[..rank as usize].iter().sum();

    let mut divisor = 3 + 2 * offset;
    let mut found = false;
    for i in 0..counts[rank as usize] {
        if i % CANCEL_POLL_EVERY == 0 && cancel.is_set() {
            break;
        }
        if n % divisor == 0 {
            found = true;
            // Short-circuit: let the other ranks stop scanning.
            comm.request_cancel().await?;
            break;
        }
        divisor += 2;
    }

    match comm.reduce(MASTER_RANK, Payload::Bool(found), ReduceOp::Any).await {
        Ok(Some(any_found)) => {
            let any_found = any_found.as_bool()?;
            if any_found {
                Ok(at_root(rank, false))
            } else if cancel.is_set() {
                // Nobody reported a divisor but scans were interrupted:
                // the verdict is indeterminate.
                Err(FlotillaError::Cancelled)
            } else {
                Ok(at_root(rank, true))
            }
        }
        Ok(None) => {
            if cancel.is_set() && !found {
                Err(FlotillaError::Cancelled)
            } else {
                Ok(None)
            }
        }
        // A divisor in hand is definitive even if the reduce was cut off.
        Err(FlotillaError::Cancelled) if found => Ok(at_root(rank, false)),
        Err(e) => Err(e),
    }
}

fn trivial_answer(n: u64) -> Option<bool> {
    if n < 2 {
        Some(false)
    } else if n <= 3 {
        Some(true)
    } else if n % 2 == 0 {
        Some(false)
    } else if n.isqrt() < 3 {
        Some(true)
    } else {
        None
    }
}

fn at_root(rank: Rank, answer: bool) -> Option<bool> {
    if rank == MASTER_RANK {
        Some(answer)
    } else {
        None
    }
}
