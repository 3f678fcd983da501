//! Dense matrix multiplication by 2-D block decomposition.
//!
//! Rank 0 validates the inputs and picks a process grid `(Pr, Pc)` with
//! `Pr * Pc = size`. A is split row-wise into `Pr` strips and B
//! column-wise into `Pc` strips; rank `r = pr * Pc + pc` receives
//! `(A_strip[pr], B_strip[pc])` by scatter, computes its output block,
//! and the blocks are gathered back to rank 0 and assembled.

use crate::cancel::CancelFlag;
use crate::comm::Communicator;
use crate::error::{FlotillaError, Result};
use crate::kernels::matrix::Matrix;
use crate::protocol::{Payload, MASTER_RANK};

/// Contiguous half-open ranges partitioning `total` into `parts`,
/// remainder to the lowest parts.
pub fn partition_ranges(total: usize, parts: usize) -> Vec<(usize, usize)> {
    let base = total / parts;
    let remainder = total % parts;
    let mut ranges = Vec::with_capacity(parts);
    let mut start = 0;
    for i in 0..parts {
        let len = base + usize::from(i < remainder);
        ranges.push((start, start + len));
        start += len;
    }
    ranges
}

/// Pick the grid `(pr, pc)` with `pr * pc == size` minimizing the largest
/// block side `max(ceil(m / pr), ceil(n / pc))`; ties go to the squarer
/// grid.
pub fn choose_grid(size: u32, m: usize, n: usize) -> (u32, u32) {
    let mut best: Option<(usize, u32, (u32, u32))> = None;
    for pr in 1..=size {
        if size % pr != 0 {
            continue;
        }
        let pc = size / pr;
        let rows = m.div_ceil(pr as usize);
        let cols = n.div_ceil(pc as usize);
        let side = rows.max(cols);
        let skew = pr.abs_diff(pc);
        match best {
            Some((best_side, best_skew, _))
                if (side, skew) >= (best_side, best_skew) => {}
            _ => best = Some((side, skew, (pr, pc))),
        }
    }
    best.map(|(_, _, grid)| grid).unwrap_or((1, size))
}

/// SPMD matrix-multiply kernel. Only rank 0 supplies the inputs; other
/// ranks pass `None` and receive their strips from the scatter.
pub async fn mat_mul<C: Communicator>(
    comm: &C,
    cancel: &CancelFlag,
    inputs: Option<(&Matrix, &Matrix)>,
) -> Result<Option<Matrix>> {
    let rank = comm.rank();
    let size = comm.size();

    if size == 1 {
        let (a, b) = inputs.ok_or_else(|| {
            FlotillaError::InvalidShape("rank 0 requires both input matrices".into())
        })?;
        cancel.bail_if_set()?;
        return Ok(Some(a.multiply(b)?));
    }

    // Rank 0 validates and broadcasts the header (dims and grid); a
    // header of Empty aborts every rank with invalid_shape.
    let header = if rank == MASTER_RANK {
        let payload = match validate(inputs) {
            Ok((m, k, n)) => {
                let (pr, pc) = choose_grid(size, m, n);
                Payload::List(vec![
                    Payload::Int(m as i64),
                    Payload::Int(k as i64),
                    Payload::Int(n as i64),
                    Payload::Int(pr as i64),
                    Payload::Int(pc as i64),
                ])
            }
            Err(_) => Payload::Empty,
        };
        comm.bcast(MASTER_RANK, Some(payload)).await?
    } else {
        comm.bcast(MASTER_RANK, None).await?
    };

    let dims = match &header {
        Payload::Empty => {
            return if rank == MASTER_RANK {
                // Re-derive the validation error for the caller.
                validate(inputs).map(|_| None)
            } else {
                Err(FlotillaError::InvalidShape(
                    "aborted by rank 0: invalid input shapes".into(),
                ))
            };
        }
        payload => payload.as_list()?,
    };
    let [m, _k, n, pr, pc] = dims else {
        return Err(FlotillaError::ProtocolViolation(
            "malformed matmul header".into(),
        ));
    };
    let (m, n) = (m.as_int()? as usize, n.as_int()? as usize);
    let (pr, pc) = (pr.as_int()? as usize, pc.as_int()? as usize);

    let row_ranges = partition_ranges(m, pr);
    let col_ranges = partition_ranges(n, pc);

    // Scatter each rank its (A row strip, B column strip) pair.
    let chunks = if rank == MASTER_RANK {
        let (a, b) = inputs.ok_or_else(|| {
            FlotillaError::InvalidShape("rank 0 requires both input matrices".into())
        })?;
        let mut chunks = Vec::with_capacity(size as usize);
        for r in 0..size as usize {
            let (r0, r1) = row_ranges[r / pc];
            let (c0, c1) = col_ranges[r % pc];
            chunks.push(Payload::List(vec![
                a.row_strip(r0, r1).to_payload(),
                b.col_strip(c0, c1).to_payload(),
            ]));
        }
        Some(chunks)
    } else {
        None
    };
    let strip_pair = comm.scatter(MASTER_RANK, chunks).await?;
    let strips = strip_pair.as_list()?;
    let [a_strip, b_strip] = strips else {
        return Err(FlotillaError::ProtocolViolation(
            "malformed strip pair".into(),
        ));
    };
    let a_strip = Matrix::from_payload(a_strip)?;
    let b_strip = Matrix::from_payload(b_strip)?;

    cancel.bail_if_set()?;
    let block = a_strip.multiply(&b_strip)?;

    let gathered = comm.gather(MASTER_RANK, block.to_payload()).await?;
    let Some(blocks) = gathered else {
        return Ok(None);
    };

    let mut result = Matrix::zeros(m, n);
    for (r, block) in blocks.iter().enumerate() {
        let (r0, _) = row_ranges[r / pc];
        let (c0, _) = col_ranges[r % pc];
        result.paste(r0, c0, &Matrix::from_payload(block)?);
    }
    Ok(Some(result))
}

fn validate(inputs: Option<(&Matrix, &Matrix)>) -> Result<(usize, usize, usize)> {
    let (a, b) = inputs.ok_or_else(|| {
        FlotillaError::InvalidShape("rank 0 requires both input matrices".into())
    })?;
    if a.cols() != b.rows() {
        return Err(FlotillaError::InvalidShape(format!(
            "cannot multiply {}x{} by {}x{}",
            a.rows(),
            a.cols(),
            b.rows(),
            b.cols()
        )));
    }
    Ok((a.rows(), a.cols(), b.cols()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::LocalComm;

    #[test]
    fn grid_minimizes_largest_block() {
        // 4 ranks, square problem: 2x2 beats 1x4 and 4x1.
        assert_eq!(choose_grid(4, 100, 100), (2, 2));
        // Tall problem: more row splits win.
        assert_eq!(choose_grid(4, 400, 10), (4, 1));
        // Wide problem: more column splits win.
        assert_eq!(choose_grid(4, 10, 400), (1, 4));
        // Prime group size only factors trivially.
        let (pr, pc) = choose_grid(3, 90, 90);
        assert_eq!(pr * pc, 3);
        assert_eq!(choose_grid(1, 5, 5), (1, 1));
    }

    #[test]
    fn partition_ranges_cover_contiguously() {
        assert_eq!(partition_ranges(7, 3), vec![(0, 3), (3, 5), (5, 7)]);
        assert_eq!(partition_ranges(4, 4), vec![(0, 1), (1, 2), (2, 3), (3, 4)]);
        assert_eq!(partition_ranges(0, 2), vec![(0, 0), (0, 0)]);
        assert_eq!(partition_ranges(2, 3), vec![(0, 1), (1, 2), (2, 2)]);
    }

    #[tokio::test]
    async fn local_multiply_matches_reference() {
        let comm = LocalComm::default();
        let cancel = CancelFlag::new();
        let a = Matrix::from_rows(vec![vec![1.0, 2.0, 3.0], vec![4.0, 5.0, 6.0]]).unwrap();
        let b = Matrix::from_rows(vec![
            vec![7.0, 8.0],
            vec![9.0, 10.0],
            vec![11.0, 12.0],
        ])
        .unwrap();
        let c = mat_mul(&comm, &cancel, Some((&a, &b)))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(c, a.multiply(&b).unwrap());
    }

    #[tokio::test]
    async fn local_rejects_mismatched_shapes() {
        let comm = LocalComm::default();
        let cancel = CancelFlag::new();
        let a = Matrix::zeros(2, 3);
        let b = Matrix::zeros(2, 2);
        assert!(matches!(
            mat_mul(&comm, &cancel, Some((&a, &b))).await,
            Err(FlotillaError::InvalidShape(_))
        ));
    }

    #[tokio::test]
    async fn empty_matrix_yields_empty_result() {
        let comm = LocalComm::default();
        let cancel = CancelFlag::new();
        let a = Matrix::zeros(0, 5);
        let b = Matrix::zeros(5, 4);
        let c = mat_mul(&comm, &cancel, Some((&a, &b)))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(c.rows(), 0);
        assert_eq!(c.cols(), 4);
    }

    #[tokio::test]
    async fn cancelled_before_multiply_returns_cancelled() {
        let comm = LocalComm::default();
        let cancel = CancelFlag::new();
        cancel.set();
        let a = Matrix::zeros(2, 2);
        let b = Matrix::zeros(2, 2);
        assert!(matches!(
            mat_mul(&comm, &cancel, Some((&a, &b))).await,
            Err(FlotillaError::Cancelled)
        ));
    }
}
