//! The algorithm kernels shipped with the runtime.
//!
//! Kernels are SPMD: every rank in a job calls the same function with the
//! same program order of collectives; only rank 0's return value is
//! meaningful in distributed mode.

pub mod matmul;
pub mod matrix;
pub mod monte_carlo;
pub mod prime;

pub use matmul::mat_mul;
pub use matrix::Matrix;
pub use monte_carlo::{
    monte_carlo, monte_carlo_stats, register_estimator, register_reducer, Estimator,
    MonteCarloParams, MonteCarloResult, Reducer,
};
pub use prime::is_prime;

use crate::cancel::CancelFlag;
use crate::comm::Communicator;
use crate::error::Result;
use crate::protocol::KernelSpec;

/// Run the kernel a job descriptor names. Used by the worker bootstrap;
/// rank 0 calls the kernel functions directly with its local inputs.
pub async fn dispatch<C: Communicator>(
    comm: &C,
    cancel: &CancelFlag,
    spec: &KernelSpec,
) -> Result<()> {
    match spec {
        KernelSpec::Prime { n } => {
            prime::is_prime(comm, cancel, *n).await?;
        }
        KernelSpec::MatMul => {
            matmul::mat_mul(comm, cancel, None).await?;
        }
        KernelSpec::MonteCarlo {
            num_samples,
            estimator,
            reducer,
            seed,
            cancel_check_every,
        } => {
            let estimator = monte_carlo::resolve_estimator(estimator)?;
            let reducer = monte_carlo::resolve_reducer(reducer)?;
            let params = MonteCarloParams {
                num_samples: *num_samples,
                seed: *seed,
                cancel_check_every: *cancel_check_every,
            };
            monte_carlo::monte_carlo(comm, cancel, &params, estimator.as_ref(), reducer.as_ref())
                .await?;
        }
    }
    Ok(())
}
