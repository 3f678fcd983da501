//! Generic Monte Carlo estimation across ranks.
//!
//! Each rank draws its share of the sample budget from a deterministic
//! per-rank RNG stream, folds the values into an accumulator through a
//! [`Reducer`], and the accumulators are gathered to rank 0, combined in
//! ascending rank order, and finalized. With the default statistics
//! reducer the result is bit-identical across runs for a fixed seed.
//!
//! Estimators and reducers cross the wire by name: the job descriptor
//! carries registry keys, and every node resolves them against the same
//! deployed binary. In-process callers may pass implementations directly.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::cancel::CancelFlag;
use crate::comm::Communicator;
use crate::error::{FlotillaError, Result};
use crate::kernels::prime::partition_counts;
use crate::protocol::{Payload, MASTER_RANK};

pub const DEFAULT_CANCEL_CHECK_EVERY: u64 = 1024;

/// Draw one sample and evaluate it to a numeric value.
pub trait Estimator: Send + Sync {
    fn draw(&self, rng: &mut StdRng) -> f64;
}

impl<F> Estimator for F
where
    F: Fn(&mut StdRng) -> f64 + Send + Sync,
{
    fn draw(&self, rng: &mut StdRng) -> f64 {
        self(rng)
    }
}

/// The reducer capability set: per-sample fold, cross-rank combine, and
/// final transformation on rank 0. Accumulators are payloads so they can
/// be gathered over the wire.
pub trait Reducer: Send + Sync {
    fn init(&self) -> Payload;
    fn reduce(&self, acc: Payload, value: f64) -> Result<Payload>;
    fn combine(&self, left: Payload, right: Payload) -> Result<Payload>;
    fn finalize(&self, acc: Payload, total_samples: u64) -> Result<Payload>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonteCarloParams {
    pub num_samples: u64,
    pub seed: Option<u64>,
    pub cancel_check_every: u64,
}

impl MonteCarloParams {
    pub fn new(num_samples: u64) -> Self {
        Self {
            num_samples,
            seed: None,
            cancel_check_every: DEFAULT_CANCEL_CHECK_EVERY,
        }
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MonteCarloResult {
    pub mean: f64,
    pub variance: f64,
    pub stderr: f64,
    pub samples: u64,
}

impl MonteCarloResult {
    fn from_payload(payload: &Payload) -> Result<Self> {
        let items = payload.as_list()?;
        let [mean, variance, stderr, samples] = items else {
            return Err(FlotillaError::Internal(
                "malformed statistics accumulator".into(),
            ));
        };
        Ok(Self {
            mean: mean.as_float()?,
            variance: variance.as_float()?,
            stderr: stderr.as_float()?,
            samples: samples.as_int()? as u64,
        })
    }
}

/// Derive rank `r`'s RNG seed from the job seed. SplitMix64 finalizer, so
/// adjacent ranks get well-separated streams.
pub fn derive_rank_seed(seed: u64, rank: u32) -> u64 {
    let mut z = seed.wrapping_add((u64::from(rank) + 1).wrapping_mul(0x9E37_79B9_7F4A_7C15));
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}

/// SPMD Monte Carlo kernel with an explicit reducer. Rank 0 returns the
/// finalized payload; other ranks return `None`.
pub async fn monte_carlo<C: Communicator>(
    comm: &C,
    cancel: &CancelFlag,
    params: &MonteCarloParams,
    estimator: &dyn Estimator,
    reducer: &dyn Reducer,
) -> Result<Option<Payload>> {
    let rank = comm.rank();
    let counts = partition_counts(params.num_samples, u64::from(comm.size()));
    let local_samples = counts[rank as usize];

    let mut rng = match params.seed {
        Some(seed) => StdRng::seed_from_u64(derive_rank_seed(seed, rank)),
        None => StdRng::from_entropy(),
    };

    let mut acc = reducer.init();
    let mut cancelled = false;
    for i in 0..local_samples {
        if params.cancel_check_every > 0
            && i % params.cancel_check_every == 0
            && cancel.is_set()
        {
            cancelled = true;
            break;
        }
        acc = reducer.reduce(acc, estimator.draw(&mut rng))?;
    }

    let contribution = Payload::List(vec![Payload::Bool(cancelled), acc]);
    let Some(partials) = comm.gather(MASTER_RANK, contribution).await? else {
        return Ok(None);
    };

    let mut combined: Option<Payload> = None;
    for partial in partials {
        let mut items = partial.into_list()?.into_iter();
        let (Some(flag), Some(acc), None) = (items.next(), items.next(), items.next()) else {
            return Err(FlotillaError::ProtocolViolation(
                "malformed Monte Carlo contribution".into(),
            ));
        };
        if flag.as_bool()? {
            return Err(FlotillaError::Cancelled);
        }
        combined = Some(match combined {
            None => acc,
            Some(left) => reducer.combine(left, acc)?,
        });
    }
    let combined =
        combined.ok_or_else(|| FlotillaError::Internal("empty Monte Carlo gather".into()))?;
    Ok(Some(reducer.finalize(combined, params.num_samples)?))
}

/// Monte Carlo with the default `(count, sum, sum_sq)` statistics
/// reducer, producing a typed [`MonteCarloResult`] on rank 0.
pub async fn monte_carlo_stats<C: Communicator>(
    comm: &C,
    cancel: &CancelFlag,
    params: &MonteCarloParams,
    estimator: &dyn Estimator,
) -> Result<Option<MonteCarloResult>> {
    match monte_carlo(comm, cancel, params, estimator, &DefaultStats).await? {
        None => Ok(None),
        Some(payload) => Ok(Some(MonteCarloResult::from_payload(&payload)?)),
    }
}

/// Default reducer: numeric `(count, sum, sum_sq)` triple, combined by
/// element-wise sum, finalized into mean / variance / standard error.
pub struct DefaultStats;

impl DefaultStats {
    fn unpack(acc: &Payload) -> Result<(f64, f64, f64)> {
        let items = acc.as_list()?;
        let [count, sum, sum_sq] = items else {
            return Err(FlotillaError::Internal(
                "malformed statistics accumulator".into(),
            ));
        };
        Ok((count.as_float()?, sum.as_float()?, sum_sq.as_float()?))
    }

    fn pack(count: f64, sum: f64, sum_sq: f64) -> Payload {
        Payload::List(vec![
            Payload::Float(count),
            Payload::Float(sum),
            Payload::Float(sum_sq),
        ])
    }
}

impl Reducer for DefaultStats {
    fn init(&self) -> Payload {
        Self::pack(0.0, 0.0, 0.0)
    }

    fn reduce(&self, acc: Payload, value: f64) -> Result<Payload> {
        let (count, sum, sum_sq) = Self::unpack(&acc)?;
        Ok(Self::pack(count + 1.0, sum + value, sum_sq + value * value))
    }

    fn combine(&self, left: Payload, right: Payload) -> Result<Payload> {
        let (lc, ls, lq) = Self::unpack(&left)?;
        let (rc, rs, rq) = Self::unpack(&right)?;
        Ok(Self::pack(lc + rc, ls + rs, lq + rq))
    }

    fn finalize(&self, acc: Payload, total_samples: u64) -> Result<Payload> {
        let result = if total_samples == 0 {
            Payload::List(vec![
                Payload::Float(f64::NAN),
                Payload::Float(f64::NAN),
                Payload::Float(f64::NAN),
                Payload::Int(0),
            ])
        } else {
            let (_, sum, sum_sq) = Self::unpack(&acc)?;
            let total = total_samples as f64;
            let mean = sum / total;
            let variance = (sum_sq / total - mean * mean).max(0.0);
            let stderr = (variance / total).sqrt();
            Payload::List(vec![
                Payload::Float(mean),
                Payload::Float(variance),
                Payload::Float(stderr),
                Payload::Int(total_samples as i64),
            ])
        };
        Ok(result)
    }
}

/// A scalar fold (`sum`, `prod`, `min`, `max`) as a reducer.
pub struct ScalarFold {
    init: f64,
    fold: fn(f64, f64) -> f64,
}

impl Reducer for ScalarFold {
    fn init(&self) -> Payload {
        Payload::Float(self.init)
    }

    fn reduce(&self, acc: Payload, value: f64) -> Result<Payload> {
        Ok(Payload::Float((self.fold)(acc.as_float()?, value)))
    }

    fn combine(&self, left: Payload, right: Payload) -> Result<Payload> {
        Ok(Payload::Float((self.fold)(
            left.as_float()?,
            right.as_float()?,
        )))
    }

    fn finalize(&self, acc: Payload, _total_samples: u64) -> Result<Payload> {
        Ok(acc)
    }
}

/// Uniform draw on `[0, 1)`.
pub struct UniformEstimator;

impl Estimator for UniformEstimator {
    fn draw(&self, rng: &mut StdRng) -> f64 {
        rng.gen::<f64>()
    }
}

struct Registry {
    estimators: HashMap<String, Arc<dyn Estimator>>,
    reducers: HashMap<String, Arc<dyn Reducer>>,
}

impl Registry {
    fn with_builtins() -> Self {
        let mut estimators: HashMap<String, Arc<dyn Estimator>> = HashMap::new();
        estimators.insert("uniform".into(), Arc::new(UniformEstimator));

        let mut reducers: HashMap<String, Arc<dyn Reducer>> = HashMap::new();
        reducers.insert("default_stats".into(), Arc::new(DefaultStats));
        reducers.insert(
            "sum".into(),
            Arc::new(ScalarFold {
                init: 0.0,
                fold: |a, b| a + b,
            }),
        );
        reducers.insert(
            "prod".into(),
            Arc::new(ScalarFold {
                init: 1.0,
                fold: |a, b| a * b,
            }),
        );
        reducers.insert(
            "min".into(),
            Arc::new(ScalarFold {
                init: f64::INFINITY,
                fold: f64::min,
            }),
        );
        reducers.insert(
            "max".into(),
            Arc::new(ScalarFold {
                init: f64::NEG_INFINITY,
                fold: f64::max,
            }),
        );
        Self {
            estimators,
            reducers,
        }
    }
}

fn registry() -> &'static Mutex<Registry> {
    static REGISTRY: OnceLock<Mutex<Registry>> = OnceLock::new();
    REGISTRY.get_or_init(|| Mutex::new(Registry::with_builtins()))
}

/// Make an estimator resolvable by name on this process. Both ends of a
/// distributed job must register the same names.
pub fn register_estimator(name: &str, estimator: Arc<dyn Estimator>) {
    registry()
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .estimators
        .insert(name.to_string(), estimator);
}

pub fn register_reducer(name: &str, reducer: Arc<dyn Reducer>) {
    registry()
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .reducers
        .insert(name.to_string(), reducer);
}

pub fn resolve_estimator(name: &str) -> Result<Arc<dyn Estimator>> {
    registry()
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .estimators
        .get(name)
        .cloned()
        .ok_or_else(|| FlotillaError::Internal(format!("unknown estimator '{name}'")))
}

pub fn resolve_reducer(name: &str) -> Result<Arc<dyn Reducer>> {
    registry()
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .reducers
        .get(name)
        .cloned()
        .ok_or_else(|| FlotillaError::Internal(format!("unknown reducer '{name}'")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::LocalComm;

    #[tokio::test]
    async fn uniform_mean_is_near_half() {
        let comm = LocalComm::default();
        let cancel = CancelFlag::new();
        let params = MonteCarloParams::new(20_000).with_seed(12345);
        let result = monte_carlo_stats(&comm, &cancel, &params, &UniformEstimator)
            .await
            .unwrap()
            .unwrap();
        assert!((result.mean - 0.5).abs() < 0.02);
        assert!(result.variance > 0.0);
        assert_eq!(result.samples, 20_000);
    }

    #[tokio::test]
    async fn seeded_runs_are_bit_identical() {
        let params = MonteCarloParams::new(10_000).with_seed(99);
        let mut means = Vec::new();
        for _ in 0..2 {
            let comm = LocalComm::default();
            let cancel = CancelFlag::new();
            let result = monte_carlo_stats(&comm, &cancel, &params, &UniformEstimator)
                .await
                .unwrap()
                .unwrap();
            means.push((result.mean.to_bits(), result.variance.to_bits()));
        }
        assert_eq!(means[0], means[1]);
    }

    #[tokio::test]
    async fn zero_samples_yield_nan_statistics() {
        let comm = LocalComm::default();
        let cancel = CancelFlag::new();
        let params = MonteCarloParams::new(0);
        let result = monte_carlo_stats(&comm, &cancel, &params, &UniformEstimator)
            .await
            .unwrap()
            .unwrap();
        assert!(result.mean.is_nan());
        assert!(result.variance.is_nan());
        assert!(result.stderr.is_nan());
        assert_eq!(result.samples, 0);
    }

    #[tokio::test]
    async fn closure_estimator_and_named_reducer() {
        let comm = LocalComm::default();
        let cancel = CancelFlag::new();
        let params = MonteCarloParams::new(100).with_seed(7);
        let reducer = resolve_reducer("sum").unwrap();
        let constant = |_: &mut StdRng| 2.0;
        let total = monte_carlo(&comm, &cancel, &params, &constant, reducer.as_ref())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(total, Payload::Float(200.0));
    }

    #[tokio::test]
    async fn cancellation_interrupts_sampling() {
        let comm = LocalComm::default();
        let cancel = CancelFlag::new();
        cancel.set();
        let params = MonteCarloParams::new(1_000_000).with_seed(1);
        let err = monte_carlo_stats(&comm, &cancel, &params, &UniformEstimator)
            .await
            .unwrap_err();
        assert!(matches!(err, FlotillaError::Cancelled));
    }

    #[test]
    fn rank_seeds_are_distinct_and_stable() {
        let a = derive_rank_seed(1234, 0);
        let b = derive_rank_seed(1234, 1);
        let c = derive_rank_seed(1234, 2);
        assert_ne!(a, b);
        assert_ne!(b, c);
        assert_eq!(a, derive_rank_seed(1234, 0));
    }

    #[test]
    fn unknown_registry_names_are_rejected() {
        assert!(resolve_estimator("no-such-estimator").is_err());
        assert!(resolve_reducer("no-such-reducer").is_err());
    }
}
