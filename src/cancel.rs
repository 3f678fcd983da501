use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};

use crate::error::{FlotillaError, Result};

/// Job-scoped cooperative cancellation flag.
///
/// Monotonic: once set it stays set until the job ends. Kernels poll
/// [`is_set`](CancelFlag::is_set) in their hot loops and call
/// [`bail_if_set`](CancelFlag::bail_if_set) where a fail-fast exit is
/// acceptable; blocking communicator calls include
/// [`cancelled`](CancelFlag::cancelled) in their wait sets.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag {
    token: CancellationToken,
}

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self) {
        self.token.cancel();
    }

    /// Non-blocking predicate; safe to poll at high frequency.
    pub fn is_set(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Fail fast with `Cancelled` when the flag is set.
    pub fn bail_if_set(&self) -> Result<()> {
        if self.is_set() {
            Err(FlotillaError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Resolves once the flag is set. For use in `select!` wait sets.
    pub fn cancelled(&self) -> WaitForCancellationFuture<'_> {
        self.token.cancelled()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flag_is_monotonic() {
        let flag = CancelFlag::new();
        assert!(!flag.is_set());
        assert!(flag.bail_if_set().is_ok());
        flag.set();
        assert!(flag.is_set());
        flag.set();
        assert!(flag.is_set());
        assert!(matches!(flag.bail_if_set(), Err(FlotillaError::Cancelled)));
    }

    #[tokio::test]
    async fn clones_share_state() {
        let flag = CancelFlag::new();
        let observer = flag.clone();
        tokio::spawn(async move { flag.set() });
        observer.cancelled().await;
        assert!(observer.is_set());
    }
}
