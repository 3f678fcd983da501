use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::{FlotillaError, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobState {
    Idle,
    Running {
        job_id: Uuid,
        started_at: DateTime<Utc>,
    },
}

/// Single-entry lock ensuring at most one active job on the master.
/// Release rides on the guard's `Drop`, so every exit path restores
/// `Idle` exactly once.
#[derive(Debug, Clone, Default)]
pub struct JobLock {
    state: Arc<Mutex<JobState>>,
}

impl Default for JobState {
    fn default() -> Self {
        JobState::Idle
    }
}

impl JobLock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> JobState {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Transition `Idle -> Running`; fails with `Busy` otherwise.
    pub fn acquire(&self, job_id: Uuid) -> Result<JobGuard> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        match *state {
            JobState::Idle => {
                *state = JobState::Running {
                    job_id,
                    started_at: Utc::now(),
                };
                Ok(JobGuard {
                    state: self.state.clone(),
                })
            }
            JobState::Running { .. } => Err(FlotillaError::Busy),
        }
    }
}

pub struct JobGuard {
    state: Arc<Mutex<JobState>>,
}

impl Drop for JobGuard {
    fn drop(&mut self) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        *state = JobState::Idle;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn admits_one_running_job() {
        let lock = JobLock::new();
        let guard = lock.acquire(Uuid::new_v4()).unwrap();
        assert!(matches!(lock.state(), JobState::Running { .. }));
        assert!(matches!(
            lock.acquire(Uuid::new_v4()),
            Err(FlotillaError::Busy)
        ));
        drop(guard);
        assert_eq!(lock.state(), JobState::Idle);
        // Released on every exit path: a new acquire succeeds.
        let _guard = lock.acquire(Uuid::new_v4()).unwrap();
    }
}
