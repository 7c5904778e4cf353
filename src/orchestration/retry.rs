//! Retry decisions for failed attempts.
//!
//! A failed task is requeued into the worker pool while it has attempts
//! left. Once the pool attempts are used up it may get one more attempt
//! alone, after the pool has drained, to rule out failures caused by
//! contention between concurrent jobs.

use std::collections::{HashSet, VecDeque};

use crate::core::task::{Task, TaskId};

/// Default number of attempts a task gets in the worker pool.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub serial_fallback: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            serial_fallback: true,
        }
    }
}

/// What happens to a task after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Back to `Pending` in the pool.
    Requeue,
    /// Deferred until the pool drains, then run alone once.
    SerialFallback,
    /// Terminal `Failed`.
    GiveUp,
}

/// Tracks which tasks are waiting for their serial attempt.
#[derive(Debug, Clone, Default)]
pub struct RetryController {
    policy: RetryPolicy,
    deferred: VecDeque<TaskId>,
    /// Tasks that already used their serial attempt.
    serial_used: HashSet<TaskId>,
}

impl RetryController {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            deferred: VecDeque::new(),
            serial_used: HashSet::new(),
        }
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    /// Decide the fate of `task`, whose current attempt just failed.
    ///
    /// `task.attempt` counts the attempts started so far, including the one
    /// that failed.
    pub fn on_failure(&mut self, task: &Task) -> RetryDecision {
        if self.serial_used.contains(&task.id) {
            return RetryDecision::GiveUp;
        }
        if task.attempt < self.policy.max_attempts {
            return RetryDecision::Requeue;
        }
        if task.attempt == self.policy.max_attempts && self.policy.serial_fallback {
            self.deferred.push_back(task.id.clone());
            return RetryDecision::SerialFallback;
        }
        RetryDecision::GiveUp
    }

    /// Next task due for its serial attempt, in the order they were deferred.
    pub fn next_deferred(&mut self) -> Option<TaskId> {
        let id = self.deferred.pop_front()?;
        self.serial_used.insert(id.clone());
        Some(id)
    }

    pub fn has_deferred(&self) -> bool {
        !self.deferred.is_empty()
    }

    pub fn deferred_count(&self) -> usize {
        self.deferred.len()
    }
}
