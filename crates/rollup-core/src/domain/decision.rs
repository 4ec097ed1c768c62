//! Decision model: what happens to a task after a retryable failure.

use std::time::Duration;

use crate::queue::{RetryPolicy, TaskRecord};

#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    Retry { delay: Duration, reason: String },
    MarkDead { reason: String },
}

/// Deciders are pure: they read the record and return the next action.
/// The queue applies it.
pub trait Decider: Send + Sync {
    fn decide(&self, task: &TaskRecord) -> Decision;
}

/// Retries with exponential backoff until `max_attempts` deliveries have failed.
#[derive(Debug, Clone)]
pub struct DefaultDecider {
    retry_policy: RetryPolicy,
}

impl DefaultDecider {
    pub fn new(retry_policy: RetryPolicy) -> Self {
        Self { retry_policy }
    }
}

impl Default for DefaultDecider {
    fn default() -> Self {
        Self::new(RetryPolicy::default())
    }
}

impl Decider for DefaultDecider {
    fn decide(&self, task: &TaskRecord) -> Decision {
        if task.attempts >= task.max_attempts {
            Decision::MarkDead {
                reason: format!(
                    "max attempts reached: {}/{}",
                    task.attempts, task.max_attempts
                ),
            }
        } else {
            let delay = self.retry_policy.next_delay(task.attempts);
            Decision::Retry {
                delay,
                reason: format!(
                    "retry attempt {}/{} after {:?}",
                    task.attempts + 1,
                    task.max_attempts,
                    delay
                ),
            }
        }
    }
}
