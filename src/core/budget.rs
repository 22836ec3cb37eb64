use crate::config::BatchConfig;
use crate::domain::ports::{Clock, MemoryProbe};
use chrono::{DateTime, Utc};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum BudgetLimit {
    Memory { used: u64, limit: u64 },
    Time { elapsed_secs: f64, limit_secs: f64 },
}

impl fmt::Display for BudgetLimit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BudgetLimit::Memory { used, limit } => {
                write!(f, "memory {}MB of {}MB", used / 1024 / 1024, limit / 1024 / 1024)
            }
            BudgetLimit::Time {
                elapsed_secs,
                limit_secs,
            } => write!(f, "time {:.1}s of {:.0}s", elapsed_secs, limit_secs),
        }
    }
}

/// Memory and wall-clock allowance for one batch invocation.
pub struct BatchBudget<'a> {
    config: &'a BatchConfig,
    clock: &'a dyn Clock,
    memory: &'a dyn MemoryProbe,
    started: DateTime<Utc>,
}

impl<'a> BatchBudget<'a> {
    pub fn start(config: &'a BatchConfig, clock: &'a dyn Clock, memory: &'a dyn MemoryProbe) -> Self {
        Self {
            config,
            clock,
            memory,
            started: clock.now(),
        }
    }

    /// The first limit whose threshold has been reached, if any.
    pub fn exceeded(&self) -> Option<BudgetLimit> {
        if let Some(limit) = self.config.memory_limit.bytes().filter(|l| *l > 0) {
            let used = self.memory.used_bytes();
            if used as f64 / limit as f64 >= self.config.memory_threshold {
                return Some(BudgetLimit::Memory { used, limit });
            }
        }

        if let Some(limit) = self.config.time_limit() {
            let elapsed = (self.clock.now() - self.started)
                .to_std()
                .unwrap_or_default()
                .as_secs_f64();
            let limit_secs = limit.as_secs_f64();
            if elapsed / limit_secs >= self.config.time_threshold {
                return Some(BudgetLimit::Time {
                    elapsed_secs: elapsed,
                    limit_secs,
                });
            }
        }

        None
    }
}
