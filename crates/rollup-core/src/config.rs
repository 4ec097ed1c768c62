use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::app::{ScheduleEntry, standard_entries};
use crate::domain::job::DEFAULT_QUEUE;
use crate::domain::{BusinessCalendar, RollupError, parse_offset, standard_template};
use crate::queue::{QueueOptions, RetryPolicy};

pub const CONFIG_ENV: &str = "ROLLUP_CONFIG";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RollupConfig {
    pub business: BusinessConfig,
    pub queue: QueueConfig,
    pub worker: WorkerConfig,
    /// Replaces the standard cron table when non-empty.
    pub schedule: Vec<ScheduleConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BusinessConfig {
    /// `+HH:MM`; every business date and cron time is read in this offset.
    pub utc_offset: String,
}

impl Default for BusinessConfig {
    fn default() -> Self {
        Self {
            utc_offset: "+05:30".into(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct QueueConfig {
    pub name: String,
    pub max_attempts: u32,
    pub retry_base_delay_ms: u64,
    pub retry_multiplier: f64,
    pub retry_max_delay_ms: u64,
    /// Pending-task bound, unbounded when absent.
    pub capacity: Option<usize>,
    /// Succeeded and dead tasks kept in memory for inspection. 0 keeps all of them.
    pub finished_retention: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            name: DEFAULT_QUEUE.into(),
            max_attempts: 5,
            retry_base_delay_ms: 2_000,
            retry_multiplier: 2.0,
            retry_max_delay_ms: 600_000,
            capacity: None,
            finished_retention: 10_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WorkerConfig {
    pub concurrency: usize,
    pub task_timeout_secs: u64,
    pub shutdown_grace_secs: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: 5,
            task_timeout_secs: 300,
            shutdown_grace_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ScheduleConfig {
    pub kind: String,
    pub cron: String,
}

macro_rules! ensure {
    ($cond:expr, $($arg:tt)+) => {
        if !$cond {
            return Err(RollupError::Config(format!($($arg)+)));
        }
    };
}

impl RollupConfig {
    /// Reads `path`, else the file named by `ROLLUP_CONFIG`, else built-in defaults.
    pub fn load(path: Option<&Path>) -> Result<Self, RollupError> {
        let path = path
            .map(Path::to_path_buf)
            .or_else(|| std::env::var_os(CONFIG_ENV).map(PathBuf::from));
        match path {
            Some(path) => {
                let s = std::fs::read_to_string(&path)
                    .map_err(|e| RollupError::Config(format!("read {}: {e}", path.display())))?;
                Self::load_from_str(&s)
            }
            None => {
                let config = Self::default();
                config.validate()?;
                Ok(config)
            }
        }
    }

    pub fn load_from_str(s: &str) -> Result<Self, RollupError> {
        let config: RollupConfig = toml::from_str(s).map_err(|e| RollupError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), RollupError> {
        parse_offset(&self.business.utc_offset)?;
        ensure!(!self.queue.name.trim().is_empty(), "queue.name must be non-empty");
        ensure!(
            self.queue.max_attempts > 0,
            "queue.max_attempts must be > 0, got {}",
            self.queue.max_attempts
        );
        ensure!(
            self.queue.retry_multiplier.is_finite() && self.queue.retry_multiplier >= 1.0,
            "queue.retry_multiplier must be >= 1.0, got {}",
            self.queue.retry_multiplier
        );
        ensure!(
            self.queue.retry_max_delay_ms >= self.queue.retry_base_delay_ms,
            "queue.retry_max_delay_ms must be >= queue.retry_base_delay_ms"
        );
        ensure!(
            self.queue.capacity != Some(0),
            "queue.capacity must be > 0 when set"
        );
        ensure!(
            self.worker.concurrency > 0,
            "worker.concurrency must be > 0, got {}",
            self.worker.concurrency
        );
        ensure!(
            self.worker.task_timeout_secs > 0,
            "worker.task_timeout_secs must be > 0, got {}",
            self.worker.task_timeout_secs
        );
        for entry in &self.schedule {
            ensure!(
                standard_template(&entry.kind).is_some(),
                "schedule entry names unknown job kind {:?}",
                entry.kind
            );
        }
        self.schedule_entries()?;
        Ok(())
    }

    pub fn calendar(&self) -> Result<BusinessCalendar, RollupError> {
        parse_offset(&self.business.utc_offset).map(BusinessCalendar::new)
    }

    pub fn queue_options(&self) -> QueueOptions {
        QueueOptions {
            max_attempts: self.queue.max_attempts,
            retry_policy: RetryPolicy {
                base_delay: Duration::from_millis(self.queue.retry_base_delay_ms),
                multiplier: self.queue.retry_multiplier,
                max_delay: Duration::from_millis(self.queue.retry_max_delay_ms),
            },
            capacity: self.queue.capacity,
            finished_retention: (self.queue.finished_retention > 0).then_some(self.queue.finished_retention),
        }
    }

    pub fn queues(&self) -> Vec<String> {
        vec![self.queue.name.clone()]
    }

    pub fn task_timeout(&self) -> Duration {
        Duration::from_secs(self.worker.task_timeout_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.worker.shutdown_grace_secs)
    }

    pub fn schedule_entries(&self) -> Result<Vec<ScheduleEntry>, RollupError> {
        if self.schedule.is_empty() {
            return standard_entries(&self.queue.name);
        }
        self.schedule
            .iter()
            .map(|entry| ScheduleEntry::new(entry.kind.as_str(), &entry.cron, self.queue.name.as_str()))
            .collect()
    }
}
