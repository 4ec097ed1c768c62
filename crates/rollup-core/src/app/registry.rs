use std::collections::BTreeMap;
use std::sync::Arc;

use crate::domain::{Granularity, JobKind, RollupError};
use crate::ports::Aggregation;

/// Everything the dispatch loop needs to run one kind of roll-up.
#[derive(Clone)]
pub struct JobDescriptor {
    pub kind: JobKind,
    pub granularity: Granularity,
    pub aggregation: Arc<dyn Aggregation>,
}

impl std::fmt::Debug for JobDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobDescriptor")
            .field("kind", &self.kind)
            .field("granularity", &self.granularity)
            .finish_non_exhaustive()
    }
}

/// Registry of job descriptors (kind -> descriptor).
///
/// Filled while the process starts, read-only afterwards, so it needs no lock.
#[derive(Debug, Default)]
pub struct JobRegistry {
    jobs: BTreeMap<JobKind, JobDescriptor>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        kind: JobKind,
        granularity: Granularity,
        aggregation: Arc<dyn Aggregation>,
    ) -> Result<(), RollupError> {
        if self.jobs.contains_key(&kind) {
            return Err(RollupError::DuplicateJobKind(kind));
        }
        self.jobs.insert(
            kind.clone(),
            JobDescriptor {
                kind,
                granularity,
                aggregation,
            },
        );
        Ok(())
    }

    pub fn lookup(&self, kind: &JobKind) -> Result<&JobDescriptor, RollupError> {
        self.jobs
            .get(kind)
            .ok_or_else(|| RollupError::UnknownJobKind(kind.clone()))
    }

    pub fn contains(&self, kind: &str) -> bool {
        self.jobs.contains_key(&JobKind::new(kind))
    }

    /// Kinds of one granularity in name order.
    pub fn kinds_with(&self, granularity: Granularity) -> Vec<JobKind> {
        self.jobs
            .values()
            .filter(|d| d.granularity == granularity)
            .map(|d| d.kind.clone())
            .collect()
    }

    pub fn kinds(&self) -> impl Iterator<Item = &JobKind> {
        self.jobs.keys()
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}
