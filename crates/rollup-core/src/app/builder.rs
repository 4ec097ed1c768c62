//! AppBuilder - ジョブ登録と起動時検証
//!
//! # Fail-fast 設計
//! - expect_kinds() で期待される job kind を登録
//! - build() 時に「期待集合 ⊆ 登録済み集合」をチェック
//! - 不足があれば RollupError::MissingJobKinds を返す

use std::sync::Arc;

use crate::domain::{Granularity, JobKind, RollupError, STANDARD_JOBS};
use crate::ports::Aggregation;

use super::registry::JobRegistry;

/// # 使用例
/// ```ignore
/// let registry = AppBuilder::new()
///     .register_standard(|kind| store.aggregation_for(kind))?
///     .expect_standard_kinds()
///     .build()?;
/// ```
#[derive(Default)]
pub struct AppBuilder {
    registry: JobRegistry,
    expected_kinds: Option<Vec<String>>,
}

impl AppBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        mut self,
        kind: impl Into<JobKind>,
        granularity: Granularity,
        aggregation: Arc<dyn Aggregation>,
    ) -> Result<Self, RollupError> {
        self.registry.register(kind.into(), granularity, aggregation)?;
        Ok(self)
    }

    /// Registers every row of the standard job table for which `factory` yields an
    /// aggregation. Rows it declines stay unregistered.
    pub fn register_standard<F>(mut self, mut factory: F) -> Result<Self, RollupError>
    where
        F: FnMut(&str) -> Option<Arc<dyn Aggregation>>,
    {
        for template in STANDARD_JOBS {
            if let Some(aggregation) = factory(template.kind) {
                self.registry
                    .register(JobKind::new(template.kind), template.granularity, aggregation)?;
            }
        }
        Ok(self)
    }

    pub fn expect_kinds(mut self, kinds: &[&str]) -> Self {
        self.expected_kinds = Some(kinds.iter().map(|k| k.to_string()).collect());
        self
    }

    pub fn expect_standard_kinds(self) -> Self {
        let kinds: Vec<&str> = STANDARD_JOBS.iter().map(|t| t.kind).collect();
        self.expect_kinds(&kinds)
    }

    pub fn build(self) -> Result<JobRegistry, RollupError> {
        if let Some(expected) = &self.expected_kinds {
            let missing: Vec<String> = expected
                .iter()
                .filter(|kind| !self.registry.contains(kind))
                .cloned()
                .collect();
            if !missing.is_empty() {
                return Err(RollupError::MissingJobKinds(missing));
            }
        }
        Ok(self.registry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::registry::tests::Noop;
    use crate::domain::job::{DAILY_REVENUE, WEEKLY_REVENUE};

    #[test]
    fn build_succeeds_when_expected_kinds_are_registered() {
        let registry = AppBuilder::new()
            .register(DAILY_REVENUE, Granularity::Day, Arc::new(Noop))
            .unwrap()
            .expect_kinds(&[DAILY_REVENUE])
            .build()
            .unwrap();
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn build_reports_missing_kinds() {
        let result = AppBuilder::new()
            .register(DAILY_REVENUE, Granularity::Day, Arc::new(Noop))
            .unwrap()
            .expect_kinds(&[DAILY_REVENUE, WEEKLY_REVENUE])
            .build();
        assert!(matches!(
            result,
            Err(RollupError::MissingJobKinds(missing)) if missing == vec![WEEKLY_REVENUE.to_string()]
        ));
    }

    #[test]
    fn standard_registration_follows_the_table() {
        let registry = AppBuilder::new()
            .register_standard(|_| Some(Arc::new(Noop) as Arc<dyn Aggregation>))
            .unwrap()
            .expect_standard_kinds()
            .build()
            .unwrap();
        assert_eq!(registry.len(), STANDARD_JOBS.len());
        assert_eq!(registry.kinds_with(Granularity::Day).len(), 4);
    }

    #[test]
    fn factory_can_decline_kinds() {
        let result = AppBuilder::new()
            .register_standard(|kind| (kind == DAILY_REVENUE).then(|| Arc::new(Noop) as Arc<dyn Aggregation>))
            .unwrap()
            .expect_standard_kinds()
            .build();
        assert!(matches!(result, Err(RollupError::MissingJobKinds(missing)) if missing.len() == 6));
    }
}
