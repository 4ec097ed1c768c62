//! BackfillSource port - 履歴の範囲と既存ロールアップの有無
//!
//! Backfill needs two facts from storage: how far back the source data goes, and
//! whether the daily destination already holds rows (in which case a startup
//! backfill is skipped unless forced).

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::domain::RollupError;

#[async_trait]
pub trait BackfillSource: Send + Sync {
    /// Timestamp of the oldest source record, `None` when there is no history.
    async fn earliest_source_timestamp(&self) -> Result<Option<DateTime<Utc>>, RollupError>;

    /// Row count of the daily revenue roll-up.
    async fn existing_day_rows(&self) -> Result<u64, RollupError>;
}
