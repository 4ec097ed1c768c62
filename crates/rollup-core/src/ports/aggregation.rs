//! Aggregation port - ロールアップ本体（SQL など）の抽象化
//!
//! An aggregation reads source rows inside the window's query range and upserts
//! the result under its storage key (plus any secondary dimension such as a
//! dessert id). Running it twice over unchanged source data must leave the same
//! rows behind; the queue delivers at least once and relies on that.

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::domain::{ResolvedWindow, RollupError};

#[async_trait]
pub trait Aggregation: Send + Sync {
    /// Computes one window and returns the number of rows written.
    ///
    /// Storage outages map to `RollupError::TransientStorage`. Implementations should
    /// give up promptly once `cancel` fires.
    async fn execute(
        &self,
        window: &ResolvedWindow,
        cancel: &CancellationToken,
    ) -> Result<u64, RollupError>;
}
