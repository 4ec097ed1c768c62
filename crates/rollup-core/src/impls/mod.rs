//! Impls - ports の実装（開発用・テスト用）
//!
//! - **InMemoryStore**: 集計元データと集計テーブルを保持する参照実装
//! - **MemoryRollup**: 標準 7 ジョブの Aggregation

pub mod memory_store;

pub use self::memory_store::{
    AnalyticsTables, DessertRevenueRow, InMemoryStore, InventorySnapshot, ItemModifier, ItemType,
    MemoryRollup, Order, OrderItem, OrderStatus, RevenueRow, RollupOp, SourceData, StockRow,
    TableSizes, WeeklyRevenueRow, aggregation_for,
};
