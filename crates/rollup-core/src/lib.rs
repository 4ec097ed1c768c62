//! rollup-core
//!
//! Scheduling, backfill and dispatch of windowed analytics roll-ups.
//!
//! # モジュール構成
//! - **domain**: ドメインモデル（job kind, window, business calendar, task, errors）
//! - **ports**: 抽象化レイヤー（Aggregation, BackfillSource, Clock, IdGenerator）
//! - **queue**: TaskQueue / TaskLease と in-memory 実装
//! - **app**: アプリケーションロジック（builder, scheduler, backfill, trigger, worker_loop）
//! - **impls**: 実装（InMemoryStore と標準ロールアップ）
//! - **config**: TOML 設定の読み込みと検証

pub mod app;
pub mod config;
pub mod domain;
pub mod impls;
pub mod ports;
pub mod queue;

pub use config::RollupConfig;
pub use domain::{ErrorKind, RollupError};
