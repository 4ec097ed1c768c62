//! App - アプリケーション層
//!
//! ports と queue を組み合わせたロールアップの実行系。
//!
//! # 主要コンポーネント
//! - **AppBuilder / JobRegistry**: ジョブ登録と起動時検証
//! - **RecurringScheduler**: cron による定期投入
//! - **Backfill**: 履歴全体の一括投入
//! - **Trigger**: 日次再計算と単発投入
//! - **Dispatcher / WorkerGroup**: タスク実行ループ

pub mod backfill;
pub mod builder;
pub mod dispatch;
pub mod registry;
pub mod scheduler;
pub mod trigger;
pub mod worker_loop;

pub use self::backfill::{Backfill, BackfillOutcome, BackfillPlan, BackfillReport};
pub use self::builder::AppBuilder;
pub use self::dispatch::{Dispatcher, Execution};
pub use self::registry::{JobDescriptor, JobRegistry};
pub use self::scheduler::{RecurringScheduler, ScheduleEntry, standard_entries};
pub use self::trigger::{RecomputeReport, Trigger};
pub use self::worker_loop::WorkerGroup;
