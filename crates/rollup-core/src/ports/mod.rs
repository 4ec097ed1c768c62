//! Ports - 抽象化レイヤー
//!
//! 外部システム（集計ストレージ、時計、ID 生成）へのインターフェース。
//! キュー自体の trait は `crate::queue` にあります。

pub mod aggregation;
pub mod backfill_source;
pub mod clock;
pub mod id_generator;

pub use self::aggregation::Aggregation;
pub use self::backfill_source::BackfillSource;
pub use self::clock::{Clock, FixedClock, SystemClock};
pub use self::id_generator::{IdGenerator, UlidGenerator};
