//! IdGenerator port - ID 生成の抽象化
//!
//! ULID のタイムスタンプ部分は Clock から取るので、FixedClock を使うと
//! 時刻部分が決定的になります（ランダム部分は毎回異なる）。

use crate::domain::ids::{AttemptId, TaskId};
use crate::ports::Clock;
use ulid::Ulid;

pub trait IdGenerator: Send + Sync {
    fn generate_task_id(&self) -> TaskId;

    fn generate_attempt_id(&self) -> AttemptId;
}

pub struct UlidGenerator<C> {
    clock: C,
}

impl<C: Clock> UlidGenerator<C> {
    pub fn new(clock: C) -> Self {
        Self { clock }
    }

    fn next_ulid(&self) -> Ulid {
        let timestamp_ms = u64::try_from(self.clock.now().timestamp_millis()).unwrap_or(0);
        Ulid::from_parts(timestamp_ms, rand::random())
    }
}

impl<C: Clock> IdGenerator for UlidGenerator<C> {
    fn generate_task_id(&self) -> TaskId {
        TaskId::from(self.next_ulid())
    }

    fn generate_attempt_id(&self) -> AttemptId {
        AttemptId::from(self.next_ulid())
    }
}
