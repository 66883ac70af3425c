//! 时钟抽象（Clock）
//!
//! 所有时间戳（writtenOn、producerAckOn 等）统一由注入的时钟生成，
//! 以便在测试中固定/推进时间，并在部署中按配置的时区记录时间。
//!
use crate::error::{OutboxError, OutboxResult};
use chrono::{DateTime, Duration, FixedOffset, Offset, Utc};
use std::sync::{Mutex, PoisonError};

/// 事件存储使用的时间戳类型（带固定时区偏移）
pub type Timestamp = DateTime<FixedOffset>;

/// 当前时间来源
pub trait Clock: Send + Sync {
    fn now(&self) -> Timestamp;
}

/// 系统时钟，按固定偏移输出时间
#[derive(Debug, Clone, Copy)]
pub struct SystemClock {
    offset: FixedOffset,
}

impl SystemClock {
    pub fn new(offset: FixedOffset) -> Self {
        Self { offset }
    }

    pub fn utc() -> Self {
        Self::new(Utc.fix())
    }

    /// 按配置的时区构造；`None` 表示 UTC。
    ///
    /// 支持 `UTC`/`Z` 与 `+08:00`、`-0530` 形式的固定偏移。
    pub fn from_timezone(timezone: Option<&str>) -> OutboxResult<Self> {
        match timezone.map(str::trim) {
            None | Some("") => Ok(Self::utc()),
            Some(tz) if tz.eq_ignore_ascii_case("utc") || tz.eq_ignore_ascii_case("z") => {
                Ok(Self::utc())
            }
            Some(tz) => {
                let offset = tz.parse::<FixedOffset>().map_err(|e| OutboxError::Config {
                    reason: format!("invalid timezone `{tz}`: {e}"),
                })?;
                Ok(Self::new(offset))
            }
        }
    }

    pub fn offset(&self) -> FixedOffset {
        self.offset
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::utc()
    }
}

impl Clock for SystemClock {
    fn now(&self) -> Timestamp {
        Utc::now().with_timezone(&self.offset)
    }
}

/// 手动推进的时钟，用于确定性测试与演示
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<Timestamp>,
}

impl ManualClock {
    pub fn new(start: Timestamp) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    /// 以当前系统时间（UTC）为起点
    pub fn starting_now() -> Self {
        Self::new(SystemClock::utc().now())
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(PoisonError::into_inner);
        *now += by;
    }

    pub fn set(&self, to: Timestamp) {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner) = to;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Timestamp {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
