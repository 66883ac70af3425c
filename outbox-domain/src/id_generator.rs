//! 事件 ID 生成器
//!
//! 默认实现仅在创建时从操作系统熵源取一次种子，之后使用伪随机数生成器，
//! 在 ID 的不可预测性与吞吐之间取得平衡。
//!
use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};
use std::sync::{Mutex, PoisonError};

/// 全局唯一事件 ID 生成器
pub trait IdGenerator: Send + Sync {
    fn generate(&self) -> String;
}

/// 以安全随机种子初始化的 UUID（v4 布局）生成器
#[derive(Debug)]
pub struct SeededIdGenerator {
    rng: Mutex<StdRng>,
}

impl SeededIdGenerator {
    pub fn new() -> Self {
        Self {
            rng: Mutex::new(StdRng::from_os_rng()),
        }
    }

    /// 固定种子，便于复现
    pub fn with_seed(seed: u64) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }
}

impl Default for SeededIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

impl IdGenerator for SeededIdGenerator {
    fn generate(&self) -> String {
        let mut bytes = [0u8; 16];
        self.rng
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .fill_bytes(&mut bytes);
        uuid::Builder::from_random_bytes(bytes)
            .into_uuid()
            .to_string()
    }
}
