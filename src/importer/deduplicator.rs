// ==========================================
// 数据传输系统 - 行去重器
// ==========================================
// 职责: 检测同一任务内原始内容完全相同的行
// 依据: 对映射前的原始行序列化结果计算 SHA-256
// 红线: 去重状态仅在单个任务内有效，任务之间不共享
// ==========================================

use crate::domain::field::RawRow;
use crate::error::TransferResult;
use sha2::{Digest, Sha256};
use std::collections::HashSet;

/// 行内容摘要
pub type RowHash = [u8; 32];

/// 计算原始行摘要（与行是否通过校验无关）
pub fn row_hash(raw: &RawRow) -> TransferResult<RowHash> {
    let bytes = serde_json::to_vec(raw.cells())?;
    Ok(Sha256::digest(&bytes).into())
}

#[derive(Debug, Default)]
pub struct Deduplicator {
    seen: HashSet<RowHash>,
}

impl Deduplicator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seen(&self, hash: &RowHash) -> bool {
        self.seen.contains(hash)
    }

    pub fn remember(&mut self, hash: RowHash) {
        self.seen.insert(hash);
    }

    /// 检查并记录
    ///
    /// # 返回
    /// - true: 重复（非首次出现）
    pub fn check_and_remember(&mut self, hash: RowHash) -> bool {
        !self.seen.insert(hash)
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}
