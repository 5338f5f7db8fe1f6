// ==========================================
// 数据传输系统 - 导出器参与方 Trait
// ==========================================
// 职责: 定义各导出类型需提供的能力
// - 默认表头（阶段 1 表头提取）
// - 审核类型（交由审核策略判断是否需要审核）
// - 查询提供者（可计数、可分块的游标）
// - 行映射（源行 → 表头标签: 值）
// ==========================================

use crate::domain::field::CellValue;
use crate::domain::types::ExportMode;
use crate::error::{TransferError, TransferResult};
use serde_json::Value;
use std::collections::HashMap;

// ==========================================
// ExportFilter - 查询条件
// ==========================================
#[derive(Debug, Clone, PartialEq)]
pub enum ExportFilter {
    /// 全量
    All,
    /// 显式 ID 列表（page / selection）
    Ids(Vec<i64>),
    /// 结构化筛选条件（query）
    Query(Value),
}

impl ExportFilter {
    /// 由任务的模式与参数构造
    ///
    /// # 错误
    /// - InvalidRequest: 模式缺失，或 page/selection 的参数不是整数 ID 数组
    pub fn from_mode(mode: Option<ExportMode>, params: &Value) -> TransferResult<Self> {
        match mode {
            None => Err(TransferError::InvalidRequest("导出模式缺失".to_string())),
            Some(ExportMode::All) => Ok(ExportFilter::All),
            Some(ExportMode::Query) => Ok(ExportFilter::Query(params.clone())),
            Some(mode @ (ExportMode::Page | ExportMode::Selection)) => {
                let ids = params
                    .as_array()
                    .ok_or_else(|| {
                        TransferError::InvalidRequest(format!("{} 模式需要 ID 数组", mode))
                    })?
                    .iter()
                    .map(|v| {
                        v.as_i64().ok_or_else(|| {
                            TransferError::InvalidRequest(format!("无效 ID: {}", v))
                        })
                    })
                    .collect::<TransferResult<Vec<i64>>>()?;
                Ok(ExportFilter::Ids(ids))
            }
        }
    }
}

/// 查询游标（单任务独占，顺序读取）
pub trait QueryCursor: Send {
    /// 匹配的行数
    fn count(&mut self) -> TransferResult<u64>;

    /// 读取下一个分块（返回空表示读取完毕）
    fn next_chunk(&mut self, max_rows: usize) -> TransferResult<Vec<Value>>;
}

/// 导出器
///
/// 由注册表按键创建；在后台线程中调用，需 Send + Sync
pub trait RowExporter: Send + Sync {
    /// 默认表头（调用方未指定字段时全部导出）
    fn default_headers(&self) -> Vec<String>;

    /// 审核类型（审核策略按此判断是否需要审核）
    fn approval_type(&self) -> String;

    /// 按筛选条件准备查询
    fn prepare_query(&self, filter: &ExportFilter) -> TransferResult<Box<dyn QueryCursor>>;

    /// 源行映射为 表头标签 → 值（管道只取请求的表头）
    fn map_row(&self, row: &Value) -> HashMap<String, CellValue>;
}
