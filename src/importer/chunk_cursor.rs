// ==========================================
// 数据传输系统 - 分块游标
// ==========================================
// 职责: 分块内行号 → 全局行号 → 文件展示行号
// 公式:
//   global_row_index = chunk_offset − heading_rows + in_chunk − 1
//   display_row      = global_row_index + heading_rows
// 说明: chunk_offset 为当前分块首行在文件中的行号（从 1 开始），
//       in_chunk 在每个分块开始时归零，首次 advance 后为 1
// 红线: 单任务内分块严格顺序处理，游标不可跨任务共享
// ==========================================

use crate::error::{TransferError, TransferResult};

/// 模板标题行固定标记
pub const TEMPLATE_MARKER: &str = "导入模板";

/// 单行位置
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RowPosition {
    /// 数据行序号（从 1 开始，不含表头）
    pub global_row_index: u64,
    /// 用户打开源文件时看到的行号
    pub display_row: u64,
}

#[derive(Debug, Clone)]
pub struct ChunkCursor {
    chunk_size: usize,
    heading_rows: u64,
    chunk_offset: u64,
    in_chunk: u64,
    consumed: u64,
}

impl ChunkCursor {
    /// # 参数
    /// - chunk_size: 分块大小（0 按 1 处理）
    /// - heading_rows: 表头行数（1 或 2），任务期间冻结
    pub fn new(chunk_size: usize, heading_rows: u8) -> Self {
        let heading_rows = u64::from(heading_rows.max(1));
        Self {
            chunk_size: chunk_size.max(1),
            heading_rows,
            chunk_offset: heading_rows + 1,
            in_chunk: 0,
            consumed: 0,
        }
    }

    /// 开始新分块: 重新计算分块偏移，分块内计数归零
    pub fn begin_chunk(&mut self) {
        self.chunk_offset = self.heading_rows + 1 + self.consumed;
        self.in_chunk = 0;
    }

    /// 消费一行（每行调用一次，空白行同样消费位置）
    pub fn advance(&mut self) -> TransferResult<RowPosition> {
        if self.in_chunk >= self.chunk_size as u64 {
            return Err(TransferError::ChunkOverflow {
                chunk_size: self.chunk_size,
                rows: self.in_chunk + 1,
            });
        }
        self.in_chunk += 1;
        self.consumed += 1;

        let global_row_index = self.chunk_offset - self.heading_rows + self.in_chunk - 1;
        Ok(RowPosition {
            global_row_index,
            display_row: global_row_index + self.heading_rows,
        })
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub fn heading_rows(&self) -> u8 {
        self.heading_rows as u8
    }

    /// 已消费行数
    pub fn consumed(&self) -> u64 {
        self.consumed
    }
}

/// 根据首行首个单元格判断表头行数
///
/// # 返回
/// - 2: 首格包含系统名称或 "导入模板"（标题行 + 列头行）
/// - 1: 仅列头行
pub fn detect_heading_rows(first_cell: Option<&str>, system_name: Option<&str>) -> u8 {
    let cell = match first_cell.map(|c| c.trim_start_matches('\u{feff}').trim()) {
        Some(c) if !c.is_empty() => c,
        _ => return 1,
    };

    let has_system_name = system_name
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .map(|name| cell.contains(name))
        .unwrap_or(false);

    if has_system_name || cell.contains(TEMPLATE_MARKER) {
        2
    } else {
        1
    }
}
