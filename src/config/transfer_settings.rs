// ==========================================
// 数据传输系统 - 管道运行参数
// ==========================================

use crate::exporter::sheet_writer::SheetFormat;
use crate::importer::error_collector::ReportLayout;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// 默认分块大小（越大内存占用越高）
pub const DEFAULT_CHUNK_SIZE: usize = 1000;

/// 默认完成后进度保留窗口（秒）
pub const DEFAULT_PROGRESS_TTL_SECS: u64 = 60;

/// 管道运行参数（任务开始时读取一次，任务期间不变）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferSettings {
    pub chunk_size: usize,
    pub progress_ttl_secs: u64,
    /// 每处理多少行写一次进度（分块结束时总会写入）
    pub progress_flush_rows: u64,
    /// 模板标题行中的系统名称标记
    pub system_name: Option<String>,
    pub storage_root: PathBuf,
    pub export_format: SheetFormat,
    pub report_layout: ReportLayout,
}

impl Default for TransferSettings {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            progress_ttl_secs: DEFAULT_PROGRESS_TTL_SECS,
            progress_flush_rows: 1,
            system_name: None,
            storage_root: PathBuf::from("storage"),
            export_format: SheetFormat::Xlsx,
            report_layout: ReportLayout::ContentEcho,
        }
    }
}

impl TransferSettings {
    /// 以指定存储根目录构造（其余取默认值）
    pub fn with_storage_root(storage_root: impl Into<PathBuf>) -> Self {
        Self {
            storage_root: storage_root.into(),
            ..Self::default()
        }
    }

    pub fn progress_ttl(&self) -> Duration {
        Duration::from_secs(self.progress_ttl_secs)
    }

    /// 上传文件暂存目录
    pub fn import_dir(&self) -> PathBuf {
        self.storage_root.join("import")
    }

    /// 导出文件目录
    pub fn export_dir(&self) -> PathBuf {
        self.storage_root.join("export")
    }

    /// 错误报告目录
    pub fn report_dir(&self) -> PathBuf {
        self.storage_root.join("report")
    }
}
