// ==========================================
// 数据传输系统 - 传输配置读取 Trait
// ==========================================
// 职责: 定义管道所需的配置读取接口（不包含实现）
// 红线: 不包含配置写入、不包含业务逻辑
// ==========================================

use crate::config::transfer_settings::TransferSettings;
use crate::exporter::sheet_writer::SheetFormat;
use crate::importer::error_collector::ReportLayout;
use crate::repository::error::RepositoryResult;
use async_trait::async_trait;
use std::path::PathBuf;

// ==========================================
// TransferConfigReader Trait
// ==========================================
// 实现者: ConfigManager（从 config_kv 表读取）
#[async_trait]
pub trait TransferConfigReader: Send + Sync {
    /// 获取分块大小
    ///
    /// # 默认值
    /// - 1000
    async fn get_chunk_size(&self) -> RepositoryResult<usize>;

    /// 获取完成后进度保留秒数
    ///
    /// # 默认值
    /// - 60
    async fn get_progress_ttl_secs(&self) -> RepositoryResult<u64>;

    /// 获取进度写入间隔（行）
    ///
    /// # 默认值
    /// - 1（逐行写入）
    async fn get_progress_flush_rows(&self) -> RepositoryResult<u64>;

    /// 获取模板标题行中的系统名称标记
    ///
    /// # 返回
    /// - None: 仅识别 "导入模板"
    async fn get_system_name(&self) -> RepositoryResult<Option<String>>;

    /// 获取文件存储根目录
    ///
    /// # 默认值
    /// - ./storage
    async fn get_storage_root(&self) -> RepositoryResult<PathBuf>;

    /// 获取导出文件格式
    ///
    /// # 默认值
    /// - xlsx
    async fn get_export_format(&self) -> RepositoryResult<SheetFormat>;

    /// 获取错误报告布局
    ///
    /// # 默认值
    /// - content_echo（原因 + 原始列）
    async fn get_report_layout(&self) -> RepositoryResult<ReportLayout>;

    /// 一次性读取完整运行参数
    async fn load_settings(&self) -> RepositoryResult<TransferSettings> {
        Ok(TransferSettings {
            chunk_size: self.get_chunk_size().await?,
            progress_ttl_secs: self.get_progress_ttl_secs().await?,
            progress_flush_rows: self.get_progress_flush_rows().await?,
            system_name: self.get_system_name().await?,
            storage_root: self.get_storage_root().await?,
            export_format: self.get_export_format().await?,
            report_layout: self.get_report_layout().await?,
        })
    }
}
