// ==========================================
// 数据传输系统 - 错误收集器
// ==========================================
// 职责: 累积失败行（展示行号 + 原因 + 原始内容），任务完成时生成错误报告
// 格式: UTF-8 CSV（带 BOM，便于表格软件直接打开）
// 说明:
// - 首条错误出现时才创建文件，无错误则不产生报告
// - 写入 `.part` 临时文件，finish 时重命名为正式文件
// - 未 finish 即被丢弃（任务失败）时删除临时文件
// ==========================================

use crate::error::{TransferError, TransferResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::{debug, warn};

/// UTF-8 BOM
pub const UTF8_BOM: &[u8] = b"\xEF\xBB\xBF";

/// 回显布局的原因列标题
pub const ECHO_REASON_HEADER: &str = "数据异常原因（请调整后重新上传本文件）";

// ==========================================
// ReportLayout - 报告布局
// ==========================================
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportLayout {
    /// [行号, 原因]
    RowNumber,
    /// [原因, 原始列...]，用户修改后可直接重新上传
    ContentEcho,
}

impl ReportLayout {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReportLayout::RowNumber => "row_number",
            ReportLayout::ContentEcho => "content_echo",
        }
    }
}

impl fmt::Display for ReportLayout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ReportLayout {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "row_number" => Ok(ReportLayout::RowNumber),
            "content_echo" => Ok(ReportLayout::ContentEcho),
            other => Err(format!("未知错误报告布局: {}", other)),
        }
    }
}

/// 单条行级错误（追加后不再修改）
#[derive(Debug, Clone, PartialEq)]
pub struct ErrorEntry {
    pub display_row: u64,
    pub reason: String,
    /// 按列头顺序的原始展示值
    pub original: Vec<String>,
}

pub struct ErrorCollector {
    layout: ReportLayout,
    headers: Vec<String>,
    target: PathBuf,
    part: PathBuf,
    writer: Option<csv::Writer<File>>,
    error_rows: u64,
}

impl ErrorCollector {
    /// # 参数
    /// - target: 报告最终路径（目录按需创建）
    /// - headers: 源文件列头（回显布局使用）
    pub fn new(layout: ReportLayout, target: impl Into<PathBuf>, headers: Vec<String>) -> Self {
        let target = target.into();
        let mut part = target.clone().into_os_string();
        part.push(".part");

        Self {
            layout,
            headers,
            target,
            part: PathBuf::from(part),
            writer: None,
            error_rows: 0,
        }
    }

    /// 追加一条错误
    pub fn push(&mut self, entry: ErrorEntry) -> TransferResult<()> {
        if self.writer.is_none() {
            self.writer = Some(self.open()?);
        }

        let record: Vec<String> = match self.layout {
            ReportLayout::RowNumber => vec![entry.display_row.to_string(), entry.reason],
            ReportLayout::ContentEcho => {
                let mut record = Vec::with_capacity(self.headers.len() + 1);
                record.push(entry.reason);
                record.extend(entry.original);
                record.resize(self.headers.len() + 1, String::new());
                record
            }
        };

        if let Some(writer) = self.writer.as_mut() {
            writer.write_record(&record)?;
        }
        self.error_rows += 1;
        Ok(())
    }

    pub fn error_rows(&self) -> u64 {
        self.error_rows
    }

    pub fn has_errors(&self) -> bool {
        self.error_rows > 0
    }

    /// 完成报告
    ///
    /// # 返回
    /// - None: 无错误行，不生成文件
    /// - Some(path): 报告路径
    pub fn finish(&mut self) -> TransferResult<Option<PathBuf>> {
        let writer = match self.writer.take() {
            Some(w) => w,
            None => return Ok(None),
        };

        let mut file = writer
            .into_inner()
            .map_err(|e| TransferError::FileWriteError(e.to_string()))?;
        file.flush()
            .map_err(|e| TransferError::FileWriteError(e.to_string()))?;
        drop(file);

        fs::rename(&self.part, &self.target)
            .map_err(|e| TransferError::FileWriteError(e.to_string()))?;
        debug!(path = %self.target.display(), rows = self.error_rows, "错误报告已生成");
        Ok(Some(self.target.clone()))
    }

    fn open(&self) -> TransferResult<csv::Writer<File>> {
        if let Some(dir) = self.target.parent() {
            fs::create_dir_all(dir).map_err(|e| TransferError::FileWriteError(e.to_string()))?;
        }

        let mut file =
            File::create(&self.part).map_err(|e| TransferError::FileWriteError(e.to_string()))?;
        file.write_all(UTF8_BOM)
            .map_err(|e| TransferError::FileWriteError(e.to_string()))?;

        let mut writer = csv::WriterBuilder::new().flexible(false).from_writer(file);
        match self.layout {
            ReportLayout::RowNumber => writer.write_record(["行号", "原因"])?,
            ReportLayout::ContentEcho => {
                let mut header = vec![ECHO_REASON_HEADER.to_string()];
                header.extend(self.headers.iter().cloned());
                writer.write_record(&header)?;
            }
        }
        Ok(writer)
    }

    pub fn target(&self) -> &Path {
        &self.target
    }
}

impl Drop for ErrorCollector {
    fn drop(&mut self) {
        if self.writer.take().is_some() {
            if let Err(e) = fs::remove_file(&self.part) {
                warn!(path = %self.part.display(), error = %e, "删除未完成的错误报告失败");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn entry(row: u64, reason: &str, original: Vec<&str>) -> ErrorEntry {
        ErrorEntry {
            display_row: row,
            reason: reason.to_string(),
            original: original.into_iter().map(String::from).collect(),
        }
    }

    #[test]
    fn test_no_errors_no_file() {
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("report.csv");
        let mut collector = ErrorCollector::new(ReportLayout::RowNumber, &target, vec![]);

        assert_eq!(collector.finish().unwrap(), None);
        assert!(!target.exists());
    }

    #[test]
    fn test_row_number_layout() {
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("nested").join("report.csv");
        let mut collector = ErrorCollector::new(ReportLayout::RowNumber, &target, vec![]);

        collector.push(entry(12, "重复数据", vec!["a"])).unwrap();
        collector.push(entry(15, "姓名不能为空", vec![""])).unwrap();
        let path = collector.finish().unwrap().unwrap();

        let bytes = fs::read(&path).unwrap();
        assert!(bytes.starts_with(UTF8_BOM));
        let text = String::from_utf8(bytes[3..].to_vec()).unwrap();
        assert_eq!(text, "行号,原因\n12,重复数据\n15,姓名不能为空\n");
        assert_eq!(collector.error_rows(), 2);
    }

    #[test]
    fn test_content_echo_layout_pads_columns() {
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("report.csv");
        let headers = vec!["姓名".to_string(), "工号".to_string()];
        let mut collector = ErrorCollector::new(ReportLayout::ContentEcho, &target, headers);

        collector.push(entry(3, "工号不能为空", vec!["张三"])).unwrap();
        collector.finish().unwrap();

        let text = fs::read_to_string(&target).unwrap();
        let mut lines = text.trim_start_matches('\u{feff}').lines();
        assert_eq!(lines.next(), Some("数据异常原因（请调整后重新上传本文件）,姓名,工号"));
        assert_eq!(lines.next(), Some("工号不能为空,张三,"));
    }

    #[test]
    fn test_dropped_collector_removes_part_file() {
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("report.csv");
        {
            let mut collector = ErrorCollector::new(ReportLayout::RowNumber, &target, vec![]);
            collector.push(entry(2, "x", vec![])).unwrap();
            assert!(dir.path().join("report.csv.part").exists());
        }
        assert!(!dir.path().join("report.csv.part").exists());
        assert!(!target.exists());
    }
}
