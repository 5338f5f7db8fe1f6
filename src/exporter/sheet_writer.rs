// ==========================================
// 数据传输系统 - 导出文件写入
// ==========================================
// 职责: 将导出行写入 XLSX（加粗表头）或 CSV（带 BOM）
// 说明: 调用方写入 `.part` 临时路径，finish 成功后再重命名
// ==========================================

use crate::domain::field::CellValue;
use crate::error::{TransferError, TransferResult};
use crate::importer::error_collector::UTF8_BOM;
use rust_xlsxwriter::{Format, Workbook};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// 大于该值的整数在 XLSX 中按文本写入（f64 精度上限 2^53）
const MAX_EXACT_INTEGER: u64 = 1 << 53;

// ==========================================
// SheetFormat - 导出文件格式
// ==========================================
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SheetFormat {
    Xlsx,
    Csv,
}

impl SheetFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            SheetFormat::Xlsx => "xlsx",
            SheetFormat::Csv => "csv",
        }
    }
}

impl fmt::Display for SheetFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

impl FromStr for SheetFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "xlsx" => Ok(SheetFormat::Xlsx),
            "csv" => Ok(SheetFormat::Csv),
            other => Err(format!("未知导出格式: {}", other)),
        }
    }
}

// ==========================================
// SheetWriter Trait
// ==========================================
pub trait SheetWriter: Send {
    /// 追加一行（按表头顺序）
    fn write_row(&mut self, values: &[CellValue]) -> TransferResult<()>;

    /// 写入完成，落盘
    fn finish(self: Box<Self>) -> TransferResult<()>;
}

/// 创建写入器并写入表头
pub fn create_sheet_writer(
    format: SheetFormat,
    path: &Path,
    headers: &[String],
) -> TransferResult<Box<dyn SheetWriter>> {
    match format {
        SheetFormat::Csv => Ok(Box::new(CsvSheetWriter::create(path, headers)?)),
        SheetFormat::Xlsx => Ok(Box::new(XlsxSheetWriter::create(path, headers)?)),
    }
}

// ==========================================
// CSV
// ==========================================
pub struct CsvSheetWriter {
    writer: csv::Writer<File>,
}

impl CsvSheetWriter {
    pub fn create(path: &Path, headers: &[String]) -> TransferResult<Self> {
        let mut file = File::create(path).map_err(|e| TransferError::FileWriteError(e.to_string()))?;
        file.write_all(UTF8_BOM)
            .map_err(|e| TransferError::FileWriteError(e.to_string()))?;

        let mut writer = csv::Writer::from_writer(file);
        writer.write_record(headers)?;
        Ok(Self { writer })
    }
}

impl SheetWriter for CsvSheetWriter {
    fn write_row(&mut self, values: &[CellValue]) -> TransferResult<()> {
        self.writer
            .write_record(values.iter().map(CellValue::to_display))?;
        Ok(())
    }

    fn finish(mut self: Box<Self>) -> TransferResult<()> {
        self.writer
            .flush()
            .map_err(|e| TransferError::FileWriteError(e.to_string()))
    }
}

// ==========================================
// XLSX
// ==========================================
// 常量内存模式: 每行写出后即落入临时文件，内存占用与总行数无关，
// 行必须按顺序写入
pub struct XlsxSheetWriter {
    path: PathBuf,
    workbook: Workbook,
    next_row: u32,
}

impl XlsxSheetWriter {
    pub fn create(path: &Path, headers: &[String]) -> TransferResult<Self> {
        let mut workbook = Workbook::new();
        let bold = Format::new().set_bold();

        let worksheet = workbook.add_worksheet_with_constant_memory();
        for (col, header) in headers.iter().enumerate() {
            worksheet.write_string_with_format(0, column(col)?, header.as_str(), &bold)?;
        }

        Ok(Self {
            path: path.to_path_buf(),
            workbook,
            next_row: 1,
        })
    }
}

fn column(index: usize) -> TransferResult<u16> {
    u16::try_from(index)
        .map_err(|_| TransferError::FileWriteError(format!("列数超出上限: {}", index + 1)))
}

impl SheetWriter for XlsxSheetWriter {
    fn write_row(&mut self, values: &[CellValue]) -> TransferResult<()> {
        let row = self.next_row;
        let worksheet = self.workbook.worksheet_from_index(0)?;

        for (index, value) in values.iter().enumerate() {
            let col = column(index)?;
            match value {
                CellValue::Empty => {}
                CellValue::Int(v) if v.unsigned_abs() <= MAX_EXACT_INTEGER => {
                    worksheet.write_number(row, col, *v as f64)?;
                }
                CellValue::Float(v) if v.is_finite() => {
                    worksheet.write_number(row, col, *v)?;
                }
                CellValue::Bool(v) => {
                    worksheet.write_boolean(row, col, *v)?;
                }
                other => {
                    worksheet.write_string(row, col, other.to_display().as_str())?;
                }
            }
        }

        self.next_row += 1;
        Ok(())
    }

    fn finish(mut self: Box<Self>) -> TransferResult<()> {
        let path = self.path.clone();
        self.workbook.save(&path)?;
        Ok(())
    }
}
