// ==========================================
// 数据传输系统 - 文件解析器（分块行源）
// ==========================================
// 支持: CSV (.csv) / Excel (.xlsx/.xlsm/.xls/.ods)
// 职责:
// - 读取首行首格（表头行数检测）与列头
// - 统计数据行总数（在读取第一个分块之前）
// - 按分块顺序产出原始行
// 说明:
// - CSV 与 .xlsx 两遍读取: 第一遍只计数，第二遍流式读取，内存占用与分块大小相关
// - .xls/.ods 无流式接口，由 calamine 载入工作表区域
// - 行号按工作表绝对行计算，首个非空单元格之前的空行/空列同样占位
// ==========================================

use crate::domain::field::{CellValue, RawRow};
use crate::error::{TransferError, TransferResult};
use crate::importer::field_mapper::excel_serial_to_datetime;
use calamine::{open_workbook, open_workbook_auto, Data, Range, Reader, Xlsx};
use csv::{ReaderBuilder, StringRecord, StringRecordsIntoIter};
use std::fs::File;
use std::path::Path;
use std::sync::mpsc::{self, Receiver};
use std::thread;

/// .xlsx 流式读取时读取线程领先消费方的最大行数
const XLSX_BUFFER_ROWS: usize = 2048;

// ==========================================
// RowSource - 分块行源
// ==========================================
pub trait RowSource: Send {
    /// 列头（表头区最后一行）
    fn headers(&self) -> &[String];

    /// 数据行总数（不含表头区）
    fn total_rows(&self) -> u64;

    /// 读取下一个分块（最多 max_rows 行；返回空表示读取完毕）
    fn next_chunk(&mut self, max_rows: usize) -> TransferResult<Vec<RawRow>>;
}

/// 源文件类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    Csv,
    /// .xlsx/.xlsm（流式读取）
    Xlsx,
    /// .xls/.ods（整表载入）
    Excel,
}

impl SourceKind {
    pub fn from_path(path: &Path) -> TransferResult<Self> {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("")
            .to_lowercase();

        match ext.as_str() {
            "csv" => Ok(SourceKind::Csv),
            "xlsx" | "xlsm" => Ok(SourceKind::Xlsx),
            "xls" | "ods" => Ok(SourceKind::Excel),
            _ => Err(TransferError::UnsupportedFormat(ext)),
        }
    }
}

/// 检查文件存在并识别类型
fn check_source(path: &Path) -> TransferResult<SourceKind> {
    if !path.exists() {
        return Err(TransferError::FileNotFound(path.display().to_string()));
    }
    SourceKind::from_path(path)
}

/// 读取首行首格（用于检测模板标题行）
pub fn read_first_cell(path: &Path) -> TransferResult<Option<String>> {
    let rows = read_leading_rows(path, 1)?;
    Ok(rows
        .into_iter()
        .next()
        .and_then(|row| row.into_iter().next())
        .map(|cell| clean_header(&cell)))
}

/// 读取列头（第 heading_rows 行）
pub fn read_headers(path: &Path, heading_rows: u8) -> TransferResult<Vec<String>> {
    let n = usize::from(heading_rows.max(1));
    let rows = read_leading_rows(path, n)?;
    Ok(rows
        .into_iter()
        .nth(n - 1)
        .map(|row| trim_trailing_empty(row.iter().map(|c| clean_header(c)).collect()))
        .unwrap_or_default())
}

/// 打开分块行源
pub fn open_row_source(path: &Path, heading_rows: u8) -> TransferResult<Box<dyn RowSource>> {
    match check_source(path)? {
        SourceKind::Csv => Ok(Box::new(CsvRowSource::open(path, heading_rows)?)),
        SourceKind::Xlsx => Ok(Box::new(XlsxRowSource::open(path, heading_rows)?)),
        SourceKind::Excel => Ok(Box::new(ExcelRowSource::open(path, heading_rows)?)),
    }
}

fn read_leading_rows(path: &Path, n: usize) -> TransferResult<Vec<Vec<String>>> {
    match check_source(path)? {
        SourceKind::Csv => {
            let mut reader = csv_reader(path)?;
            let mut rows = Vec::with_capacity(n);
            for record in reader.records().take(n) {
                rows.push(record?.iter().map(str::to_string).collect());
            }
            Ok(rows)
        }
        SourceKind::Xlsx => {
            let mut rows = Vec::with_capacity(n);
            for_each_xlsx_row(path, |row| {
                rows.push(row.iter().map(CellValue::to_display).collect());
                rows.len() < n
            })?;
            Ok(rows)
        }
        SourceKind::Excel => {
            let sheet = SheetRows::new(first_sheet(path)?);
            Ok((0..n)
                .map_while(|i| sheet.row(i))
                .map(|row| row.iter().map(CellValue::to_display).collect())
                .collect())
        }
    }
}

fn clean_header(cell: &str) -> String {
    cell.trim_start_matches('\u{feff}').trim().to_string()
}

fn trim_trailing_empty(mut headers: Vec<String>) -> Vec<String> {
    while headers.last().map(|h| h.is_empty()).unwrap_or(false) {
        headers.pop();
    }
    headers
}

fn csv_reader(path: &Path) -> TransferResult<csv::Reader<File>> {
    let file = File::open(path)?;
    Ok(ReaderBuilder::new()
        .has_headers(false)
        .flexible(true) // 允许行长度不一致
        .from_reader(file))
}

// ==========================================
// CSV 行源
// ==========================================
pub struct CsvRowSource {
    headers: Vec<String>,
    total_rows: u64,
    records: StringRecordsIntoIter<File>,
}

impl CsvRowSource {
    pub fn open(path: &Path, heading_rows: u8) -> TransferResult<Self> {
        let heading_rows = usize::from(heading_rows.max(1));

        // 第一遍: 统计记录数
        let mut counter = csv_reader(path)?;
        let mut record = StringRecord::new();
        let mut count: u64 = 0;
        while counter.read_record(&mut record)? {
            count += 1;
        }

        // 第二遍: 跳过表头区，保留列头
        let mut records = csv_reader(path)?.into_records();
        let mut headers = Vec::new();
        for _ in 0..heading_rows {
            match records.next() {
                Some(r) => headers = r?.iter().map(clean_header).collect(),
                None => break,
            }
        }

        Ok(Self {
            headers: trim_trailing_empty(headers),
            total_rows: count.saturating_sub(heading_rows as u64),
            records,
        })
    }
}

impl RowSource for CsvRowSource {
    fn headers(&self) -> &[String] {
        &self.headers
    }

    fn total_rows(&self) -> u64 {
        self.total_rows
    }

    fn next_chunk(&mut self, max_rows: usize) -> TransferResult<Vec<RawRow>> {
        let mut chunk = Vec::with_capacity(max_rows.min(4096));
        while chunk.len() < max_rows {
            match self.records.next() {
                Some(record) => {
                    let values = record?.iter().map(|v| CellValue::from(v.trim())).collect();
                    chunk.push(RawRow::from_headers(&self.headers, values));
                }
                None => break,
            }
        }
        Ok(chunk)
    }
}

// ==========================================
// .xlsx 流式行源
// ==========================================
/// 按绝对行号顺序逐行回调（首行为工作表第 1 行，中间的空行补为空行）
///
/// visit 返回 false 时提前结束
fn for_each_xlsx_row<F>(path: &Path, mut visit: F) -> TransferResult<()>
where
    F: FnMut(Vec<CellValue>) -> bool,
{
    let mut workbook: Xlsx<_> = open_workbook(path)?;
    let sheet = workbook
        .sheet_names()
        .into_iter()
        .next()
        .ok_or_else(|| TransferError::ExcelParseError("Excel 文件无工作表".to_string()))?;
    let mut cells = workbook.worksheet_cells_reader(&sheet)?;

    let mut current: Vec<CellValue> = Vec::new();
    let mut current_row: u32 = 0;
    while let Some(cell) = cells.next_cell()? {
        let value = cell_value(&Data::from(cell.get_value().clone()));
        if value.is_empty() {
            continue;
        }

        let (row, col) = cell.get_position();
        while current_row < row {
            if !visit(std::mem::take(&mut current)) {
                return Ok(());
            }
            current_row += 1;
        }

        let col = col as usize;
        if current.len() <= col {
            current.resize(col + 1, CellValue::Empty);
        }
        current[col] = value;
    }

    if !current.is_empty() {
        visit(current);
    }
    Ok(())
}

pub struct XlsxRowSource {
    headers: Vec<String>,
    total_rows: u64,
    rows: Receiver<TransferResult<Vec<CellValue>>>,
}

impl XlsxRowSource {
    pub fn open(path: &Path, heading_rows: u8) -> TransferResult<Self> {
        let heading_rows = usize::from(heading_rows.max(1));

        // 第一遍: 统计行数
        let mut count: u64 = 0;
        for_each_xlsx_row(path, |_| {
            count += 1;
            true
        })?;

        // 第二遍: 读取线程经有界通道逐行送出；行源被丢弃后发送失败，线程随之退出
        let (sender, rows) = mpsc::sync_channel(XLSX_BUFFER_ROWS);
        let owned = path.to_path_buf();
        thread::Builder::new()
            .name("xlsx-reader".to_string())
            .spawn(move || {
                if let Err(e) = for_each_xlsx_row(&owned, |row| sender.send(Ok(row)).is_ok()) {
                    let _ = sender.send(Err(e));
                }
            })
            .map_err(|e| TransferError::InternalError(e.to_string()))?;

        let mut source = Self {
            headers: Vec::new(),
            total_rows: count.saturating_sub(heading_rows as u64),
            rows,
        };

        let mut headers = Vec::new();
        for _ in 0..heading_rows {
            match source.recv()? {
                Some(row) => headers = row,
                None => break,
            }
        }
        source.headers = trim_trailing_empty(
            headers
                .iter()
                .map(|c| clean_header(&c.to_display()))
                .collect(),
        );
        Ok(source)
    }

    fn recv(&self) -> TransferResult<Option<Vec<CellValue>>> {
        match self.rows.recv() {
            Ok(Ok(row)) => Ok(Some(row)),
            Ok(Err(e)) => Err(e),
            Err(_) => Ok(None),
        }
    }
}

impl RowSource for XlsxRowSource {
    fn headers(&self) -> &[String] {
        &self.headers
    }

    fn total_rows(&self) -> u64 {
        self.total_rows
    }

    fn next_chunk(&mut self, max_rows: usize) -> TransferResult<Vec<RawRow>> {
        let mut chunk = Vec::with_capacity(max_rows.min(4096));
        while chunk.len() < max_rows {
            match self.recv()? {
                Some(values) => chunk.push(RawRow::from_headers(&self.headers, values)),
                None => break,
            }
        }
        Ok(chunk)
    }
}

// ==========================================
// .xls/.ods 行源
// ==========================================
/// 工作表区域按绝对行列访问
///
/// calamine 的区域从首个非空单元格开始，之前的行/列需补齐
struct SheetRows {
    range: Range<Data>,
    start_row: usize,
    start_col: usize,
}

impl SheetRows {
    fn new(range: Range<Data>) -> Self {
        let (start_row, start_col) = range
            .start()
            .map(|(r, c)| (r as usize, c as usize))
            .unwrap_or((0, 0));
        Self {
            range,
            start_row,
            start_col,
        }
    }

    /// 工作表总行数（含区域之前的空行）
    fn len(&self) -> usize {
        match self.range.height() {
            0 => 0,
            height => self.start_row + height,
        }
    }

    /// 第 index 行（从 0 开始）；越界返回 None
    fn row(&self, index: usize) -> Option<Vec<CellValue>> {
        if index >= self.len() {
            return None;
        }
        if index < self.start_row {
            return Some(Vec::new());
        }

        let relative = index - self.start_row;
        let mut values = vec![CellValue::Empty; self.start_col];
        values.extend((0..self.range.width()).map(|col| {
            self.range
                .get((relative, col))
                .map(cell_value)
                .unwrap_or(CellValue::Empty)
        }));
        Some(values)
    }
}

pub struct ExcelRowSource {
    headers: Vec<String>,
    total_rows: u64,
    sheet: SheetRows,
    /// 下一个待读取的行（工作表绝对行，从 0 开始）
    next_row: usize,
}

fn first_sheet(path: &Path) -> TransferResult<Range<Data>> {
    let mut workbook = open_workbook_auto(path)?;
    workbook
        .worksheet_range_at(0)
        .ok_or_else(|| TransferError::ExcelParseError("Excel 文件无工作表".to_string()))?
        .map_err(TransferError::from)
}

impl ExcelRowSource {
    pub fn open(path: &Path, heading_rows: u8) -> TransferResult<Self> {
        let heading_rows = usize::from(heading_rows.max(1));
        let sheet = SheetRows::new(first_sheet(path)?);

        let headers = sheet
            .row(heading_rows - 1)
            .map(|row| row.iter().map(|c| clean_header(&c.to_display())).collect())
            .unwrap_or_default();

        Ok(Self {
            headers: trim_trailing_empty(headers),
            total_rows: sheet.len().saturating_sub(heading_rows) as u64,
            sheet,
            next_row: heading_rows,
        })
    }
}

impl RowSource for ExcelRowSource {
    fn headers(&self) -> &[String] {
        &self.headers
    }

    fn total_rows(&self) -> u64 {
        self.total_rows
    }

    fn next_chunk(&mut self, max_rows: usize) -> TransferResult<Vec<RawRow>> {
        let mut chunk = Vec::with_capacity(max_rows.min(4096));
        while chunk.len() < max_rows {
            match self.sheet.row(self.next_row) {
                Some(values) => chunk.push(RawRow::from_headers(&self.headers, values)),
                None => break,
            }
            self.next_row += 1;
        }
        Ok(chunk)
    }
}

/// calamine 单元格 → CellValue
fn cell_value(cell: &Data) -> CellValue {
    match cell {
        Data::Empty => CellValue::Empty,
        Data::String(s) => CellValue::from(s.trim()),
        Data::Int(i) => CellValue::Int(*i),
        Data::Float(f) => CellValue::Float(*f),
        Data::Bool(b) => CellValue::Bool(*b),
        Data::DateTime(dt) => excel_serial_to_datetime(dt.as_f64())
            .map(CellValue::DateTime)
            .unwrap_or(CellValue::Float(dt.as_f64())),
        Data::DateTimeIso(s) | Data::DurationIso(s) => CellValue::from(s.as_str()),
        Data::Error(_) => CellValue::Empty,
    }
}
