// ==========================================
// 测试辅助函数
// ==========================================
// 职责: 提供测试所需的数据库初始化、测试文件生成、记录型导入器与计数导出器
// ==========================================

#![allow(dead_code)]

use rusqlite::Connection;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::error::Error;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tabular_transfer::config::TransferSettings;
use tabular_transfer::exporter::{ExportFilter, QueryCursor, RowExporter, SheetFormat};
use tabular_transfer::repository::{SqliteProgressStore, SqliteTaskRecordStore};
use tabular_transfer::{CanonicalRow, CellValue, FieldSpec, FieldType, RowImporter, TransferResult};
use tempfile::TempDir;

/// 创建临时测试数据库并初始化 schema
///
/// # 返回
/// - TempDir: 临时目录（需要保持存活，同时作为存储根目录）
/// - Arc<Mutex<Connection>>: 共享连接
pub fn create_test_db() -> Result<(TempDir, Arc<Mutex<Connection>>), Box<dyn Error>> {
    let dir = TempDir::new()?;
    let db_path = dir.path().join("transfer.db");
    let conn = tabular_transfer::db::open_sqlite_connection(&db_path.to_string_lossy())?;
    tabular_transfer::db::init_schema(&conn)?;
    Ok((dir, Arc::new(Mutex::new(conn))))
}

/// 基于同一连接的任务记录与进度存储
pub fn create_stores(
    conn: &Arc<Mutex<Connection>>,
) -> (Arc<SqliteTaskRecordStore>, Arc<SqliteProgressStore>) {
    (
        Arc::new(SqliteTaskRecordStore::from_connection(conn.clone())),
        Arc::new(SqliteProgressStore::from_connection(conn.clone())),
    )
}

/// 测试用运行参数
pub fn test_settings(root: &Path, chunk_size: usize, format: SheetFormat) -> TransferSettings {
    let mut settings = TransferSettings::with_storage_root(root.join("storage"));
    settings.chunk_size = chunk_size;
    settings.progress_flush_rows = 50;
    settings.export_format = format;
    settings
}

// ==========================================
// 测试文件
// ==========================================

/// 写入测试文件
pub fn write_file(dir: &Path, name: &str, content: &str) -> PathBuf {
    let path = dir.join(name);
    fs::write(&path, content).expect("Failed to write fixture");
    path
}

/// 生成员工 CSV
///
/// # 参数
/// - rows: 数据行数
/// - with_title: 是否带模板标题行（"员工导入模板"）
/// - duplicate_last: 最后一行是否重复第一行
pub fn employees_csv(rows: usize, with_title: bool, duplicate_last: bool) -> String {
    let mut content = String::new();
    if with_title {
        content.push_str("员工导入模板,,\n");
    }
    content.push_str("姓名,部门,年龄\n");
    for i in 1..=rows {
        if duplicate_last && i == rows && rows > 1 {
            content.push_str(&employee_line(1));
        } else {
            content.push_str(&employee_line(i));
        }
    }
    content
}

fn employee_line(i: usize) -> String {
    let dept = if i % 2 == 0 { "研发" } else { "财务" };
    format!("员工{:05},{},{}\n", i, dept, 20 + i % 40)
}

// ==========================================
// RecordingImporter - 记录落库行的导入器
// ==========================================
pub struct RecordingImporter {
    stored: Mutex<Vec<CanonicalRow>>,
    /// 落库回调拒绝的姓名
    reject_name: Option<String>,
}

impl RecordingImporter {
    pub fn new() -> Self {
        Self {
            stored: Mutex::new(Vec::new()),
            reject_name: None,
        }
    }

    pub fn rejecting(name: &str) -> Self {
        Self {
            stored: Mutex::new(Vec::new()),
            reject_name: Some(name.to_string()),
        }
    }

    pub fn stored_count(&self) -> usize {
        self.stored.lock().unwrap().len()
    }

    pub fn stored_names(&self) -> Vec<String> {
        self.stored
            .lock()
            .unwrap()
            .iter()
            .map(|row| row.get("name").map(|v| v.to_display()).unwrap_or_default())
            .collect()
    }
}

impl RowImporter for RecordingImporter {
    fn fields(&self) -> Vec<FieldSpec> {
        vec![
            FieldSpec::new("name", "姓名")
                .with_type(FieldType::String)
                .with_rule("required"),
            FieldSpec::new("dept", "部门").with_type(FieldType::String),
            FieldSpec::new("age", "年龄").with_rule("nullable|integer"),
        ]
    }

    fn store(&self, row: &CanonicalRow, _extra: &Value) -> Result<(), String> {
        let name = row.get("name").map(|v| v.to_display()).unwrap_or_default();
        if self.reject_name.as_deref() == Some(name.as_str()) {
            return Err(format!("{} 已存在", name));
        }
        self.stored.lock().unwrap().push(row.clone());
        Ok(())
    }
}

// ==========================================
// CountingExporter - 统计查询次数的导出器
// ==========================================
pub struct CountingExporter {
    rows: usize,
    queries: AtomicUsize,
    /// 首次读取分块时失败（模拟物化中途出错）
    fail_next_read: Arc<AtomicBool>,
    /// 首次读取分块前暂停（模拟物化进行中）
    pause: Option<Arc<ReadPause>>,
}

struct ReadPause {
    entered: Mutex<Sender<()>>,
    release: Mutex<Receiver<()>>,
}

/// 暂停控制: 等待导出进入读取阶段，再放行
pub struct PauseHandle {
    entered: Receiver<()>,
    release: Sender<()>,
}

impl PauseHandle {
    pub fn wait_entered(&self) {
        self.entered
            .recv_timeout(Duration::from_secs(10))
            .expect("Export should reach the first read");
    }

    pub fn release(&self) {
        self.release.send(()).expect("Paused export should be waiting");
    }
}

impl CountingExporter {
    pub fn new(rows: usize) -> Self {
        Self {
            rows,
            queries: AtomicUsize::new(0),
            fail_next_read: Arc::new(AtomicBool::new(false)),
            pause: None,
        }
    }

    pub fn paused(rows: usize) -> (Self, PauseHandle) {
        let (entered_tx, entered_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel();
        let mut exporter = Self::new(rows);
        exporter.pause = Some(Arc::new(ReadPause {
            entered: Mutex::new(entered_tx),
            release: Mutex::new(release_rx),
        }));
        (
            exporter,
            PauseHandle {
                entered: entered_rx,
                release: release_tx,
            },
        )
    }

    pub fn failing_once(rows: usize) -> Self {
        let exporter = Self::new(rows);
        exporter.fail_next_read.store(true, Ordering::SeqCst);
        exporter
    }

    pub fn query_count(&self) -> usize {
        self.queries.load(Ordering::SeqCst)
    }
}

impl RowExporter for CountingExporter {
    fn default_headers(&self) -> Vec<String> {
        vec!["编号".to_string(), "名称".to_string(), "数量".to_string()]
    }

    fn approval_type(&self) -> String {
        "items".to_string()
    }

    fn prepare_query(&self, filter: &ExportFilter) -> TransferResult<Box<dyn QueryCursor>> {
        self.queries.fetch_add(1, Ordering::SeqCst);
        let ids: Vec<i64> = match filter {
            ExportFilter::Ids(ids) => ids.clone(),
            _ => (1..=self.rows as i64).collect(),
        };
        Ok(Box::new(ItemCursor {
            rows: ids
                .into_iter()
                .map(|id| json!({"id": id, "name": format!("item-{}", id), "qty": id * 10}))
                .collect(),
            fail_next_read: self.fail_next_read.clone(),
            pause: self.pause.clone(),
        }))
    }

    fn map_row(&self, row: &Value) -> HashMap<String, CellValue> {
        let mut out = HashMap::new();
        out.insert(
            "编号".to_string(),
            row["id"].as_i64().map(CellValue::Int).unwrap_or(CellValue::Empty),
        );
        out.insert(
            "名称".to_string(),
            CellValue::from(row["name"].as_str().unwrap_or_default()),
        );
        out.insert(
            "数量".to_string(),
            row["qty"].as_i64().map(CellValue::Int).unwrap_or(CellValue::Empty),
        );
        out
    }
}

struct ItemCursor {
    rows: Vec<Value>,
    fail_next_read: Arc<AtomicBool>,
    pause: Option<Arc<ReadPause>>,
}

impl QueryCursor for ItemCursor {
    fn count(&mut self) -> TransferResult<u64> {
        Ok(self.rows.len() as u64)
    }

    fn next_chunk(&mut self, max_rows: usize) -> TransferResult<Vec<Value>> {
        if let Some(pause) = self.pause.take() {
            pause.entered.lock().unwrap().send(()).unwrap();
            pause.release.lock().unwrap().recv().unwrap();
        }
        if self.fail_next_read.swap(false, Ordering::SeqCst) {
            return Err(tabular_transfer::TransferError::InternalError(
                "数据源连接中断".to_string(),
            ));
        }
        let n = max_rows.min(self.rows.len());
        Ok(self.rows.drain(..n).collect())
    }
}
