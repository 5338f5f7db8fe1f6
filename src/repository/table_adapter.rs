// ==========================================
// 数据传输系统 - SQLite 表适配器
// ==========================================
// 职责: 以任意 SQLite 表作为导入目标/导出来源
// - SqliteTableImporter: 落库回调 = INSERT 到指定表
// - SqliteTableExporter: 查询提供者，支持全量 / ID 列表 / 等值筛选
// 约束:
// - 表名、列名只允许 [A-Za-z0-9_] 且不以数字开头，拼接前校验
// - 值一律参数化
// ==========================================

use crate::domain::field::{CanonicalRow, CellValue, FieldSpec, FieldType};
use crate::error::{TransferError, TransferResult};
use crate::exporter::exporter_trait::{ExportFilter, QueryCursor, RowExporter};
use crate::importer::importer_trait::RowImporter;
use crate::repository::error::{RepositoryError, RepositoryResult};
use rusqlite::types::{Value as SqlValue, ValueRef};
use rusqlite::{params_from_iter, Connection};
use serde_json::{Map, Number, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

/// 表列信息（PRAGMA table_info）
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnInfo {
    pub name: String,
    pub declared_type: String,
    pub not_null: bool,
    pub has_default: bool,
    pub primary_key: bool,
}

impl ColumnInfo {
    /// INTEGER PRIMARY KEY 列（rowid 别名，插入时自动生成）
    fn is_rowid_alias(&self) -> bool {
        self.primary_key && self.declared_type.eq_ignore_ascii_case("INTEGER")
    }

    fn field_type(&self) -> Option<FieldType> {
        let t = self.declared_type.to_uppercase();
        if t.contains("DATE") {
            Some(FieldType::Date)
        } else if ["INT", "REAL", "NUM", "FLOA", "DOUB"]
            .iter()
            .any(|k| t.contains(k))
        {
            Some(FieldType::Number)
        } else if t.contains("CHAR") || t.contains("TEXT") || t.contains("CLOB") {
            Some(FieldType::String)
        } else {
            None
        }
    }
}

fn check_identifier(name: &str) -> RepositoryResult<()> {
    let mut chars = name.chars();
    let valid = match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {
            chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        }
        _ => false,
    };

    if valid {
        Ok(())
    } else {
        Err(RepositoryError::FieldValueError {
            field: name.to_string(),
            message: "标识符只允许字母、数字与下划线".to_string(),
        })
    }
}

fn lock(conn: &Mutex<Connection>) -> RepositoryResult<MutexGuard<'_, Connection>> {
    conn.lock()
        .map_err(|e| RepositoryError::LockError(e.to_string()))
}

/// 读取表结构（表不存在返回 NotFound）
pub fn table_columns(conn: &Connection, table: &str) -> RepositoryResult<Vec<ColumnInfo>> {
    check_identifier(table)?;

    let mut stmt = conn.prepare(&format!("PRAGMA table_info(\"{}\")", table))?;
    let rows = stmt.query_map([], |row| {
        Ok(ColumnInfo {
            name: row.get(1)?,
            declared_type: row.get::<_, Option<String>>(2)?.unwrap_or_default(),
            not_null: row.get::<_, i64>(3)? != 0,
            has_default: row.get::<_, Option<String>>(4)?.is_some(),
            primary_key: row.get::<_, i64>(5)? != 0,
        })
    })?;

    let mut columns = Vec::new();
    for row in rows {
        columns.push(row?);
    }

    if columns.is_empty() {
        return Err(RepositoryError::NotFound {
            entity: "table".to_string(),
            id: table.to_string(),
        });
    }
    Ok(columns)
}

/// 系统内部表（不作为导入/导出对象）
const INTERNAL_TABLES: [&str; 4] = [
    "schema_version",
    "config_kv",
    "transfer_records",
    "transfer_progress",
];

/// 列出可作为导入目标/导出来源的业务表（按名称排序）
pub fn user_tables(conn: &Connection) -> RepositoryResult<Vec<String>> {
    let mut stmt = conn.prepare(
        "SELECT name FROM sqlite_master
         WHERE type = 'table' AND name NOT LIKE 'sqlite_%'
         ORDER BY name",
    )?;
    let names = stmt.query_map([], |row| row.get::<_, String>(0))?;

    let mut tables = Vec::new();
    for name in names {
        let name = name?;
        if INTERNAL_TABLES.contains(&name.as_str()) || check_identifier(&name).is_err() {
            continue;
        }
        tables.push(name);
    }
    Ok(tables)
}

/// 单元格值 → SQLite 值
fn to_sql_value(value: &CellValue) -> SqlValue {
    match value {
        CellValue::Empty => SqlValue::Null,
        CellValue::String(s) => SqlValue::Text(s.clone()),
        CellValue::Int(i) => SqlValue::Integer(*i),
        CellValue::Float(f) => SqlValue::Real(*f),
        CellValue::Bool(b) => SqlValue::Integer(i64::from(*b)),
        CellValue::Date(_) | CellValue::DateTime(_) => SqlValue::Text(value.to_display()),
    }
}

fn json_to_sql(value: &Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Bool(b) => SqlValue::Integer(i64::from(*b)),
        Value::Number(n) => match n.as_i64() {
            Some(i) => SqlValue::Integer(i),
            None => SqlValue::Real(n.as_f64().unwrap_or_default()),
        },
        Value::String(s) => SqlValue::Text(s.clone()),
        other => SqlValue::Text(other.to_string()),
    }
}

fn sql_to_json(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::from(i),
        ValueRef::Real(f) => Number::from_f64(f).map(Value::Number).unwrap_or(Value::Null),
        ValueRef::Text(t) => Value::String(String::from_utf8_lossy(t).into_owned()),
        ValueRef::Blob(b) => Value::String(format!("<{} bytes>", b.len())),
    }
}

// ==========================================
// SqliteTableImporter
// ==========================================
pub struct SqliteTableImporter {
    conn: Arc<Mutex<Connection>>,
    table: String,
    fields: Vec<FieldSpec>,
}

impl SqliteTableImporter {
    /// 由表结构推导字段定义
    ///
    /// - 字段键与列标签均为列名
    /// - NOT NULL 且无默认值的列标记为 required
    pub fn discover(conn: Arc<Mutex<Connection>>, table: &str) -> RepositoryResult<Self> {
        let columns = table_columns(&*lock(&conn)?, table)?;

        let fields = columns
            .iter()
            .filter(|c| !c.is_rowid_alias())
            .map(|c| {
                let rule = if c.not_null && !c.has_default {
                    "required"
                } else {
                    "nullable"
                };
                let mut spec = FieldSpec::new(c.name.clone(), c.name.clone()).with_rule(rule);
                spec.field_type = c.field_type();
                spec
            })
            .collect();

        Ok(Self {
            conn,
            table: table.to_string(),
            fields,
        })
    }

    /// 使用指定字段定义（字段键必须是表中的列）
    pub fn with_fields(
        conn: Arc<Mutex<Connection>>,
        table: &str,
        fields: Vec<FieldSpec>,
    ) -> RepositoryResult<Self> {
        let columns = table_columns(&*lock(&conn)?, table)?;
        for field in &fields {
            check_identifier(&field.field)?;
            if !columns.iter().any(|c| c.name == field.field) {
                return Err(RepositoryError::FieldValueError {
                    field: field.field.clone(),
                    message: format!("表 {} 中不存在该列", table),
                });
            }
        }

        Ok(Self {
            conn,
            table: table.to_string(),
            fields,
        })
    }

    fn insert(&self, row: &CanonicalRow) -> RepositoryResult<()> {
        let columns: Vec<&str> = self
            .fields
            .iter()
            .filter(|f| row.contains_key(&f.field))
            .map(|f| f.field.as_str())
            .collect();
        if columns.is_empty() {
            return Err(RepositoryError::FieldValueError {
                field: self.table.clone(),
                message: "没有可写入的列".to_string(),
            });
        }

        let sql = format!(
            "INSERT INTO \"{}\" ({}) VALUES ({})",
            self.table,
            columns
                .iter()
                .map(|c| format!("\"{}\"", c))
                .collect::<Vec<_>>()
                .join(", "),
            (1..=columns.len())
                .map(|i| format!("?{}", i))
                .collect::<Vec<_>>()
                .join(", ")
        );
        let values: Vec<SqlValue> = columns
            .iter()
            .map(|c| row.get(*c).map(to_sql_value).unwrap_or(SqlValue::Null))
            .collect();

        let conn = lock(&self.conn)?;
        conn.execute(&sql, params_from_iter(values.iter()))?;
        Ok(())
    }
}

impl RowImporter for SqliteTableImporter {
    fn fields(&self) -> Vec<FieldSpec> {
        self.fields.clone()
    }

    fn store(&self, row: &CanonicalRow, _extra: &Value) -> Result<(), String> {
        self.insert(row).map_err(|e| e.to_string())
    }
}

// ==========================================
// SqliteTableExporter
// ==========================================
pub struct SqliteTableExporter {
    conn: Arc<Mutex<Connection>>,
    table: String,
    columns: Vec<String>,
    /// ID 列表筛选使用的列（单列整数主键，否则 rowid）
    id_column: String,
}

impl SqliteTableExporter {
    pub fn discover(conn: Arc<Mutex<Connection>>, table: &str) -> RepositoryResult<Self> {
        let columns = table_columns(&*lock(&conn)?, table)?;

        let id_column = columns
            .iter()
            .find(|c| c.is_rowid_alias())
            .map(|c| c.name.clone())
            .unwrap_or_else(|| "rowid".to_string());

        Ok(Self {
            conn,
            table: table.to_string(),
            columns: columns.into_iter().map(|c| c.name).collect(),
            id_column,
        })
    }

    fn where_clause(&self, filter: &ExportFilter) -> TransferResult<(String, Vec<SqlValue>)> {
        match filter {
            ExportFilter::All => Ok(("1 = 1".to_string(), Vec::new())),
            ExportFilter::Ids(ids) if ids.is_empty() => Ok(("0 = 1".to_string(), Vec::new())),
            ExportFilter::Ids(ids) => Ok((
                format!(
                    "\"{}\" IN ({})",
                    self.id_column,
                    vec!["?"; ids.len()].join(", ")
                ),
                ids.iter().map(|id| SqlValue::Integer(*id)).collect(),
            )),
            ExportFilter::Query(query) => {
                let conditions = match query {
                    Value::Null => return Ok(("1 = 1".to_string(), Vec::new())),
                    Value::Object(map) => map,
                    other => {
                        return Err(TransferError::InvalidRequest(format!(
                            "筛选条件必须是对象: {}",
                            other
                        )))
                    }
                };

                let mut clauses = Vec::new();
                let mut values = Vec::new();
                for (column, value) in conditions {
                    if !self.columns.iter().any(|c| c == column) {
                        return Err(TransferError::InvalidRequest(format!("未知筛选列: {}", column)));
                    }
                    match value {
                        Value::Null => clauses.push(format!("\"{}\" IS NULL", column)),
                        Value::Array(items) if items.is_empty() => clauses.push("0 = 1".to_string()),
                        Value::Array(items) => {
                            clauses.push(format!(
                                "\"{}\" IN ({})",
                                column,
                                vec!["?"; items.len()].join(", ")
                            ));
                            values.extend(items.iter().map(json_to_sql));
                        }
                        scalar => {
                            clauses.push(format!("\"{}\" = ?", column));
                            values.push(json_to_sql(scalar));
                        }
                    }
                }

                if clauses.is_empty() {
                    Ok(("1 = 1".to_string(), values))
                } else {
                    Ok((clauses.join(" AND "), values))
                }
            }
        }
    }
}

impl RowExporter for SqliteTableExporter {
    fn default_headers(&self) -> Vec<String> {
        self.columns.clone()
    }

    fn approval_type(&self) -> String {
        self.table.clone()
    }

    fn prepare_query(&self, filter: &ExportFilter) -> TransferResult<Box<dyn QueryCursor>> {
        let (where_sql, where_values) = self.where_clause(filter)?;
        Ok(Box::new(SqliteTableCursor {
            conn: self.conn.clone(),
            table: self.table.clone(),
            columns: self.columns.clone(),
            where_sql,
            where_values,
            last_rowid: None,
        }))
    }

    fn map_row(&self, row: &Value) -> HashMap<String, CellValue> {
        self.columns
            .iter()
            .map(|column| {
                let cell = match row.get(column) {
                    None | Some(Value::Null) => CellValue::Empty,
                    Some(Value::Bool(b)) => CellValue::Bool(*b),
                    Some(Value::Number(n)) => match n.as_i64() {
                        Some(i) => CellValue::Int(i),
                        None => n.as_f64().map(CellValue::Float).unwrap_or(CellValue::Empty),
                    },
                    Some(Value::String(s)) => CellValue::from(s.as_str()),
                    Some(other) => CellValue::String(other.to_string()),
                };
                (column.clone(), cell)
            })
            .collect()
    }
}

/// 按 rowid 键集分页的游标
struct SqliteTableCursor {
    conn: Arc<Mutex<Connection>>,
    table: String,
    columns: Vec<String>,
    where_sql: String,
    where_values: Vec<SqlValue>,
    last_rowid: Option<i64>,
}

impl QueryCursor for SqliteTableCursor {
    fn count(&mut self) -> TransferResult<u64> {
        let conn = lock(&self.conn)?;
        let sql = format!(
            "SELECT COUNT(*) FROM \"{}\" WHERE {}",
            self.table, self.where_sql
        );
        let count: i64 = conn
            .query_row(&sql, params_from_iter(self.where_values.iter()), |row| row.get(0))
            .map_err(|e| TransferError::QueryError(e.to_string()))?;
        Ok(count.max(0) as u64)
    }

    fn next_chunk(&mut self, max_rows: usize) -> TransferResult<Vec<Value>> {
        let conn = lock(&self.conn)?;
        let sql = format!(
            "SELECT rowid, {} FROM \"{}\" WHERE ({}) AND rowid > ? ORDER BY rowid LIMIT ?",
            self.columns
                .iter()
                .map(|c| format!("\"{}\"", c))
                .collect::<Vec<_>>()
                .join(", "),
            self.table,
            self.where_sql
        );

        let mut values = self.where_values.clone();
        values.push(SqlValue::Integer(self.last_rowid.unwrap_or(i64::MIN)));
        values.push(SqlValue::Integer(max_rows.max(1) as i64));

        let mut stmt = conn
            .prepare(&sql)
            .map_err(|e| TransferError::QueryError(e.to_string()))?;
        let mut rows = stmt
            .query(params_from_iter(values.iter()))
            .map_err(|e| TransferError::QueryError(e.to_string()))?;

        let mut chunk = Vec::new();
        while let Some(row) = rows.next().map_err(|e| TransferError::QueryError(e.to_string()))? {
            let rowid: i64 = row.get(0).map_err(|e| TransferError::QueryError(e.to_string()))?;
            let mut object = Map::new();
            for (index, column) in self.columns.iter().enumerate() {
                let value = row
                    .get_ref(index + 1)
                    .map_err(|e| TransferError::QueryError(e.to_string()))?;
                object.insert(column.clone(), sql_to_json(value));
            }
            self.last_rowid = Some(rowid);
            chunk.push(Value::Object(object));
        }
        Ok(chunk)
    }
}
