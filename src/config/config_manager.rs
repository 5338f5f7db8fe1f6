// ==========================================
// 数据传输系统 - 配置管理器
// ==========================================
// 职责: 配置加载、查询、覆写管理
// 存储: config_kv 表 (key-value + scope)
// 覆写: 环境变量 TABULAR_TRANSFER_<KEY> 优先于 config_kv
// ==========================================

use crate::config::transfer_config_trait::TransferConfigReader;
use crate::config::transfer_settings::{DEFAULT_CHUNK_SIZE, DEFAULT_PROGRESS_TTL_SECS};
use crate::db::open_sqlite_connection;
use crate::exporter::sheet_writer::SheetFormat;
use crate::importer::error_collector::ReportLayout;
use crate::repository::error::{RepositoryError, RepositoryResult};
use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

// ==========================================
// ConfigManager - 配置管理器
// ==========================================
pub struct ConfigManager {
    conn: Arc<Mutex<Connection>>,
}

impl ConfigManager {
    /// 创建新的 ConfigManager 实例
    ///
    /// # 参数
    /// - db_path: 数据库文件路径
    pub fn new(db_path: &str) -> RepositoryResult<Self> {
        let conn = open_sqlite_connection(db_path)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// 从已有连接创建 ConfigManager
    ///
    /// 说明：为保证连接行为一致，会对传入连接再次应用统一 PRAGMA（幂等）。
    pub fn from_connection(conn: Arc<Mutex<Connection>>) -> RepositoryResult<Self> {
        {
            let conn_guard = conn
                .lock()
                .map_err(|e| RepositoryError::LockError(e.to_string()))?;
            crate::db::configure_sqlite_connection(&conn_guard)?;
        }

        Ok(Self { conn })
    }

    /// 从 config_kv 表读取配置值（scope_id='global'）
    fn get_config_value(&self, key: &str) -> RepositoryResult<Option<String>> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| RepositoryError::LockError(e.to_string()))?;

        let value = conn
            .query_row(
                "SELECT value FROM config_kv WHERE scope_id = 'global' AND key = ?1",
                params![key],
                |row| row.get::<_, String>(0),
            )
            .optional()?;

        Ok(value)
    }

    /// 读取配置值: 环境变量 > config_kv > 默认值
    fn get_config_or_default(&self, key: &str, default: &str) -> RepositoryResult<String> {
        if let Ok(value) = std::env::var(env_var_name(key)) {
            if !value.trim().is_empty() {
                return Ok(value.trim().to_string());
            }
        }
        Ok(self
            .get_config_value(key)?
            .unwrap_or_else(|| default.to_string()))
    }

    /// 写入 global scope 配置（存在则覆盖）
    pub fn set_global_config_value(&self, key: &str, value: &str) -> RepositoryResult<()> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| RepositoryError::LockError(e.to_string()))?;

        conn.execute(
            r#"
            INSERT INTO config_kv (scope_id, key, value, updated_at)
            VALUES ('global', ?1, ?2, datetime('now'))
            ON CONFLICT(scope_id, key) DO UPDATE SET
                value = excluded.value,
                updated_at = excluded.updated_at
            "#,
            params![key, value],
        )?;
        Ok(())
    }

    /// 获取所有 global 配置的快照
    pub fn get_config_snapshot(&self) -> RepositoryResult<HashMap<String, String>> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| RepositoryError::LockError(e.to_string()))?;

        let mut stmt =
            conn.prepare("SELECT key, value FROM config_kv WHERE scope_id = 'global' ORDER BY key")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;

        let mut config_map = HashMap::new();
        for row in rows {
            let (key, value) = row?;
            config_map.insert(key, value);
        }
        Ok(config_map)
    }
}

/// `transfer/chunk_size` → `TABULAR_TRANSFER_CHUNK_SIZE`
fn env_var_name(key: &str) -> String {
    let bare = key.strip_prefix("transfer/").unwrap_or(key);
    format!("TABULAR_TRANSFER_{}", bare.to_uppercase())
}

#[async_trait]
impl TransferConfigReader for ConfigManager {
    async fn get_chunk_size(&self) -> RepositoryResult<usize> {
        let value = self.get_config_or_default(config_keys::CHUNK_SIZE, "1000")?;
        Ok(value
            .parse::<usize>()
            .ok()
            .filter(|v| *v > 0)
            .unwrap_or(DEFAULT_CHUNK_SIZE))
    }

    async fn get_progress_ttl_secs(&self) -> RepositoryResult<u64> {
        let value = self.get_config_or_default(config_keys::PROGRESS_TTL_SECS, "60")?;
        Ok(value.parse::<u64>().unwrap_or(DEFAULT_PROGRESS_TTL_SECS))
    }

    async fn get_progress_flush_rows(&self) -> RepositoryResult<u64> {
        let value = self.get_config_or_default(config_keys::PROGRESS_FLUSH_ROWS, "1")?;
        Ok(value.parse::<u64>().ok().filter(|v| *v > 0).unwrap_or(1))
    }

    async fn get_system_name(&self) -> RepositoryResult<Option<String>> {
        let value = self.get_config_or_default(config_keys::SYSTEM_NAME, "")?;
        Ok(Some(value).filter(|v| !v.is_empty()))
    }

    async fn get_storage_root(&self) -> RepositoryResult<PathBuf> {
        let value = self.get_config_or_default(config_keys::STORAGE_ROOT, "storage")?;
        Ok(PathBuf::from(value))
    }

    async fn get_export_format(&self) -> RepositoryResult<SheetFormat> {
        let value = self.get_config_or_default(config_keys::EXPORT_FORMAT, "xlsx")?;
        value.parse::<SheetFormat>().map_err(|message| RepositoryError::FieldValueError {
            field: config_keys::EXPORT_FORMAT.to_string(),
            message,
        })
    }

    async fn get_report_layout(&self) -> RepositoryResult<ReportLayout> {
        let value = self.get_config_or_default(config_keys::REPORT_LAYOUT, "content_echo")?;
        value.parse::<ReportLayout>().map_err(|message| RepositoryError::FieldValueError {
            field: config_keys::REPORT_LAYOUT.to_string(),
            message,
        })
    }
}

// ==========================================
// 配置键常量
// ==========================================
pub mod config_keys {
    pub const CHUNK_SIZE: &str = "transfer/chunk_size";
    pub const PROGRESS_TTL_SECS: &str = "transfer/progress_ttl_secs";
    pub const PROGRESS_FLUSH_ROWS: &str = "transfer/progress_flush_rows";
    pub const SYSTEM_NAME: &str = "transfer/system_name";
    pub const STORAGE_ROOT: &str = "transfer/storage_root";
    pub const EXPORT_FORMAT: &str = "transfer/export_format";
    pub const REPORT_LAYOUT: &str = "transfer/report_layout";
}
