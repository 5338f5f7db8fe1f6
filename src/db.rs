// ==========================================
// 数据传输系统 - SQLite 连接初始化
// ==========================================
// 目标:
// - 统一所有 Connection::open 的 PRAGMA 行为
// - 统一 busy_timeout，减少并发写入（进度轮询 + 任务写入）时的 busy 错误
// - 提供建表脚本（任务记录 / 进度 / 配置）
// ==========================================

use rusqlite::Connection;
use rusqlite::OptionalExtension;
use std::time::Duration;

/// 默认 busy_timeout（毫秒）
pub const DEFAULT_BUSY_TIMEOUT_MS: u64 = 5_000;

/// 当前代码所期望的 schema_version
pub const CURRENT_SCHEMA_VERSION: i64 = 1;

/// 配置 SQLite 连接的统一 PRAGMA
///
/// 说明：
/// - foreign_keys / busy_timeout 需要"每个连接"单独配置
/// - 文件库启用 WAL，使轮询进程读取时不阻塞写入进程
pub fn configure_sqlite_connection(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch("PRAGMA foreign_keys = ON;")?;
    conn.busy_timeout(Duration::from_millis(DEFAULT_BUSY_TIMEOUT_MS))?;
    Ok(())
}

/// 打开 SQLite 连接并应用统一配置
pub fn open_sqlite_connection(db_path: &str) -> rusqlite::Result<Connection> {
    let conn = Connection::open(db_path)?;
    configure_sqlite_connection(&conn)?;
    if db_path != ":memory:" {
        // journal_mode 返回结果行，需用 query_row
        let _mode: String = conn.query_row("PRAGMA journal_mode = WAL;", [], |row| row.get(0))?;
    }
    Ok(conn)
}

/// 初始化数据库 schema（幂等）
pub fn init_schema(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS config_kv (
            scope_id TEXT NOT NULL,
            key TEXT NOT NULL,
            value TEXT NOT NULL,
            updated_at TEXT NOT NULL DEFAULT (datetime('now')),
            PRIMARY KEY (scope_id, key)
        );

        -- 数据传输记录表
        CREATE TABLE IF NOT EXISTS transfer_records (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            task_id TEXT NOT NULL UNIQUE,          -- 任务ID
            task_name TEXT NOT NULL,               -- 任务名称
            creator_id INTEGER NOT NULL,           -- 创建者ID
            type TEXT NOT NULL,                    -- import / export
            handler TEXT NOT NULL,                 -- 导入器/导出器注册键
            status TEXT NOT NULL,                  -- pending / processing / done / failed
            file_path TEXT,                        -- 文件路径
            properties TEXT,                       -- 附加参数 (JSON)
            error TEXT,                            -- 错误信息
            total_count INTEGER,                   -- 总数据量
            error_file_path TEXT,                  -- 错误文件路径
            started_at TEXT,
            ended_at TEXT,
            duration TEXT,                         -- 处理时长 HH:MM:SS
            approver_id INTEGER,
            approval_status TEXT,
            approval_comment TEXT,
            approval_at TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_transfer_records_creator ON transfer_records(creator_id);
        CREATE INDEX IF NOT EXISTS idx_transfer_records_type_status ON transfer_records(type, status);

        -- 任务进度（临时数据，带过期时间）
        CREATE TABLE IF NOT EXISTS transfer_progress (
            task_id TEXT PRIMARY KEY,
            title TEXT NOT NULL,
            started_at INTEGER,                    -- unix 毫秒
            finished_at INTEGER,
            processed INTEGER NOT NULL DEFAULT 0,
            total INTEGER,
            has_error INTEGER NOT NULL DEFAULT 0,
            error_rows INTEGER NOT NULL DEFAULT 0,
            failed INTEGER NOT NULL DEFAULT 0,
            expires_at INTEGER                     -- 为空表示不过期
        );
        "#,
    )?;

    conn.execute(
        "INSERT OR IGNORE INTO schema_version (version) VALUES (?1)",
        [CURRENT_SCHEMA_VERSION],
    )?;
    Ok(())
}

/// 读取 schema_version（若表不存在则返回 None）
pub fn read_schema_version(conn: &Connection) -> rusqlite::Result<Option<i64>> {
    let has_table: bool = conn
        .query_row(
            "SELECT 1 FROM sqlite_master WHERE type='table' AND name='schema_version' LIMIT 1",
            [],
            |_row| Ok(true),
        )
        .optional()?
        .unwrap_or(false);

    if !has_table {
        return Ok(None);
    }

    let v: Option<i64> =
        conn.query_row("SELECT MAX(version) FROM schema_version", [], |row| row.get(0))?;
    Ok(v)
}
