// ==========================================
// 数据传输系统 - 任务进度存储
// ==========================================
// 职责: 以任务 ID 为键的临时进度计数（标题/总数/已处理/错误数/起止时间）
// 生命周期:
// - 处理开始时创建，处理中不过期
// - 完成或失败后保留 TTL 窗口，过期后读取返回 None（数据已不可用，不是错误）
// 实现:
// - MemoryProgressStore: 进程内（测试、嵌入式场景）
// - SqliteProgressStore: transfer_progress 表，可被其他进程轮询
// 红线: total 已知后 processed 不超过 total；processed 单调不减
// ==========================================

use crate::domain::progress::ProgressSnapshot;
use crate::repository::error::{RepositoryError, RepositoryResult};
use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

// ==========================================
// ProgressStore Trait
// ==========================================
pub trait ProgressStore: Send + Sync {
    /// 创建（或重置）进度；total 与开始时间一并写入
    fn start(
        &self,
        task_id: &str,
        title: &str,
        total: Option<u64>,
        started_at: DateTime<Utc>,
    ) -> RepositoryResult<()>;

    /// 已处理行数增加 n（不超过 total）
    fn increment_processed(&self, task_id: &str, n: u64) -> RepositoryResult<()>;

    /// 错误行数增加 n，并置错误标记
    fn record_error_rows(&self, task_id: &str, n: u64) -> RepositoryResult<()>;

    /// 完成: 写入结束时间，开始 TTL 计时
    fn finish(&self, task_id: &str, finished_at: DateTime<Utc>, ttl: Duration)
        -> RepositoryResult<()>;

    /// 失败: 置失败标记，开始 TTL 计时（进度不存在时创建）
    fn mark_failed(&self, task_id: &str, title: &str, ttl: Duration) -> RepositoryResult<()>;

    /// 读取快照（不存在或已过期返回 None）
    fn snapshot(&self, task_id: &str) -> RepositoryResult<Option<ProgressSnapshot>>;

    /// 清理已过期条目，返回清理数量
    fn evict_expired(&self) -> RepositoryResult<usize>;
}

fn ttl_deadline(now: DateTime<Utc>, ttl: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(ttl)
        .ok()
        .and_then(|d| now.checked_add_signed(d))
        .unwrap_or(now)
}

fn clamp_processed(processed: u64, total: Option<u64>) -> u64 {
    match total {
        Some(total) => processed.min(total),
        None => processed,
    }
}

// ==========================================
// MemoryProgressStore
// ==========================================
#[derive(Debug, Default)]
pub struct MemoryProgressStore {
    entries: Mutex<HashMap<String, (ProgressSnapshot, Option<DateTime<Utc>>)>>,
}

impl MemoryProgressStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(
        &self,
    ) -> RepositoryResult<MutexGuard<'_, HashMap<String, (ProgressSnapshot, Option<DateTime<Utc>>)>>>
    {
        self.entries
            .lock()
            .map_err(|e| RepositoryError::LockError(e.to_string()))
    }
}

impl ProgressStore for MemoryProgressStore {
    fn start(
        &self,
        task_id: &str,
        title: &str,
        total: Option<u64>,
        started_at: DateTime<Utc>,
    ) -> RepositoryResult<()> {
        let mut snapshot = ProgressSnapshot::new(task_id, title);
        snapshot.total = total;
        snapshot.started_at = Some(started_at);
        self.lock()?.insert(task_id.to_string(), (snapshot, None));
        Ok(())
    }

    fn increment_processed(&self, task_id: &str, n: u64) -> RepositoryResult<()> {
        if let Some((snapshot, _)) = self.lock()?.get_mut(task_id) {
            snapshot.processed = clamp_processed(snapshot.processed + n, snapshot.total);
        }
        Ok(())
    }

    fn record_error_rows(&self, task_id: &str, n: u64) -> RepositoryResult<()> {
        if let Some((snapshot, _)) = self.lock()?.get_mut(task_id) {
            snapshot.error_rows += n;
            snapshot.has_error = snapshot.error_rows > 0;
        }
        Ok(())
    }

    fn finish(
        &self,
        task_id: &str,
        finished_at: DateTime<Utc>,
        ttl: Duration,
    ) -> RepositoryResult<()> {
        if let Some((snapshot, expires_at)) = self.lock()?.get_mut(task_id) {
            snapshot.finished_at = Some(finished_at);
            *expires_at = Some(ttl_deadline(Utc::now(), ttl));
        }
        Ok(())
    }

    fn mark_failed(&self, task_id: &str, title: &str, ttl: Duration) -> RepositoryResult<()> {
        let mut entries = self.lock()?;
        let entry = entries
            .entry(task_id.to_string())
            .or_insert_with(|| (ProgressSnapshot::new(task_id, title), None));
        entry.0.failed = true;
        entry.1 = Some(ttl_deadline(Utc::now(), ttl));
        Ok(())
    }

    fn snapshot(&self, task_id: &str) -> RepositoryResult<Option<ProgressSnapshot>> {
        let mut entries = self.lock()?;
        let expired = match entries.get(task_id) {
            None => return Ok(None),
            Some((_, Some(expires_at))) => *expires_at <= Utc::now(),
            Some((_, None)) => false,
        };

        if expired {
            entries.remove(task_id);
            return Ok(None);
        }
        Ok(entries.get(task_id).map(|(snapshot, _)| snapshot.clone()))
    }

    fn evict_expired(&self) -> RepositoryResult<usize> {
        let mut entries = self.lock()?;
        let now = Utc::now();
        let before = entries.len();
        entries.retain(|_, (_, expires_at)| expires_at.map(|at| at > now).unwrap_or(true));
        Ok(before - entries.len())
    }
}

// ==========================================
// SqliteProgressStore
// ==========================================
// 时间列为 unix 毫秒；每个操作为单条 SQL，按键原子读写
pub struct SqliteProgressStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteProgressStore {
    pub fn from_connection(conn: Arc<Mutex<Connection>>) -> Self {
        Self { conn }
    }

    fn get_conn(&self) -> RepositoryResult<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| RepositoryError::LockError(e.to_string()))
    }
}

fn from_millis(ms: Option<i64>) -> Option<DateTime<Utc>> {
    ms.and_then(|ms| Utc.timestamp_millis_opt(ms).single())
}

impl ProgressStore for SqliteProgressStore {
    fn start(
        &self,
        task_id: &str,
        title: &str,
        total: Option<u64>,
        started_at: DateTime<Utc>,
    ) -> RepositoryResult<()> {
        let conn = self.get_conn()?;
        conn.execute(
            r#"
            INSERT INTO transfer_progress (
                task_id, title, started_at, finished_at, processed, total,
                has_error, error_rows, failed, expires_at
            ) VALUES (?1, ?2, ?3, NULL, 0, ?4, 0, 0, 0, NULL)
            ON CONFLICT(task_id) DO UPDATE SET
                title = excluded.title,
                started_at = excluded.started_at,
                finished_at = NULL,
                processed = 0,
                total = excluded.total,
                has_error = 0,
                error_rows = 0,
                failed = 0,
                expires_at = NULL
            "#,
            params![
                task_id,
                title,
                started_at.timestamp_millis(),
                total.map(|v| v as i64)
            ],
        )?;
        Ok(())
    }

    fn increment_processed(&self, task_id: &str, n: u64) -> RepositoryResult<()> {
        let conn = self.get_conn()?;
        conn.execute(
            r#"
            UPDATE transfer_progress
            SET processed = CASE
                WHEN total IS NOT NULL AND processed + ?2 > total THEN total
                ELSE processed + ?2
            END
            WHERE task_id = ?1
            "#,
            params![task_id, n as i64],
        )?;
        Ok(())
    }

    fn record_error_rows(&self, task_id: &str, n: u64) -> RepositoryResult<()> {
        let conn = self.get_conn()?;
        conn.execute(
            r#"
            UPDATE transfer_progress
            SET error_rows = error_rows + ?2,
                has_error = CASE WHEN error_rows + ?2 > 0 THEN 1 ELSE 0 END
            WHERE task_id = ?1
            "#,
            params![task_id, n as i64],
        )?;
        Ok(())
    }

    fn finish(
        &self,
        task_id: &str,
        finished_at: DateTime<Utc>,
        ttl: Duration,
    ) -> RepositoryResult<()> {
        let conn = self.get_conn()?;
        conn.execute(
            "UPDATE transfer_progress SET finished_at = ?2, expires_at = ?3 WHERE task_id = ?1",
            params![
                task_id,
                finished_at.timestamp_millis(),
                ttl_deadline(Utc::now(), ttl).timestamp_millis()
            ],
        )?;
        Ok(())
    }

    fn mark_failed(&self, task_id: &str, title: &str, ttl: Duration) -> RepositoryResult<()> {
        let conn = self.get_conn()?;
        conn.execute(
            r#"
            INSERT INTO transfer_progress (task_id, title, processed, has_error, error_rows, failed, expires_at)
            VALUES (?1, ?2, 0, 0, 0, 1, ?3)
            ON CONFLICT(task_id) DO UPDATE SET
                failed = 1,
                expires_at = excluded.expires_at
            "#,
            params![task_id, title, ttl_deadline(Utc::now(), ttl).timestamp_millis()],
        )?;
        Ok(())
    }

    fn snapshot(&self, task_id: &str) -> RepositoryResult<Option<ProgressSnapshot>> {
        let conn = self.get_conn()?;
        let now = Utc::now().timestamp_millis();

        let row = conn
            .query_row(
                r#"
                SELECT task_id, title, started_at, finished_at, processed, total,
                       has_error, error_rows, failed, expires_at
                FROM transfer_progress
                WHERE task_id = ?1
                "#,
                params![task_id],
                |row| {
                    let snapshot = ProgressSnapshot {
                        task_id: row.get(0)?,
                        title: row.get(1)?,
                        started_at: from_millis(row.get(2)?),
                        finished_at: from_millis(row.get(3)?),
                        processed: row.get::<_, i64>(4)?.max(0) as u64,
                        total: row.get::<_, Option<i64>>(5)?.map(|v| v.max(0) as u64),
                        has_error: row.get::<_, i64>(6)? != 0,
                        error_rows: row.get::<_, i64>(7)?.max(0) as u64,
                        failed: row.get::<_, i64>(8)? != 0,
                    };
                    Ok((snapshot, row.get::<_, Option<i64>>(9)?))
                },
            )
            .optional()?;

        match row {
            None => Ok(None),
            Some((_, Some(expires_at))) if expires_at <= now => {
                conn.execute(
                    "DELETE FROM transfer_progress WHERE task_id = ?1",
                    params![task_id],
                )?;
                Ok(None)
            }
            Some((snapshot, _)) => Ok(Some(snapshot)),
        }
    }

    fn evict_expired(&self) -> RepositoryResult<usize> {
        let conn = self.get_conn()?;
        let removed = conn.execute(
            "DELETE FROM transfer_progress WHERE expires_at IS NOT NULL AND expires_at <= ?1",
            params![Utc::now().timestamp_millis()],
        )?;
        Ok(removed)
    }
}
