// ==========================================
// 数据传输系统 - 传输任务记录仓储
// ==========================================
// 职责: transfer_records 表的创建、查询、状态迁移
// 红线:
// - Repository 不含业务逻辑，只校验状态机与文件路径不可变
// - 状态迁移在同一事务内"读取当前状态 → 校验 → 写入"
// ==========================================

use crate::domain::task::{TaskProperties, TransferTask};
use crate::domain::types::{ApprovalStatus, TaskKind, TaskStatus};
use crate::repository::error::{RepositoryError, RepositoryResult};
use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard};

/// 完成迁移写入的内容
#[derive(Debug, Clone, Default)]
pub struct TaskCompletion {
    pub ended_at: Option<DateTime<Utc>>,
    pub duration: Option<String>,
    /// 导入错误报告
    pub error_file_path: Option<String>,
    /// 导出生成文件（一经写入不可修改）
    pub file_path: Option<String>,
    /// 错误摘要（有行级错误的完成任务）
    pub error: Option<String>,
    /// 总行数（为空时保留处理开始时写入的值）
    pub total_count: Option<u64>,
}

/// 审核结果
#[derive(Debug, Clone)]
pub struct ApprovalDecision {
    pub status: ApprovalStatus,
    pub approver_id: Option<i64>,
    pub comment: Option<String>,
    pub decided_at: DateTime<Utc>,
    /// 审核人核定的导出字段
    pub approved_fields: Option<Vec<String>>,
}

/// 记录查询条件（按创建时间倒序分页）
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RecordFilter {
    pub kind: Option<TaskKind>,
    pub creator_id: Option<i64>,
    pub limit: u32,
    pub offset: u32,
}

// ==========================================
// TaskRecordStore Trait
// ==========================================
// 实现者: SqliteTaskRecordStore
pub trait TaskRecordStore: Send + Sync {
    fn create(&self, task: &TransferTask) -> RepositoryResult<()>;

    fn get(&self, task_id: &str) -> RepositoryResult<Option<TransferTask>>;

    /// pending/failed(导出) → processing
    fn mark_processing(
        &self,
        task_id: &str,
        started_at: DateTime<Utc>,
        total_count: Option<u64>,
    ) -> RepositoryResult<()>;

    /// processing → done
    fn mark_done(&self, task_id: &str, completion: TaskCompletion) -> RepositoryResult<()>;

    /// pending/processing → failed
    fn mark_failed(&self, task_id: &str, ended_at: DateTime<Utc>, error: &str)
        -> RepositoryResult<()>;

    /// 写入审核结果（不影响任务状态）
    fn update_approval(&self, task_id: &str, decision: ApprovalDecision) -> RepositoryResult<()>;

    fn list(&self, filter: &RecordFilter) -> RepositoryResult<Vec<TransferTask>>;
}

// ==========================================
// SqliteTaskRecordStore
// ==========================================
pub struct SqliteTaskRecordStore {
    conn: Arc<Mutex<Connection>>,
}

const SELECT_COLUMNS: &str = r#"
    task_id, task_name, creator_id, type, handler, status, file_path, properties,
    error, total_count, error_file_path, started_at, ended_at, duration,
    approver_id, approval_status, approval_comment, approval_at, created_at, updated_at
"#;

impl SqliteTaskRecordStore {
    pub fn from_connection(conn: Arc<Mutex<Connection>>) -> Self {
        Self { conn }
    }

    fn get_conn(&self) -> RepositoryResult<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| RepositoryError::LockError(e.to_string()))
    }

    /// 读取当前状态（事务内）
    fn current_state(
        conn: &Connection,
        task_id: &str,
    ) -> RepositoryResult<(TaskKind, TaskStatus, Option<String>)> {
        let state = conn
            .query_row(
                "SELECT type, status, file_path FROM transfer_records WHERE task_id = ?1",
                params![task_id],
                |row| {
                    Ok((
                        parse_text::<TaskKind>(0, row.get(0)?)?,
                        parse_text::<TaskStatus>(1, row.get(1)?)?,
                        row.get::<_, Option<String>>(2)?,
                    ))
                },
            )
            .optional()?;

        state.ok_or_else(|| RepositoryError::NotFound {
            entity: "TransferTask".to_string(),
            id: task_id.to_string(),
        })
    }

    fn check_transition(
        task_id: &str,
        kind: TaskKind,
        from: TaskStatus,
        to: TaskStatus,
    ) -> RepositoryResult<()> {
        if from.can_transition_to(to, kind) {
            Ok(())
        } else {
            Err(RepositoryError::InvalidStateTransition {
                task_id: task_id.to_string(),
                from: from.to_string(),
                to: to.to_string(),
            })
        }
    }
}

impl TaskRecordStore for SqliteTaskRecordStore {
    fn create(&self, task: &TransferTask) -> RepositoryResult<()> {
        let conn = self.get_conn()?;
        let properties = serde_json::to_string(&task.properties)?;

        conn.execute(
            r#"
            INSERT INTO transfer_records (
                task_id, task_name, creator_id, type, handler, status, file_path, properties,
                error, total_count, error_file_path, started_at, ended_at, duration,
                approver_id, approval_status, approval_comment, approval_at, created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20)
            "#,
            params![
                task.task_id,
                task.task_name,
                task.creator_id,
                task.kind.as_str(),
                task.handler,
                task.status.as_str(),
                task.file_path,
                properties,
                task.error,
                task.total_count.map(|v| v as i64),
                task.error_file_path,
                task.started_at,
                task.ended_at,
                task.duration,
                task.approver_id,
                task.approval_status.map(|s| s.as_str()),
                task.approval_comment,
                task.approval_at,
                task.created_at,
                task.updated_at,
            ],
        )?;
        Ok(())
    }

    fn get(&self, task_id: &str) -> RepositoryResult<Option<TransferTask>> {
        let conn = self.get_conn()?;
        let sql = format!("SELECT {} FROM transfer_records WHERE task_id = ?1", SELECT_COLUMNS);
        let task = conn
            .query_row(&sql, params![task_id], map_task_row)
            .optional()?;
        Ok(task)
    }

    fn mark_processing(
        &self,
        task_id: &str,
        started_at: DateTime<Utc>,
        total_count: Option<u64>,
    ) -> RepositoryResult<()> {
        let mut conn = self.get_conn()?;
        // IMMEDIATE: 读取状态前即持有写锁，多进程同时认领时只有一个成功
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let (kind, status, _) = Self::current_state(&tx, task_id)?;
        Self::check_transition(task_id, kind, status, TaskStatus::Processing)?;

        tx.execute(
            r#"
            UPDATE transfer_records
            SET status = ?2, started_at = ?3, total_count = ?4,
                ended_at = NULL, duration = NULL, error = NULL, updated_at = ?5
            WHERE task_id = ?1
            "#,
            params![
                task_id,
                TaskStatus::Processing.as_str(),
                started_at,
                total_count.map(|v| v as i64),
                Utc::now(),
            ],
        )?;
        tx.commit()?;
        Ok(())
    }

    fn mark_done(&self, task_id: &str, completion: TaskCompletion) -> RepositoryResult<()> {
        let mut conn = self.get_conn()?;
        let tx = conn.transaction()?;

        let (kind, status, existing_path) = Self::current_state(&tx, task_id)?;
        Self::check_transition(task_id, kind, status, TaskStatus::Done)?;

        if let (Some(existing), Some(new_path)) = (&existing_path, &completion.file_path) {
            if existing != new_path {
                return Err(RepositoryError::FilePathImmutable(task_id.to_string()));
            }
        }

        tx.execute(
            r#"
            UPDATE transfer_records
            SET status = ?2,
                ended_at = ?3,
                duration = ?4,
                error_file_path = ?5,
                file_path = COALESCE(file_path, ?6),
                error = ?7,
                updated_at = ?8,
                total_count = COALESCE(?9, total_count)
            WHERE task_id = ?1
            "#,
            params![
                task_id,
                TaskStatus::Done.as_str(),
                completion.ended_at,
                completion.duration,
                completion.error_file_path,
                completion.file_path,
                completion.error,
                Utc::now(),
                completion.total_count.map(|v| v as i64),
            ],
        )?;
        tx.commit()?;
        Ok(())
    }

    fn mark_failed(
        &self,
        task_id: &str,
        ended_at: DateTime<Utc>,
        error: &str,
    ) -> RepositoryResult<()> {
        let mut conn = self.get_conn()?;
        let tx = conn.transaction()?;

        let (kind, status, _) = Self::current_state(&tx, task_id)?;
        Self::check_transition(task_id, kind, status, TaskStatus::Failed)?;

        tx.execute(
            r#"
            UPDATE transfer_records
            SET status = ?2, ended_at = ?3, error = ?4, updated_at = ?5
            WHERE task_id = ?1
            "#,
            params![task_id, TaskStatus::Failed.as_str(), ended_at, error, Utc::now()],
        )?;
        tx.commit()?;
        Ok(())
    }

    fn update_approval(&self, task_id: &str, decision: ApprovalDecision) -> RepositoryResult<()> {
        let mut conn = self.get_conn()?;
        let tx = conn.transaction()?;

        let properties: Option<String> = tx
            .query_row(
                "SELECT properties FROM transfer_records WHERE task_id = ?1",
                params![task_id],
                |row| row.get(0),
            )
            .optional()?
            .ok_or_else(|| RepositoryError::NotFound {
                entity: "TransferTask".to_string(),
                id: task_id.to_string(),
            })?;

        let mut props: TaskProperties = match properties.as_deref() {
            Some(json) if !json.is_empty() => serde_json::from_str(json)?,
            _ => TaskProperties::default(),
        };
        if decision.approved_fields.is_some() {
            props.approved_fields = decision.approved_fields.clone();
        }

        tx.execute(
            r#"
            UPDATE transfer_records
            SET approval_status = ?2, approver_id = ?3, approval_comment = ?4,
                approval_at = ?5, properties = ?6, updated_at = ?7
            WHERE task_id = ?1
            "#,
            params![
                task_id,
                decision.status.as_str(),
                decision.approver_id,
                decision.comment,
                decision.decided_at,
                serde_json::to_string(&props)?,
                Utc::now(),
            ],
        )?;
        tx.commit()?;
        Ok(())
    }

    fn list(&self, filter: &RecordFilter) -> RepositoryResult<Vec<TransferTask>> {
        let conn = self.get_conn()?;
        let limit = if filter.limit == 0 { 20 } else { filter.limit.min(500) };

        let sql = format!(
            r#"
            SELECT {}
            FROM transfer_records
            WHERE (?1 IS NULL OR type = ?1)
              AND (?2 IS NULL OR creator_id = ?2)
            ORDER BY created_at DESC, id DESC
            LIMIT ?3 OFFSET ?4
            "#,
            SELECT_COLUMNS
        );

        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(
            params![
                filter.kind.map(|k| k.as_str()),
                filter.creator_id,
                limit,
                filter.offset
            ],
            map_task_row,
        )?;

        let mut tasks = Vec::new();
        for row in rows {
            tasks.push(row?);
        }
        Ok(tasks)
    }
}

/// 文本列 → 枚举
fn parse_text<T: FromStr<Err = String>>(idx: usize, value: String) -> rusqlite::Result<T> {
    value
        .parse::<T>()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, e.into()))
}

/// 行 → TransferTask（列顺序见 SELECT_COLUMNS）
fn map_task_row(row: &Row<'_>) -> rusqlite::Result<TransferTask> {
    let properties: Option<String> = row.get(7)?;
    let properties = match properties.as_deref() {
        Some(json) if !json.is_empty() => serde_json::from_str::<TaskProperties>(json)
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(7, Type::Text, Box::new(e)))?,
        _ => TaskProperties::default(),
    };

    let approval_status = match row.get::<_, Option<String>>(15)? {
        Some(s) => Some(parse_text::<ApprovalStatus>(15, s)?),
        None => None,
    };

    Ok(TransferTask {
        task_id: row.get(0)?,
        task_name: row.get(1)?,
        creator_id: row.get(2)?,
        kind: parse_text(3, row.get(3)?)?,
        handler: row.get(4)?,
        status: parse_text(5, row.get(5)?)?,
        file_path: row.get(6)?,
        properties,
        error: row.get(8)?,
        total_count: row.get::<_, Option<i64>>(9)?.map(|v| v.max(0) as u64),
        error_file_path: row.get(10)?,
        started_at: row.get(11)?,
        ended_at: row.get(12)?,
        duration: row.get(13)?,
        approver_id: row.get(14)?,
        approval_status,
        approval_comment: row.get(16)?,
        approval_at: row.get(17)?,
        created_at: row.get(18)?,
        updated_at: row.get(19)?,
    })
}
