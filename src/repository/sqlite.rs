//! 上传记录的 SQLite 实现
//!
//! 单个数据库文件承载项目/模块两张结构相同的表，
//! 连接经 r2d2 池化；阻塞查询统一放到 spawn_blocking 中执行，
//! 避免卡住异步工作线程

use std::path::Path;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, OptionalExtension, Row};
use tracing::{debug, info};

use super::{UploadRecord, UploadRecordStatus, UploadRepository};

/// 连接池大小（上传台账的并发压力很小）
const POOL_SIZE: u32 = 4;

/// SQLite 上传记录仓储
///
/// 同一个连接池可以派生多个实例，各自绑定一张表
pub struct SqliteUploadRepository {
    pool: Pool<SqliteConnectionManager>,
    table: &'static str,
}

impl SqliteUploadRepository {
    /// 打开（或创建）数据库文件并返回连接池
    pub fn open_pool(db_path: &Path) -> Result<Pool<SqliteConnectionManager>> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let manager = SqliteConnectionManager::file(db_path);
        let pool = Pool::builder()
            .max_size(POOL_SIZE)
            .build(manager)
            .context("创建 SQLite 连接池失败")?;
        Ok(pool)
    }

    /// 在指定表上创建仓储实例并初始化表结构
    pub fn new(pool: Pool<SqliteConnectionManager>, table: &'static str) -> Result<Self> {
        let repo = Self { pool, table };
        repo.init_table()?;
        Ok(repo)
    }

    /// 初始化记录表与索引
    fn init_table(&self) -> Result<()> {
        let conn = self.pool.get().context("获取数据库连接失败")?;

        conn.execute(
            &format!(
                r#"
                CREATE TABLE IF NOT EXISTS {table} (
                    id TEXT PRIMARY KEY,
                    filename TEXT NOT NULL,
                    size INTEGER NOT NULL,
                    status TEXT NOT NULL,
                    created_at INTEGER NOT NULL,
                    updated_at INTEGER NOT NULL,
                    expires_at INTEGER NOT NULL
                )
                "#,
                table = self.table
            ),
            [],
        )?;

        conn.execute(
            &format!(
                "CREATE INDEX IF NOT EXISTS idx_{table}_status_expires ON {table}(status, expires_at)",
                table = self.table
            ),
            [],
        )?;
        conn.execute(
            &format!(
                "CREATE INDEX IF NOT EXISTS idx_{table}_status_updated ON {table}(status, updated_at)",
                table = self.table
            ),
            [],
        )?;

        info!("上传记录表初始化完成: {}", self.table);
        Ok(())
    }

    /// 行到记录的转换（列顺序与 SELECT_COLUMNS 对应）
    fn row_to_record(row: &Row<'_>) -> rusqlite::Result<RawRecord> {
        Ok(RawRecord {
            id: row.get(0)?,
            filename: row.get(1)?,
            size: row.get(2)?,
            status: row.get(3)?,
            created_at: row.get(4)?,
            updated_at: row.get(5)?,
            expires_at: row.get(6)?,
        })
    }
}

const SELECT_COLUMNS: &str = "id, filename, size, status, created_at, updated_at, expires_at";

/// 数据库原始行（时间戳仍是秒数，状态仍是字符串）
struct RawRecord {
    id: String,
    filename: String,
    size: i64,
    status: String,
    created_at: i64,
    updated_at: i64,
    expires_at: i64,
}

impl RawRecord {
    fn into_record(self) -> Result<UploadRecord> {
        let status = UploadRecordStatus::parse(&self.status)
            .ok_or_else(|| anyhow!("未知的上传状态: {:?} (id={})", self.status, self.id))?;
        Ok(UploadRecord {
            id: self.id,
            filename: self.filename,
            size: self.size as u64,
            status,
            created_at: parse_timestamp(self.created_at)?,
            updated_at: parse_timestamp(self.updated_at)?,
            expires_at: parse_timestamp(self.expires_at)?,
        })
    }
}

fn parse_timestamp(secs: i64) -> Result<DateTime<Utc>> {
    Utc.timestamp_opt(secs, 0)
        .single()
        .ok_or_else(|| anyhow!("非法的时间戳: {}", secs))
}

#[async_trait]
impl UploadRepository for SqliteUploadRepository {
    async fn insert(&self, record: &UploadRecord) -> Result<()> {
        let pool = self.pool.clone();
        let sql = format!(
            "INSERT INTO {table} ({columns}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            table = self.table,
            columns = SELECT_COLUMNS
        );
        let owned = record.clone();

        tokio::task::spawn_blocking(move || -> Result<()> {
            let conn = pool.get().context("获取数据库连接失败")?;
            conn.execute(
                &sql,
                params![
                    owned.id,
                    owned.filename,
                    owned.size as i64,
                    owned.status.as_str(),
                    owned.created_at.timestamp(),
                    owned.updated_at.timestamp(),
                    owned.expires_at.timestamp(),
                ],
            )?;
            Ok(())
        })
        .await??;

        debug!("已写入上传记录: table={}, id={}", self.table, record.id);
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<UploadRecord>> {
        let pool = self.pool.clone();
        let sql = format!(
            "SELECT {columns} FROM {table} WHERE id = ?1",
            columns = SELECT_COLUMNS,
            table = self.table
        );
        let id = id.to_string();

        let raw = tokio::task::spawn_blocking(move || -> Result<Option<RawRecord>> {
            let conn = pool.get().context("获取数据库连接失败")?;
            let raw = conn
                .query_row(&sql, params![id], Self::row_to_record)
                .optional()?;
            Ok(raw)
        })
        .await??;

        raw.map(RawRecord::into_record).transpose()
    }

    async fn touch(&self, id: &str) -> Result<()> {
        let pool = self.pool.clone();
        let sql = format!(
            "UPDATE {table} SET updated_at = ?1 WHERE id = ?2",
            table = self.table
        );
        let id = id.to_string();

        tokio::task::spawn_blocking(move || -> Result<()> {
            let conn = pool.get().context("获取数据库连接失败")?;
            conn.execute(&sql, params![Utc::now().timestamp(), id])?;
            Ok(())
        })
        .await?
    }

    async fn update_status(&self, id: &str, status: UploadRecordStatus) -> Result<()> {
        let pool = self.pool.clone();
        let sql = format!(
            "UPDATE {table} SET status = ?1, updated_at = ?2 WHERE id = ?3",
            table = self.table
        );
        let id = id.to_string();

        tokio::task::spawn_blocking(move || -> Result<()> {
            let conn = pool.get().context("获取数据库连接失败")?;
            conn.execute(&sql, params![status.as_str(), Utc::now().timestamp(), id])?;
            Ok(())
        })
        .await?
    }

    async fn delete(&self, id: &str) -> Result<()> {
        let pool = self.pool.clone();
        let sql = format!("DELETE FROM {table} WHERE id = ?1", table = self.table);
        let id = id.to_string();

        tokio::task::spawn_blocking(move || -> Result<()> {
            let conn = pool.get().context("获取数据库连接失败")?;
            conn.execute(&sql, params![id])?;
            Ok(())
        })
        .await?
    }

    async fn get_expired_uploads(&self, before: DateTime<Utc>) -> Result<Vec<UploadRecord>> {
        let pool = self.pool.clone();
        let sql = format!(
            "SELECT {columns} FROM {table} WHERE status = 'uploading' AND expires_at < ?1 ORDER BY expires_at ASC",
            columns = SELECT_COLUMNS,
            table = self.table
        );

        let raws = tokio::task::spawn_blocking(move || -> Result<Vec<RawRecord>> {
            let conn = pool.get().context("获取数据库连接失败")?;
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(params![before.timestamp()], Self::row_to_record)?;
            Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
        })
        .await??;

        raws.into_iter().map(RawRecord::into_record).collect()
    }

    async fn get_abandoned_uploads(&self, idle_timeout: Duration) -> Result<Vec<UploadRecord>> {
        let idle = chrono::Duration::from_std(idle_timeout)
            .map_err(|e| anyhow!("非法的搁置超时: {}", e))?;
        let cutoff = Utc::now() - idle;

        let pool = self.pool.clone();
        let sql = format!(
            "SELECT {columns} FROM {table} WHERE status = 'uploading' AND updated_at < ?1 ORDER BY updated_at ASC",
            columns = SELECT_COLUMNS,
            table = self.table
        );

        let raws = tokio::task::spawn_blocking(move || -> Result<Vec<RawRecord>> {
            let conn = pool.get().context("获取数据库连接失败")?;
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(params![cutoff.timestamp()], Self::row_to_record)?;
            Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
        })
        .await??;

        raws.into_iter().map(RawRecord::into_record).collect()
    }

    async fn list_unfinished(&self) -> Result<Vec<String>> {
        let pool = self.pool.clone();
        let sql = format!(
            "SELECT id FROM {table} WHERE status = 'uploading' ORDER BY created_at ASC, id ASC",
            table = self.table
        );

        tokio::task::spawn_blocking(move || -> Result<Vec<String>> {
            let conn = pool.get().context("获取数据库连接失败")?;
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
            Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
        })
        .await?
    }
}
