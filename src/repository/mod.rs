//! 上传记录仓储
//!
//! 持久化的上传台账：清理循环据此找出过期/搁置的上传，
//! 进程重启后据此重建准入队列。
//! 项目与模块两条流水线各持有一个结构相同、配置独立的仓储实例

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::uploader::UploadKind;

pub mod sqlite;

pub use sqlite::SqliteUploadRepository;

/// 项目上传记录表名
pub const PROJECT_TABLE: &str = "project_uploads";
/// 模块上传记录表名
pub const MODULE_TABLE: &str = "module_uploads";

/// 业务类型对应的记录表
pub fn table_for(kind: UploadKind) -> &'static str {
    match kind {
        UploadKind::Project => PROJECT_TABLE,
        UploadKind::Module => MODULE_TABLE,
    }
}

/// 上传记录状态
///
/// 使用 snake_case 序列化以便 JSON 与数据库可读
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UploadRecordStatus {
    /// 上传中（创建时的初始状态）
    Uploading,
    /// 已完成
    Completed,
    /// 超过绝对截止时间被清理
    Expired,
    /// 长时间无进展被判为搁置
    Failed,
}

impl UploadRecordStatus {
    /// 是否为终态（不再参与清理与重建）
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Uploading)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Uploading => "uploading",
            Self::Completed => "completed",
            Self::Expired => "expired",
            Self::Failed => "failed",
        }
    }

    /// 从数据库字符串解析（未知值返回 None）
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "uploading" => Some(Self::Uploading),
            "completed" => Some(Self::Completed),
            "expired" => Some(Self::Expired),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

impl std::fmt::Display for UploadRecordStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// 上传记录
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadRecord {
    /// 上传 ID
    pub id: String,
    /// 展示用文件名（取自元数据）
    pub filename: String,
    /// 声明的总字节数
    pub size: u64,
    /// 当前状态
    pub status: UploadRecordStatus,
    /// 创建时间
    pub created_at: DateTime<Utc>,
    /// 最后一次接收分片的时间（搁置判定依据）
    pub updated_at: DateTime<Utc>,
    /// 绝对过期截止时间（创建时按业务类型配置算出）
    pub expires_at: DateTime<Utc>,
}

impl UploadRecord {
    /// 创建一条新记录（初始状态为上传中）
    pub fn new(id: String, filename: String, size: u64, expires_at: DateTime<Utc>) -> Self {
        let now = Utc::now();
        Self {
            id,
            filename,
            size,
            status: UploadRecordStatus::Uploading,
            created_at: now,
            updated_at: now,
            expires_at,
        }
    }
}

/// 上传记录仓储接口
///
/// 清理循环消费前四个查询/变更；其余是创建与恢复流程所需。
/// 删除对不存在的 ID 静默成功，保持清理路径幂等
#[async_trait]
pub trait UploadRepository: Send + Sync {
    /// 写入一条新记录
    async fn insert(&self, record: &UploadRecord) -> Result<()>;

    /// 按 ID 读取
    async fn get(&self, id: &str) -> Result<Option<UploadRecord>>;

    /// 刷新最后活动时间（每个分片落盘后调用）
    async fn touch(&self, id: &str) -> Result<()>;

    /// 更新状态（同时刷新最后活动时间）
    async fn update_status(&self, id: &str, status: UploadRecordStatus) -> Result<()>;

    /// 删除记录（不存在时静默成功）
    async fn delete(&self, id: &str) -> Result<()>;

    /// 截止时间早于 before 且仍在上传中的记录
    async fn get_expired_uploads(&self, before: DateTime<Utc>) -> Result<Vec<UploadRecord>>;

    /// 最后活动时间早于 now - idle_timeout 且仍在上传中的记录
    async fn get_abandoned_uploads(&self, idle_timeout: Duration) -> Result<Vec<UploadRecord>>;

    /// 仍在上传中的全部 ID（按创建顺序，用于重建准入队列）
    async fn list_unfinished(&self) -> Result<Vec<String>>;
}
