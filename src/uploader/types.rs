//! 上传核心类型定义
//!
//! 断点续传引擎共用的数据结构与错误类型

use serde::{Deserialize, Serialize};

/// 上传业务类型
///
/// 两条独立配置的上传流水线共用同一套代码，
/// 各自拥有独立的存储目录、准入队列与数据库表
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UploadKind {
    /// 项目文件上传
    Project,
    /// 课程模块上传
    Module,
}

impl UploadKind {
    /// 获取业务类型的显示名称
    pub fn as_str(&self) -> &'static str {
        match self {
            UploadKind::Project => "project",
            UploadKind::Module => "module",
        }
    }

    /// 从路径参数解析业务类型（无效值返回 None）
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "project" => Some(UploadKind::Project),
            "module" => Some(UploadKind::Module),
            _ => None,
        }
    }
}

impl std::fmt::Display for UploadKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// 上传元数据
///
/// 创建时由客户端提供的有序键值对（文件名、内容类型、业务字段等），
/// 创建后不可变。保序是协议要求，因此内部用向量而非哈希表
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UploadMetadata(Vec<(String, String)>);

impl UploadMetadata {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    /// 追加一个键值对（重复键保留首个，后续忽略）
    pub fn push(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        if self.get(&key).is_none() {
            self.0.push((key, value.into()));
        }
    }

    /// 按键查值
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<(String, String)> for UploadMetadata {
    fn from_iter<T: IntoIterator<Item = (String, String)>>(iter: T) -> Self {
        let mut metadata = Self::new();
        for (k, v) in iter {
            metadata.push(k, v);
        }
        metadata
    }
}

/// 上传描述符
///
/// 单个上传的规范状态，以 JSON 格式存储在 .meta 边车文件中。
/// 不变式：`0 <= offset <= size`，`offset == size` 即上传完成
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadDescriptor {
    /// 上传 ID（对引擎不透明，生命周期内不变）
    pub id: String,

    /// 声明的总字节数（创建时固定，不再变更）
    pub size: u64,

    /// 已持久化的字节数（单调不减）
    pub offset: u64,

    /// 创建时提供的元数据
    pub metadata: UploadMetadata,
}

impl UploadDescriptor {
    pub fn new(id: String, size: u64, metadata: UploadMetadata) -> Self {
        Self {
            id,
            size,
            offset: 0,
            metadata,
        }
    }

    /// 是否已接收全部字节
    pub fn is_complete(&self) -> bool {
        self.offset == self.size
    }

    /// 上传进度百分比（0.0 - 100.0）
    ///
    /// size 在创建时保证大于 0，不存在除零情况
    pub fn progress(&self) -> f64 {
        (self.offset as f64 / self.size as f64) * 100.0
    }

    /// 剩余字节数
    pub fn remaining(&self) -> u64 {
        self.size.saturating_sub(self.offset)
    }
}

/// 上传错误类型
///
/// 存储层与队列层返回精确类型，管理层不转换协议相关错误
/// （Conflict / PayloadTooLarge 原样透传给协议层设置响应头）
#[derive(Debug, thiserror::Error)]
pub enum UploadError {
    /// 上传不存在
    #[error("上传不存在: {0}")]
    NotFound(String),

    /// 重复创建
    #[error("上传已存在: {0}")]
    AlreadyExists(String),

    /// 偏移量冲突（携带当前真实偏移，客户端须以此重新同步）
    #[error("偏移量冲突，当前偏移为 {current}")]
    Conflict { current: u64 },

    /// 超出大小限制
    #[error("字节数 {size} 超过上限 {limit}")]
    PayloadTooLarge { size: u64, limit: u64 },

    /// 输入校验失败
    #[error("校验失败: {0}")]
    Validation(String),

    /// 上传尚未完成，不能定稿
    #[error("上传未完成: 已接收 {offset}/{size} 字节")]
    NotComplete { offset: u64, size: u64 },

    /// 底层存储 I/O 错误
    #[error("存储 I/O 错误: {0}")]
    Io(#[from] std::io::Error),

    /// 其他内部错误
    #[error("内部错误: {0}")]
    Internal(String),
}

impl UploadError {
    /// 是否为"不存在"错误（清理路径据此保持幂等）
    pub fn is_not_found(&self) -> bool {
        matches!(self, UploadError::NotFound(_))
    }
}
