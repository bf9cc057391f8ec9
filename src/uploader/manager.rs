//! 上传管理器
//!
//! 面向协议层的编排入口：输入校验（大小上限、元数据策略）在这里，
//! 字节落盘交给分片存储，名额记账交给准入队列。
//! 协议路径上管理器是两者唯一的调用方；协议相关错误
//!（Conflict / PayloadTooLarge）原样透传，协议层据此设置响应头

use std::path::Path;
use std::sync::Arc;

use serde::Serialize;
use tracing::{info, warn};

use super::chunk_store::ChunkStore;
use super::queue::{AdmissionQueue, QueueSnapshot};
use super::types::{UploadDescriptor, UploadError, UploadKind, UploadMetadata};

/// 模块上传允许的资源类型
pub const MODULE_TYPES: [&str; 4] = ["video", "document", "slide", "archive"];

/// 名称字段长度下限（模块上传）
const MODULE_NAME_MIN: usize = 3;
/// 名称/文件名字段长度上限（按字符计）
const NAME_MAX: usize = 255;
/// 学期字段取值范围
const SEMESTER_RANGE: std::ops::RangeInclusive<u32> = 1..=8;

/// 名额检查结果（JSON 返回给客户端轮询）
#[derive(Debug, Clone, Serialize)]
pub struct SlotStatus {
    /// 是否还有活跃空位
    pub available: bool,
    /// 等待队列长度
    pub queue_length: usize,
    /// 当前活跃上传数
    pub active_uploads: usize,
    /// 并发上限
    pub max_concurrent: usize,
    /// 给客户端的提示文案
    pub message: String,
}

/// 上传管理器
///
/// 每个业务类型一个实例，持有该类型自己的存储、队列与大小上限
#[derive(Debug)]
pub struct UploadManager {
    kind: UploadKind,
    store: Arc<ChunkStore>,
    queue: Arc<AdmissionQueue>,
    /// 单次上传允许声明的最大字节数
    max_upload_size: u64,
}

impl UploadManager {
    pub fn new(
        kind: UploadKind,
        store: Arc<ChunkStore>,
        queue: Arc<AdmissionQueue>,
        max_upload_size: u64,
    ) -> Self {
        Self {
            kind,
            store,
            queue,
            max_upload_size,
        }
    }

    pub fn kind(&self) -> UploadKind {
        self.kind
    }

    pub fn max_upload_size(&self) -> u64 {
        self.max_upload_size
    }

    // ========================================================================
    // 发起与校验
    // ========================================================================

    /// 名额检查：完全由准入队列状态推导
    pub fn check_slot(&self) -> SlotStatus {
        let snapshot = self.queue.snapshot();
        let max_concurrent = self.queue.max_concurrent();
        let available = snapshot.active.len() < max_concurrent;
        let message = if available {
            "可以开始上传".to_string()
        } else {
            format!(
                "上传名额已满：{} 个在传，{} 个排队中",
                snapshot.active.len(),
                snapshot.queued.len()
            )
        };
        SlotStatus {
            available,
            queue_length: snapshot.queued.len(),
            active_uploads: snapshot.active.len(),
            max_concurrent,
            message,
        }
    }

    /// 发起新上传
    ///
    /// 大小为 0 判为校验错误，超过本类型上限判为 PayloadTooLarge，
    /// 其余交给分片存储建档
    pub async fn initiate_upload(
        &self,
        id: &str,
        declared_size: u64,
        metadata: UploadMetadata,
    ) -> Result<(), UploadError> {
        if declared_size == 0 {
            return Err(UploadError::Validation(
                "声明的上传大小必须大于 0".to_string(),
            ));
        }
        if declared_size > self.max_upload_size {
            return Err(UploadError::PayloadTooLarge {
                size: declared_size,
                limit: self.max_upload_size,
            });
        }

        self.store
            .new_upload(UploadDescriptor::new(
                id.to_string(),
                declared_size,
                metadata,
            ))
            .await?;

        info!(
            "🚀 发起上传: kind={}, id={}, size={}",
            self.kind, id, declared_size
        );
        Ok(())
    }

    /// 按业务类型校验上传元数据
    ///
    /// 项目上传要求非空的 filename；模块上传要求 name（3-255 字符）、
    /// 固定枚举内的 type，以及可选的 semester（1-8）。
    /// 错误信息指明出错字段，缺失必填字段不做默认值兜底
    pub fn validate_metadata(&self, metadata: &UploadMetadata) -> Result<(), UploadError> {
        match self.kind {
            UploadKind::Project => {
                let filename = metadata
                    .get("filename")
                    .ok_or_else(|| UploadError::Validation("缺少必填字段 filename".to_string()))?;
                let len = filename.chars().count();
                if len == 0 || len > NAME_MAX {
                    return Err(UploadError::Validation(format!(
                        "filename 长度必须在 1-{} 字符之间",
                        NAME_MAX
                    )));
                }
            }
            UploadKind::Module => {
                let name = metadata
                    .get("name")
                    .ok_or_else(|| UploadError::Validation("缺少必填字段 name".to_string()))?;
                let len = name.chars().count();
                if len < MODULE_NAME_MIN || len > NAME_MAX {
                    return Err(UploadError::Validation(format!(
                        "name 长度必须在 {}-{} 字符之间",
                        MODULE_NAME_MIN, NAME_MAX
                    )));
                }

                let kind = metadata
                    .get("type")
                    .ok_or_else(|| UploadError::Validation("缺少必填字段 type".to_string()))?;
                if !MODULE_TYPES.contains(&kind) {
                    return Err(UploadError::Validation(format!(
                        "type 必须是 {:?} 之一，实际为 {:?}",
                        MODULE_TYPES, kind
                    )));
                }

                if let Some(semester) = metadata.get("semester") {
                    let value: u32 = semester.parse().map_err(|_| {
                        UploadError::Validation(format!(
                            "semester 必须是数字，实际为 {:?}",
                            semester
                        ))
                    })?;
                    if !SEMESTER_RANGE.contains(&value) {
                        return Err(UploadError::Validation(format!(
                            "semester 必须在 {}-{} 之间，实际为 {}",
                            SEMESTER_RANGE.start(),
                            SEMESTER_RANGE.end(),
                            value
                        )));
                    }
                }
            }
        }
        Ok(())
    }

    // ========================================================================
    // 分片存储委托
    // ========================================================================

    /// 写入分片（纯委托，Conflict / PayloadTooLarge 语义不变）
    pub async fn handle_chunk(
        &self,
        id: &str,
        offset: u64,
        data: &[u8],
    ) -> Result<u64, UploadError> {
        self.store.write_chunk(id, offset, data).await
    }

    /// 上传状态快照
    pub async fn get_status(&self, id: &str) -> Result<UploadDescriptor, UploadError> {
        self.store.get_info(id).await
    }

    pub async fn get_progress(&self, id: &str) -> Result<f64, UploadError> {
        self.store.get_progress(id).await
    }

    pub async fn is_complete(&self, id: &str) -> Result<bool, UploadError> {
        self.store.is_complete(id).await
    }

    /// 定稿到最终路径
    pub async fn finalize_upload(&self, id: &str, destination: &Path) -> Result<(), UploadError> {
        self.store.finalize_upload(id, destination).await
    }

    /// 取消上传（终止存储条目，幂等）
    pub async fn cancel_upload(&self, id: &str) -> Result<(), UploadError> {
        self.store.terminate(id).await
    }

    // ========================================================================
    // 准入队列委托
    // ========================================================================

    pub fn add_to_queue(&self, id: &str) {
        self.queue.add(id);
    }

    pub fn remove_from_queue(&self, id: &str) -> Result<(), UploadError> {
        self.queue.remove(id)
    }

    /// 结束活跃上传并返回被提升的等待者（如有）
    pub fn finish_upload(&self, id: &str) -> Option<String> {
        self.queue.finish_upload(id)
    }

    pub fn can_accept_upload(&self) -> bool {
        self.queue.can_accept_upload()
    }

    pub fn is_active_upload(&self, id: &str) -> bool {
        self.queue.has_active_upload(id)
    }

    pub fn queue_snapshot(&self) -> QueueSnapshot {
        self.queue.snapshot()
    }

    pub fn queue_position(&self, id: &str) -> Option<usize> {
        self.queue.queue_position(id)
    }

    /// 依据持久化记录重建准入状态（进程重启后调用）
    pub fn load_queue_from_db(&self, ids: &[String]) {
        self.queue.load_from_db(ids);
    }

    /// 清空并重置：终止所有活跃上传，然后整体清空队列
    ///
    /// 管理操作，两步之间不保证原子性；与在途写入竞态丢失
    /// 个别分片属于可接受行为
    pub async fn reset_upload_queue(&self) {
        let active = self.queue.active_uploads();
        for id in &active {
            if let Err(e) = self.store.terminate(id).await {
                warn!(
                    "重置时终止上传失败: kind={}, id={}, error={}",
                    self.kind, id, e
                );
            }
        }
        self.queue.clear();
        info!(
            "🔄 上传队列已重置: kind={}, 终止 {} 个活跃上传",
            self.kind,
            active.len()
        );
    }
}
