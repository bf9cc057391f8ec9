//! 分片存储
//!
//! 断点续传的持久化核心：每个上传对应一个增长中的载荷文件和一个
//! 描述符文件，偏移量只有在分片字节落盘后才通过描述符原子提交。
//!
//! ## 文件布局
//!
//! - `{data_dir}/{id}.part`：载荷文件（按偏移追加）
//! - `{data_dir}/{id}.meta`：描述符文件（JSON，临时文件 + 原子重命名写入）
//!
//! 同一 ID 的写入经由锁表串行化，不同 ID 完全并行。
//! 存储层不感知准入调度，也不访问数据库

use std::io::{self, SeekFrom};
use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tracing::{debug, info, warn};

use super::lock_table::LockTable;
use super::types::{UploadDescriptor, UploadError, UploadMetadata};

/// 载荷文件扩展名
const PAYLOAD_EXTENSION: &str = "part";
/// 描述符文件扩展名
const META_EXTENSION: &str = "meta";
/// 上传 ID 的最大长度
const MAX_ID_LEN: usize = 128;

/// 分片存储
///
/// 面向单个业务类型的暂存目录，持有该目录下所有上传的锁表
#[derive(Debug)]
pub struct ChunkStore {
    /// 暂存目录（载荷与描述符同目录存放）
    data_dir: PathBuf,
    /// 按上传 ID 细分的排他锁表
    locks: LockTable,
}

impl ChunkStore {
    /// 创建分片存储并确保暂存目录存在
    pub async fn new(data_dir: impl Into<PathBuf>) -> Result<Self, UploadError> {
        let data_dir = data_dir.into();
        fs::create_dir_all(&data_dir).await?;
        debug!("分片存储就绪: {:?}", data_dir);
        Ok(Self {
            data_dir,
            locks: LockTable::new(),
        })
    }

    /// 暂存目录路径
    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    // ========================================================================
    // 路径与校验
    // ========================================================================

    fn payload_path(&self, id: &str) -> PathBuf {
        self.data_dir.join(format!("{}.{}", id, PAYLOAD_EXTENSION))
    }

    fn sidecar_path(&self, id: &str) -> PathBuf {
        self.data_dir.join(format!("{}.{}", id, META_EXTENSION))
    }

    fn sidecar_temp_path(&self, id: &str) -> PathBuf {
        self.data_dir.join(format!("{}.{}.tmp", id, META_EXTENSION))
    }

    /// 校验上传 ID 可以安全用作文件名
    fn validate_id(id: &str) -> Result<(), UploadError> {
        let valid = !id.is_empty()
            && id.len() <= MAX_ID_LEN
            && id
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_');
        if valid {
            Ok(())
        } else {
            Err(UploadError::Validation(format!("非法的上传 ID: {:?}", id)))
        }
    }

    // ========================================================================
    // 描述符读写
    // ========================================================================

    /// 加载描述符文件
    async fn load_descriptor(&self, id: &str) -> Result<UploadDescriptor, UploadError> {
        Self::validate_id(id)?;
        let path = self.sidecar_path(id);
        let bytes = match fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(UploadError::NotFound(id.to_string()));
            }
            Err(e) => return Err(e.into()),
        };
        serde_json::from_slice(&bytes)
            .map_err(|e| UploadError::Internal(format!("解析描述符失败 {:?}: {}", path, e)))
    }

    /// 保存描述符文件
    ///
    /// 先写入 `.meta.tmp` 再原子重命名，防止写入中断导致描述符损坏
    async fn save_descriptor(&self, descriptor: &UploadDescriptor) -> Result<(), UploadError> {
        let path = self.sidecar_path(&descriptor.id);
        let temp_path = self.sidecar_temp_path(&descriptor.id);

        let json = serde_json::to_vec_pretty(descriptor)
            .map_err(|e| UploadError::Internal(format!("序列化描述符失败: {}", e)))?;

        fs::write(&temp_path, &json).await?;
        fs::rename(&temp_path, &path).await?;
        Ok(())
    }

    // ========================================================================
    // 上传生命周期
    // ========================================================================

    /// 创建新上传
    ///
    /// 建立空载荷文件与初始描述符。重复 ID 返回 AlreadyExists
    ///
    /// # Arguments
    /// * `descriptor` - 初始描述符（size > 0，offset 必须为 0）
    pub async fn new_upload(&self, descriptor: UploadDescriptor) -> Result<(), UploadError> {
        Self::validate_id(&descriptor.id)?;
        if descriptor.size == 0 {
            return Err(UploadError::Validation(
                "上传大小必须大于 0".to_string(),
            ));
        }
        if descriptor.offset != 0 {
            return Err(UploadError::Validation(
                "新建上传的偏移量必须为 0".to_string(),
            ));
        }

        let _guard = self.locks.acquire(&descriptor.id).await;

        if fs::try_exists(self.sidecar_path(&descriptor.id)).await? {
            return Err(UploadError::AlreadyExists(descriptor.id.clone()));
        }

        // 先建载荷文件再写描述符：描述符存在即视为上传存在
        File::create(self.payload_path(&descriptor.id)).await?;
        self.save_descriptor(&descriptor).await?;

        info!(
            "📦 创建上传: id={}, size={}, metadata_entries={}",
            descriptor.id,
            descriptor.size,
            descriptor.metadata.len()
        );
        Ok(())
    }

    /// 写入一个分片
    ///
    /// 获取该 ID 的排他锁后校验偏移量：与当前存储偏移不符时返回
    /// Conflict（携带真实偏移，不做任何改动）；写入会超出声明大小时
    /// 返回 PayloadTooLarge。字节落盘之后才原子更新描述符偏移，
    /// 任何中途失败都不会推进已记录的偏移量
    ///
    /// # Arguments
    /// * `id` - 上传 ID
    /// * `offset` - 分片起始偏移（必须等于当前存储偏移）
    /// * `data` - 分片字节
    ///
    /// # Returns
    /// 写入后的新偏移量
    pub async fn write_chunk(&self, id: &str, offset: u64, data: &[u8]) -> Result<u64, UploadError> {
        let guard = self.locks.acquire(id).await;

        // 拿到锁后重新读取描述符：等锁期间上传可能已被终止
        let mut descriptor = self.load_descriptor(id).await?;

        if offset != descriptor.offset {
            debug!(
                "偏移量冲突: id={}, 请求 {}, 实际 {}",
                id, offset, descriptor.offset
            );
            return Err(UploadError::Conflict {
                current: descriptor.offset,
            });
        }

        let new_offset = offset + data.len() as u64;
        if new_offset > descriptor.size {
            return Err(UploadError::PayloadTooLarge {
                size: new_offset,
                limit: descriptor.size,
            });
        }

        if data.is_empty() {
            return Ok(descriptor.offset);
        }

        let payload_path = self.payload_path(id);
        let mut file = match OpenOptions::new().write(true).open(&payload_path).await {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                // 描述符在而载荷缺失：与终止操作竞态后的残留，按不存在处理
                return Err(UploadError::NotFound(id.to_string()));
            }
            Err(e) => return Err(e.into()),
        };

        // 定位到记录偏移再写入，之前失败写入留下的多余字节会被覆盖
        file.seek(SeekFrom::Start(offset)).await?;
        file.write_all(data).await?;
        file.sync_data().await?;

        // 提交前确认锁未被管理性回收，否则放弃推进偏移
        if !self.locks.is_current(&guard) {
            warn!(
                "⚠️ 上传锁在写入期间被回收，放弃提交: id={}, offset={}",
                id, offset
            );
            return Err(UploadError::Conflict {
                current: descriptor.offset,
            });
        }

        descriptor.offset = new_offset;
        self.save_descriptor(&descriptor).await?;

        debug!(
            "分片落盘: id={}, {} -> {} / {}",
            id, offset, new_offset, descriptor.size
        );
        Ok(new_offset)
    }

    /// 读取描述符快照（只读，不取锁）
    pub async fn get_info(&self, id: &str) -> Result<UploadDescriptor, UploadError> {
        self.load_descriptor(id).await
    }

    /// 是否已接收全部字节
    pub async fn is_complete(&self, id: &str) -> Result<bool, UploadError> {
        Ok(self.load_descriptor(id).await?.is_complete())
    }

    /// 上传进度百分比（0.0 - 100.0）
    pub async fn get_progress(&self, id: &str) -> Result<f64, UploadError> {
        Ok(self.load_descriptor(id).await?.progress())
    }

    /// 定稿：把完整载荷迁入最终存储位置并清除暂存记录
    ///
    /// 同卷时直接重命名，跨卷回退为复制后删除源文件。
    /// 未完成的上传返回 NotComplete；定稿成功后再次调用返回 NotFound
    ///
    /// # Arguments
    /// * `id` - 上传 ID
    /// * `destination` - 外部路径策略解析出的最终路径
    pub async fn finalize_upload(&self, id: &str, destination: &Path) -> Result<(), UploadError> {
        let guard = self.locks.acquire(id).await;

        let descriptor = self.load_descriptor(id).await?;
        if !descriptor.is_complete() {
            return Err(UploadError::NotComplete {
                offset: descriptor.offset,
                size: descriptor.size,
            });
        }

        if let Some(parent) = destination.parent() {
            fs::create_dir_all(parent).await?;
        }

        let payload_path = self.payload_path(id);
        if let Err(e) = fs::rename(&payload_path, destination).await {
            // 跨卷移动无法重命名，回退为复制 + 删除源文件
            debug!("重命名失败（{}），回退为复制: id={}", e, id);
            fs::copy(&payload_path, destination).await?;
            fs::remove_file(&payload_path).await?;
        }

        fs::remove_file(self.sidecar_path(id)).await?;

        drop(guard);
        self.locks.remove(id);

        info!(
            "✅ 上传定稿完成: id={}, size={}, destination={:?}",
            id, descriptor.size, destination
        );
        Ok(())
    }

    /// 终止上传：删除载荷、描述符并回收锁
    ///
    /// 对不存在的 ID 静默成功（幂等），清理循环与取消路径可无条件调用。
    /// 先回收锁表项，使同一 ID 的在途写入在提交前失败
    pub async fn terminate(&self, id: &str) -> Result<(), UploadError> {
        Self::validate_id(id)?;
        self.locks.remove(id);

        let mut removed = false;
        for path in [
            self.payload_path(id),
            self.sidecar_path(id),
            self.sidecar_temp_path(id),
        ] {
            match fs::remove_file(&path).await {
                Ok(()) => removed = true,
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }

        if removed {
            info!("🗑️ 终止上传: id={}", id);
        } else {
            debug!("终止不存在的上传（幂等免错）: id={}", id);
        }
        Ok(())
    }

    /// 强制回收持有超过 ttl 的上传锁，返回回收数量
    pub fn cleanup_stale_locks(&self, ttl: Duration) -> usize {
        self.locks.cleanup_stale(ttl)
    }

    /// 扫描暂存目录中全部上传 ID（按描述符文件枚举）
    pub async fn scan_upload_ids(&self) -> Result<Vec<String>, UploadError> {
        let mut ids = Vec::new();
        let mut entries = fs::read_dir(&self.data_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            if let Some(ext) = path.extension() {
                if ext == META_EXTENSION {
                    if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                        ids.push(stem.to_string());
                    }
                }
            }
        }
        Ok(ids)
    }
}

/// 构造初始描述符的便捷函数
pub fn make_descriptor(id: &str, size: u64, metadata: UploadMetadata) -> UploadDescriptor {
    UploadDescriptor::new(id.to_string(), size, metadata)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    async fn new_store(dir: &tempfile::TempDir) -> ChunkStore {
        ChunkStore::new(dir.path().join("staging")).await.unwrap()
    }

    #[tokio::test]
    async fn test_new_upload_and_get_info() {
        let dir = tempdir().unwrap();
        let store = new_store(&dir).await;

        let mut metadata = UploadMetadata::new();
        metadata.push("filename", "demo.bin");
        store
            .new_upload(make_descriptor("u1", 30, metadata))
            .await
            .unwrap();

        let info = store.get_info("u1").await.unwrap();
        assert_eq!(info.id, "u1");
        assert_eq!(info.size, 30);
        assert_eq!(info.offset, 0);
        assert_eq!(info.metadata.get("filename"), Some("demo.bin"));

        // 重复创建
        let err = store
            .new_upload(make_descriptor("u1", 30, UploadMetadata::new()))
            .await
            .unwrap_err();
        assert!(matches!(err, UploadError::AlreadyExists(_)));
    }

    #[tokio::test]
    async fn test_new_upload_rejects_invalid_input() {
        let dir = tempdir().unwrap();
        let store = new_store(&dir).await;

        // 大小必须大于 0
        let err = store
            .new_upload(make_descriptor("u1", 0, UploadMetadata::new()))
            .await
            .unwrap_err();
        assert!(matches!(err, UploadError::Validation(_)));

        // ID 不能包含路径分隔符
        let err = store
            .new_upload(make_descriptor("../escape", 10, UploadMetadata::new()))
            .await
            .unwrap_err();
        assert!(matches!(err, UploadError::Validation(_)));

        let err = store.get_info("missing").await.unwrap_err();
        assert!(matches!(err, UploadError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_sequential_chunks_reach_completion() {
        let dir = tempdir().unwrap();
        let store = new_store(&dir).await;

        store
            .new_upload(make_descriptor("u1", 30, UploadMetadata::new()))
            .await
            .unwrap();

        assert_eq!(store.write_chunk("u1", 0, &[1u8; 10]).await.unwrap(), 10);
        assert!(!store.is_complete("u1").await.unwrap());

        assert_eq!(store.write_chunk("u1", 10, &[2u8; 10]).await.unwrap(), 20);
        let progress = store.get_progress("u1").await.unwrap();
        assert!((progress - 66.666).abs() < 0.01);

        assert_eq!(store.write_chunk("u1", 20, &[3u8; 10]).await.unwrap(), 30);
        assert!(store.is_complete("u1").await.unwrap());
        assert_eq!(store.get_progress("u1").await.unwrap(), 100.0);
    }

    #[tokio::test]
    async fn test_offset_mismatch_returns_conflict_without_mutation() {
        let dir = tempdir().unwrap();
        let store = new_store(&dir).await;

        store
            .new_upload(make_descriptor("u1", 30, UploadMetadata::new()))
            .await
            .unwrap();

        // 当前偏移为 0，从 5 写入必须冲突
        let err = store.write_chunk("u1", 5, b"hello").await.unwrap_err();
        match err {
            UploadError::Conflict { current } => assert_eq!(current, 0),
            other => panic!("预期 Conflict，实际 {:?}", other),
        }
        assert_eq!(store.get_info("u1").await.unwrap().offset, 0);

        // 推进后再用旧偏移重试同样冲突
        store.write_chunk("u1", 0, &[0u8; 10]).await.unwrap();
        let err = store.write_chunk("u1", 0, &[0u8; 5]).await.unwrap_err();
        match err {
            UploadError::Conflict { current } => assert_eq!(current, 10),
            other => panic!("预期 Conflict，实际 {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_write_beyond_declared_size_rejected() {
        let dir = tempdir().unwrap();
        let store = new_store(&dir).await;

        store
            .new_upload(make_descriptor("u1", 10, UploadMetadata::new()))
            .await
            .unwrap();
        store.write_chunk("u1", 0, &[7u8; 6]).await.unwrap();

        let err = store.write_chunk("u1", 6, &[7u8; 6]).await.unwrap_err();
        assert!(matches!(err, UploadError::PayloadTooLarge { .. }));
        // 越界写入不得推进偏移
        assert_eq!(store.get_info("u1").await.unwrap().offset, 6);
    }

    #[tokio::test]
    async fn test_finalize_moves_payload_and_empties_store() {
        let dir = tempdir().unwrap();
        let store = new_store(&dir).await;

        store
            .new_upload(make_descriptor("u1", 20, UploadMetadata::new()))
            .await
            .unwrap();
        assert_eq!(store.write_chunk("u1", 0, &[0xAB; 10]).await.unwrap(), 10);
        assert_eq!(store.get_progress("u1").await.unwrap(), 50.0);
        assert_eq!(store.write_chunk("u1", 10, &[0xCD; 10]).await.unwrap(), 20);
        assert!(store.is_complete("u1").await.unwrap());

        let destination = dir.path().join("final").join("u1.bin");
        store.finalize_upload("u1", &destination).await.unwrap();

        // 目标文件持有全部 20 字节
        let content = std::fs::read(&destination).unwrap();
        assert_eq!(content.len(), 20);
        assert_eq!(&content[..10], &[0xAB; 10]);
        assert_eq!(&content[10..], &[0xCD; 10]);

        // 暂存目录已清空
        assert!(store.scan_upload_ids().await.unwrap().is_empty());
        assert!(matches!(
            store.get_info("u1").await.unwrap_err(),
            UploadError::NotFound(_)
        ));

        // 定稿不幂等：再次调用返回 NotFound
        let err = store.finalize_upload("u1", &destination).await.unwrap_err();
        assert!(matches!(err, UploadError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_finalize_incomplete_fails() {
        let dir = tempdir().unwrap();
        let store = new_store(&dir).await;

        store
            .new_upload(make_descriptor("u1", 20, UploadMetadata::new()))
            .await
            .unwrap();
        store.write_chunk("u1", 0, &[1u8; 8]).await.unwrap();

        let destination = dir.path().join("final.bin");
        let err = store.finalize_upload("u1", &destination).await.unwrap_err();
        match err {
            UploadError::NotComplete { offset, size } => {
                assert_eq!(offset, 8);
                assert_eq!(size, 20);
            }
            other => panic!("预期 NotComplete，实际 {:?}", other),
        }
        assert!(!destination.exists());
    }

    #[tokio::test]
    async fn test_terminate_is_idempotent() {
        let dir = tempdir().unwrap();
        let store = new_store(&dir).await;

        // 终止从未存在的上传不报错
        store.terminate("ghost").await.unwrap();

        store
            .new_upload(make_descriptor("u1", 10, UploadMetadata::new()))
            .await
            .unwrap();
        store.write_chunk("u1", 0, &[9u8; 4]).await.unwrap();

        store.terminate("u1").await.unwrap();
        assert!(matches!(
            store.get_info("u1").await.unwrap_err(),
            UploadError::NotFound(_)
        ));
        assert!(store.scan_upload_ids().await.unwrap().is_empty());

        // 再次终止同样成功
        store.terminate("u1").await.unwrap();

        // 终止后写入失败
        let err = store.write_chunk("u1", 4, &[9u8; 2]).await.unwrap_err();
        assert!(matches!(err, UploadError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_parallel_writes_to_different_ids() {
        let dir = tempdir().unwrap();
        let store = std::sync::Arc::new(new_store(&dir).await);

        for id in ["u1", "u2", "u3"] {
            store
                .new_upload(make_descriptor(id, 40, UploadMetadata::new()))
                .await
                .unwrap();
        }

        let mut handles = Vec::new();
        for id in ["u1", "u2", "u3"] {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                for i in 0..4u64 {
                    let offset = i * 10;
                    let written = store.write_chunk(id, offset, &[i as u8; 10]).await.unwrap();
                    assert_eq!(written, offset + 10);
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        for id in ["u1", "u2", "u3"] {
            assert!(store.is_complete(id).await.unwrap());
        }
    }

    #[tokio::test]
    async fn test_state_survives_store_reopen() {
        let dir = tempdir().unwrap();
        let staging = dir.path().join("staging");

        {
            let store = ChunkStore::new(&staging).await.unwrap();
            store
                .new_upload(make_descriptor("u1", 16, UploadMetadata::new()))
                .await
                .unwrap();
            store.write_chunk("u1", 0, &[5u8; 8]).await.unwrap();
        }

        // 重新打开同一目录，上传进度从描述符恢复
        let reopened = ChunkStore::new(&staging).await.unwrap();
        let info = reopened.get_info("u1").await.unwrap();
        assert_eq!(info.offset, 8);
        assert_eq!(info.size, 16);

        // 继续写完
        assert_eq!(reopened.write_chunk("u1", 8, &[6u8; 8]).await.unwrap(), 16);
        assert!(reopened.is_complete("u1").await.unwrap());
    }

    #[tokio::test]
    async fn test_cleanup_stale_locks_noop_when_all_released() {
        let dir = tempdir().unwrap();
        let store = new_store(&dir).await;

        store
            .new_upload(make_descriptor("u1", 10, UploadMetadata::new()))
            .await
            .unwrap();
        store.write_chunk("u1", 0, &[1u8; 10]).await.unwrap();

        // 正常写入路径释放锁，清扫不应回收任何东西
        assert_eq!(store.cleanup_stale_locks(Duration::from_millis(0)), 0);
    }
}
