//! 后台对账服务
//!
//! 周期性巡检分片仓与数据库记录之间的一致性：
//! 1. 过期上传（超过绝对截止时间）→ 丢弃分片并标记 expired
//! 2. 搁置上传（长时间无新分片写入）→ 丢弃分片并标记 failed
//! 3. 回收两个分片仓中持有过久的陈旧写锁
//!
//! 每个清理动作彼此隔离，单条记录失败不影响本轮其余工作。

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::repository::{UploadRecord, UploadRecordStatus, UploadRepository};
use crate::uploader::{ChunkStore, UploadKind};

/// 写锁持有超过该时长即视为持有者已消亡，可被回收
const LOCK_TTL: Duration = Duration::from_secs(5 * 60);

/// 后台对账服务
///
/// 生命周期由启动方独占管理：进程起始调用一次 `start`，
/// 关停时调用一次 `stop` 等待收尾。
pub struct Reconciler {
    /// 项目上传分片仓
    project_store: Arc<ChunkStore>,
    /// 模块上传分片仓
    module_store: Arc<ChunkStore>,
    /// 项目上传记录仓储
    project_repo: Arc<dyn UploadRepository>,
    /// 模块上传记录仓储
    module_repo: Arc<dyn UploadRepository>,
    /// 巡检间隔
    tick_interval: Duration,
    /// 判定搁置的闲置阈值
    idle_timeout: Duration,
    /// 是否正在运行
    running: AtomicBool,
    /// 后台任务的取消令牌与句柄
    worker: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

impl Reconciler {
    /// 创建对账服务（不启动后台任务）
    pub fn new(
        project_store: Arc<ChunkStore>,
        module_store: Arc<ChunkStore>,
        project_repo: Arc<dyn UploadRepository>,
        module_repo: Arc<dyn UploadRepository>,
        tick_interval: Duration,
        idle_timeout: Duration,
    ) -> Self {
        Self {
            project_store,
            module_store,
            project_repo,
            module_repo,
            tick_interval,
            idle_timeout,
            running: AtomicBool::new(false),
            worker: Mutex::new(None),
        }
    }

    fn store_for(&self, kind: UploadKind) -> &ChunkStore {
        match kind {
            UploadKind::Project => &self.project_store,
            UploadKind::Module => &self.module_store,
        }
    }

    fn repo_for(&self, kind: UploadKind) -> &dyn UploadRepository {
        match kind {
            UploadKind::Project => self.project_repo.as_ref(),
            UploadKind::Module => self.module_repo.as_ref(),
        }
    }

    // ==================== 生命周期 ====================

    /// 启动后台巡检循环
    ///
    /// 重复调用只告警，不会重复起任务。
    pub fn start(self: &Arc<Self>) {
        let mut worker = self.worker.lock();
        if self.running.swap(true, Ordering::SeqCst) {
            warn!("对账服务已在运行，忽略重复启动");
            return;
        }

        let token = CancellationToken::new();
        let loop_token = token.clone();
        let reconciler = Arc::clone(self);
        let handle = tokio::spawn(async move {
            info!(
                "🔄 对账服务已启动: tick={}s, idle_timeout={}s",
                reconciler.tick_interval.as_secs(),
                reconciler.idle_timeout.as_secs()
            );

            loop {
                tokio::select! {
                    _ = tokio::time::sleep(reconciler.tick_interval) => {
                        reconciler.run_cycle().await;
                    }
                    _ = loop_token.cancelled() => {
                        info!("对账服务收到停止信号");
                        break;
                    }
                }
            }
        });

        *worker = Some((token, handle));
    }

    /// 停止后台巡检并等待当前一轮收尾
    pub async fn stop(&self) {
        let taken = self.worker.lock().take();
        let (token, handle) = match taken {
            Some(pair) => pair,
            None => return,
        };

        token.cancel();
        if let Err(e) = handle.await {
            warn!("对账任务退出异常: {}", e);
        }
        self.running.store(false, Ordering::SeqCst);
        info!("对账服务已停止");
    }

    /// 检查是否正在运行
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    // ==================== 巡检逻辑 ====================

    /// 执行一轮巡检（定时循环与测试均直接调用）
    pub async fn run_cycle(&self) {
        debug!("对账巡检开始");
        let now = Utc::now();

        for kind in [UploadKind::Project, UploadKind::Module] {
            if let Err(e) = self.sweep_expired(kind, now).await {
                error!("过期巡检失败: kind={}, error={}", kind, e);
            }
            if let Err(e) = self.sweep_abandoned(kind).await {
                error!("搁置巡检失败: kind={}, error={}", kind, e);
            }
        }

        let stale = self.project_store.cleanup_stale_locks(LOCK_TTL)
            + self.module_store.cleanup_stale_locks(LOCK_TTL);
        if stale > 0 {
            warn!("⚠️ 回收陈旧写锁: count={}", stale);
        }
    }

    /// 清理超过绝对截止时间的上传
    async fn sweep_expired(&self, kind: UploadKind, now: DateTime<Utc>) -> Result<()> {
        let expired = self.repo_for(kind).get_expired_uploads(now).await?;
        if expired.is_empty() {
            return Ok(());
        }

        info!("发现过期上传: kind={}, count={}", kind, expired.len());
        for record in &expired {
            match self.discard(kind, record, UploadRecordStatus::Expired).await {
                Ok(()) => info!(
                    "🗑️ 过期上传已清理: kind={}, id={}, filename={}",
                    kind, record.id, record.filename
                ),
                Err(e) => warn!(
                    "清理过期上传失败: kind={}, id={}, error={}",
                    kind, record.id, e
                ),
            }
        }
        Ok(())
    }

    /// 将长时间无进展的上传标记为失败并清理分片
    async fn sweep_abandoned(&self, kind: UploadKind) -> Result<()> {
        let abandoned = self
            .repo_for(kind)
            .get_abandoned_uploads(self.idle_timeout)
            .await?;
        if abandoned.is_empty() {
            return Ok(());
        }

        info!("发现搁置上传: kind={}, count={}", kind, abandoned.len());
        for record in &abandoned {
            match self.discard(kind, record, UploadRecordStatus::Failed).await {
                Ok(()) => info!(
                    "🗑️ 搁置上传已标记失败: kind={}, id={}, 最后活动={}",
                    kind, record.id, record.updated_at
                ),
                Err(e) => warn!(
                    "清理搁置上传失败: kind={}, id={}, error={}",
                    kind, record.id, e
                ),
            }
        }
        Ok(())
    }

    /// 丢弃磁盘分片并把记录置为终态
    async fn discard(
        &self,
        kind: UploadKind,
        record: &UploadRecord,
        status: UploadRecordStatus,
    ) -> Result<()> {
        self.store_for(kind).terminate(&record.id).await?;
        self.repo_for(kind).update_status(&record.id, status).await?;
        Ok(())
    }

    // ==================== 单条清除 ====================

    /// 彻底清除一条上传：丢弃分片并删除数据库记录
    ///
    /// 供取消流程调用，目标不存在时同样静默成功。
    pub async fn cleanup_upload(&self, kind: UploadKind, upload_id: &str) -> Result<()> {
        self.store_for(kind).terminate(upload_id).await?;
        self.repo_for(kind).delete(upload_id).await?;
        info!("🗑️ 上传已彻底清除: kind={}, id={}", kind, upload_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::bail;
    use async_trait::async_trait;
    use tempfile::tempdir;

    use crate::uploader::{make_descriptor, UploadMetadata};

    /// 内存版仓储，可按需注入查询故障
    #[derive(Default)]
    struct MockRepository {
        records: Mutex<Vec<UploadRecord>>,
        fail_expired_query: bool,
    }

    impl MockRepository {
        fn seeded(records: Vec<UploadRecord>) -> Self {
            Self {
                records: Mutex::new(records),
                fail_expired_query: false,
            }
        }

        fn status_of(&self, id: &str) -> Option<UploadRecordStatus> {
            self.records
                .lock()
                .iter()
                .find(|r| r.id == id)
                .map(|r| r.status)
        }
    }

    #[async_trait]
    impl UploadRepository for MockRepository {
        async fn insert(&self, record: &UploadRecord) -> Result<()> {
            self.records.lock().push(record.clone());
            Ok(())
        }

        async fn get(&self, id: &str) -> Result<Option<UploadRecord>> {
            Ok(self.records.lock().iter().find(|r| r.id == id).cloned())
        }

        async fn touch(&self, id: &str) -> Result<()> {
            if let Some(record) = self.records.lock().iter_mut().find(|r| r.id == id) {
                record.updated_at = Utc::now();
            }
            Ok(())
        }

        async fn update_status(&self, id: &str, status: UploadRecordStatus) -> Result<()> {
            if let Some(record) = self.records.lock().iter_mut().find(|r| r.id == id) {
                record.status = status;
                record.updated_at = Utc::now();
            }
            Ok(())
        }

        async fn delete(&self, id: &str) -> Result<()> {
            self.records.lock().retain(|r| r.id != id);
            Ok(())
        }

        async fn get_expired_uploads(&self, before: DateTime<Utc>) -> Result<Vec<UploadRecord>> {
            if self.fail_expired_query {
                bail!("模拟仓储查询故障");
            }
            Ok(self
                .records
                .lock()
                .iter()
                .filter(|r| r.status == UploadRecordStatus::Uploading && r.expires_at < before)
                .cloned()
                .collect())
        }

        async fn get_abandoned_uploads(&self, idle_timeout: Duration) -> Result<Vec<UploadRecord>> {
            let cutoff = Utc::now() - chrono::Duration::from_std(idle_timeout)?;
            Ok(self
                .records
                .lock()
                .iter()
                .filter(|r| r.status == UploadRecordStatus::Uploading && r.updated_at < cutoff)
                .cloned()
                .collect())
        }

        async fn list_unfinished(&self) -> Result<Vec<String>> {
            let records = self.records.lock();
            let mut unfinished: Vec<&UploadRecord> = records
                .iter()
                .filter(|r| r.status == UploadRecordStatus::Uploading)
                .collect();
            unfinished.sort_by(|a, b| a.created_at.cmp(&b.created_at));
            Ok(unfinished.into_iter().map(|r| r.id.clone()).collect())
        }
    }

    async fn new_store(dir: &tempfile::TempDir, name: &str) -> Arc<ChunkStore> {
        Arc::new(ChunkStore::new(dir.path().join(name)).await.unwrap())
    }

    fn record_expiring_at(id: &str, expires_at: DateTime<Utc>) -> UploadRecord {
        UploadRecord::new(id.to_string(), format!("{}.bin", id), 64, expires_at)
    }

    #[tokio::test]
    async fn test_run_cycle_cleans_expired_upload() {
        let dir = tempdir().unwrap();
        let project_store = new_store(&dir, "project").await;
        let module_store = new_store(&dir, "module").await;

        // 分片仓里有数据，数据库记录已过期
        project_store
            .new_upload(make_descriptor("overdue", 64, UploadMetadata::new()))
            .await
            .unwrap();
        let project_repo = Arc::new(MockRepository::seeded(vec![record_expiring_at(
            "overdue",
            Utc::now() - chrono::Duration::hours(1),
        )]));
        let module_repo = Arc::new(MockRepository::default());

        let reconciler = Reconciler::new(
            project_store.clone(),
            module_store,
            project_repo.clone(),
            module_repo,
            Duration::from_millis(50),
            Duration::from_secs(3600),
        );
        reconciler.run_cycle().await;

        // 分片已删除，记录转入 expired
        let err = project_store.get_info("overdue").await.unwrap_err();
        assert!(err.is_not_found());
        assert_eq!(
            project_repo.status_of("overdue"),
            Some(UploadRecordStatus::Expired)
        );
    }

    #[tokio::test]
    async fn test_run_cycle_marks_abandoned_failed() {
        let dir = tempdir().unwrap();
        let project_store = new_store(&dir, "project").await;
        let module_store = new_store(&dir, "module").await;

        module_store
            .new_upload(make_descriptor("stalled", 64, UploadMetadata::new()))
            .await
            .unwrap();
        // 截止时间未到，但最后活动在一小时前
        let mut stalled = record_expiring_at("stalled", Utc::now() + chrono::Duration::hours(2));
        stalled.updated_at = Utc::now() - chrono::Duration::hours(1);
        let project_repo = Arc::new(MockRepository::default());
        let module_repo = Arc::new(MockRepository::seeded(vec![stalled]));

        let reconciler = Reconciler::new(
            project_store,
            module_store.clone(),
            project_repo,
            module_repo.clone(),
            Duration::from_millis(50),
            Duration::from_secs(60),
        );
        reconciler.run_cycle().await;

        let err = module_store.get_info("stalled").await.unwrap_err();
        assert!(err.is_not_found());
        assert_eq!(
            module_repo.status_of("stalled"),
            Some(UploadRecordStatus::Failed)
        );
    }

    #[tokio::test]
    async fn test_run_cycle_leaves_live_upload_alone() {
        let dir = tempdir().unwrap();
        let project_store = new_store(&dir, "project").await;
        let module_store = new_store(&dir, "module").await;

        project_store
            .new_upload(make_descriptor("active", 64, UploadMetadata::new()))
            .await
            .unwrap();
        let project_repo = Arc::new(MockRepository::seeded(vec![record_expiring_at(
            "active",
            Utc::now() + chrono::Duration::hours(2),
        )]));
        let module_repo = Arc::new(MockRepository::default());

        let reconciler = Reconciler::new(
            project_store.clone(),
            module_store,
            project_repo.clone(),
            module_repo,
            Duration::from_millis(50),
            Duration::from_secs(3600),
        );
        reconciler.run_cycle().await;

        // 活跃上传不受影响
        assert!(project_store.get_info("active").await.is_ok());
        assert_eq!(
            project_repo.status_of("active"),
            Some(UploadRecordStatus::Uploading)
        );
    }

    #[tokio::test]
    async fn test_repo_failure_does_not_block_other_flavor() {
        let dir = tempdir().unwrap();
        let project_store = new_store(&dir, "project").await;
        let module_store = new_store(&dir, "module").await;

        // 项目仓储查询一直失败，模块侧仍应照常清理
        let project_repo = Arc::new(MockRepository {
            records: Mutex::new(Vec::new()),
            fail_expired_query: true,
        });
        let module_repo = Arc::new(MockRepository::seeded(vec![record_expiring_at(
            "overdue",
            Utc::now() - chrono::Duration::hours(1),
        )]));

        let reconciler = Reconciler::new(
            project_store,
            module_store,
            project_repo,
            module_repo.clone(),
            Duration::from_millis(50),
            Duration::from_secs(3600),
        );
        reconciler.run_cycle().await;

        assert_eq!(
            module_repo.status_of("overdue"),
            Some(UploadRecordStatus::Expired)
        );
    }

    #[tokio::test]
    async fn test_cleanup_upload_removes_chunks_and_record() {
        let dir = tempdir().unwrap();
        let project_store = new_store(&dir, "project").await;
        let module_store = new_store(&dir, "module").await;

        project_store
            .new_upload(make_descriptor("doomed", 64, UploadMetadata::new()))
            .await
            .unwrap();
        let project_repo = Arc::new(MockRepository::seeded(vec![record_expiring_at(
            "doomed",
            Utc::now() + chrono::Duration::hours(2),
        )]));
        let module_repo = Arc::new(MockRepository::default());

        let reconciler = Reconciler::new(
            project_store.clone(),
            module_store,
            project_repo.clone(),
            module_repo,
            Duration::from_millis(50),
            Duration::from_secs(3600),
        );

        reconciler
            .cleanup_upload(UploadKind::Project, "doomed")
            .await
            .unwrap();
        let err = project_store.get_info("doomed").await.unwrap_err();
        assert!(err.is_not_found());
        assert_eq!(project_repo.status_of("doomed"), None);

        // 再次清除同一 ID 应静默成功
        reconciler
            .cleanup_upload(UploadKind::Project, "doomed")
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_start_stop_lifecycle() {
        let dir = tempdir().unwrap();
        let project_store = new_store(&dir, "project").await;
        let module_store = new_store(&dir, "module").await;

        let project_repo = Arc::new(MockRepository::seeded(vec![record_expiring_at(
            "overdue",
            Utc::now() - chrono::Duration::hours(1),
        )]));
        let module_repo = Arc::new(MockRepository::default());

        let reconciler = Arc::new(Reconciler::new(
            project_store,
            module_store,
            project_repo.clone(),
            module_repo,
            Duration::from_millis(50),
            Duration::from_secs(3600),
        ));

        reconciler.start();
        reconciler.start(); // 重复启动只应告警
        assert!(reconciler.is_running());

        // 等待几轮巡检
        tokio::time::sleep(Duration::from_millis(250)).await;
        reconciler.stop().await;
        assert!(!reconciler.is_running());

        assert_eq!(
            project_repo.status_of("overdue"),
            Some(UploadRecordStatus::Expired)
        );

        // 停止后可重新启动
        reconciler.start();
        assert!(reconciler.is_running());
        reconciler.stop().await;
    }
}
