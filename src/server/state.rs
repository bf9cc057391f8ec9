// 应用状态

use crate::config::{AppConfig, FlavorConfig};
use crate::reconciler::Reconciler;
use crate::repository::{SqliteUploadRepository, UploadRepository, MODULE_TABLE, PROJECT_TABLE};
use crate::uploader::{AdmissionQueue, ChunkStore, UploadKind, UploadManager};
use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::fs;
use tracing::info;

/// 应用全局状态
#[derive(Clone)]
pub struct AppState {
    /// 项目上传管理器
    pub project_manager: Arc<UploadManager>,
    /// 模块上传管理器
    pub module_manager: Arc<UploadManager>,
    /// 项目上传记录仓储
    pub project_repo: Arc<dyn UploadRepository>,
    /// 模块上传记录仓储
    pub module_repo: Arc<dyn UploadRepository>,
    /// 后台对账服务
    pub reconciler: Arc<Reconciler>,
    /// 应用配置
    pub config: Arc<AppConfig>,
}

impl AppState {
    /// 创建新的应用状态：打开数据库连接池，组装两条上传管线与对账服务
    pub async fn new(config: AppConfig) -> Result<Self> {
        let pool = SqliteUploadRepository::open_pool(&config.database.db_path)
            .context("初始化上传记录数据库失败")?;
        let project_repo: Arc<dyn UploadRepository> =
            Arc::new(SqliteUploadRepository::new(pool.clone(), PROJECT_TABLE)?);
        let module_repo: Arc<dyn UploadRepository> =
            Arc::new(SqliteUploadRepository::new(pool, MODULE_TABLE)?);

        let (project_manager, project_store) =
            Self::build_pipeline(UploadKind::Project, &config.upload.project).await?;
        let (module_manager, module_store) =
            Self::build_pipeline(UploadKind::Module, &config.upload.module).await?;

        let reconciler = Arc::new(Reconciler::new(
            project_store,
            module_store,
            project_repo.clone(),
            module_repo.clone(),
            config.reconciler.tick_interval(),
            config.reconciler.idle_timeout(),
        ));

        Ok(Self {
            project_manager,
            module_manager,
            project_repo,
            module_repo,
            reconciler,
            config: Arc::new(config),
        })
    }

    /// 组装一条上传管线：分片暂存、准入队列、上传管理器
    async fn build_pipeline(
        kind: UploadKind,
        flavor: &FlavorConfig,
    ) -> Result<(Arc<UploadManager>, Arc<ChunkStore>)> {
        let store = Arc::new(
            ChunkStore::new(flavor.data_dir.clone())
                .await
                .with_context(|| format!("初始化 {} 分片暂存目录失败", kind))?,
        );
        fs::create_dir_all(&flavor.final_dir)
            .await
            .with_context(|| format!("初始化 {} 归档目录失败", kind))?;

        let queue = Arc::new(AdmissionQueue::new(flavor.max_concurrent));
        let manager = Arc::new(UploadManager::new(
            kind,
            store.clone(),
            queue,
            flavor.max_upload_size(),
        ));
        Ok((manager, store))
    }

    /// 按上传类型取对应的管理器
    pub fn manager_for(&self, kind: UploadKind) -> &Arc<UploadManager> {
        match kind {
            UploadKind::Project => &self.project_manager,
            UploadKind::Module => &self.module_manager,
        }
    }

    /// 按上传类型取对应的记录仓储
    pub fn repo_for(&self, kind: UploadKind) -> &Arc<dyn UploadRepository> {
        match kind {
            UploadKind::Project => &self.project_repo,
            UploadKind::Module => &self.module_repo,
        }
    }

    /// 按上传类型取对应的配置段
    pub fn flavor_config(&self, kind: UploadKind) -> &FlavorConfig {
        match kind {
            UploadKind::Project => &self.config.upload.project,
            UploadKind::Module => &self.config.upload.module,
        }
    }

    /// 重启恢复：从数据库读取未完成上传，重建两条管线的准入状态
    pub async fn recover(&self) -> Result<()> {
        for kind in [UploadKind::Project, UploadKind::Module] {
            let ids = self
                .repo_for(kind)
                .list_unfinished()
                .await
                .with_context(|| format!("读取 {} 未完成上传记录失败", kind))?;
            if ids.is_empty() {
                continue;
            }
            info!("🔄 恢复未完成上传: kind={}, count={}", kind, ids.len());
            self.manager_for(kind).load_queue_from_db(&ids);
        }
        Ok(())
    }

    /// 优雅关闭：停止后台对账服务
    pub async fn shutdown(&self) {
        self.reconciler.stop().await;
    }
}
