// 配置管理模块

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tokio::fs;

/// 默认配置文件路径
pub const DEFAULT_CONFIG_PATH: &str = "config/app.toml";

/// 应用配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// 服务器配置
    #[serde(default)]
    pub server: ServerConfig,
    /// 上传配置（按种类拆分）
    #[serde(default)]
    pub upload: UploadConfig,
    /// 对账服务配置
    #[serde(default)]
    pub reconciler: ReconcilerConfig,
    /// 数据库配置
    #[serde(default)]
    pub database: DatabaseConfig,
    /// 日志配置
    #[serde(default)]
    pub log: LogConfig,
}

/// 服务器配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// 监听地址
    #[serde(default = "default_host")]
    pub host: String,
    /// 监听端口
    #[serde(default = "default_port")]
    pub port: u16,
    /// CORS允许的源
    #[serde(default = "default_cors_origins")]
    pub cors_origins: Vec<String>,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    18808
}

fn default_cors_origins() -> Vec<String> {
    vec!["*".to_string()]
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            cors_origins: default_cors_origins(),
        }
    }
}

/// 上传配置，项目与模块两条管线各自独立
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadConfig {
    /// 项目文件上传
    #[serde(default = "default_project_flavor")]
    pub project: FlavorConfig,
    /// 课程模块上传
    #[serde(default = "default_module_flavor")]
    pub module: FlavorConfig,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            project: default_project_flavor(),
            module: default_module_flavor(),
        }
    }
}

/// 单条上传管线的配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlavorConfig {
    /// 分片暂存目录
    pub data_dir: PathBuf,
    /// 完成后的归档目录
    pub final_dir: PathBuf,
    /// 单个上传的最大体积 (MB)
    pub max_upload_size_mb: u64,
    /// 同时进行的上传数上限
    pub max_concurrent: usize,
    /// 创建后多少小时视为过期
    pub expiry_hours: u64,
}

impl FlavorConfig {
    /// 最大体积（字节）
    pub fn max_upload_size(&self) -> u64 {
        self.max_upload_size_mb * 1024 * 1024
    }

    /// 过期时限
    pub fn expiry(&self) -> chrono::Duration {
        chrono::Duration::hours(self.expiry_hours as i64)
    }
}

fn default_project_flavor() -> FlavorConfig {
    FlavorConfig {
        data_dir: PathBuf::from("data/staging/project"),
        final_dir: PathBuf::from("data/files/project"),
        max_upload_size_mb: 2048,
        max_concurrent: 3,
        expiry_hours: 24,
    }
}

fn default_module_flavor() -> FlavorConfig {
    FlavorConfig {
        data_dir: PathBuf::from("data/staging/module"),
        final_dir: PathBuf::from("data/files/module"),
        max_upload_size_mb: 512,
        max_concurrent: 2,
        expiry_hours: 24,
    }
}

/// 对账服务配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconcilerConfig {
    /// 巡检间隔（秒）
    #[serde(default = "default_tick_interval_secs")]
    pub tick_interval_secs: u64,
    /// 多久无新分片视为搁置（秒）
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
}

fn default_tick_interval_secs() -> u64 {
    60
}

fn default_idle_timeout_secs() -> u64 {
    30 * 60
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            tick_interval_secs: default_tick_interval_secs(),
            idle_timeout_secs: default_idle_timeout_secs(),
        }
    }
}

impl ReconcilerConfig {
    pub fn tick_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.tick_interval_secs)
    }

    pub fn idle_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.idle_timeout_secs)
    }
}

/// 数据库配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// SQLite 数据库文件路径
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,
}

fn default_db_path() -> PathBuf {
    PathBuf::from("data/uploads.db")
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
        }
    }
}

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// 是否启用日志文件持久化
    #[serde(default = "default_log_enabled")]
    pub enabled: bool,
    /// 日志文件保存目录
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
    /// 日志级别（默认 info）
    #[serde(default = "default_log_level")]
    pub level: String,
    /// 日志保留天数（默认 7 天）
    #[serde(default = "default_log_retention_days")]
    pub retention_days: u32,
    /// 单个日志文件最大大小（字节，默认 50MB）
    #[serde(default = "default_log_max_file_size")]
    pub max_file_size: u64,
}

fn default_log_enabled() -> bool {
    true
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("logs")
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_retention_days() -> u32 {
    7
}

fn default_log_max_file_size() -> u64 {
    50 * 1024 * 1024 // 50MB
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: default_log_enabled(),
            log_dir: default_log_dir(),
            level: default_log_level(),
            retention_days: default_log_retention_days(),
            max_file_size: default_log_max_file_size(),
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            upload: UploadConfig::default(),
            reconciler: ReconcilerConfig::default(),
            database: DatabaseConfig::default(),
            log: LogConfig::default(),
        }
    }
}

impl AppConfig {
    /// 校验配置的取值范围
    pub fn validate(&self) -> Result<()> {
        for (name, flavor) in [
            ("upload.project", &self.upload.project),
            ("upload.module", &self.upload.module),
        ] {
            if flavor.max_concurrent == 0 {
                anyhow::bail!("{}.max_concurrent 必须大于 0", name);
            }
            if flavor.max_upload_size_mb == 0 {
                anyhow::bail!("{}.max_upload_size_mb 必须大于 0", name);
            }
            if flavor.expiry_hours == 0 {
                anyhow::bail!("{}.expiry_hours 必须大于 0", name);
            }
        }

        if self.reconciler.tick_interval_secs == 0 {
            anyhow::bail!("reconciler.tick_interval_secs 必须大于 0");
        }
        if self.reconciler.idle_timeout_secs == 0 {
            anyhow::bail!("reconciler.idle_timeout_secs 必须大于 0");
        }

        Ok(())
    }

    /// 从文件加载配置
    pub async fn load_from_file(path: &str) -> Result<Self> {
        let content = fs::read_to_string(path)
            .await
            .context("Failed to read config file")?;

        let config: AppConfig = toml::from_str(&content).context("Failed to parse config file")?;
        config.validate().context("配置文件校验失败")?;

        Ok(config)
    }

    /// 保存配置到文件
    pub async fn save_to_file(&self, path: &str) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;

        // 确保父目录存在
        if let Some(parent) = std::path::Path::new(path).parent() {
            fs::create_dir_all(parent)
                .await
                .context("Failed to create config directory")?;
        }

        fs::write(path, content)
            .await
            .context("Failed to write config file")?;

        tracing::info!("✓ 配置已保存: {}", path);
        Ok(())
    }

    /// 加载或创建默认配置
    pub async fn load_or_default(path: &str) -> Self {
        match Self::load_from_file(path).await {
            Ok(config) => {
                tracing::info!("配置文件加载成功: {}", path);
                config
            }
            Err(e) => {
                tracing::warn!("配置文件加载失败，使用默认配置: {}", e);
                let default_config = Self::default();

                // 首次启动时落一份默认配置，方便用户修改
                if let Err(e) = default_config.save_to_file(path).await {
                    tracing::error!("保存默认配置失败: {}", e);
                }

                default_config
            }
        }
    }
}
