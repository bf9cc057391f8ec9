//! 日志系统配置
//!
//! 控制台输出加文件持久化，文件按大小滚动，启动时清理过期日志

use crate::config::LogConfig;
use chrono::Local;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    fmt::{self, time::ChronoLocal},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

/// 日志文件名前缀
const LOG_FILE_PREFIX: &str = "tus-upload";

/// 按大小滚动的日志写入器
///
/// 文件名形如 `tus-upload.2026-08-23-101500.log`，写满后滚动为
/// `tus-upload.2026-08-23-101500_1.log`、`_2` 依此类推。
#[derive(Clone)]
pub struct RollingLogWriter {
    state: Arc<Mutex<RollingState>>,
}

struct RollingState {
    /// 本次启动的时间戳，所有滚动文件共享
    start_timestamp: String,
    log_dir: PathBuf,
    max_file_size: u64,
    file: File,
    /// 滚动序号，0 为首个文件
    index: u32,
    written: u64,
}

impl RollingState {
    fn file_path(log_dir: &Path, start_timestamp: &str, index: u32) -> PathBuf {
        let filename = if index == 0 {
            format!("{}.{}.log", LOG_FILE_PREFIX, start_timestamp)
        } else {
            format!("{}.{}_{}.log", LOG_FILE_PREFIX, start_timestamp, index)
        };
        log_dir.join(filename)
    }

    fn open(log_dir: &Path, start_timestamp: &str, index: u32) -> io::Result<File> {
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(Self::file_path(log_dir, start_timestamp, index))
    }

    fn rotate(&mut self) -> io::Result<()> {
        self.file.flush()?;
        self.index += 1;
        self.file = Self::open(&self.log_dir, &self.start_timestamp, self.index)?;
        self.written = 0;
        Ok(())
    }
}

impl RollingLogWriter {
    pub fn new(log_dir: PathBuf, max_file_size: u64) -> io::Result<Self> {
        let start_timestamp = Local::now().format("%Y-%m-%d-%H%M%S").to_string();
        let file = RollingState::open(&log_dir, &start_timestamp, 0)?;

        Ok(Self {
            state: Arc::new(Mutex::new(RollingState {
                start_timestamp,
                log_dir,
                max_file_size,
                file,
                index: 0,
                written: 0,
            })),
        })
    }
}

impl Write for RollingLogWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut state = self.state.lock().unwrap();
        if state.written + buf.len() as u64 > state.max_file_size {
            state.rotate()?;
        }
        let written = state.file.write(buf)?;
        state.written += written as u64;
        Ok(written)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.state.lock().unwrap().file.flush()
    }
}

/// 日志系统守卫
/// 必须保持存活，否则日志写入线程会终止
pub struct LogGuard {
    _file_guard: Option<WorkerGuard>,
}

/// 初始化日志系统
///
/// 返回的守卫需要保持存活直到程序结束。
pub fn init_logging(config: &LogConfig) -> LogGuard {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    let console_layer = fmt::layer()
        .with_target(true)
        .with_level(true)
        .with_timer(ChronoLocal::new("%Y-%m-%d %H:%M:%S%.3f".to_string()))
        .with_ansi(true);

    if !config.enabled {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(console_layer)
            .init();

        info!("日志系统初始化完成（仅控制台输出）");
        return LogGuard { _file_guard: None };
    }

    // 文件层初始化失败时回退到仅控制台输出
    let writer = fs::create_dir_all(&config.log_dir)
        .and_then(|_| RollingLogWriter::new(config.log_dir.clone(), config.max_file_size));
    let writer = match writer {
        Ok(writer) => writer,
        Err(e) => {
            eprintln!("日志文件初始化失败: {:?}, 错误: {}", config.log_dir, e);
            tracing_subscriber::registry()
                .with(env_filter)
                .with(console_layer)
                .init();
            return LogGuard { _file_guard: None };
        }
    };

    let (non_blocking, file_guard) = tracing_appender::non_blocking(writer);
    let file_layer = fmt::layer()
        .with_target(true)
        .with_level(true)
        .with_timer(ChronoLocal::new("%Y-%m-%d %H:%M:%S%.3f".to_string()))
        .with_ansi(false)
        .with_writer(non_blocking);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .init();

    info!(
        "日志系统初始化完成: 目录={:?}, 保留天数={}, 级别={}, 单文件最大={:.1}MB",
        config.log_dir,
        config.retention_days,
        config.level,
        config.max_file_size as f64 / 1024.0 / 1024.0
    );

    cleanup_old_logs(&config.log_dir, config.retention_days);

    LogGuard {
        _file_guard: Some(file_guard),
    }
}

/// 按修改时间清理过期日志文件
fn cleanup_old_logs(log_dir: &Path, retention_days: u32) {
    let retention = chrono::Duration::days(retention_days as i64);
    let now = chrono::Utc::now();

    let entries = match fs::read_dir(log_dir) {
        Ok(entries) => entries,
        Err(e) => {
            tracing::warn!("读取日志目录失败: {:?}, 错误: {}", log_dir, e);
            return;
        }
    };

    let mut deleted_count = 0;

    for entry in entries.flatten() {
        let path = entry.path();
        if !path.is_file() {
            continue;
        }

        let filename = match path.file_name().and_then(|s| s.to_str()) {
            Some(name) => name,
            None => continue,
        };
        if !filename.starts_with(LOG_FILE_PREFIX) || !filename.ends_with(".log") {
            continue;
        }

        let expired = entry
            .metadata()
            .and_then(|m| m.modified())
            .map(|modified| {
                let modified: chrono::DateTime<chrono::Utc> = modified.into();
                now.signed_duration_since(modified) > retention
            })
            .unwrap_or(false);

        if expired {
            if let Err(e) = fs::remove_file(&path) {
                tracing::warn!("删除过期日志文件失败: {:?}, 错误: {}", path, e);
            } else {
                deleted_count += 1;
            }
        }
    }

    if deleted_count > 0 {
        info!("已清理 {} 个过期日志文件", deleted_count);
    }
}
