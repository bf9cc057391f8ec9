// TUS Upload Rust Library
// 断点续传上传服务核心库

// 配置管理模块
pub mod config;

// 日志模块
pub mod logging;

// 后台对账模块
pub mod reconciler;

// 上传记录仓储模块
pub mod repository;

// Web服务器模块
pub mod server;

// 上传引擎模块
pub mod uploader;

// 导出常用类型
pub use config::AppConfig;
pub use reconciler::Reconciler;
pub use repository::{SqliteUploadRepository, UploadRecord, UploadRecordStatus, UploadRepository};
pub use server::AppState;
pub use uploader::{
    AdmissionQueue, ChunkStore, UploadDescriptor, UploadError, UploadKind, UploadManager,
    UploadMetadata,
};
