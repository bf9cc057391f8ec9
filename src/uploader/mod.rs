// 上传引擎模块
//
// 断点续传的核心四件套，自底向上组合：
// - 分片存储：按偏移落盘 + 描述符原子提交 + 按 ID 锁表
// - 准入队列：活跃集合封顶 + FIFO 等待
// - 上传管理器：协议编排与输入校验
//（后台清理循环见 reconciler 模块）

pub mod chunk_store;
pub mod lock_table;
pub mod manager;
pub mod queue;
pub mod types;

pub use chunk_store::{make_descriptor, ChunkStore};
pub use lock_table::{LockGuard, LockTable};
pub use manager::{SlotStatus, UploadManager, MODULE_TYPES};
pub use queue::{AdmissionQueue, QueueSnapshot};
pub use types::{UploadDescriptor, UploadError, UploadKind, UploadMetadata};
