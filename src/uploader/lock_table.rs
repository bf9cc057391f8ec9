//! 上传锁表
//!
//! 每个上传 ID 一把内存排他锁，用于串行化同一上传的分片写入。
//! 锁带有持有代数（generation）与获取时间戳：后台清理循环可以按 TTL
//! 强制回收疑似悬挂的锁，回收通过递增代数完成，使仍在执行的旧持有者
//! 能够在提交前发现锁已易主并安全失败，而不是写穿已被回收的锁

use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tracing::warn;

/// 单个 ID 的锁槽位
#[derive(Debug, Default)]
struct LockSlot {
    /// 持有代数：每次成功获取或被管理性回收时递增
    generation: u64,
    /// 当前持有者的获取时间（None 表示空闲）
    acquired_at: Option<Instant>,
}

/// 按上传 ID 细分的锁表
///
/// 不同 ID 的写入完全并行，同一 ID 的写入互斥。
/// 锁表只存在于进程内存中，不跨重启
#[derive(Debug, Default)]
pub struct LockTable {
    slots: Mutex<HashMap<String, LockSlot>>,
    /// 释放或回收时唤醒全部等待者（并发量为数十级，无需按 ID 细分唤醒）
    notify: Notify,
}

/// 锁持有凭证
///
/// Drop 时自动释放；若锁在持有期间被回收（代数已变更），
/// Drop 不会误释放新持有者
#[derive(Debug)]
pub struct LockGuard<'a> {
    table: &'a LockTable,
    id: String,
    generation: u64,
}

impl LockTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// 获取指定 ID 的排他锁（已被持有时异步等待）
    pub async fn acquire(&self, id: &str) -> LockGuard<'_> {
        loop {
            // 先登记唤醒再检查条件，避免错过释放通知
            let notified = self.notify.notified();
            {
                let mut slots = self.slots.lock();
                let slot = slots.entry(id.to_string()).or_default();
                if slot.acquired_at.is_none() {
                    slot.generation += 1;
                    slot.acquired_at = Some(Instant::now());
                    return LockGuard {
                        table: self,
                        id: id.to_string(),
                        generation: slot.generation,
                    };
                }
            }
            notified.await;
        }
    }

    /// 检查凭证是否仍然有效
    ///
    /// 写入方在提交边车记录前调用：代数不符说明锁已被 TTL 清扫
    /// 或终止操作回收，本次写入必须放弃提交
    pub fn is_current(&self, guard: &LockGuard<'_>) -> bool {
        let slots = self.slots.lock();
        match slots.get(&guard.id) {
            Some(slot) => slot.generation == guard.generation && slot.acquired_at.is_some(),
            None => false,
        }
    }

    /// 移除某个 ID 的锁槽位并唤醒其等待者
    ///
    /// 终止/定稿路径调用。在途持有者的凭证随之失效
    pub fn remove(&self, id: &str) {
        self.slots.lock().remove(id);
        self.notify.notify_waiters();
    }

    /// 强制回收持有时间超过 ttl 的锁，返回回收数量
    ///
    /// 只针对本进程内悬挂的持有者，不是跨重启恢复机制
    pub fn cleanup_stale(&self, ttl: Duration) -> usize {
        let mut reclaimed = 0;
        {
            let mut slots = self.slots.lock();
            for (id, slot) in slots.iter_mut() {
                if let Some(acquired_at) = slot.acquired_at {
                    if acquired_at.elapsed() > ttl {
                        warn!("⚠️ 回收悬挂的上传锁: id={}, 持有 {:?}", id, acquired_at.elapsed());
                        slot.generation += 1;
                        slot.acquired_at = None;
                        reclaimed += 1;
                    }
                }
            }
        }
        if reclaimed > 0 {
            self.notify.notify_waiters();
        }
        reclaimed
    }

    /// 当前槽位数量（含空闲槽位）
    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.lock().is_empty()
    }
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        {
            let mut slots = self.table.slots.lock();
            if let Some(slot) = slots.get_mut(&self.id) {
                // 代数不符说明锁已被回收并可能易主，不得释放新持有者
                if slot.generation == self.generation {
                    slot.acquired_at = None;
                }
            }
        }
        self.table.notify.notify_waiters();
    }
}
