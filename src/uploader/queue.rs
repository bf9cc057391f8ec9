//! 上传准入队列
//!
//! 进程内的并发上限控制：活跃集合封顶 `max_concurrent`，
//! 超出部分按提交顺序进入 FIFO 等待队列。
//! 队列只做记账与背压信号，不触碰存储，也不访问数据库。
//! 全部操作由同一把互斥锁保护，任何时刻一个 ID 至多出现在
//! 活跃集合或等待队列其中之一，且不重复

use std::collections::VecDeque;

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info};

use super::types::UploadError;

/// 队列状态快照（一次加锁内读出，活跃与等待彼此一致）
#[derive(Debug, Clone, Serialize)]
pub struct QueueSnapshot {
    /// 活跃上传 ID
    pub active: Vec<String>,
    /// 等待中的上传 ID（FIFO 顺序）
    pub queued: Vec<String>,
}

#[derive(Debug, Default)]
struct QueueInner {
    /// 活跃集合（无序，封顶 max_concurrent；数量为数十级，向量即可）
    active: Vec<String>,
    /// 等待队列（先进先出）
    queued: VecDeque<String>,
}

/// 准入队列
///
/// 以显式结构体承载全部可变状态，项目与模块两条流水线
/// 各持有一个独立实例
#[derive(Debug)]
pub struct AdmissionQueue {
    max_concurrent: usize,
    inner: Mutex<QueueInner>,
}

impl AdmissionQueue {
    pub fn new(max_concurrent: usize) -> Self {
        Self {
            max_concurrent,
            inner: Mutex::new(QueueInner::default()),
        }
    }

    /// 并发上限
    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    // ========================================================================
    // 状态变更
    // ========================================================================

    /// 注册一个上传：有空位进活跃集合，否则排队
    ///
    /// 已注册的 ID 重复调用是无操作（重试注册不得占用两个名额）
    pub fn add(&self, id: &str) {
        let mut inner = self.inner.lock();
        if inner.active.iter().any(|x| x == id) || inner.queued.iter().any(|x| x == id) {
            debug!("上传已注册，忽略重复添加: id={}", id);
            return;
        }
        if inner.active.len() < self.max_concurrent {
            inner.active.push(id.to_string());
            debug!("上传进入活跃集合: id={}, active={}", id, inner.active.len());
        } else {
            inner.queued.push_back(id.to_string());
            debug!("上传进入等待队列: id={}, position={}", id, inner.queued.len());
        }
    }

    /// 从所在集合移除一个上传
    ///
    /// 两个集合都没有时返回 NotFound。
    /// 注意：移除活跃成员不会提升等待者，空位的补位只属于
    /// `finish_upload`，取消路径刻意不替补
    pub fn remove(&self, id: &str) -> Result<(), UploadError> {
        let mut inner = self.inner.lock();
        if let Some(pos) = inner.active.iter().position(|x| x == id) {
            inner.active.remove(pos);
            debug!("从活跃集合移除上传: id={}", id);
            return Ok(());
        }
        if let Some(pos) = inner.queued.iter().position(|x| x == id) {
            inner.queued.remove(pos);
            debug!("从等待队列移除上传: id={}", id);
            return Ok(());
        }
        Err(UploadError::NotFound(id.to_string()))
    }

    /// 结束一个活跃上传并提升队首等待者
    ///
    /// ID 不在活跃集合时（包括仍在排队时）是无操作，返回 None。
    /// 提升成功时返回被提升的 ID
    pub fn finish_upload(&self, id: &str) -> Option<String> {
        let mut inner = self.inner.lock();
        let pos = inner.active.iter().position(|x| x == id)?;
        inner.active.remove(pos);

        if let Some(next) = inner.queued.pop_front() {
            inner.active.push(next.clone());
            info!("⬆️ 队首上传获得空位: id={} (接替 {})", next, id);
            return Some(next);
        }
        debug!("上传结束，无等待者: id={}", id);
        None
    }

    /// 清空活跃集合与等待队列（硬复位）
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        let dropped = inner.active.len() + inner.queued.len();
        inner.active.clear();
        inner.queued.clear();
        if dropped > 0 {
            info!("准入队列已清空，丢弃 {} 个条目", dropped);
        }
    }

    /// 依据持久化记录批量重建准入状态（进程重启后调用）
    ///
    /// 输入保序去重（保留首次出现），前 `max_concurrent` 个成为活跃，
    /// 其余按原相对顺序排队。原有状态被整体替换
    pub fn load_from_db(&self, ids: &[String]) {
        let mut inner = self.inner.lock();
        inner.active.clear();
        inner.queued.clear();

        for id in ids {
            if inner.active.iter().any(|x| x == id) || inner.queued.iter().any(|x| x == id) {
                continue;
            }
            if inner.active.len() < self.max_concurrent {
                inner.active.push(id.clone());
            } else {
                inner.queued.push_back(id.clone());
            }
        }

        info!(
            "准入状态已重建: active={}, queued={}",
            inner.active.len(),
            inner.queued.len()
        );
    }

    // ========================================================================
    // 状态查询（全部返回防御性拷贝）
    // ========================================================================

    /// 是否还有活跃空位
    pub fn can_accept_upload(&self) -> bool {
        self.inner.lock().active.len() < self.max_concurrent
    }

    /// ID 是否在活跃集合中
    pub fn has_active_upload(&self, id: &str) -> bool {
        self.inner.lock().active.iter().any(|x| x == id)
    }

    /// 活跃上传 ID 列表
    pub fn active_uploads(&self) -> Vec<String> {
        self.inner.lock().active.clone()
    }

    /// 活跃上传数量
    pub fn active_count(&self) -> usize {
        self.inner.lock().active.len()
    }

    /// 等待队列长度
    pub fn queue_length(&self) -> usize {
        self.inner.lock().queued.len()
    }

    /// 等待队列内容（FIFO 顺序）
    pub fn current_queue(&self) -> Vec<String> {
        self.inner.lock().queued.iter().cloned().collect()
    }

    /// 排名：活跃成员在前、等待成员按序在后的 0 起始位次
    ///
    /// 两个集合都没有时返回 None（JSON 层映射为 -1）
    pub fn queue_position(&self, id: &str) -> Option<usize> {
        let inner = self.inner.lock();
        if let Some(pos) = inner.active.iter().position(|x| x == id) {
            return Some(pos);
        }
        inner
            .queued
            .iter()
            .position(|x| x == id)
            .map(|pos| inner.active.len() + pos)
    }

    /// 一致性快照：同一临界区内读出活跃与等待两份列表
    pub fn snapshot(&self) -> QueueSnapshot {
        let inner = self.inner.lock();
        QueueSnapshot {
            active: inner.active.clone(),
            queued: inner.queued.iter().cloned().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::Arc;

    #[test]
    fn test_add_respects_capacity_and_overflows_to_queue() {
        let queue = AdmissionQueue::new(2);
        queue.add("u1");
        queue.add("u2");
        queue.add("u3");
        queue.add("u4");

        let snapshot = queue.snapshot();
        assert_eq!(snapshot.active, vec!["u1", "u2"]);
        assert_eq!(snapshot.queued, vec!["u3", "u4"]);
        assert!(!queue.can_accept_upload());
        assert_eq!(queue.active_count(), 2);
        assert_eq!(queue.queue_length(), 2);
    }

    #[test]
    fn test_add_is_idempotent() {
        let queue = AdmissionQueue::new(1);
        queue.add("u1");
        queue.add("u1");
        queue.add("u2");
        queue.add("u2");

        // 重复注册不占用双份名额，也不产生重复排队
        assert_eq!(queue.active_uploads(), vec!["u1"]);
        assert_eq!(queue.current_queue(), vec!["u2"]);
    }

    #[test]
    fn test_finish_upload_promotes_fifo() {
        let queue = AdmissionQueue::new(1);
        queue.add("u1");
        queue.add("u2");
        queue.add("u3");

        // u1 结束后 u2 被提升
        assert_eq!(queue.finish_upload("u1"), Some("u2".to_string()));
        assert!(queue.has_active_upload("u2"));
        assert_eq!(queue.current_queue(), vec!["u3"]);

        // 非活跃 ID 是无操作
        assert_eq!(queue.finish_upload("not-active"), None);
        assert!(queue.has_active_upload("u2"));

        assert_eq!(queue.finish_upload("u2"), Some("u3".to_string()));
        assert_eq!(queue.finish_upload("u3"), None);
        assert_eq!(queue.active_count(), 0);
        assert_eq!(queue.queue_length(), 0);
    }

    #[test]
    fn test_finish_upload_ignores_queued_id() {
        let queue = AdmissionQueue::new(1);
        queue.add("u1");
        queue.add("u2");

        // 仍在排队的 ID 不能被"结束"，状态原样保留
        assert_eq!(queue.finish_upload("u2"), None);
        assert_eq!(queue.active_uploads(), vec!["u1"]);
        assert_eq!(queue.current_queue(), vec!["u2"]);
    }

    #[test]
    fn test_remove_does_not_promote_queued_upload() {
        let queue = AdmissionQueue::new(1);
        queue.add("u1");
        queue.add("u2");

        // 移除活跃成员后空位留空，u2 继续排队，补位只属于 finish_upload
        queue.remove("u1").unwrap();
        assert_eq!(queue.active_count(), 0);
        assert_eq!(queue.current_queue(), vec!["u2"]);
        assert!(queue.can_accept_upload());

        // 排队成员也可以被直接移除
        queue.remove("u2").unwrap();
        assert_eq!(queue.queue_length(), 0);
    }

    #[test]
    fn test_remove_not_found() {
        let queue = AdmissionQueue::new(2);
        queue.add("u1");

        let err = queue.remove("ghost").unwrap_err();
        assert!(matches!(err, UploadError::NotFound(_)));

        // 同一 ID 移除两次，第二次报 NotFound
        queue.remove("u1").unwrap();
        assert!(queue.remove("u1").is_err());
    }

    #[test]
    fn test_clear_empties_both_sets() {
        let queue = AdmissionQueue::new(1);
        queue.add("u1");
        queue.add("u2");
        queue.add("u3");

        queue.clear();
        assert_eq!(queue.active_count(), 0);
        assert_eq!(queue.queue_length(), 0);
        assert!(queue.can_accept_upload());
    }

    #[test]
    fn test_load_from_db_dedups_and_partitions() {
        let queue = AdmissionQueue::new(2);
        let ids: Vec<String> = ["u1", "u1", "u2", "u3", "u4"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        queue.load_from_db(&ids);

        let snapshot = queue.snapshot();
        assert_eq!(snapshot.active, vec!["u1", "u2"]);
        assert_eq!(snapshot.queued, vec!["u3", "u4"]);
    }

    #[test]
    fn test_load_from_db_replaces_existing_state() {
        let queue = AdmissionQueue::new(2);
        queue.add("old1");
        queue.add("old2");
        queue.add("old3");

        let ids: Vec<String> = ["n1", "n2", "n3"].iter().map(|s| s.to_string()).collect();
        queue.load_from_db(&ids);

        let snapshot = queue.snapshot();
        assert_eq!(snapshot.active, vec!["n1", "n2"]);
        assert_eq!(snapshot.queued, vec!["n3"]);
    }

    #[test]
    fn test_queue_position_ranks_active_then_queued() {
        let queue = AdmissionQueue::new(2);
        queue.add("u1");
        queue.add("u2");
        queue.add("u3");
        queue.add("u4");

        assert_eq!(queue.queue_position("u1"), Some(0));
        assert_eq!(queue.queue_position("u2"), Some(1));
        assert_eq!(queue.queue_position("u3"), Some(2));
        assert_eq!(queue.queue_position("u4"), Some(3));
        assert_eq!(queue.queue_position("ghost"), None);

        // 活跃成员减少后，等待成员的排名随之前移
        queue.remove("u1").unwrap();
        assert_eq!(queue.queue_position("u3"), Some(1));
    }

    #[test]
    fn test_accessors_return_defensive_copies() {
        let queue = AdmissionQueue::new(1);
        queue.add("u1");
        queue.add("u2");

        let mut active = queue.active_uploads();
        let mut queued = queue.current_queue();
        active.push("hacked".to_string());
        queued.clear();

        // 外部修改返回值不影响内部状态
        assert_eq!(queue.active_uploads(), vec!["u1"]);
        assert_eq!(queue.current_queue(), vec!["u2"]);
    }

    #[tokio::test]
    async fn test_concurrent_stress_holds_invariants() {
        let queue = Arc::new(AdmissionQueue::new(4));
        let mut handles = Vec::new();

        // 多任务并发执行 add / finish / remove
        for worker in 0..8u32 {
            let queue = queue.clone();
            handles.push(tokio::spawn(async move {
                for round in 0..50u32 {
                    let id = format!("u{}", (worker * 7 + round) % 16);
                    match round % 3 {
                        0 => queue.add(&id),
                        1 => {
                            let _ = queue.finish_upload(&id);
                        }
                        _ => {
                            let _ = queue.remove(&id);
                        }
                    }
                    tokio::task::yield_now().await;
                }
            }));
        }

        // 采样校验：活跃数封顶、两集合互斥、各自无重复
        let checker = {
            let queue = queue.clone();
            tokio::spawn(async move {
                for _ in 0..200 {
                    let snapshot = queue.snapshot();
                    assert!(snapshot.active.len() <= 4);
                    for id in &snapshot.active {
                        assert!(!snapshot.queued.contains(id), "ID 同时出现在两个集合: {}", id);
                    }
                    let mut dedup = snapshot.active.clone();
                    dedup.sort();
                    dedup.dedup();
                    assert_eq!(dedup.len(), snapshot.active.len());
                    tokio::task::yield_now().await;
                }
            })
        };

        for handle in handles {
            handle.await.unwrap();
        }
        checker.await.unwrap();

        // 收尾状态仍然自洽
        let snapshot = queue.snapshot();
        assert!(snapshot.active.len() <= 4);
        assert_eq!(queue.can_accept_upload(), snapshot.active.len() < 4);
    }

    proptest! {
        // 任意操作序列下的结构不变式
        #[test]
        fn prop_invariants_hold_for_any_op_sequence(
            ops in proptest::collection::vec((0u8..3, 0u8..8), 0..64)
        ) {
            let queue = AdmissionQueue::new(3);
            for (op, raw_id) in ops {
                let id = format!("u{}", raw_id);
                match op {
                    0 => queue.add(&id),
                    1 => { let _ = queue.remove(&id); }
                    _ => { let _ = queue.finish_upload(&id); }
                }

                let snapshot = queue.snapshot();
                prop_assert!(snapshot.active.len() <= 3);
                prop_assert_eq!(queue.can_accept_upload(), snapshot.active.len() < 3);

                // 互斥：任何 ID 不得同时在两个集合
                for id in &snapshot.active {
                    prop_assert!(!snapshot.queued.contains(id));
                }
                // 各自无重复
                let mut active = snapshot.active.clone();
                active.sort();
                active.dedup();
                prop_assert_eq!(active.len(), snapshot.active.len());
                let mut queued = snapshot.queued.clone();
                queued.sort();
                queued.dedup();
                prop_assert_eq!(queued.len(), snapshot.queued.len());
            }
        }
    }
}
