//! 内存经纪人实现
//! Memory broker implementation
//!
//! 使用内存数据结构实现任务存储和管理
//! Implements task storage and management using in-memory data structures

use crate::proto::TaskMessage;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use tokio::sync::RwLock;

/// 队列数据结构
/// Queue data structure
#[derive(Default)]
pub struct QueueData {
  /// 待处理任务，按入队顺序
  /// Pending tasks, in enqueue order
  pub pending: VecDeque<String>,
  /// 活跃任务 - 正在处理的任务
  /// Active tasks - tasks being processed
  pub active: HashSet<String>,
  /// 活跃任务的租约过期时间（unix 秒）
  /// Lease expiry of active tasks (unix seconds)
  pub lease: HashMap<String, i64>,
  /// 重试任务 - 按重试时间排序
  /// Retry tasks - sorted by retry time
  pub retry: BTreeMap<i64, Vec<String>>,
  /// 已归档任务 - 按归档时间排序
  /// Archived tasks - sorted by archive time
  pub archived: BTreeMap<i64, Vec<String>>,
  /// 已完成任务 - 按过期时间排序
  /// Completed tasks - sorted by expiry time
  pub completed: BTreeMap<i64, Vec<String>>,
  /// 处理总数
  /// Total processed count
  pub processed_total: i64,
  /// 失败总数
  /// Total failed count
  pub failed_total: i64,
}

impl QueueData {
  pub(crate) fn sorted_len(set: &BTreeMap<i64, Vec<String>>) -> i64 {
    set.values().map(|ids| ids.len() as i64).sum()
  }

  /// 任务离开活跃状态：移除活跃标记和租约
  /// The task leaves the active state: drop its active entry and lease
  pub(crate) fn release(&mut self, id: &str) {
    self.active.remove(id);
    self.lease.remove(id);
  }
}

/// 内存存储
/// Memory storage
#[derive(Default)]
pub struct MemoryStorage {
  /// 每个队列的数据
  /// Data for each queue
  pub queue_data: HashMap<String, QueueData>,
  /// 任务数据 - key: queue:task_id
  /// Task data - key: queue:task_id
  pub tasks: HashMap<String, TaskMessage>,
}

impl MemoryStorage {
  /// 获取或创建队列数据
  /// Get or create queue data
  pub fn get_or_create_queue(&mut self, queue: &str) -> &mut QueueData {
    self.queue_data.entry(queue.to_string()).or_default()
  }

  /// 生成任务键
  /// Generate task key
  pub fn task_key(queue: &str, task_id: &str) -> String {
    format!("{queue}:{task_id}")
  }
}

/// 内存经纪人实现
/// Memory broker implementation
#[derive(Default)]
pub struct MemoryBroker {
  pub(crate) storage: Arc<RwLock<MemoryStorage>>,
}

impl MemoryBroker {
  /// 创建新的内存经纪人实例
  /// Create a new memory broker instance
  pub fn new() -> Self {
    Self::default()
  }

  /// 获取存储的引用
  /// Get storage reference
  pub fn storage(&self) -> &Arc<RwLock<MemoryStorage>> {
    &self.storage
  }

  /// 查找任务消息
  /// Look up a task message
  pub async fn get_task(&self, queue: &str, task_id: &str) -> Option<TaskMessage> {
    let storage = self.storage.read().await;
    storage
      .tasks
      .get(&MemoryStorage::task_key(queue, task_id))
      .cloned()
  }
}
