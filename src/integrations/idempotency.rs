//! Webhook 去重
//!
//! 平台会在超时或失败时重发同一事件。内存中保留最近 [`DEFAULT_CAPACITY`] 个 `<platform>:<message_id>`，
//! 配置了诊所数据库时同时写入 processed_events，重启后仍能识别重复事件。

use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex};

use crate::clinic::ClinicDb;

pub const DEFAULT_CAPACITY: usize = 2000;

#[derive(Default)]
struct Lru {
    order: VecDeque<String>,
    seen: HashSet<String>,
}

/// 已处理事件集合
pub struct ProcessedEvents {
    capacity: usize,
    recent: Mutex<Lru>,
    db: Option<Arc<ClinicDb>>,
}

impl ProcessedEvents {
    pub fn new(capacity: usize, db: Option<Arc<ClinicDb>>) -> Self {
        Self {
            capacity: capacity.max(1),
            recent: Mutex::new(Lru::default()),
            db,
        }
    }

    /// 首次见到该事件返回 true 并记录；重复事件返回 false
    pub fn check_and_mark(&self, platform: &str, message_id: &str) -> bool {
        let key = format!("{}:{}", platform, message_id);
        {
            let Ok(mut lru) = self.recent.lock() else {
                tracing::warn!("Processed-event cache lock poisoned, accepting event");
                return true;
            };
            if lru.seen.contains(&key) {
                return false;
            }
            lru.seen.insert(key.clone());
            lru.order.push_back(key);
            while lru.order.len() > self.capacity {
                if let Some(old) = lru.order.pop_front() {
                    lru.seen.remove(&old);
                }
            }
        }

        match &self.db {
            Some(db) => match db.mark_processed(platform, message_id) {
                Ok(fresh) => fresh,
                Err(e) => {
                    tracing::warn!(platform, message_id, error = %e, "Failed to persist processed event");
                    true
                }
            },
            None => true,
        }
    }

    pub fn len(&self) -> usize {
        self.recent.lock().map(|lru| lru.order.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for ProcessedEvents {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY, None)
    }
}
