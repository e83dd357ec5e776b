//! 会话存储抽象层
//!
//! 定义统一的会话存取接口，支持内存和 SQLite 两种实现；引擎只依赖 trait，由调用方注入。

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use super::{Session, SessionKey, SqliteSessionStore};
use crate::core::FlowError;

/// 会话存储接口
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// 读取会话；不存在时创建新会话并写入（读即 upsert），刷新 last_activity
    async fn get(&self, session_id: &str) -> Result<Session, FlowError>;

    /// 只读查看会话：不存在时返回 None，不创建、不刷新 last_activity
    async fn peek(&self, session_id: &str) -> Result<Option<Session>, FlowError>;

    /// 覆盖写入会话（幂等），刷新 last_activity
    async fn set(&self, session_id: &str, session: &Session) -> Result<(), FlowError>;

    /// 列出 last_activity 早于 `before` 的会话（供不活跃巡检）
    async fn idle_sessions(&self, before: DateTime<Utc>) -> Result<Vec<Session>, FlowError>;
}

/// 内存会话存储（进程重启即丢失，用于测试与控制台）
#[derive(Default)]
pub struct MemorySessionStore {
    sessions: RwLock<HashMap<String, Session>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn get(&self, session_id: &str) -> Result<Session, FlowError> {
        let key = SessionKey::parse(session_id)?;
        let mut sessions = self.sessions.write().await;
        let session = sessions
            .entry(key.id())
            .or_insert_with(|| Session::new(&key));
        session.touch();
        Ok(session.clone())
    }

    async fn peek(&self, session_id: &str) -> Result<Option<Session>, FlowError> {
        let key = SessionKey::parse(session_id)?;
        Ok(self.sessions.read().await.get(&key.id()).cloned())
    }

    async fn set(&self, session_id: &str, session: &Session) -> Result<(), FlowError> {
        let key = SessionKey::parse(session_id)?;
        let mut stored = session.clone();
        stored.channel = key.channel.clone();
        stored.user_key = key.user_key.clone();
        stored.touch();
        self.sessions.write().await.insert(key.id(), stored);
        Ok(())
    }

    async fn idle_sessions(&self, before: DateTime<Utc>) -> Result<Vec<Session>, FlowError> {
        Ok(self
            .sessions
            .read()
            .await
            .values()
            .filter(|s| s.last_activity < before)
            .cloned()
            .collect())
    }
}

/// 根据配置创建会话存储：配置了路径则用 SQLite，打开失败时退回内存并告警
pub fn create_session_store(db_path: Option<&Path>) -> Arc<dyn SessionStore> {
    match db_path {
        Some(path) => match SqliteSessionStore::open(path) {
            Ok(store) => {
                tracing::info!(path = %path.display(), "Using SQLite session store");
                Arc::new(store)
            }
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "Failed to open SQLite session store, falling back to memory"
                );
                Arc::new(MemorySessionStore::new())
            }
        },
        None => {
            tracing::info!("Using in-memory session store");
            Arc::new(MemorySessionStore::new())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_get_creates_session() {
        let store = MemorySessionStore::new();
        let session = store.get("wa:593991234567").await.unwrap();
        assert_eq!(session.channel, "wa");
        assert_eq!(session.user_key, "593991234567");
        assert!(session.current_node.is_empty());
        assert!(session.history.is_empty());
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn test_set_overwrites_and_get_returns_latest() {
        let store = MemorySessionStore::new();
        let mut session = store.get("tg:42").await.unwrap();
        session.current_node = "info".into();
        session.history.push("menu_principal".into());
        store.set("tg:42", &session).await.unwrap();
        store.set("tg:42", &session).await.unwrap();

        let loaded = store.get("tg:42").await.unwrap();
        assert_eq!(loaded.current_node, "info");
        assert_eq!(loaded.history, vec!["menu_principal"]);
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn test_peek_does_not_create_or_touch() {
        let store = MemorySessionStore::new();
        assert!(store.peek("wa:1").await.unwrap().is_none());
        assert!(store.is_empty().await);

        let created = store.get("wa:1").await.unwrap();
        let peeked = store.peek("wa:1").await.unwrap().unwrap();
        assert_eq!(peeked.last_activity, created.last_activity);
    }

    #[tokio::test]
    async fn test_invalid_keys_rejected() {
        let store = MemorySessionStore::new();
        assert!(matches!(store.get("nocolon").await, Err(FlowError::InvalidSessionKey(_))));
        let session = Session::default();
        assert!(matches!(store.set(":x", &session).await, Err(FlowError::InvalidSessionKey(_))));
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn test_idle_sessions_filters_by_cutoff() {
        let store = MemorySessionStore::new();
        store.get("wa:1").await.unwrap();
        let future = Utc::now() + chrono::Duration::minutes(1);
        let past = Utc::now() - chrono::Duration::minutes(1);
        assert_eq!(store.idle_sessions(future).await.unwrap().len(), 1);
        assert!(store.idle_sessions(past).await.unwrap().is_empty());
    }

    #[test]
    fn test_create_session_store_without_path_is_memory() {
        // 仅验证不会 panic；具体实现由 trait 对象隐藏
        let _store = create_session_store(None);
    }
}
