//! 持久化会话存储
//!
//! 使用 SQLite 保存会话状态（整份 Session 以 JSON 存在 state 列），服务重启后可恢复。

use std::path::Path;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};

use super::{Session, SessionKey, SessionStore};
use crate::core::{FlowError, StorageError};

/// SQLite 会话存储（单连接，语句都很短，持锁同步执行）
pub struct SqliteSessionStore {
    conn: Mutex<Connection>,
}

impl SqliteSessionStore {
    /// 打开（必要时创建）数据库文件并建表
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let conn = Connection::open(path)?;
        Self::with_connection(conn)
    }

    /// 内存数据库（测试用）
    pub fn open_in_memory() -> Result<Self, StorageError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, StorageError> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS sessions (
                channel TEXT NOT NULL,
                user_key TEXT NOT NULL,
                state TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                PRIMARY KEY (channel, user_key)
            );
            CREATE INDEX IF NOT EXISTS idx_sessions_updated ON sessions(updated_at);",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn upsert(conn: &Connection, session: &Session) -> Result<(), StorageError> {
        let state = serde_json::to_string(session)?;
        conn.execute(
            "INSERT INTO sessions (channel, user_key, state, updated_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(channel, user_key)
             DO UPDATE SET state = excluded.state, updated_at = excluded.updated_at",
            params![
                session.channel,
                session.user_key,
                state,
                session.last_activity.to_rfc3339()
            ],
        )?;
        Ok(())
    }
}

#[async_trait]
impl SessionStore for SqliteSessionStore {
    async fn get(&self, session_id: &str) -> Result<Session, FlowError> {
        let key = SessionKey::parse(session_id)?;
        let conn = self.conn.lock().map_err(|_| StorageError::LockPoisoned)?;

        let stored: Option<String> = conn
            .query_row(
                "SELECT state FROM sessions WHERE channel = ?1 AND user_key = ?2",
                params![key.channel, key.user_key],
                |row| row.get(0),
            )
            .optional()
            .map_err(StorageError::from)?;

        let mut session = match stored {
            Some(state) => match serde_json::from_str::<Session>(&state) {
                Ok(session) => session,
                Err(e) => {
                    tracing::warn!(session = %key, error = %e, "Corrupt session state, starting over");
                    Session::new(&key)
                }
            },
            None => Session::new(&key),
        };
        session.channel = key.channel.clone();
        session.user_key = key.user_key.clone();
        session.touch();
        Self::upsert(&conn, &session)?;
        Ok(session)
    }

    async fn peek(&self, session_id: &str) -> Result<Option<Session>, FlowError> {
        let key = SessionKey::parse(session_id)?;
        let conn = self.conn.lock().map_err(|_| StorageError::LockPoisoned)?;
        let stored: Option<String> = conn
            .query_row(
                "SELECT state FROM sessions WHERE channel = ?1 AND user_key = ?2",
                params![key.channel, key.user_key],
                |row| row.get(0),
            )
            .optional()
            .map_err(StorageError::from)?;
        match stored {
            Some(state) => Ok(Some(serde_json::from_str(&state).map_err(StorageError::from)?)),
            None => Ok(None),
        }
    }

    async fn set(&self, session_id: &str, session: &Session) -> Result<(), FlowError> {
        let key = SessionKey::parse(session_id)?;
        let mut stored = session.clone();
        stored.channel = key.channel;
        stored.user_key = key.user_key;
        stored.touch();
        let conn = self.conn.lock().map_err(|_| StorageError::LockPoisoned)?;
        Self::upsert(&conn, &stored)?;
        Ok(())
    }

    async fn idle_sessions(&self, before: DateTime<Utc>) -> Result<Vec<Session>, FlowError> {
        let conn = self.conn.lock().map_err(|_| StorageError::LockPoisoned)?;
        let mut stmt = conn
            .prepare("SELECT state FROM sessions WHERE updated_at < ?1")
            .map_err(StorageError::from)?;
        let rows = stmt
            .query_map(params![before.to_rfc3339()], |row| row.get::<_, String>(0))
            .map_err(StorageError::from)?;

        let mut sessions = Vec::new();
        for state in rows {
            let state = state.map_err(StorageError::from)?;
            match serde_json::from_str::<Session>(&state) {
                Ok(session) => sessions.push(session),
                Err(e) => tracing::warn!(error = %e, "Skipping corrupt session row"),
            }
        }
        Ok(sessions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_session_survives_reopen() {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("sessions.db");

        {
            let store = SqliteSessionStore::open(&db_path).unwrap();
            let mut session = store.get("wa:593991234567").await.unwrap();
            session.current_node = "agenda_cedula".into();
            session.history = vec!["menu_principal".into()];
            session.context.insert("agenda".into(), json!({"site": "GYE"}));
            store.set("wa:593991234567", &session).await.unwrap();
        }

        let store = SqliteSessionStore::open(&db_path).unwrap();
        let session = store.get("wa:593991234567").await.unwrap();
        assert_eq!(session.current_node, "agenda_cedula");
        assert_eq!(session.history, vec!["menu_principal"]);
        assert_eq!(session.context["agenda"]["site"], "GYE");
    }

    #[tokio::test]
    async fn test_get_upserts_new_row() {
        let store = SqliteSessionStore::open_in_memory().unwrap();
        let session = store.get("tg:99").await.unwrap();
        assert!(session.current_node.is_empty());
        let idle = store
            .idle_sessions(Utc::now() + chrono::Duration::minutes(1))
            .await
            .unwrap();
        assert_eq!(idle.len(), 1);
        assert_eq!(idle[0].user_key, "99");
    }

    #[tokio::test]
    async fn test_peek_reads_without_creating() {
        let store = SqliteSessionStore::open_in_memory().unwrap();
        assert!(store.peek("tg:7").await.unwrap().is_none());
        let mut session = store.get("tg:7").await.unwrap();
        session.current_node = "agenda_fecha".into();
        store.set("tg:7", &session).await.unwrap();
        let peeked = store.peek("tg:7").await.unwrap().unwrap();
        assert_eq!(peeked.current_node, "agenda_fecha");
    }

    #[tokio::test]
    async fn test_invalid_key() {
        let store = SqliteSessionStore::open_in_memory().unwrap();
        assert!(matches!(store.get("bad").await, Err(FlowError::InvalidSessionKey(_))));
    }
}
