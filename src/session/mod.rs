//! 会话模型与存储
//!
//! 会话以 `<channel>:<user_key>` 为键（如 `wa:593991234567`、`tg:123456`），
//! 首次收到消息时创建，之后每次处理都会更新，永不删除（回到首页即软重置）。

pub mod locks;
pub mod sqlite;
pub mod store;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::core::FlowError;

pub use locks::SessionLocks;
pub use sqlite::SqliteSessionStore;
pub use store::{create_session_store, MemorySessionStore, SessionStore};

/// 已解析的会话键
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionKey {
    pub channel: String,
    pub user_key: String,
}

impl SessionKey {
    /// 解析 `<channel>:<user_key>`（两段都不能为空；user_key 中允许再出现冒号）
    pub fn parse(session_id: &str) -> Result<Self, FlowError> {
        let (channel, user_key) = session_id
            .split_once(':')
            .map(|(c, u)| (c.trim(), u.trim()))
            .filter(|(c, u)| !c.is_empty() && !u.is_empty())
            .ok_or_else(|| FlowError::InvalidSessionKey(session_id.to_string()))?;
        Ok(Self {
            channel: channel.to_string(),
            user_key: user_key.to_string(),
        })
    }

    pub fn new(channel: impl Into<String>, user_key: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
            user_key: user_key.into(),
        }
    }

    pub fn id(&self) -> String {
        format!("{}:{}", self.channel, self.user_key)
    }
}

impl std::fmt::Display for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.channel, self.user_key)
    }
}

/// 不活跃阶段：0 无，1 已提醒，2 已关闭
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(from = "u8", into = "u8")]
pub enum InactivityStage {
    #[default]
    Active,
    Nudged,
    Closed,
}

impl From<u8> for InactivityStage {
    fn from(v: u8) -> Self {
        match v {
            0 => InactivityStage::Active,
            1 => InactivityStage::Nudged,
            _ => InactivityStage::Closed,
        }
    }
}

impl From<InactivityStage> for u8 {
    fn from(stage: InactivityStage) -> Self {
        match stage {
            InactivityStage::Active => 0,
            InactivityStage::Nudged => 1,
            InactivityStage::Closed => 2,
        }
    }
}

/// 会话状态（整体序列化为 JSON 存入存储）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Session {
    pub channel: String,
    pub user_key: String,
    /// 空字符串表示尚未定位，引擎会强制为起始节点
    pub current_node: String,
    pub history: Vec<String>,
    pub context: Map<String, Value>,
    pub has_greeted: bool,
    pub last_activity: DateTime<Utc>,
    pub inactivity_stage: InactivityStage,
    /// 当前节点的 on_enter 是否尚未执行
    pub needs_on_enter: bool,
    /// 从上下文提取的患者标识（DNI）
    pub patient_id: Option<String>,
}

impl Default for Session {
    fn default() -> Self {
        Self {
            channel: String::new(),
            user_key: String::new(),
            current_node: String::new(),
            history: Vec::new(),
            context: Map::new(),
            has_greeted: false,
            last_activity: Utc::now(),
            inactivity_stage: InactivityStage::Active,
            needs_on_enter: true,
            patient_id: None,
        }
    }
}

impl Session {
    pub fn new(key: &SessionKey) -> Self {
        Self {
            channel: key.channel.clone(),
            user_key: key.user_key.clone(),
            ..Self::default()
        }
    }

    pub fn key(&self) -> SessionKey {
        SessionKey::new(self.channel.clone(), self.user_key.clone())
    }

    pub fn id(&self) -> String {
        self.key().id()
    }

    pub fn touch(&mut self) {
        self.last_activity = Utc::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_key_parse() {
        let key = SessionKey::parse("wa:593991234567").unwrap();
        assert_eq!(key.channel, "wa");
        assert_eq!(key.user_key, "593991234567");
        assert_eq!(key.to_string(), "wa:593991234567");

        let key = SessionKey::parse("tg:chat:42").unwrap();
        assert_eq!(key.user_key, "chat:42");
    }

    #[test]
    fn test_session_key_rejects_malformed() {
        for bad in ["", "wa", "wa:", ":123", " : "] {
            assert!(
                matches!(SessionKey::parse(bad), Err(FlowError::InvalidSessionKey(_))),
                "{bad:?} should be rejected"
            );
        }
    }

    #[test]
    fn test_session_state_tolerates_missing_fields() {
        let raw = r#"{"channel": "wa", "user_key": "1", "current_node": "menu_principal", "inactivity_stage": 1}"#;
        let session: Session = serde_json::from_str(raw).unwrap();
        assert_eq!(session.inactivity_stage, InactivityStage::Nudged);
        assert!(session.history.is_empty());
        assert!(session.needs_on_enter);

        let encoded = serde_json::to_value(&session).unwrap();
        assert_eq!(encoded["inactivity_stage"], 1);
    }
}
