//! 出站消息发送
//!
//! 每个渠道实现 [`MessageSender`]；[`Senders`] 按渠道代码（`wa` / `tg`）分发，
//! 配置了诊所数据库时顺带把出站文本写入消息日志。

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::clinic::repository::Direction;
use crate::clinic::ClinicDb;

/// 单条消息的最大字符数（WhatsApp 上限 4096，Telegram 上限 4096，留余量）
pub const MAX_CHUNK_CHARS: usize = 4000;

/// 渠道发送器
#[async_trait]
pub trait MessageSender: Send + Sync {
    /// 渠道代码，与会话键的 channel 部分一致
    fn channel(&self) -> &str;

    async fn send_text(&self, user_key: &str, text: &str) -> anyhow::Result<()>;
}

/// 按字符切分长消息
pub fn chunk_text(body: &str, max_chars: usize) -> Vec<String> {
    let max_chars = max_chars.max(1);
    if body.chars().count() <= max_chars {
        return vec![body.to_string()];
    }
    body.chars()
        .collect::<Vec<_>>()
        .chunks(max_chars)
        .map(|c| c.iter().collect())
        .collect()
}

/// 渠道 → 发送器
#[derive(Default, Clone)]
pub struct Senders {
    senders: HashMap<String, Arc<dyn MessageSender>>,
    journal: Option<Arc<ClinicDb>>,
}

impl Senders {
    pub fn new(journal: Option<Arc<ClinicDb>>) -> Self {
        Self {
            senders: HashMap::new(),
            journal,
        }
    }

    pub fn register(&mut self, sender: Arc<dyn MessageSender>) {
        let channel = sender.channel().to_string();
        tracing::info!(channel = %channel, "Message sender registered");
        self.senders.insert(channel, sender);
    }

    pub fn get(&self, channel: &str) -> Option<Arc<dyn MessageSender>> {
        self.senders.get(channel).cloned()
    }

    pub fn channels(&self) -> Vec<String> {
        let mut channels: Vec<String> = self.senders.keys().cloned().collect();
        channels.sort();
        channels
    }

    pub fn is_empty(&self) -> bool {
        self.senders.is_empty()
    }

    /// 发送并记录消息日志；渠道未注册时返回错误
    pub async fn send(&self, channel: &str, user_key: &str, text: &str) -> anyhow::Result<()> {
        let sender = self
            .get(channel)
            .ok_or_else(|| anyhow::anyhow!("no sender registered for channel '{}'", channel))?;
        sender.send_text(user_key, text).await?;
        if let Some(db) = &self.journal {
            if let Err(e) = db.log_message(channel, user_key, Direction::Outbound, text) {
                tracing::warn!(channel, error = %e, "Failed to journal outbound message");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::Mutex;

    struct Recorder {
        sent: Mutex<Vec<(String, String)>>,
    }

    #[async_trait]
    impl MessageSender for Recorder {
        fn channel(&self) -> &str {
            "wa"
        }

        async fn send_text(&self, user_key: &str, text: &str) -> anyhow::Result<()> {
            self.sent.lock().await.push((user_key.to_string(), text.to_string()));
            Ok(())
        }
    }

    #[test]
    fn test_chunk_text_respects_char_boundaries() {
        assert_eq!(chunk_text("hola", 10), vec!["hola"]);
        let long = "ñ".repeat(9);
        let chunks = chunk_text(&long, 4);
        assert_eq!(chunks, vec!["ññññ", "ññññ", "ñ"]);
    }

    #[tokio::test]
    async fn test_send_routes_and_journals() {
        let db = Arc::new(ClinicDb::open_in_memory().unwrap());
        let recorder = Arc::new(Recorder {
            sent: Mutex::new(Vec::new()),
        });
        let mut senders = Senders::new(Some(db.clone()));
        senders.register(recorder.clone());

        senders.send("wa", "5939", "Hola").await.unwrap();
        assert_eq!(recorder.sent.lock().await.len(), 1);
        assert_eq!(
            db.messages_for("wa", "5939").unwrap(),
            vec![("out".to_string(), "Hola".to_string())]
        );

        assert!(senders.send("tg", "1", "x").await.is_err());
        assert_eq!(senders.channels(), vec!["wa"]);
    }
}
