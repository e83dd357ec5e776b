//! 入站消息公共处理：去重 → 记录消息日志 → 引擎处理 → 经渠道发送器回复
//!
//! Webhook 处理器只负责解析平台载荷，拿到 [`Inbound`] 后交给 [`MessageHub::dispatch`]，
//! 立即向平台返回 200，耗时处理在后台任务中完成。

use std::sync::Arc;

use crate::clinic::repository::Direction;
use crate::clinic::ClinicDb;
use crate::flow::{FlowEngine, Reply};

use super::idempotency::ProcessedEvents;
use super::sender::Senders;

/// 从平台载荷提取出的一条文本消息
#[derive(Debug, Clone, PartialEq)]
pub struct Inbound {
    /// 渠道代码（`wa` / `tg`）
    pub channel: String,
    pub user_key: String,
    /// 平台消息 ID（用于去重；缺失时不去重）
    pub message_id: Option<String>,
    pub text: String,
}

impl Inbound {
    pub fn session_id(&self) -> String {
        format!("{}:{}", self.channel, self.user_key)
    }
}

pub struct MessageHub {
    engine: Arc<FlowEngine>,
    senders: Arc<Senders>,
    events: Arc<ProcessedEvents>,
    journal: Option<Arc<ClinicDb>>,
}

impl MessageHub {
    pub fn new(
        engine: Arc<FlowEngine>,
        senders: Arc<Senders>,
        events: Arc<ProcessedEvents>,
        journal: Option<Arc<ClinicDb>>,
    ) -> Self {
        Self {
            engine,
            senders,
            events,
            journal,
        }
    }

    pub fn engine(&self) -> &Arc<FlowEngine> {
        &self.engine
    }

    pub fn senders(&self) -> &Arc<Senders> {
        &self.senders
    }

    /// 后台处理（Webhook 处理器调用后立即返回）
    pub fn dispatch(self: &Arc<Self>, inbound: Inbound) {
        let hub = Arc::clone(self);
        tokio::spawn(async move {
            hub.handle(inbound).await;
        });
    }

    /// 处理一条消息；重复事件或空文本返回 None
    pub async fn handle(&self, inbound: Inbound) -> Option<Reply> {
        if inbound.text.trim().is_empty() {
            tracing::debug!(channel = %inbound.channel, "Ignoring empty message");
            return None;
        }
        if let Some(id) = &inbound.message_id {
            if !self.events.check_and_mark(&inbound.channel, id) {
                tracing::info!(channel = %inbound.channel, message_id = %id, "Duplicate event skipped");
                return None;
            }
        }

        if let Some(db) = &self.journal {
            if let Err(e) = db.log_message(&inbound.channel, &inbound.user_key, Direction::Inbound, &inbound.text) {
                tracing::warn!(channel = %inbound.channel, error = %e, "Failed to journal inbound message");
            }
        }

        let reply = self
            .engine
            .process_or_fallback(&inbound.session_id(), &inbound.text)
            .await;

        if let Err(e) = self
            .senders
            .send(&inbound.channel, &inbound.user_key, &reply.message)
            .await
        {
            tracing::error!(channel = %inbound.channel, user = %inbound.user_key, error = %e, "Failed to send reply");
        }
        Some(reply)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clinic::schedule::{Clock, SlotRules};
    use crate::flow::{loader, EngineSettings};
    use crate::hooks::HookRegistry;
    use crate::integrations::sender::MessageSender;
    use crate::session::MemorySessionStore;
    use async_trait::async_trait;
    use tokio::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        sent: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl MessageSender for Recorder {
        fn channel(&self) -> &str {
            "tg"
        }

        async fn send_text(&self, _user_key: &str, text: &str) -> anyhow::Result<()> {
            self.sent.lock().await.push(text.to_string());
            Ok(())
        }
    }

    fn hub(recorder: Arc<Recorder>, db: Arc<ClinicDb>) -> MessageHub {
        let graph = loader::load(
            r#"{"MENU": {"type": "choice", "prompt": "Menú", "options": {"1": {"next": "INFO", "label": "Info"}}},
                "INFO": {"prompt": "Información"}}"#,
            "MENU",
        )
        .unwrap();
        let engine = FlowEngine::new(
            Arc::new(graph),
            Arc::new(HookRegistry::new()),
            Arc::new(MemorySessionStore::new()),
            EngineSettings {
                greet_new_sessions: false,
                ..EngineSettings::default()
            },
            Clock::system(SlotRules::default().offset),
        );
        let mut senders = Senders::new(Some(db.clone()));
        senders.register(recorder);
        MessageHub::new(
            Arc::new(engine),
            Arc::new(senders),
            Arc::new(ProcessedEvents::new(16, Some(db.clone()))),
            Some(db),
        )
    }

    fn inbound(id: &str, text: &str) -> Inbound {
        Inbound {
            channel: "tg".into(),
            user_key: "42".into(),
            message_id: Some(id.into()),
            text: text.into(),
        }
    }

    #[tokio::test]
    async fn test_handle_replies_and_journals_both_directions() {
        let recorder = Arc::new(Recorder::default());
        let db = Arc::new(ClinicDb::open_in_memory().unwrap());
        let hub = hub(recorder.clone(), db.clone());

        let reply = hub.handle(inbound("1", "1")).await.unwrap();
        assert_eq!(reply.node, "INFO");
        assert_eq!(recorder.sent.lock().await.len(), 1);

        let journal = db.messages_for("tg", "42").unwrap();
        assert_eq!(journal.len(), 2);
        assert_eq!(journal[0], ("in".to_string(), "1".to_string()));
        assert_eq!(journal[1].0, "out");
    }

    #[tokio::test]
    async fn test_duplicate_and_empty_messages_ignored() {
        let recorder = Arc::new(Recorder::default());
        let db = Arc::new(ClinicDb::open_in_memory().unwrap());
        let hub = hub(recorder.clone(), db);

        assert!(hub.handle(inbound("9", "hola")).await.is_some());
        assert!(hub.handle(inbound("9", "hola")).await.is_none());
        assert!(hub.handle(inbound("10", "   ")).await.is_none());
        assert_eq!(recorder.sent.lock().await.len(), 1);
    }
}
