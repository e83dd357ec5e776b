//! Telegram Bot API 集成
//!
//! POST /telegram/webhook 接收 Update：校验 `X-Telegram-Bot-Api-Secret-Token` 后读取
//! message / edited_message / callback_query，交给 [`MessageHub`] 后台处理。会话键为 `tg:<chat_id>`。

use std::sync::Arc;

use async_trait::async_trait;
use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    routing::post,
    Router,
};
use serde::{Deserialize, Serialize};

use super::inbound::{Inbound, MessageHub};
use super::sender::{chunk_text, MessageSender, MAX_CHUNK_CHARS};
use crate::config::TelegramSection;

pub const CHANNEL: &str = "tg";

pub const SECRET_HEADER: &str = "x-telegram-bot-api-secret-token";

/// Telegram 服务状态
pub struct TelegramState {
    pub hub: Arc<MessageHub>,
    pub webhook_secret: Option<String>,
    /// 用于应答 callback_query（去掉按钮上的加载状态）
    pub client: Option<Arc<TelegramClient>>,
}

#[derive(Debug, Deserialize)]
pub struct Update {
    pub update_id: i64,
    pub message: Option<TgMessage>,
    pub edited_message: Option<TgMessage>,
    pub callback_query: Option<CallbackQuery>,
}

#[derive(Debug, Deserialize)]
pub struct TgMessage {
    pub message_id: i64,
    pub chat: TgChat,
    pub text: Option<String>,
    pub caption: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct TgChat {
    pub id: i64,
}

#[derive(Debug, Deserialize)]
pub struct CallbackQuery {
    pub id: String,
    pub from: TgUser,
    pub message: Option<TgMessage>,
    pub data: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct TgUser {
    pub id: i64,
}

/// 从 Update 中取出入站消息（去重键为 update_id）
pub fn extract_inbound(update: &Update) -> Option<Inbound> {
    let (chat_id, text) = if let Some(query) = &update.callback_query {
        let chat_id = query.message.as_ref().map(|m| m.chat.id).unwrap_or(query.from.id);
        (chat_id, query.data.clone()?)
    } else {
        let msg = update.message.as_ref().or(update.edited_message.as_ref())?;
        (msg.chat.id, msg.text.clone().or_else(|| msg.caption.clone())?)
    };
    let text = text.trim().to_string();
    if text.is_empty() {
        return None;
    }
    Some(Inbound {
        channel: CHANNEL.to_string(),
        user_key: chat_id.to_string(),
        message_id: Some(update.update_id.to_string()),
        text,
    })
}

/// 校验 secret 请求头；未配置 secret 时全部放行
pub fn secret_matches(expected: Option<&str>, headers: &HeaderMap) -> bool {
    match expected {
        None => true,
        Some(expected) => headers
            .get(SECRET_HEADER)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|got| got == expected),
    }
}

/// 创建 Telegram 路由
pub fn create_router(state: Arc<TelegramState>) -> Router {
    Router::new()
        .route("/telegram/webhook", post(webhook_receive))
        .with_state(state)
}

/// POST /telegram/webhook
async fn webhook_receive(
    State(state): State<Arc<TelegramState>>,
    headers: HeaderMap,
    body: Bytes,
) -> StatusCode {
    if !secret_matches(state.webhook_secret.as_deref(), &headers) {
        tracing::warn!("Telegram webhook secret mismatch");
        return StatusCode::FORBIDDEN;
    }

    // 无法解码的 Update 只记日志，同样应答 200
    let update: Update = match serde_json::from_slice(&body) {
        Ok(update) => update,
        Err(e) => {
            tracing::warn!(error = %e, bytes = body.len(), "Ignoring undecodable Telegram update");
            return StatusCode::OK;
        }
    };

    if let (Some(query), Some(client)) = (&update.callback_query, &state.client) {
        let client = Arc::clone(client);
        let query_id = query.id.clone();
        tokio::spawn(async move {
            if let Err(e) = client.answer_callback(&query_id).await {
                tracing::warn!(error = %e, "Failed to answer callback query");
            }
        });
    }

    match extract_inbound(&update) {
        Some(inbound) => state.hub.dispatch(inbound),
        None => tracing::debug!(update_id = update.update_id, "Telegram update without text"),
    }
    StatusCode::OK
}

#[derive(Debug, Serialize)]
struct SendMessageRequest<'a> {
    chat_id: &'a str,
    text: &'a str,
}

#[derive(Debug, Serialize)]
struct AnswerCallbackRequest<'a> {
    callback_query_id: &'a str,
}

#[derive(Debug, Deserialize)]
struct ApiResponse {
    ok: bool,
    description: Option<String>,
}

/// Bot API 客户端
pub struct TelegramClient {
    http: reqwest::Client,
    api_base: String,
    bot_token: String,
}

impl TelegramClient {
    pub fn new(api_base: impl Into<String>, bot_token: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            api_base: api_base.into(),
            bot_token: bot_token.into(),
        }
    }

    pub fn from_config(cfg: &TelegramSection) -> Option<Self> {
        Some(Self::new(cfg.api_base.clone(), cfg.bot_token.clone()?))
    }

    fn method_url(&self, method: &str) -> String {
        format!("{}/bot{}/{}", self.api_base.trim_end_matches('/'), self.bot_token, method)
    }

    async fn call<T: Serialize + ?Sized>(&self, method: &str, body: &T) -> anyhow::Result<()> {
        let resp = self.http.post(self.method_url(method)).json(body).send().await?;
        let status = resp.status();
        let parsed: ApiResponse = resp.json().await?;
        if !status.is_success() || !parsed.ok {
            anyhow::bail!(
                "Telegram {} failed ({}): {}",
                method,
                status,
                parsed.description.unwrap_or_default()
            );
        }
        Ok(())
    }

    pub async fn answer_callback(&self, callback_query_id: &str) -> anyhow::Result<()> {
        self.call("answerCallbackQuery", &AnswerCallbackRequest { callback_query_id })
            .await
    }
}

#[async_trait]
impl MessageSender for TelegramClient {
    fn channel(&self) -> &str {
        CHANNEL
    }

    async fn send_text(&self, user_key: &str, text: &str) -> anyhow::Result<()> {
        for chunk in chunk_text(text, MAX_CHUNK_CHARS) {
            self.call("sendMessage", &SendMessageRequest { chat_id: user_key, text: &chunk })
                .await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;
    use serde_json::json;

    fn update(value: serde_json::Value) -> Update {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_message_and_edited_message() {
        let u = update(json!({"update_id": 10, "message": {"message_id": 1, "chat": {"id": 42}, "text": " 1 "}}));
        let inbound = extract_inbound(&u).unwrap();
        assert_eq!(inbound.session_id(), "tg:42");
        assert_eq!(inbound.text, "1");
        assert_eq!(inbound.message_id.as_deref(), Some("10"));

        let u = update(json!({"update_id": 11, "edited_message": {"message_id": 1, "chat": {"id": 42}, "caption": "foto"}}));
        assert_eq!(extract_inbound(&u).unwrap().text, "foto");
    }

    #[test]
    fn test_callback_query_uses_data() {
        let u = update(json!({"update_id": 12, "callback_query": {
            "id": "cb1", "from": {"id": 7}, "data": "2",
            "message": {"message_id": 3, "chat": {"id": -100}}
        }}));
        let inbound = extract_inbound(&u).unwrap();
        assert_eq!(inbound.user_key, "-100");
        assert_eq!(inbound.text, "2");
    }

    #[test]
    fn test_updates_without_text_ignored() {
        let u = update(json!({"update_id": 13, "message": {"message_id": 1, "chat": {"id": 42}}}));
        assert!(extract_inbound(&u).is_none());
        let u = update(json!({"update_id": 14}));
        assert!(extract_inbound(&u).is_none());
    }

    #[test]
    fn test_secret_header() {
        let mut headers = HeaderMap::new();
        assert!(secret_matches(None, &headers));
        assert!(!secret_matches(Some("s3cret"), &headers));
        headers.insert(SECRET_HEADER, HeaderValue::from_static("s3cret"));
        assert!(secret_matches(Some("s3cret"), &headers));
        assert!(!secret_matches(Some("other"), &headers));
    }

    #[test]
    fn test_method_url() {
        let client = TelegramClient::new("https://api.telegram.org/", "123:abc");
        assert_eq!(client.method_url("sendMessage"), "https://api.telegram.org/bot123:abc/sendMessage");
    }
}
