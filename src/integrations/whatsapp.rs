//! WhatsApp Cloud API 集成
//!
//! GET /webhook/whatsapp 完成 Meta 的订阅验证；POST /webhook/whatsapp 接收消息，
//! 解析出文本后交给 [`MessageHub`] 后台处理，立即返回 200。回复通过 Graph API 发送。

use std::sync::Arc;

use async_trait::async_trait;
use axum::{
    body::Bytes,
    extract::{Query, State},
    http::StatusCode,
    routing::get,
    Router,
};
use serde::{Deserialize, Serialize};

use super::inbound::{Inbound, MessageHub};
use super::sender::{chunk_text, MessageSender, MAX_CHUNK_CHARS};
use crate::config::WhatsappSection;

/// 会话键中的渠道代码
pub const CHANNEL: &str = "wa";

/// WhatsApp 服务状态
pub struct WhatsappState {
    pub hub: Arc<MessageHub>,
    pub verify_token: Option<String>,
}

/// Webhook 验证参数
#[derive(Debug, Deserialize)]
pub struct WebhookVerifyQuery {
    #[serde(rename = "hub.mode")]
    pub mode: Option<String>,
    #[serde(rename = "hub.verify_token")]
    pub verify_token: Option<String>,
    #[serde(rename = "hub.challenge")]
    pub challenge: Option<String>,
}

/// WhatsApp Webhook 请求体
#[derive(Debug, Deserialize)]
pub struct WebhookPayload {
    pub object: Option<String>,
    pub entry: Option<Vec<WebhookEntry>>,
}

#[derive(Debug, Deserialize)]
pub struct WebhookEntry {
    pub id: Option<String>,
    pub changes: Option<Vec<WebhookChange>>,
}

#[derive(Debug, Deserialize)]
pub struct WebhookChange {
    pub value: Option<WebhookValue>,
    pub field: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct WebhookValue {
    pub messaging_product: Option<String>,
    pub messages: Option<Vec<WebhookMessage>>,
}

#[derive(Debug, Deserialize)]
pub struct WebhookMessage {
    pub from: String,
    pub id: Option<String>,
    pub timestamp: Option<String>,
    #[serde(rename = "type")]
    pub msg_type: Option<String>,
    pub text: Option<WebhookText>,
    pub interactive: Option<WebhookInteractive>,
    pub button: Option<WebhookButton>,
    pub reaction: Option<WebhookReaction>,
}

#[derive(Debug, Deserialize)]
pub struct WebhookText {
    pub body: String,
}

/// 交互消息（按钮回复 / 列表回复）
#[derive(Debug, Deserialize)]
pub struct WebhookInteractive {
    #[serde(rename = "type")]
    pub kind: Option<String>,
    pub button_reply: Option<WebhookReplyItem>,
    pub list_reply: Option<WebhookReplyItem>,
}

#[derive(Debug, Deserialize)]
pub struct WebhookReplyItem {
    pub id: Option<String>,
    pub title: Option<String>,
}

/// 模板消息的快捷回复按钮
#[derive(Debug, Deserialize)]
pub struct WebhookButton {
    pub payload: Option<String>,
    pub text: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct WebhookReaction {
    pub emoji: Option<String>,
}

/// 从一条消息中取出文本：交互回复优先用 id（与选项键一致），没有 id 再用标题
pub fn message_text(msg: &WebhookMessage) -> Option<String> {
    let text = match msg.msg_type.as_deref() {
        Some("text") => msg.text.as_ref().map(|t| t.body.clone()),
        Some("interactive") => msg.interactive.as_ref().and_then(|i| {
            let item = match i.kind.as_deref() {
                Some("list_reply") => i.list_reply.as_ref(),
                _ => i.button_reply.as_ref().or(i.list_reply.as_ref()),
            }?;
            item.id.clone().or_else(|| item.title.clone())
        }),
        Some("button") => msg
            .button
            .as_ref()
            .and_then(|b| b.payload.clone().or_else(|| b.text.clone())),
        Some("reaction") => msg.reaction.as_ref().and_then(|r| r.emoji.clone()),
        _ => None,
    }?;
    let text = text.trim().to_string();
    (!text.is_empty()).then_some(text)
}

/// 解析 Webhook 请求体中的全部入站文本消息
pub fn extract_inbound(payload: &WebhookPayload) -> Vec<Inbound> {
    if payload.object.as_deref() != Some("whatsapp_business_account") {
        return Vec::new();
    }
    payload
        .entry
        .iter()
        .flatten()
        .flat_map(|entry| entry.changes.iter().flatten())
        .filter_map(|change| change.value.as_ref())
        .flat_map(|value| value.messages.iter().flatten())
        .filter_map(|msg| {
            let text = message_text(msg)?;
            Some(Inbound {
                channel: CHANNEL.to_string(),
                user_key: msg.from.trim_start_matches('+').to_string(),
                message_id: msg.id.clone(),
                text,
            })
        })
        .collect()
}

/// 创建 WhatsApp 路由
pub fn create_router(state: Arc<WhatsappState>) -> Router {
    Router::new()
        .route("/webhook/whatsapp", get(webhook_verify).post(webhook_receive))
        .with_state(state)
}

/// GET /webhook/whatsapp - Meta 验证 Webhook
async fn webhook_verify(
    State(state): State<Arc<WhatsappState>>,
    Query(query): Query<WebhookVerifyQuery>,
) -> Result<String, StatusCode> {
    let Some(expected) = state.verify_token.as_deref() else {
        tracing::warn!("WhatsApp verify token is not configured, rejecting verification");
        return Err(StatusCode::FORBIDDEN);
    };
    if query.mode.as_deref() == Some("subscribe") && query.verify_token.as_deref() == Some(expected) {
        tracing::info!("WhatsApp webhook verified");
        Ok(query.challenge.unwrap_or_default())
    } else {
        Err(StatusCode::FORBIDDEN)
    }
}

/// POST /webhook/whatsapp - 接收 WhatsApp 消息（总是返回 200）
///
/// 请求体自行解码：解析失败只记日志，仍然应答 200。
async fn webhook_receive(State(state): State<Arc<WhatsappState>>, body: Bytes) -> StatusCode {
    let payload: WebhookPayload = match serde_json::from_slice(&body) {
        Ok(payload) => payload,
        Err(e) => {
            tracing::warn!(error = %e, bytes = body.len(), "Ignoring undecodable WhatsApp webhook body");
            return StatusCode::OK;
        }
    };
    let messages = extract_inbound(&payload);
    tracing::debug!(count = messages.len(), "WhatsApp webhook received");
    for inbound in messages {
        state.hub.dispatch(inbound);
    }
    StatusCode::OK
}

/// WhatsApp 发送消息 API 请求体
#[derive(Debug, Serialize)]
struct SendMessageRequest<'a> {
    messaging_product: &'static str,
    to: &'a str,
    #[serde(rename = "type")]
    msg_type: &'static str,
    text: SendMessageText<'a>,
}

#[derive(Debug, Serialize)]
struct SendMessageText<'a> {
    body: &'a str,
}

/// Graph API 客户端
pub struct WhatsappClient {
    http: reqwest::Client,
    api_base: String,
    access_token: String,
    phone_number_id: String,
}

impl WhatsappClient {
    pub fn new(api_base: impl Into<String>, access_token: impl Into<String>, phone_number_id: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            api_base: api_base.into(),
            access_token: access_token.into(),
            phone_number_id: phone_number_id.into(),
        }
    }

    /// 配置不完整（缺 token 或号码 ID）时返回 None
    pub fn from_config(cfg: &WhatsappSection) -> Option<Self> {
        Some(Self::new(
            cfg.api_base.clone(),
            cfg.access_token.clone()?,
            cfg.phone_number_id.clone()?,
        ))
    }

    fn messages_url(&self) -> String {
        format!("{}/{}/messages", self.api_base.trim_end_matches('/'), self.phone_number_id)
    }
}

#[async_trait]
impl MessageSender for WhatsappClient {
    fn channel(&self) -> &str {
        CHANNEL
    }

    async fn send_text(&self, user_key: &str, text: &str) -> anyhow::Result<()> {
        let url = self.messages_url();
        let to = user_key.trim_start_matches('+');
        for chunk in chunk_text(text, MAX_CHUNK_CHARS) {
            let req = SendMessageRequest {
                messaging_product: "whatsapp",
                to,
                msg_type: "text",
                text: SendMessageText { body: &chunk },
            };
            let resp = self
                .http
                .post(&url)
                .bearer_auth(&self.access_token)
                .json(&req)
                .send()
                .await?;
            if !resp.status().is_success() {
                let status = resp.status();
                let body = resp.text().await.unwrap_or_default();
                anyhow::bail!("WhatsApp API error {}: {}", status, body);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn payload(messages: serde_json::Value) -> WebhookPayload {
        serde_json::from_value(json!({
            "object": "whatsapp_business_account",
            "entry": [{"id": "1", "changes": [{"field": "messages", "value": {
                "messaging_product": "whatsapp",
                "messages": messages
            }}]}]
        }))
        .unwrap()
    }

    #[test]
    fn test_extracts_text_and_interactive_replies() {
        let p = payload(json!([
            {"from": "593991234567", "id": "wamid.A", "type": "text", "text": {"body": " Hola "}},
            {"from": "593991234567", "id": "wamid.B", "type": "interactive",
             "interactive": {"type": "button_reply", "button_reply": {"id": "1", "title": "Agendar"}}},
            {"from": "593991234567", "id": "wamid.C", "type": "interactive",
             "interactive": {"type": "list_reply", "list_reply": {"title": "19-10-2026 16:00"}}},
            {"from": "593991234567", "id": "wamid.D", "type": "button", "button": {"text": "Sí"}},
            {"from": "593991234567", "id": "wamid.E", "type": "reaction", "reaction": {"emoji": "👍"}},
            {"from": "593991234567", "id": "wamid.F", "type": "image"}
        ]));
        let texts: Vec<String> = extract_inbound(&p).into_iter().map(|i| i.text).collect();
        assert_eq!(texts, vec!["Hola", "1", "19-10-2026 16:00", "Sí", "👍"]);
    }

    #[test]
    fn test_inbound_fields() {
        let p = payload(json!([{"from": "+593991234567", "id": "wamid.A", "type": "text", "text": {"body": "1"}}]));
        let inbound = extract_inbound(&p);
        assert_eq!(inbound.len(), 1);
        assert_eq!(inbound[0].session_id(), "wa:593991234567");
        assert_eq!(inbound[0].message_id.as_deref(), Some("wamid.A"));
    }

    #[test]
    fn test_other_objects_ignored() {
        let p: WebhookPayload = serde_json::from_value(json!({"object": "page", "entry": []})).unwrap();
        assert!(extract_inbound(&p).is_empty());
    }

    #[test]
    fn test_client_requires_token_and_number() {
        let mut cfg = WhatsappSection::default();
        assert!(WhatsappClient::from_config(&cfg).is_none());
        cfg.access_token = Some("t".into());
        cfg.phone_number_id = Some("123".into());
        let client = WhatsappClient::from_config(&cfg).unwrap();
        assert_eq!(client.messages_url(), "https://graph.facebook.com/v20.0/123/messages");
    }
}
