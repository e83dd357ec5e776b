//! 外部集成：WhatsApp、Telegram（需对应 feature 与公网 Webhook 域名）
//!
//! 渠道无关部分（去重、消息日志、出站发送）不依赖 feature。

pub mod idempotency;
pub mod inbound;
pub mod sender;

#[cfg(feature = "whatsapp")]
pub mod whatsapp;

#[cfg(feature = "telegram")]
pub mod telegram;

pub use idempotency::ProcessedEvents;
pub use inbound::{Inbound, MessageHub};
pub use sender::{MessageSender, Senders};

/// GET /health
#[cfg(any(feature = "whatsapp", feature = "telegram"))]
pub fn health_router() -> axum::Router {
    use axum::{routing::get, Json};
    axum::Router::new().route("/health", get(|| async { Json(serde_json::json!({"ok": true})) }))
}
