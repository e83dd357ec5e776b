//! AnaBot - 诊所预约对话助手
//!
//! 模块划分：
//! - **clinic**: 患者 / 预约数据库、时段规则与本地时钟
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 错误类型、不活跃会话巡检、优雅关闭
//! - **flow**: JSON 节点图加载、上下文路径、渲染与对话引擎
//! - **hooks**: Hook 注册表与内置 / 诊所 Hook
//! - **integrations**: WhatsApp / Telegram Webhook、去重、出站发送
//! - **observability**: tracing 初始化
//! - **session**: 会话模型、存储（内存 / SQLite）与会话锁

pub mod clinic;
pub mod config;
pub mod core;
pub mod flow;
pub mod hooks;
pub mod integrations;
pub mod observability;
pub mod session;

pub use flow::{FlowEngine, Reply};
