//! 对话流程引擎
//!
//! `process(session_id, text)`：加锁 → 读会话 → [`FlowEngine::step`]（纯同步状态转移）→ 写会话 → 返回回复。
//!
//! 每条消息的处理顺序：
//! 1. 当前节点不存在（新会话或节点图已更新）时强制回到起始节点
//! 2. 若当前节点的 on_enter 尚未执行，先执行；Hook 强制跳转最多连续 [`MAX_FORCED_TRANSITIONS`] 次
//! 3. 归一化输入（trim、小写、去重音、合并空白）；上下文里保存的是只 trim 过的原文
//! 4. 全局快捷键优先：首页、返回、人工转接
//! 5. 按节点类型处理：choice 匹配选项键，input 校验后保存，message 直接推进
//! 6. 渲染目标节点（占位符替换、选项列表、导航页脚）

use std::sync::Arc;

use chrono::Timelike;
use serde::Serialize;
use serde_json::Value;

use super::context::{get_path, resolve_arg, section, set_path, Context};
use super::normalize::normalize;
use super::render::{compose, RenderedOption};
use super::types::{HookCall, Node, NodeGraph, NodeKind};
use crate::clinic::Clock;
use crate::config::FlowSection;
use crate::core::FlowError;
use crate::hooks::builtin::daypart_greeting;
use crate::hooks::HookRegistry;
use crate::session::{InactivityStage, Session, SessionKey, SessionLocks, SessionStore};

/// on_enter Hook 连续强制跳转的上限（两个节点互相重定向时保证终止）
pub const MAX_FORCED_TRANSITIONS: usize = 8;

/// 引擎返回给适配层的回复
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Reply {
    pub message: String,
    pub node: String,
    pub options: Vec<String>,
}

/// 引擎行为设置（来自 [flow] 配置段；快捷键已归一化）
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub home_codes: Vec<String>,
    pub back_codes: Vec<String>,
    pub handoff_codes: Vec<String>,
    pub handoff_node: Option<String>,
    pub handoff_hook: Option<String>,
    pub handoff_message: String,
    pub footer: String,
    pub invalid_option_message: String,
    pub invalid_input_message: String,
    pub fallback_message: String,
    pub greet_new_sessions: bool,
    pub max_history: usize,
}

impl From<&FlowSection> for EngineSettings {
    fn from(cfg: &FlowSection) -> Self {
        let codes = |list: &[String]| -> Vec<String> {
            list.iter()
                .map(|c| normalize(c))
                .filter(|c| !c.is_empty())
                .collect()
        };
        Self {
            home_codes: codes(&cfg.home_codes),
            back_codes: codes(&cfg.back_codes),
            handoff_codes: codes(&cfg.handoff_codes),
            handoff_node: cfg.handoff_node.clone().filter(|s| !s.is_empty()),
            handoff_hook: cfg.handoff_hook.clone().filter(|s| !s.is_empty()),
            handoff_message: cfg.handoff_message.clone(),
            footer: cfg.footer.clone(),
            invalid_option_message: cfg.invalid_option_message.clone(),
            invalid_input_message: cfg.invalid_input_message.clone(),
            fallback_message: cfg.fallback_message.clone(),
            greet_new_sessions: cfg.greet_new_sessions,
            max_history: cfg.max_history.max(1),
        }
    }
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self::from(&FlowSection::default())
    }
}

impl EngineSettings {
    fn is_shortcut(&self, normalized: &str) -> bool {
        self.home_codes.iter().chain(&self.back_codes).chain(&self.handoff_codes).any(|c| c == normalized)
    }
}

/// 一个可选项（静态选项或由上下文列表生成的动态选项）
struct ResolvedOption<'a> {
    key: String,
    label: String,
    next: Option<&'a str>,
    hooks: &'a [HookCall],
    save: Option<&'a serde_json::Map<String, Value>>,
    /// 动态选项：(写入路径, 值)
    dynamic_save: Option<(&'a str, Value)>,
}

pub struct FlowEngine {
    graph: Arc<NodeGraph>,
    hooks: Arc<HookRegistry>,
    store: Arc<dyn SessionStore>,
    settings: EngineSettings,
    clock: Clock,
    locks: SessionLocks,
}

impl FlowEngine {
    pub fn new(
        graph: Arc<NodeGraph>,
        hooks: Arc<HookRegistry>,
        store: Arc<dyn SessionStore>,
        settings: EngineSettings,
        clock: Clock,
    ) -> Self {
        Self {
            graph,
            hooks,
            store,
            settings,
            clock,
            locks: SessionLocks::new(),
        }
    }

    pub fn graph(&self) -> &NodeGraph {
        &self.graph
    }

    pub fn hooks(&self) -> &HookRegistry {
        &self.hooks
    }

    pub fn store(&self) -> &Arc<dyn SessionStore> {
        &self.store
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    /// 处理一条入站消息（同一会话的并发调用按到达顺序串行）
    pub async fn process(&self, session_id: &str, text: &str) -> Result<Reply, FlowError> {
        let key = SessionKey::parse(session_id)?;
        let id = key.id();
        let _guard = self.locks.acquire(&id).await;

        let mut session = self.store.get(&id).await?;
        let reply = self.step(&mut session, text);
        self.store.set(&id, &session).await?;

        tracing::debug!(session = %id, node = %reply.node, "Message processed");
        Ok(reply)
    }

    /// 同 [`process`](Self::process)，出错时返回通用回复，适配层总能回答用户
    pub async fn process_or_fallback(&self, session_id: &str, text: &str) -> Reply {
        match self.process(session_id, text).await {
            Ok(reply) => reply,
            Err(e) => {
                tracing::error!(session = session_id, error = %e, retryable = e.is_retryable(), "Flow processing failed");
                Reply {
                    message: self.settings.fallback_message.clone(),
                    node: self.graph.start().to_string(),
                    options: Vec::new(),
                }
            }
        }
    }

    /// 获取会话锁（后台任务修改会话前使用，与 process 互斥）
    pub async fn lock_session(&self, session_id: &str) -> tokio::sync::OwnedMutexGuard<()> {
        self.locks.acquire(session_id).await
    }

    /// 软重置：回到起始节点并清空历史（上下文保留），下次消息时重新执行起始节点的 on_enter
    pub fn reset_to_start(&self, session: &mut Session) {
        session.current_node = self.graph.start().to_string();
        session.history.clear();
        session.needs_on_enter = true;
    }

    /// 纯同步状态转移：根据输入修改会话并返回回复（不做任何 I/O，Hook 除外）
    pub fn step(&self, session: &mut Session, raw: &str) -> Reply {
        let raw = raw.trim();
        let normalized = normalize(raw);
        let fresh = !session.has_greeted;
        let brand_new = fresh && session.current_node.is_empty();

        session.inactivity_stage = InactivityStage::Active;
        self.record_meta(session);

        if !self.graph.contains(&session.current_node) {
            if !session.current_node.is_empty() {
                tracing::warn!(node = %session.current_node, "Session points at a missing node, restarting");
            }
            self.reset_to_start(session);
        }

        if session.needs_on_enter {
            let current = session.current_node.clone();
            self.enter(session, current, raw);
        }

        let notice = self.dispatch(session, raw, &normalized, fresh, brand_new);

        self.mirror_patient_id(session);

        let mut reply = self.render_current(session, notice);
        if !session.has_greeted {
            if self.settings.greet_new_sessions {
                let greeting = daypart_greeting(self.clock.now().hour());
                reply.message = format!("{}\n\n{}", greeting, reply.message);
            }
            session.has_greeted = true;
        }
        reply
    }

    /// 处理输入；返回需要放在回复前面的提示（无效选项 / 校验错误 / 转接说明）
    fn dispatch(&self, session: &mut Session, raw: &str, normalized: &str, fresh: bool, brand_new: bool) -> Option<String> {
        // 全局快捷键
        if self.settings.home_codes.iter().any(|c| c == normalized) {
            session.context.insert("last_text".into(), Value::String(raw.to_string()));
            session.history.clear();
            self.enter(session, self.graph.start().to_string(), raw);
            return None;
        }
        if self.settings.back_codes.iter().any(|c| c == normalized) {
            session.context.insert("last_text".into(), Value::String(raw.to_string()));
            let previous = session
                .history
                .pop()
                .filter(|id| self.graph.contains(id))
                .unwrap_or_else(|| self.graph.start().to_string());
            self.enter(session, previous, raw);
            return None;
        }
        if self.settings.handoff_codes.iter().any(|c| c == normalized) {
            return self.handoff(session, raw);
        }

        let Some(node) = self.graph.get(&session.current_node) else {
            return None;
        };

        match node.kind {
            NodeKind::Choice => self.handle_choice(session, node, raw, normalized, fresh),
            NodeKind::Input => self.handle_input(session, node, raw),
            NodeKind::Message => {
                if brand_new && node.id == self.graph.start() {
                    // 第一次见面先展示起始消息，不消耗输入
                    return None;
                }
                session.context.insert("last_text".into(), Value::String(raw.to_string()));
                let forced = self.run_hooks(&node.hooks, &mut session.context, raw);
                let next = forced.or_else(|| node.next.clone());
                self.transition(session, next, raw);
                None
            }
        }
    }

    fn handle_choice(&self, session: &mut Session, node: &Node, raw: &str, normalized: &str, fresh: bool) -> Option<String> {
        let options = self.resolve_options(node, &session.context);
        let Some(chosen) = options.into_iter().find(|o| normalize(&o.key) == normalized) else {
            if fresh {
                return None;
            }
            tracing::debug!(node = %node.id, input = raw, "No option matched");
            return Some(self.settings.invalid_option_message.clone());
        };

        let ctx = &mut session.context;
        ctx.insert("last_text".into(), Value::String(raw.to_string()));
        if let Some(save) = chosen.save {
            for (path, value) in save {
                let resolved = resolve_arg(value, ctx, raw);
                set_path(ctx, path, resolved);
            }
        }
        if let Some((path, value)) = chosen.dynamic_save {
            set_path(ctx, path, value);
        }

        let option_override = self.run_hooks(chosen.hooks, ctx, raw);
        let node_override = self.run_hooks(&node.hooks, ctx, raw);
        let next = option_override
            .or(node_override)
            .or_else(|| chosen.next.map(str::to_string))
            .or_else(|| node.next.clone());
        self.transition(session, next, raw);
        None
    }

    fn handle_input(&self, session: &mut Session, node: &Node, raw: &str) -> Option<String> {
        let rule = match node.validation.as_deref() {
            Some(name) => {
                let rule = self.graph.validation(name);
                if rule.is_none() {
                    tracing::warn!(node = %node.id, rule = name, "Unknown validation rule, accepting input");
                }
                rule
            }
            None => self.graph.validation("non_empty"),
        };
        if let Some(rule) = rule {
            if !rule.matches(raw) {
                let error = if rule.error.trim().is_empty() {
                    self.settings.invalid_input_message.clone()
                } else {
                    rule.error.clone()
                };
                return Some(error);
            }
        }

        let ctx = &mut session.context;
        ctx.insert("last_text".into(), Value::String(raw.to_string()));
        if let Some(path) = &node.save_as {
            set_path(ctx, path, Value::String(raw.to_string()));
        }
        let forced = self.run_hooks(&node.hooks, ctx, raw);
        let next = forced.or_else(|| node.next.clone());
        self.transition(session, next, raw);
        None
    }

    fn handoff(&self, session: &mut Session, raw: &str) -> Option<String> {
        session.context.insert("last_text".into(), Value::String(raw.to_string()));
        if let Some(hook) = self.settings.handoff_hook.as_deref().filter(|h| self.hooks.contains(h)) {
            self.hooks.call(hook, &[], &mut session.context);
        }
        match self.settings.handoff_node.as_deref().filter(|n| self.graph.contains(n)) {
            Some(node) => {
                self.transition(session, Some(node.to_string()), raw);
                None
            }
            None => Some(self.settings.handoff_message.clone()),
        }
    }

    /// 静态选项 + 动态选项；动态选项的键从 1 开始顺延，跳过已被静态选项或快捷键占用的键
    fn resolve_options<'a>(&self, node: &'a Node, ctx: &Context) -> Vec<ResolvedOption<'a>> {
        let mut out: Vec<ResolvedOption<'a>> = node
            .options
            .iter()
            .map(|o| ResolvedOption {
                key: o.key.clone(),
                label: o.label.clone().unwrap_or_default(),
                next: o.next.as_deref(),
                hooks: &o.hooks,
                save: Some(&o.save),
                dynamic_save: None,
            })
            .collect();

        let Some(dynamic) = &node.dynamic_options else {
            return out;
        };
        let Some(Value::Array(items)) = get_path(ctx, &dynamic.source) else {
            return out;
        };

        let mut counter = 0usize;
        for item in items {
            let (label, value) = match item {
                Value::String(s) => (s.clone(), Value::String(s.clone())),
                Value::Object(map) => {
                    let label = map
                        .get("label")
                        .and_then(Value::as_str)
                        .map(str::to_string)
                        .unwrap_or_else(|| item.to_string());
                    let value = map.get("value").cloned().unwrap_or_else(|| Value::String(label.clone()));
                    (label, value)
                }
                other => (other.to_string(), other.clone()),
            };
            let key = loop {
                counter += 1;
                let candidate = counter.to_string();
                let taken = out.iter().any(|o| normalize(&o.key) == candidate) || self.settings.is_shortcut(&candidate);
                if !taken {
                    break candidate;
                }
            };
            out.push(ResolvedOption {
                key,
                label,
                next: dynamic.next.as_deref(),
                hooks: &[],
                save: None,
                dynamic_save: dynamic.save_as.as_deref().map(|path| (path, value)),
            });
        }
        out
    }

    /// 依次执行 Hook；返回最后一个生效的跳转指令
    fn run_hooks(&self, calls: &[HookCall], ctx: &mut Context, input: &str) -> Option<String> {
        let mut forced = None;
        for call in calls {
            let args: Vec<Value> = call.args.iter().map(|a| resolve_arg(a, ctx, input)).collect();
            let result = self.hooks.call(&call.hook, &args, ctx);
            if let Some(path) = call.save_as.as_deref().filter(|_| !result.is_null()) {
                set_path(ctx, path, result.clone());
            }
            if let Value::Bool(flag) = result {
                let target = if flag { &call.if_true_next } else { &call.if_false_next };
                if let Some(target) = target {
                    forced = Some(target.clone());
                }
            }
        }
        forced
    }

    /// 跳转到 next（None 或不存在的节点都回到起始节点），维护历史栈后进入目标节点
    fn transition(&self, session: &mut Session, next: Option<String>, input: &str) {
        let target = self.resolve_target(next);
        if target != session.current_node {
            session.history.push(session.current_node.clone());
            let overflow = session.history.len().saturating_sub(self.settings.max_history);
            if overflow > 0 {
                session.history.drain(..overflow);
            }
        }
        self.enter(session, target, input);
    }

    fn resolve_target(&self, next: Option<String>) -> String {
        match next {
            Some(id) if self.graph.contains(&id) => id,
            Some(id) => {
                tracing::warn!(target_node = %id, "Transition to a missing node, using start");
                self.graph.start().to_string()
            }
            None => self.graph.start().to_string(),
        }
    }

    /// 进入节点并执行 on_enter；Hook 强制跳转时继续进入新节点（不压历史），超过上限停在当前节点
    fn enter(&self, session: &mut Session, target: String, input: &str) {
        let mut target = self.resolve_target(Some(target));
        let mut hops = 0usize;
        loop {
            if target == self.graph.start() {
                session.history.clear();
            }
            session.current_node = target;
            let Some(node) = self.graph.get(&session.current_node) else {
                break;
            };
            let Some(forced) = self.run_hooks(&node.on_enter, &mut session.context, input) else {
                break;
            };
            if hops >= MAX_FORCED_TRANSITIONS {
                tracing::warn!(
                    node = %session.current_node,
                    limit = MAX_FORCED_TRANSITIONS,
                    "Too many forced transitions, stopping"
                );
                break;
            }
            hops += 1;
            target = self.resolve_target(Some(forced));
        }
        session.needs_on_enter = false;
    }

    fn record_meta(&self, session: &mut Session) {
        let (channel, user_key) = (session.channel.clone(), session.user_key.clone());
        let meta = section(&mut session.context, "meta");
        if !channel.is_empty() && meta.get("channel").and_then(Value::as_str) != Some(channel.as_str()) {
            meta.insert("channel".into(), Value::String(channel));
        }
        if !user_key.is_empty() && meta.get("user_key").and_then(Value::as_str) != Some(user_key.as_str()) {
            meta.insert("user_key".into(), Value::String(user_key));
        }
    }

    fn mirror_patient_id(&self, session: &mut Session) {
        let dni = ["agenda.patient.dni", "agenda.dni"]
            .iter()
            .find_map(|path| get_path(&session.context, path).and_then(Value::as_str))
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string);
        if dni.is_some() {
            session.patient_id = dni;
        }
    }

    fn render_current(&self, session: &Session, notice: Option<String>) -> Reply {
        let node = self
            .graph
            .get(&session.current_node)
            .unwrap_or_else(|| self.graph.start_node());
        let options: Vec<RenderedOption> = match node.kind {
            NodeKind::Choice => self
                .resolve_options(node, &session.context)
                .into_iter()
                .map(|o| RenderedOption { key: o.key, label: o.label })
                .collect(),
            _ => Vec::new(),
        };
        let footer = (node.id != self.graph.start() && !node.hide_navigation).then_some(self.settings.footer.as_str());
        let body = compose(&node.prompt, &options, footer, &session.context);
        let message = match notice {
            Some(notice) if body.is_empty() => notice,
            Some(notice) => format!("{}\n\n{}", notice, body),
            None => body,
        };
        Reply {
            message,
            node: node.id.clone(),
            options: options
                .into_iter()
                .filter(|o| !o.label.is_empty())
                .map(|o| o.label)
                .collect(),
        }
    }
}
