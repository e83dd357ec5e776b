//! Hook 注册表
//!
//! 所有 Hook 实现 Hook trait（name / description / call），由 HookRegistry 按名注册与查找。
//! 引擎只通过 [`HookRegistry::call`] 调用：未注册的名字记 warn 并返回 Null，
//! Hook 返回的错误记日志后同样视为 Null，永远不会中断对话。

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use serde_json::Value;

use crate::flow::Context;

/// Hook trait：同步执行，直接读写会话上下文
pub trait Hook: Send + Sync {
    /// 注册名（节点 JSON 中 `hook` 字段引用的名字，如 `patient.lookup`）
    fn name(&self) -> &str;

    /// 描述（供日志与控制台 `:hooks` 列表）
    fn description(&self) -> &str {
        ""
    }

    /// 执行：args 已解析（`@input` / `@context.*` 已替换）
    fn call(&self, args: &[Value], ctx: &mut Context) -> Result<Value, String>;
}

type HookFn = dyn Fn(&[Value], &mut Context) -> Result<Value, String> + Send + Sync;

/// 闭包 Hook
pub struct FnHook {
    name: String,
    description: String,
    f: Box<HookFn>,
}

impl FnHook {
    pub fn new<F>(name: impl Into<String>, description: impl Into<String>, f: F) -> Self
    where
        F: Fn(&[Value], &mut Context) -> Result<Value, String> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            description: description.into(),
            f: Box::new(f),
        }
    }
}

impl Hook for FnHook {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn call(&self, args: &[Value], ctx: &mut Context) -> Result<Value, String> {
        (self.f)(args, ctx)
    }
}

/// Hook 注册表：按名称存储 Arc<dyn Hook>，支持 register / register_fn / get / call / hook_names
#[derive(Default, Clone)]
pub struct HookRegistry {
    hooks: HashMap<String, Arc<dyn Hook>>,
}

impl HookRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, hook: impl Hook + 'static) {
        let name = hook.name().to_string();
        if self.hooks.insert(name.clone(), Arc::new(hook)).is_some() {
            tracing::warn!(hook = %name, "Hook registered twice, previous one replaced");
        }
    }

    pub fn register_fn<F>(&mut self, name: &str, description: &str, f: F)
    where
        F: Fn(&[Value], &mut Context) -> Result<Value, String> + Send + Sync + 'static,
    {
        self.register(FnHook::new(name, description, f));
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Hook>> {
        self.hooks.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.hooks.contains_key(name)
    }

    /// 调用 Hook；未知名字或执行失败都返回 Null
    pub fn call(&self, name: &str, args: &[Value], ctx: &mut Context) -> Value {
        let Some(hook) = self.hooks.get(name) else {
            tracing::warn!(hook = name, "Hook is not registered, skipping");
            return Value::Null;
        };

        let started = Instant::now();
        let result = hook.call(args, ctx);
        let duration_ms = started.elapsed().as_millis() as u64;

        match result {
            Ok(value) => {
                tracing::info!(target: "anabot::audit", hook = name, ok = true, duration_ms, "hook call");
                value
            }
            Err(e) => {
                tracing::info!(target: "anabot::audit", hook = name, ok = false, duration_ms, "hook call");
                tracing::error!(hook = name, error = %e, "Hook failed");
                Value::Null
            }
        }
    }

    /// 已注册名字（排序，便于展示）
    pub fn hook_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.hooks.keys().cloned().collect();
        names.sort();
        names
    }

    /// 返回 (name, description) 列表
    pub fn hook_descriptions(&self) -> Vec<(String, String)> {
        let mut list: Vec<(String, String)> = self
            .hooks
            .iter()
            .map(|(name, hook)| (name.clone(), hook.description().to_string()))
            .collect();
        list.sort();
        list
    }

    pub fn len(&self) -> usize {
        self.hooks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Echo;

    impl Hook for Echo {
        fn name(&self) -> &str {
            "test.echo"
        }

        fn call(&self, args: &[Value], _ctx: &mut Context) -> Result<Value, String> {
            Ok(args.first().cloned().unwrap_or(Value::Null))
        }
    }

    #[test]
    fn test_register_and_call() {
        let mut registry = HookRegistry::new();
        registry.register(Echo);
        registry.register_fn("ctx.mark", "marks the context", |_, ctx| {
            ctx.insert("marked".into(), json!(true));
            Ok(Value::Bool(true))
        });

        let mut ctx = Context::new();
        assert_eq!(registry.call("test.echo", &[json!("hola")], &mut ctx), json!("hola"));
        assert_eq!(registry.call("ctx.mark", &[], &mut ctx), json!(true));
        assert_eq!(ctx["marked"], json!(true));
        assert_eq!(registry.hook_names(), vec!["ctx.mark", "test.echo"]);
        assert_eq!(registry.hook_descriptions()[0].1, "marks the context");
    }

    #[test]
    fn test_unknown_hook_is_null() {
        let registry = HookRegistry::new();
        let mut ctx = Context::new();
        assert_eq!(registry.call("does.not_exist", &[], &mut ctx), Value::Null);
        assert!(ctx.is_empty());
    }

    #[test]
    fn test_failing_hook_is_null_and_keeps_partial_writes() {
        let mut registry = HookRegistry::new();
        registry.register_fn("boom", "", |_, ctx| {
            ctx.insert("touched".into(), json!(1));
            Err("database unavailable".to_string())
        });
        let mut ctx = Context::new();
        assert_eq!(registry.call("boom", &[], &mut ctx), Value::Null);
        assert_eq!(ctx["touched"], json!(1));
    }
}
