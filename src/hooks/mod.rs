//! Hook 分发：注册表、通用 Hook、诊所 Hook

pub mod builtin;
pub mod clinic;
pub mod registry;

use std::sync::Arc;

pub use registry::{FnHook, Hook, HookRegistry};

use crate::clinic::{ClinicDb, Clock, SlotRules};

/// 构造完整注册表：通用 Hook 总是注册；有诊所数据库时再注册诊所 Hook
pub fn build_registry(clock: Clock, rules: SlotRules, db: Option<Arc<ClinicDb>>) -> HookRegistry {
    let mut registry = HookRegistry::new();
    builtin::register(&mut registry, clock.clone());
    match db {
        Some(db) => clinic::register(&mut registry, db, rules, clock),
        None => tracing::warn!("No clinic database configured, clinic hooks are disabled"),
    }
    tracing::info!(hooks = registry.len(), "Hook registry ready");
    registry
}
