//! 对话流程：节点图类型、加载器、上下文路径、渲染与引擎

pub mod context;
pub mod engine;
pub mod loader;
pub mod normalize;
pub mod render;
pub mod types;

pub use context::Context;
pub use engine::{EngineSettings, FlowEngine, Reply, MAX_FORCED_TRANSITIONS};
pub use loader::{load, load_or_safety, load_path, safety_graph};
pub use types::{DynamicOptions, HookCall, Node, NodeGraph, NodeId, NodeKind, NodeOption, ValidationRule};
