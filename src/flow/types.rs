//! 节点图类型定义
//!
//! 加载器把各种历史 JSON 形状统一归一化到这里的规范模型，
//! 引擎与其它组件只面对 [`NodeGraph`]，不再关心来源格式。

use std::collections::HashMap;

use regex::Regex;
use serde_json::{Map, Value};

pub type NodeId = String;

/// 节点类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    /// 纯消息：无需输入，下一条消息直接推进到 next
    Message,
    /// 菜单选择（JSON 中的 `choice` / `menu`）
    Choice,
    /// 自由输入（可带校验规则）
    Input,
}

impl NodeKind {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "message" | "info" | "text" => Some(NodeKind::Message),
            "choice" | "menu" | "options" => Some(NodeKind::Choice),
            "input" | "form" | "question" => Some(NodeKind::Input),
            _ => None,
        }
    }
}

/// Hook 调用记录（节点或选项上声明）
#[derive(Debug, Clone, PartialEq)]
pub struct HookCall {
    /// 注册名，如 `patient.lookup`
    pub hook: String,
    /// 字面量、`"@input"` 或 `"@context.path"`
    pub args: Vec<Value>,
    /// 非空返回值写入的上下文路径
    pub save_as: Option<String>,
    pub if_true_next: Option<NodeId>,
    pub if_false_next: Option<NodeId>,
}

impl HookCall {
    pub fn new(hook: impl Into<String>) -> Self {
        Self {
            hook: hook.into(),
            args: Vec::new(),
            save_as: None,
            if_true_next: None,
            if_false_next: None,
        }
    }
}

/// 菜单选项
#[derive(Debug, Clone, PartialEq)]
pub struct NodeOption {
    pub key: String,
    pub label: Option<String>,
    pub next: Option<NodeId>,
    /// 选中时执行（JSON 中的 `hooks` / `on_select`）
    pub hooks: Vec<HookCall>,
    /// 选中时写入上下文：路径 -> 值（值同样支持 `@input` / `@context.*`）
    pub save: Map<String, Value>,
}

impl NodeOption {
    pub fn new(key: impl Into<String>, next: Option<NodeId>) -> Self {
        Self {
            key: key.into(),
            label: None,
            next,
            hooks: Vec::new(),
            save: Map::new(),
        }
    }
}

/// 动态选项：从上下文中的列表生成（如可预约时段）
#[derive(Debug, Clone, PartialEq)]
pub struct DynamicOptions {
    /// 上下文中列表的路径，元素为 `{label, value}` 对象或字符串
    pub source: String,
    pub next: Option<NodeId>,
    /// 选中元素的 value 写入的上下文路径
    pub save_as: Option<String>,
}

/// 编译后的校验规则
#[derive(Debug, Clone)]
pub struct ValidationRule {
    pub pattern: Regex,
    pub error: String,
}

impl ValidationRule {
    pub fn new(pattern: &str, error: impl Into<String>) -> Result<Self, regex::Error> {
        Ok(Self {
            pattern: Regex::new(pattern)?,
            error: error.into(),
        })
    }

    pub fn matches(&self, text: &str) -> bool {
        self.pattern.is_match(text)
    }
}

impl PartialEq for ValidationRule {
    fn eq(&self, other: &Self) -> bool {
        self.pattern.as_str() == other.pattern.as_str() && self.error == other.error
    }
}

/// 对话节点
#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    pub id: NodeId,
    pub kind: NodeKind,
    pub prompt: Vec<String>,
    pub options: Vec<NodeOption>,
    pub dynamic_options: Option<DynamicOptions>,
    /// 校验规则名（图级、内置，或加载器为内联规则生成的 `@<node_id>`）
    pub validation: Option<String>,
    pub save_as: Option<String>,
    /// 进入节点时执行，可强制跳转
    pub on_enter: Vec<HookCall>,
    /// 匹配成功（或消息节点推进）后执行
    pub hooks: Vec<HookCall>,
    pub next: Option<NodeId>,
    pub hide_navigation: bool,
}

impl Node {
    pub fn new(id: impl Into<String>, kind: NodeKind) -> Self {
        Self {
            id: id.into(),
            kind,
            prompt: Vec::new(),
            options: Vec::new(),
            dynamic_options: None,
            validation: None,
            save_as: None,
            on_enter: Vec::new(),
            hooks: Vec::new(),
            next: None,
            hide_navigation: false,
        }
    }

    pub fn option(&self, key: &str) -> Option<&NodeOption> {
        self.options.iter().find(|o| o.key == key)
    }
}

/// 归一化后的节点图（加载后只读，可在并发请求间共享）
#[derive(Debug, Clone, PartialEq)]
pub struct NodeGraph {
    start: NodeId,
    nodes: HashMap<NodeId, Node>,
    /// 文档顺序
    order: Vec<NodeId>,
    validations: HashMap<String, ValidationRule>,
    /// 是否为加载失败后的安全图
    degraded: bool,
}

impl NodeGraph {
    pub(crate) fn from_parts(
        start: NodeId,
        nodes: Vec<Node>,
        validations: HashMap<String, ValidationRule>,
        degraded: bool,
    ) -> Self {
        let order = nodes.iter().map(|n| n.id.clone()).collect();
        let nodes = nodes.into_iter().map(|n| (n.id.clone(), n)).collect();
        Self {
            start,
            nodes,
            order,
            validations,
            degraded,
        }
    }

    pub fn start(&self) -> &str {
        &self.start
    }

    pub fn start_node(&self) -> &Node {
        // 构造时保证 start 存在
        &self.nodes[&self.start]
    }

    pub fn get(&self, id: &str) -> Option<&Node> {
        self.nodes.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.nodes.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded
    }

    /// 按文档顺序遍历节点
    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.order.iter().filter_map(|id| self.nodes.get(id))
    }

    pub fn validation(&self, name: &str) -> Option<&ValidationRule> {
        self.validations.get(name)
    }

    /// 所有指向图中不存在节点的跳转（源节点, 目标）；加载时不报错，供运维检查
    pub fn dangling_targets(&self) -> Vec<(NodeId, NodeId)> {
        let mut out = Vec::new();
        for node in self.nodes() {
            let hook_targets = node
                .on_enter
                .iter()
                .chain(node.hooks.iter())
                .chain(node.options.iter().flat_map(|o| o.hooks.iter()))
                .flat_map(|h| [h.if_true_next.as_ref(), h.if_false_next.as_ref()]);
            let targets = node
                .options
                .iter()
                .map(|o| o.next.as_ref())
                .chain(std::iter::once(node.next.as_ref()))
                .chain(std::iter::once(node.dynamic_options.as_ref().and_then(|d| d.next.as_ref())))
                .chain(hook_targets)
                .flatten();
            for target in targets {
                if !self.contains(target) {
                    out.push((node.id.clone(), target.clone()));
                }
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_kind_aliases() {
        assert_eq!(NodeKind::parse("menu"), Some(NodeKind::Choice));
        assert_eq!(NodeKind::parse(" Choice "), Some(NodeKind::Choice));
        assert_eq!(NodeKind::parse("input"), Some(NodeKind::Input));
        assert_eq!(NodeKind::parse("message"), Some(NodeKind::Message));
        assert_eq!(NodeKind::parse("carousel"), None);
    }

    #[test]
    fn test_dangling_targets_reported() {
        let mut menu = Node::new("MENU", NodeKind::Choice);
        menu.options.push(NodeOption::new("1", Some("INFO".into())));
        menu.options.push(NodeOption::new("2", Some("LATER".into())));
        let info = Node::new("INFO", NodeKind::Message);
        let graph = NodeGraph::from_parts("MENU".into(), vec![menu, info], HashMap::new(), false);

        assert_eq!(graph.dangling_targets(), vec![("MENU".to_string(), "LATER".to_string())]);
        assert_eq!(graph.nodes().map(|n| n.id.as_str()).collect::<Vec<_>>(), ["MENU", "INFO"]);
    }
}
