//! 节点图加载器
//!
//! 接受两种来源形状，并统一归一化为 [`NodeGraph`]：
//! - 扁平映射：`{ "<node_id>": { "type", "prompt", "options", ... }, ... }`
//! - 信封：`{ "start": "...", "nodes": {...} | [...], "edges": [...], "validations": {...} }`
//!
//! 形状判断只存在于本模块；加载前会去掉字符串外的 `//` 与 `/* */` 注释。

use std::collections::HashMap;
use std::path::Path;

use serde_json::{Map, Value};

use super::types::{DynamicOptions, HookCall, Node, NodeGraph, NodeKind, NodeOption, ValidationRule};
use crate::core::FlowError;

/// 安全图的起始节点 ID
pub const SAFETY_NODE_ID: &str = "__safety__";

const SAFETY_PROMPT: &str =
    "⚠️ Nuestro asistente está en mantenimiento en este momento. Por favor, escríbenos más tarde o llama a la consulta.";

/// 顶层保留键（扁平映射中不作为节点）
const RESERVED_KEYS: [&str; 3] = ["start", "validations", "edges"];

/// 内置具名校验规则（图级同名规则优先）
const BUILTIN_VALIDATIONS: [(&str, &str, &str); 6] = [
    ("dni", r"^\d{10}$", "La cédula debe tener 10 dígitos. Inténtalo nuevamente."),
    ("phone", r"^\+?\d{8,13}$", "El número de teléfono no es válido. Escribe solo dígitos (8 a 13)."),
    ("date", r"^\d{2}-\d{2}-\d{4}$", "La fecha debe tener el formato DD-MM-AAAA."),
    (
        "email_or_none",
        r"(?i)^([^@\s]+@[^@\s]+\.[^@\s]+|ninguno|ninguna|no|no tengo|n/a|na)$",
        "Escribe un correo válido o «ninguno».",
    ),
    ("full_name", r"^[\p{L}'.\-]+(\s+[\p{L}'.\-]+)+$", "Escribe tu nombre y apellido."),
    ("non_empty", r"\S", "Por favor, escribe una respuesta."),
];

/// 从 JSON 文本加载节点图
///
/// `default_start` 为未声明 start（或声明的 start 不存在）时尝试的惯用起始节点 ID。
pub fn load(source: &str, default_start: &str) -> Result<NodeGraph, FlowError> {
    let cleaned = strip_comments(source);
    if cleaned.trim().is_empty() {
        return Err(FlowError::ConfigError("flow source is empty".to_string()));
    }
    let root: Value = serde_json::from_str(&cleaned)
        .map_err(|e| FlowError::ConfigError(format!("flow source is not valid JSON: {}", e)))?;
    let Value::Object(root) = root else {
        return Err(FlowError::ConfigError("flow root must be a JSON object".to_string()));
    };

    let mut validations = builtin_validations();
    if let Some(Value::Object(rules)) = root.get("validations") {
        for (name, rule) in rules {
            if let Some(rule) = compile_rule(name, rule) {
                validations.insert(name.clone(), rule);
            }
        }
    }

    let mut nodes = match root.get("nodes") {
        Some(Value::Object(map)) => parse_node_map(map),
        Some(Value::Array(items)) => parse_node_list(items),
        Some(_) => {
            return Err(FlowError::ConfigError("`nodes` must be an object or an array".to_string()));
        }
        None => parse_node_map(&root),
    };

    for node in &mut nodes {
        if let Some((name, rule)) = node.inline_rule.take() {
            validations.insert(name, rule);
        }
    }

    let mut nodes: Vec<Node> = nodes.into_iter().map(|p| p.node).collect();
    if nodes.is_empty() {
        return Err(FlowError::ConfigError("flow defines no nodes".to_string()));
    }

    if let Some(Value::Array(edges)) = root.get("edges") {
        apply_edges(&mut nodes, edges);
    }

    let declared = root.get("start").and_then(Value::as_str).map(str::trim);
    let start = pick_start(&nodes, declared, default_start);

    let graph = NodeGraph::from_parts(start, nodes, validations, false);
    tracing::info!(nodes = graph.len(), start = graph.start(), "Flow graph loaded");
    for (from, to) in graph.dangling_targets() {
        tracing::warn!(from = %from, to = %to, "Flow transition targets a missing node, start will be used");
    }
    Ok(graph)
}

/// 从文件加载节点图
pub fn load_path(path: impl AsRef<Path>, default_start: &str) -> Result<NodeGraph, FlowError> {
    let path = path.as_ref();
    let source = std::fs::read_to_string(path)
        .map_err(|e| FlowError::ConfigError(format!("cannot read {}: {}", path.display(), e)))?;
    load(&source, default_start)
}

/// 从文件加载节点图，失败时记录错误并返回安全图
pub fn load_or_safety(path: impl AsRef<Path>, default_start: &str) -> NodeGraph {
    let path = path.as_ref();
    match load_path(path, default_start) {
        Ok(graph) => graph,
        Err(e) => {
            tracing::error!(path = %path.display(), error = %e, "Flow graph failed to load, running in degraded mode");
            safety_graph()
        }
    }
}

/// 安全图：单个起始节点，告知服务处于降级状态
pub fn safety_graph() -> NodeGraph {
    let mut node = Node::new(SAFETY_NODE_ID, NodeKind::Message);
    node.prompt = vec![SAFETY_PROMPT.to_string()];
    node.hide_navigation = true;
    NodeGraph::from_parts(SAFETY_NODE_ID.to_string(), vec![node], builtin_validations(), true)
}

fn builtin_validations() -> HashMap<String, ValidationRule> {
    BUILTIN_VALIDATIONS
        .iter()
        .filter_map(|(name, pattern, error)| {
            ValidationRule::new(pattern, *error).ok().map(|rule| (name.to_string(), rule))
        })
        .collect()
}

fn compile_rule(name: &str, rule: &Value) -> Option<ValidationRule> {
    let pattern = rule
        .get("regex")
        .or_else(|| rule.get("pattern"))
        .and_then(Value::as_str)?;
    let error = rule
        .get("error")
        .or_else(|| rule.get("message"))
        .and_then(Value::as_str)
        .unwrap_or("⚠️ Respuesta no válida, inténtalo nuevamente.");
    match ValidationRule::new(pattern, error) {
        Ok(rule) => Some(rule),
        Err(e) => {
            tracing::warn!(rule = name, error = %e, "Invalid validation regex ignored");
            None
        }
    }
}

/// 解析中的节点（内联校验规则单独带出，最后并入图级规则表）
struct ParsedNode {
    node: Node,
    inline_rule: Option<(String, ValidationRule)>,
}

fn parse_node_map(map: &Map<String, Value>) -> Vec<ParsedNode> {
    map.iter()
        .filter(|(id, _)| !RESERVED_KEYS.contains(&id.as_str()) && !id.starts_with('_'))
        .filter_map(|(id, raw)| match raw {
            Value::Object(obj) => Some(parse_node(id.trim(), obj)),
            _ => None,
        })
        .collect()
}

fn parse_node_list(items: &[Value]) -> Vec<ParsedNode> {
    items
        .iter()
        .filter_map(|raw| {
            let obj = raw.as_object()?;
            let id = obj.get("id").and_then(Value::as_str).map(str::trim)?;
            if id.is_empty() {
                tracing::warn!("Flow node without id skipped");
                return None;
            }
            Some(parse_node(id, obj))
        })
        .collect()
}

fn parse_node(id: &str, obj: &Map<String, Value>) -> ParsedNode {
    let prompt = ["prompt", "text", "reply"]
        .iter()
        .find_map(|k| obj.get(*k))
        .map(parse_lines)
        .unwrap_or_default();

    let options = ["options", "routes"]
        .iter()
        .find_map(|k| obj.get(*k))
        .map(|raw| parse_options(id, raw))
        .unwrap_or_default();

    let dynamic_options = obj.get("dynamic_options").and_then(|raw| {
        let source = raw.get("source").and_then(Value::as_str)?;
        Some(DynamicOptions {
            source: source.to_string(),
            next: str_field(raw, &["next", "target"]),
            save_as: str_field(raw, &["save_as"]),
        })
    });

    let mut inline_rule = None;
    let validation = match obj.get("validation") {
        Some(Value::String(name)) => Some(name.trim().to_string()),
        Some(rule @ Value::Object(_)) => {
            let name = format!("@{}", id);
            match compile_rule(&name, rule) {
                Some(compiled) => {
                    inline_rule = Some((name.clone(), compiled));
                    Some(name)
                }
                None => None,
            }
        }
        _ => None,
    };

    let save_as = obj.get("save_as").and_then(Value::as_str).map(str::to_string);

    let kind = obj
        .get("type")
        .and_then(Value::as_str)
        .and_then(|raw| {
            let parsed = NodeKind::parse(raw);
            if parsed.is_none() {
                tracing::warn!(node = id, kind = raw, "Unknown node type, inferring from fields");
            }
            parsed
        })
        .unwrap_or_else(|| {
            if validation.is_some() || save_as.is_some() {
                NodeKind::Input
            } else if !options.is_empty() || dynamic_options.is_some() {
                NodeKind::Choice
            } else {
                NodeKind::Message
            }
        });

    let node = Node {
        id: id.to_string(),
        kind,
        prompt,
        options,
        dynamic_options,
        validation,
        save_as,
        on_enter: obj.get("on_enter").map(parse_hooks).unwrap_or_default(),
        hooks: obj.get("hooks").map(parse_hooks).unwrap_or_default(),
        next: obj
            .get("next")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string),
        hide_navigation: obj
            .get("hide_navigation")
            .and_then(Value::as_bool)
            .unwrap_or(false),
    };
    ParsedNode { node, inline_rule }
}

fn parse_lines(raw: &Value) -> Vec<String> {
    match raw {
        Value::String(s) => vec![s.clone()],
        Value::Array(items) => items
            .iter()
            .map(|item| match item {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            })
            .collect(),
        Value::Null => Vec::new(),
        other => vec![other.to_string()],
    }
}

fn str_field(raw: &Value, keys: &[&str]) -> Option<String> {
    keys.iter()
        .find_map(|k| raw.get(*k))
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// 选项：`[{key, next, ...}]` 或 `{key: next}` / `{key: {next, ...}}`
fn parse_options(node_id: &str, raw: &Value) -> Vec<NodeOption> {
    let mut parsed: Vec<NodeOption> = Vec::new();
    let mut push = |option: NodeOption| {
        if option.key.is_empty() {
            tracing::warn!(node = node_id, "Option without key skipped");
        } else if parsed.iter().any(|o| o.key == option.key) {
            tracing::warn!(node = node_id, key = %option.key, "Duplicate option key ignored");
        } else {
            parsed.push(option);
        }
    };

    match raw {
        Value::Array(items) => {
            for item in items {
                let key = match item.get("key") {
                    Some(Value::String(s)) => s.trim().to_string(),
                    Some(Value::Number(n)) => n.to_string(),
                    _ => String::new(),
                };
                push(parse_option_body(key, item));
            }
        }
        Value::Object(map) => {
            for (key, body) in map {
                let key = key.trim().to_string();
                match body {
                    Value::String(next) => {
                        let next = Some(next.trim().to_string()).filter(|s| !s.is_empty());
                        push(NodeOption::new(key, next));
                    }
                    Value::Object(_) => push(parse_option_body(key, body)),
                    _ => push(NodeOption::new(key, None)),
                }
            }
        }
        _ => tracing::warn!(node = node_id, "Options must be a list or a map"),
    }
    parsed
}

fn parse_option_body(key: String, body: &Value) -> NodeOption {
    let mut option = NodeOption::new(key, str_field(body, &["next", "target"]));
    option.label = body.get("label").and_then(Value::as_str).map(str::to_string);
    option.hooks = ["hooks", "on_select"]
        .iter()
        .find_map(|k| body.get(*k))
        .map(parse_hooks)
        .unwrap_or_default();
    if let Some(Value::Object(save)) = body.get("save") {
        option.save = save.clone();
    }
    option
}

/// Hook 列表：单个记录或记录数组；记录可以是名字字符串或 `{hook, args, save_as, if_true_next, if_false_next}`
fn parse_hooks(raw: &Value) -> Vec<HookCall> {
    match raw {
        Value::Array(items) => items.iter().filter_map(parse_hook).collect(),
        other => parse_hook(other).into_iter().collect(),
    }
}

fn parse_hook(raw: &Value) -> Option<HookCall> {
    match raw {
        Value::String(name) if !name.trim().is_empty() => Some(HookCall::new(name.trim())),
        Value::Object(_) => {
            let name = str_field(raw, &["hook", "name", "call"])?;
            let args = match raw.get("args") {
                Some(Value::Array(items)) => items.clone(),
                Some(Value::Null) | None => Vec::new(),
                Some(single) => vec![single.clone()],
            };
            Some(HookCall {
                hook: name,
                args,
                save_as: str_field(raw, &["save_as"]),
                if_true_next: str_field(raw, &["if_true_next"]),
                if_false_next: str_field(raw, &["if_false_next"]),
            })
        }
        _ => {
            tracing::warn!(raw = %raw, "Unrecognised hook record skipped");
            None
        }
    }
}

/// 信封中的边：有 key 的变成源节点选项，没有 key 的作为源节点默认 next
fn apply_edges(nodes: &mut [Node], edges: &[Value]) {
    for edge in edges {
        let (Some(source), Some(target)) = (
            str_field(edge, &["source", "from"]),
            str_field(edge, &["target", "to"]),
        ) else {
            tracing::warn!(edge = %edge, "Edge without source/target skipped");
            continue;
        };
        let Some(node) = nodes.iter_mut().find(|n| n.id == source) else {
            tracing::warn!(source = %source, "Edge from unknown node skipped");
            continue;
        };
        let key = match edge.get("key") {
            Some(Value::String(s)) if !s.trim().is_empty() => Some(s.trim().to_string()),
            Some(Value::Number(n)) => Some(n.to_string()),
            _ => None,
        };
        match key {
            Some(key) if node.option(&key).is_none() => {
                let mut option = NodeOption::new(key, Some(target));
                option.label = edge.get("label").and_then(Value::as_str).map(str::to_string);
                node.options.push(option);
                if node.kind == NodeKind::Message {
                    node.kind = NodeKind::Choice;
                }
            }
            Some(key) => {
                tracing::warn!(node = %source, key = %key, "Edge duplicates an existing option key, ignored");
            }
            None => {
                if node.next.is_none() {
                    node.next = Some(target);
                }
            }
        }
    }
}

fn pick_start(nodes: &[Node], declared: Option<&str>, default_start: &str) -> String {
    let exists = |id: &str| nodes.iter().any(|n| n.id == id);
    if let Some(declared) = declared.filter(|d| !d.is_empty()) {
        if exists(declared) {
            return declared.to_string();
        }
        tracing::warn!(start = declared, "Declared start node does not exist");
    }
    if exists(default_start) {
        return default_start.to_string();
    }
    // 调用方已保证 nodes 非空
    nodes.first().map(|n| n.id.clone()).unwrap_or_default()
}

/// 去掉字符串字面量之外的 `//` 行注释与 `/* */` 块注释
pub fn strip_comments(source: &str) -> String {
    let mut out = String::with_capacity(source.len());
    let mut chars = source.chars().peekable();
    let mut in_string = false;
    let mut escaped = false;

    while let Some(c) = chars.next() {
        if in_string {
            out.push(c);
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }
        match (c, chars.peek()) {
            ('"', _) => {
                in_string = true;
                out.push(c);
            }
            ('/', Some('/')) => {
                for next in chars.by_ref() {
                    if next == '\n' {
                        out.push('\n');
                        break;
                    }
                }
            }
            ('/', Some('*')) => {
                chars.next();
                let mut prev = '\0';
                for next in chars.by_ref() {
                    if prev == '*' && next == '/' {
                        break;
                    }
                    prev = next;
                }
                out.push(' ');
            }
            _ => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strip_comments_outside_strings() {
        let src = r#"{
            // comentario
            "url": "https://example.com/path", /* bloque */
            "text": "a // b /* c */"
        }"#;
        let value: Value = serde_json::from_str(&strip_comments(src)).unwrap();
        assert_eq!(value["url"], "https://example.com/path");
        assert_eq!(value["text"], "a // b /* c */");
    }

    #[test]
    fn test_empty_and_invalid_sources_are_config_errors() {
        assert!(matches!(load("", "menu_principal"), Err(FlowError::ConfigError(_))));
        assert!(matches!(load("// solo comentario", "menu_principal"), Err(FlowError::ConfigError(_))));
        assert!(matches!(load("{ not json", "menu_principal"), Err(FlowError::ConfigError(_))));
        assert!(matches!(load("[]", "menu_principal"), Err(FlowError::ConfigError(_))));
        assert!(matches!(load("{}", "menu_principal"), Err(FlowError::ConfigError(_))));
    }

    #[test]
    fn test_flat_map_with_route_map_and_reply_alias() {
        let src = r#"{
            "menu_principal": {"reply": ["Hola", "Elige"], "routes": {"1": "info", "2": {"next": "agenda", "label": "Agendar"}}},
            "info": {"reply": "Información"},
            "agenda": {"type": "input", "prompt": "Tu cédula", "validation": "dni", "save_as": "agenda.dni"}
        }"#;
        let graph = load(src, "menu_principal").unwrap();
        assert_eq!(graph.start(), "menu_principal");
        let menu = graph.get("menu_principal").unwrap();
        assert_eq!(menu.kind, NodeKind::Choice);
        assert_eq!(menu.prompt, vec!["Hola", "Elige"]);
        assert_eq!(menu.option("1").unwrap().next.as_deref(), Some("info"));
        assert_eq!(menu.option("2").unwrap().label.as_deref(), Some("Agendar"));
        assert_eq!(graph.get("info").unwrap().kind, NodeKind::Message);
        assert_eq!(graph.get("agenda").unwrap().kind, NodeKind::Input);
        assert!(graph.validation("dni").unwrap().matches("0912345678"));
    }

    #[test]
    fn test_start_resolution_order() {
        let declared = r#"{"start": "B", "nodes": {"A": {"text": "a"}, "B": {"text": "b"}}}"#;
        assert_eq!(load(declared, "menu_principal").unwrap().start(), "B");

        let conventional = r#"{"A": {"text": "a"}, "menu_principal": {"text": "m"}}"#;
        assert_eq!(load(conventional, "menu_principal").unwrap().start(), "menu_principal");

        let first = r#"{"start": "missing", "nodes": [{"id": "Z", "text": "z"}, {"id": "A", "text": "a"}]}"#;
        assert_eq!(load(first, "menu_principal").unwrap().start(), "Z");
    }

    #[test]
    fn test_hooks_and_inline_validation() {
        let src = r#"{
            "ASK": {
                "prompt": "Teléfono",
                "validation": {"regex": "^\\d{8,12}$", "error": "Número inválido"},
                "save_as": "phone",
                "on_enter": "dates.today",
                "hooks": [{"hook": "patient.lookup", "args": ["@input"], "save_as": "agenda.found",
                           "if_true_next": "KNOWN", "if_false_next": "NEW"}],
                "next": "KNOWN"
            },
            "KNOWN": {"text": "ok"},
            "NEW": {"text": "nuevo"}
        }"#;
        let graph = load(src, "menu_principal").unwrap();
        let ask = graph.get("ASK").unwrap();
        assert_eq!(ask.validation.as_deref(), Some("@ASK"));
        let rule = graph.validation("@ASK").unwrap();
        assert!(rule.matches("0991234567"));
        assert!(!rule.matches("abc"));
        assert_eq!(rule.error, "Número inválido");
        assert_eq!(ask.on_enter, vec![HookCall::new("dates.today")]);
        assert_eq!(ask.hooks[0].args, vec![Value::String("@input".into())]);
        assert_eq!(ask.hooks[0].if_false_next.as_deref(), Some("NEW"));
    }

    #[test]
    fn test_edges_become_options_and_next() {
        let src = r#"{
            "start": "MENU",
            "nodes": [{"id": "MENU", "text": "m"}, {"id": "INFO", "text": "i"}, {"id": "END", "text": "e"}],
            "edges": [
                {"source": "MENU", "target": "INFO", "key": "1", "label": "Info"},
                {"source": "INFO", "target": "END"}
            ]
        }"#;
        let graph = load(src, "menu_principal").unwrap();
        let menu = graph.get("MENU").unwrap();
        assert_eq!(menu.kind, NodeKind::Choice);
        assert_eq!(menu.option("1").unwrap().next.as_deref(), Some("INFO"));
        assert_eq!(graph.get("INFO").unwrap().next.as_deref(), Some("END"));
    }

    #[test]
    fn test_dangling_targets_do_not_fail_load() {
        let src = r#"{"MENU": {"options": {"1": "NOWHERE"}}}"#;
        let graph = load(src, "menu_principal").unwrap();
        assert_eq!(graph.dangling_targets().len(), 1);
    }

    #[test]
    fn test_load_or_safety_on_missing_file() {
        let graph = load_or_safety("/nonexistent/flow.json", "menu_principal");
        assert!(graph.is_degraded());
        assert_eq!(graph.start(), SAFETY_NODE_ID);
        assert_eq!(graph.len(), 1);
    }
}
