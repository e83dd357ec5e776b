//! 回复渲染：占位符替换、选项列表、导航页脚

use std::sync::OnceLock;

use regex::{Captures, Regex};

use super::context::{display_value, get_path, Context};

fn placeholder_re() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\{\{\s*([A-Za-z0-9_.\-]+)\s*\}\}").ok())
        .as_ref()
}

/// 把 `{{path}}` 替换为上下文中的值；缺失的路径替换为空字符串
pub fn substitute(template: &str, ctx: &Context) -> String {
    let Some(re) = placeholder_re() else {
        return template.to_string();
    };
    re.replace_all(template, |caps: &Captures| {
        get_path(ctx, &caps[1]).map(display_value).unwrap_or_default()
    })
    .into_owned()
}

/// 一条渲染好的选项
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedOption {
    pub key: String,
    pub label: String,
}

/// 组装最终回复文本
///
/// 提示行逐行替换占位符；有标签的选项以 `key. label` 列出；`footer` 为 None 时不追加导航页脚。
pub fn compose(prompt: &[String], options: &[RenderedOption], footer: Option<&str>, ctx: &Context) -> String {
    let mut blocks: Vec<String> = Vec::new();

    let body = prompt
        .iter()
        .map(|line| substitute(line, ctx))
        .collect::<Vec<_>>()
        .join("\n");
    if !body.trim().is_empty() {
        blocks.push(body);
    }

    let listed: Vec<String> = options
        .iter()
        .filter(|o| !o.label.is_empty())
        .map(|o| format!("{}. {}", o.key, substitute(&o.label, ctx)))
        .collect();
    if !listed.is_empty() {
        blocks.push(listed.join("\n"));
    }

    if let Some(footer) = footer.filter(|f| !f.is_empty()) {
        blocks.push(footer.to_string());
    }

    blocks.join("\n\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx() -> Context {
        json!({"agenda": {"slot_label": "20-10-2026 09:00", "count": 3}, "name": "Ana"})
            .as_object()
            .cloned()
            .unwrap()
    }

    #[test]
    fn test_substitute_paths() {
        let c = ctx();
        assert_eq!(substitute("Hola {{name}}", &c), "Hola Ana");
        assert_eq!(substitute("Cita: {{ agenda.slot_label }}", &c), "Cita: 20-10-2026 09:00");
        assert_eq!(substitute("{{agenda.count}} horarios", &c), "3 horarios");
        assert_eq!(substitute("[{{missing.path}}]", &c), "[]");
    }

    #[test]
    fn test_compose_lists_labelled_options_and_footer() {
        let prompt = vec!["¿Qué deseas hacer?".to_string()];
        let options = vec![
            RenderedOption { key: "1".into(), label: "Agendar".into() },
            RenderedOption { key: "2".into(), label: String::new() },
        ];
        let text = compose(&prompt, &options, Some("0️⃣ Atrás · 9️⃣ Inicio"), &ctx());
        assert_eq!(text, "¿Qué deseas hacer?\n\n1. Agendar\n\n0️⃣ Atrás · 9️⃣ Inicio");
    }

    #[test]
    fn test_compose_without_footer() {
        let prompt = vec!["Línea 1".to_string(), "Línea 2".to_string()];
        assert_eq!(compose(&prompt, &[], None, &ctx()), "Línea 1\nLínea 2");
    }
}
