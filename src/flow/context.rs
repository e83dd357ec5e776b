//! 会话上下文：点分路径读写与 Hook 参数解析

use serde_json::{Map, Value};

/// 会话上下文（任意嵌套的 key -> value）
pub type Context = Map<String, Value>;

/// 读取点分路径，如 `agenda.patient.dni`；数组段可用下标（`agenda.slots.0`）
pub fn get_path<'a>(ctx: &'a Context, path: &str) -> Option<&'a Value> {
    let mut parts = path.split('.').filter(|p| !p.is_empty());
    let first = parts.next()?;
    let mut current = ctx.get(first)?;
    for part in parts {
        current = match current {
            Value::Object(map) => map.get(part)?,
            Value::Array(items) => items.get(part.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

/// 写入点分路径；中间段不存在或不是对象时替换为空对象
pub fn set_path(ctx: &mut Context, path: &str, value: Value) {
    let parts: Vec<&str> = path.split('.').filter(|p| !p.is_empty()).collect();
    let Some((last, parents)) = parts.split_last() else {
        return;
    };
    let mut current = ctx;
    for part in parents {
        let entry = current
            .entry(part.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        if !entry.is_object() {
            *entry = Value::Object(Map::new());
        }
        current = match entry {
            Value::Object(map) => map,
            _ => unreachable!("entry was just replaced with an object"),
        };
    }
    current.insert(last.to_string(), value);
}

/// 删除点分路径，返回被删除的值
pub fn remove_path(ctx: &mut Context, path: &str) -> Option<Value> {
    let parts: Vec<&str> = path.split('.').filter(|p| !p.is_empty()).collect();
    let (last, parents) = parts.split_last()?;
    let mut current = ctx;
    for part in parents {
        current = current.get_mut(*part)?.as_object_mut()?;
    }
    current.remove(*last)
}

/// 取对象的子表（不存在则创建），Hook 常用来写 `agenda` / `appointments` 等分组
pub fn section<'a>(ctx: &'a mut Context, key: &str) -> &'a mut Context {
    let entry = ctx
        .entry(key.to_string())
        .or_insert_with(|| Value::Object(Map::new()));
    if !entry.is_object() {
        *entry = Value::Object(Map::new());
    }
    match entry {
        Value::Object(map) => map,
        _ => unreachable!("entry was just replaced with an object"),
    }
}

/// 解析 Hook 参数 / save 值：`"@input"` -> 原始输入，`"@context.a.b"`（或 `@ctx.a.b`）-> 上下文值（缺失为 Null），其它原样
pub fn resolve_arg(arg: &Value, ctx: &Context, input: &str) -> Value {
    let Value::String(s) = arg else {
        return arg.clone();
    };
    if s == "@input" {
        return Value::String(input.to_string());
    }
    let path = s
        .strip_prefix("@context.")
        .or_else(|| s.strip_prefix("@ctx."));
    match path {
        Some(path) => get_path(ctx, path).cloned().unwrap_or(Value::Null),
        None => arg.clone(),
    }
}

/// 值的展示文本：字符串原样，Null 为空，其它为 JSON 文本
pub fn display_value(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Hook 参数取字符串（非字符串值转为展示文本）
pub fn arg_str(args: &[Value], index: usize) -> String {
    args.get(index).map(display_value).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx(value: Value) -> Context {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_get_nested_and_indexed() {
        let c = ctx(json!({"agenda": {"slots": [{"label": "a"}, {"label": "b"}]}}));
        assert_eq!(get_path(&c, "agenda.slots.1.label"), Some(&json!("b")));
        assert_eq!(get_path(&c, "agenda.missing"), None);
        assert_eq!(get_path(&c, "agenda.slots.x"), None);
    }

    #[test]
    fn test_set_creates_and_replaces_intermediates() {
        let mut c = ctx(json!({"agenda": "stale"}));
        set_path(&mut c, "agenda.patient.dni", json!("0912345678"));
        assert_eq!(c, ctx(json!({"agenda": {"patient": {"dni": "0912345678"}}})));

        set_path(&mut c, "phone", json!("0991234567"));
        assert_eq!(get_path(&c, "phone"), Some(&json!("0991234567")));
    }

    #[test]
    fn test_remove_path() {
        let mut c = ctx(json!({"agenda": {"slots": [1], "site": "GYE"}}));
        assert_eq!(remove_path(&mut c, "agenda.slots"), Some(json!([1])));
        assert_eq!(c, ctx(json!({"agenda": {"site": "GYE"}})));
        assert_eq!(remove_path(&mut c, "nope.deeper"), None);
    }

    #[test]
    fn test_resolve_arg_variants() {
        let c = ctx(json!({"meta": {"channel": "wa"}}));
        assert_eq!(resolve_arg(&json!("@input"), &c, "hola"), json!("hola"));
        assert_eq!(resolve_arg(&json!("@context.meta.channel"), &c, ""), json!("wa"));
        assert_eq!(resolve_arg(&json!("@ctx.meta.channel"), &c, ""), json!("wa"));
        assert_eq!(resolve_arg(&json!("@context.meta.user"), &c, ""), Value::Null);
        assert_eq!(resolve_arg(&json!("GYE"), &c, ""), json!("GYE"));
        assert_eq!(resolve_arg(&json!(3), &c, ""), json!(3));
    }

    #[test]
    fn test_arg_str() {
        let args = vec![json!("GYE"), json!(42), Value::Null];
        assert_eq!(arg_str(&args, 0), "GYE");
        assert_eq!(arg_str(&args, 1), "42");
        assert_eq!(arg_str(&args, 2), "");
        assert_eq!(arg_str(&args, 5), "");
    }
}
