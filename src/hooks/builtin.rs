//! 通用 Hook：日期、问候、红旗症状、上下文清理
//!
//! 不依赖数据库，控制台与测试中也可使用。

use chrono::{Duration, Timelike};
use serde_json::Value;

use super::HookRegistry;
use crate::clinic::schedule::{format_date, Clock};
use crate::flow::context::{arg_str, display_value, get_path, remove_path, section, Context};
use crate::flow::normalize::{contains_term, normalize};

/// 需要优先处理的症状关键词（神经病变 / 感染迹象）
pub const RED_FLAG_TERMS: [&str; 8] = [
    "quemazón",
    "hormigueo",
    "descargas eléctricas",
    "dolor",
    "frialdad",
    "calentura",
    "fiebre",
    "herida",
];

pub const GREETING_TERMS: [&str; 8] = [
    "hola",
    "holi",
    "buenas",
    "buenos dias",
    "buenas tardes",
    "buenas noches",
    "hey",
    "que tal",
];

/// 按本地小时返回问候语
pub fn daypart_greeting(hour: u32) -> &'static str {
    match hour {
        0..=11 => "¡Buenos días 🌞!",
        12..=17 => "¡Buenas tardes ☀️!",
        _ => "¡Buenas noches 🌙!",
    }
}

pub fn is_greeting(text: &str) -> bool {
    let normalized = normalize(text);
    GREETING_TERMS.iter().any(|term| contains_term(&normalized, term))
}

/// 路径存在且非空（null、false、空字符串、空数组、空对象都算空）
pub fn has_value(ctx: &Context, path: &str) -> bool {
    match get_path(ctx, path) {
        None | Some(Value::Null) | Some(Value::Bool(false)) => false,
        Some(Value::String(s)) => !s.trim().is_empty(),
        Some(Value::Array(items)) => !items.is_empty(),
        Some(Value::Object(map)) => !map.is_empty(),
        Some(_) => true,
    }
}

pub fn is_red_flag(text: &str) -> bool {
    let normalized = normalize(text);
    !normalized.is_empty() && RED_FLAG_TERMS.iter().any(|term| contains_term(&normalized, term))
}

/// 注册通用 Hook
pub fn register(registry: &mut HookRegistry, clock: Clock) {
    let c = clock.clone();
    registry.register_fn("dates.today", "Fecha local de hoy (dd-mm-YYYY)", move |_, _| {
        Ok(Value::String(format_date(c.today())))
    });

    let c = clock.clone();
    registry.register_fn("dates.tomorrow", "Fecha local de mañana (dd-mm-YYYY)", move |_, _| {
        Ok(Value::String(format_date(c.today() + Duration::days(1))))
    });

    let c = clock;
    registry.register_fn("greeting.daypart", "Saludo según la hora local", move |_, _| {
        Ok(Value::String(daypart_greeting(c.now().hour()).to_string()))
    });

    registry.register_fn("text.is_greeting", "¿El texto es un saludo?", |args, _| {
        Ok(Value::Bool(is_greeting(&arg_str(args, 0))))
    });

    registry.register_fn(
        "red_flag.detect",
        "Detecta síntomas de alerta y marca flags.red_flag",
        |args, ctx| {
            let found = is_red_flag(&arg_str(args, 0));
            if found {
                section(ctx, "flags").insert("red_flag".to_string(), Value::Bool(true));
            }
            Ok(Value::Bool(found))
        },
    );

    registry.register_fn("context.has", "¿La ruta del contexto tiene valor?", |args, ctx| {
        Ok(Value::Bool(has_value(ctx, &arg_str(args, 0))))
    });

    registry.register_fn(
        "context.equals",
        "Compara una ruta del contexto con un valor (sin distinguir mayúsculas ni tildes)",
        |args, ctx| {
            let current = get_path(ctx, &arg_str(args, 0)).map(display_value).unwrap_or_default();
            Ok(Value::Bool(normalize(&current) == normalize(&arg_str(args, 1))))
        },
    );

    registry.register_fn("context.clear", "Elimina rutas del contexto", |args, ctx| {
        for path in args.iter().filter_map(Value::as_str) {
            remove_path(ctx, path);
        }
        Ok(Value::Null)
    });
}
