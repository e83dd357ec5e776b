//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `ANABOT__*` 覆盖（双下划线表示嵌套，如 `ANABOT__FLOW__PATH=flow.json`）。
//! 平台密钥另外兼容部署平台上的惯用变量名（`WHATSAPP_TOKEN`、`TELEGRAM_BOT_TOKEN` 等），见 [`AppConfig::apply_env_fallbacks`]。

use std::path::PathBuf;

use serde::Deserialize;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub app: AppSection,
    pub flow: FlowSection,
    pub session: SessionSection,
    pub inactivity: InactivitySection,
    pub scheduling: SchedulingSection,
    pub whatsapp: WhatsappSection,
    pub telegram: TelegramSection,
}

/// [app] 段：服务名、监听地址、诊所数据库
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppSection {
    pub name: String,
    pub bind: String,
    /// 患者 / 预约 / 消息日志所在的 SQLite 文件；未设置时诊所 Hook 使用内存库
    pub database_path: Option<PathBuf>,
}

impl Default for AppSection {
    fn default() -> Self {
        Self {
            name: "anabot".to_string(),
            bind: "0.0.0.0:8080".to_string(),
            database_path: None,
        }
    }
}

/// [flow] 段：节点图路径、全局快捷键、固定文案
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FlowSection {
    pub path: PathBuf,
    /// 节点图未声明 start 时使用的惯用起始节点 ID
    pub default_start: String,
    pub home_codes: Vec<String>,
    pub back_codes: Vec<String>,
    pub handoff_codes: Vec<String>,
    /// 人工转接节点（存在于图中时跳转过去）
    pub handoff_node: Option<String>,
    /// 人工转接 Hook（已注册时调用）
    pub handoff_hook: Option<String>,
    pub handoff_message: String,
    pub footer: String,
    pub invalid_option_message: String,
    pub invalid_input_message: String,
    pub fallback_message: String,
    /// 新会话首条回复前加上分时段问候
    pub greet_new_sessions: bool,
    pub max_history: usize,
}

impl Default for FlowSection {
    fn default() -> Self {
        Self {
            path: PathBuf::from("config/flow.json"),
            default_start: "menu_principal".to_string(),
            home_codes: vec!["9".into(), "inicio".into(), "menu".into()],
            back_codes: vec!["0".into(), "atras".into(), "volver".into()],
            handoff_codes: vec!["humano".into(), "asesor".into()],
            handoff_node: Some("contacto_humano".to_string()),
            handoff_hook: Some("handoff.to_human".to_string()),
            handoff_message: "Te conecto con un asesor humano y compartiré tu mensaje.".to_string(),
            footer: "0️⃣ Atrás · 9️⃣ Inicio".to_string(),
            invalid_option_message: "⚠️ Opción no válida. Elige una de las opciones disponibles.".to_string(),
            invalid_input_message: "⚠️ No pude validar tu respuesta, inténtalo nuevamente.".to_string(),
            fallback_message: "Tuvimos un inconveniente procesando tu mensaje. Por favor, inténtalo de nuevo.".to_string(),
            greet_new_sessions: true,
            max_history: 50,
        }
    }
}

/// [session] 段：会话持久化
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct SessionSection {
    /// 会话 SQLite 文件；未设置时使用内存存储（重启即丢失）
    pub db_path: Option<PathBuf>,
}

/// [inactivity] 段：不活跃提醒与关闭
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct InactivitySection {
    pub enabled: bool,
    pub check_interval_secs: u64,
    pub nudge_after_minutes: i64,
    pub close_after_minutes: i64,
    pub nudge_message: String,
    pub farewell_message: String,
}

impl Default for InactivitySection {
    fn default() -> Self {
        Self {
            enabled: true,
            check_interval_secs: 60,
            nudge_after_minutes: 10,
            close_after_minutes: 20,
            nudge_message: "¿Sigues ahí? 🙂 Escribe tu respuesta para continuar o 9️⃣ para volver al inicio.".to_string(),
            farewell_message: "Cerramos la conversación por inactividad. Cuando quieras, escríbeme y empezamos de nuevo 👋".to_string(),
        }
    }
}

/// [scheduling] 段：时段规则
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SchedulingSection {
    pub slot_duration_minutes: i64,
    pub gap_after_slot_minutes: i64,
    /// 诊所所在时区相对 UTC 的偏移（小时），瓜亚基尔为 -5 且无夏令时
    pub utc_offset_hours: i32,
}

impl Default for SchedulingSection {
    fn default() -> Self {
        Self {
            slot_duration_minutes: 45,
            gap_after_slot_minutes: 15,
            utc_offset_hours: -5,
        }
    }
}

/// [whatsapp] 段：Meta Cloud API
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WhatsappSection {
    pub access_token: Option<String>,
    pub phone_number_id: Option<String>,
    pub verify_token: Option<String>,
    pub api_base: String,
}

impl Default for WhatsappSection {
    fn default() -> Self {
        Self {
            access_token: None,
            phone_number_id: None,
            verify_token: None,
            api_base: "https://graph.facebook.com/v20.0".to_string(),
        }
    }
}

/// [telegram] 段：Bot API
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TelegramSection {
    pub bot_token: Option<String>,
    /// Webhook 注册时设置的 secret_token，请求头不匹配则拒绝
    pub webhook_secret: Option<String>,
    pub api_base: String,
}

impl Default for TelegramSection {
    fn default() -> Self {
        Self {
            bot_token: None,
            webhook_secret: None,
            api_base: "https://api.telegram.org".to_string(),
        }
    }
}

impl WhatsappSection {
    pub fn is_configured(&self) -> bool {
        self.access_token.is_some() && self.phone_number_id.is_some()
    }
}

impl TelegramSection {
    pub fn is_configured(&self) -> bool {
        self.bot_token.is_some()
    }
}

impl AppConfig {
    /// 用惯用环境变量补齐未配置的项（只补空缺，不覆盖 TOML / ANABOT__* 已给出的值）
    pub fn apply_env_fallbacks(&mut self) {
        self.apply_fallbacks_from(|name| std::env::var(name).ok());
    }

    fn apply_fallbacks_from(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        fill(&mut self.whatsapp.access_token, get("WHATSAPP_TOKEN"));
        fill(&mut self.whatsapp.phone_number_id, get("WHATSAPP_PHONE_NUMBER_ID"));
        fill(&mut self.whatsapp.verify_token, get("WHATSAPP_VERIFY_TOKEN"));
        fill(
            &mut self.telegram.bot_token,
            get("TELEGRAM_BOT_TOKEN").or_else(|| get("TELEGRAM_TOKEN")),
        );
        fill(&mut self.telegram.webhook_secret, get("TELEGRAM_WEBHOOK_SECRET"));
        fill(&mut self.app.database_path, get("DATABASE_PATH").map(PathBuf::from));
        if let Some(path) = get("FLOW_JSON_PATH").filter(|_| self.flow.path == FlowSection::default().path) {
            self.flow.path = PathBuf::from(path);
        }
    }
}

fn fill<T>(slot: &mut Option<T>, value: Option<T>) {
    if slot.is_none() {
        *slot = value;
    }
}

/// 从 config 目录加载配置，环境变量 ANABOT__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 叠加环境变量 ANABOT__*（双下划线表示嵌套键）
/// 4. 最后用惯用环境变量补齐平台密钥
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("ANABOT")
            .separator("__")
            .list_separator(",")
            .with_list_parse_key("flow.home_codes")
            .with_list_parse_key("flow.back_codes")
            .with_list_parse_key("flow.handoff_codes")
            .try_parsing(true),
    );

    let c = builder.build()?;
    let mut cfg: AppConfig = c.try_deserialize()?;
    cfg.apply_env_fallbacks();
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults_match_clinic_rules() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.scheduling.slot_duration_minutes, 45);
        assert_eq!(cfg.scheduling.gap_after_slot_minutes, 15);
        assert_eq!(cfg.flow.default_start, "menu_principal");
        assert!(cfg.flow.home_codes.contains(&"9".to_string()));
        assert!(cfg.flow.back_codes.contains(&"0".to_string()));
        assert!(!cfg.whatsapp.is_configured());
    }

    #[test]
    fn test_fallbacks_fill_only_missing_values() {
        let mut cfg = AppConfig::default();
        cfg.telegram.bot_token = Some("from-toml".into());

        let env: HashMap<&str, &str> = [
            ("WHATSAPP_TOKEN", "wa-token"),
            ("WHATSAPP_PHONE_NUMBER_ID", "12345"),
            ("TELEGRAM_BOT_TOKEN", "from-env"),
            ("FLOW_JSON_PATH", "/srv/flow.json"),
            ("DATABASE_PATH", "  "),
        ]
        .into_iter()
        .collect();
        cfg.apply_fallbacks_from(|name| env.get(name).map(|v| v.to_string()));

        assert_eq!(cfg.whatsapp.access_token.as_deref(), Some("wa-token"));
        assert!(cfg.whatsapp.is_configured());
        assert_eq!(cfg.telegram.bot_token.as_deref(), Some("from-toml"));
        assert_eq!(cfg.flow.path, PathBuf::from("/srv/flow.json"));
        assert!(cfg.app.database_path.is_none());
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let c = config::Config::builder()
            .add_source(config::File::from_str(
                "[flow]\npath = \"custom.json\"\n[scheduling]\nslot_duration_minutes = 30\n",
                config::FileFormat::Toml,
            ))
            .build()
            .unwrap();
        let cfg: AppConfig = c.try_deserialize().unwrap();
        assert_eq!(cfg.flow.path, PathBuf::from("custom.json"));
        assert_eq!(cfg.flow.max_history, 50);
        assert_eq!(cfg.scheduling.slot_duration_minutes, 30);
        assert_eq!(cfg.scheduling.gap_after_slot_minutes, 15);
    }
}
