//! 诊所领域：患者、预约、时段计算与数据库
//!
//! 引擎本身从不直接修改预约；只有诊所 Hook 通过 [`ClinicDb`] 读写，
//! 并把编号 / 确认文本写回会话上下文。

pub mod repository;
pub mod schedule;

use serde::{Deserialize, Serialize};

pub use repository::ClinicDb;
pub use schedule::{Clock, SlotRules};

/// 就诊地点
pub const SITE_GUAYAQUIL: &str = "GYE";
pub const SITE_MILAGRO: &str = "MIL";

/// 地点代码 -> 展示名；未知代码原样返回
pub fn site_label(code: &str) -> String {
    match code.trim().to_ascii_uppercase().as_str() {
        SITE_GUAYAQUIL => "Guayaquil".to_string(),
        SITE_MILAGRO => "Milagro".to_string(),
        _ => code.to_string(),
    }
}

/// 预约状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AppointmentStatus {
    Pending,
    Scheduled,
    Confirmed,
    Cancelled,
}

impl AppointmentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AppointmentStatus::Pending => "PENDING",
            AppointmentStatus::Scheduled => "SCHEDULED",
            AppointmentStatus::Confirmed => "CONFIRMED",
            AppointmentStatus::Cancelled => "CANCELLED",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_uppercase().as_str() {
            "PENDING" => Some(AppointmentStatus::Pending),
            "SCHEDULED" => Some(AppointmentStatus::Scheduled),
            "CONFIRMED" => Some(AppointmentStatus::Confirmed),
            "CANCELLED" | "CANCELED" => Some(AppointmentStatus::Cancelled),
            _ => None,
        }
    }

    /// 是否占用时段（冲突检查与「即将到来」列表只看这些状态）
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            AppointmentStatus::Pending | AppointmentStatus::Scheduled | AppointmentStatus::Confirmed
        )
    }
}

/// 患者档案
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Patient {
    pub dni: String,
    pub full_name: String,
    pub birth_date: Option<String>,
    pub phone_ec: Option<String>,
    pub email: Option<String>,
    pub wa_user_id: Option<String>,
    pub tg_user_id: Option<String>,
}

impl Patient {
    /// 一行摘要：`姓名 | Tel: ... | Email: ...`
    pub fn summary(&self) -> String {
        let mut parts = vec![if self.full_name.trim().is_empty() {
            "Sin nombre".to_string()
        } else {
            self.full_name.clone()
        }];
        if let Some(phone) = self.phone_ec.as_deref().filter(|p| !p.is_empty()) {
            parts.push(format!("Tel: {}", phone));
        }
        if let Some(email) = self.email.as_deref().filter(|e| !e.is_empty()) {
            parts.push(format!("Email: {}", email));
        }
        parts.join(" | ")
    }
}

/// 预约记录（starts_at 为 UTC）
#[derive(Debug, Clone, PartialEq)]
pub struct Appointment {
    pub id: i64,
    pub patient_dni: String,
    pub site: String,
    pub starts_at: chrono::DateTime<chrono::Utc>,
    pub status: AppointmentStatus,
    pub reminder_channel: String,
}
