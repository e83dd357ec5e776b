//! 诊所数据库（SQLite）
//!
//! 表：patients、appointments、contact_requests、messages、processed_events。
//! 预约时间一律以 UTC 存储，展示与冲突计算时再换算为本地时间。

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};

use super::{Appointment, AppointmentStatus, Patient};
use crate::core::StorageError;

pub struct ClinicDb {
    conn: Mutex<Connection>,
}

/// 消息方向（消息日志）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Inbound,
    Outbound,
}

impl Direction {
    fn as_str(&self) -> &'static str {
        match self {
            Direction::Inbound => "in",
            Direction::Outbound => "out",
        }
    }
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS patients (
    dni TEXT PRIMARY KEY,
    full_name TEXT NOT NULL,
    birth_date TEXT,
    phone_ec TEXT,
    email TEXT,
    wa_user_id TEXT,
    tg_user_id TEXT,
    created_at TEXT NOT NULL DEFAULT (datetime('now'))
);
CREATE TABLE IF NOT EXISTS appointments (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    patient_dni TEXT NOT NULL,
    site TEXT NOT NULL,
    starts_at TEXT NOT NULL,
    status TEXT NOT NULL,
    reminder_channel TEXT NOT NULL DEFAULT 'wa',
    created_at TEXT NOT NULL DEFAULT (datetime('now'))
);
CREATE INDEX IF NOT EXISTS idx_appointments_site_start ON appointments(site, starts_at);
CREATE INDEX IF NOT EXISTS idx_appointments_patient ON appointments(patient_dni);
CREATE TABLE IF NOT EXISTS contact_requests (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    platform TEXT NOT NULL,
    user_key TEXT NOT NULL,
    raw_text TEXT NOT NULL,
    created_at TEXT NOT NULL DEFAULT (datetime('now'))
);
CREATE TABLE IF NOT EXISTS messages (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    platform TEXT NOT NULL,
    user_key TEXT NOT NULL,
    direction TEXT NOT NULL,
    body TEXT NOT NULL,
    created_at TEXT NOT NULL DEFAULT (datetime('now'))
);
CREATE TABLE IF NOT EXISTS processed_events (
    message_id TEXT NOT NULL,
    platform TEXT NOT NULL,
    ts TEXT NOT NULL DEFAULT (datetime('now')),
    PRIMARY KEY (message_id, platform)
);
";

const ACTIVE_STATUSES: &str = "('PENDING','SCHEDULED','CONFIRMED')";

impl ClinicDb {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        Self::with_connection(Connection::open(path)?)
    }

    pub fn open_in_memory() -> Result<Self, StorageError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, StorageError> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, StorageError> {
        self.conn.lock().map_err(|_| StorageError::LockPoisoned)
    }

    // ---------- Patients ----------

    pub fn find_patient(&self, dni: &str) -> Result<Option<Patient>, StorageError> {
        let conn = self.conn()?;
        let patient = conn
            .query_row(
                "SELECT dni, full_name, birth_date, phone_ec, email, wa_user_id, tg_user_id
                 FROM patients WHERE dni = ?1",
                params![dni],
                patient_from_row,
            )
            .optional()?;
        Ok(patient)
    }

    /// 新建或更新患者；更新时空值不覆盖已有字段（姓名除外）
    pub fn upsert_patient(&self, patient: &Patient) -> Result<Patient, StorageError> {
        let conn = self.conn()?;
        let stored = conn.query_row(
            "INSERT INTO patients (dni, full_name, birth_date, phone_ec, email, wa_user_id, tg_user_id)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(dni) DO UPDATE SET
                full_name = excluded.full_name,
                birth_date = COALESCE(excluded.birth_date, patients.birth_date),
                phone_ec = COALESCE(excluded.phone_ec, patients.phone_ec),
                email = COALESCE(excluded.email, patients.email),
                wa_user_id = COALESCE(excluded.wa_user_id, patients.wa_user_id),
                tg_user_id = COALESCE(excluded.tg_user_id, patients.tg_user_id)
             RETURNING dni, full_name, birth_date, phone_ec, email, wa_user_id, tg_user_id",
            params![
                patient.dni,
                patient.full_name,
                patient.birth_date,
                patient.phone_ec,
                patient.email,
                patient.wa_user_id,
                patient.tg_user_id
            ],
            patient_from_row,
        )?;
        Ok(stored)
    }

    // ---------- Appointments ----------

    /// 某地点在 [from, to) 内仍占用时段的预约开始时间
    pub fn active_starts_between(
        &self,
        site: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<DateTime<Utc>>, StorageError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT starts_at FROM appointments
             WHERE site = ?1 AND status IN {ACTIVE_STATUSES}
               AND starts_at >= ?2 AND starts_at < ?3"
        ))?;
        let rows = stmt.query_map(params![site, from, to], |row| row.get::<_, DateTime<Utc>>(0))?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    pub fn insert_appointment(
        &self,
        patient_dni: &str,
        site: &str,
        starts_at: DateTime<Utc>,
        status: AppointmentStatus,
        reminder_channel: &str,
    ) -> Result<i64, StorageError> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO appointments (patient_dni, site, starts_at, status, reminder_channel)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![patient_dni, site, starts_at, status.as_str(), reminder_channel],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn get_appointment(&self, id: i64) -> Result<Option<Appointment>, StorageError> {
        let conn = self.conn()?;
        let appointment = conn
            .query_row(
                "SELECT id, patient_dni, site, starts_at, status, reminder_channel
                 FROM appointments WHERE id = ?1",
                params![id],
                appointment_from_row,
            )
            .optional()?;
        Ok(appointment)
    }

    /// 患者即将到来的有效预约（按时间升序）
    pub fn upcoming_by_dni(&self, dni: &str, limit: usize) -> Result<Vec<Appointment>, StorageError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT id, patient_dni, site, starts_at, status, reminder_channel
             FROM appointments
             WHERE patient_dni = ?1 AND status IN {ACTIVE_STATUSES}
             ORDER BY starts_at ASC
             LIMIT ?2"
        ))?;
        let rows = stmt.query_map(params![dni, limit as i64], appointment_from_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// 改期并置为 CONFIRMED；返回是否有记录被更新
    pub fn reschedule(&self, id: i64, starts_at: DateTime<Utc>) -> Result<bool, StorageError> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE appointments SET starts_at = ?1, status = 'CONFIRMED' WHERE id = ?2",
            params![starts_at, id],
        )?;
        Ok(changed > 0)
    }

    pub fn cancel(&self, id: i64) -> Result<bool, StorageError> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE appointments SET status = 'CANCELLED' WHERE id = ?1",
            params![id],
        )?;
        Ok(changed > 0)
    }

    pub fn set_reminder(&self, id: i64, channel: &str) -> Result<bool, StorageError> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE appointments SET reminder_channel = ?1 WHERE id = ?2",
            params![channel, id],
        )?;
        Ok(changed > 0)
    }

    // ---------- Handoff / journal / idempotency ----------

    pub fn insert_contact_request(&self, platform: &str, user_key: &str, raw_text: &str) -> Result<i64, StorageError> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO contact_requests (platform, user_key, raw_text) VALUES (?1, ?2, ?3)",
            params![platform, user_key, raw_text],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn contact_request_count(&self) -> Result<i64, StorageError> {
        let conn = self.conn()?;
        Ok(conn.query_row("SELECT COUNT(*) FROM contact_requests", [], |row| row.get(0))?)
    }

    pub fn log_message(&self, platform: &str, user_key: &str, direction: Direction, body: &str) -> Result<(), StorageError> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO messages (platform, user_key, direction, body) VALUES (?1, ?2, ?3, ?4)",
            params![platform, user_key, direction.as_str(), body],
        )?;
        Ok(())
    }

    /// 某用户的消息日志（方向, 正文），按写入顺序
    pub fn messages_for(&self, platform: &str, user_key: &str) -> Result<Vec<(String, String)>, StorageError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT direction, body FROM messages WHERE platform = ?1 AND user_key = ?2 ORDER BY id ASC",
        )?;
        let rows = stmt.query_map(params![platform, user_key], |row| Ok((row.get(0)?, row.get(1)?)))?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// 记录已处理事件；返回 true 表示此前未记录过
    pub fn mark_processed(&self, platform: &str, message_id: &str) -> Result<bool, StorageError> {
        let conn = self.conn()?;
        let inserted = conn.execute(
            "INSERT INTO processed_events (message_id, platform) VALUES (?1, ?2) ON CONFLICT DO NOTHING",
            params![message_id, platform],
        )?;
        Ok(inserted > 0)
    }

    pub fn is_processed(&self, platform: &str, message_id: &str) -> Result<bool, StorageError> {
        let conn = self.conn()?;
        let found: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM processed_events WHERE message_id = ?1 AND platform = ?2 LIMIT 1",
                params![message_id, platform],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }
}

fn patient_from_row(row: &Row<'_>) -> rusqlite::Result<Patient> {
    Ok(Patient {
        dni: row.get(0)?,
        full_name: row.get(1)?,
        birth_date: row.get(2)?,
        phone_ec: row.get(3)?,
        email: row.get(4)?,
        wa_user_id: row.get(5)?,
        tg_user_id: row.get(6)?,
    })
}

fn appointment_from_row(row: &Row<'_>) -> rusqlite::Result<Appointment> {
    let status: String = row.get(4)?;
    Ok(Appointment {
        id: row.get(0)?,
        patient_dni: row.get(1)?,
        site: row.get(2)?,
        starts_at: row.get(3)?,
        status: AppointmentStatus::parse(&status).unwrap_or(AppointmentStatus::Pending),
        reminder_channel: row.get(5)?,
    })
}
