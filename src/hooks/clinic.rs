//! 诊所 Hook：患者、时段、预约、人工转接
//!
//! 每个 Hook 都是捕获 `Arc<ClinicDb>` 的闭包；结果写回上下文的 `agenda` / `appointments` / `handoff` 分组，
//! 节点提示里用 `{{agenda.display}}` 之类的占位符展示。

use std::sync::Arc;

use chrono::{NaiveTime, Utc};
use serde_json::{json, Map, Value};

use super::HookRegistry;
use crate::clinic::schedule::{format_date, format_slot, parse_date, Clock, SlotRules};
use crate::clinic::{site_label, Appointment, AppointmentStatus, ClinicDb, Patient, SITE_GUAYAQUIL, SITE_MILAGRO};
use crate::core::StorageError;
use crate::flow::context::{arg_str, get_path, section, Context};

/// 「没有邮箱」的常见写法
const NO_EMAIL: [&str; 7] = ["ninguno", "ninguna", "no tengo", "no", "omit", "n/a", "0"];

const UPCOMING_LIMIT: usize = 5;

/// 注册诊所 Hook
pub fn register(registry: &mut HookRegistry, db: Arc<ClinicDb>, rules: SlotRules, clock: Clock) {
    let d = db.clone();
    registry.register_fn("patient.lookup", "Busca paciente por cédula", move |args, ctx| {
        patient_lookup(&d, &arg_str(args, 0), ctx).map_err(|e| e.to_string())
    });

    let d = db.clone();
    registry.register_fn(
        "patient.create_or_update",
        "Crea o actualiza la ficha del paciente",
        move |args, ctx| patient_create_or_update(&d, args, ctx).map_err(|e| e.to_string()),
    );

    let (d, c) = (db.clone(), clock);
    registry.register_fn(
        "appointments.list_slots",
        "Horarios disponibles (solo Guayaquil)",
        move |args, ctx| list_slots(&d, &rules, &c, &arg_str(args, 0), &arg_str(args, 1), ctx).map_err(|e| e.to_string()),
    );

    registry.register_fn("agenda.store_slot", "Guarda el horario elegido", move |args, ctx| {
        Ok(Value::Bool(store_slot(&rules, &arg_str(args, 0), ctx)))
    });

    let d = db.clone();
    registry.register_fn(
        "appointments.book_confirmed",
        "Registra cita confirmada en Guayaquil",
        move |args, ctx| book_confirmed(&d, &rules, &arg_str(args, 0), ctx).map_err(|e| e.to_string()),
    );

    let d = db.clone();
    registry.register_fn(
        "appointments.register_milagro",
        "Registra solicitud pendiente en Milagro",
        move |args, ctx| {
            register_milagro(&d, &rules, &arg_str(args, 0), &arg_str(args, 1), ctx).map_err(|e| e.to_string())
        },
    );

    let d = db.clone();
    registry.register_fn(
        "appointments.upcoming_by_dni",
        "Próximas citas del paciente",
        move |args, ctx| upcoming_by_dni(&d, &rules, &arg_str(args, 0), ctx).map_err(|e| e.to_string()),
    );

    let d = db.clone();
    registry.register_fn("appointments.reschedule", "Reagenda una cita", move |args, ctx| {
        reschedule(&d, &rules, arg_id(args, 0), &arg_str(args, 1), ctx).map_err(|e| e.to_string())
    });

    let d = db.clone();
    registry.register_fn("appointments.cancel", "Cancela una cita", move |args, ctx| {
        let Some(id) = arg_id(args, 0) else {
            return Ok(Value::Bool(false));
        };
        let cancelled = d.cancel(id).map_err(|e| e.to_string())?;
        if cancelled {
            section(section(ctx, "appointments"), "target").insert("status".into(), json!("CANCELLED"));
        }
        Ok(Value::Bool(cancelled))
    });

    let d = db.clone();
    registry.register_fn(
        "appointments.set_reminder",
        "Cambia el canal de recordatorio",
        move |args, ctx| {
            let (Some(id), reminder) = (arg_id(args, 0), arg_str(args, 1)) else {
                return Ok(Value::Bool(false));
            };
            let reminder = normalize_reminder(&reminder);
            let updated = d.set_reminder(id, &reminder).map_err(|e| e.to_string())?;
            if updated {
                section(section(ctx, "appointments"), "target").insert("reminder".into(), json!(reminder));
            }
            Ok(Value::Bool(updated))
        },
    );

    let d = db;
    registry.register_fn("handoff.to_human", "Solicitud de contacto humano", move |args, ctx| {
        handoff_to_human(&d, args, ctx).map_err(|e| e.to_string())
    });
}

/// 预约编号参数：数字或数字字符串
fn arg_id(args: &[Value], index: usize) -> Option<i64> {
    match args.get(index)? {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
    .filter(|id| *id > 0)
}

fn non_empty(raw: String) -> Option<String> {
    let trimmed = raw.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

fn normalize_reminder(raw: &str) -> String {
    match raw.trim().to_lowercase().as_str() {
        "email" | "correo" | "mail" => "email".to_string(),
        "tg" | "telegram" => "tg".to_string(),
        _ => "wa".to_string(),
    }
}

fn patient_value(patient: &Patient) -> Value {
    let mut value = serde_json::to_value(patient).unwrap_or_else(|_| Value::Object(Map::new()));
    if let Value::Object(map) = &mut value {
        map.insert("summary".into(), Value::String(patient.summary()));
    }
    value
}

fn ctx_str(ctx: &Context, path: &str) -> Option<String> {
    get_path(ctx, path)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// 当前流程里的患者 DNI：已加载患者优先，其次是用户输入的 DNI
fn current_dni(ctx: &Context) -> Option<String> {
    ctx_str(ctx, "agenda.patient.dni").or_else(|| ctx_str(ctx, "agenda.dni"))
}

fn patient_lookup(db: &ClinicDb, dni: &str, ctx: &mut Context) -> Result<Value, StorageError> {
    let dni = dni.trim();
    let agenda = section(ctx, "agenda");
    agenda.insert("dni".into(), json!(dni));
    if dni.is_empty() {
        agenda.insert("patient".into(), Value::Null);
        return Ok(Value::Bool(false));
    }
    match db.find_patient(dni)? {
        Some(patient) => {
            agenda.insert("patient".into(), patient_value(&patient));
            Ok(Value::Bool(true))
        }
        None => {
            agenda.insert("patient".into(), Value::Null);
            Ok(Value::Bool(false))
        }
    }
}

/// args: dni, full_name, birth_date, phone, email, platform, user_id（后两项缺省取 meta.channel / meta.user_key）
fn patient_create_or_update(db: &ClinicDb, args: &[Value], ctx: &mut Context) -> Result<Value, StorageError> {
    let dni = arg_str(args, 0).trim().to_string();
    if dni.is_empty() {
        return Ok(Value::Null);
    }
    let email = non_empty(arg_str(args, 4)).filter(|e| !NO_EMAIL.contains(&e.to_lowercase().as_str()));
    let platform = non_empty(arg_str(args, 5))
        .or_else(|| ctx_str(ctx, "meta.channel"))
        .unwrap_or_default()
        .to_lowercase();
    let user_id = non_empty(arg_str(args, 6)).or_else(|| ctx_str(ctx, "meta.user_key"));

    let patient = Patient {
        dni,
        full_name: arg_str(args, 1).trim().to_string(),
        birth_date: non_empty(arg_str(args, 2)),
        phone_ec: non_empty(arg_str(args, 3)),
        email,
        wa_user_id: user_id.clone().filter(|_| platform == "wa"),
        tg_user_id: user_id.filter(|_| platform == "tg"),
    };
    let stored = db.upsert_patient(&patient)?;
    let value = patient_value(&stored);
    section(ctx, "agenda").insert("patient".into(), value.clone());
    tracing::info!(dni = %stored.dni, "Patient saved");
    Ok(value)
}

fn existing_local(db: &ClinicDb, rules: &SlotRules, site: &str, day: chrono::NaiveDate) -> Result<Vec<chrono::DateTime<chrono::FixedOffset>>, StorageError> {
    let Some((from, to)) = rules.day_bounds_utc(day) else {
        return Ok(Vec::new());
    };
    Ok(db
        .active_starts_between(site, from, to)?
        .into_iter()
        .map(|dt| dt.with_timezone(&rules.offset))
        .collect())
}

fn list_slots(
    db: &ClinicDb,
    rules: &SlotRules,
    clock: &Clock,
    site: &str,
    date: &str,
    ctx: &mut Context,
) -> Result<Value, StorageError> {
    let site = site.trim().to_ascii_uppercase();
    let agenda = section(ctx, "agenda");
    agenda.insert("site".into(), json!(site));
    agenda.insert("site_label".into(), json!(site_label(&site)));

    let Some(day) = parse_date(date) else {
        agenda.insert("slots".into(), json!([]));
        return Ok(json!([]));
    };
    agenda.insert("date".into(), json!(format_date(day)));
    if site != SITE_GUAYAQUIL {
        agenda.insert("slots".into(), json!([]));
        return Ok(json!([]));
    }

    let existing = existing_local(db, rules, &site, day)?;
    let slots: Vec<Value> = rules
        .available(day, clock.now(), &existing)
        .iter()
        .enumerate()
        .map(|(i, slot)| {
            let label = format_slot(slot);
            json!({"key": (i + 1).to_string(), "label": label, "value": label})
        })
        .collect();
    let slots = Value::Array(slots);
    section(ctx, "agenda").insert("slots".into(), slots.clone());
    Ok(slots)
}

fn store_slot(rules: &SlotRules, label: &str, ctx: &mut Context) -> bool {
    let agenda = section(ctx, "agenda");
    let Some(local) = rules.parse_slot(label) else {
        agenda.remove("selected_slot");
        return false;
    };
    let display = format_slot(&local);
    agenda.insert("selected_slot".into(), json!(display));
    agenda.insert("date".into(), json!(format_date(local.date_naive())));
    agenda.insert("time".into(), json!(local.format("%H:%M").to_string()));
    agenda.insert("display".into(), json!(display));
    agenda.insert("slot_dt".into(), json!(local.to_rfc3339()));
    true
}

fn book_confirmed(db: &ClinicDb, rules: &SlotRules, reminder: &str, ctx: &mut Context) -> Result<Value, StorageError> {
    let site = ctx_str(ctx, "agenda.site").unwrap_or_else(|| SITE_GUAYAQUIL.to_string()).to_ascii_uppercase();
    let (Some(dni), Some(slot)) = (current_dni(ctx), ctx_str(ctx, "agenda.selected_slot")) else {
        return Ok(Value::Null);
    };
    let Some(local) = rules.parse_slot(&slot) else {
        return Ok(Value::Null);
    };

    let mut reminder = normalize_reminder(if reminder.trim().is_empty() { "wa" } else { reminder });
    if reminder == "email" && ctx_str(ctx, "agenda.patient.email").is_none() {
        reminder = "wa".to_string();
    }

    if site == SITE_GUAYAQUIL && rules.conflicts(local, &existing_local(db, rules, &site, local.date_naive())?) {
        tracing::info!(slot = %slot, site = %site, "Slot already taken");
        section(ctx, "agenda").insert("conflict".into(), json!(true));
        return Ok(Value::Null);
    }

    let id = db.insert_appointment(&dni, &site, local.with_timezone(&Utc), AppointmentStatus::Confirmed, &reminder)?;
    let starts_at = format_slot(&local);
    let agenda = section(ctx, "agenda");
    agenda.remove("conflict");
    agenda.insert("reminder".into(), json!(reminder));
    agenda.insert("display".into(), json!(starts_at));
    agenda.insert(
        "appointment".into(),
        json!({
            "id": id,
            "site": site,
            "site_label": site_label(&site),
            "starts_at": starts_at,
            "status": AppointmentStatus::Confirmed.as_str(),
            "reminder": reminder,
        }),
    );
    tracing::info!(appointment_id = id, site = %site, starts_at = %starts_at, "Appointment booked");
    Ok(json!(id))
}

/// 米拉格罗只登记意向：上午班 09:00，其它 15:00，状态 PENDING 等人工确认
fn register_milagro(
    db: &ClinicDb,
    rules: &SlotRules,
    date_pref: &str,
    shift: &str,
    ctx: &mut Context,
) -> Result<Value, StorageError> {
    let Some(dni) = current_dni(ctx) else {
        return Ok(Value::Null);
    };
    let Some(day) = parse_date(date_pref) else {
        return Ok(Value::Null);
    };
    let shift = crate::flow::normalize::normalize(shift);
    let hour = if shift == "manana" || shift == "mañana" { 9 } else { 15 };
    let Some(local) = NaiveTime::from_hms_opt(hour, 0, 0).and_then(|t| rules.local(day, t)) else {
        return Ok(Value::Null);
    };
    let reminder = ctx_str(ctx, "agenda.reminder").unwrap_or_else(|| "wa".to_string());

    let id = db.insert_appointment(&dni, SITE_MILAGRO, local.with_timezone(&Utc), AppointmentStatus::Pending, &reminder)?;
    let starts_at = format_slot(&local);
    let agenda = section(ctx, "agenda");
    agenda.insert("reminder".into(), json!(reminder));
    agenda.insert("display".into(), json!(starts_at));
    agenda.insert(
        "appointment".into(),
        json!({
            "id": id,
            "site": SITE_MILAGRO,
            "site_label": site_label(SITE_MILAGRO),
            "starts_at": starts_at,
            "status": AppointmentStatus::Pending.as_str(),
        }),
    );
    tracing::info!(appointment_id = id, starts_at = %starts_at, "Milagro request registered");
    Ok(json!(id))
}

fn appointment_value(rules: &SlotRules, appointment: &Appointment) -> Value {
    let local = appointment.starts_at.with_timezone(&rules.offset);
    json!({
        "id": appointment.id,
        "site": appointment.site,
        "site_label": site_label(&appointment.site),
        "local_label": format_slot(&local),
        "date": format_date(local.date_naive()),
        "time": local.format("%H:%M").to_string(),
        "status": appointment.status.as_str(),
        "reminder": appointment.reminder_channel,
    })
}

fn upcoming_by_dni(db: &ClinicDb, rules: &SlotRules, dni: &str, ctx: &mut Context) -> Result<Value, StorageError> {
    let dni = dni.trim();
    section(ctx, "agenda").insert("dni".into(), json!(dni));
    if dni.is_empty() {
        section(ctx, "appointments").insert("upcoming".into(), json!([]));
        return Ok(Value::Bool(false));
    }

    let upcoming: Vec<Value> = db
        .upcoming_by_dni(dni, UPCOMING_LIMIT)?
        .iter()
        .map(|a| appointment_value(rules, a))
        .collect();
    let lines: Vec<String> = upcoming
        .iter()
        .enumerate()
        .map(|(i, a)| {
            format!(
                "{}. {} · {} ({})",
                i + 1,
                a["local_label"].as_str().unwrap_or_default(),
                a["site_label"].as_str().unwrap_or_default(),
                a["status"].as_str().unwrap_or_default()
            )
        })
        .collect();

    let found = !upcoming.is_empty();
    let first = upcoming.first().cloned();
    let appointments = section(ctx, "appointments");
    appointments.insert("upcoming".into(), Value::Array(upcoming));
    appointments.insert("summary".into(), json!(lines.join("\n")));
    if let Some(first) = first {
        appointments.insert("target".into(), first.clone());
        let agenda = section(ctx, "agenda");
        for (to, from) in [("site", "site"), ("site_label", "site_label"), ("date", "date"), ("time", "time"), ("selected_slot", "local_label")] {
            agenda.insert(to.into(), first[from].clone());
        }
    }
    Ok(Value::Bool(found))
}

fn reschedule(
    db: &ClinicDb,
    rules: &SlotRules,
    id: Option<i64>,
    new_slot: &str,
    ctx: &mut Context,
) -> Result<Value, StorageError> {
    let Some(id) = id else {
        return Ok(Value::Bool(false));
    };
    let Some(local) = rules.parse_slot(new_slot) else {
        return Ok(Value::Bool(false));
    };
    let site = ctx_str(ctx, "agenda.site").unwrap_or_else(|| SITE_GUAYAQUIL.to_string()).to_ascii_uppercase();
    if site == SITE_GUAYAQUIL {
        // 改期时自身的旧时间不算冲突
        let own = db.get_appointment(id)?.map(|a| a.starts_at.with_timezone(&rules.offset));
        let existing: Vec<_> = existing_local(db, rules, &site, local.date_naive())?
            .into_iter()
            .filter(|dt| Some(*dt) != own)
            .collect();
        if rules.conflicts(local, &existing) {
            tracing::info!(appointment_id = id, "Conflict while rescheduling");
            return Ok(Value::Bool(false));
        }
    }

    if !db.reschedule(id, local.with_timezone(&Utc))? {
        return Ok(Value::Bool(false));
    }
    let display = format_slot(&local);
    section(section(ctx, "appointments"), "target").insert("local_label".into(), json!(display));
    let agenda = section(ctx, "agenda");
    agenda.insert("date".into(), json!(format_date(local.date_naive())));
    agenda.insert("time".into(), json!(local.format("%H:%M").to_string()));
    agenda.insert("selected_slot".into(), json!(display));
    agenda.insert("display".into(), json!(display));
    Ok(Value::Bool(true))
}

/// args: platform, user_id, message（缺省取 meta.channel / meta.user_key / last_text）
fn handoff_to_human(db: &ClinicDb, args: &[Value], ctx: &mut Context) -> Result<Value, StorageError> {
    let platform = non_empty(arg_str(args, 0))
        .or_else(|| ctx_str(ctx, "meta.channel"))
        .unwrap_or_else(|| "wa".to_string());
    let user_key = non_empty(arg_str(args, 1))
        .or_else(|| ctx_str(ctx, "meta.user_key"))
        .unwrap_or_default();
    let message = non_empty(arg_str(args, 2))
        .or_else(|| ctx_str(ctx, "last_text"))
        .unwrap_or_default();

    db.insert_contact_request(&platform, &user_key, &message)?;
    section(ctx, "handoff").insert("requested".into(), Value::Bool(true));
    tracing::info!(platform = %platform, user = %user_key, "Handoff requested");
    Ok(Value::Bool(true))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clinic::schedule::LocalDateTime;

    struct Fixture {
        registry: HookRegistry,
        db: Arc<ClinicDb>,
        rules: SlotRules,
    }

    fn fixture(now: &str) -> Fixture {
        let rules = SlotRules::default();
        let now: LocalDateTime = rules.parse_slot(now).unwrap();
        let db = Arc::new(ClinicDb::open_in_memory().unwrap());
        let mut registry = HookRegistry::new();
        register(&mut registry, db.clone(), rules, Clock::fixed(now));
        Fixture { registry, db, rules }
    }

    fn call(f: &Fixture, name: &str, args: Value, ctx: &mut Context) -> Value {
        let args = args.as_array().cloned().unwrap_or_default();
        f.registry.call(name, &args, ctx)
    }

    #[test]
    fn test_patient_create_then_lookup() {
        let f = fixture("19-10-2026 08:00");
        let mut ctx = Context::new();
        section(&mut ctx, "meta").insert("channel".into(), json!("wa"));
        section(&mut ctx, "meta").insert("user_key".into(), json!("593991234567"));

        let saved = call(
            &f,
            "patient.create_or_update",
            json!(["0912345678", "Ana Pérez", "01-02-1980", "0991234567", "Ninguno"]),
            &mut ctx,
        );
        assert_eq!(saved["wa_user_id"], json!("593991234567"));
        assert_eq!(saved["email"], Value::Null);
        assert_eq!(saved["summary"], json!("Ana Pérez | Tel: 0991234567"));

        let mut fresh = Context::new();
        assert_eq!(call(&f, "patient.lookup", json!(["0912345678"]), &mut fresh), json!(true));
        assert_eq!(fresh["agenda"]["patient"]["full_name"], json!("Ana Pérez"));
        assert_eq!(call(&f, "patient.lookup", json!(["0999999999"]), &mut fresh), json!(false));
        assert_eq!(fresh["agenda"]["patient"], Value::Null);
        assert_eq!(fresh["agenda"]["dni"], json!("0999999999"));
    }

    #[test]
    fn test_list_slots_only_for_guayaquil() {
        let f = fixture("19-10-2026 08:00");
        let mut ctx = Context::new();
        let slots = call(&f, "appointments.list_slots", json!(["gye", "19-10-2026"]), &mut ctx);
        assert_eq!(slots.as_array().unwrap().len(), 7);
        assert_eq!(slots[0], json!({"key": "1", "label": "19-10-2026 09:00", "value": "19-10-2026 09:00"}));
        assert_eq!(ctx["agenda"]["site_label"], json!("Guayaquil"));

        let slots = call(&f, "appointments.list_slots", json!(["MIL", "19-10-2026"]), &mut ctx);
        assert_eq!(slots, json!([]));
        assert_eq!(ctx["agenda"]["slots"], json!([]));

        let slots = call(&f, "appointments.list_slots", json!(["GYE", "mañana"]), &mut ctx);
        assert_eq!(slots, json!([]));
    }

    #[test]
    fn test_book_confirmed_then_slot_disappears() {
        let f = fixture("19-10-2026 08:00");
        let mut ctx = Context::new();
        call(&f, "appointments.list_slots", json!(["GYE", "19-10-2026"]), &mut ctx);
        section(&mut ctx, "agenda").insert("dni".into(), json!("0912345678"));
        assert_eq!(call(&f, "agenda.store_slot", json!(["19-10-2026 10:00"]), &mut ctx), json!(true));
        assert_eq!(ctx["agenda"]["time"], json!("10:00"));

        let id = call(&f, "appointments.book_confirmed", json!(["email"]), &mut ctx);
        assert!(id.as_i64().is_some());
        // 没有邮箱时退回 WhatsApp 提醒
        assert_eq!(ctx["agenda"]["reminder"], json!("wa"));
        assert_eq!(ctx["agenda"]["appointment"]["status"], json!("CONFIRMED"));

        // 同一时段再订一次会冲突
        let again = call(&f, "appointments.book_confirmed", json!(["wa"]), &mut ctx);
        assert_eq!(again, Value::Null);
        assert_eq!(ctx["agenda"]["conflict"], json!(true));

        let slots = call(&f, "appointments.list_slots", json!(["GYE", "19-10-2026"]), &mut ctx);
        let labels: Vec<&str> = slots.as_array().unwrap().iter().filter_map(|s| s["label"].as_str()).collect();
        assert_eq!(
            labels,
            vec!["19-10-2026 16:00", "19-10-2026 17:00", "19-10-2026 18:00", "19-10-2026 19:00"]
        );
    }

    #[test]
    fn test_book_requires_dni_and_slot() {
        let f = fixture("19-10-2026 08:00");
        let mut ctx = Context::new();
        assert_eq!(call(&f, "appointments.book_confirmed", json!(["wa"]), &mut ctx), Value::Null);
        assert_eq!(call(&f, "agenda.store_slot", json!(["no es fecha"]), &mut ctx), json!(false));
    }

    #[test]
    fn test_register_milagro_shifts() {
        let f = fixture("19-10-2026 08:00");
        let mut ctx = Context::new();
        section(&mut ctx, "agenda").insert("dni".into(), json!("0912345678"));
        let id = call(&f, "appointments.register_milagro", json!(["20-10-2026", "Mañana"]), &mut ctx);
        assert!(id.as_i64().is_some());
        assert_eq!(ctx["agenda"]["display"], json!("20-10-2026 09:00"));
        assert_eq!(ctx["agenda"]["appointment"]["status"], json!("PENDING"));

        call(&f, "appointments.register_milagro", json!(["21-10-2026", "tarde"]), &mut ctx);
        assert_eq!(ctx["agenda"]["display"], json!("21-10-2026 15:00"));
    }

    #[test]
    fn test_upcoming_reschedule_cancel() {
        let f = fixture("19-10-2026 08:00");
        let first = f
            .db
            .insert_appointment(
                "0912345678",
                "GYE",
                f.rules.parse_slot("20-10-2026 09:00").unwrap().with_timezone(&Utc),
                AppointmentStatus::Confirmed,
                "wa",
            )
            .unwrap();

        let mut ctx = Context::new();
        assert_eq!(call(&f, "appointments.upcoming_by_dni", json!(["0912345678"]), &mut ctx), json!(true));
        assert_eq!(ctx["appointments"]["target"]["id"], json!(first));
        assert_eq!(ctx["appointments"]["target"]["local_label"], json!("20-10-2026 09:00"));
        assert_eq!(ctx["agenda"]["site"], json!("GYE"));

        // 挪到紧邻的时段不应与自己冲突
        assert_eq!(
            call(&f, "appointments.reschedule", json!([first, "20-10-2026 10:00"]), &mut ctx),
            json!(true)
        );
        assert_eq!(ctx["appointments"]["target"]["local_label"], json!("20-10-2026 10:00"));

        assert_eq!(call(&f, "appointments.set_reminder", json!([first.to_string(), "correo"]), &mut ctx), json!(true));
        assert_eq!(ctx["appointments"]["target"]["reminder"], json!("email"));

        assert_eq!(call(&f, "appointments.cancel", json!([first]), &mut ctx), json!(true));
        assert_eq!(ctx["appointments"]["target"]["status"], json!("CANCELLED"));
        assert_eq!(call(&f, "appointments.upcoming_by_dni", json!(["0912345678"]), &mut ctx), json!(false));
        assert_eq!(call(&f, "appointments.cancel", json!([]), &mut ctx), json!(false));
    }

    #[test]
    fn test_handoff_uses_session_meta() {
        let f = fixture("19-10-2026 08:00");
        let mut ctx = Context::new();
        section(&mut ctx, "meta").insert("channel".into(), json!("tg"));
        section(&mut ctx, "meta").insert("user_key".into(), json!("42"));
        ctx.insert("last_text".into(), json!("quiero hablar con el doctor"));

        assert_eq!(call(&f, "handoff.to_human", json!([]), &mut ctx), json!(true));
        assert_eq!(ctx["handoff"]["requested"], json!(true));
        assert_eq!(f.db.contact_request_count().unwrap(), 1);
    }
}
