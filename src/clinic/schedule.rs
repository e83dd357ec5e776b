//! 时段计算
//!
//! 诊所位于 America/Guayaquil（UTC-5，无夏令时），用固定偏移表示本地时间。
//! 瓜亚基尔的营业窗口：周一至周五 09:00-12:00、16:00-20:00；周六 09:00-16:00；周日休息。
//! 候选时段按「时长 + 间隔」步进生成，两个预约各自加上前后间隔后重叠即视为冲突。

use std::sync::Arc;

use chrono::{DateTime, Datelike, Duration, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime, Offset, TimeZone, Utc, Weekday};

use crate::config::SchedulingSection;

pub const DATE_FORMAT: &str = "%d-%m-%Y";
pub const SLOT_FORMAT: &str = "%d-%m-%Y %H:%M";

/// 本地时间
pub type LocalDateTime = DateTime<FixedOffset>;

/// 可注入的时钟（测试中固定「现在」）
#[derive(Clone)]
pub struct Clock {
    offset: FixedOffset,
    now_utc: Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>,
}

impl Clock {
    pub fn system(offset: FixedOffset) -> Self {
        Self {
            offset,
            now_utc: Arc::new(Utc::now),
        }
    }

    pub fn fixed(now: LocalDateTime) -> Self {
        let utc = now.with_timezone(&Utc);
        Self {
            offset: *now.offset(),
            now_utc: Arc::new(move || utc),
        }
    }

    pub fn offset(&self) -> FixedOffset {
        self.offset
    }

    pub fn now(&self) -> LocalDateTime {
        (self.now_utc)().with_timezone(&self.offset)
    }

    pub fn today(&self) -> NaiveDate {
        self.now().date_naive()
    }
}

impl std::fmt::Debug for Clock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Clock").field("offset", &self.offset).finish()
    }
}

/// 小时偏移 -> FixedOffset；越界时退回 UTC
pub fn offset_from_hours(hours: i32) -> FixedOffset {
    FixedOffset::east_opt(hours * 3600).unwrap_or_else(|| Utc.fix())
}

/// 时段规则
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SlotRules {
    pub slot_minutes: i64,
    pub gap_minutes: i64,
    pub offset: FixedOffset,
}

impl Default for SlotRules {
    fn default() -> Self {
        Self::from(&SchedulingSection::default())
    }
}

impl From<&SchedulingSection> for SlotRules {
    fn from(cfg: &SchedulingSection) -> Self {
        Self {
            slot_minutes: cfg.slot_duration_minutes.max(1),
            gap_minutes: cfg.gap_after_slot_minutes.max(0),
            offset: offset_from_hours(cfg.utc_offset_hours),
        }
    }
}

/// 瓜亚基尔每周营业窗口（本地时间，[开始, 结束) 小时）
pub fn guayaquil_windows(weekday: Weekday) -> &'static [(u32, u32)] {
    match weekday {
        Weekday::Mon | Weekday::Tue | Weekday::Wed | Weekday::Thu | Weekday::Fri => &[(9, 12), (16, 20)],
        Weekday::Sat => &[(9, 16)],
        Weekday::Sun => &[],
    }
}

impl SlotRules {
    fn span(&self) -> Duration {
        Duration::minutes(self.slot_minutes)
    }

    fn gap(&self) -> Duration {
        Duration::minutes(self.gap_minutes)
    }

    /// 本地日期 + 时刻 -> 本地时间
    pub fn local(&self, day: NaiveDate, time: NaiveTime) -> Option<LocalDateTime> {
        self.offset.from_local_datetime(&day.and_time(time)).single()
    }

    /// 某天的全部候选开始时间：窗口内按 slot+gap 步进，且整段时长落在窗口内
    pub fn candidates(&self, day: NaiveDate) -> Vec<LocalDateTime> {
        let step = self.span() + self.gap();
        let mut out = Vec::new();
        for &(open, close) in guayaquil_windows(day.weekday()) {
            let (Some(open), Some(close)) = (
                NaiveTime::from_hms_opt(open, 0, 0).and_then(|t| self.local(day, t)),
                NaiveTime::from_hms_opt(close, 0, 0).and_then(|t| self.local(day, t)),
            ) else {
                continue;
            };
            let mut current = open;
            while current + self.span() <= close {
                out.push(current);
                current = current + step;
            }
        }
        out
    }

    /// 候选时段与已有预约（开始时间）是否冲突：两者各加前后间隔后区间重叠
    pub fn conflicts(&self, candidate: LocalDateTime, existing: &[LocalDateTime]) -> bool {
        let start_buffer = candidate - self.gap();
        let end_buffer = candidate + self.span() + self.gap();
        existing.iter().any(|booked| {
            let booked_start_buffer = *booked - self.gap();
            let booked_end_buffer = *booked + self.span() + self.gap();
            !(end_buffer <= booked_start_buffer || booked_end_buffer <= start_buffer)
        })
    }

    /// 可预约时段：候选中去掉当天已过去的与冲突的
    pub fn available(&self, day: NaiveDate, now: LocalDateTime, existing: &[LocalDateTime]) -> Vec<LocalDateTime> {
        self.candidates(day)
            .into_iter()
            .filter(|c| !(c.date_naive() == now.date_naive() && *c <= now))
            .filter(|c| !self.conflicts(*c, existing))
            .collect()
    }

    /// 本地某天在 UTC 下的 [开始, 结束)
    pub fn day_bounds_utc(&self, day: NaiveDate) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
        let start = self.local(day, NaiveTime::MIN)?;
        let end = start + Duration::days(1);
        Some((start.with_timezone(&Utc), end.with_timezone(&Utc)))
    }

    /// 解析 `dd-mm-YYYY HH:MM` 为本地时间
    pub fn parse_slot(&self, label: &str) -> Option<LocalDateTime> {
        let naive = NaiveDateTime::parse_from_str(label.trim(), SLOT_FORMAT).ok()?;
        self.offset.from_local_datetime(&naive).single()
    }
}

/// 解析 `dd-mm-YYYY`
pub fn parse_date(raw: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(raw.trim(), DATE_FORMAT).ok()
}

pub fn format_date(day: NaiveDate) -> String {
    day.format(DATE_FORMAT).to_string()
}

pub fn format_slot(at: &LocalDateTime) -> String {
    at.format(SLOT_FORMAT).to_string()
}
