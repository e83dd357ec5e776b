//! 不活跃会话巡检
//!
//! 周期性扫描会话存储：
//! - 阶段 0（活跃）且空闲超过 `nudge_after_minutes`：发送提醒，进入阶段 1
//! - 阶段 1 且自提醒起空闲超过 `close_after_minutes`：发送告别，回到起始节点并清空历史，进入阶段 2
//!
//! 用户再次发消息时引擎会把阶段重置为 0。

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

use crate::config::InactivitySection;
use crate::flow::FlowEngine;
use crate::integrations::Senders;
use crate::session::{InactivityStage, Session};

/// 单次巡检结果
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub nudged: usize,
    pub closed: usize,
}

pub struct InactivityMonitor {
    engine: Arc<FlowEngine>,
    senders: Arc<Senders>,
    settings: InactivitySection,
}

impl InactivityMonitor {
    pub fn new(engine: Arc<FlowEngine>, senders: Arc<Senders>, settings: InactivitySection) -> Self {
        Self {
            engine,
            senders,
            settings,
        }
    }

    /// 按 check_interval_secs 循环巡检，收到取消信号后退出
    pub async fn run(self, token: CancellationToken) {
        let period = Duration::from_secs(self.settings.check_interval_secs.max(1));
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tracing::info!(interval_secs = period.as_secs(), "Inactivity monitor started");

        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    tracing::info!("Inactivity monitor stopped");
                    break;
                }
                _ = ticker.tick() => {
                    match self.sweep(Utc::now()).await {
                        Ok(report) if report.nudged + report.closed > 0 => {
                            tracing::info!(nudged = report.nudged, closed = report.closed, "Inactivity sweep finished");
                        }
                        Ok(_) => {}
                        Err(e) => tracing::error!(error = %e, "Inactivity sweep failed"),
                    }
                }
            }
        }
    }

    /// 执行一次巡检
    pub async fn sweep(&self, now: DateTime<Utc>) -> anyhow::Result<SweepReport> {
        let nudge_cutoff = now - chrono::Duration::minutes(self.settings.nudge_after_minutes);
        let close_cutoff = now - chrono::Duration::minutes(self.settings.close_after_minutes);
        let store = self.engine.store();

        let candidates = store
            .idle_sessions(nudge_cutoff.max(close_cutoff))
            .await
            .context("listing idle sessions")?;

        let mut report = SweepReport::default();
        for candidate in candidates {
            let id = candidate.id();
            let _guard = self.engine.lock_session(&id).await;

            // 加锁后重新读取，期间用户可能已发来新消息
            let Some(mut session) = store.peek(&id).await.with_context(|| format!("reading session {}", id))? else {
                continue;
            };

            let action = match session.inactivity_stage {
                InactivityStage::Active if session.last_activity < nudge_cutoff => Action::Nudge,
                InactivityStage::Nudged if session.last_activity < close_cutoff => Action::Close,
                _ => continue,
            };

            let text = match action {
                Action::Nudge => &self.settings.nudge_message,
                Action::Close => &self.settings.farewell_message,
            };
            if let Err(e) = self.senders.send(&session.channel, &session.user_key, text).await {
                tracing::warn!(session = %id, error = %e, "Failed to deliver inactivity message");
            }

            self.apply(&mut session, action);
            store
                .set(&id, &session)
                .await
                .with_context(|| format!("saving session {}", id))?;

            match action {
                Action::Nudge => report.nudged += 1,
                Action::Close => report.closed += 1,
            }
        }
        Ok(report)
    }

    fn apply(&self, session: &mut Session, action: Action) {
        match action {
            Action::Nudge => session.inactivity_stage = InactivityStage::Nudged,
            Action::Close => {
                self.engine.reset_to_start(session);
                session.inactivity_stage = InactivityStage::Closed;
            }
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Action {
    Nudge,
    Close,
}
