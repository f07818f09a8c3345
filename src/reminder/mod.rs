//! 休息提醒模块
//!
//! 按本地日历日运转的限频状态机：只有当前处于 rest 伞类别、连续停留
//! 时间达到阈值、且日上限/冷却/静音检查全部通过时才弹一次提醒。
//! 状态只存在于内存，跨日自动清零，进程重启后从零开始。

use anyhow::{anyhow, Result};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::info;

use crate::config::{Settings, Umbrella};
use crate::ledger::SessionState;

/// 阈值下限（秒）
pub const MIN_THRESHOLD_SECS: i64 = 30;

/// 弹出的休息提醒内容
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RestPrompt {
    /// 已在 rest 页面连续停留的分钟数
    pub minutes_on_rest: i64,
    /// 触发阈值（分钟）
    pub threshold_minutes: u32,
}

/// 用户对提醒弹窗的操作
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ModalAction {
    #[serde(rename = "closeOnce")]
    CloseOnce,
    #[serde(rename = "snooze30")]
    Snooze30,
    #[serde(rename = "disable")]
    Disable,
}

/// 提醒状态
///
/// 日期键变化时整体重置；`Disable` 对设置的修改由引擎负责。
#[derive(Debug, Default)]
pub struct RemindState {
    last_day_key: Option<String>,
    last_reminder: Option<DateTime<Utc>>,
    reminder_count_today: u32,
    mute_until: Option<DateTime<Utc>>,
}

/// 提醒阈值（秒）：用户周期分钟数换算，floor 30 秒
///
/// 冷却时长与阈值相等，提醒不会比触发间隔更密。
pub fn threshold_secs(settings: &Settings) -> i64 {
    let user_min = if settings.interval_minutes == 0 {
        5
    } else {
        settings.interval_minutes
    };
    (user_min as i64 * 60).max(MIN_THRESHOLD_SECS)
}

impl RemindState {
    pub fn new() -> Self {
        Self::default()
    }

    /// 守卫链评估，全部通过时返回要弹出的提醒
    ///
    /// 不做任何呈现；呈现成功与否由调用方决定是否 `record_fired`。
    pub fn check(
        &mut self,
        settings: &Settings,
        session: &SessionState,
        now: DateTime<Utc>,
        day_key: &str,
    ) -> Option<RestPrompt> {
        if !settings.focus_policy.enabled {
            return None;
        }

        if self.last_day_key.as_deref() != Some(day_key) {
            *self = Self::default();
            self.last_day_key = Some(day_key.to_string());
        }

        if self.reminder_count_today >= settings.focus_policy.daily_max {
            return None;
        }

        // 只在 rest 伞下提醒
        if settings.map_to_umbrella(&session.current_category) != Umbrella::Rest {
            return None;
        }

        if let Some(mute_until) = self.mute_until {
            if now < mute_until {
                return None;
            }
        }

        let threshold = threshold_secs(settings);
        let cooldown = threshold;
        if let Some(last) = self.last_reminder {
            if (now - last).num_seconds() < cooldown {
                return None;
            }
        }

        let since_switch = (now - session.last_switch).num_seconds().max(0);
        if since_switch < threshold {
            return None;
        }

        let user_min = if settings.interval_minutes == 0 {
            5
        } else {
            settings.interval_minutes
        };
        Some(RestPrompt {
            minutes_on_rest: since_switch / 60,
            threshold_minutes: user_min,
        })
    }

    /// 记录一次已呈现的提醒
    pub fn record_fired(&mut self, now: DateTime<Utc>) {
        self.last_reminder = Some(now);
        self.reminder_count_today += 1;
    }

    /// 处理弹窗上的用户操作
    ///
    /// `Disable` 在这里没有效果，需要引擎去持久化策略开关并停掉定时器。
    pub fn apply_modal_action(&mut self, action: ModalAction, now: DateTime<Utc>) {
        match action {
            ModalAction::CloseOnce => {
                self.last_reminder = Some(now);
            }
            ModalAction::Snooze30 => {
                self.mute_until = Some(now + Duration::minutes(30));
                self.last_reminder = Some(now);
            }
            ModalAction::Disable => {}
        }
    }

    pub fn count_today(&self) -> u32 {
        self.reminder_count_today
    }
}

/// 提醒呈现通道
///
/// 核心只决定"要不要提醒"，具体呈现交给外部展示层。主通道投递失败
/// 时引擎退回系统通知。
pub trait RestPresenter: Send + Sync {
    fn present(&self, prompt: &RestPrompt) -> Result<()>;
}

/// 基于 mpsc 通道的呈现器：没有存活的接收方即视为投递失败
pub struct ChannelPresenter {
    tx: mpsc::UnboundedSender<RestPrompt>,
}

impl ChannelPresenter {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<RestPrompt>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl RestPresenter for ChannelPresenter {
    fn present(&self, prompt: &RestPrompt) -> Result<()> {
        self.tx
            .send(prompt.clone())
            .map_err(|_| anyhow!("no active rest prompt listener"))
    }
}

/// 系统通知兜底：保证可见性，本身不会失败
pub struct SystemNotifier;

impl RestPresenter for SystemNotifier {
    fn present(&self, prompt: &RestPrompt) -> Result<()> {
        info!(
            "Rest alarm: on a rest page for {} minutes (threshold: {} minutes)",
            prompt.minutes_on_rest, prompt.threshold_minutes
        );
        Ok(())
    }
}
