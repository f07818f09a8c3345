//! 查询/命令界面模块
//!
//! 展示层（弹窗/选项页/页面内脚本）与核心之间的请求应答协议：
//! 每个请求是一个带 `type` 标签的操作，应答统一携带 `ok` 标志。
//! 这里只定义协议类型，分发在引擎的事件循环里完成。

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::config::{Settings, Umbrella};
use crate::ledger::{DayStats, DomainPair, Range, Segment};
use crate::reminder::ModalAction;

/// 展示偏好（纯透传，核心不做业务判断）
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UiPrefs {
    pub pie_range: Range,
    pub show_category_table: bool,
    pub pairs_collapsed: bool,
    pub category_colors: BTreeMap<String, String>,
    pub time_zone: String,
}

impl UiPrefs {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            pie_range: settings.pie_range,
            show_category_table: settings.show_category_table,
            pairs_collapsed: settings.pairs_collapsed,
            category_colors: settings.category_colors.clone(),
            time_zone: settings.time_zone.clone(),
        }
    }
}

/// 展示偏好的部分更新
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct UiPrefsPatch {
    pub pie_range: Option<Range>,
    pub show_category_table: Option<bool>,
    pub pairs_collapsed: Option<bool>,
    pub category_colors: Option<BTreeMap<String, String>>,
    pub time_zone: Option<String>,
}

/// 请求操作
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub enum Request {
    #[serde(rename = "GET_TODAY_STATS")]
    GetTodayStats,
    #[serde(rename = "GET_STATS_RANGE_FINE")]
    GetStatsRangeFine { range: Option<Range> },
    #[serde(rename = "GET_TOP_DOMAIN_PAIRS_RANGE")]
    GetTopDomainPairsRange {
        range: Option<Range>,
        limit: Option<u32>,
    },
    #[serde(rename = "GET_TIMELINE_RANGE")]
    GetTimelineRange { range: Option<Range> },
    #[serde(rename = "RECLASSIFY_NOW")]
    ReclassifyNow,
    #[serde(rename = "GET_UI_PREFS")]
    GetUiPrefs,
    #[serde(rename = "SET_UI_PREFS")]
    SetUiPrefs { prefs: UiPrefsPatch },
    #[serde(rename = "GET_REST_ALARM")]
    GetRestAlarm,
    #[serde(rename = "SET_REST_ALARM")]
    SetRestAlarm { value: bool },
    #[serde(rename = "SET_MANUAL_CATEGORY")]
    SetManualCategory { category: String },
    #[serde(rename = "SET_CATEGORY_COLOR")]
    SetCategoryColor { name: String, color: String },
    #[serde(rename = "CLEAR_ALL_DATA")]
    ClearAllData,
    #[serde(rename = "REST_MODAL_ACTION")]
    RestModalAction { action: ModalAction },
    #[serde(rename = "GET_SETTINGS")]
    GetSettings,
    #[serde(rename = "UPDATE_SETTINGS")]
    UpdateSettings { settings: Settings },
}

/// 今日快照：当日聚合 + 实时分类状态
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TodaySnapshot {
    pub data: DayStats,
    pub category: String,
    pub umbrella: Umbrella,
    pub last_switch_ts: i64,
    pub current_domain: String,
}

/// 分类元信息（名字 + 伞类别）
#[derive(Debug, Clone, Serialize)]
pub struct CategoryMeta {
    pub name: String,
    pub umbrella: Umbrella,
}

/// 范围内按细分类汇总（按配置的分类补零）
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RangeFineStats {
    pub totals_fine: BTreeMap<String, u64>,
    pub range: Range,
    pub categories_meta: Vec<CategoryMeta>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TopPairsData {
    pub top_domain_pairs: Vec<DomainPair>,
    pub range: Range,
}

#[derive(Debug, Clone, Serialize)]
pub struct TimelineData {
    pub segs: Vec<Segment>,
    pub range: Range,
}

#[derive(Debug, Clone, Serialize)]
pub struct CategoryData {
    pub category: String,
}

/// 应答载荷
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum ResponseData {
    TodayStats(TodaySnapshot),
    RangeFine(RangeFineStats),
    TopPairs(TopPairsData),
    Timeline(TimelineData),
    Category(CategoryData),
    UiPrefs { prefs: UiPrefs },
    RestAlarm { enabled: bool },
    Cleared { cleared: usize },
    Settings { settings: Settings },
    Empty {},
}

/// 统一应答：`ok` 标志 + 错误串或载荷
#[derive(Debug, Clone, Serialize)]
pub struct Response {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(flatten, skip_serializing_if = "Option::is_none")]
    pub data: Option<ResponseData>,
}

impl Response {
    pub fn success(data: ResponseData) -> Self {
        Self {
            ok: true,
            error: None,
            data: Some(data),
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            ok: false,
            error: Some(error.into()),
            data: None,
        }
    }
}
