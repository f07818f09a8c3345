//! 时间记账模块
//!
//! 核心状态机：跟踪当前活跃的 (域名, 分类)，把经过的墙钟秒数结算进
//! 按天分片的聚合记录和仅追加的分段日志。
//!
//! 关键不变量：
//! - 先结算后切换：切换分类前必须先把已流逝的时间记给旧分类；
//! - 结算永不产生负增量，时钟回拨时增量取 0；
//! - 零增量结算是幂等空操作。

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, error};

use crate::config::{Settings, Umbrella};
use crate::store::{Namespace, Store};
use crate::time;

/// 日期键索引的存储键
pub const DAY_INDEX_KEY: &str = "segments:days";

/// 日期键索引的容量上限，超出时淘汰最旧的
pub const MAX_TRACKED_DAYS: usize = 400;

/// 查询时间范围
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Range {
    #[serde(rename = "1h")]
    OneHour,
    #[serde(rename = "1d")]
    OneDay,
    #[serde(rename = "7d")]
    SevenDays,
    #[serde(rename = "1mo")]
    OneMonth,
    #[serde(rename = "1y")]
    OneYear,
}

impl Default for Range {
    fn default() -> Self {
        Range::SevenDays
    }
}

impl Range {
    /// 范围覆盖的分片天数
    pub fn days(self) -> i64 {
        match self {
            Range::OneHour => 1,
            Range::OneDay => 1,
            Range::SevenDays => 7,
            Range::OneMonth => 30,
            Range::OneYear => 365,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Range::OneHour => "1h",
            Range::OneDay => "1d",
            Range::SevenDays => "7d",
            Range::OneMonth => "1mo",
            Range::OneYear => "1y",
        }
    }
}

/// 单个域名的当日累计
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DomainEntry {
    /// 最近一次结算时的分类（展示用，后写覆盖）
    pub category: String,
    pub umbrella: Umbrella,
    /// 累计秒数（只增）
    pub seconds: u64,
}

/// 每日统计记录，键为日期键
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DayStats {
    pub totals_umbrella: BTreeMap<Umbrella, u64>,
    pub totals_fine: BTreeMap<String, u64>,
    pub by_domain: BTreeMap<String, DomainEntry>,
}

impl DayStats {
    /// 三个视图的秒数总和应当一致（守恒性质）
    pub fn umbrella_total(&self) -> u64 {
        self.totals_umbrella.values().sum()
    }

    pub fn fine_total(&self) -> u64 {
        self.totals_fine.values().sum()
    }
}

/// 一次结算产生的分段记录（仅追加）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Segment {
    /// 结算时刻（Unix 毫秒）
    pub ts: i64,
    pub domain: String,
    pub category: String,
    pub umbrella: Umbrella,
    pub seconds: u64,
}

/// 进程内会话状态
///
/// 进程启动时零值构造，只被记账操作修改。
#[derive(Debug, Clone)]
pub struct SessionState {
    pub current_domain: String,
    pub current_category: String,
    /// 分类最近一次变化的时刻
    pub last_switch: DateTime<Utc>,
    /// 最近一次结算边界
    pub last_accrual: DateTime<Utc>,
}

impl SessionState {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            current_domain: "unknown".to_string(),
            current_category: "other".to_string(),
            last_switch: now,
            last_accrual: now,
        }
    }
}

/// 记账台账
pub struct Ledger {
    pub state: SessionState,
}

impl Ledger {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            state: SessionState::new(now),
        }
    }

    /// 结算：把自上次结算以来的整秒数记入当前 (域名, 分类)
    ///
    /// `last_accrual` 无条件推进到 `now`（单调，不回退）；时钟回拨时
    /// 增量取 0，静默吸收。返回结算的秒数。
    pub fn settle(
        &mut self,
        store: &Store,
        settings: &Settings,
        now: DateTime<Utc>,
    ) -> Result<u64> {
        let delta = (now - self.state.last_accrual).num_seconds().max(0) as u64;
        self.state.last_accrual = now;
        if delta == 0 {
            return Ok(0);
        }

        let day = time::day_key(&settings.time_zone, now);
        let fine = self.state.current_category.clone();
        let umbrella = settings.map_to_umbrella(&fine);
        let domain = self.state.current_domain.clone();

        // 聚合记录：按伞类别、细分类、域名三个维度累加
        let stats_key = format!("stats:{}", day);
        let mut stats: DayStats = store.get(Namespace::Local, &stats_key)?.unwrap_or_default();
        *stats.totals_umbrella.entry(umbrella).or_insert(0) += delta;
        *stats.totals_fine.entry(fine.clone()).or_insert(0) += delta;
        let entry = stats
            .by_domain
            .entry(domain.clone())
            .or_insert_with(|| DomainEntry {
                category: fine.clone(),
                umbrella,
                seconds: 0,
            });
        entry.category = fine.clone();
        entry.umbrella = umbrella;
        entry.seconds += delta;
        store.set(Namespace::Local, &stats_key, &stats)?;

        // 分段日志：每次结算追加一条
        let seg_key = format!("segments:{}", day);
        let mut segments: Vec<Segment> =
            store.get(Namespace::Local, &seg_key)?.unwrap_or_default();
        segments.push(Segment {
            ts: now.timestamp_millis(),
            domain: domain.clone(),
            category: fine.clone(),
            umbrella,
            seconds: delta,
        });
        store.set(Namespace::Local, &seg_key, &segments)?;

        self.register_day(store, &day)?;

        debug!(
            "Settled {}s to domain={} category={} day={}",
            delta, domain, fine, day
        );
        Ok(delta)
    }

    /// 把日期键登记进有界索引（缺席追加，超限淘汰最旧）
    fn register_day(&self, store: &Store, day: &str) -> Result<()> {
        let mut days: Vec<String> = store
            .get(Namespace::Local, DAY_INDEX_KEY)?
            .unwrap_or_default();
        if !days.iter().any(|d| d == day) {
            days.push(day.to_string());
        }
        while days.len() > MAX_TRACKED_DAYS {
            days.remove(0);
        }
        store.set(Namespace::Local, DAY_INDEX_KEY, &days)?;
        Ok(())
    }

    /// 分类切换：先结算（时间记给旧分类），再更新当前分类并重置两个时钟
    ///
    /// 返回是否发生了切换。
    pub fn apply_category(
        &mut self,
        store: &Store,
        settings: &Settings,
        fine: &str,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        if fine == self.state.current_category {
            return Ok(false);
        }
        if let Err(e) = self.settle(store, settings, now) {
            // 结算失败不阻塞切换，否则分类会卡在旧值上
            error!("Settle before category switch failed: {}", e);
        }
        self.state.current_category = fine.to_string();
        self.state.last_switch = now;
        self.state.last_accrual = now;
        Ok(true)
    }

    /// 域名切换：立即结算（时间记给旧域名下的当前分类），再更新域名
    ///
    /// 分类更新等分类管线解析完成后由 `apply_category` 完成。
    pub fn note_domain(
        &mut self,
        store: &Store,
        settings: &Settings,
        domain: &str,
        now: DateTime<Utc>,
    ) -> Result<()> {
        if !domain.is_empty() && domain != self.state.current_domain {
            self.settle(store, settings, now)?;
        }
        if !domain.is_empty() {
            self.state.current_domain = domain.to_string();
        }
        Ok(())
    }

    /// 仅重置结算时钟（批量清空数据后调用，当前域名/分类保持不变）
    pub fn reset_accrual_clock(&mut self, now: DateTime<Utc>) {
        self.state.last_accrual = now;
    }
}

/// 读取某一天的聚合记录（缺失时返回空记录）
pub fn load_day_stats(store: &Store, settings: &Settings, now: DateTime<Utc>) -> Result<DayStats> {
    let key = format!("stats:{}", time::day_key(&settings.time_zone, now));
    Ok(store.get(Namespace::Local, &key)?.unwrap_or_default())
}

/// 收集范围窗口内的全部分段，按时间戳升序
///
/// 窗口按尾随 N 天的分片枚举；`1h` 取一天的分片再按最近一小时过滤。
pub fn collect_segments(
    store: &Store,
    settings: &Settings,
    range: Range,
    now: DateTime<Utc>,
) -> Result<Vec<Segment>> {
    let mut out = Vec::new();
    for i in 0..range.days() {
        let day = time::day_key_days_back(&settings.time_zone, now, i);
        let key = format!("segments:{}", day);
        let segments: Vec<Segment> = store.get(Namespace::Local, &key)?.unwrap_or_default();
        out.extend(segments);
    }
    if range == Range::OneHour {
        let cutoff = (now - Duration::hours(1)).timestamp_millis();
        out.retain(|s| s.ts >= cutoff);
    }
    out.sort_by_key(|s| s.ts);
    Ok(out)
}

/// 范围窗口内按细分类汇总的秒数
pub fn range_totals(
    store: &Store,
    settings: &Settings,
    range: Range,
    now: DateTime<Utc>,
) -> Result<BTreeMap<String, u64>> {
    let mut totals = BTreeMap::new();
    for segment in collect_segments(store, settings, range, now)? {
        *totals.entry(segment.category).or_insert(0) += segment.seconds;
    }
    Ok(totals)
}

/// (域名, 分类) 排行条目
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DomainPair {
    pub domain: String,
    pub fine: String,
    pub umbrella: Umbrella,
    pub seconds: u64,
}

/// 范围窗口内按 (域名, 分类) 聚合的秒数排行，降序截断到 limit
///
/// limit 被钳制到 [1, 50]。
pub fn top_domain_pairs(
    store: &Store,
    settings: &Settings,
    range: Range,
    limit: u32,
    now: DateTime<Utc>,
) -> Result<Vec<DomainPair>> {
    let limit = limit.clamp(1, 50) as usize;
    let mut by_pair: BTreeMap<(String, String), u64> = BTreeMap::new();
    for segment in collect_segments(store, settings, range, now)? {
        *by_pair
            .entry((segment.domain, segment.category))
            .or_insert(0) += segment.seconds;
    }
    let mut pairs: Vec<DomainPair> = by_pair
        .into_iter()
        .map(|((domain, fine), seconds)| DomainPair {
            umbrella: settings.map_to_umbrella(&fine),
            domain,
            fine,
            seconds,
        })
        .collect();
    pairs.sort_by(|a, b| b.seconds.cmp(&a.seconds));
    pairs.truncate(limit);
    Ok(pairs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn utc_settings() -> Settings {
        Settings {
            time_zone: "UTC".to_string(),
            ..Settings::default()
        }
    }

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 15, 12, 0, 0).unwrap() + Duration::seconds(secs)
    }

    #[test]
    fn test_settle_accrues_to_current_pair() {
        let store = Store::open_in_memory().unwrap();
        let settings = utc_settings();
        let mut ledger = Ledger::new(at(0));
        ledger.state.current_domain = "github.com".to_string();
        ledger.state.current_category = "work".to_string();

        let delta = ledger.settle(&store, &settings, at(10)).unwrap();
        assert_eq!(delta, 10);

        let stats = load_day_stats(&store, &settings, at(10)).unwrap();
        assert_eq!(stats.totals_fine.get("work"), Some(&10));
        assert_eq!(stats.totals_umbrella.get(&Umbrella::Work), Some(&10));
        assert_eq!(stats.by_domain.get("github.com").unwrap().seconds, 10);
    }

    #[test]
    fn test_settle_never_negative() {
        let store = Store::open_in_memory().unwrap();
        let settings = utc_settings();
        let mut ledger = Ledger::new(at(100));

        // 时钟回拨：增量为 0，但结算边界仍推进
        let delta = ledger.settle(&store, &settings, at(50)).unwrap();
        assert_eq!(delta, 0);
        assert_eq!(ledger.state.last_accrual, at(50));

        let stats = load_day_stats(&store, &settings, at(50)).unwrap();
        assert_eq!(stats.fine_total(), 0);
    }

    #[test]
    fn test_zero_delta_settle_is_idempotent() {
        let store = Store::open_in_memory().unwrap();
        let settings = utc_settings();
        let mut ledger = Ledger::new(at(0));

        ledger.settle(&store, &settings, at(5)).unwrap();
        let before = load_day_stats(&store, &settings, at(5)).unwrap();
        ledger.settle(&store, &settings, at(5)).unwrap();
        let after = load_day_stats(&store, &settings, at(5)).unwrap();
        assert_eq!(before.fine_total(), after.fine_total());

        let segments = collect_segments(&store, &settings, Range::OneDay, at(5)).unwrap();
        assert_eq!(segments.len(), 1);
    }

    #[test]
    fn test_switch_credits_old_category_first() {
        let store = Store::open_in_memory().unwrap();
        let settings = utc_settings();
        let mut ledger = Ledger::new(at(0));
        ledger.state.current_category = "work".to_string();

        // work 活跃 10 秒后切到 entertainment
        let switched = ledger
            .apply_category(&store, &settings, "entertainment", at(10))
            .unwrap();
        assert!(switched);
        assert_eq!(ledger.state.last_switch, at(10));

        // entertainment 从切换时刻起计
        ledger.settle(&store, &settings, at(25)).unwrap();

        let stats = load_day_stats(&store, &settings, at(25)).unwrap();
        assert_eq!(stats.totals_fine.get("work"), Some(&10));
        assert_eq!(stats.totals_fine.get("entertainment"), Some(&15));
    }

    #[test]
    fn test_same_category_is_noop() {
        let store = Store::open_in_memory().unwrap();
        let settings = utc_settings();
        let mut ledger = Ledger::new(at(0));
        ledger.state.current_category = "work".to_string();

        let switched = ledger.apply_category(&store, &settings, "work", at(10)).unwrap();
        assert!(!switched);
        // 时钟不动，时间继续归属同一分类
        assert_eq!(ledger.state.last_accrual, at(0));
    }

    #[test]
    fn test_conservation_across_switches() {
        let store = Store::open_in_memory().unwrap();
        let settings = utc_settings();
        let mut ledger = Ledger::new(at(0));
        ledger.state.current_domain = "a.com".to_string();
        ledger.state.current_category = "work".to_string();

        ledger.settle(&store, &settings, at(7)).unwrap();
        ledger.apply_category(&store, &settings, "social", at(12)).unwrap();
        ledger.note_domain(&store, &settings, "b.com", at(20)).unwrap();
        ledger.apply_category(&store, &settings, "entertainment", at(33)).unwrap();
        ledger.settle(&store, &settings, at(60)).unwrap();

        let stats = load_day_stats(&store, &settings, at(60)).unwrap();
        let segments = collect_segments(&store, &settings, Range::OneDay, at(60)).unwrap();
        let segment_total: u64 = segments.iter().map(|s| s.seconds).sum();

        assert_eq!(stats.fine_total(), 60);
        assert_eq!(stats.umbrella_total(), 60);
        assert_eq!(segment_total, 60);
    }

    #[test]
    fn test_domain_switch_settles_to_old_domain() {
        let store = Store::open_in_memory().unwrap();
        let settings = utc_settings();
        let mut ledger = Ledger::new(at(0));
        ledger.state.current_domain = "old.com".to_string();
        ledger.state.current_category = "work".to_string();

        ledger.note_domain(&store, &settings, "new.com", at(8)).unwrap();
        assert_eq!(ledger.state.current_domain, "new.com");

        let stats = load_day_stats(&store, &settings, at(8)).unwrap();
        assert_eq!(stats.by_domain.get("old.com").unwrap().seconds, 8);
        assert!(stats.by_domain.get("new.com").is_none());
    }

    #[test]
    fn test_by_domain_display_fields_last_write_wins() {
        let store = Store::open_in_memory().unwrap();
        let settings = utc_settings();
        let mut ledger = Ledger::new(at(0));
        ledger.state.current_domain = "site.com".to_string();
        ledger.state.current_category = "work".to_string();

        ledger.settle(&store, &settings, at(10)).unwrap();
        ledger.apply_category(&store, &settings, "social", at(10)).unwrap();
        ledger.settle(&store, &settings, at(30)).unwrap();

        let stats = load_day_stats(&store, &settings, at(30)).unwrap();
        let entry = stats.by_domain.get("site.com").unwrap();
        // 秒数累加，展示字段取最近一次
        assert_eq!(entry.seconds, 30);
        assert_eq!(entry.category, "social");
        assert_eq!(entry.umbrella, Umbrella::Rest);
    }

    #[test]
    fn test_day_index_bounded_at_400() {
        let store = Store::open_in_memory().unwrap();
        let settings = utc_settings();
        let mut ledger = Ledger::new(at(0));

        // 401 个不同日历日各结算一次
        for i in 0..401 {
            let now = at(0) + Duration::days(i);
            ledger.settle(&store, &settings, now).unwrap();
        }

        let days: Vec<String> = store
            .get(Namespace::Local, DAY_INDEX_KEY)
            .unwrap()
            .unwrap();
        assert_eq!(days.len(), MAX_TRACKED_DAYS);
        // 最旧的（第 0 天）被淘汰
        assert_eq!(days.first().map(String::as_str), Some("2024-06-16"));
    }

    #[test]
    fn test_one_hour_range_filters_by_timestamp() {
        let store = Store::open_in_memory().unwrap();
        let settings = utc_settings();
        let mut ledger = Ledger::new(at(0));

        ledger.settle(&store, &settings, at(60)).unwrap(); // 早于窗口
        ledger.settle(&store, &settings, at(4000)).unwrap(); // 窗口内

        let now = at(4100);
        let segments = collect_segments(&store, &settings, Range::OneHour, now).unwrap();
        assert_eq!(segments.len(), 1);
        assert_eq!(segments[0].ts, at(4000).timestamp_millis());

        let all = collect_segments(&store, &settings, Range::OneDay, now).unwrap();
        assert_eq!(all.len(), 2);
    }

    #[test]
    fn test_top_domain_pairs_sorted_and_clamped() {
        let store = Store::open_in_memory().unwrap();
        let settings = utc_settings();
        let mut ledger = Ledger::new(at(0));

        ledger.state.current_domain = "a.com".to_string();
        ledger.state.current_category = "work".to_string();
        ledger.settle(&store, &settings, at(10)).unwrap();

        ledger.state.current_domain = "b.com".to_string();
        ledger.state.current_category = "entertainment".to_string();
        ledger.settle(&store, &settings, at(40)).unwrap();

        let pairs = top_domain_pairs(&store, &settings, Range::OneDay, 10, at(41)).unwrap();
        assert_eq!(pairs.len(), 2);
        assert_eq!(pairs[0].domain, "b.com");
        assert_eq!(pairs[0].seconds, 30);
        assert_eq!(pairs[0].umbrella, Umbrella::Rest);

        // limit 为 0 时钳制到 1
        let clamped = top_domain_pairs(&store, &settings, Range::OneDay, 0, at(41)).unwrap();
        assert_eq!(clamped.len(), 1);
    }

    #[test]
    fn test_range_totals_by_fine_category() {
        let store = Store::open_in_memory().unwrap();
        let settings = utc_settings();
        let mut ledger = Ledger::new(at(0));
        ledger.state.current_category = "work".to_string();

        ledger.settle(&store, &settings, at(10)).unwrap();
        ledger.apply_category(&store, &settings, "social", at(10)).unwrap();
        ledger.settle(&store, &settings, at(18)).unwrap();

        let totals = range_totals(&store, &settings, Range::SevenDays, at(20)).unwrap();
        assert_eq!(totals.get("work"), Some(&10));
        assert_eq!(totals.get("social"), Some(&8));
    }

    #[test]
    fn test_range_serde_tokens() {
        assert_eq!(serde_json::to_string(&Range::OneHour).unwrap(), "\"1h\"");
        assert_eq!(serde_json::to_string(&Range::OneMonth).unwrap(), "\"1mo\"");
        let parsed: Range = serde_json::from_str("\"7d\"").unwrap();
        assert_eq!(parsed, Range::SevenDays);
    }
}
