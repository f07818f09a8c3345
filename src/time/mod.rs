//! 时区与日期键模块
//!
//! 所有按天分片的统计记录都以"本地日历日"为键（`YYYY-MM-DD`）。
//! 日期键通过 chrono-tz 的本地化转换计算，在夏令时切换时保持稳定。

use chrono::{DateTime, Duration, Utc};
use chrono_tz::Tz;
use tracing::warn;

/// 校验时区标识符，非法时回退到 UTC
///
/// 总函数，永不失败。
pub fn normalize_time_zone(tz: &str) -> Tz {
    let s = if tz.is_empty() { "UTC" } else { tz };
    match s.parse::<Tz>() {
        Ok(tz) => tz,
        Err(_) => {
            warn!("Invalid time zone '{}', falling back to UTC", s);
            Tz::UTC
        }
    }
}

/// 计算给定时刻在给定时区下的日期键（`YYYY-MM-DD`）
pub fn day_key(tz: &str, instant: DateTime<Utc>) -> String {
    let zone = normalize_time_zone(tz);
    instant.with_timezone(&zone).format("%Y-%m-%d").to_string()
}

/// 计算 `now` 往前第 n 天（按 24 小时回拨）的日期键
///
/// 范围查询用它枚举最近 N 天的分片键。
pub fn day_key_days_back(tz: &str, now: DateTime<Utc>, n: i64) -> String {
    day_key(tz, now - Duration::days(n))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_normalize_valid_zone() {
        assert_eq!(normalize_time_zone("America/Chicago"), chrono_tz::America::Chicago);
        assert_eq!(normalize_time_zone("Asia/Shanghai"), chrono_tz::Asia::Shanghai);
    }

    #[test]
    fn test_normalize_invalid_zone_falls_back() {
        assert_eq!(normalize_time_zone("Mars/Olympus"), Tz::UTC);
        assert_eq!(normalize_time_zone(""), Tz::UTC);
    }

    #[test]
    fn test_day_key_crosses_midnight_locally() {
        // 2024-01-02 03:00 UTC = 2024-01-01 21:00 在芝加哥
        let instant = Utc.with_ymd_and_hms(2024, 1, 2, 3, 0, 0).unwrap();
        assert_eq!(day_key("America/Chicago", instant), "2024-01-01");
        assert_eq!(day_key("UTC", instant), "2024-01-02");
    }

    #[test]
    fn test_day_key_stable_across_dst() {
        // 芝加哥 2024-03-10 02:00 本地进入夏令时
        let before = Utc.with_ymd_and_hms(2024, 3, 10, 7, 59, 0).unwrap(); // 01:59 CST
        let after = Utc.with_ymd_and_hms(2024, 3, 10, 8, 1, 0).unwrap(); // 03:01 CDT
        assert_eq!(day_key("America/Chicago", before), "2024-03-10");
        assert_eq!(day_key("America/Chicago", after), "2024-03-10");
    }

    #[test]
    fn test_day_key_days_back() {
        let now = Utc.with_ymd_and_hms(2024, 6, 15, 12, 0, 0).unwrap();
        assert_eq!(day_key_days_back("UTC", now, 0), "2024-06-15");
        assert_eq!(day_key_days_back("UTC", now, 1), "2024-06-14");
        assert_eq!(day_key_days_back("UTC", now, 7), "2024-06-08");
    }
}
