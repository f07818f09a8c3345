//! 内建分类启发式
//!
//! 对 URL/域名/标题 做关键词签名匹配，签名集合刻意偏向给出非 "other"
//! 的答案。所有匹配都在小写文本上进行，返回值一律是配置中的规范分类名。

use once_cell::sync::Lazy;
use regex::Regex;

use crate::config::{Settings, Umbrella};

static ENTERTAINMENT_SITES: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"youtube|bilibili|twitch|netflix|iqiyi|youku|spotify|music\.apple\.com|soundcloud|vimeo|hulu|disneyplus|steamcommunity|store\.steampowered\.com|epicgames|douyin|tiktok|nico.*video",
    )
    .unwrap()
});

static SOCIAL_SITES: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"twitter|x\.com|weibo|reddit|facebook|instagram").unwrap());

static WORK_SITES: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"docs\.google|drive\.google|notion|confluence|jira|github|gitlab|figma|slack|linear|asana|microsoft\.sharepoint",
    )
    .unwrap()
});

static STUDY_SITES: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"wikipedia|arxiv|khanacademy|coursera|udemy|edx|brilliant|mit\.edu/open|classroom\.google")
        .unwrap()
});

static UTILITY_SITES: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"mail\.google|outlook\.live|calendar\.google|maps\.google|bank|alipay|paypal|wise\.com|booking|airbnb|map\.",
    )
    .unwrap()
});

/// 识别"英语/语言学习"类自定义分类名
static ENGLISH_LIKE_NAME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)english|language.*learn|learn.*english").unwrap());

static ENGLISH_LEARNING_SITES: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"duolingo|bbc\.co\.uk/learningenglish|ef\.com|ielts|toefl|voa.*learning|quizlet|dictionary\.cambridge|deepl|youglish",
    )
    .unwrap()
});

// 反 "other" 兜底使用的较窄签名集
static AO_ENTERTAINMENT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"youtube|bilibili|twitch|netflix|iqiyi|youku|spotify|music\.apple\.com|soundcloud|hulu|disneyplus|steam|epicgames|douyin|tiktok|nico.*video",
    )
    .unwrap()
});

static AO_SOCIAL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"twitter|x\.com|weibo|reddit|facebook|instagram").unwrap());

static AO_WORK: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"docs\.google|drive\.google|notion|confluence|jira|github|gitlab|figma|slack|linear")
        .unwrap()
});

static AO_STUDY: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"wikipedia|arxiv|khanacademy|coursera|udemy|edx|brilliant").unwrap());

static AO_UTILITY: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"mail\.google|outlook\.live|calendar\.google|maps\.google|bank|alipay|paypal|wise\.com")
        .unwrap()
});

fn is_rest(settings: &Settings, name: &str) -> bool {
    settings.map_to_umbrella(name) == Umbrella::Rest
}

/// 把任意分类名规范化为配置中的名字，未命中归 "other"
pub fn normalize_to_configured(name: &str, settings: &Settings) -> String {
    settings
        .canonical_category(name)
        .unwrap_or("other")
        .to_string()
}

/// 关键词/域名启发式
///
/// 命中时返回配置中的规范分类名；未命中返回 None。
pub fn heuristic_category(url: &str, title: &str, settings: &Settings) -> Option<String> {
    let u = url.to_lowercase();
    let t = title.to_lowercase();
    let text = format!("{}{}", u, t);

    // 用户自定义的语言学习类分类优先
    if let Some(english_like) = settings
        .category_names()
        .into_iter()
        .find(|name| ENGLISH_LIKE_NAME.is_match(name))
    {
        if ENGLISH_LEARNING_SITES.is_match(&text) {
            return Some(english_like.to_string());
        }
    }

    if ENTERTAINMENT_SITES.is_match(&text) {
        if let Some(name) = settings.canonical_category("entertainment") {
            if is_rest(settings, name) {
                return Some(name.to_string());
            }
        }
        if let Some(name) = settings.canonical_category("social") {
            if is_rest(settings, name) {
                return Some(name.to_string());
            }
        }
        if let Some(any_rest) = settings.rest_categories().first() {
            return Some(any_rest.to_string());
        }
    }

    if SOCIAL_SITES.is_match(&text) {
        if let Some(name) = settings.canonical_category("social") {
            if is_rest(settings, name) {
                return Some(name.to_string());
            }
        }
    }

    if WORK_SITES.is_match(&text) {
        if let Some(name) = settings.canonical_category("work") {
            return Some(name.to_string());
        }
    }
    if STUDY_SITES.is_match(&text) {
        if let Some(name) = settings.canonical_category("study") {
            return Some(name.to_string());
        }
    }
    if UTILITY_SITES.is_match(&text) {
        if let Some(name) = settings.canonical_category("utility") {
            return Some(name.to_string());
        }
    }

    // 最后：分类名本身出现在 URL 或标题里
    for name in settings.category_names() {
        let lower = name.to_lowercase();
        if lower.is_empty() || lower == "other" {
            continue;
        }
        if u.contains(&lower) || t.contains(&lower) {
            return Some(name.to_string());
        }
    }
    None
}

/// 反 "other" 兜底：针对娱乐味道明显的域名，偏向返回 rest 伞下的分类
pub fn anti_other_fallback(url: &str, title: &str, settings: &Settings) -> Option<String> {
    let text = format!("{}{}", url.to_lowercase(), title.to_lowercase());
    let rest_cats = settings.rest_categories();

    if AO_ENTERTAINMENT.is_match(&text) {
        if let Some(name) = settings.canonical_category("entertainment") {
            if is_rest(settings, name) {
                return Some(name.to_string());
            }
        }
        if let Some(name) = settings.canonical_category("social") {
            if is_rest(settings, name) {
                return Some(name.to_string());
            }
        }
        if let Some(first_rest) = rest_cats.first() {
            return Some(first_rest.to_string());
        }
    }
    if AO_SOCIAL.is_match(&text) {
        if let Some(name) = settings.canonical_category("social") {
            return Some(name.to_string());
        }
    }
    if AO_WORK.is_match(&text) {
        if let Some(name) = settings.canonical_category("work") {
            return Some(name.to_string());
        }
    }
    if AO_STUDY.is_match(&text) {
        if let Some(name) = settings.canonical_category("study") {
            return Some(name.to_string());
        }
    }
    if AO_UTILITY.is_match(&text) {
        if let Some(name) = settings.canonical_category("utility") {
            return Some(name.to_string());
        }
    }
    None
}

/// 自定义分类名直接命中：名字的全部词元都出现在 URL/域名/标题文本里
///
/// 名字越长越优先，避免 "work" 截胡 "deep work"。
pub fn pick_custom_category(
    url: &str,
    domain: &str,
    title: &str,
    settings: &Settings,
) -> Option<String> {
    let text = format!("{} {} {}", url, domain, title).to_lowercase();
    let mut names = settings.category_names();
    names.sort_by_key(|n| std::cmp::Reverse(n.len()));

    static SEPARATORS: Lazy<Regex> = Lazy::new(|| Regex::new(r"[_-]+").unwrap());
    for name in names {
        let normalized = SEPARATORS.replace_all(&name.to_lowercase(), " ").to_string();
        let tokens: Vec<&str> = normalized.split_whitespace().collect();
        if tokens.is_empty() {
            continue;
        }
        let all_hit = tokens.iter().all(|token| text.contains(token));
        if all_hit || text.contains(&normalized) {
            return Some(name.to_string());
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CategoryConfig;

    #[test]
    fn test_entertainment_site_maps_to_rest_category() {
        let settings = Settings::default();
        let hit = heuristic_category("https://www.youtube.com/watch?v=x", "some video", &settings);
        assert_eq!(hit.as_deref(), Some("entertainment"));
    }

    #[test]
    fn test_entertainment_without_entertainment_category_picks_any_rest() {
        let mut settings = Settings::default();
        settings.categories_config = vec![
            CategoryConfig::new("work", Umbrella::Work),
            CategoryConfig::new("chill", Umbrella::Rest),
            CategoryConfig::new("other", Umbrella::Other),
        ];
        let hit = heuristic_category("https://netflix.com/browse", "", &settings);
        assert_eq!(hit.as_deref(), Some("chill"));
    }

    #[test]
    fn test_work_site() {
        let settings = Settings::default();
        let hit = heuristic_category("https://github.com/user/repo", "Readme", &settings);
        assert_eq!(hit.as_deref(), Some("work"));
    }

    #[test]
    fn test_category_name_in_title_matches() {
        let settings = Settings::default();
        let hit = heuristic_category("https://example.com", "my study notes", &settings);
        assert_eq!(hit.as_deref(), Some("study"));
    }

    #[test]
    fn test_english_like_custom_category() {
        let mut settings = Settings::default();
        settings
            .categories_config
            .insert(0, CategoryConfig::new("English Learning", Umbrella::Work));
        let hit = heuristic_category("https://www.duolingo.com/lesson", "", &settings);
        assert_eq!(hit.as_deref(), Some("English Learning"));
    }

    #[test]
    fn test_anti_other_prefers_rest() {
        let settings = Settings::default();
        let hit = anti_other_fallback("https://store.steampowered.com/app/1", "", &settings);
        assert_eq!(hit.as_deref(), Some("entertainment"));

        let miss = anti_other_fallback("https://unknown.example", "plain page", &settings);
        assert!(miss.is_none());
    }

    #[test]
    fn test_pick_custom_category_tokens() {
        let mut settings = Settings::default();
        settings
            .categories_config
            .push(CategoryConfig::new("deep-work", Umbrella::Work));
        let hit = pick_custom_category(
            "https://blog.example.com/deep-work-rituals",
            "blog.example.com",
            "Deep work rituals",
            &settings,
        );
        assert_eq!(hit.as_deref(), Some("deep-work"));
    }

    #[test]
    fn test_normalize_to_configured() {
        let settings = Settings::default();
        assert_eq!(normalize_to_configured("WORK", &settings), "work");
        assert_eq!(normalize_to_configured("gaming", &settings), "other");
    }
}
