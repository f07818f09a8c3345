//! 分类管线模块
//!
//! 把 (URL, 标题) 解析为一个细分类，策略级联，先命中者先赢：
//! 域名缓存 → 自定义分类名匹配 → 学习规则 → 关键词启发式 →
//! 无密钥兜底 → 远程推理（多模型试探）→ 总兜底。
//!
//! 任何出口的分类名都会规范化到当前配置的分类集合内（大小写不敏感，
//! 未知一律归 "other"）；管线整体带有明确的反 "other" 倾向。

pub mod gemini;
pub mod heuristics;

use serde::Serialize;
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::Settings;
use gemini::{GeminiClient, SuggestedRule};

/// 域名缓存有效期（毫秒）
const CACHE_TTL_MS: i64 = 10 * 60 * 1000;

/// 待分类的页面
#[derive(Debug, Clone)]
pub struct PageInfo {
    pub url: String,
    pub title: String,
}

impl PageInfo {
    pub fn new(url: &str, title: &str) -> Self {
        Self {
            url: url.to_string(),
            title: title.to_string(),
        }
    }
}

/// 分类结果
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Classification {
    pub category: String,
    pub reason: String,
    pub confidence: f64,
    /// 是否来自域名缓存
    pub cached: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suggested_rule: Option<SuggestedRule>,
}

struct CacheEntry {
    category: String,
    /// 写入时刻（Unix 毫秒）
    ts_ms: i64,
}

/// 分类器
///
/// 进程内唯一实例，持有远程客户端和域名结果缓存。缓存只存在于
/// 内存里，配置变化时整体失效，重启后从零重建。
pub struct Classifier {
    gemini: GeminiClient,
    cache: Mutex<HashMap<String, CacheEntry>>,
}

impl Classifier {
    pub fn new() -> Self {
        Self {
            gemini: GeminiClient::new(),
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// 从 URL 提取域名，解析失败返回 "unknown"
    pub fn extract_domain(url: &str) -> String {
        reqwest::Url::parse(url)
            .ok()
            .and_then(|u| u.host_str().map(|h| h.to_string()))
            .unwrap_or_else(|| "unknown".to_string())
    }

    fn get_cached(&self, domain: &str) -> Option<String> {
        let cache = self.cache.lock().unwrap();
        let entry = cache.get(domain)?;
        let now_ms = chrono::Utc::now().timestamp_millis();
        if now_ms - entry.ts_ms < CACHE_TTL_MS {
            Some(entry.category.clone())
        } else {
            None
        }
    }

    fn put_cached(&self, domain: &str, category: &str) {
        let mut cache = self.cache.lock().unwrap();
        cache.insert(
            domain.to_string(),
            CacheEntry {
                category: category.to_string(),
                ts_ms: chrono::Utc::now().timestamp_millis(),
            },
        );
    }

    /// 整体清空缓存（分类配置变化时调用）
    pub fn invalidate_cache(&self) {
        let mut cache = self.cache.lock().unwrap();
        let size = cache.len();
        cache.clear();
        if size > 0 {
            info!("Domain cache invalidated ({} entries)", size);
        }
    }

    /// 解析入口：缓存与自定义名匹配先行，然后进入级联管线
    ///
    /// 成功的解析结果写回域名缓存。
    pub async fn resolve(&self, page: &PageInfo, settings: &Settings) -> Classification {
        let domain = Self::extract_domain(&page.url);

        if let Some(category) = self.get_cached(&domain) {
            debug!("Cache hit for {}: {}", domain, category);
            return Classification {
                category,
                reason: "cache".to_string(),
                confidence: 1.0,
                cached: true,
                suggested_rule: None,
            };
        }

        let result = if let Some(custom) =
            heuristics::pick_custom_category(&page.url, &domain, &page.title, settings)
        {
            Classification {
                category: custom,
                reason: "custom name match".to_string(),
                confidence: 0.9,
                cached: false,
                suggested_rule: None,
            }
        } else {
            self.classify_page(page, &domain, settings).await
        };

        self.put_cached(&domain, &result.category);
        result
    }

    /// 级联管线：学习规则 → 启发式 → 无密钥兜底 → 远程推理 → 总兜底
    async fn classify_page(
        &self,
        page: &PageInfo,
        domain: &str,
        settings: &Settings,
    ) -> Classification {
        // A) 学习规则：目标分类必须仍然有效
        if let Some(rule_target) = settings.learned_rules.get(domain) {
            if let Some(canonical) = settings.canonical_category(rule_target) {
                return Classification {
                    category: canonical.to_string(),
                    reason: "learned rule".to_string(),
                    confidence: 1.0,
                    cached: false,
                    suggested_rule: None,
                };
            }
        }

        // B) 关键词启发式
        if let Some(hit) = heuristics::heuristic_category(&page.url, &page.title, settings) {
            let category = heuristics::normalize_to_configured(&hit, settings);
            return Classification {
                suggested_rule: Some(SuggestedRule {
                    apply: true,
                    domain: domain.to_string(),
                    category: category.clone(),
                    rule_type: "whitelist".to_string(),
                }),
                category,
                reason: "heuristic match".to_string(),
                confidence: 0.9,
                cached: false,
            };
        }

        // C) 未配置密钥：反 "other" 兜底
        if settings.api_key.is_empty() {
            let guess = heuristics::anti_other_fallback(&page.url, &page.title, settings);
            let (category, confidence) = match guess {
                Some(g) => (g, 0.6),
                None => ("other".to_string(), 0.0),
            };
            return Classification {
                category,
                reason: "no api key".to_string(),
                confidence,
                cached: false,
                suggested_rule: None,
            };
        }

        // D) 远程推理：按去重后的 (版本, 模型) 列表依次试探
        let categories: Vec<String> = settings
            .category_names()
            .into_iter()
            .map(|s| s.to_string())
            .collect();
        let rest_categories: Vec<String> = settings
            .rest_categories()
            .into_iter()
            .map(|s| s.to_string())
            .collect();
        let prompt =
            gemini::build_prompt(&page.url, &page.title, domain, &categories, &rest_categories);

        for (version, model) in trial_models(settings) {
            match self
                .gemini
                .generate(version, &model, &settings.api_key, &prompt)
                .await
            {
                Ok(verdict) => {
                    let mut category = verdict.category;
                    if settings.canonical_category(&category).is_none() {
                        category = "other".to_string();
                    }
                    // 模型给出 "other" 时，先让启发式和兜底再试一轮
                    if category.eq_ignore_ascii_case("other") {
                        if let Some(guess) =
                            heuristics::heuristic_category(&page.url, &page.title, settings)
                                .or_else(|| {
                                    heuristics::anti_other_fallback(
                                        &page.url,
                                        &page.title,
                                        settings,
                                    )
                                })
                        {
                            category = guess;
                        }
                    }
                    return Classification {
                        category: heuristics::normalize_to_configured(&category, settings),
                        reason: if verdict.reason.is_empty() {
                            "LLM".to_string()
                        } else {
                            verdict.reason
                        },
                        confidence: verdict.confidence,
                        cached: false,
                        suggested_rule: Some(verdict.suggested_rule),
                    };
                }
                Err(e) => {
                    warn!("Model {} failed: {}", model, e);
                }
            }
        }

        // E) 总兜底
        let guess = heuristics::heuristic_category(&page.url, &page.title, settings)
            .or_else(|| heuristics::anti_other_fallback(&page.url, &page.title, settings));
        let (category, confidence) = match guess {
            Some(g) => (heuristics::normalize_to_configured(&g, settings), 0.6),
            None => ("other".to_string(), 0.1),
        };
        Classification {
            category,
            reason: "fallback".to_string(),
            confidence,
            cached: false,
            suggested_rule: None,
        }
    }
}

impl Default for Classifier {
    fn default() -> Self {
        Self::new()
    }
}

/// 推理试探列表：用户配置的模型优先，再接两个内建回退模型，去重
fn trial_models(settings: &Settings) -> Vec<(&'static str, String)> {
    let mut trials = Vec::new();
    let user_model = settings.model.trim();
    if !user_model.is_empty() {
        trials.push(("v1", user_model.to_string()));
    }
    trials.push(("v1", "gemini-2.0-flash".to_string()));
    trials.push(("v1", "gemini-2.0-pro".to_string()));

    let mut seen = std::collections::HashSet::new();
    trials.retain(|(ver, model)| seen.insert(format!("{}:{}", ver, model)));
    trials
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_domain() {
        assert_eq!(
            Classifier::extract_domain("https://www.youtube.com/watch?v=x"),
            "www.youtube.com"
        );
        assert_eq!(Classifier::extract_domain("not a url"), "unknown");
    }

    #[test]
    fn test_trial_models_dedupe() {
        let mut settings = Settings::default();
        settings.model = "gemini-2.0-flash".to_string();
        let trials = trial_models(&settings);
        assert_eq!(trials.len(), 2);
        assert_eq!(trials[0].1, "gemini-2.0-flash");
        assert_eq!(trials[1].1, "gemini-2.0-pro");

        settings.model = "  custom-model ".to_string();
        let trials = trial_models(&settings);
        assert_eq!(trials.len(), 3);
        assert_eq!(trials[0].1, "custom-model");
    }

    #[tokio::test]
    async fn test_learned_rule_is_deterministic() {
        let classifier = Classifier::new();
        let mut settings = Settings::default();
        settings
            .learned_rules
            .insert("example.com".to_string(), "work".to_string());

        for title in ["", "Totally unrelated video", "whatever"] {
            classifier.invalidate_cache();
            let page = PageInfo::new("https://example.com/some/path", title);
            let result = classifier.resolve(&page, &settings).await;
            assert_eq!(result.category, "work");
            assert_eq!(result.reason, "learned rule");
            assert_eq!(result.confidence, 1.0);
        }
    }

    #[tokio::test]
    async fn test_learned_rule_with_stale_target_is_skipped() {
        let classifier = Classifier::new();
        let mut settings = Settings::default();
        settings
            .learned_rules
            .insert("plain.example".to_string(), "defunct".to_string());

        let page = PageInfo::new("https://plain.example/", "nondescript");
        let result = classifier.resolve(&page, &settings).await;
        // 规则目标已不是有效分类，落到无密钥兜底
        assert_eq!(result.reason, "no api key");
        assert_eq!(result.category, "other");
        assert_eq!(result.confidence, 0.0);
    }

    #[tokio::test]
    async fn test_anti_other_bias_without_credentials() {
        let classifier = Classifier::new();
        let settings = Settings::default();

        let page = PageInfo::new("https://www.youtube.com/watch?v=x", "some video");
        let result = classifier.resolve(&page, &settings).await;
        assert_eq!(result.category, "entertainment");
        assert_ne!(result.category, "other");
        assert_eq!(result.reason, "heuristic match");
        assert_eq!(result.confidence, 0.9);

        let rule = result.suggested_rule.unwrap();
        assert!(rule.apply);
        assert_eq!(rule.domain, "www.youtube.com");
    }

    #[tokio::test]
    async fn test_resolve_caches_by_domain() {
        let classifier = Classifier::new();
        let settings = Settings::default();

        let page = PageInfo::new("https://github.com/user/repo", "Readme");
        let first = classifier.resolve(&page, &settings).await;
        assert!(!first.cached);
        assert_eq!(first.category, "work");

        let second = classifier.resolve(&page, &settings).await;
        assert!(second.cached);
        assert_eq!(second.reason, "cache");
        assert_eq!(second.category, "work");
    }

    #[tokio::test]
    async fn test_cache_expires_after_ttl() {
        let classifier = Classifier::new();
        let settings = Settings::default();

        let page = PageInfo::new("https://github.com/user/repo", "Readme");
        classifier.resolve(&page, &settings).await;

        // 把缓存条目的时间戳拨回 10 分零 1 秒之前
        {
            let mut cache = classifier.cache.lock().unwrap();
            let entry = cache.get_mut("github.com").unwrap();
            entry.ts_ms = chrono::Utc::now().timestamp_millis() - (CACHE_TTL_MS + 1000);
        }

        let again = classifier.resolve(&page, &settings).await;
        assert!(!again.cached);
    }

    #[tokio::test]
    async fn test_invalidate_cache_forces_reclassification() {
        let classifier = Classifier::new();
        let settings = Settings::default();

        let page = PageInfo::new("https://github.com/user/repo", "Readme");
        classifier.resolve(&page, &settings).await;
        classifier.invalidate_cache();

        let again = classifier.resolve(&page, &settings).await;
        assert!(!again.cached);
    }

    #[tokio::test]
    async fn test_custom_name_match_precedes_cascade() {
        let classifier = Classifier::new();
        let mut settings = Settings::default();
        settings
            .learned_rules
            .insert("utility.example".to_string(), "work".to_string());

        // 标题里出现了分类名 "utility"，自定义名匹配先于学习规则
        let page = PageInfo::new("https://utility.example/", "my utility belt");
        let result = classifier.resolve(&page, &settings).await;
        assert_eq!(result.category, "utility");
        assert_eq!(result.reason, "custom name match");
    }
}
