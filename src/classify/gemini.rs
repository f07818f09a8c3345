//! Gemini 推理客户端
//!
//! 走 generateContent 端点，密钥放在查询参数里（不用自定义请求头，
//! 避免预检）。请求超时 12 秒；瞬时失败（429/5xx/网络错误）带抖动
//! 退避重试一次，其余失败直接交还上层走管线降级。

use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

/// Gemini API 根地址
const GEMINI_API_BASE: &str = "https://generativelanguage.googleapis.com";

/// 单次请求超时（秒）
const REQUEST_TIMEOUT_SECS: u64 = 12;

/// 模型回答中 reason 字段的长度上限（字符）
const MAX_REASON_CHARS: usize = 60;

/// 推理调用错误
#[derive(Debug, Error)]
pub enum GeminiError {
    /// HTTP 层错误；429/5xx 视为瞬时
    #[error("HTTP {status}: {body}")]
    Http { status: u16, body: String },
    /// 网络或超时错误，视为瞬时
    #[error("network error: {0}")]
    Network(String),
    /// 响应无法解析为可用的分类结论
    #[error("unusable response: {0}")]
    Invalid(String),
}

impl GeminiError {
    /// 是否值得重试
    pub fn is_transient(&self) -> bool {
        match self {
            GeminiError::Http { status, .. } => *status == 429 || *status >= 500,
            GeminiError::Network(_) => true,
            GeminiError::Invalid(_) => false,
        }
    }
}

/// 模型建议的白名单规则
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SuggestedRule {
    pub apply: bool,
    pub domain: String,
    pub category: String,
    #[serde(rename = "type")]
    pub rule_type: String,
}

/// 模型给出的分类结论（已清洗）
#[derive(Debug, Clone)]
pub struct ModelVerdict {
    pub category: String,
    pub reason: String,
    pub confidence: f64,
    pub suggested_rule: SuggestedRule,
}

#[derive(Serialize)]
struct GeminiRequest {
    contents: Vec<Content>,
    #[serde(rename = "generationConfig")]
    generation_config: GenerationConfig,
}

#[derive(Serialize)]
struct Content {
    role: &'static str,
    parts: Vec<Part>,
}

#[derive(Serialize)]
struct Part {
    text: String,
}

#[derive(Serialize)]
struct GenerationConfig {
    temperature: f64,
}

#[derive(Deserialize)]
struct GeminiResponse {
    candidates: Option<Vec<Candidate>>,
}

#[derive(Deserialize)]
struct Candidate {
    content: Option<CandidateContent>,
}

#[derive(Deserialize)]
struct CandidateContent {
    parts: Option<Vec<ResponsePart>>,
}

#[derive(Deserialize)]
struct ResponsePart {
    text: Option<String>,
}

/// Gemini 客户端
pub struct GeminiClient {
    http: reqwest::Client,
}

impl GeminiClient {
    pub fn new() -> Self {
        Self {
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
                .build()
                .unwrap(),
        }
    }

    /// 调用一个 (版本, 模型)，瞬时失败重试一次
    pub async fn generate(
        &self,
        version: &str,
        model: &str,
        api_key: &str,
        prompt: &str,
    ) -> Result<ModelVerdict, GeminiError> {
        let url = format!("{}/{}/models/{}:generateContent", GEMINI_API_BASE, version, model);

        let mut attempt = 0;
        loop {
            match self.call_once(&url, api_key, prompt).await {
                Ok(verdict) => return Ok(verdict),
                Err(e) if attempt == 0 && e.is_transient() => {
                    let backoff = match &e {
                        GeminiError::Http { .. } => 400 + rand::thread_rng().gen_range(0..400),
                        _ => 200 + rand::thread_rng().gen_range(0..300),
                    };
                    warn!("Gemini call failed ({}), retrying in {}ms", e, backoff);
                    tokio::time::sleep(Duration::from_millis(backoff)).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn call_once(
        &self,
        url: &str,
        api_key: &str,
        prompt: &str,
    ) -> Result<ModelVerdict, GeminiError> {
        let request = GeminiRequest {
            contents: vec![Content {
                role: "user",
                parts: vec![Part {
                    text: prompt.to_string(),
                }],
            }],
            generation_config: GenerationConfig { temperature: 0.0 },
        };

        let response = self
            .http
            .post(url)
            .query(&[("key", api_key)])
            .json(&request)
            .send()
            .await
            .map_err(|e| GeminiError::Network(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let snippet: String = body.chars().take(180).collect();
            return Err(GeminiError::Http {
                status: status.as_u16(),
                body: snippet,
            });
        }

        let data: GeminiResponse = response
            .json()
            .await
            .map_err(|e| GeminiError::Invalid(format!("bad response body: {}", e)))?;

        let raw = data
            .candidates
            .and_then(|mut c| if c.is_empty() { None } else { Some(c.remove(0)) })
            .and_then(|c| c.content)
            .and_then(|c| c.parts)
            .and_then(|mut p| if p.is_empty() { None } else { p.remove(0).text })
            .unwrap_or_default();

        debug!("Gemini raw response: {} chars", raw.len());
        parse_verdict(&raw)
    }
}

impl Default for GeminiClient {
    fn default() -> Self {
        Self::new()
    }
}

/// 构造严格 JSON 的分类 prompt
pub fn build_prompt(
    url: &str,
    title: &str,
    domain: &str,
    categories: &[String],
    rest_categories: &[String],
) -> String {
    let cats_line = categories.join(", ");
    let rest_line = rest_categories.join(", ");
    format!(
        r#"You are a strict JSON machine. Choose ONE category from: {cats_line}.
Unless it is truly unknown or generic, do NOT use "other".
- For entertainment/leisure (video/music/streaming/gaming/anime/short-video/live-streaming), choose a category under the "rest" umbrella: [{rest_line}].
Guidelines: Prefer specific categories; use host/path/title; output STRICT JSON keys: category, reason, confidence, suggest_rule.
Examples:
Input: URL=https://www.youtube.com/watch?v=abc, Title="Lo-fi beats"
Output: {{"category":"entertainment","reason":"video streaming","confidence":0.95,"suggest_rule":{{"apply":true,"domain":"youtube.com","category":"entertainment","type":"whitelist"}}}}
Input: URL=https://github.com/user/repo, Title="Readme"
Output: {{"category":"work","reason":"code hosting","confidence":0.9,"suggest_rule":{{"apply":true,"domain":"github.com","category":"work","type":"whitelist"}}}}

URL: {url}
Title: {title}
Domain: {domain}
ONLY return JSON like:
{{"category":"<one of [{cats_line}]>","reason":"<short>","confidence":0.0-1.0,"suggest_rule":{{"apply":true|false,"domain":"{domain}","category":"<same>","type":"whitelist"}}}}"#
    )
}

/// 从模型的自由文本中恢复 JSON 对象
///
/// 先剥掉代码围栏直接解析，失败后回退到截取首尾花括号。
fn extract_json(text: &str) -> Option<Value> {
    if text.is_empty() {
        return None;
    }
    let mut t = text.trim();
    t = t
        .trim_start_matches("```json")
        .trim_start_matches("```")
        .trim_end_matches("```")
        .trim();

    if let Ok(value) = serde_json::from_str::<Value>(t) {
        return Some(value);
    }
    let start = t.find('{')?;
    let end = t.rfind('}')?;
    if end <= start {
        return None;
    }
    serde_json::from_str(&t[start..=end]).ok()
}

fn clamp01(v: f64) -> f64 {
    if v.is_finite() {
        v.clamp(0.0, 1.0)
    } else {
        0.0
    }
}

/// 清洗建议规则：只有 apply、domain、category 同时有效才保留 apply
fn sanitize_suggest_rule(value: Option<&Value>) -> SuggestedRule {
    let Some(obj) = value.filter(|v| v.is_object()) else {
        return SuggestedRule {
            rule_type: "whitelist".to_string(),
            ..SuggestedRule::default()
        };
    };
    let domain = obj
        .get("domain")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let category = obj
        .get("category")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let apply = obj.get("apply").and_then(Value::as_bool).unwrap_or(false)
        && !domain.is_empty()
        && !category.is_empty();
    SuggestedRule {
        apply,
        domain,
        category,
        rule_type: "whitelist".to_string(),
    }
}

/// 解析并清洗模型回答
fn parse_verdict(raw: &str) -> Result<ModelVerdict, GeminiError> {
    let json =
        extract_json(raw).ok_or_else(|| GeminiError::Invalid("no JSON object found".into()))?;

    let category = json
        .get("category")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    if category.is_empty() {
        return Err(GeminiError::Invalid("empty category".into()));
    }

    let reason: String = json
        .get("reason")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .chars()
        .take(MAX_REASON_CHARS)
        .collect();
    let confidence = clamp01(json.get("confidence").and_then(Value::as_f64).unwrap_or(0.0));
    let suggested_rule =
        sanitize_suggest_rule(json.get("suggest_rule").or_else(|| json.get("suggestedRule")));

    Ok(ModelVerdict {
        category,
        reason,
        confidence,
        suggested_rule,
    })
}
