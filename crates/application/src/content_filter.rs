//! 消息内容过滤
//!
//! 先执行全部拦截规则，遇到第一个违规立即返回；全部通过后才做清洗
//! （去标签、去脚本协议前缀、遮蔽邮箱/电话/非信任链接）。

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

static HTML_TAG: Lazy<Regex> = Lazy::new(|| Regex::new(r"<[^<>]*>").expect("tag pattern is valid"));

static SCRIPT_SCHEME: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(?:javascript|vbscript|data)\s*:").expect("scheme pattern is valid")
});

static EMAIL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}").expect("email pattern is valid")
});

static URL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"(?i)\bhttps?://[^\s<>"']+"#).expect("url pattern is valid"));

// 电话形状：带国家码、分组号码（区号可带括号）或 11 位手机号；日期和普通编号不算
static PHONE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?:\+\d{1,3}[\s.-]?)?(?:\(\d{2,4}\)\s?|\b\d{3}[\s.-])\d{3,4}[\s.-]\d{4}\b|\+\d{8,15}\b|\b1[3-9]\d{9}\b",
    )
    .expect("phone pattern is valid")
});

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContentFilterConfig {
    /// 最大字符数
    pub max_length: usize,
    pub max_lines: usize,
    /// 同一字符允许连续出现的最大次数
    pub max_repeated_chars: usize,
    pub banned_terms: Vec<String>,
    pub mask_urls: bool,
    pub trusted_domains: Vec<String>,
    pub mask_token: String,
}

impl Default for ContentFilterConfig {
    fn default() -> Self {
        Self {
            max_length: 2000,
            max_lines: 50,
            max_repeated_chars: 10,
            banned_terms: Vec::new(),
            mask_urls: false,
            trusted_domains: Vec::new(),
            mask_token: "***".to_owned(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("content is empty")]
    Empty,
    #[error("content too long: {length} > {max}")]
    TooLong { length: usize, max: usize },
    #[error("too many lines: {lines} > {max}")]
    TooManyLines { lines: usize, max: usize },
    #[error("a character is repeated more than {max} times")]
    RepeatedCharacters { max: usize },
    #[error("content contains a banned term")]
    BannedTerm,
}

/// 通过校验并清洗后的文本
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SanitizedText(String);

impl SanitizedText {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_inner(self) -> String {
        self.0
    }
}

pub struct ContentFilter {
    config: ContentFilterConfig,
    banned_terms: Vec<String>,
}

impl ContentFilter {
    pub fn new(config: ContentFilterConfig) -> Self {
        let banned_terms = config
            .banned_terms
            .iter()
            .map(|term| term.trim().to_lowercase())
            .filter(|term| !term.is_empty())
            .collect();
        Self {
            config,
            banned_terms,
        }
    }

    pub fn validate(&self, text: &str) -> Result<SanitizedText, ValidationError> {
        self.check_blocking_rules(text)?;

        let sanitized = self.sanitize(text);
        if sanitized.trim().is_empty() {
            return Err(ValidationError::Empty);
        }
        Ok(SanitizedText(sanitized))
    }

    fn check_blocking_rules(&self, text: &str) -> Result<(), ValidationError> {
        if text.trim().is_empty() {
            return Err(ValidationError::Empty);
        }

        let length = text.chars().count();
        if length > self.config.max_length {
            return Err(ValidationError::TooLong {
                length,
                max: self.config.max_length,
            });
        }

        let lines = text.lines().count();
        if lines > self.config.max_lines {
            return Err(ValidationError::TooManyLines {
                lines,
                max: self.config.max_lines,
            });
        }

        if longest_run(text) > self.config.max_repeated_chars {
            return Err(ValidationError::RepeatedCharacters {
                max: self.config.max_repeated_chars,
            });
        }

        let lowered = text.to_lowercase();
        if self
            .banned_terms
            .iter()
            .any(|term| lowered.contains(term.as_str()))
        {
            return Err(ValidationError::BannedTerm);
        }

        Ok(())
    }

    fn sanitize(&self, text: &str) -> String {
        let mask = self.config.mask_token.as_str();

        let stripped = HTML_TAG.replace_all(text, "");
        let stripped = SCRIPT_SCHEME.replace_all(&stripped, "");
        let masked = EMAIL.replace_all(&stripped, mask);

        let masked = if self.config.mask_urls {
            URL.replace_all(&masked, |caps: &regex::Captures<'_>| {
                let url = &caps[0];
                if self.is_trusted(url) {
                    url.to_owned()
                } else {
                    mask.to_owned()
                }
            })
            .into_owned()
        } else {
            masked.into_owned()
        };

        PHONE.replace_all(&masked, mask).trim().to_owned()
    }

    fn is_trusted(&self, url: &str) -> bool {
        let Some(host) = url_host(url) else {
            return false;
        };
        self.config.trusted_domains.iter().any(|domain| {
            let domain = domain.trim().to_lowercase();
            host == domain || host.ends_with(&format!(".{domain}"))
        })
    }
}

impl Default for ContentFilter {
    fn default() -> Self {
        Self::new(ContentFilterConfig::default())
    }
}

/// 非空白字符的最长连续重复长度
fn longest_run(text: &str) -> usize {
    let mut longest = 0;
    let mut current = 0;
    let mut previous: Option<char> = None;

    for ch in text.chars() {
        if ch.is_whitespace() {
            previous = None;
            current = 0;
            continue;
        }
        if previous == Some(ch) {
            current += 1;
        } else {
            previous = Some(ch);
            current = 1;
        }
        longest = longest.max(current);
    }
    longest
}

fn url_host(url: &str) -> Option<String> {
    let rest = url.split_once("://")?.1;
    let authority = rest.split(['/', '?', '#']).next()?;
    let host = authority.rsplit('@').next()?;
    let host = host.split(':').next()?;
    if host.is_empty() {
        return None;
    }
    Some(host.to_lowercase())
}
