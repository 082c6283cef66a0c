//! 统一配置中心
//!
//! 加载顺序：内置默认值 → 可选 TOML 文件（`CHAT_CONFIG_FILE`）→ `CHAT_` 前缀环境变量，
//! 嵌套字段用 `__` 分隔，例如 `CHAT_RATE_LIMIT__CAPACITY=20`。

use std::time::Duration;

use figment::providers::{Env, Format, Serialized, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};

/// 全局应用配置
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub jwt: JwtConfig,
    pub rate_limit: RateLimitSettings,
    pub presence: PresenceSettings,
    pub content: ContentSettings,
    pub log: LogConfig,
}

/// 服务器配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// 数据库配置；`url` 缺省时使用内存存储
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub url: Option<String>,
    pub max_connections: u32,
}

/// JWT配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct JwtConfig {
    pub secret: String,
    pub leeway_seconds: u64,
}

/// 令牌桶限流
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitSettings {
    pub capacity: u32,
    pub refill_per_second: f64,
    pub idle_eviction_seconds: u64,
    pub cleanup_interval_seconds: u64,
}

/// 在线状态清扫与探测
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PresenceSettings {
    pub sweep_interval_seconds: u64,
    pub stale_after_seconds: u64,
    pub probe_interval_seconds: u64,
    pub probe_timeout_millis: u64,
    pub online_window_seconds: u64,
}

/// 消息内容过滤
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContentSettings {
    pub max_length: usize,
    pub max_lines: usize,
    pub max_repeated_chars: usize,
    pub banned_terms: Vec<String>,
    pub mask_urls: bool,
    pub trusted_domains: Vec<String>,
    pub mask_token: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// 输出 JSON 格式日志
    pub json: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 8080,
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: None,
            max_connections: 5,
        }
    }
}

impl Default for JwtConfig {
    fn default() -> Self {
        Self {
            secret: String::new(),
            leeway_seconds: 30,
        }
    }
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            capacity: 10,
            refill_per_second: 10.0,
            idle_eviction_seconds: 600,
            cleanup_interval_seconds: 60,
        }
    }
}

impl Default for PresenceSettings {
    fn default() -> Self {
        Self {
            sweep_interval_seconds: 60,
            stale_after_seconds: 120,
            probe_interval_seconds: 30,
            probe_timeout_millis: 2000,
            online_window_seconds: 60,
        }
    }
}

impl Default for ContentSettings {
    fn default() -> Self {
        Self {
            max_length: 2000,
            max_lines: 50,
            max_repeated_chars: 10,
            banned_terms: Vec::new(),
            mask_urls: false,
            trusted_domains: Vec::new(),
            mask_token: "***".into(),
        }
    }
}

impl PresenceSettings {
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_seconds)
    }

    pub fn stale_after(&self) -> Duration {
        Duration::from_secs(self.stale_after_seconds)
    }

    pub fn probe_interval(&self) -> Duration {
        Duration::from_secs(self.probe_interval_seconds)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_millis)
    }

    pub fn online_window(&self) -> Duration {
        Duration::from_secs(self.online_window_seconds)
    }
}

impl RateLimitSettings {
    pub fn idle_eviction(&self) -> Duration {
        Duration::from_secs(self.idle_eviction_seconds)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_seconds)
    }
}

impl AppConfig {
    /// 按优先级加载并校验：默认值 → 可选文件（CHAT_CONFIG_FILE）→ 环境变量（CHAT_*）
    pub fn load() -> Result<Self, ConfigError> {
        let mut figment = Figment::new().merge(Serialized::defaults(AppConfig::default()));
        if let Ok(path) = std::env::var("CHAT_CONFIG_FILE") {
            figment = figment.merge(Toml::file(path));
        }
        figment = figment.merge(Env::prefixed("CHAT_").ignore(&["config_file"]).split("__"));

        let config: AppConfig = figment.extract().map_err(Box::new)?;
        config.validate()?;
        Ok(config)
    }

    /// 从 TOML 文本解析，缺失字段取默认值
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: AppConfig = Figment::new()
            .merge(Serialized::defaults(AppConfig::default()))
            .merge(Toml::string(text))
            .extract()
            .map_err(Box::new)?;
        config.validate()?;
        Ok(config)
    }

    /// 验证配置有效性
    pub fn validate(&self) -> Result<(), ConfigError> {
        // JWT密钥至少256位/32字节
        if self.jwt.secret.len() < 32 {
            return Err(ConfigError::InvalidJwtSecret(
                "JWT secret must be at least 32 characters long".to_string(),
            ));
        }

        if self.database.url.is_some() && self.database.max_connections == 0 {
            return Err(ConfigError::InvalidDatabaseConfig(
                "Max connections must be greater than 0".to_string(),
            ));
        }

        if self.rate_limit.capacity == 0 {
            return Err(ConfigError::InvalidRateLimit(
                "capacity must be greater than 0".to_string(),
            ));
        }
        let refill = self.rate_limit.refill_per_second;
        if refill.is_nan() || refill <= 0.0 {
            return Err(ConfigError::InvalidRateLimit(
                "refill_per_second must be positive".to_string(),
            ));
        }

        if self.presence.online_window_seconds >= self.presence.stale_after_seconds {
            return Err(ConfigError::InvalidPresence(
                "online window must be shorter than the staleness threshold".to_string(),
            ));
        }
        if self.presence.probe_interval_seconds >= self.presence.sweep_interval_seconds {
            return Err(ConfigError::InvalidPresence(
                "probe interval must be shorter than the sweep interval".to_string(),
            ));
        }
        if self.presence.probe_interval_seconds == 0 {
            return Err(ConfigError::InvalidPresence(
                "probe interval must be greater than 0".to_string(),
            ));
        }

        if self.content.max_length == 0 {
            return Err(ConfigError::InvalidContent(
                "max_length must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }

    /// 可以写入日志的配置描述（隐藏密钥和数据库口令）
    pub fn sanitized(&self) -> String {
        let mut redacted = self.clone();
        redacted.jwt.secret = "[REDACTED]".into();
        redacted.database.url = redacted.database.url.as_deref().map(redact_url);
        format!("{redacted:?}")
    }
}

fn redact_url(url: &str) -> String {
    match (url.find("://"), url.rfind('@')) {
        (Some(scheme_end), Some(at)) if at > scheme_end => {
            format!("{}://[REDACTED]{}", &url[..scheme_end], &url[at..])
        }
        _ => url.to_owned(),
    }
}

/// 配置错误类型
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] Box<figment::Error>),
    #[error("Invalid JWT secret: {0}")]
    InvalidJwtSecret(String),
    #[error("Invalid database configuration: {0}")]
    InvalidDatabaseConfig(String),
    #[error("Invalid rate limit configuration: {0}")]
    InvalidRateLimit(String),
    #[error("Invalid presence configuration: {0}")]
    InvalidPresence(String),
    #[error("Invalid content configuration: {0}")]
    InvalidContent(String),
}
