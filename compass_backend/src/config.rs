use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use crate::providers::ProviderKind;

/// Connection and sampling settings for one OpenAI-compatible completion backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderSettings {
    pub api_url: String,
    #[serde(default)]
    pub api_key: Option<String>,
    pub model: String,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
}

impl ProviderSettings {
    /// A provider is usable only when it carries a non-blank key.
    pub fn credential(&self) -> Option<&str> {
        self.api_key
            .as_deref()
            .map(str::trim)
            .filter(|key| !key.is_empty())
    }

    fn apply_env(&mut self, prefix: &str) {
        if let Ok(url) = env::var(format!("{prefix}_API_URL")) {
            if !url.trim().is_empty() {
                self.api_url = url.trim().trim_end_matches('/').to_string();
            }
        }
        if let Ok(model) = env::var(format!("{prefix}_MODEL")) {
            if !model.trim().is_empty() {
                self.model = model.trim().to_string();
            }
        }
        if let Ok(raw) = env::var(format!("{prefix}_MAX_TOKENS")) {
            if let Ok(tokens) = raw.trim().parse() {
                self.max_tokens = tokens;
            }
        }
        if let Ok(raw) = env::var(format!("{prefix}_TEMPERATURE")) {
            if let Ok(temperature) = raw.trim().parse() {
                self.temperature = temperature;
            }
        }
    }

    fn fill_key_from_env(&mut self, prefix: &str) {
        if self.credential().is_some() {
            return;
        }
        if let Ok(key) = env::var(format!("{prefix}_API_KEY")) {
            if !key.trim().is_empty() {
                self.api_key = Some(key.trim().to_string());
            }
        }
    }
}

fn default_max_tokens() -> u32 {
    1000
}

fn default_temperature() -> f32 {
    0.7
}

fn default_openai() -> ProviderSettings {
    ProviderSettings {
        api_url: "https://api.openai.com/v1".to_string(),
        api_key: None,
        model: "gpt-4o-mini".to_string(),
        max_tokens: default_max_tokens(),
        temperature: default_temperature(),
    }
}

fn default_deepseek() -> ProviderSettings {
    ProviderSettings {
        api_url: "https://api.deepseek.com/v1".to_string(),
        api_key: None,
        model: "deepseek-chat".to_string(),
        max_tokens: default_max_tokens(),
        temperature: default_temperature(),
    }
}

/// Row limits for each grounding section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextLimits {
    #[serde(default = "default_recent_conversations")]
    pub recent_conversations: usize,
    #[serde(default = "default_messages_per_conversation")]
    pub messages_per_conversation: usize,
    #[serde(default = "default_jobs")]
    pub jobs: usize,
    #[serde(default = "default_events")]
    pub events: usize,
    #[serde(default = "default_news")]
    pub news: usize,
    #[serde(default = "default_meetings")]
    pub meetings: usize,
    #[serde(default = "default_applications")]
    pub applications: usize,
}

fn default_recent_conversations() -> usize {
    3
}

fn default_messages_per_conversation() -> usize {
    5
}

fn default_jobs() -> usize {
    5
}

fn default_events() -> usize {
    5
}

fn default_news() -> usize {
    3
}

fn default_meetings() -> usize {
    5
}

fn default_applications() -> usize {
    5
}

impl Default for ContextLimits {
    fn default() -> Self {
        Self {
            recent_conversations: default_recent_conversations(),
            messages_per_conversation: default_messages_per_conversation(),
            jobs: default_jobs(),
            events: default_events(),
            news: default_news(),
            meetings: default_meetings(),
            applications: default_applications(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    // Relational store
    #[serde(default = "default_database_path")]
    pub database_path: String,
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,

    // Header set by the upstream auth gateway carrying the caller's user id
    #[serde(default = "default_identity_header")]
    pub identity_header: String,

    // Completion providers
    #[serde(default)]
    pub default_provider: ProviderKind,
    #[serde(default = "default_openai")]
    pub openai: ProviderSettings,
    #[serde(default = "default_deepseek")]
    pub deepseek: ProviderSettings,

    #[serde(default = "default_system_prompt")]
    pub system_prompt: String,

    #[serde(default)]
    pub context: ContextLimits,
}

fn default_bind_addr() -> String {
    "127.0.0.1:8790".to_string()
}

fn default_database_path() -> String {
    "compass.db".to_string()
}

fn default_pool_size() -> usize {
    4
}

fn default_identity_header() -> String {
    "x-user-id".to_string()
}

fn default_system_prompt() -> String {
    "You are Compass, a career guidance assistant for students, counselors and employers. \
     Give practical, encouraging and specific advice about careers, job searching, \
     applications, interviews and education pathways. When platform data is provided, \
     refer to the actual jobs, events, news and meetings it lists instead of inventing new ones."
        .to_string()
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            database_path: default_database_path(),
            pool_size: default_pool_size(),
            identity_header: default_identity_header(),
            default_provider: ProviderKind::default(),
            openai: default_openai(),
            deepseek: default_deepseek(),
            system_prompt: default_system_prompt(),
            context: ContextLimits::default(),
        }
    }
}

impl ServiceConfig {
    /// Get the directory containing the executable
    fn get_base_dir() -> PathBuf {
        match std::env::current_exe() {
            Ok(exe_path) => exe_path
                .parent()
                .map(|p| p.to_path_buf())
                .unwrap_or_else(|| PathBuf::from(".")),
            Err(_) => PathBuf::from("."),
        }
    }

    /// Get the path to the config file (relative to executable)
    pub fn config_path() -> PathBuf {
        Self::get_base_dir().join("compass_config.toml")
    }

    /// Load config from compass_config.toml (next to executable), falling back to env vars.
    pub fn load() -> Self {
        let path = Self::config_path();

        if path.exists() {
            match Self::from_file(&path) {
                Ok(config) => {
                    tracing::info!("Loaded config from {:?}", path);
                    return config;
                }
                Err(e) => tracing::error!("{:#}", e),
            }
        } else {
            tracing::warn!("No config file found, using defaults + env vars");
        }

        Self::from_env()
    }

    /// Parse one TOML file; API keys left empty there are filled from env.
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {:?}", path))?;
        let mut config: ServiceConfig = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config {:?}", path))?;
        config.openai.fill_key_from_env("OPENAI");
        config.deepseek.fill_key_from_env("DEEPSEEK");
        Ok(config)
    }

    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(bind) = env::var("COMPASS_BIND") {
            if !bind.trim().is_empty() {
                config.bind_addr = bind.trim().to_string();
            }
        }

        if let Ok(path) = env::var("COMPASS_DATABASE_PATH") {
            if !path.trim().is_empty() {
                config.database_path = path;
            }
        }

        if let Ok(size) = env::var("COMPASS_POOL_SIZE") {
            if let Ok(size) = size.trim().parse::<usize>() {
                config.pool_size = size.max(1);
            }
        }

        if let Ok(header) = env::var("COMPASS_IDENTITY_HEADER") {
            if !header.trim().is_empty() {
                config.identity_header = header.trim().to_ascii_lowercase();
            }
        }

        if let Ok(raw) = env::var("COMPASS_DEFAULT_PROVIDER") {
            match ProviderKind::parse(&raw) {
                Some(kind) => config.default_provider = kind,
                None => tracing::warn!("Ignoring unknown COMPASS_DEFAULT_PROVIDER '{}'", raw),
            }
        }

        config.openai.apply_env("OPENAI");
        config.openai.fill_key_from_env("OPENAI");
        config.deepseek.apply_env("DEEPSEEK");
        config.deepseek.fill_key_from_env("DEEPSEEK");

        config
    }

    pub fn provider_settings(&self, kind: ProviderKind) -> &ProviderSettings {
        match kind {
            ProviderKind::OpenAi => &self.openai,
            ProviderKind::DeepSeek => &self.deepseek,
        }
    }
}
