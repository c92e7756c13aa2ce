use std::path::{Path, PathBuf};

use anyhow::Context;
use chat_stream::{ChatClientConfig, DEFAULT_BASE_URL, DEFAULT_USER};
use formatter::Indent;
use serde::Deserialize;

pub const API_KEY_ENV: &str = "JSONPAD_CHAT_API_KEY";
pub const BASE_URL_ENV: &str = "JSONPAD_CHAT_BASE_URL";

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub chat: ChatConfig,
    pub store: StoreConfig,
    pub format: FormatConfig,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct ChatConfig {
    pub base_url: Option<String>,
    pub api_key: Option<String>,
    pub user: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct StoreConfig {
    pub path: Option<PathBuf>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct FormatConfig {
    pub indent: Option<Indent>,
}

impl Config {
    pub fn load() -> anyhow::Result<Self> {
        let config_dir = dirs::config_dir().unwrap_or_else(|| PathBuf::from("."));
        let mut config = Self::load_from(&config_dir.join("jsonpad").join("config.toml"))?;
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    pub fn load_from(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file at {}", path.display()))?;
        Self::parse(&content)
            .with_context(|| format!("failed to parse config file at {}", path.display()))
    }

    fn parse(content: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Environment values win over the file; empty values are ignored.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let non_empty = |key: &str| lookup(key).filter(|v: &String| !v.trim().is_empty());
        if let Some(key) = non_empty(API_KEY_ENV) {
            self.chat.api_key = Some(key);
        }
        if let Some(url) = non_empty(BASE_URL_ENV) {
            self.chat.base_url = Some(url);
        }
    }

    pub fn chat_client(&self) -> ChatClientConfig {
        ChatClientConfig {
            base_url: self
                .chat
                .base_url
                .clone()
                .unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            api_key: self.chat.api_key.clone().unwrap_or_default(),
            user: self
                .chat
                .user
                .clone()
                .unwrap_or_else(|| DEFAULT_USER.to_string()),
        }
    }

    pub fn indent(&self) -> Indent {
        self.format.indent.unwrap_or_default()
    }
}
