use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub messenger: MessengerConfig,
    #[serde(default)]
    pub gemini: GeminiConfig,
    #[serde(default)]
    pub http: HttpConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

#[derive(Debug, Deserialize, Clone)]
pub struct MessengerConfig {
    #[serde(default)]
    pub page_access_token: String,
    #[serde(default)]
    pub verify_token: String,
    #[serde(default = "default_graph_base_url")]
    pub api_base_url: String,
    #[serde(default = "default_graph_version")]
    pub api_version: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct GeminiConfig {
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_gemini_base_url")]
    pub api_base_url: String,
    #[serde(default = "default_gemini_model")]
    pub model: String,
    #[serde(default = "default_system_prompt")]
    pub system_prompt: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct HttpConfig {
    /// Applies to both outbound APIs.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

impl Default for MessengerConfig {
    fn default() -> Self {
        Self {
            page_access_token: String::new(),
            verify_token: String::new(),
            api_base_url: default_graph_base_url(),
            api_version: default_graph_version(),
        }
    }
}

impl Default for GeminiConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            api_base_url: default_gemini_base_url(),
            model: default_gemini_model(),
            system_prompt: default_system_prompt(),
        }
    }
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    5000
}

fn default_graph_base_url() -> String {
    "https://graph.facebook.com".to_string()
}

fn default_graph_version() -> String {
    "v18.0".to_string()
}

fn default_gemini_base_url() -> String {
    "https://generativelanguage.googleapis.com".to_string()
}

fn default_gemini_model() -> String {
    "gemini-1.5-flash".to_string()
}

fn default_system_prompt() -> String {
    "You are a friendly and helpful assistant for a Facebook page. \
     Your main goal is to answer user questions accurately. \
     You MUST always respond in natural, fluent Burmese (Myanmar language), \
     regardless of the language of the user's question. Do not use English unless \
     it is a brand name."
        .to_string()
}

fn default_timeout_secs() -> u64 {
    30
}

impl MessengerConfig {
    /// Send API endpoint with the page token in the query string.
    pub fn send_url(&self) -> String {
        format!(
            "{}/{}/me/messages?access_token={}",
            self.api_base_url.trim_end_matches('/'),
            self.api_version,
            self.page_access_token
        )
    }
}

impl GeminiConfig {
    pub fn generate_url(&self) -> String {
        format!(
            "{}/v1beta/models/{}:generateContent?key={}",
            self.api_base_url.trim_end_matches('/'),
            self.model,
            self.api_key
        )
    }
}

impl HttpConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Config {
    /// Reads the optional TOML file at `path`, then overlays the process
    /// environment. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let mut config = Self::from_file(path)?;
        config
            .apply_env(|key| std::env::var(key).ok())
            .context("Invalid value in environment")?;
        Ok(config)
    }

    fn from_file(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Config::default());
        }
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Environment wins over the file. Empty variables are ignored.
    fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.is_empty());

        if let Some(token) = get("PAGE_ACCESS_TOKEN") {
            self.messenger.page_access_token = token;
        }
        if let Some(token) = get("VERIFY_TOKEN") {
            self.messenger.verify_token = token;
        }
        if let Some(key) = get("GEMINI_API_KEY") {
            self.gemini.api_key = key;
        }
        if let Some(port) = get("PORT") {
            self.server.port = port
                .parse()
                .with_context(|| format!("PORT is not a valid port number: {port}"))?;
        }
        Ok(())
    }

    /// Names of credentials that are still empty after loading.
    pub fn missing_credentials(&self) -> Vec<&'static str> {
        let mut missing = Vec::new();
        if self.messenger.page_access_token.is_empty() {
            missing.push("PAGE_ACCESS_TOKEN");
        }
        if self.messenger.verify_token.is_empty() {
            missing.push("VERIFY_TOKEN");
        }
        if self.gemini.api_key.is_empty() {
            missing.push("GEMINI_API_KEY");
        }
        missing
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}
