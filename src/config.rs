use serde::Deserialize;
use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use teloxide::types::{ChatId, UserId};

/// Errors that can occur when loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file '{}': {source}", path.display())]
    ReadFile { path: PathBuf, source: std::io::Error },
    #[error("failed to parse config file '{}': {source}", path.display())]
    ParseJson { path: PathBuf, source: serde_json::Error },
    #[error("config validation error: {0}")]
    Validation(String),
}

#[derive(Deserialize)]
struct ConfigFile {
    telegram_bot_token: String,
    /// Public URL Telegram posts updates to. Without it the webhook is left as is.
    webhook_url: Option<String>,
    /// Expected `X-Telegram-Bot-Api-Secret-Token` header value.
    webhook_secret: Option<String>,
    listen_addr: Option<String>,
    /// Directory for state files (database, blobs, logs). Defaults to current directory.
    data_dir: Option<String>,
    log_chat_id: Option<i64>,
    /// Users allowed to talk to the bot. Empty means everyone.
    #[serde(default)]
    allowed_users: Vec<u64>,
    /// Users allowed to run maintenance commands.
    #[serde(default)]
    admin_ids: Vec<u64>,
    /// Engines for users without a stored configuration.
    #[serde(default)]
    default_engines: Vec<String>,
    /// Path to Whisper model file (.bin) for voice transcription.
    whisper_model_path: Option<String>,
    /// HTTP proxy for vendor calls.
    proxy_url: Option<String>,
    #[serde(default = "default_concurrency")]
    worker_concurrency: usize,

    #[serde(default)]
    openai_api_key: String,
    #[serde(default)]
    anthropic_api_key: String,
    #[serde(default)]
    gemini_api_key: String,
    #[serde(default)]
    deepl_auth_key: String,
    #[serde(default)]
    monsterapi_token: String,
    monsterapi_callback_url: Option<String>,
    monsterapi_callback_secret: Option<String>,
    #[serde(default)]
    ideogram_token: String,
    #[serde(default)]
    ideogram_user_id: String,
    bing_endpoint: Option<String>,
    #[serde(default)]
    bing_api_key: String,
    bard_endpoint: Option<String>,
    #[serde(default)]
    bard_api_key: String,
}

fn default_concurrency() -> usize {
    4
}

/// Base URL and key of an OpenAI-compatible chat bridge.
#[derive(Debug, Clone, PartialEq)]
pub struct BridgeEndpoint {
    pub url: String,
    pub api_key: String,
}

/// Vendor credentials. An empty key disables the engine.
#[derive(Debug, Clone, Default)]
pub struct Credentials {
    pub openai_api_key: String,
    pub anthropic_api_key: String,
    pub gemini_api_key: String,
    pub deepl_auth_key: String,
    pub monsterapi_token: String,
    pub monsterapi_callback_url: Option<String>,
    pub ideogram_token: String,
    pub ideogram_user_id: String,
    pub bing: Option<BridgeEndpoint>,
    pub bard: Option<BridgeEndpoint>,
}

pub struct Config {
    pub telegram_bot_token: String,
    pub webhook_url: Option<String>,
    pub webhook_secret: Option<String>,
    pub listen_addr: SocketAddr,
    /// Directory for state files.
    pub data_dir: PathBuf,
    pub log_chat_id: Option<ChatId>,
    pub allowed_users: HashSet<UserId>,
    pub admin_ids: HashSet<UserId>,
    pub default_engines: Vec<String>,
    pub whisper_model_path: Option<PathBuf>,
    pub proxy_url: Option<String>,
    pub worker_concurrency: usize,
    /// Path segment MonsterAPI callbacks must carry.
    pub monsterapi_callback_secret: Option<String>,
    pub credentials: Credentials,
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let config_path = path.as_ref().to_path_buf();
        let content = std::fs::read_to_string(&config_path)
            .map_err(|e| ConfigError::ReadFile { path: config_path.clone(), source: e })?;
        let file: ConfigFile = serde_json::from_str(&content)
            .map_err(|e| ConfigError::ParseJson { path: config_path.clone(), source: e })?;

        if file.telegram_bot_token.is_empty() {
            return Err(ConfigError::Validation("telegram_bot_token is required".into()));
        }
        // Telegram tokens are formatted as {bot_id}:{secret} where bot_id is numeric
        let token_parts: Vec<&str> = file.telegram_bot_token.split(':').collect();
        if token_parts.len() != 2 || token_parts[0].parse::<u64>().is_err() || token_parts[1].is_empty() {
            return Err(ConfigError::Validation(
                "telegram_bot_token appears invalid (expected format: 123456789:ABCdefGHI...)".into()
            ));
        }

        let listen_addr = file
            .listen_addr
            .as_deref()
            .unwrap_or("0.0.0.0:8080")
            .parse::<SocketAddr>()
            .map_err(|e| ConfigError::Validation(format!("listen_addr is invalid: {e}")))?;

        for engine in &file.default_engines {
            if crate::engines::EngineKind::parse_chat(engine).is_none() {
                return Err(ConfigError::Validation(format!(
                    "default_engines contains unknown chat engine '{engine}'"
                )));
            }
        }

        if file.monsterapi_callback_url.is_some() && file.monsterapi_callback_secret.is_none() {
            return Err(ConfigError::Validation(
                "monsterapi_callback_secret is required when monsterapi_callback_url is set".into(),
            ));
        }

        let bridge = |url: Option<String>, api_key: String| {
            url.filter(|u| !u.is_empty())
                .map(|url| BridgeEndpoint { url: url.trim_end_matches('/').to_string(), api_key })
        };

        let data_dir = file
            .data_dir
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."));

        Ok(Self {
            telegram_bot_token: file.telegram_bot_token,
            webhook_url: file.webhook_url.filter(|u| !u.is_empty()),
            webhook_secret: file.webhook_secret.filter(|s| !s.is_empty()),
            listen_addr,
            data_dir,
            log_chat_id: file.log_chat_id.map(ChatId),
            allowed_users: file.allowed_users.into_iter().map(UserId).collect(),
            admin_ids: file.admin_ids.into_iter().map(UserId).collect(),
            default_engines: file.default_engines.iter().map(|e| e.to_lowercase()).collect(),
            whisper_model_path: file.whisper_model_path.map(PathBuf::from),
            proxy_url: file.proxy_url.filter(|p| !p.is_empty()),
            worker_concurrency: file.worker_concurrency.max(1),
            monsterapi_callback_secret: file.monsterapi_callback_secret,
            credentials: Credentials {
                openai_api_key: file.openai_api_key,
                anthropic_api_key: file.anthropic_api_key,
                gemini_api_key: file.gemini_api_key,
                deepl_auth_key: file.deepl_auth_key,
                monsterapi_token: file.monsterapi_token,
                monsterapi_callback_url: file.monsterapi_callback_url,
                ideogram_token: file.ideogram_token,
                ideogram_user_id: file.ideogram_user_id,
                bing: bridge(file.bing_endpoint, file.bing_api_key),
                bard: bridge(file.bard_endpoint, file.bard_api_key),
            },
        })
    }

    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join("aigate.db")
    }

    pub fn blobs_dir(&self) -> PathBuf {
        self.data_dir.join("blobs")
    }

    /// HTTP client for vendor APIs, routed through `proxy_url` when set.
    pub fn http_client(&self) -> Result<reqwest::Client, ConfigError> {
        let mut builder = reqwest::Client::builder().timeout(std::time::Duration::from_secs(600));
        if let Some(ref proxy) = self.proxy_url {
            let proxy = reqwest::Proxy::all(proxy)
                .map_err(|e| ConfigError::Validation(format!("proxy_url is invalid: {e}")))?;
            builder = builder.proxy(proxy);
        }
        builder
            .build()
            .map_err(|e| ConfigError::Validation(format!("cannot build HTTP client: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn write_config(content: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    fn assert_err<T>(result: Result<T, ConfigError>) -> ConfigError {
        match result {
            Ok(_) => panic!("expected error, got Ok"),
            Err(e) => e,
        }
    }

    #[test]
    fn test_valid_minimal_config() {
        let file = write_config(r#"{
            "telegram_bot_token": "123456789:ABCdefGHIjklMNOpqrsTUVwxyz"
        }"#);
        let config = Config::load(file.path()).expect("should load valid config");
        assert_eq!(config.listen_addr, "0.0.0.0:8080".parse().unwrap());
        assert_eq!(config.worker_concurrency, 4);
        assert!(config.allowed_users.is_empty());
        assert!(config.admin_ids.is_empty());
        assert!(config.credentials.bing.is_none());
    }

    #[test]
    fn test_full_config() {
        let file = write_config(r#"{
            "telegram_bot_token": "123456789:ABCdef",
            "listen_addr": "127.0.0.1:9000",
            "allowed_users": [5, 6],
            "admin_ids": [5],
            "default_engines": ["Claude", "gemini"],
            "bing_endpoint": "http://localhost:8000/v1/",
            "monsterapi_token": "t",
            "monsterapi_callback_url": "https://bot.example/callbacks/monsterapi/s3cret",
            "monsterapi_callback_secret": "s3cret",
            "data_dir": "/var/lib/aigate"
        }"#);
        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.allowed_users, HashSet::from([UserId(5), UserId(6)]));
        assert_eq!(config.admin_ids, HashSet::from([UserId(5)]));
        assert_eq!(config.default_engines, vec!["claude", "gemini"]);
        assert_eq!(
            config.credentials.bing,
            Some(BridgeEndpoint { url: "http://localhost:8000/v1".to_string(), api_key: String::new() })
        );
        assert_eq!(config.database_path(), PathBuf::from("/var/lib/aigate/aigate.db"));
    }

    #[test]
    fn test_empty_token() {
        let file = write_config(r#"{ "telegram_bot_token": "" }"#);
        let err = assert_err(Config::load(file.path()));
        assert!(matches!(err, ConfigError::Validation(_)));
        assert!(err.to_string().contains("telegram_bot_token"));
    }

    #[test]
    fn test_invalid_token_format_no_colon() {
        let file = write_config(r#"{ "telegram_bot_token": "invalid_token_no_colon" }"#);
        let err = assert_err(Config::load(file.path()));
        assert!(err.to_string().contains("invalid"));
    }

    #[test]
    fn test_invalid_token_format_non_numeric_id() {
        let file = write_config(r#"{ "telegram_bot_token": "notanumber:ABCdef" }"#);
        let err = assert_err(Config::load(file.path()));
        assert!(matches!(err, ConfigError::Validation(_)));
    }

    #[test]
    fn test_unknown_default_engine() {
        let file = write_config(r#"{
            "telegram_bot_token": "123456789:ABCdef",
            "default_engines": ["bing", "skynet"]
        }"#);
        let err = assert_err(Config::load(file.path()));
        assert!(err.to_string().contains("skynet"));
    }

    #[test]
    fn test_callback_url_requires_secret() {
        let file = write_config(r#"{
            "telegram_bot_token": "123456789:ABCdef",
            "monsterapi_callback_url": "https://bot.example/cb"
        }"#);
        let err = assert_err(Config::load(file.path()));
        assert!(err.to_string().contains("monsterapi_callback_secret"));
    }

    #[test]
    fn test_invalid_listen_addr() {
        let file = write_config(r#"{
            "telegram_bot_token": "123456789:ABCdef",
            "listen_addr": "not an address"
        }"#);
        assert!(matches!(assert_err(Config::load(file.path())), ConfigError::Validation(_)));
    }

    #[test]
    fn test_file_not_found() {
        let err = assert_err(Config::load("/nonexistent/path/config.json"));
        assert!(matches!(err, ConfigError::ReadFile { .. }));
    }

    #[test]
    fn test_invalid_json() {
        let file = write_config("{ invalid json }");
        let err = assert_err(Config::load(file.path()));
        assert!(matches!(err, ConfigError::ParseJson { .. }));
    }
}
