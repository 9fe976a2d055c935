//! Per-user settings.

use std::fmt;
use std::str::FromStr;

use rusqlite::{OptionalExtension, params};
use serde::{Deserialize, Serialize};
use tracing::error;

use super::{Database, StoreError, now};

/// Tone requested from the Bing engine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConversationStyle {
    #[default]
    Creative,
    Balanced,
    Precise,
}

impl ConversationStyle {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConversationStyle::Creative => "creative",
            ConversationStyle::Balanced => "balanced",
            ConversationStyle::Precise => "precise",
        }
    }
}

impl fmt::Display for ConversationStyle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConversationStyle {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "creative" => Ok(ConversationStyle::Creative),
            "balanced" => Ok(ConversationStyle::Balanced),
            "precise" => Ok(ConversationStyle::Precise),
            other => Err(format!("unknown conversation style '{other}'")),
        }
    }
}

fn default_engines() -> Vec<String> {
    vec!["bing".to_string()]
}

fn default_languages() -> String {
    "PL".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserConfig {
    #[serde(default)]
    pub user_id: i64,
    /// Engines answering this user's text messages.
    #[serde(default = "default_engines")]
    pub engines: Vec<String>,
    #[serde(default)]
    pub style: ConversationStyle,
    /// DeepL target languages, comma separated.
    #[serde(default = "default_languages")]
    pub languages: String,
    #[serde(default)]
    pub plaintext: bool,
    /// Unix seconds of the last write.
    #[serde(default)]
    pub updated: i64,
}

impl Default for UserConfig {
    fn default() -> Self {
        Self {
            user_id: 0,
            engines: default_engines(),
            style: ConversationStyle::default(),
            languages: default_languages(),
            plaintext: false,
            updated: 0,
        }
    }
}

impl UserConfig {
    /// Fresh settings for a user who never changed anything.
    pub fn new(user_id: i64, engines: &[String]) -> Self {
        Self {
            user_id,
            engines: if engines.is_empty() { default_engines() } else { engines.to_vec() },
            updated: now(),
            ..Self::default()
        }
    }
}

impl Database {
    pub fn load_config(&self, user_id: i64) -> Result<Option<UserConfig>, StoreError> {
        let raw: Option<String> = self
            .conn()
            .query_row(
                "SELECT config FROM user_configurations WHERE user_id = ?1",
                params![user_id],
                |row| row.get(0),
            )
            .optional()?;
        match raw {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    /// Stored settings, or defaults built from `default_engines` when the
    /// user has none or the row cannot be read.
    pub fn read_config(&self, user_id: i64, default_engines: &[String]) -> UserConfig {
        match self.load_config(user_id) {
            Ok(Some(config)) => config,
            Ok(None) => UserConfig::new(user_id, default_engines),
            Err(e) => {
                error!("Cannot read configuration of user {user_id}: {e}");
                UserConfig::new(user_id, default_engines)
            }
        }
    }

    pub fn write_config(&self, user_id: i64, config: &UserConfig) -> Result<(), StoreError> {
        let mut config = config.clone();
        config.user_id = user_id;
        config.updated = now();
        let json = serde_json::to_string(&config)?;
        self.conn().execute(
            "INSERT INTO user_configurations (user_id, config) VALUES (?1, ?2)
             ON CONFLICT(user_id) DO UPDATE SET config = excluded.config",
            params![user_id, json],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_user_gets_defaults() {
        let db = Database::in_memory().unwrap();
        let config = db.read_config(9, &[]);
        assert_eq!(config.user_id, 9);
        assert_eq!(config.engines, vec!["bing"]);
        assert_eq!(config.languages, "PL");
        assert_eq!(config.style, ConversationStyle::Creative);
        assert!(!config.plaintext);
    }

    #[test]
    fn test_configured_default_engines() {
        let db = Database::in_memory().unwrap();
        let config = db.read_config(9, &["claude".to_string(), "gemini".to_string()]);
        assert_eq!(config.engines, vec!["claude", "gemini"]);
    }

    #[test]
    fn test_write_then_read() {
        let db = Database::in_memory().unwrap();
        let mut config = UserConfig::new(3, &[]);
        config.engines = vec!["bard".to_string(), "chatgpt".to_string()];
        config.style = ConversationStyle::Precise;
        config.plaintext = true;
        db.write_config(3, &config).unwrap();

        // overwrite keeps a single row
        config.languages = "EN-GB,DE".to_string();
        db.write_config(3, &config).unwrap();

        let stored = db.read_config(3, &[]);
        assert_eq!(stored.engines, vec!["bard", "chatgpt"]);
        assert_eq!(stored.style, ConversationStyle::Precise);
        assert_eq!(stored.languages, "EN-GB,DE");
        assert!(stored.plaintext);
        assert!(stored.updated > 0);
    }

    #[test]
    fn test_legacy_row_without_optional_fields() {
        let db = Database::in_memory().unwrap();
        db.conn()
            .execute(
                "INSERT INTO user_configurations (user_id, config) VALUES (1, ?1)",
                params![r#"{"user_id": 1, "engines": ["llama"]}"#],
            )
            .unwrap();
        let config = db.read_config(1, &[]);
        assert_eq!(config.engines, vec!["llama"]);
        assert_eq!(config.languages, "PL");
    }

    #[test]
    fn test_style_parsing() {
        assert_eq!("Balanced".parse::<ConversationStyle>(), Ok(ConversationStyle::Balanced));
        assert!("loud".parse::<ConversationStyle>().is_err());
    }
}
