use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::error;

use super::{Answer, Engine, EngineError, EngineKind, api_error};
use crate::envelope::RequestEnvelope;
use crate::store::UserContext;

const FREE_API_URL: &str = "https://api-free.deepl.com/v2/translate";
const PRO_API_URL: &str = "https://api.deepl.com/v2/translate";

#[derive(Serialize)]
struct TranslateRequest<'a> {
    text: [&'a str; 1],
    target_lang: &'a str,
}

#[derive(Deserialize)]
struct TranslateResponse {
    translations: Vec<Translation>,
}

#[derive(Deserialize)]
struct Translation {
    text: String,
}

/// Target language codes from a comma separated list.
pub fn parse_languages(languages: &str) -> Vec<String> {
    languages
        .split(',')
        .map(|l| l.trim().to_uppercase())
        .filter(|l| !l.is_empty())
        .collect()
}

/// Text to translate, without a leading `/tr` command word.
fn source_text(text: &str) -> &str {
    let text = text.trim();
    match text.strip_prefix("/tr") {
        Some(rest) if rest.is_empty() || rest.starts_with(char::is_whitespace) => rest.trim_start(),
        _ => text,
    }
}

/// Free-plan keys end in `:fx` and use a separate host.
fn api_url(auth_key: &str) -> &'static str {
    if auth_key.ends_with(":fx") { FREE_API_URL } else { PRO_API_URL }
}

pub struct DeeplEngine {
    http: reqwest::Client,
    auth_key: String,
}

impl DeeplEngine {
    pub fn new(http: reqwest::Client, auth_key: String) -> Self {
        Self { http, auth_key }
    }

    async fn translate(&self, text: &str, target_lang: &str) -> Result<String, EngineError> {
        let response = self
            .http
            .post(api_url(&self.auth_key))
            .header("Authorization", format!("DeepL-Auth-Key {}", self.auth_key))
            .json(&TranslateRequest {
                text: [text],
                target_lang,
            })
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(api_error("DeepL", response).await);
        }
        let body: TranslateResponse = response.json().await?;
        body.translations
            .into_iter()
            .next()
            .map(|t| t.text)
            .ok_or_else(|| EngineError::response("DeepL", "no translation returned"))
    }
}

#[async_trait]
impl Engine for DeeplEngine {
    fn engine_type(&self) -> EngineKind {
        EngineKind::DeepL
    }

    async fn ask(&self, request: &RequestEnvelope, _context: &mut UserContext) -> Result<Answer, EngineError> {
        let languages = parse_languages(&request.config.languages);
        if languages.is_empty() {
            return Err(EngineError::Rejected(
                "No target languages configured. Use /tr LANG[,LANG] TEXT".to_string(),
            ));
        }
        let text = source_text(&request.text);
        let mut translations = Vec::new();
        for lang in languages {
            let translated = match self.translate(text, &lang).await {
                Ok(translated) => translated,
                Err(e) => {
                    error!("DeepL translation to {lang} failed: {e}");
                    e.to_string()
                }
            };
            translations.push((lang, translated));
        }
        Ok(Answer::Translations(translations))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_languages() {
        assert_eq!(parse_languages("pl, en-gb,,DE "), vec!["PL", "EN-GB", "DE"]);
        assert!(parse_languages("").is_empty());
    }

    #[test]
    fn test_source_text_keeps_inner_slashes() {
        assert_eq!(source_text("/tr Good morning"), "Good morning");
        assert_eq!(source_text("see example.com/travel and /tr/x"), "see example.com/travel and /tr/x");
        assert_eq!(source_text("/travel plans"), "/travel plans");
        assert_eq!(source_text("  hello /tr there "), "hello /tr there");
    }

    #[tokio::test]
    async fn test_no_languages_is_reported() {
        let engine = DeeplEngine::new(reqwest::Client::new(), "key:fx".to_string());
        let request = RequestEnvelope {
            kind: crate::envelope::MessageType::Translate,
            user_id: 1,
            username: None,
            chat_id: 1,
            message_id: 1,
            update_id: 1,
            text: "hello".to_string(),
            timestamp: 0,
            config: crate::store::UserConfig {
                languages: " , ".to_string(),
                ..Default::default()
            },
            file: None,
        };
        let mut context = UserContext::new(1, 1, "deepl", "r1", None);
        let err = engine.ask(&request, &mut context).await.unwrap_err();
        assert!(!err.is_transient());
        assert!(err.to_string().starts_with("No target languages configured"), "{err}");
    }

    #[test]
    fn test_free_keys_use_free_host() {
        assert_eq!(api_url("abc:fx"), FREE_API_URL);
        assert_eq!(api_url("abc"), PRO_API_URL);
    }
}
