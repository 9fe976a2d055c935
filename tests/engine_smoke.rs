//! Live calls against vendor APIs. Each test skips unless its key is set.
//!
//! Run with: cargo test --features integ_test --test engine_smoke

#[cfg(feature = "integ_test")]
mod tests {
    use std::sync::Arc;

    use aigate::engines::{Answer, ClaudeEngine, DeeplEngine, Engine};
    use aigate::envelope::{MessageType, RequestEnvelope};
    use aigate::store::{Database, UserConfig, UserContext};

    fn request(kind: MessageType, text: &str, languages: &str) -> RequestEnvelope {
        RequestEnvelope {
            kind,
            user_id: 1,
            username: Some("smoke".to_string()),
            chat_id: 1,
            message_id: 1,
            update_id: 1,
            text: text.to_string(),
            timestamp: chrono::Utc::now().timestamp(),
            config: UserConfig {
                languages: languages.to_string(),
                ..UserConfig::default()
            },
            file: None,
        }
    }

    #[tokio::test]
    async fn test_deepl_translates() {
        let Ok(key) = std::env::var("DEEPL_AUTH_KEY") else {
            eprintln!("Skipping: DEEPL_AUTH_KEY not set");
            return;
        };
        let engine = DeeplEngine::new(reqwest::Client::new(), key);
        let mut context = UserContext::new(1, 1, "deepl", "smoke-1", None);
        let answer = engine
            .ask(&request(MessageType::Translate, "/tr Good morning", "DE,FR"), &mut context)
            .await
            .expect("DeepL call failed");

        let Answer::Translations(translations) = answer else {
            panic!("expected translations, got {answer:?}");
        };
        let languages: Vec<&str> = translations.iter().map(|(lang, _)| lang.as_str()).collect();
        assert_eq!(languages, ["DE", "FR"]);
        assert!(translations.iter().all(|(_, text)| !text.is_empty()));
    }

    #[tokio::test]
    async fn test_claude_answers_and_keeps_history() {
        let Ok(key) = std::env::var("ANTHROPIC_API_KEY") else {
            eprintln!("Skipping: ANTHROPIC_API_KEY not set");
            return;
        };
        let db = Arc::new(Database::in_memory().unwrap());
        let engine = ClaudeEngine::new(reqwest::Client::new(), key, db);
        let mut context = UserContext::new(1, 1, "claude", "smoke-2", None);
        let answer = engine
            .ask(&request(MessageType::Text, "Reply with the single word: pong", "PL"), &mut context)
            .await
            .expect("Claude call failed");

        let Answer::Text(text) = answer else {
            panic!("expected text, got {answer:?}");
        };
        assert!(text.to_lowercase().contains("pong"), "unexpected answer: {text}");
        assert!(context.conversation_id.is_some());
    }
}
