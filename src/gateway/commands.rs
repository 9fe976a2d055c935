//! Bot commands.

use tracing::{info, warn};

use super::help::{START, help_text};
use super::{Gateway, GatewayError, Inbound};
use crate::engines::{EngineKind, parse_languages};
use crate::envelope::MessageType;
use crate::store::ConversationStyle;

/// DeepL target languages accepted in `/tr`.
const LANGUAGES: [&str; 32] = [
    "BG", "ZH", "CS", "DA", "NL", "EN", "EN-GB", "EN-US", "ET", "FI", "FR", "DE", "EL", "HU", "ID", "IT",
    "JA", "KO", "LV", "LT", "NB", "PL", "PT", "PT-BR", "RO", "RU", "SK", "SL", "ES", "SV", "TR", "UK",
];

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Start,
    Help(Option<String>),
    /// `/bing`, `/claude` and the other single-engine switches.
    UseEngine(EngineKind),
    SetEngines(String),
    Style(ConversationStyle),
    Plaintext(String),
    Reset,
    /// `/tr`; languages given inline replace the stored ones.
    Translate { languages: Option<String>, text: String },
    Imagine(String),
    Ideogram(String),
    Ping,
    Redrive,
}

impl Command {
    /// Parse a `/command args` message. Unknown commands yield `None` and
    /// are treated as plain text.
    pub fn parse(text: &str) -> Option<Self> {
        let text = text.trim();
        let rest = text.strip_prefix('/')?;
        let (name, args) = match rest.split_once(char::is_whitespace) {
            Some((name, args)) => (name, args.trim()),
            None => (rest, ""),
        };
        let name = name.split('@').next().unwrap_or_default().to_lowercase();
        let args = args.to_string();

        let command = match name.as_str() {
            "start" => Command::Start,
            "help" => Command::Help(Some(args).filter(|a| !a.is_empty())),
            "set_engines" => Command::SetEngines(args),
            "plaintext" => Command::Plaintext(args),
            "reset" => Command::Reset,
            "tr" => parse_translate(&args),
            "imagine" => Command::Imagine(args),
            "ideogram" => Command::Ideogram(args),
            "ping" => Command::Ping,
            "redrive" => Command::Redrive,
            other => {
                if let Ok(style) = other.parse::<ConversationStyle>() {
                    Command::Style(style)
                } else {
                    Command::UseEngine(EngineKind::parse_chat(other)?)
                }
            }
        };
        Some(command)
    }
}

fn is_language_list(word: &str) -> bool {
    word.split(',')
        .map(|code| code.trim().to_uppercase())
        .all(|code| LANGUAGES.contains(&code.as_str()))
}

fn parse_translate(args: &str) -> Command {
    let (first, rest) = match args.split_once(char::is_whitespace) {
        Some((first, rest)) => (first, rest.trim()),
        None => (args, ""),
    };
    if !first.is_empty() && is_language_list(first) {
        Command::Translate {
            languages: Some(parse_languages(first).join(",")),
            text: rest.to_string(),
        }
    } else {
        Command::Translate {
            languages: None,
            text: args.to_string(),
        }
    }
}

fn parse_switch(value: &str) -> Option<bool> {
    match value.trim().to_lowercase().as_str() {
        "on" | "true" | "yes" | "1" => Some(true),
        "off" | "false" | "no" | "0" => Some(false),
        _ => None,
    }
}

impl Gateway {
    pub(crate) async fn run_command(&self, command: Command, inbound: &Inbound) -> Result<(), GatewayError> {
        let (chat_id, message_id) = (inbound.chat_id, inbound.message_id);
        info!("Command {:?} from {}", command, inbound.user_id);

        match command {
            Command::Start => self.reply(chat_id, message_id, START, true).await,
            Command::Help(topic) => self.reply(chat_id, message_id, help_text(topic.as_deref()), true).await,
            Command::UseEngine(kind) => {
                let mut config = self.user_config(inbound.user_id);
                config.engines = vec![kind.name().to_string()];
                self.save_config(inbound.user_id, &config)?;
                self.reply(chat_id, message_id, "AI engine has been set", false).await;
            }
            Command::SetEngines(names) => {
                let mut engines = Vec::new();
                let mut unknown = Vec::new();
                for name in names.split(',').map(str::trim).filter(|n| !n.is_empty()) {
                    match EngineKind::parse_chat(name) {
                        Some(kind) if !engines.contains(&kind.name().to_string()) => engines.push(kind.name().to_string()),
                        Some(_) => {}
                        None => unknown.push(name.to_string()),
                    }
                }
                if !unknown.is_empty() || engines.is_empty() {
                    let text = format!(
                        "Unknown engine(s): {}. Available: {}",
                        unknown.join(", "),
                        EngineKind::CHAT.map(|k| k.name()).join(", ")
                    );
                    self.reply(chat_id, message_id, &text, false).await;
                    return Ok(());
                }
                let mut config = self.user_config(inbound.user_id);
                config.engines = engines;
                self.save_config(inbound.user_id, &config)?;
                let text = format!("AI engines have been set: {}", config.engines.join(", "));
                self.reply(chat_id, message_id, &text, false).await;
            }
            Command::Style(style) => {
                let mut config = self.user_config(inbound.user_id);
                config.style = style;
                self.save_config(inbound.user_id, &config)?;
                config.engines = vec![EngineKind::Bing.name().to_string()];
                self.publish(inbound, MessageType::Command, "reset", config)?;
                let text = format!("Conversation style has been set to '{style}'");
                self.reply(chat_id, message_id, &text, false).await;
            }
            Command::Plaintext(value) => {
                let Some(enabled) = parse_switch(&value) else {
                    self.reply(chat_id, message_id, "Usage: /plaintext on|off", false).await;
                    return Ok(());
                };
                let mut config = self.user_config(inbound.user_id);
                config.plaintext = enabled;
                self.save_config(inbound.user_id, &config)?;
                let state = if enabled { "on" } else { "off" };
                let text = format!("'Output in plaintext' has been set to '{state}'");
                self.reply(chat_id, message_id, &text, false).await;
            }
            Command::Reset => {
                let config = self.user_config(inbound.user_id);
                self.publish(inbound, MessageType::Command, "reset", config)?;
                self.reply(chat_id, message_id, "Conversation has been reset", false).await;
            }
            Command::Translate { languages, text } => {
                let mut config = self.user_config(inbound.user_id);
                if let Some(languages) = languages {
                    config.languages = languages;
                    self.save_config(inbound.user_id, &config)?;
                }
                if text.is_empty() {
                    let reply = format!("Translation languages: {}. Usage: /tr [languages] TEXT", config.languages);
                    self.reply(chat_id, message_id, &reply, false).await;
                    return Ok(());
                }
                config.engines = vec![EngineKind::DeepL.name().to_string()];
                self.publish(inbound, MessageType::Translate, &text, config)?;
            }
            Command::Imagine(prompt) => {
                self.publish_prompt(inbound, EngineKind::Dalle, MessageType::Images, &prompt, "/imagine")
                    .await?
            }
            Command::Ideogram(prompt) => {
                self.publish_prompt(inbound, EngineKind::Ideogram, MessageType::Ideogram, &prompt, "/ideogram")
                    .await?
            }
            Command::Ping => {
                let config = self.user_config(inbound.user_id);
                self.publish(inbound, MessageType::Text, &inbound.text, config)?;
            }
            Command::Redrive => {
                if !self.is_admin(inbound) {
                    warn!("Non-admin {} asked for a redrive", inbound.user_id);
                    return Ok(());
                }
                let moved = self.dead_letters().redrive();
                let text = format!("Redriven {moved} message(s)");
                self.reply(chat_id, message_id, &text, false).await;
            }
        }
        Ok(())
    }

    async fn publish_prompt(
        &self,
        inbound: &Inbound,
        engine: EngineKind,
        kind: MessageType,
        prompt: &str,
        usage: &str,
    ) -> Result<(), GatewayError> {
        if prompt.is_empty() {
            let text = format!("Usage: {usage} PROMPT");
            self.reply(inbound.chat_id, inbound.message_id, &text, false).await;
            return Ok(());
        }
        let mut config = self.user_config(inbound.user_id);
        config.engines = vec![engine.name().to_string()];
        self.publish(inbound, kind, prompt, config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::Queue;
    use crate::gateway::tests::{harness, private_update, published, settings};
    use crate::relay::tests::Sent;

    #[test]
    fn test_parse_commands() {
        assert_eq!(Command::parse("/start"), Some(Command::Start));
        assert_eq!(Command::parse("/help tr"), Some(Command::Help(Some("tr".into()))));
        assert_eq!(Command::parse("/help"), Some(Command::Help(None)));
        assert_eq!(Command::parse("/Claude"), Some(Command::UseEngine(EngineKind::Claude)));
        assert_eq!(Command::parse("/llama@aigate_bot"), Some(Command::UseEngine(EngineKind::Llama)));
        assert_eq!(Command::parse("/precise"), Some(Command::Style(ConversationStyle::Precise)));
        assert_eq!(Command::parse("/imagine  a red fox "), Some(Command::Imagine("a red fox".into())));
        assert_eq!(Command::parse("hello /start"), None);
        assert_eq!(Command::parse("/dalle"), None);
        assert_eq!(Command::parse("/weather"), None);
    }

    #[test]
    fn test_parse_translate_languages() {
        assert_eq!(Command::parse("/tr pl,en-gb Good morning"), Some(Command::Translate {
            languages: Some("PL,EN-GB".into()),
            text: "Good morning".into(),
        }));
        assert_eq!(Command::parse("/tr Good morning"), Some(Command::Translate {
            languages: None,
            text: "Good morning".into(),
        }));
        assert_eq!(Command::parse("/tr uk"), Some(Command::Translate {
            languages: Some("UK".into()),
            text: String::new(),
        }));
    }

    async fn run(text: &str) -> (crate::gateway::tests::Harness, Vec<crate::envelope::RequestEnvelope>) {
        let h = harness(settings());
        h.gateway.handle_update(private_update(42, text)).await.unwrap();
        let requests = published(&h.requests);
        (h, requests)
    }

    #[tokio::test]
    async fn test_engine_switch_is_persisted() {
        let (h, requests) = run("/claude").await;
        assert!(requests.is_empty());
        assert_eq!(h.db.read_config(42, &[]).engines, vec!["claude"]);
        assert_eq!(h.messenger.texts(), vec!["AI engine has been set"]);
    }

    #[tokio::test]
    async fn test_set_engines_validates_names() {
        let (h, _) = run("/set_engines bing, dalle").await;
        assert!(h.messenger.texts()[0].starts_with("Unknown engine(s): dalle"));
        assert_eq!(h.db.read_config(42, &["bing".into()]).engines, vec!["bing"]);

        h.gateway
            .handle_update(private_update(42, "/set_engines bard,ChatGPT,gemini"))
            .await
            .unwrap();
        assert_eq!(h.db.read_config(42, &[]).engines, vec!["bard", "chatgpt", "gemini"]);
    }

    #[tokio::test]
    async fn test_style_resets_bing() {
        let (h, requests) = run("/balanced").await;
        assert_eq!(h.db.read_config(42, &[]).style, ConversationStyle::Balanced);
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].kind, MessageType::Command);
        assert_eq!(requests[0].text, "reset");
        assert_eq!(requests[0].engines(), ["bing"]);
    }

    #[tokio::test]
    async fn test_plaintext_switch() {
        let (h, _) = run("/plaintext on").await;
        assert!(h.db.read_config(42, &[]).plaintext);
        assert_eq!(h.messenger.texts(), vec!["'Output in plaintext' has been set to 'on'"]);

        h.gateway.handle_update(private_update(42, "/plaintext maybe")).await.unwrap();
        assert_eq!(h.messenger.texts()[1], "Usage: /plaintext on|off");
    }

    #[tokio::test]
    async fn test_translate_goes_to_deepl_with_new_languages() {
        let (h, requests) = run("/tr de,fr Good morning").await;
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].kind, MessageType::Translate);
        assert_eq!(requests[0].text, "Good morning");
        assert_eq!(requests[0].engines(), ["deepl"]);
        assert_eq!(requests[0].config.languages, "DE,FR");
        assert_eq!(h.db.read_config(42, &[]).languages, "DE,FR");
    }

    #[tokio::test]
    async fn test_image_prompts_are_routed() {
        let (h, requests) = run("/imagine a red fox").await;
        assert_eq!(requests[0].kind, MessageType::Images);
        assert_eq!(requests[0].engines(), ["dalle"]);

        h.gateway.handle_update(private_update(42, "/ideogram")).await.unwrap();
        assert!(published(&h.requests).is_empty());
        assert_eq!(h.messenger.texts(), vec!["Usage: /ideogram PROMPT"]);
    }

    #[tokio::test]
    async fn test_reset_publishes_command_to_user_engines() {
        let (_, requests) = run("/reset").await;
        assert_eq!(requests[0].kind, MessageType::Command);
        assert_eq!(requests[0].engines(), ["bing"]);
    }

    #[tokio::test]
    async fn test_help_is_markdown() {
        let (h, requests) = run("/help imagine").await;
        assert!(requests.is_empty());
        match &h.messenger.sent()[0] {
            Sent::Text { options, text, .. } => {
                assert!(options.markdown);
                assert!(text.starts_with("/imagine"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_redrive_is_admin_only() {
        let h = harness(settings());
        let source = Queue::new("results");
        h.dead_letters.park_for_test(&source, "lost");

        h.gateway.handle_update(private_update(42, "/redrive")).await.unwrap();
        assert_eq!(h.dead_letters.len(), 1);

        h.gateway.handle_update(private_update(1, "/redrive")).await.unwrap();
        assert!(h.dead_letters.is_empty());
        assert_eq!(source.len(), 1);
        assert_eq!(h.messenger.texts(), vec!["Redriven 1 message(s)"]);
    }
}
