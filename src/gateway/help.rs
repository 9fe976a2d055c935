//! MarkdownV2 help texts.

pub(super) const START: &str = r"Welcome to chat with AI bot\! Here you can get answers from different LLMs, draw images from your prompts with DALL\-E 2 or Ideogram and translate text with DeepL API\.
Supported commands are:

/help \- Get help on a command\. Usage: /help COMMAND
/tr \- Translate text to other language\(s\) using DeepL API
/imagine \- Generate images using DALL\-E 2 engine
/ideogram \- Generate images using Ideogram
/bing \- Switch answers to Bing AI model
/bard \- Switch answers to Google Bard AI model
/chatgpt \- Switch answers to OpenAI ChatGPT model
/claude \- Switch answers to Anthropic Claude model
/gemini \- Switch answers to Google Gemini model
/llama \- Switch answers to Meta LLama2 AI model
/set\_engines \- Activates multiple AI engines at once, comma separated list
/creative \- Set tone of responses to more creative on Bing model \(Default\)
/balanced \- Set tone of responses to more balanced
/precise \- Set tone of responses to more precise
/plaintext \- Send answers without formatting: /plaintext on or /plaintext off
/reset \- Start a new conversation";

const TRANSLATE: &str = r"/tr \- Translates text to one or multiple languages\.
Put language codes separated by commas right after the command to change the target languages, like this: /tr pl,ru Good morning\.
The languages are remembered and used by every following /tr\. Example of a language list: _pl,ru,en\-gb_

Supported languages are:

BG    Bulgarian
ZH    Chinese
CS    Czech
DA    Danish
NL    Dutch
EN\-GB    English UK
EN\-US    English US
ET    Estonian
FI    Finnish
FR    French
DE    German
EL    Greek
HU    Hungarian
ID    Indonesian
IT    Italian
JA    Japanese
KO    Korean
LV    Latvian
LT    Lithuanian
NB    Norwegian
PL    Polish
PT    Portuguese
RO    Romanian
RU    Russian
SK    Slovak
SL    Slovenian
ES    Spanish
SV    Swedish
TR    Turkish
UK    Ukrainian";

const IMAGINE: &str = r"/imagine \- Creating images using *DALL\-E 2* AI engine\. Usage: /imagine PROMPT
Example: /imagine Cute kitty plays with yarn ball
/ideogram works the same way with the *Ideogram* engine\.";

const STYLES: &str = r"Sets the tone of responses to the Bing AI engine\. Has no effect on other engines\. Each mode will start a new conversation
Available values are:
    \• *creative* \(default\)\. For poems, stories, jokes and other content where imagination matters\. Friendly and informal tone\.
    \• *balanced*\. Information, facts, opinions and suggestions based on your queries\. Polite and neutral tone\.
    \• *precise*\. Precise and accurate answers for tasks that need logic and reasoning\. Concise and formal tone\.";

const ENGINES: &str = r"/set\_engines \- You can activate multiple AI engines to set them answering in parallel\. Put their names separated with comma as an argument\.
Example: /set\_engines bing,bard,chatgpt,llama \- all AI engines will respond simultaneously\.
Available engines: bing, bard, chatgpt, claude, gemini, llama
This command persists its value in the user configuration, so it will work until any of following commands applied:
    \• /bing
    \• /bard
    \• /chatgpt
    \• /claude
    \• /gemini
    \• /llama
    \• /set\_engines";

const DEFAULT: &str = r"If you need help with bot command, please type the command
    with /help prefix, for example *\/help tr*";

/// Help for `/help <topic>`.
pub(super) fn help_text(topic: Option<&str>) -> &'static str {
    let topic = topic
        .map(|t| t.trim().trim_start_matches('/').to_lowercase())
        .unwrap_or_default();
    match topic.as_str() {
        "tr" => TRANSLATE,
        "imagine" | "ideogram" => IMAGINE,
        "creative" | "balanced" | "precise" => STYLES,
        "engines" | "set_engines" => ENGINES,
        _ => DEFAULT,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topics() {
        assert_eq!(help_text(Some("tr")), TRANSLATE);
        assert_eq!(help_text(Some("/Precise")), STYLES);
        assert_eq!(help_text(Some("set_engines")), ENGINES);
        assert_eq!(help_text(Some("weather")), DEFAULT);
        assert_eq!(help_text(None), DEFAULT);
    }
}
