//! Bus message envelopes.
//!
//! A request envelope is what the gateway publishes for every accepted
//! Telegram update. Engine workers answer with a result envelope whose
//! `response` is zlib-compressed and base64-encoded so arbitrary vendor
//! output survives the JSON hop unchanged.

use std::fmt;
use std::io::{Read, Write};

use base64::Engine as _;
use flate2::Compression;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use serde::{Deserialize, Serialize};

use crate::bus::Attributes;
use crate::store::UserConfig;

#[derive(Debug, thiserror::Error)]
pub enum EnvelopeError {
    #[error("invalid base64 payload: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("invalid zlib stream: {0}")]
    Zlib(#[from] std::io::Error),
    #[error("payload is not UTF-8: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),
    #[error("malformed envelope: {0}")]
    Json(#[from] serde_json::Error),
}

/// Routing class of a request, used as the `type` bus attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    Text,
    Command,
    Images,
    Ideogram,
    Translate,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::Text => "text",
            MessageType::Command => "command",
            MessageType::Images => "images",
            MessageType::Ideogram => "ideogram",
            MessageType::Translate => "translate",
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Normalized inbound message, one per accepted update.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestEnvelope {
    #[serde(rename = "type")]
    pub kind: MessageType,
    pub user_id: i64,
    #[serde(default)]
    pub username: Option<String>,
    pub chat_id: i64,
    pub message_id: i32,
    pub update_id: u32,
    pub text: String,
    pub timestamp: i64,
    pub config: UserConfig,
    /// Blob storage key of an attached image (`att/<name>`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
}

impl RequestEnvelope {
    /// Engines this envelope is addressed to.
    pub fn engines(&self) -> &[String] {
        &self.config.engines
    }

    /// Bus attributes matched by subscription filter policies.
    pub fn attributes(&self) -> Attributes {
        let mut attrs = Attributes::new();
        attrs.insert_string("type", self.kind.as_str());
        attrs.insert_list("engines", self.config.engines.iter().cloned());
        attrs
    }

    /// Build the result envelope answering this request.
    pub fn result(&self, engine: &str, response: &str, kind: MessageType) -> ResultEnvelope {
        ResultEnvelope {
            chat_id: self.chat_id,
            message_id: self.message_id,
            engine: engine.to_string(),
            response: encode_message(response),
            kind,
            text: self.text.clone(),
            plaintext: self.config.plaintext,
        }
    }

    pub fn to_json(&self) -> Result<String, EnvelopeError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(body: &str) -> Result<Self, EnvelopeError> {
        Ok(serde_json::from_str(body)?)
    }
}

/// An engine's answer on its way back to the chat.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultEnvelope {
    pub chat_id: i64,
    pub message_id: i32,
    pub engine: String,
    /// Encoded with [`encode_message`].
    pub response: String,
    #[serde(rename = "type")]
    pub kind: MessageType,
    /// Original prompt, used as the caption of generated images.
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub plaintext: bool,
}

impl ResultEnvelope {
    pub fn decoded_response(&self) -> Result<String, EnvelopeError> {
        decode_message(&self.response)
    }

    pub fn to_json(&self) -> Result<String, EnvelopeError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(body: &str) -> Result<Self, EnvelopeError> {
        Ok(serde_json::from_str(body)?)
    }
}

/// Compress `text` with zlib and encode it as standard base64.
pub fn encode_message(text: &str) -> String {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    // Writes into a Vec cannot fail.
    let _ = encoder.write_all(text.as_bytes());
    let zipped = encoder.finish().unwrap_or_default();
    base64::engine::general_purpose::STANDARD.encode(zipped)
}

/// Inverse of [`encode_message`].
pub fn decode_message(encoded: &str) -> Result<String, EnvelopeError> {
    let zipped = base64::engine::general_purpose::STANDARD.decode(encoded.trim())?;
    let mut decoder = ZlibDecoder::new(zipped.as_slice());
    let mut raw = Vec::new();
    decoder.read_to_end(&mut raw)?;
    Ok(String::from_utf8(raw)?)
}
