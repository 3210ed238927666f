use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Something the bot sends to a WhatsApp address.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundMessage {
    Text {
        text: String,
    },
    /// A pre-approved WhatsApp template.
    Template {
        name: String,
        language: String,
        #[serde(default)]
        parameters: Vec<String>,
    },
    Media {
        media_type: MediaKind,
        url: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        caption: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        filename: Option<String>,
    },
    /// Quick-reply buttons under a prompt.
    Buttons {
        text: String,
        buttons: Vec<ReplyButton>,
    },
    /// Typing indicator shown while the bot "writes".
    Typing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Image,
    Video,
    Audio,
    Document,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct ReplyButton {
    pub id: String,
    pub title: String,
}

impl OutboundMessage {
    pub fn text(text: impl Into<String>) -> Self {
        OutboundMessage::Text { text: text.into() }
    }

    /// Short human-readable form, used by the console sender and in logs.
    pub fn preview(&self) -> String {
        match self {
            OutboundMessage::Text { text } => text.clone(),
            OutboundMessage::Template { name, language, parameters } => {
                format!("[template {} ({})] {}", name, language, parameters.join(", "))
            }
            OutboundMessage::Media { media_type, url, caption, .. } => match caption {
                Some(caption) => format!("[{:?} {}] {}", media_type, url, caption),
                None => format!("[{:?} {}]", media_type, url),
            },
            OutboundMessage::Buttons { text, buttons } => {
                let labels: Vec<String> = buttons
                    .iter()
                    .enumerate()
                    .map(|(i, b)| format!("{}) {}", i + 1, b.title))
                    .collect();
                format!("{}\n{}", text, labels.join("\n"))
            }
            OutboundMessage::Typing => "...".to_string(),
        }
    }
}

/// Returned by a sender once the channel accepted the message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryReceipt {
    pub message_id: String,
    pub sent_at: DateTime<Utc>,
}
