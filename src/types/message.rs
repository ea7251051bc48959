//! Channel-facing message types.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Downstream destination for outbound messages.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Recipient {
    pub chat_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<String>,
}

impl Recipient {
    pub fn new(chat_id: impl Into<String>) -> Self {
        Self {
            chat_id: chat_id.into(),
            thread_id: None,
        }
    }

    pub fn with_thread(mut self, thread_id: impl Into<String>) -> Self {
        self.thread_id = Some(thread_id.into());
        self
    }

    /// Rate-limit key for this recipient within `scope`.
    ///
    /// Threads share their chat's key: the channel throttles per chat.
    pub fn rate_key(&self, scope: &str) -> String {
        format!("{}:{}", scope, self.chat_id)
    }
}

impl fmt::Display for Recipient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.thread_id {
            Some(t) => write!(f, "{}#{}", self.chat_id, t),
            None => f.write_str(&self.chat_id),
        }
    }
}

/// Opaque identifier of a delivered message.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageHandle(pub String);

impl MessageHandle {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MessageHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Formatting dialect of an outbound text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TextFormat {
    #[default]
    Plain,
    MarkdownV2,
}

/// Outcome of a successful edit call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EditStatus {
    Applied,
    /// The channel kept the previous content (identical edit).
    Unchanged,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum NavTarget {
    Url(url::Url),
    Callback(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NavButton {
    pub label: String,
    pub target: NavTarget,
}

impl NavButton {
    pub fn url(label: impl Into<String>, url: url::Url) -> Self {
        Self {
            label: label.into(),
            target: NavTarget::Url(url),
        }
    }

    pub fn callback(label: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            target: NavTarget::Callback(data.into()),
        }
    }
}

/// Navigation affordance attached to the terminal message of a stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Navigation {
    pub page_id: String,
    /// One button per row, in display order.
    pub buttons: Vec<NavButton>,
}

/// A message to send, or the new content of an edited message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboundMessage {
    pub text: String,
    #[serde(default)]
    pub format: TextFormat,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<MessageHandle>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub navigation: Option<Navigation>,
}

impl OutboundMessage {
    pub fn plain(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            format: TextFormat::Plain,
            reply_to: None,
            navigation: None,
        }
    }

    pub fn markdown(text: impl Into<String>) -> Self {
        Self {
            format: TextFormat::MarkdownV2,
            ..Self::plain(text)
        }
    }

    pub fn reply_to(mut self, handle: MessageHandle) -> Self {
        self.reply_to = Some(handle);
        self
    }

    pub fn with_navigation(mut self, navigation: Navigation) -> Self {
        self.navigation = Some(navigation);
        self
    }
}
