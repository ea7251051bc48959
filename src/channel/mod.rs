//! 下游渠道模块：消息发送/编辑的抽象接口与用于测试的记录型实现。
//!
//! # Downstream Channel
//!
//! The messaging channel is an external collaborator. The engine only needs
//! to send a message, edit one in place and attach a navigation affordance.
//!
//! Implementations report failures through the shared error taxonomy:
//!
//! | Condition | Error |
//! |-----------|-------|
//! | "retry after N seconds" | [`Error::RetryAfter`] |
//! | edit with identical content | [`Error::NotModified`] |
//! | network / 5xx | [`Error::Transient`] |
//! | malformed request, unknown message | [`Error::Permanent`] |

use crate::types::{EditStatus, MessageHandle, Navigation, OutboundMessage, Recipient};
use crate::{Error, ErrorContext, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

#[async_trait]
pub trait ChannelClient: Send + Sync {
    async fn send(&self, recipient: &Recipient, message: &OutboundMessage) -> Result<MessageHandle>;

    async fn edit(
        &self,
        recipient: &Recipient,
        handle: &MessageHandle,
        message: &OutboundMessage,
    ) -> Result<EditStatus>;

    /// Replace only the navigation affordance of a message.
    async fn edit_navigation(
        &self,
        recipient: &Recipient,
        handle: &MessageHandle,
        navigation: &Navigation,
    ) -> Result<()>;

    fn name(&self) -> &'static str {
        "channel"
    }
}

/// One call observed by [`RecordingChannel`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    Sent {
        recipient: Recipient,
        handle: MessageHandle,
        message: OutboundMessage,
    },
    Edited {
        recipient: Recipient,
        handle: MessageHandle,
        message: OutboundMessage,
    },
    NavigationEdited {
        recipient: Recipient,
        handle: MessageHandle,
        navigation: Navigation,
    },
}

#[derive(Default)]
struct RecordingState {
    next_id: u64,
    events: Vec<ChannelEvent>,
    current: HashMap<MessageHandle, OutboundMessage>,
}

/// In-memory channel that records every call and keeps the latest content
/// of each message. Identical edits fail with [`Error::NotModified`], like a
/// real chat API.
#[derive(Default)]
pub struct RecordingChannel {
    state: Mutex<RecordingState>,
}

impl RecordingChannel {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, RecordingState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn events(&self) -> Vec<ChannelEvent> {
        self.lock().events.clone()
    }

    pub fn sent_count(&self) -> usize {
        self.lock()
            .events
            .iter()
            .filter(|e| matches!(e, ChannelEvent::Sent { .. }))
            .count()
    }

    pub fn edit_count(&self) -> usize {
        self.lock()
            .events
            .iter()
            .filter(|e| matches!(e, ChannelEvent::Edited { .. }))
            .count()
    }

    /// Latest state of a message.
    pub fn message(&self, handle: &MessageHandle) -> Option<OutboundMessage> {
        self.lock().current.get(handle).cloned()
    }

    /// Latest text of a message.
    pub fn text(&self, handle: &MessageHandle) -> Option<String> {
        self.message(handle).map(|m| m.text)
    }

    /// Handles of sent messages, in send order.
    pub fn handles(&self) -> Vec<MessageHandle> {
        self.lock()
            .events
            .iter()
            .filter_map(|e| match e {
                ChannelEvent::Sent { handle, .. } => Some(handle.clone()),
                _ => None,
            })
            .collect()
    }

    /// Pre-register an existing message, e.g. an anchor created elsewhere.
    pub fn seed(&self, text: impl Into<String>) -> MessageHandle {
        let mut st = self.lock();
        st.next_id += 1;
        let handle = MessageHandle::new(st.next_id.to_string());
        st.current.insert(handle.clone(), OutboundMessage::plain(text));
        handle
    }
}

fn unknown_message(handle: &MessageHandle) -> Error {
    Error::permanent_with_context(
        "message to edit not found",
        ErrorContext::new()
            .with_key(handle.as_str())
            .with_source("recording_channel"),
    )
}

#[async_trait]
impl ChannelClient for RecordingChannel {
    async fn send(&self, recipient: &Recipient, message: &OutboundMessage) -> Result<MessageHandle> {
        let mut st = self.lock();
        st.next_id += 1;
        let handle = MessageHandle::new(st.next_id.to_string());
        st.current.insert(handle.clone(), message.clone());
        st.events.push(ChannelEvent::Sent {
            recipient: recipient.clone(),
            handle: handle.clone(),
            message: message.clone(),
        });
        Ok(handle)
    }

    async fn edit(
        &self,
        recipient: &Recipient,
        handle: &MessageHandle,
        message: &OutboundMessage,
    ) -> Result<EditStatus> {
        let mut st = self.lock();
        let Some(existing) = st.current.get_mut(handle) else {
            return Err(unknown_message(handle));
        };
        let same_nav = message.navigation.is_none() || message.navigation == existing.navigation;
        if existing.text == message.text && existing.format == message.format && same_nav {
            return Err(Error::NotModified);
        }
        let navigation = message.navigation.clone().or_else(|| existing.navigation.clone());
        *existing = OutboundMessage {
            navigation,
            reply_to: existing.reply_to.clone(),
            ..message.clone()
        };
        st.events.push(ChannelEvent::Edited {
            recipient: recipient.clone(),
            handle: handle.clone(),
            message: message.clone(),
        });
        Ok(EditStatus::Applied)
    }

    async fn edit_navigation(
        &self,
        recipient: &Recipient,
        handle: &MessageHandle,
        navigation: &Navigation,
    ) -> Result<()> {
        let mut st = self.lock();
        let Some(existing) = st.current.get_mut(handle) else {
            return Err(unknown_message(handle));
        };
        if existing.navigation.as_ref() == Some(navigation) {
            return Err(Error::NotModified);
        }
        existing.navigation = Some(navigation.clone());
        st.events.push(ChannelEvent::NavigationEdited {
            recipient: recipient.clone(),
            handle: handle.clone(),
            navigation: navigation.clone(),
        });
        Ok(())
    }

    fn name(&self) -> &'static str {
        "recording"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_send_and_edit() {
        let ch = RecordingChannel::new();
        let chat = Recipient::new("1");
        let h = ch.send(&chat, &OutboundMessage::plain("Thinking...")).await.unwrap();
        let status = ch.edit(&chat, &h, &OutboundMessage::markdown("Hi")).await.unwrap();
        assert_eq!(status, EditStatus::Applied);
        assert_eq!(ch.text(&h).as_deref(), Some("Hi"));
        assert_eq!(ch.sent_count(), 1);
        assert_eq!(ch.edit_count(), 1);
    }

    #[tokio::test]
    async fn test_identical_edit_is_not_modified() {
        let ch = RecordingChannel::new();
        let chat = Recipient::new("1");
        let h = ch.send(&chat, &OutboundMessage::markdown("same")).await.unwrap();
        let err = ch.edit(&chat, &h, &OutboundMessage::markdown("same")).await.unwrap_err();
        assert!(matches!(err, Error::NotModified));
    }

    #[tokio::test]
    async fn test_unknown_handle_is_permanent() {
        let ch = RecordingChannel::new();
        let err = ch
            .edit(&Recipient::new("1"), &MessageHandle::new("99"), &OutboundMessage::plain("x"))
            .await
            .unwrap_err();
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_seeded_anchor_is_editable() {
        let ch = RecordingChannel::new();
        let anchor = ch.seed("Thinking...");
        let chat = Recipient::new("7");
        ch.edit(&chat, &anchor, &OutboundMessage::plain("done")).await.unwrap();
        assert_eq!(ch.text(&anchor).as_deref(), Some("done"));
        assert_eq!(ch.sent_count(), 0);
    }
}
