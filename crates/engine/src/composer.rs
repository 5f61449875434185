//! Builds the push payload for a new chat message.

use relay_common::config::AppConfig;
use relay_common::types::WatchedDocument;
use relay_notifier::push::{AndroidHints, ApnsHints, PushMessage, PushPriority};

#[derive(Debug, Clone)]
pub struct MessageComposer {
    pub default_title: String,
    pub default_body: String,
    pub android_channel_id: Option<String>,
}

impl MessageComposer {
    pub fn new(default_title: impl Into<String>, default_body: impl Into<String>) -> Self {
        Self {
            default_title: default_title.into(),
            default_body: default_body.into(),
            android_channel_id: None,
        }
    }

    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            default_title: config.notification_default_title.clone(),
            default_body: config.notification_default_body.clone(),
            android_channel_id: config.android_channel_id.clone(),
        }
    }

    /// Title is the sender's name, body the message text; defaults fill gaps.
    pub fn compose(&self, doc: &WatchedDocument) -> PushMessage {
        let title = non_blank(doc.sender_name.as_deref()).unwrap_or(self.default_title.as_str());
        let body = non_blank(doc.text.as_deref()).unwrap_or(self.default_body.as_str());

        let mut message = PushMessage {
            title: title.to_string(),
            body: body.to_string(),
            android: AndroidHints {
                priority: PushPriority::High,
                channel_id: self.android_channel_id.clone(),
            },
            apns: ApnsHints {
                sound: Some("default".to_string()),
            },
            data: Default::default(),
        }
        .with_data("type", "message")
        .with_data("documentId", doc.id.as_str());

        if let Some(chat_id) = &doc.chat_id {
            message = message.with_data("chatId", chat_id.as_str());
        }
        if let Some(sender_id) = &doc.sender_id {
            message = message.with_data("senderId", sender_id.as_str());
        }
        message
    }
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}
