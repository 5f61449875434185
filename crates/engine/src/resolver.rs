//! Token resolution: from a message to the device tokens to notify.
//!
//! Sources, in order: tokens listed on the message, users listed on the
//! message, then the participants of the message's chat. The sender is never
//! a recipient. Users without a token are skipped; that is not an error.

use std::collections::HashSet;
use std::sync::Arc;

use relay_common::error::RelayError;
use relay_common::types::{DeviceToken, UserId, WatchedDocument};

use crate::store::RecipientDirectory;

#[derive(Clone)]
pub struct TokenResolver {
    directory: Arc<dyn RecipientDirectory>,
}

impl TokenResolver {
    pub fn new(directory: Arc<dyn RecipientDirectory>) -> Self {
        Self { directory }
    }

    /// Recipient user ids, de-duplicated, sender excluded.
    pub async fn recipients(&self, doc: &WatchedDocument) -> Result<Vec<UserId>, RelayError> {
        let mut users: Vec<UserId> = doc.recipient_ids.clone();
        if let Some(chat_id) = &doc.chat_id {
            users.extend(self.directory.participants(chat_id).await?);
        }

        let sender = doc.sender_id.as_deref();
        let mut seen = HashSet::new();
        users.retain(|user| Some(user.as_str()) != sender && seen.insert(user.clone()));
        Ok(users)
    }

    /// De-duplicated device tokens for a message, first occurrence wins.
    pub async fn resolve(&self, doc: &WatchedDocument) -> Result<Vec<DeviceToken>, RelayError> {
        let users = self.recipients(doc).await?;

        let lookups = users.iter().map(|user| self.directory.device_token(user));
        let found = futures::future::try_join_all(lookups).await?;

        let mut tokens: Vec<DeviceToken> = Vec::with_capacity(doc.recipient_tokens.len() + users.len());
        tokens.extend(doc.recipient_tokens.iter().cloned());

        for (user, token) in users.iter().zip(found) {
            match token {
                Some(token) => tokens.push(token),
                None => {
                    tracing::debug!(
                        document_id = %doc.id,
                        user_id = %user,
                        "No device token for recipient, skipping"
                    );
                }
            }
        }

        let mut seen = HashSet::new();
        tokens.retain(|token| !token.trim().is_empty() && seen.insert(token.clone()));

        tracing::debug!(
            document_id = %doc.id,
            recipients = users.len(),
            tokens = tokens.len(),
            "Resolved device tokens"
        );
        Ok(tokens)
    }
}
