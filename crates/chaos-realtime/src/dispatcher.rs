use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use chaos_core::envelope::TypingData;
use chaos_core::ids::{ConversationId, UserId};
use chaos_core::{Envelope, Event};

use crate::registry::Registry;
use crate::session::SessionHandle;

#[derive(Debug, thiserror::Error)]
#[error("directory lookup failed: {0}")]
pub struct DirectoryError(pub String);

/// Read-only lookups the dispatcher needs to resolve audiences.
#[async_trait]
pub trait Directory: Send + Sync {
    async fn conversation_participants(&self, conversation_id: &ConversationId) -> Result<Vec<UserId>, DirectoryError>;

    async fn friend_ids(&self, user_id: &UserId) -> Result<Vec<UserId>, DirectoryError>;
}

/// Routes domain events to the registry, online users only.
///
/// Delivery is best-effort: lookup and fanout failures are logged and
/// never returned to the caller.
#[derive(Clone)]
pub struct Dispatcher {
    registry: Registry,
    directory: Arc<dyn Directory>,
}

impl Dispatcher {
    pub fn new(registry: Registry, directory: Arc<dyn Directory>) -> Self {
        Self { registry, directory }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub async fn to_user(&self, user_id: &UserId, event: Event) {
        self.to_users(vec![user_id.clone()], event).await;
    }

    /// Hand the event to the registry loop, which skips users without a
    /// live session. Never waits on the loop.
    pub async fn to_users(&self, user_ids: Vec<UserId>, event: Event) {
        if user_ids.is_empty() {
            debug!(kind = event.kind(), "no recipients");
            return;
        }
        self.registry.broadcast_to(user_ids, &Envelope::new(event));
    }

    /// Every participant of the conversation except `exclude`.
    pub async fn to_conversation(&self, conversation_id: &ConversationId, event: Event, exclude: Option<&UserId>) {
        let participants = match self.directory.conversation_participants(conversation_id).await {
            Ok(ids) => ids,
            Err(e) => {
                warn!(conversation_id = %conversation_id, kind = event.kind(), error = %e, "cannot resolve participants");
                return;
            }
        };
        let targets = participants
            .into_iter()
            .filter(|id| Some(id) != exclude)
            .collect();
        self.to_users(targets, event).await;
    }

    pub async fn to_friends(&self, user_id: &UserId, event: Event) {
        match self.directory.friend_ids(user_id).await {
            Ok(friends) => self.to_users(friends, event).await,
            Err(e) => warn!(user_id = %user_id, kind = event.kind(), error = %e, "cannot resolve friends"),
        }
    }

    /// Relay a typing signal from a live session. Signals for conversations
    /// the sender does not belong to are dropped.
    pub async fn typing(&self, from: &SessionHandle, conversation_id: &ConversationId, is_typing: bool) {
        let participants = match self.directory.conversation_participants(conversation_id).await {
            Ok(ids) => ids,
            Err(e) => {
                warn!(conversation_id = %conversation_id, error = %e, "cannot resolve participants");
                return;
            }
        };
        if !participants.contains(&from.user_id) {
            debug!(user_id = %from.user_id, conversation_id = %conversation_id, "typing signal from non-participant");
            return;
        }

        let data = TypingData {
            conversation_id: conversation_id.clone(),
            user_id: from.user_id.clone(),
            username: from.username.clone(),
            is_typing,
        };
        let event = if is_typing {
            Event::Typing(data)
        } else {
            Event::StopTyping(data)
        };
        let targets = participants
            .into_iter()
            .filter(|id| id != &from.user_id)
            .collect();
        self.to_users(targets, event).await;
    }
}
