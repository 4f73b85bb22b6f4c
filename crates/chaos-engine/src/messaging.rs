use tracing::info;

use chaos_core::envelope::{MessageData, MessageReadData};
use chaos_core::ids::{CallId, ConversationId, MessageId, UserId};
use chaos_core::{Event, Page};
use chaos_realtime::Dispatcher;
use chaos_store::conversations::{
    ConversationFilter, ConversationKind, ConversationRepo, ConversationRow, ConversationSummary, MessageHit,
    MessageKind, MessageRow, NewMessage, ParticipantFlag,
};
use chaos_store::social::SocialRepo;
use chaos_store::users::UserRepo;
use chaos_store::Database;

use crate::error::ServiceError;

/// Conversations, messages and read markers.
#[derive(Clone)]
pub struct MessagingService {
    db: Database,
    dispatcher: Dispatcher,
}

impl MessagingService {
    pub fn new(db: Database, dispatcher: Dispatcher) -> Self {
        Self { db, dispatcher }
    }

    fn repo(&self) -> ConversationRepo {
        ConversationRepo::new(self.db.clone())
    }

    /// Both users must be friends and neither may have blocked the other.
    fn ensure_can_talk(&self, a: &UserId, b: &UserId) -> Result<(), ServiceError> {
        let social = SocialRepo::new(self.db.clone());
        if social.is_blocked(a, b)? {
            return Err(ServiceError::blocked());
        }
        if !social.are_friends(a, b)? {
            return Err(ServiceError::not_friends());
        }
        Ok(())
    }

    fn ensure_participant(&self, conversation: &ConversationId, user: &UserId) -> Result<(), ServiceError> {
        if !self.repo().is_participant(conversation, user)? {
            return Err(ServiceError::not_participant());
        }
        Ok(())
    }

    pub fn get_or_create_direct(&self, user: &UserId, other: &UserId) -> Result<ConversationRow, ServiceError> {
        if user == other {
            return Err(ServiceError::InvalidInput("cannot start a conversation with yourself".into()));
        }
        if !UserRepo::new(self.db.clone()).exists(other)? {
            return Err(ServiceError::NotFound(format!("user {other}")));
        }
        self.ensure_can_talk(user, other)?;
        Ok(self.repo().get_or_create_direct(user, other)?)
    }

    pub async fn send_message(
        &self,
        sender: &UserId,
        conversation_id: &ConversationId,
        content: &str,
    ) -> Result<MessageRow, ServiceError> {
        if content.trim().is_empty() {
            return Err(ServiceError::InvalidInput("message content is required".into()));
        }
        let author = UserRepo::new(self.db.clone()).get(sender)?;
        let repo = self.repo();
        let conversation = repo.get(conversation_id)?;
        self.ensure_participant(conversation_id, sender)?;

        if conversation.kind == ConversationKind::Direct {
            let participants = repo.participants(conversation_id)?;
            if let Some(other) = participants.iter().find(|id| *id != sender) {
                self.ensure_can_talk(sender, other)?;
            }
        }

        let row = repo.insert_message(NewMessage {
            conversation_id,
            sender_id: sender,
            content,
            kind: MessageKind::Text,
            call_id: None,
        })?;

        let event = Event::Message(MessageData {
            message_id: row.id.clone(),
            conversation_id: row.conversation_id.clone(),
            content: row.content.clone(),
            sender_id: row.sender_id.clone(),
            sender_username: author.username,
            message_type: row.message_type.as_str().to_string(),
            created_at: row.created_at.clone(),
        });
        self.dispatcher.to_conversation(conversation_id, event, Some(sender)).await;
        Ok(row)
    }

    /// Record a system entry such as a call transcript line. No push.
    pub fn append_transcript(
        &self,
        conversation_id: &ConversationId,
        sender: &UserId,
        content: &str,
        kind: MessageKind,
        call_id: Option<&CallId>,
    ) -> Result<MessageRow, ServiceError> {
        Ok(self.repo().insert_message(NewMessage {
            conversation_id,
            sender_id: sender,
            content,
            kind,
            call_id,
        })?)
    }

    pub fn messages(&self, conversation_id: &ConversationId, viewer: &UserId, page: Page) -> Result<Vec<MessageRow>, ServiceError> {
        self.repo().get(conversation_id)?;
        self.ensure_participant(conversation_id, viewer)?;
        Ok(self.repo().messages(conversation_id, page)?)
    }

    pub async fn mark_read(&self, conversation_id: &ConversationId, user: &UserId) -> Result<String, ServiceError> {
        self.repo().get(conversation_id)?;
        self.ensure_participant(conversation_id, user)?;
        let last_read_at = self.repo().mark_read(conversation_id, user)?;

        let event = Event::MessageRead(MessageReadData {
            conversation_id: conversation_id.clone(),
            user_id: user.clone(),
            last_read_at: last_read_at.clone(),
        });
        self.dispatcher.to_conversation(conversation_id, event, Some(user)).await;
        Ok(last_read_at)
    }

    /// Soft delete; only the sender may delete.
    pub fn delete_message(&self, message_id: &MessageId, user: &UserId) -> Result<(), ServiceError> {
        let repo = self.repo();
        let message = repo.get_message(message_id)?;
        if &message.sender_id != user {
            return Err(ServiceError::Unauthorized("only the sender can delete a message".into()));
        }
        if !repo.soft_delete_message(message_id)? {
            return Err(ServiceError::Conflict("message already deleted".into()));
        }
        info!(message_id = %message_id, user_id = %user, "message deleted");
        Ok(())
    }

    pub fn conversations(
        &self,
        user: &UserId,
        filter: ConversationFilter,
        page: Page,
    ) -> Result<Vec<ConversationSummary>, ServiceError> {
        Ok(self.repo().list_for_user(user, filter, page)?)
    }

    /// Archive or unarchive for `user` only. Other participants keep their view.
    pub fn set_archived(&self, conversation_id: &ConversationId, user: &UserId, archived: bool) -> Result<(), ServiceError> {
        self.set_flag(conversation_id, user, ParticipantFlag::Archived, archived)
    }

    /// Mute or unmute for `user` only.
    pub fn set_muted(&self, conversation_id: &ConversationId, user: &UserId, muted: bool) -> Result<(), ServiceError> {
        self.set_flag(conversation_id, user, ParticipantFlag::Muted, muted)
    }

    fn set_flag(
        &self,
        conversation_id: &ConversationId,
        user: &UserId,
        flag: ParticipantFlag,
        value: bool,
    ) -> Result<(), ServiceError> {
        let repo = self.repo();
        repo.get(conversation_id)?;
        self.ensure_participant(conversation_id, user)?;
        repo.set_flag(conversation_id, user, flag, value)?;
        info!(conversation_id = %conversation_id, user_id = %user, ?flag, value, "conversation flag set");
        Ok(())
    }

    /// Blank queries match nothing.
    pub fn search_messages(&self, user: &UserId, query: &str, page: Page) -> Result<Vec<MessageHit>, ServiceError> {
        let query = query.trim();
        if query.is_empty() {
            return Ok(Vec::new());
        }
        Ok(self.repo().search_messages(user, query, page)?)
    }

    /// Conversations by the other participant's username or name.
    pub fn search_conversations(
        &self,
        user: &UserId,
        query: &str,
        page: Page,
    ) -> Result<Vec<ConversationSummary>, ServiceError> {
        let query = query.trim();
        if query.is_empty() {
            return Ok(Vec::new());
        }
        Ok(self.repo().search_conversations(user, query, page)?)
    }
}
