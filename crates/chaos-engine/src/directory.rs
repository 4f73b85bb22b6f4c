use async_trait::async_trait;

use chaos_core::ids::{ConversationId, UserId};
use chaos_realtime::{Directory, DirectoryError};
use chaos_store::conversations::ConversationRepo;
use chaos_store::social::SocialRepo;
use chaos_store::Database;

/// Audience lookups for the dispatcher, answered from the record store.
#[derive(Clone)]
pub struct StoreDirectory {
    db: Database,
}

impl StoreDirectory {
    pub fn new(db: Database) -> Self {
        Self { db }
    }
}

#[async_trait]
impl Directory for StoreDirectory {
    async fn conversation_participants(&self, conversation_id: &ConversationId) -> Result<Vec<UserId>, DirectoryError> {
        ConversationRepo::new(self.db.clone())
            .participants(conversation_id)
            .map_err(|e| DirectoryError(e.to_string()))
    }

    async fn friend_ids(&self, user_id: &UserId) -> Result<Vec<UserId>, DirectoryError> {
        SocialRepo::new(self.db.clone())
            .friend_ids(user_id)
            .map_err(|e| DirectoryError(e.to_string()))
    }
}
