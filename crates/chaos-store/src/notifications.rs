use serde::{Deserialize, Serialize};
use tracing::instrument;

use chaos_core::ids::{ConversationId, NotificationId, UserId};
use chaos_core::Page;

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    FriendRequest,
    FriendAccepted,
    Message,
}

impl NotificationKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::FriendRequest => "friend_request",
            Self::FriendAccepted => "friend_accepted",
            Self::Message => "message",
        }
    }
}

impl std::fmt::Display for NotificationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for NotificationKind {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "friend_request" => Ok(Self::FriendRequest),
            "friend_accepted" => Ok(Self::FriendAccepted),
            "message" => Ok(Self::Message),
            other => Err(format!("unknown notification kind: {other}")),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NotificationRow {
    pub id: NotificationId,
    pub user_id: UserId,
    pub kind: NotificationKind,
    pub title: String,
    pub content: String,
    pub is_read: bool,
    pub related_user_id: Option<UserId>,
    pub related_conversation_id: Option<ConversationId>,
    pub created_at: String,
}

#[derive(Clone, Debug)]
pub struct NewNotification<'a> {
    pub user_id: &'a UserId,
    pub kind: NotificationKind,
    pub title: &'a str,
    pub content: &'a str,
    pub related_user_id: Option<&'a UserId>,
    pub related_conversation_id: Option<&'a ConversationId>,
}

const COLUMNS: &str =
    "id, user_id, kind, title, content, is_read, related_user_id, related_conversation_id, created_at";

pub struct NotificationRepo {
    db: Database,
}

impl NotificationRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    #[instrument(skip(self, new), fields(user_id = %new.user_id, kind = %new.kind))]
    pub fn create(&self, new: NewNotification<'_>) -> Result<NotificationRow, StoreError> {
        let id = NotificationId::new();
        let now = row_helpers::now();
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO notifications
                    (id, user_id, kind, title, content, related_user_id, related_conversation_id, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                rusqlite::params![
                    id.as_str(),
                    new.user_id.as_str(),
                    new.kind.as_str(),
                    new.title,
                    new.content,
                    new.related_user_id.map(|u| u.as_str()),
                    new.related_conversation_id.map(|c| c.as_str()),
                    now,
                ],
            )?;
            Ok(NotificationRow {
                id,
                user_id: new.user_id.clone(),
                kind: new.kind,
                title: new.title.to_string(),
                content: new.content.to_string(),
                is_read: false,
                related_user_id: new.related_user_id.cloned(),
                related_conversation_id: new.related_conversation_id.cloned(),
                created_at: now,
            })
        })
    }

    #[instrument(skip(self), fields(user_id = %user, limit = page.limit, offset = page.offset))]
    pub fn list(&self, user: &UserId, page: Page) -> Result<Vec<NotificationRow>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {COLUMNS} FROM notifications WHERE user_id = ?1
                 ORDER BY created_at DESC, id DESC LIMIT ?2 OFFSET ?3"
            ))?;
            let mut rows = stmt.query(rusqlite::params![user.as_str(), page.limit, page.offset])?;
            let mut results = Vec::new();
            while let Some(row) = rows.next()? {
                results.push(row_to_notification(row)?);
            }
            Ok(results)
        })
    }

    /// Mark one notification read. Scoped to its owner.
    #[instrument(skip(self), fields(notification_id = %id, user_id = %user))]
    pub fn mark_read(&self, id: &NotificationId, user: &UserId) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            let n = conn.execute(
                "UPDATE notifications SET is_read = 1 WHERE id = ?1 AND user_id = ?2",
                [id.as_str(), user.as_str()],
            )?;
            if n == 0 {
                return Err(StoreError::NotFound(format!("notification {id}")));
            }
            Ok(())
        })
    }

    #[instrument(skip(self), fields(user_id = %user))]
    pub fn mark_all_read(&self, user: &UserId) -> Result<usize, StoreError> {
        self.db.with_conn(|conn| {
            let n = conn.execute(
                "UPDATE notifications SET is_read = 1 WHERE user_id = ?1 AND is_read = 0",
                [user.as_str()],
            )?;
            Ok(n)
        })
    }

    #[instrument(skip(self), fields(notification_id = %id, user_id = %user))]
    pub fn delete(&self, id: &NotificationId, user: &UserId) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            let n = conn.execute(
                "DELETE FROM notifications WHERE id = ?1 AND user_id = ?2",
                [id.as_str(), user.as_str()],
            )?;
            if n == 0 {
                return Err(StoreError::NotFound(format!("notification {id}")));
            }
            Ok(())
        })
    }

    pub fn unread_count(&self, user: &UserId) -> Result<i64, StoreError> {
        self.db.with_conn(|conn| {
            let n = conn.query_row(
                "SELECT COUNT(*) FROM notifications WHERE user_id = ?1 AND is_read = 0",
                [user.as_str()],
                |row| row.get(0),
            )?;
            Ok(n)
        })
    }
}

fn row_to_notification(row: &rusqlite::Row<'_>) -> Result<NotificationRow, StoreError> {
    let kind: String = row_helpers::get(row, 2, "notifications", "kind")?;
    Ok(NotificationRow {
        id: NotificationId::from_raw(row_helpers::get::<String>(row, 0, "notifications", "id")?),
        user_id: UserId::from_raw(row_helpers::get::<String>(row, 1, "notifications", "user_id")?),
        kind: row_helpers::parse_enum(&kind, "notifications", "kind")?,
        title: row_helpers::get(row, 3, "notifications", "title")?,
        content: row_helpers::get(row, 4, "notifications", "content")?,
        is_read: row_helpers::get::<i64>(row, 5, "notifications", "is_read")? != 0,
        related_user_id: row_helpers::get_opt::<String>(row, 6, "notifications", "related_user_id")?
            .map(UserId::from_raw),
        related_conversation_id: row_helpers::get_opt::<String>(row, 7, "notifications", "related_conversation_id")?
            .map(ConversationId::from_raw),
        created_at: row_helpers::get(row, 8, "notifications", "created_at")?,
    })
}
