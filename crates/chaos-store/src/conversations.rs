use serde::{Deserialize, Serialize};
use tracing::instrument;

use chaos_core::ids::{CallId, ConversationId, MessageId, UserId};
use chaos_core::Page;

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationKind {
    Direct,
    Group,
}

impl std::fmt::Display for ConversationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Direct => write!(f, "direct"),
            Self::Group => write!(f, "group"),
        }
    }
}

impl std::str::FromStr for ConversationKind {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "direct" => Ok(Self::Direct),
            "group" => Ok(Self::Group),
            other => Err(format!("unknown conversation kind: {other}")),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Text,
    Image,
    File,
    CallStart,
    CallEnd,
}

impl MessageKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Image => "image",
            Self::File => "file",
            Self::CallStart => "call_start",
            Self::CallEnd => "call_end",
        }
    }
}

impl std::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for MessageKind {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "text" => Ok(Self::Text),
            "image" => Ok(Self::Image),
            "file" => Ok(Self::File),
            "call_start" => Ok(Self::CallStart),
            "call_end" => Ok(Self::CallEnd),
            other => Err(format!("unknown message type: {other}")),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConversationRow {
    pub id: ConversationId,
    pub kind: ConversationKind,
    pub name: Option<String>,
    pub last_message_at: Option<String>,
    pub created_at: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConversationSummary {
    #[serde(flatten)]
    pub conversation: ConversationRow,
    pub last_read_at: Option<String>,
    pub unread_count: i64,
    pub is_archived: bool,
    pub is_muted: bool,
}

/// Which of the user's conversations a listing shows. The default hides
/// archived and muted ones.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ConversationFilter {
    pub include_archived: bool,
    pub include_muted: bool,
}

/// Per-participant flags.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ParticipantFlag {
    Archived,
    Muted,
}

impl ParticipantFlag {
    fn column(self) -> &'static str {
        match self {
            Self::Archived => "is_archived",
            Self::Muted => "is_muted",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MessageRow {
    pub id: MessageId,
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    pub content: String,
    pub message_type: MessageKind,
    pub call_id: Option<CallId>,
    pub is_deleted: bool,
    pub created_at: String,
}

/// A message matching a content search.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MessageHit {
    pub message: MessageRow,
    /// The other participant's name for direct conversations, otherwise the
    /// conversation's own name.
    pub conversation_name: Option<String>,
    /// Excerpt around the first match.
    pub highlight: String,
}

/// New message to append.
#[derive(Clone, Debug)]
pub struct NewMessage<'a> {
    pub conversation_id: &'a ConversationId,
    pub sender_id: &'a UserId,
    pub content: &'a str,
    pub kind: MessageKind,
    pub call_id: Option<&'a CallId>,
}

const CONVERSATION_COLUMNS: &str = "c.id, c.kind, c.name, c.last_message_at, c.created_at";
const MESSAGE_COLUMNS: &str =
    "id, conversation_id, sender_id, content, message_type, call_id, is_deleted, created_at";

/// Summaries for participant `?1`, paged by `?2`/`?3`. Callers splice an
/// `AND ...` condition between this and [`SUMMARY_ORDER`].
const SUMMARY_SELECT: &str = "SELECT c.id, c.kind, c.name, c.last_message_at, c.created_at,
        p.last_read_at,
        (SELECT COUNT(*) FROM messages m
         WHERE m.conversation_id = c.id
           AND m.sender_id <> p.user_id
           AND m.is_deleted = 0
           AND (p.last_read_at IS NULL OR m.created_at > p.last_read_at)),
        p.is_archived, p.is_muted
 FROM conversations c
 JOIN conversation_participants p ON p.conversation_id = c.id
 WHERE p.user_id = ?1";

const SUMMARY_ORDER: &str =
    "ORDER BY COALESCE(c.last_message_at, c.created_at) DESC, c.id DESC LIMIT ?2 OFFSET ?3";

pub struct ConversationRepo {
    db: Database,
}

impl ConversationRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Find the direct conversation between two users, creating it if absent.
    ///
    /// Lookup and insert happen under one connection lock, so concurrent callers
    /// for the same pair converge on a single row.
    #[instrument(skip(self), fields(a = %a, b = %b))]
    pub fn get_or_create_direct(&self, a: &UserId, b: &UserId) -> Result<ConversationRow, StoreError> {
        self.db.with_conn(|conn| {
            if let Some(existing) = find_direct(conn, a, b)? {
                return Ok(existing);
            }

            let id = ConversationId::new();
            let now = row_helpers::now();
            let tx = conn.unchecked_transaction()?;
            tx.execute(
                "INSERT INTO conversations (id, kind, created_at) VALUES (?1, 'direct', ?2)",
                rusqlite::params![id.as_str(), now],
            )?;
            for user in [a, b] {
                tx.execute(
                    "INSERT INTO conversation_participants (conversation_id, user_id, joined_at)
                     VALUES (?1, ?2, ?3)",
                    rusqlite::params![id.as_str(), user.as_str(), now],
                )?;
            }
            tx.commit()?;

            Ok(ConversationRow {
                id,
                kind: ConversationKind::Direct,
                name: None,
                last_message_at: None,
                created_at: now,
            })
        })
    }

    pub fn find_direct(&self, a: &UserId, b: &UserId) -> Result<Option<ConversationRow>, StoreError> {
        self.db.with_conn(|conn| find_direct(conn, a, b))
    }

    #[instrument(skip(self), fields(conversation_id = %id))]
    pub fn get(&self, id: &ConversationId) -> Result<ConversationRow, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt =
                conn.prepare(&format!("SELECT {CONVERSATION_COLUMNS} FROM conversations c WHERE c.id = ?1"))?;
            let mut rows = stmt.query([id.as_str()])?;
            match rows.next()? {
                Some(row) => row_to_conversation(row),
                None => Err(StoreError::NotFound(format!("conversation {id}"))),
            }
        })
    }

    pub fn participants(&self, id: &ConversationId) -> Result<Vec<UserId>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT user_id FROM conversation_participants WHERE conversation_id = ?1 ORDER BY joined_at, user_id",
            )?;
            let ids = stmt
                .query_map([id.as_str()], |row| row.get::<_, String>(0))?
                .map(|r| r.map(UserId::from_raw))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(ids)
        })
    }

    pub fn is_participant(&self, id: &ConversationId, user: &UserId) -> Result<bool, StoreError> {
        self.db.with_conn(|conn| {
            let found: i64 = conn.query_row(
                "SELECT EXISTS(SELECT 1 FROM conversation_participants WHERE conversation_id = ?1 AND user_id = ?2)",
                [id.as_str(), user.as_str()],
                |row| row.get(0),
            )?;
            Ok(found != 0)
        })
    }

    /// Append a message and bump the conversation's activity time.
    #[instrument(skip(self, msg), fields(conversation_id = %msg.conversation_id, kind = %msg.kind))]
    pub fn insert_message(&self, msg: NewMessage<'_>) -> Result<MessageRow, StoreError> {
        let id = MessageId::new();
        let now = row_helpers::now();
        self.db.with_conn(|conn| {
            let tx = conn.unchecked_transaction()?;
            tx.execute(
                "INSERT INTO messages (id, conversation_id, sender_id, content, message_type, call_id, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                rusqlite::params![
                    id.as_str(),
                    msg.conversation_id.as_str(),
                    msg.sender_id.as_str(),
                    msg.content,
                    msg.kind.as_str(),
                    msg.call_id.map(|c| c.as_str()),
                    now,
                ],
            )?;
            let updated = tx.execute(
                "UPDATE conversations SET last_message_at = ?1 WHERE id = ?2",
                rusqlite::params![now, msg.conversation_id.as_str()],
            )?;
            if updated == 0 {
                return Err(StoreError::NotFound(format!("conversation {}", msg.conversation_id)));
            }
            tx.commit()?;

            Ok(MessageRow {
                id,
                conversation_id: msg.conversation_id.clone(),
                sender_id: msg.sender_id.clone(),
                content: msg.content.to_string(),
                message_type: msg.kind,
                call_id: msg.call_id.cloned(),
                is_deleted: false,
                created_at: now,
            })
        })
    }

    pub fn get_message(&self, id: &MessageId) -> Result<MessageRow, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = ?1"))?;
            let mut rows = stmt.query([id.as_str()])?;
            match rows.next()? {
                Some(row) => row_to_message(row),
                None => Err(StoreError::NotFound(format!("message {id}"))),
            }
        })
    }

    /// Visible messages, newest first.
    #[instrument(skip(self), fields(conversation_id = %id, limit = page.limit, offset = page.offset))]
    pub fn messages(&self, id: &ConversationId, page: Page) -> Result<Vec<MessageRow>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {MESSAGE_COLUMNS} FROM messages
                 WHERE conversation_id = ?1 AND is_deleted = 0
                 ORDER BY created_at DESC, id DESC LIMIT ?2 OFFSET ?3"
            ))?;
            let mut rows = stmt.query(rusqlite::params![id.as_str(), page.limit, page.offset])?;
            let mut results = Vec::new();
            while let Some(row) = rows.next()? {
                results.push(row_to_message(row)?);
            }
            Ok(results)
        })
    }

    /// Soft-delete. Returns false if the message was already deleted.
    #[instrument(skip(self), fields(message_id = %id))]
    pub fn soft_delete_message(&self, id: &MessageId) -> Result<bool, StoreError> {
        self.db.with_conn(|conn| {
            let n = conn.execute(
                "UPDATE messages SET is_deleted = 1 WHERE id = ?1 AND is_deleted = 0",
                [id.as_str()],
            )?;
            Ok(n > 0)
        })
    }

    /// Set the participant's read marker to now and return it.
    #[instrument(skip(self), fields(conversation_id = %id, user_id = %user))]
    pub fn mark_read(&self, id: &ConversationId, user: &UserId) -> Result<String, StoreError> {
        let now = row_helpers::now();
        self.db.with_conn(|conn| {
            let n = conn.execute(
                "UPDATE conversation_participants SET last_read_at = ?1 WHERE conversation_id = ?2 AND user_id = ?3",
                rusqlite::params![now, id.as_str(), user.as_str()],
            )?;
            if n == 0 {
                return Err(StoreError::NotFound(format!("participant {user} in {id}")));
            }
            Ok(now)
        })
    }

    /// Set or clear one of the user's own flags on a conversation.
    #[instrument(skip(self), fields(conversation_id = %id, user_id = %user))]
    pub fn set_flag(
        &self,
        id: &ConversationId,
        user: &UserId,
        flag: ParticipantFlag,
        value: bool,
    ) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            let n = conn.execute(
                &format!(
                    "UPDATE conversation_participants SET {} = ?1 WHERE conversation_id = ?2 AND user_id = ?3",
                    flag.column()
                ),
                rusqlite::params![value, id.as_str(), user.as_str()],
            )?;
            if n == 0 {
                return Err(StoreError::NotFound(format!("participant {user} in {id}")));
            }
            Ok(())
        })
    }

    /// The user's conversations by most recent activity, with unread counts.
    #[instrument(skip(self), fields(user_id = %user, limit = page.limit, offset = page.offset))]
    pub fn list_for_user(
        &self,
        user: &UserId,
        filter: ConversationFilter,
        page: Page,
    ) -> Result<Vec<ConversationSummary>, StoreError> {
        self.db.with_conn(|conn| {
            summaries(
                conn,
                "AND (?4 OR p.is_archived = 0) AND (?5 OR p.is_muted = 0)",
                rusqlite::params![
                    user.as_str(),
                    page.limit,
                    page.offset,
                    filter.include_archived,
                    filter.include_muted,
                ],
            )
        })
    }

    /// Visible messages containing `needle`, ignoring ASCII case, across every
    /// conversation `user` takes part in. Newest first.
    #[instrument(skip(self), fields(user_id = %user, limit = page.limit, offset = page.offset))]
    pub fn search_messages(&self, user: &UserId, needle: &str, page: Page) -> Result<Vec<MessageHit>, StoreError> {
        let pattern = format!("%{}%", row_helpers::escape_like(needle));
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                r"SELECT m.id, m.conversation_id, m.sender_id, m.content, m.message_type, m.call_id,
                         m.is_deleted, m.created_at,
                         CASE WHEN c.kind = 'direct' THEN
                             (SELECT u.name FROM conversation_participants op
                              JOIN users u ON u.id = op.user_id
                              WHERE op.conversation_id = c.id AND op.user_id <> ?1
                              LIMIT 1)
                         ELSE c.name END
                  FROM messages m
                  JOIN conversations c ON c.id = m.conversation_id
                  JOIN conversation_participants p ON p.conversation_id = c.id AND p.user_id = ?1
                  WHERE m.is_deleted = 0 AND m.content LIKE ?2 ESCAPE '\'
                  ORDER BY m.created_at DESC, m.id DESC
                  LIMIT ?3 OFFSET ?4",
            )?;
            let mut rows = stmt.query(rusqlite::params![user.as_str(), pattern, page.limit, page.offset])?;
            let mut results = Vec::new();
            while let Some(row) = rows.next()? {
                let message = row_to_message(row)?;
                results.push(MessageHit {
                    highlight: highlight(&message.content, needle),
                    conversation_name: row_helpers::get_opt(row, 8, "conversations", "name")?,
                    message,
                });
            }
            Ok(results)
        })
    }

    /// Conversations where another participant's username or name contains
    /// `needle`. Archived and muted conversations are included.
    #[instrument(skip(self), fields(user_id = %user, limit = page.limit, offset = page.offset))]
    pub fn search_conversations(
        &self,
        user: &UserId,
        needle: &str,
        page: Page,
    ) -> Result<Vec<ConversationSummary>, StoreError> {
        let pattern = format!("%{}%", row_helpers::escape_like(needle));
        self.db.with_conn(|conn| {
            summaries(
                conn,
                r"AND EXISTS (SELECT 1 FROM conversation_participants op
                              JOIN users u ON u.id = op.user_id
                              WHERE op.conversation_id = c.id AND op.user_id <> ?1
                                AND (u.username LIKE ?4 ESCAPE '\' OR u.name LIKE ?4 ESCAPE '\'))",
                rusqlite::params![user.as_str(), page.limit, page.offset, pattern],
            )
        })
    }
}

fn find_direct(
    conn: &rusqlite::Connection,
    a: &UserId,
    b: &UserId,
) -> Result<Option<ConversationRow>, StoreError> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {CONVERSATION_COLUMNS} FROM conversations c
         JOIN conversation_participants pa ON pa.conversation_id = c.id AND pa.user_id = ?1
         JOIN conversation_participants pb ON pb.conversation_id = c.id AND pb.user_id = ?2
         WHERE c.kind = 'direct'
         ORDER BY c.created_at LIMIT 1"
    ))?;
    let mut rows = stmt.query([a.as_str(), b.as_str()])?;
    match rows.next()? {
        Some(row) => Ok(Some(row_to_conversation(row)?)),
        None => Ok(None),
    }
}

fn summaries(
    conn: &rusqlite::Connection,
    condition: &str,
    params: &[&dyn rusqlite::ToSql],
) -> Result<Vec<ConversationSummary>, StoreError> {
    let mut stmt = conn.prepare(&format!("{SUMMARY_SELECT} {condition} {SUMMARY_ORDER}"))?;
    let mut rows = stmt.query(params)?;
    let mut results = Vec::new();
    while let Some(row) = rows.next()? {
        results.push(ConversationSummary {
            conversation: row_to_conversation(row)?,
            last_read_at: row_helpers::get_opt(row, 5, "conversation_participants", "last_read_at")?,
            unread_count: row_helpers::get(row, 6, "messages", "unread_count")?,
            is_archived: row_helpers::get::<i64>(row, 7, "conversation_participants", "is_archived")? != 0,
            is_muted: row_helpers::get::<i64>(row, 8, "conversation_participants", "is_muted")? != 0,
        });
    }
    Ok(results)
}

const SNIPPET_CONTEXT: usize = 50;
const SNIPPET_FALLBACK_CHARS: usize = 100;

/// Up to [`SNIPPET_CONTEXT`] bytes either side of the first ASCII
/// case-insensitive match, with `...` marking cut ends. Without a match,
/// the first [`SNIPPET_FALLBACK_CHARS`] characters.
pub fn highlight(content: &str, needle: &str) -> String {
    // ASCII lowering keeps byte offsets valid in `content`.
    let Some(at) = content.to_ascii_lowercase().find(&needle.to_ascii_lowercase()) else {
        return match content.char_indices().nth(SNIPPET_FALLBACK_CHARS) {
            Some((cut, _)) => format!("{}...", &content[..cut]),
            None => content.to_string(),
        };
    };

    let mut start = at.saturating_sub(SNIPPET_CONTEXT);
    while !content.is_char_boundary(start) {
        start -= 1;
    }
    let mut end = (at + needle.len() + SNIPPET_CONTEXT).min(content.len());
    while !content.is_char_boundary(end) {
        end += 1;
    }

    let mut snippet = String::with_capacity(end - start + 6);
    if start > 0 {
        snippet.push_str("...");
    }
    snippet.push_str(&content[start..end]);
    if end < content.len() {
        snippet.push_str("...");
    }
    snippet
}

fn row_to_conversation(row: &rusqlite::Row<'_>) -> Result<ConversationRow, StoreError> {
    let kind: String = row_helpers::get(row, 1, "conversations", "kind")?;
    Ok(ConversationRow {
        id: ConversationId::from_raw(row_helpers::get::<String>(row, 0, "conversations", "id")?),
        kind: row_helpers::parse_enum(&kind, "conversations", "kind")?,
        name: row_helpers::get_opt(row, 2, "conversations", "name")?,
        last_message_at: row_helpers::get_opt(row, 3, "conversations", "last_message_at")?,
        created_at: row_helpers::get(row, 4, "conversations", "created_at")?,
    })
}

fn row_to_message(row: &rusqlite::Row<'_>) -> Result<MessageRow, StoreError> {
    let kind: String = row_helpers::get(row, 4, "messages", "message_type")?;
    Ok(MessageRow {
        id: MessageId::from_raw(row_helpers::get::<String>(row, 0, "messages", "id")?),
        conversation_id: ConversationId::from_raw(row_helpers::get::<String>(row, 1, "messages", "conversation_id")?),
        sender_id: UserId::from_raw(row_helpers::get::<String>(row, 2, "messages", "sender_id")?),
        content: row_helpers::get(row, 3, "messages", "content")?,
        message_type: row_helpers::parse_enum(&kind, "messages", "message_type")?,
        call_id: row_helpers::get_opt::<String>(row, 5, "messages", "call_id")?.map(CallId::from_raw),
        is_deleted: row_helpers::get::<i64>(row, 6, "messages", "is_deleted")? != 0,
        created_at: row_helpers::get(row, 7, "messages", "created_at")?,
    })
}
