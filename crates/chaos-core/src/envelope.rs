use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::calls::CallType;
use crate::ids::{CallId, ConversationId, MessageId, NotificationId, UserId};

/// Real-time events pushed to live sessions.
///
/// Serialized adjacently tagged: `{"type": "call_end", "data": {...}}`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum Event {
    Message(MessageData),
    Notification(NotificationData),
    FriendRequest(FriendRequestData),
    FriendAccepted(FriendRequestData),
    UserOnline(UserStatusData),
    UserOffline(UserStatusData),
    Typing(TypingData),
    StopTyping(TypingData),
    MessageRead(MessageReadData),
    CallRequest(CallRequestData),
    CallResponse(CallResponseData),
    CallEnd(CallEndData),
    Ping,
    Pong,
}

impl Event {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Message(_) => "message",
            Self::Notification(_) => "notification",
            Self::FriendRequest(_) => "friend_request",
            Self::FriendAccepted(_) => "friend_accepted",
            Self::UserOnline(_) => "user_online",
            Self::UserOffline(_) => "user_offline",
            Self::Typing(_) => "typing",
            Self::StopTyping(_) => "stop_typing",
            Self::MessageRead(_) => "message_read",
            Self::CallRequest(_) => "call_request",
            Self::CallResponse(_) => "call_response",
            Self::CallEnd(_) => "call_end",
            Self::Ping => "ping",
            Self::Pong => "pong",
        }
    }
}

/// One timestamped unit of real-time data.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(flatten)]
    pub event: Event,
    pub timestamp: DateTime<Utc>,
}

impl Envelope {
    pub fn new(event: Event) -> Self {
        Self {
            event,
            timestamp: Utc::now(),
        }
    }

    pub fn kind(&self) -> &'static str {
        self.event.kind()
    }
}

impl From<Event> for Envelope {
    fn from(event: Event) -> Self {
        Self::new(event)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MessageData {
    pub message_id: MessageId,
    pub conversation_id: ConversationId,
    pub content: String,
    pub sender_id: UserId,
    pub sender_username: String,
    pub message_type: String,
    pub created_at: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NotificationData {
    pub notification_id: NotificationId,
    #[serde(rename = "type")]
    pub kind: String,
    pub title: String,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub related_user_id: Option<UserId>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FriendRequestData {
    pub requester_id: UserId,
    pub requester_username: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct UserStatusData {
    pub user_id: UserId,
    pub username: String,
    pub online: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TypingData {
    pub conversation_id: ConversationId,
    pub user_id: UserId,
    pub username: String,
    pub is_typing: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MessageReadData {
    pub conversation_id: ConversationId,
    pub user_id: UserId,
    pub last_read_at: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CallRequestData {
    pub call_id: CallId,
    pub caller_id: UserId,
    pub callee_id: UserId,
    pub call_type: CallType,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallAnswer {
    Accepted,
    Declined,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CallResponseData {
    pub call_id: CallId,
    pub response: CallAnswer,
    pub caller_id: UserId,
    pub callee_id: UserId,
}

/// `ended_by` is the acting user id, or `"timeout"` for sweeps.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CallEndData {
    pub call_id: CallId,
    pub duration: i64,
    pub ended_by: String,
    pub caller_id: UserId,
    pub callee_id: UserId,
}

pub const ENDED_BY_TIMEOUT: &str = "timeout";

/// Frames a client may send over its socket. Only liveness and ephemeral
/// typing signals are acted on; everything else is ignored.
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ClientFrame {
    Ping,
    Pong,
    Typing(TypingSignal),
    StopTyping(TypingSignal),
    Message(serde_json::Value),
    #[serde(other)]
    Unknown,
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
pub struct TypingSignal {
    pub conversation_id: ConversationId,
}
