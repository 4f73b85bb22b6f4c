//! `/api/v1` JSON routes. Every route requires a bearer token.

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{delete, get, post, put};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};

use chaos_core::ids::{CallId, ConversationId, MessageId, NotificationId, UserId};
use chaos_core::{CallType, Page};
use chaos_engine::ServiceError;
use chaos_store::calls::CallRow;
use chaos_store::conversations::{ConversationFilter, ConversationRow, ConversationSummary, MessageHit, MessageRow};
use chaos_store::notifications::NotificationRow;
use chaos_store::social::{BlockRow, FriendshipRow, PendingRequest};
use chaos_store::users::{UserRow, UserSearchRow};

use crate::api::ApiError;
use crate::auth::AuthUser;
use crate::server::AppState;

type ApiResult<T> = Result<Json<T>, ApiError>;

pub fn api_router() -> Router<AppState> {
    Router::new()
        .route("/me", get(me))
        .route("/users/search", get(search_users))
        .route("/friends", get(list_friends))
        .route("/friends/{user_id}", delete(remove_friend))
        .route("/friends/requests", get(pending_requests).post(send_friend_request))
        .route("/friends/requests/{user_id}/accept", post(accept_friend_request))
        .route("/friends/requests/{user_id}/decline", post(decline_friend_request))
        .route("/blocks", get(list_blocks).post(block_user))
        .route("/blocks/{user_id}", delete(unblock_user))
        .route("/conversations", get(list_conversations).post(open_conversation))
        .route("/conversations/search", get(search_conversations))
        .route("/conversations/{id}/messages", get(list_messages).post(send_message))
        .route("/conversations/{id}/read", post(mark_conversation_read))
        .route("/conversations/{id}/archive", put(archive_conversation))
        .route("/conversations/{id}/unarchive", put(unarchive_conversation))
        .route("/conversations/{id}/mute", put(mute_conversation))
        .route("/conversations/{id}/unmute", put(unmute_conversation))
        .route("/messages/search", get(search_messages))
        .route("/messages/{id}", delete(delete_message))
        .route("/notifications", get(list_notifications))
        .route("/notifications/unread-count", get(unread_notifications))
        .route("/notifications/read-all", post(mark_all_notifications_read))
        .route("/notifications/{id}", delete(delete_notification))
        .route("/notifications/{id}/read", post(mark_notification_read))
        .route("/calls", post(initiate_call))
        .route("/calls/active", get(active_call))
        .route("/calls/history", get(call_history))
        .route("/calls/{id}/ring", post(ring_call))
        .route("/calls/{id}/accept", post(accept_call))
        .route("/calls/{id}/decline", post(decline_call))
        .route("/calls/{id}/end", post(end_call))
        .route("/presence/online", get(online_friends))
        .route("/presence/disconnect", post(disconnect_self))
        .route("/presence/{user_id}", get(user_presence))
}

#[derive(Debug, Deserialize)]
pub struct PageQuery {
    limit: Option<i64>,
    offset: Option<i64>,
}

impl PageQuery {
    fn page(&self) -> Page {
        Page::new(self.limit, self.offset)
    }
}

#[derive(Debug, Deserialize)]
pub struct SearchQuery {
    #[serde(default)]
    q: String,
}

#[derive(Debug, Deserialize)]
pub struct ConversationListQuery {
    limit: Option<i64>,
    offset: Option<i64>,
    #[serde(default)]
    include_archived: bool,
    #[serde(default)]
    include_muted: bool,
}

/// `q` is required and must not be blank.
#[derive(Debug, Deserialize)]
pub struct PagedSearchQuery {
    #[serde(default)]
    q: String,
    limit: Option<i64>,
    offset: Option<i64>,
}

impl PagedSearchQuery {
    fn parts(&self) -> Result<(&str, Page), ApiError> {
        let q = self.q.trim();
        if q.is_empty() {
            return Err(ApiError::BadRequest("search query parameter 'q' is required".into()));
        }
        Ok((q, Page::new(self.limit, self.offset)))
    }
}

#[derive(Debug, Deserialize)]
pub struct TargetUser {
    user_id: UserId,
}

#[derive(Debug, Deserialize)]
pub struct MessageBody {
    content: String,
}

#[derive(Debug, Deserialize)]
pub struct CallRequest {
    callee_id: UserId,
    call_type: Option<String>,
}

fn body<T>(payload: Result<Json<T>, JsonRejection>) -> Result<T, ApiError> {
    payload
        .map(|Json(value)| value)
        .map_err(|rejection| ApiError::BadRequest(rejection.body_text()))
}

fn registry_failure(e: chaos_realtime::RegistryError) -> ApiError {
    ServiceError::Internal(e.to_string()).into()
}

// ── users ──

async fn me(AuthUser(user): AuthUser) -> Json<UserRow> {
    Json(user)
}

async fn search_users(
    AuthUser(user): AuthUser,
    State(state): State<AppState>,
    Query(query): Query<SearchQuery>,
) -> ApiResult<Vec<UserSearchRow>> {
    Ok(Json(state.services.users.search(&query.q, &user.id)?))
}

// ── friends ──

async fn list_friends(AuthUser(user): AuthUser, State(state): State<AppState>) -> ApiResult<Vec<UserRow>> {
    Ok(Json(state.services.social.friends(&user.id)?))
}

async fn pending_requests(AuthUser(user): AuthUser, State(state): State<AppState>) -> ApiResult<Vec<PendingRequest>> {
    Ok(Json(state.services.social.pending_requests(&user.id)?))
}

async fn send_friend_request(
    AuthUser(user): AuthUser,
    State(state): State<AppState>,
    payload: Result<Json<TargetUser>, JsonRejection>,
) -> Result<(StatusCode, Json<FriendshipRow>), ApiError> {
    let target = body(payload)?;
    let row = state.services.social.send_friend_request(&user.id, &target.user_id).await?;
    Ok((StatusCode::CREATED, Json(row)))
}

async fn accept_friend_request(
    AuthUser(user): AuthUser,
    State(state): State<AppState>,
    Path(requester): Path<UserId>,
) -> ApiResult<FriendshipRow> {
    Ok(Json(state.services.social.accept_friend_request(&requester, &user.id).await?))
}

async fn decline_friend_request(
    AuthUser(user): AuthUser,
    State(state): State<AppState>,
    Path(requester): Path<UserId>,
) -> Result<StatusCode, ApiError> {
    state.services.social.decline_friend_request(&requester, &user.id)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn remove_friend(
    AuthUser(user): AuthUser,
    State(state): State<AppState>,
    Path(friend): Path<UserId>,
) -> Result<StatusCode, ApiError> {
    state.services.social.remove_friend(&user.id, &friend)?;
    Ok(StatusCode::NO_CONTENT)
}

// ── blocks ──

async fn list_blocks(AuthUser(user): AuthUser, State(state): State<AppState>) -> ApiResult<Vec<BlockRow>> {
    Ok(Json(state.services.social.blocked_users(&user.id)?))
}

async fn block_user(
    AuthUser(user): AuthUser,
    State(state): State<AppState>,
    payload: Result<Json<TargetUser>, JsonRejection>,
) -> Result<(StatusCode, Json<BlockRow>), ApiError> {
    let target = body(payload)?;
    let row = state.services.social.block_user(&user.id, &target.user_id)?;
    Ok((StatusCode::CREATED, Json(row)))
}

async fn unblock_user(
    AuthUser(user): AuthUser,
    State(state): State<AppState>,
    Path(blocked): Path<UserId>,
) -> Result<StatusCode, ApiError> {
    state.services.social.unblock_user(&user.id, &blocked)?;
    Ok(StatusCode::NO_CONTENT)
}

// ── conversations ──

async fn list_conversations(
    AuthUser(user): AuthUser,
    State(state): State<AppState>,
    Query(query): Query<ConversationListQuery>,
) -> ApiResult<Vec<ConversationSummary>> {
    let filter = ConversationFilter {
        include_archived: query.include_archived,
        include_muted: query.include_muted,
    };
    let page = Page::new(query.limit, query.offset);
    Ok(Json(state.services.messaging.conversations(&user.id, filter, page)?))
}

async fn search_conversations(
    AuthUser(user): AuthUser,
    State(state): State<AppState>,
    Query(query): Query<PagedSearchQuery>,
) -> ApiResult<Vec<ConversationSummary>> {
    let (q, page) = query.parts()?;
    Ok(Json(state.services.messaging.search_conversations(&user.id, q, page)?))
}

async fn search_messages(
    AuthUser(user): AuthUser,
    State(state): State<AppState>,
    Query(query): Query<PagedSearchQuery>,
) -> ApiResult<Vec<MessageHit>> {
    let (q, page) = query.parts()?;
    Ok(Json(state.services.messaging.search_messages(&user.id, q, page)?))
}

async fn archive_conversation(
    AuthUser(user): AuthUser,
    State(state): State<AppState>,
    Path(id): Path<ConversationId>,
) -> ApiResult<Value> {
    state.services.messaging.set_archived(&id, &user.id, true)?;
    Ok(Json(json!({ "conversation_id": id, "is_archived": true })))
}

async fn unarchive_conversation(
    AuthUser(user): AuthUser,
    State(state): State<AppState>,
    Path(id): Path<ConversationId>,
) -> ApiResult<Value> {
    state.services.messaging.set_archived(&id, &user.id, false)?;
    Ok(Json(json!({ "conversation_id": id, "is_archived": false })))
}

async fn mute_conversation(
    AuthUser(user): AuthUser,
    State(state): State<AppState>,
    Path(id): Path<ConversationId>,
) -> ApiResult<Value> {
    state.services.messaging.set_muted(&id, &user.id, true)?;
    Ok(Json(json!({ "conversation_id": id, "is_muted": true })))
}

async fn unmute_conversation(
    AuthUser(user): AuthUser,
    State(state): State<AppState>,
    Path(id): Path<ConversationId>,
) -> ApiResult<Value> {
    state.services.messaging.set_muted(&id, &user.id, false)?;
    Ok(Json(json!({ "conversation_id": id, "is_muted": false })))
}

async fn open_conversation(
    AuthUser(user): AuthUser,
    State(state): State<AppState>,
    payload: Result<Json<TargetUser>, JsonRejection>,
) -> ApiResult<ConversationRow> {
    let target = body(payload)?;
    Ok(Json(state.services.messaging.get_or_create_direct(&user.id, &target.user_id)?))
}

async fn list_messages(
    AuthUser(user): AuthUser,
    State(state): State<AppState>,
    Path(id): Path<ConversationId>,
    Query(query): Query<PageQuery>,
) -> ApiResult<Vec<MessageRow>> {
    Ok(Json(state.services.messaging.messages(&id, &user.id, query.page())?))
}

async fn send_message(
    AuthUser(user): AuthUser,
    State(state): State<AppState>,
    Path(id): Path<ConversationId>,
    payload: Result<Json<MessageBody>, JsonRejection>,
) -> Result<(StatusCode, Json<MessageRow>), ApiError> {
    let message = body(payload)?;
    let row = state.services.messaging.send_message(&user.id, &id, &message.content).await?;
    Ok((StatusCode::CREATED, Json(row)))
}

async fn mark_conversation_read(
    AuthUser(user): AuthUser,
    State(state): State<AppState>,
    Path(id): Path<ConversationId>,
) -> ApiResult<Value> {
    let last_read_at = state.services.messaging.mark_read(&id, &user.id).await?;
    Ok(Json(json!({ "conversation_id": id, "last_read_at": last_read_at })))
}

async fn delete_message(
    AuthUser(user): AuthUser,
    State(state): State<AppState>,
    Path(id): Path<MessageId>,
) -> Result<StatusCode, ApiError> {
    state.services.messaging.delete_message(&id, &user.id)?;
    Ok(StatusCode::NO_CONTENT)
}

// ── notifications ──

async fn list_notifications(
    AuthUser(user): AuthUser,
    State(state): State<AppState>,
    Query(query): Query<PageQuery>,
) -> ApiResult<Vec<NotificationRow>> {
    Ok(Json(state.services.notifications.list(&user.id, query.page())?))
}

async fn unread_notifications(AuthUser(user): AuthUser, State(state): State<AppState>) -> ApiResult<Value> {
    let count = state.services.notifications.unread_count(&user.id)?;
    Ok(Json(json!({ "unread": count })))
}

async fn mark_notification_read(
    AuthUser(user): AuthUser,
    State(state): State<AppState>,
    Path(id): Path<NotificationId>,
) -> Result<StatusCode, ApiError> {
    state.services.notifications.mark_read(&id, &user.id)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn mark_all_notifications_read(AuthUser(user): AuthUser, State(state): State<AppState>) -> ApiResult<Value> {
    let updated = state.services.notifications.mark_all_read(&user.id)?;
    Ok(Json(json!({ "updated": updated })))
}

async fn delete_notification(
    AuthUser(user): AuthUser,
    State(state): State<AppState>,
    Path(id): Path<NotificationId>,
) -> Result<StatusCode, ApiError> {
    state.services.notifications.delete(&id, &user.id)?;
    Ok(StatusCode::NO_CONTENT)
}

// ── calls ──

async fn initiate_call(
    AuthUser(user): AuthUser,
    State(state): State<AppState>,
    payload: Result<Json<CallRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<CallRow>), ApiError> {
    let request = body(payload)?;
    let call_type = CallType::from_request(request.call_type.as_deref());
    let call = state.services.calls.initiate(&user.id, &request.callee_id, call_type).await?;
    Ok((StatusCode::CREATED, Json(call)))
}

async fn ring_call(
    AuthUser(user): AuthUser,
    State(state): State<AppState>,
    Path(id): Path<CallId>,
) -> ApiResult<CallRow> {
    Ok(Json(state.services.calls.mark_ringing(&id, &user.id)?))
}

async fn accept_call(
    AuthUser(user): AuthUser,
    State(state): State<AppState>,
    Path(id): Path<CallId>,
) -> ApiResult<CallRow> {
    Ok(Json(state.services.calls.accept(&id, &user.id).await?))
}

async fn decline_call(
    AuthUser(user): AuthUser,
    State(state): State<AppState>,
    Path(id): Path<CallId>,
) -> ApiResult<CallRow> {
    Ok(Json(state.services.calls.decline(&id, &user.id).await?))
}

async fn end_call(
    AuthUser(user): AuthUser,
    State(state): State<AppState>,
    Path(id): Path<CallId>,
) -> ApiResult<CallRow> {
    Ok(Json(state.services.calls.end(&id, &user.id).await?))
}

async fn active_call(AuthUser(user): AuthUser, State(state): State<AppState>) -> ApiResult<Option<CallRow>> {
    Ok(Json(state.services.calls.active_call(&user.id)?))
}

async fn call_history(
    AuthUser(user): AuthUser,
    State(state): State<AppState>,
    Query(query): Query<PageQuery>,
) -> ApiResult<Vec<CallRow>> {
    Ok(Json(state.services.calls.history(&user.id, query.page())?))
}

// ── presence ──

/// Online friends of the caller.
async fn online_friends(AuthUser(user): AuthUser, State(state): State<AppState>) -> ApiResult<Vec<UserId>> {
    let friends = state
        .services
        .social
        .friends(&user.id)?
        .into_iter()
        .map(|f| f.id)
        .collect();
    let online = state
        .dispatcher
        .registry()
        .filter_online(friends)
        .await
        .map_err(registry_failure)?;
    Ok(Json(online))
}

async fn user_presence(
    AuthUser(_): AuthUser,
    State(state): State<AppState>,
    Path(user_id): Path<UserId>,
) -> ApiResult<Value> {
    let online = state.dispatcher.registry().is_online(&user_id).await.map_err(registry_failure)?;
    Ok(Json(json!({ "user_id": user_id, "online": online })))
}

async fn disconnect_self(AuthUser(user): AuthUser, State(state): State<AppState>) -> ApiResult<Value> {
    let disconnected = state
        .dispatcher
        .registry()
        .force_disconnect(&user.id)
        .await
        .map_err(registry_failure)?;
    Ok(Json(json!({ "disconnected": disconnected })))
}
