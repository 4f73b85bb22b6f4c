//! Voice/video call signaling.
//!
//! Every status change is a compare-and-set against the store
//! ([`CallRepo::transition`]); a request that loses a race reports
//! `InvalidTransition` instead of overwriting the winner.

use std::time::Duration;

use chrono::Utc;
use tracing::{debug, info, warn};

use chaos_core::calls::format_call_duration;
use chaos_core::envelope::{CallAnswer, CallEndData, CallRequestData, CallResponseData, ENDED_BY_TIMEOUT};
use chaos_core::ids::{CallId, UserId};
use chaos_core::{CallStatus, CallType, Event, Page};
use chaos_realtime::Dispatcher;
use chaos_store::calls::{CallRepo, CallRow, CallTransition, TransitionOutcome};
use chaos_store::conversations::{ConversationRepo, MessageKind};
use chaos_store::social::SocialRepo;
use chaos_store::users::UserRepo;
use chaos_store::{Database, StoreError};

use crate::error::ServiceError;
use crate::messaging::MessagingService;

#[derive(Clone, Debug)]
pub struct CallSettings {
    /// How long a call may await the callee before it is missed.
    pub ring_timeout: Duration,
    /// How often the timeout sweep runs.
    pub sweep_interval: Duration,
}

impl Default for CallSettings {
    fn default() -> Self {
        Self {
            ring_timeout: Duration::from_secs(30),
            sweep_interval: Duration::from_secs(5),
        }
    }
}

#[derive(Clone)]
pub struct CallService {
    db: Database,
    dispatcher: Dispatcher,
    messaging: MessagingService,
    settings: CallSettings,
}

impl CallService {
    pub fn new(db: Database, dispatcher: Dispatcher, messaging: MessagingService, settings: CallSettings) -> Self {
        Self {
            db,
            dispatcher,
            messaging,
            settings,
        }
    }

    pub fn settings(&self) -> &CallSettings {
        &self.settings
    }

    fn repo(&self) -> CallRepo {
        CallRepo::new(self.db.clone())
    }

    fn load(&self, id: &CallId) -> Result<CallRow, ServiceError> {
        self.repo().get(id).map_err(|e| match e {
            StoreError::NotFound(_) => ServiceError::call_not_found(id),
            other => other.into(),
        })
    }

    fn apply(&self, id: &CallId, transition: CallTransition<'_>) -> Result<CallRow, ServiceError> {
        let to = transition.to;
        match self.repo().transition(id, transition)? {
            TransitionOutcome::Applied(row) => Ok(row),
            TransitionOutcome::Rejected { current } => Err(ServiceError::InvalidTransition(format!(
                "call {id} is {current}, cannot move to {to}"
            ))),
        }
    }

    pub async fn initiate(&self, caller: &UserId, callee: &UserId, call_type: CallType) -> Result<CallRow, ServiceError> {
        if caller == callee {
            return Err(ServiceError::InvalidInput("cannot call yourself".into()));
        }
        if !UserRepo::new(self.db.clone()).exists(callee)? {
            return Err(ServiceError::NotFound(format!("user {callee}")));
        }
        let social = SocialRepo::new(self.db.clone());
        if !social.are_friends(caller, callee)? {
            return Err(ServiceError::not_friends());
        }
        if social.is_blocked(caller, callee)? {
            return Err(ServiceError::blocked());
        }

        let call = self.repo().create_if_idle(caller, callee, call_type).map_err(|e| match e {
            StoreError::Conflict(_) => ServiceError::already_in_call(),
            other => other.into(),
        })?;
        info!(call_id = %call.id, caller = %caller, callee = %callee, call_type = %call_type, "call initiated");

        let event = Event::CallRequest(CallRequestData {
            call_id: call.id.clone(),
            caller_id: call.caller_id.clone(),
            callee_id: call.callee_id.clone(),
            call_type: call.call_type,
        });
        self.dispatcher.to_user(callee, event).await;
        Ok(call)
    }

    /// The callee's client reports that it is ringing.
    pub fn mark_ringing(&self, id: &CallId, actor: &UserId) -> Result<CallRow, ServiceError> {
        let call = self.load(id)?;
        if &call.callee_id != actor {
            return Err(ServiceError::not_callee());
        }
        self.apply(id, CallTransition::new(&[CallStatus::Pending], CallStatus::Ringing))
    }

    pub async fn accept(&self, id: &CallId, actor: &UserId) -> Result<CallRow, ServiceError> {
        let call = self.load(id)?;
        if &call.callee_id != actor {
            return Err(ServiceError::not_callee());
        }
        let call = self.apply(
            id,
            CallTransition::new(CallStatus::AWAITING_RESPONSE, CallStatus::Accepted).answered_at(Utc::now()),
        )?;
        info!(call_id = %id, "call accepted");

        self.respond(&call, CallAnswer::Accepted).await;
        self.transcript(&call, "Call started", MessageKind::CallStart);
        Ok(call)
    }

    pub async fn decline(&self, id: &CallId, actor: &UserId) -> Result<CallRow, ServiceError> {
        let call = self.load(id)?;
        if &call.callee_id != actor {
            return Err(ServiceError::not_callee());
        }
        let call = self.apply(
            id,
            CallTransition::new(CallStatus::AWAITING_RESPONSE, CallStatus::Declined).ended_at(Utc::now()),
        )?;
        info!(call_id = %id, "call declined");

        self.respond(&call, CallAnswer::Declined).await;
        Ok(call)
    }

    pub async fn end(&self, id: &CallId, actor: &UserId) -> Result<CallRow, ServiceError> {
        let call = self.load(id)?;
        if !call.involves(actor) {
            return Err(ServiceError::not_participant());
        }
        let answered_at = match (call.status, call.answered_at()?) {
            (CallStatus::Accepted, Some(at)) => at,
            (status, _) => {
                return Err(ServiceError::InvalidTransition(format!("call {id} is {status}, cannot end")));
            }
        };

        let now = Utc::now();
        let duration = (now - answered_at).num_seconds().max(0);
        let call = self.apply(
            id,
            CallTransition::new(&[CallStatus::Accepted], CallStatus::Ended)
                .ended_at(now)
                .duration(duration),
        )?;
        info!(call_id = %id, duration, ended_by = %actor, "call ended");

        self.announce_end(&call, duration, actor.as_str()).await;
        let content = format!("Call ended • {}", format_call_duration(duration));
        self.transcript(&call, &content, MessageKind::CallEnd);
        Ok(call)
    }

    /// Mark a call missed if it has awaited the callee past the ring
    /// timeout. Returns the updated row, or `None` when nothing changed.
    pub async fn timeout(&self, id: &CallId) -> Result<Option<CallRow>, ServiceError> {
        let call = self.load(id)?;
        if !CallStatus::AWAITING_RESPONSE.contains(&call.status) {
            return Ok(None);
        }
        let waited = Utc::now() - call.started_at()?;
        if waited.to_std().unwrap_or_default() < self.settings.ring_timeout {
            return Ok(None);
        }

        let transition = CallTransition::new(CallStatus::AWAITING_RESPONSE, CallStatus::Missed)
            .ended_at(Utc::now())
            .duration(0);
        let call = match self.repo().transition(id, transition)? {
            TransitionOutcome::Applied(row) => row,
            TransitionOutcome::Rejected { current } => {
                debug!(call_id = %id, current = %current, "call answered before timeout");
                return Ok(None);
            }
        };
        info!(call_id = %id, "call missed");

        self.announce_end(&call, 0, ENDED_BY_TIMEOUT).await;
        Ok(Some(call))
    }

    /// Abandon a non-terminal call after an unrecoverable error.
    pub fn fail(&self, id: &CallId) -> Result<CallRow, ServiceError> {
        let call = self.apply(
            id,
            CallTransition::new(CallStatus::NON_TERMINAL, CallStatus::Failed).ended_at(Utc::now()),
        )?;
        warn!(call_id = %id, "call marked failed");
        Ok(call)
    }

    pub fn active_call(&self, user: &UserId) -> Result<Option<CallRow>, ServiceError> {
        Ok(self.repo().active_for_user(user)?)
    }

    pub fn history(&self, user: &UserId, page: Page) -> Result<Vec<CallRow>, ServiceError> {
        Ok(self.repo().history(user, page)?)
    }

    /// Calls awaiting the callee for longer than the ring timeout.
    pub fn overdue(&self) -> Result<Vec<CallRow>, ServiceError> {
        let ring = chrono::Duration::from_std(self.settings.ring_timeout)
            .map_err(|e| ServiceError::Internal(e.to_string()))?;
        Ok(self.repo().awaiting_since(Utc::now() - ring)?)
    }

    async fn respond(&self, call: &CallRow, response: CallAnswer) {
        let event = Event::CallResponse(CallResponseData {
            call_id: call.id.clone(),
            response,
            caller_id: call.caller_id.clone(),
            callee_id: call.callee_id.clone(),
        });
        self.dispatcher.to_user(&call.caller_id, event).await;
    }

    async fn announce_end(&self, call: &CallRow, duration: i64, ended_by: &str) {
        let event = Event::CallEnd(CallEndData {
            call_id: call.id.clone(),
            duration,
            ended_by: ended_by.to_string(),
            caller_id: call.caller_id.clone(),
            callee_id: call.callee_id.clone(),
        });
        self.dispatcher
            .to_users(vec![call.caller_id.clone(), call.callee_id.clone()], event)
            .await;
    }

    /// Transcript entries are best-effort: the transition has already committed.
    fn transcript(&self, call: &CallRow, content: &str, kind: MessageKind) {
        let result = ConversationRepo::new(self.db.clone())
            .get_or_create_direct(&call.caller_id, &call.callee_id)
            .map_err(ServiceError::from)
            .and_then(|conv| {
                self.messaging
                    .append_transcript(&conv.id, &call.caller_id, content, kind, Some(&call.id))
            });
        if let Err(e) = result {
            warn!(call_id = %call.id, kind = %kind, error = %e, "failed to record call transcript");
        }
    }
}
