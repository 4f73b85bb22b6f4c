use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use chaos_core::ids::{CallId, UserId};
use chaos_core::{CallStatus, CallType, Page};

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CallRow {
    pub id: CallId,
    pub caller_id: UserId,
    pub callee_id: UserId,
    pub call_type: CallType,
    pub status: CallStatus,
    pub started_at: String,
    pub answered_at: Option<String>,
    pub ended_at: Option<String>,
    pub duration: Option<i64>,
}

impl CallRow {
    pub fn involves(&self, user: &UserId) -> bool {
        &self.caller_id == user || &self.callee_id == user
    }

    pub fn started_at(&self) -> Result<DateTime<Utc>, StoreError> {
        row_helpers::parse_time(&self.started_at, "calls", "started_at")
    }

    pub fn answered_at(&self) -> Result<Option<DateTime<Utc>>, StoreError> {
        self.answered_at
            .as_deref()
            .map(|raw| row_helpers::parse_time(raw, "calls", "answered_at"))
            .transpose()
    }
}

/// A guarded status change: applied only if the call is currently in one of `from`.
#[derive(Clone, Debug)]
pub struct CallTransition<'a> {
    pub from: &'a [CallStatus],
    pub to: CallStatus,
    pub answered_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub duration: Option<i64>,
}

impl<'a> CallTransition<'a> {
    pub fn new(from: &'a [CallStatus], to: CallStatus) -> Self {
        Self {
            from,
            to,
            answered_at: None,
            ended_at: None,
            duration: None,
        }
    }

    pub fn answered_at(mut self, at: DateTime<Utc>) -> Self {
        self.answered_at = Some(at);
        self
    }

    pub fn ended_at(mut self, at: DateTime<Utc>) -> Self {
        self.ended_at = Some(at);
        self
    }

    pub fn duration(mut self, seconds: i64) -> Self {
        self.duration = Some(seconds);
        self
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum TransitionOutcome {
    /// The update won; the row as written.
    Applied(CallRow),
    /// The guard failed; the status the call was found in.
    Rejected { current: CallStatus },
}

const COLUMNS: &str =
    "id, caller_id, callee_id, call_type, status, started_at, answered_at, ended_at, duration";

pub struct CallRepo {
    db: Database,
}

impl CallRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Insert a pending call unless either participant already occupies a
    /// non-terminal call. Check and insert run in one transaction under the
    /// connection lock.
    #[instrument(skip(self), fields(caller = %caller, callee = %callee, call_type = %call_type))]
    pub fn create_if_idle(
        &self,
        caller: &UserId,
        callee: &UserId,
        call_type: CallType,
    ) -> Result<CallRow, StoreError> {
        let id = CallId::new();
        let now = row_helpers::now();

        self.db.with_conn(|conn| {
            let tx = conn.unchecked_transaction()?;
            let busy: i64 = tx.query_row(
                &format!(
                    "SELECT COUNT(*) FROM calls
                     WHERE status IN ({})
                       AND (caller_id IN (?1, ?2) OR callee_id IN (?1, ?2))",
                    status_list(CallStatus::NON_TERMINAL)
                ),
                [caller.as_str(), callee.as_str()],
                |row| row.get(0),
            )?;
            if busy > 0 {
                return Err(StoreError::Conflict("already in a call".into()));
            }

            tx.execute(
                "INSERT INTO calls (id, caller_id, callee_id, call_type, status, started_at)
                 VALUES (?1, ?2, ?3, ?4, 'pending', ?5)",
                rusqlite::params![id.as_str(), caller.as_str(), callee.as_str(), call_type.as_str(), now],
            )?;
            tx.commit()?;

            Ok(CallRow {
                id,
                caller_id: caller.clone(),
                callee_id: callee.clone(),
                call_type,
                status: CallStatus::Pending,
                started_at: now,
                answered_at: None,
                ended_at: None,
                duration: None,
            })
        })
    }

    #[instrument(skip(self), fields(call_id = %id))]
    pub fn get(&self, id: &CallId) -> Result<CallRow, StoreError> {
        self.db.with_conn(|conn| get_call(conn, id))
    }

    /// Compare-and-set on the call's status.
    ///
    /// A single `UPDATE .. WHERE status IN (from)`; a concurrent writer that
    /// got there first makes this one report `Rejected`.
    #[instrument(skip(self, t), fields(call_id = %id, to = %t.to))]
    pub fn transition(&self, id: &CallId, t: CallTransition<'_>) -> Result<TransitionOutcome, StoreError> {
        self.db.with_conn(|conn| {
            let changed = conn.execute(
                &format!(
                    "UPDATE calls SET
                        status = ?1,
                        answered_at = COALESCE(?2, answered_at),
                        ended_at = COALESCE(?3, ended_at),
                        duration = COALESCE(?4, duration)
                     WHERE id = ?5 AND status IN ({})",
                    status_list(t.from)
                ),
                rusqlite::params![
                    t.to.as_str(),
                    t.answered_at.map(row_helpers::sql_time),
                    t.ended_at.map(row_helpers::sql_time),
                    t.duration,
                    id.as_str(),
                ],
            )?;

            let row = get_call(conn, id)?;
            if changed == 0 {
                debug!(call_id = %id, current = %row.status, to = %t.to, "call transition rejected");
                return Ok(TransitionOutcome::Rejected { current: row.status });
            }
            Ok(TransitionOutcome::Applied(row))
        })
    }

    /// Most recent non-terminal call the user takes part in.
    #[instrument(skip(self), fields(user_id = %user))]
    pub fn active_for_user(&self, user: &UserId) -> Result<Option<CallRow>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {COLUMNS} FROM calls
                 WHERE (caller_id = ?1 OR callee_id = ?1) AND status IN ({})
                 ORDER BY started_at DESC, id DESC LIMIT 1",
                status_list(CallStatus::NON_TERMINAL)
            ))?;
            let mut rows = stmt.query([user.as_str()])?;
            match rows.next()? {
                Some(row) => Ok(Some(row_to_call(row)?)),
                None => Ok(None),
            }
        })
    }

    #[instrument(skip(self), fields(user_id = %user, limit = page.limit, offset = page.offset))]
    pub fn history(&self, user: &UserId, page: Page) -> Result<Vec<CallRow>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {COLUMNS} FROM calls
                 WHERE caller_id = ?1 OR callee_id = ?1
                 ORDER BY started_at DESC, id DESC LIMIT ?2 OFFSET ?3"
            ))?;
            let mut rows = stmt.query(rusqlite::params![user.as_str(), page.limit, page.offset])?;
            let mut results = Vec::new();
            while let Some(row) = rows.next()? {
                results.push(row_to_call(row)?);
            }
            Ok(results)
        })
    }

    /// Calls still awaiting the callee that started at or before `cutoff`.
    pub fn awaiting_since(&self, cutoff: DateTime<Utc>) -> Result<Vec<CallRow>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {COLUMNS} FROM calls
                 WHERE status IN ({}) AND started_at <= ?1
                 ORDER BY started_at",
                status_list(CallStatus::AWAITING_RESPONSE)
            ))?;
            let mut rows = stmt.query([row_helpers::sql_time(cutoff)])?;
            let mut results = Vec::new();
            while let Some(row) = rows.next()? {
                results.push(row_to_call(row)?);
            }
            Ok(results)
        })
    }
}

/// Quoted SQL list of statuses. Values come from the closed enum, never from input.
fn status_list(statuses: &[CallStatus]) -> String {
    if statuses.is_empty() {
        return "NULL".into();
    }
    statuses
        .iter()
        .map(|s| format!("'{}'", s.as_str()))
        .collect::<Vec<_>>()
        .join(", ")
}

fn get_call(conn: &rusqlite::Connection, id: &CallId) -> Result<CallRow, StoreError> {
    let mut stmt = conn.prepare(&format!("SELECT {COLUMNS} FROM calls WHERE id = ?1"))?;
    let mut rows = stmt.query([id.as_str()])?;
    match rows.next()? {
        Some(row) => row_to_call(row),
        None => Err(StoreError::NotFound(format!("call {id}"))),
    }
}

fn row_to_call(row: &rusqlite::Row<'_>) -> Result<CallRow, StoreError> {
    let call_type: String = row_helpers::get(row, 3, "calls", "call_type")?;
    let status: String = row_helpers::get(row, 4, "calls", "status")?;
    Ok(CallRow {
        id: CallId::from_raw(row_helpers::get::<String>(row, 0, "calls", "id")?),
        caller_id: UserId::from_raw(row_helpers::get::<String>(row, 1, "calls", "caller_id")?),
        callee_id: UserId::from_raw(row_helpers::get::<String>(row, 2, "calls", "callee_id")?),
        call_type: row_helpers::parse_enum(&call_type, "calls", "call_type")?,
        status: row_helpers::parse_enum(&status, "calls", "status")?,
        started_at: row_helpers::get(row, 5, "calls", "started_at")?,
        answered_at: row_helpers::get_opt(row, 6, "calls", "answered_at")?,
        ended_at: row_helpers::get_opt(row, 7, "calls", "ended_at")?,
        duration: row_helpers::get_opt(row, 8, "calls", "duration")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::users::UserRepo;
    use std::sync::Arc;

    fn setup() -> (Database, CallRepo, UserId, UserId, UserId) {
        let db = Database::in_memory().unwrap();
        let users = UserRepo::new(db.clone());
        let a = users.create("Ann", "ann", "ann@example.com").unwrap().id;
        let b = users.create("Ben", "ben", "ben@example.com").unwrap().id;
        let c = users.create("Cat", "cat", "cat@example.com").unwrap().id;
        (db.clone(), CallRepo::new(db), a, b, c)
    }

    #[test]
    fn create_starts_pending() {
        let (_, repo, a, b, _) = setup();
        let call = repo.create_if_idle(&a, &b, CallType::Video).unwrap();
        assert_eq!(call.status, CallStatus::Pending);
        assert_eq!(call.call_type, CallType::Video);
        assert_eq!(repo.get(&call.id).unwrap(), call);
    }

    #[test]
    fn self_call_rejected_by_schema() {
        let (_, repo, a, _, _) = setup();
        assert!(matches!(repo.create_if_idle(&a, &a, CallType::Voice), Err(StoreError::Database(_))));
    }

    #[test]
    fn busy_participant_conflicts() {
        let (_, repo, a, b, c) = setup();
        let call = repo.create_if_idle(&b, &c, CallType::Voice).unwrap();
        repo.transition(&call.id, CallTransition::new(CallStatus::AWAITING_RESPONSE, CallStatus::Accepted))
            .unwrap();

        let err = repo.create_if_idle(&a, &b, CallType::Voice).unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)), "got: {err}");
        let err = repo.create_if_idle(&c, &a, CallType::Voice).unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
    }

    #[test]
    fn terminal_calls_free_participants() {
        let (_, repo, a, b, _) = setup();
        let call = repo.create_if_idle(&a, &b, CallType::Voice).unwrap();
        repo.transition(&call.id, CallTransition::new(CallStatus::AWAITING_RESPONSE, CallStatus::Declined))
            .unwrap();
        assert!(repo.create_if_idle(&b, &a, CallType::Voice).is_ok());
    }

    #[test]
    fn transition_applies_once() {
        let (_, repo, a, b, _) = setup();
        let call = repo.create_if_idle(&a, &b, CallType::Voice).unwrap();
        let now = Utc::now();

        let first = repo
            .transition(
                &call.id,
                CallTransition::new(CallStatus::AWAITING_RESPONSE, CallStatus::Accepted).answered_at(now),
            )
            .unwrap();
        let TransitionOutcome::Applied(row) = first else {
            panic!("expected applied, got {first:?}");
        };
        assert_eq!(row.status, CallStatus::Accepted);
        assert_eq!(row.answered_at.as_deref(), Some(row_helpers::sql_time(now).as_str()));

        let second = repo
            .transition(&call.id, CallTransition::new(CallStatus::AWAITING_RESPONSE, CallStatus::Declined))
            .unwrap();
        assert_eq!(second, TransitionOutcome::Rejected { current: CallStatus::Accepted });
    }

    #[test]
    fn transition_keeps_existing_timestamps() {
        let (_, repo, a, b, _) = setup();
        let call = repo.create_if_idle(&a, &b, CallType::Voice).unwrap();
        let answered = Utc::now();
        repo.transition(
            &call.id,
            CallTransition::new(CallStatus::AWAITING_RESPONSE, CallStatus::Accepted).answered_at(answered),
        )
        .unwrap();
        let outcome = repo
            .transition(
                &call.id,
                CallTransition::new(&[CallStatus::Accepted], CallStatus::Ended)
                    .ended_at(Utc::now())
                    .duration(42),
            )
            .unwrap();
        let TransitionOutcome::Applied(row) = outcome else {
            panic!("expected applied");
        };
        assert_eq!(row.duration, Some(42));
        assert!(row.ended_at.is_some());
        assert_eq!(row.answered_at().unwrap().map(row_helpers::sql_time), Some(row_helpers::sql_time(answered)));
    }

    #[test]
    fn transition_on_missing_call_is_not_found() {
        let (_, repo, _, _, _) = setup();
        let result = repo.transition(
            &CallId::from_raw("call_missing"),
            CallTransition::new(CallStatus::AWAITING_RESPONSE, CallStatus::Accepted),
        );
        assert!(matches!(result, Err(StoreError::NotFound(_))));
    }

    #[test]
    fn concurrent_transitions_have_one_winner() {
        let (_, repo, a, b, _) = setup();
        let call = repo.create_if_idle(&a, &b, CallType::Voice).unwrap();
        let repo = Arc::new(repo);

        let handles: Vec<_> = [CallStatus::Accepted, CallStatus::Declined, CallStatus::Missed]
            .into_iter()
            .map(|to| {
                let repo = repo.clone();
                let id = call.id.clone();
                std::thread::spawn(move || {
                    repo.transition(&id, CallTransition::new(CallStatus::AWAITING_RESPONSE, to))
                        .unwrap()
                })
            })
            .collect();

        let outcomes: Vec<TransitionOutcome> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        let applied = outcomes
            .iter()
            .filter(|o| matches!(o, TransitionOutcome::Applied(_)))
            .count();
        assert_eq!(applied, 1);
    }

    #[test]
    fn active_and_history() {
        let (_, repo, a, b, c) = setup();
        let old = repo.create_if_idle(&a, &b, CallType::Voice).unwrap();
        repo.transition(&old.id, CallTransition::new(CallStatus::AWAITING_RESPONSE, CallStatus::Missed))
            .unwrap();
        assert!(repo.active_for_user(&a).unwrap().is_none());

        let live = repo.create_if_idle(&c, &a, CallType::Voice).unwrap();
        assert_eq!(repo.active_for_user(&a).unwrap().map(|call| call.id), Some(live.id.clone()));
        assert_eq!(repo.active_for_user(&c).unwrap().map(|call| call.id), Some(live.id.clone()));
        assert!(repo.active_for_user(&b).unwrap().is_none());

        let history: Vec<CallId> = repo
            .history(&a, Page::default())
            .unwrap()
            .into_iter()
            .map(|call| call.id)
            .collect();
        assert_eq!(history, vec![live.id, old.id]);
    }

    #[test]
    fn awaiting_since_filters_by_age_and_status() {
        let (db, repo, a, b, c) = setup();
        let d = UserRepo::new(db.clone()).create("Dan", "dan", "dan@example.com").unwrap().id;
        let stale = repo.create_if_idle(&a, &b, CallType::Voice).unwrap();
        let fresh = repo.create_if_idle(&c, &d, CallType::Voice).unwrap();

        let long_ago = row_helpers::sql_time(Utc::now() - chrono::Duration::seconds(120));
        db.with_conn(|conn| {
            conn.execute(
                "UPDATE calls SET started_at = ?1 WHERE id = ?2",
                rusqlite::params![long_ago, stale.id.as_str()],
            )?;
            Ok(())
        })
        .unwrap();

        let cutoff = Utc::now() - chrono::Duration::seconds(30);
        let due: Vec<CallId> = repo.awaiting_since(cutoff).unwrap().into_iter().map(|call| call.id).collect();
        assert_eq!(due, vec![stale.id]);
        assert!(!due.contains(&fresh.id));
    }
}
