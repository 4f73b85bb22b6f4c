use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::calls::CallService;
use crate::error::ServiceError;

/// One pass: time out every call that has awaited the callee too long.
/// Returns how many calls were marked missed.
pub async fn sweep_calls(calls: &CallService) -> usize {
    let overdue = match calls.overdue() {
        Ok(rows) => rows,
        Err(e) => {
            warn!(error = %e, "call sweep query failed");
            return 0;
        }
    };

    let mut missed = 0;
    for call in overdue {
        match calls.timeout(&call.id).await {
            Ok(Some(_)) => missed += 1,
            Ok(None) | Err(ServiceError::NotFound(_)) => {}
            Err(e) => {
                warn!(call_id = %call.id, error = %e, "call timeout failed");
                if let Err(e) = calls.fail(&call.id) {
                    warn!(call_id = %call.id, error = %e, "could not mark call failed");
                }
            }
        }
    }
    missed
}

/// Run [`sweep_calls`] on the configured interval.
pub fn start_call_timeout_sweep(calls: CallService) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(calls.settings().sweep_interval);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let missed = sweep_calls(&calls).await;
            if missed > 0 {
                info!(missed, "call sweep");
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::Fixture;
    use chaos_core::{CallStatus, CallType};
    use chaos_store::calls::CallRepo;
    use chrono::Utc;

    #[tokio::test]
    async fn sweep_only_touches_overdue_calls() {
        let fx = Fixture::new();
        let alice = fx.user("alice");
        let bob = fx.user("bob");
        let carol = fx.user("carol");
        let dave = fx.user("dave");
        fx.befriend(&alice, &bob);
        fx.befriend(&carol, &dave);
        let calls = &fx.services.calls;

        let old = calls.initiate(&alice.id, &bob.id, CallType::Voice).await.unwrap();
        let fresh = calls.initiate(&carol.id, &dave.id, CallType::Video).await.unwrap();
        let at = chaos_store::row_helpers::sql_time(Utc::now() - chrono::Duration::seconds(45));
        fx.db
            .with_conn(|conn| {
                conn.execute("UPDATE calls SET started_at = ?1 WHERE id = ?2", [at.as_str(), old.id.as_str()])?;
                Ok(())
            })
            .unwrap();

        assert_eq!(sweep_calls(calls).await, 1);
        let repo = CallRepo::new(fx.db.clone());
        assert_eq!(repo.get(&old.id).unwrap().status, CallStatus::Missed);
        assert_eq!(repo.get(&fresh.id).unwrap().status, CallStatus::Pending);
        assert_eq!(sweep_calls(calls).await, 0);
    }
}
