use tokio::sync::broadcast;

use chaos_core::envelope::UserStatusData;
use chaos_core::Event;

use crate::dispatcher::Dispatcher;
use crate::registry::PresenceChange;

/// Forwards registry presence changes to the user's online friends as
/// `user_online` / `user_offline` events.
pub struct PresenceBridge {
    dispatcher: Dispatcher,
}

impl PresenceBridge {
    pub fn new(dispatcher: Dispatcher) -> Self {
        Self { dispatcher }
    }

    pub fn start(self, mut rx: broadcast::Receiver<PresenceChange>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(change) => self.forward(change).await,
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!(skipped = n, "presence bridge lagged, dropped changes");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        tracing::info!("presence channel closed");
                        break;
                    }
                }
            }
        })
    }

    async fn forward(&self, change: PresenceChange) {
        let user_id = change.user_id.clone();
        let data = UserStatusData {
            user_id: change.user_id,
            username: change.username,
            online: change.online,
        };
        let event = if change.online {
            Event::UserOnline(data)
        } else {
            Event::UserOffline(data)
        };
        self.dispatcher.to_friends(&user_id, event).await;
    }
}

/// Subscribe to the dispatcher's registry and start a bridge.
pub fn start_presence_bridge(dispatcher: Dispatcher) -> tokio::task::JoinHandle<()> {
    let rx = dispatcher.registry().subscribe_presence();
    PresenceBridge::new(dispatcher).start(rx)
}
