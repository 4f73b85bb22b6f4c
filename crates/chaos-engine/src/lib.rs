//! Domain services: social graph, messaging, notifications and the call
//! state machine. Each service reads and writes through `chaos-store` and
//! pushes real-time events through a [`Dispatcher`].

pub mod calls;
pub mod directory;
pub mod error;
pub mod messaging;
pub mod notifications;
pub mod social;
pub mod sweeper;
pub mod users;

#[cfg(test)]
pub(crate) mod test_support;

use chaos_realtime::Dispatcher;
use chaos_store::Database;

pub use calls::{CallService, CallSettings};
pub use directory::StoreDirectory;
pub use error::ServiceError;
pub use messaging::MessagingService;
pub use notifications::NotificationService;
pub use social::SocialService;
pub use sweeper::start_call_timeout_sweep;
pub use users::UserService;

/// Every service, wired to one store and one dispatcher.
#[derive(Clone)]
pub struct Services {
    pub users: UserService,
    pub social: SocialService,
    pub messaging: MessagingService,
    pub notifications: NotificationService,
    pub calls: CallService,
}

impl Services {
    pub fn new(db: Database, dispatcher: Dispatcher, call_settings: CallSettings) -> Self {
        let notifications = NotificationService::new(db.clone(), dispatcher.clone());
        let messaging = MessagingService::new(db.clone(), dispatcher.clone());
        Self {
            users: UserService::new(db.clone()),
            social: SocialService::new(db.clone(), dispatcher.clone(), notifications.clone()),
            calls: CallService::new(db, dispatcher, messaging.clone(), call_settings),
            messaging,
            notifications,
        }
    }
}
