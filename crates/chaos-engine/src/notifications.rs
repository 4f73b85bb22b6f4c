use chaos_core::envelope::NotificationData;
use chaos_core::ids::{NotificationId, UserId};
use chaos_core::{Event, Page};
use chaos_realtime::Dispatcher;
use chaos_store::notifications::{NewNotification, NotificationRepo, NotificationRow};
use chaos_store::users::UserRepo;
use chaos_store::Database;

use crate::error::ServiceError;

#[derive(Clone)]
pub struct NotificationService {
    db: Database,
    dispatcher: Dispatcher,
}

impl NotificationService {
    pub fn new(db: Database, dispatcher: Dispatcher) -> Self {
        Self { db, dispatcher }
    }

    fn repo(&self) -> NotificationRepo {
        NotificationRepo::new(self.db.clone())
    }

    /// Persist a notification and push it to the user if they are online.
    pub async fn create(&self, new: NewNotification<'_>) -> Result<NotificationRow, ServiceError> {
        let users = UserRepo::new(self.db.clone());
        if !users.exists(new.user_id)? {
            return Err(ServiceError::NotFound(format!("user {}", new.user_id)));
        }
        if let Some(related) = new.related_user_id {
            if !users.exists(related)? {
                return Err(ServiceError::NotFound(format!("related user {related}")));
            }
        }

        let row = self.repo().create(new)?;
        let event = Event::Notification(NotificationData {
            notification_id: row.id.clone(),
            kind: row.kind.as_str().to_string(),
            title: row.title.clone(),
            content: row.content.clone(),
            related_user_id: row.related_user_id.clone(),
        });
        self.dispatcher.to_user(&row.user_id, event).await;
        Ok(row)
    }

    pub fn list(&self, user: &UserId, page: Page) -> Result<Vec<NotificationRow>, ServiceError> {
        Ok(self.repo().list(user, page)?)
    }

    pub fn mark_read(&self, id: &NotificationId, user: &UserId) -> Result<(), ServiceError> {
        Ok(self.repo().mark_read(id, user)?)
    }

    pub fn mark_all_read(&self, user: &UserId) -> Result<usize, ServiceError> {
        Ok(self.repo().mark_all_read(user)?)
    }

    pub fn delete(&self, id: &NotificationId, user: &UserId) -> Result<(), ServiceError> {
        Ok(self.repo().delete(id, user)?)
    }

    pub fn unread_count(&self, user: &UserId) -> Result<i64, ServiceError> {
        Ok(self.repo().unread_count(user)?)
    }
}
