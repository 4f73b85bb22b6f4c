use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc::Receiver;

use chaos_realtime::{Dispatcher, Frame, Registry, RegistrySettings, Session};
use chaos_store::social::SocialRepo;
use chaos_store::users::{UserRepo, UserRow};
use chaos_store::Database;

use crate::calls::CallSettings;
use crate::directory::StoreDirectory;
use crate::Services;

pub(crate) struct Fixture {
    pub db: Database,
    pub registry: Registry,
    pub services: Services,
}

impl Fixture {
    pub fn new() -> Self {
        let db = Database::in_memory().unwrap();
        let (registry, _) = Registry::spawn(RegistrySettings::default());
        let dispatcher = Dispatcher::new(registry.clone(), Arc::new(StoreDirectory::new(db.clone())));
        let services = Services::new(db.clone(), dispatcher, CallSettings::default());
        Self { db, registry, services }
    }

    pub fn user(&self, username: &str) -> UserRow {
        UserRepo::new(self.db.clone())
            .create(username, username, &format!("{username}@example.com"))
            .unwrap()
    }

    pub fn befriend(&self, a: &UserRow, b: &UserRow) {
        let social = SocialRepo::new(self.db.clone());
        social.create_request(&a.id, &b.id).unwrap();
        social.accept_request(&a.id, &b.id).unwrap();
    }

    /// Register a detached session and return its outbound queue.
    pub async fn connect(&self, user: &UserRow) -> Receiver<Frame> {
        let (handle, rx) = Session::new(user.id.clone(), user.username.clone(), 64).into_parts();
        self.registry.register(handle).await.unwrap();
        rx
    }

    /// Everything queued so far, waiting briefly for in-flight fanout.
    pub async fn drain(&self, rx: &mut Receiver<Frame>) -> Vec<serde_json::Value> {
        // A registry round trip orders this after any broadcast already submitted.
        let _ = self.registry.list_online().await;
        let mut events = Vec::new();
        while let Ok(Some(frame)) = tokio::time::timeout(Duration::from_millis(50), rx.recv()).await {
            events.push(serde_json::from_str(&frame).unwrap());
        }
        events
    }
}
