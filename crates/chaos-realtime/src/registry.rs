//! Process-wide map of user → live session.
//!
//! The map is owned by a single task. Every structural change and every
//! fanout request is a [`Command`] processed in arrival order, so callers
//! only ever see complete register/unregister transitions.

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use chaos_core::ids::{ConnectionId, UserId};
use chaos_core::Envelope;

use crate::session::{encode, EnqueueError, Frame, SessionHandle};

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("registry loop has stopped")]
    Stopped,
}

/// A user became reachable or stopped being reachable.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PresenceChange {
    pub user_id: UserId,
    pub username: String,
    pub online: bool,
}

#[derive(Clone, Debug)]
pub struct RegistrySettings {
    /// Capacity of the command queue feeding the loop.
    pub request_buffer: usize,
    pub presence_buffer: usize,
}

impl Default for RegistrySettings {
    fn default() -> Self {
        Self {
            request_buffer: 1024,
            presence_buffer: 256,
        }
    }
}

pub(crate) enum Command {
    Register {
        session: SessionHandle,
        respond_to: oneshot::Sender<()>,
    },
    Unregister {
        user_id: UserId,
        connection_id: ConnectionId,
        respond_to: oneshot::Sender<bool>,
    },
    Broadcast {
        user_ids: Vec<UserId>,
        frame: Frame,
        kind: &'static str,
    },
    IsOnline {
        user_id: UserId,
        respond_to: oneshot::Sender<bool>,
    },
    ListOnline {
        respond_to: oneshot::Sender<Vec<UserId>>,
    },
    FilterOnline {
        user_ids: Vec<UserId>,
        respond_to: oneshot::Sender<Vec<UserId>>,
    },
    ForceDisconnect {
        user_id: UserId,
        respond_to: oneshot::Sender<bool>,
    },
    EvictIdle {
        max_idle: Duration,
        respond_to: oneshot::Sender<usize>,
    },
}

/// Cloneable front door to the registry loop.
#[derive(Clone)]
pub struct Registry {
    tx: mpsc::Sender<Command>,
    presence: broadcast::Sender<PresenceChange>,
}

impl Registry {
    /// Start the registry loop. It runs until every `Registry` clone is dropped.
    pub fn spawn(settings: RegistrySettings) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(settings.request_buffer.max(1));
        let (presence, _) = broadcast::channel(settings.presence_buffer.max(1));
        let actor = RegistryLoop {
            receiver: rx,
            sessions: HashMap::new(),
            presence: presence.clone(),
        };
        let task = tokio::spawn(actor.run());
        (Self { tx, presence }, task)
    }

    /// Subscribe to online/offline transitions.
    pub fn subscribe_presence(&self) -> broadcast::Receiver<PresenceChange> {
        self.presence.subscribe()
    }

    /// Install a session, superseding any existing one for the same user.
    pub async fn register(&self, session: SessionHandle) -> Result<(), RegistryError> {
        self.request(|respond_to| Command::Register { session, respond_to }).await
    }

    /// Remove the session only if it is still the installed one for the user.
    /// Returns whether anything was removed.
    pub async fn unregister(&self, user_id: &UserId, connection_id: &ConnectionId) -> Result<bool, RegistryError> {
        let user_id = user_id.clone();
        let connection_id = connection_id.clone();
        self.request(|respond_to| Command::Unregister {
            user_id,
            connection_id,
            respond_to,
        })
        .await
    }

    pub async fn is_online(&self, user_id: &UserId) -> Result<bool, RegistryError> {
        let user_id = user_id.clone();
        self.request(|respond_to| Command::IsOnline { user_id, respond_to }).await
    }

    pub async fn list_online(&self) -> Result<Vec<UserId>, RegistryError> {
        self.request(|respond_to| Command::ListOnline { respond_to }).await
    }

    /// The subset of `user_ids` with a live session, in input order.
    pub async fn filter_online(&self, user_ids: Vec<UserId>) -> Result<Vec<UserId>, RegistryError> {
        self.request(|respond_to| Command::FilterOnline { user_ids, respond_to }).await
    }

    /// Close and remove the user's session. Returns whether one existed.
    pub async fn force_disconnect(&self, user_id: &UserId) -> Result<bool, RegistryError> {
        let user_id = user_id.clone();
        self.request(|respond_to| Command::ForceDisconnect { user_id, respond_to }).await
    }

    /// Close every session whose last liveness signal is older than `max_idle`.
    pub async fn evict_idle(&self, max_idle: Duration) -> Result<usize, RegistryError> {
        self.request(|respond_to| Command::EvictIdle { max_idle, respond_to }).await
    }

    /// Queue `envelope` for every listed user that has a live session.
    ///
    /// Never waits: if the loop's request buffer is saturated the fanout is
    /// dropped with a warning.
    pub fn broadcast_to(&self, user_ids: Vec<UserId>, envelope: &Envelope) {
        if user_ids.is_empty() {
            return;
        }
        let frame = match encode(envelope) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(kind = envelope.kind(), error = %e, "failed to encode envelope");
                return;
            }
        };
        let cmd = Command::Broadcast {
            user_ids,
            frame,
            kind: envelope.kind(),
        };
        match self.tx.try_send(cmd) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(kind = envelope.kind(), "registry request buffer full, dropping broadcast");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!(kind = envelope.kind(), "registry stopped, dropping broadcast");
            }
        }
    }

    /// A registry whose loop never runs, for exercising a saturated buffer.
    #[cfg(test)]
    pub(crate) fn unserviced(buffer: usize) -> (Self, mpsc::Receiver<Command>) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        let (presence, _) = broadcast::channel(1);
        (Self { tx, presence }, rx)
    }

    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T, RegistryError> {
        let (respond_to, rx) = oneshot::channel();
        self.tx.send(make(respond_to)).await.map_err(|_| RegistryError::Stopped)?;
        rx.await.map_err(|_| RegistryError::Stopped)
    }
}

struct RegistryLoop {
    receiver: mpsc::Receiver<Command>,
    sessions: HashMap<UserId, SessionHandle>,
    presence: broadcast::Sender<PresenceChange>,
}

impl RegistryLoop {
    async fn run(mut self) {
        info!("registry loop starting");
        while let Some(cmd) = self.receiver.recv().await {
            self.handle(cmd);
        }
        for session in self.sessions.values() {
            session.close();
        }
        info!(sessions = self.sessions.len(), "registry loop stopped");
    }

    fn handle(&mut self, cmd: Command) {
        match cmd {
            Command::Register { session, respond_to } => {
                self.register(session);
                let _ = respond_to.send(());
            }
            Command::Unregister {
                user_id,
                connection_id,
                respond_to,
            } => {
                let _ = respond_to.send(self.unregister(&user_id, &connection_id));
            }
            Command::Broadcast { user_ids, frame, kind } => self.broadcast(&user_ids, &frame, kind),
            Command::IsOnline { user_id, respond_to } => {
                let _ = respond_to.send(self.sessions.contains_key(&user_id));
            }
            Command::ListOnline { respond_to } => {
                let mut online: Vec<UserId> = self.sessions.keys().cloned().collect();
                online.sort();
                let _ = respond_to.send(online);
            }
            Command::FilterOnline { user_ids, respond_to } => {
                let online = user_ids
                    .into_iter()
                    .filter(|id| self.sessions.contains_key(id))
                    .collect();
                let _ = respond_to.send(online);
            }
            Command::ForceDisconnect { user_id, respond_to } => {
                let removed = self.remove(&user_id);
                if removed {
                    info!(user_id = %user_id, "session force-disconnected");
                }
                let _ = respond_to.send(removed);
            }
            Command::EvictIdle { max_idle, respond_to } => {
                let stale: Vec<UserId> = self
                    .sessions
                    .values()
                    .filter(|s| s.idle_for() > max_idle)
                    .map(|s| s.user_id.clone())
                    .collect();
                for user_id in &stale {
                    info!(user_id = %user_id, "evicting idle session");
                    self.remove(user_id);
                }
                let _ = respond_to.send(stale.len());
            }
        }
    }

    fn register(&mut self, session: SessionHandle) {
        let user_id = session.user_id.clone();
        let username = session.username.clone();
        if let Some(previous) = self.sessions.insert(user_id.clone(), session) {
            info!(
                user_id = %user_id,
                superseded = %previous.connection_id,
                "superseding existing session"
            );
            previous.close();
        }
        self.publish(user_id, username, true);
    }

    fn unregister(&mut self, user_id: &UserId, connection_id: &ConnectionId) -> bool {
        let current = match self.sessions.get(user_id) {
            Some(s) if &s.connection_id == connection_id => s,
            _ => {
                debug!(user_id = %user_id, connection_id = %connection_id, "ignoring stale unregister");
                return false;
            }
        };
        current.close();
        self.remove(user_id)
    }

    fn broadcast(&mut self, user_ids: &[UserId], frame: &Frame, kind: &'static str) {
        let mut evicted = Vec::new();
        for user_id in user_ids {
            let Some(session) = self.sessions.get(user_id) else {
                continue;
            };
            match session.enqueue(frame.clone()) {
                Ok(()) => {}
                Err(EnqueueError::Full) => {
                    warn!(user_id = %user_id, kind, "outbound queue full, evicting session");
                    evicted.push(user_id.clone());
                }
                Err(EnqueueError::Closed) => {
                    debug!(user_id = %user_id, kind, "session already closed");
                    evicted.push(user_id.clone());
                }
            }
        }
        for user_id in &evicted {
            self.remove(user_id);
        }
    }

    /// Close and drop the user's session, announcing the user offline.
    fn remove(&mut self, user_id: &UserId) -> bool {
        match self.sessions.remove(user_id) {
            Some(session) => {
                session.close();
                self.publish(session.user_id, session.username, false);
                true
            }
            None => false,
        }
    }

    fn publish(&self, user_id: UserId, username: String, online: bool) {
        // No subscribers is fine.
        let _ = self.presence.send(PresenceChange {
            user_id,
            username,
            online,
        });
    }
}

/// Periodically evict sessions that stopped answering liveness probes.
pub fn start_liveness_sweep(registry: Registry, interval: Duration, max_idle: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            match registry.evict_idle(max_idle).await {
                Ok(0) => {}
                Ok(n) => info!(evicted = n, "liveness sweep"),
                Err(_) => break,
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::Session;
    use chaos_core::Event;
    use tokio::sync::mpsc::Receiver;

    fn user(id: &str) -> UserId {
        UserId::from_raw(id)
    }

    fn detached(id: &str, capacity: usize) -> (SessionHandle, Receiver<Frame>) {
        Session::new(user(id), id, capacity).into_parts()
    }

    fn pong() -> Envelope {
        Envelope::new(Event::Pong)
    }

    #[tokio::test]
    async fn register_makes_user_online() {
        let (registry, _) = Registry::spawn(RegistrySettings::default());
        let (a, _rx) = detached("usr_a", 4);
        registry.register(a).await.unwrap();

        assert!(registry.is_online(&user("usr_a")).await.unwrap());
        assert!(!registry.is_online(&user("usr_b")).await.unwrap());
        assert_eq!(registry.list_online().await.unwrap(), vec![user("usr_a")]);
    }

    #[tokio::test]
    async fn second_register_supersedes_first() {
        let (registry, _) = Registry::spawn(RegistrySettings::default());
        let (first, _rx1) = detached("usr_a", 4);
        let (second, mut rx2) = detached("usr_a", 4);

        registry.register(first.clone()).await.unwrap();
        registry.register(second.clone()).await.unwrap();

        assert!(first.is_closed());
        assert!(!second.is_closed());
        assert_eq!(registry.list_online().await.unwrap().len(), 1);

        registry.broadcast_to(vec![user("usr_a")], &pong());
        let frame = rx2.recv().await.unwrap();
        assert!(frame.contains("\"pong\""));
    }

    #[tokio::test]
    async fn stale_unregister_is_ignored() {
        let (registry, _) = Registry::spawn(RegistrySettings::default());
        let (first, _rx1) = detached("usr_a", 4);
        let (second, _rx2) = detached("usr_a", 4);
        registry.register(first.clone()).await.unwrap();
        registry.register(second.clone()).await.unwrap();

        assert!(!registry.unregister(&first.user_id, &first.connection_id).await.unwrap());
        assert!(!registry.unregister(&first.user_id, &first.connection_id).await.unwrap());
        assert!(registry.is_online(&user("usr_a")).await.unwrap());

        assert!(registry.unregister(&second.user_id, &second.connection_id).await.unwrap());
        assert!(!registry.is_online(&user("usr_a")).await.unwrap());
        assert!(second.is_closed());
    }

    #[tokio::test]
    async fn broadcast_skips_offline_users() {
        let (registry, _) = Registry::spawn(RegistrySettings::default());
        let (a, mut rx) = detached("usr_a", 4);
        registry.register(a).await.unwrap();

        registry.broadcast_to(vec![user("usr_ghost"), user("usr_a")], &pong());
        let frame = rx.recv().await.unwrap();
        let value: serde_json::Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(value["type"], "pong");
        assert_eq!(registry.list_online().await.unwrap(), vec![user("usr_a")]);
    }

    #[tokio::test]
    async fn full_queue_evicts_session() {
        let (registry, _) = Registry::spawn(RegistrySettings::default());
        let (slow, _rx) = detached("usr_slow", 1);
        let (fast, mut fast_rx) = detached("usr_fast", 8);
        registry.register(slow.clone()).await.unwrap();
        registry.register(fast).await.unwrap();

        registry.broadcast_to(vec![user("usr_slow"), user("usr_fast")], &pong());
        registry.broadcast_to(vec![user("usr_slow"), user("usr_fast")], &pong());

        assert!(!registry.is_online(&user("usr_slow")).await.unwrap());
        assert!(slow.is_closed());
        assert!(registry.is_online(&user("usr_fast")).await.unwrap());
        assert!(fast_rx.recv().await.is_some());
        assert!(fast_rx.recv().await.is_some());
    }

    #[tokio::test]
    async fn per_session_order_is_fifo() {
        let (registry, _) = Registry::spawn(RegistrySettings::default());
        let (a, mut rx) = detached("usr_a", 16);
        registry.register(a).await.unwrap();

        for ping in [Event::Ping, Event::Pong, Event::Ping] {
            registry.broadcast_to(vec![user("usr_a")], &Envelope::new(ping));
        }
        let mut kinds = Vec::new();
        for _ in 0..3 {
            let frame = rx.recv().await.unwrap();
            let value: serde_json::Value = serde_json::from_str(&frame).unwrap();
            kinds.push(value["type"].as_str().unwrap().to_string());
        }
        assert_eq!(kinds, vec!["ping", "pong", "ping"]);
    }

    #[tokio::test]
    async fn saturated_request_buffer_drops_broadcast() {
        let (registry, mut rx) = Registry::unserviced(1);

        registry.broadcast_to(vec![user("usr_a")], &pong());
        registry.broadcast_to(vec![user("usr_b")], &pong());

        match rx.try_recv() {
            Ok(Command::Broadcast { user_ids, .. }) => assert_eq!(user_ids, vec![user("usr_a")]),
            _ => panic!("expected the first broadcast to be buffered"),
        }
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn filter_online_keeps_input_order() {
        let (registry, _) = Registry::spawn(RegistrySettings::default());
        let (a, _ra) = detached("usr_a", 1);
        let (c, _rc) = detached("usr_c", 1);
        registry.register(a).await.unwrap();
        registry.register(c).await.unwrap();

        let online = registry
            .filter_online(vec![user("usr_c"), user("usr_b"), user("usr_a")])
            .await
            .unwrap();
        assert_eq!(online, vec![user("usr_c"), user("usr_a")]);
    }

    #[tokio::test]
    async fn force_disconnect_closes_session() {
        let (registry, _) = Registry::spawn(RegistrySettings::default());
        let (a, _rx) = detached("usr_a", 1);
        registry.register(a.clone()).await.unwrap();

        assert!(registry.force_disconnect(&user("usr_a")).await.unwrap());
        assert!(a.is_closed());
        assert!(!registry.force_disconnect(&user("usr_a")).await.unwrap());
    }

    #[tokio::test]
    async fn presence_changes_are_published() {
        let (registry, _) = Registry::spawn(RegistrySettings::default());
        let mut presence = registry.subscribe_presence();
        let (first, _r1) = detached("usr_a", 1);
        let (second, _r2) = detached("usr_a", 1);

        registry.register(first).await.unwrap();
        registry.register(second.clone()).await.unwrap();
        registry.unregister(&second.user_id, &second.connection_id).await.unwrap();

        let online: Vec<bool> = vec![
            presence.recv().await.unwrap().online,
            presence.recv().await.unwrap().online,
            presence.recv().await.unwrap().online,
        ];
        assert_eq!(online, vec![true, true, false]);
    }

    #[tokio::test(start_paused = true)]
    async fn evict_idle_removes_quiet_sessions() {
        let (registry, _) = Registry::spawn(RegistrySettings::default());
        let (quiet, _r1) = detached("usr_quiet", 1);
        let (chatty, _r2) = detached("usr_chatty", 1);
        registry.register(quiet.clone()).await.unwrap();
        registry.register(chatty.clone()).await.unwrap();

        tokio::time::advance(Duration::from_secs(120)).await;
        chatty.touch();

        assert_eq!(registry.evict_idle(Duration::from_secs(90)).await.unwrap(), 1);
        assert!(quiet.is_closed());
        assert_eq!(registry.list_online().await.unwrap(), vec![user("usr_chatty")]);
    }

    #[tokio::test]
    async fn stopped_loop_reports_error() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let (presence, _) = broadcast::channel(1);
        let registry = Registry { tx, presence };
        assert!(matches!(
            registry.is_online(&user("usr_a")).await,
            Err(RegistryError::Stopped)
        ));
    }
}
