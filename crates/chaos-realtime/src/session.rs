use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::Message as WsMessage;
use futures::{Sink, SinkExt, Stream, StreamExt};
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use chaos_core::envelope::ClientFrame;
use chaos_core::ids::{ConnectionId, UserId};
use chaos_core::{Envelope, Event};

use crate::dispatcher::Dispatcher;

/// One serialized envelope, shared across every recipient of a broadcast.
pub type Frame = Arc<str>;

/// Serialize an envelope once for fanout.
pub fn encode(envelope: &Envelope) -> Result<Frame, serde_json::Error> {
    serde_json::to_string(envelope).map(Frame::from)
}

/// Timers and limits for a live session.
#[derive(Clone, Debug)]
pub struct SessionSettings {
    /// Outbound queue capacity; a full queue evicts the session.
    pub queue_capacity: usize,
    /// Send a transport ping after this long without outbound traffic.
    pub ping_interval: Duration,
    /// Close the session if no liveness signal arrives within this window.
    pub pong_wait: Duration,
    pub write_timeout: Duration,
    /// Largest inbound text frame accepted, in bytes.
    pub max_frame_bytes: usize,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            queue_capacity: 256,
            ping_interval: Duration::from_secs(54),
            pong_wait: Duration::from_secs(60),
            write_timeout: Duration::from_secs(10),
            max_frame_bytes: 512,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EnqueueError {
    /// The consumer is not keeping up.
    Full,
    /// The writer has already stopped.
    Closed,
}

/// The registry-facing half of a session: addressing, its outbound queue,
/// liveness and the shutdown signal.
#[derive(Clone, Debug)]
pub struct SessionHandle {
    pub connection_id: ConnectionId,
    pub user_id: UserId,
    pub username: String,
    outbound: mpsc::Sender<Frame>,
    shutdown: CancellationToken,
    epoch: Instant,
    last_seen_ms: Arc<AtomicU64>,
}

impl SessionHandle {
    /// Non-blocking append to the outbound queue.
    pub fn enqueue(&self, frame: Frame) -> Result<(), EnqueueError> {
        if self.shutdown.is_cancelled() {
            return Err(EnqueueError::Closed);
        }
        self.outbound.try_send(frame).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => EnqueueError::Full,
            mpsc::error::TrySendError::Closed(_) => EnqueueError::Closed,
        })
    }

    /// Signal both pumps to stop. Idempotent.
    pub fn close(&self) {
        self.shutdown.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Record a liveness signal.
    pub fn touch(&self) {
        let ms = u64::try_from(self.epoch.elapsed().as_millis()).unwrap_or(u64::MAX);
        self.last_seen_ms.store(ms, Ordering::Relaxed);
    }

    /// Time since the last liveness signal.
    pub fn idle_for(&self) -> Duration {
        let last = Duration::from_millis(self.last_seen_ms.load(Ordering::Relaxed));
        self.epoch.elapsed().saturating_sub(last)
    }

    pub(crate) fn shutdown_token(&self) -> &CancellationToken {
        &self.shutdown
    }
}

/// One live duplex channel bound to one user.
pub struct Session {
    handle: SessionHandle,
    outbound: mpsc::Receiver<Frame>,
}

impl Session {
    pub fn new(user_id: UserId, username: impl Into<String>, queue_capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(queue_capacity.max(1));
        Self {
            handle: SessionHandle {
                connection_id: ConnectionId::new(),
                user_id,
                username: username.into(),
                outbound: tx,
                shutdown: CancellationToken::new(),
                epoch: Instant::now(),
                last_seen_ms: Arc::new(AtomicU64::new(0)),
            },
            outbound: rx,
        }
    }

    pub fn handle(&self) -> SessionHandle {
        self.handle.clone()
    }

    /// Split into the handle and the raw outbound receiver, for callers that
    /// drain the queue themselves instead of running the pumps.
    pub fn into_parts(self) -> (SessionHandle, mpsc::Receiver<Frame>) {
        (self.handle, self.outbound)
    }

    /// Register with the registry, pump frames both ways until either side
    /// fails or the session is closed, then unregister.
    pub async fn run<S, R, E>(self, sink: S, stream: R, dispatcher: Dispatcher, settings: SessionSettings)
    where
        S: Sink<WsMessage> + Unpin + Send + 'static,
        S::Error: std::fmt::Display + Send + 'static,
        R: Stream<Item = Result<WsMessage, E>> + Unpin + Send + 'static,
        E: std::fmt::Display + Send + 'static,
    {
        let Session { handle, outbound } = self;
        let registry = dispatcher.registry().clone();

        if let Err(e) = registry.register(handle.clone()).await {
            warn!(user_id = %handle.user_id, error = %e, "session not registered");
            return;
        }
        info!(user_id = %handle.user_id, connection_id = %handle.connection_id, "session started");

        let mut writer = tokio::spawn(write_pump(sink, outbound, handle.clone(), settings.clone()));
        let mut reader = tokio::spawn(read_pump(stream, handle.clone(), dispatcher, settings));

        tokio::select! {
            _ = &mut writer => {
                handle.close();
                let _ = reader.await;
            }
            _ = &mut reader => {
                handle.close();
                let _ = writer.await;
            }
        }

        let _ = registry.unregister(&handle.user_id, &handle.connection_id).await;
        info!(user_id = %handle.user_id, connection_id = %handle.connection_id, "session ended");
    }
}

async fn write_pump<S>(mut sink: S, mut outbound: mpsc::Receiver<Frame>, handle: SessionHandle, settings: SessionSettings)
where
    S: Sink<WsMessage> + Unpin,
    S::Error: std::fmt::Display,
{
    let mut ping = tokio::time::interval(settings.ping_interval);
    ping.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ping.tick().await; // consume first immediate tick

    loop {
        tokio::select! {
            _ = handle.shutdown_token().cancelled() => break,
            frame = outbound.recv() => {
                let Some(frame) = frame else { break };
                if !send(&mut sink, WsMessage::Text(String::from(&*frame).into()), &handle, settings.write_timeout).await {
                    break;
                }
                // Probe only when the channel has been quiet.
                ping.reset();
            }
            _ = ping.tick() => {
                if !send(&mut sink, WsMessage::Ping(Vec::new().into()), &handle, settings.write_timeout).await {
                    break;
                }
                trace!(connection_id = %handle.connection_id, "sent ping");
            }
        }
    }

    let _ = tokio::time::timeout(settings.write_timeout, sink.send(WsMessage::Close(None))).await;
}

async fn send<S>(sink: &mut S, msg: WsMessage, handle: &SessionHandle, timeout: Duration) -> bool
where
    S: Sink<WsMessage> + Unpin,
    S::Error: std::fmt::Display,
{
    match tokio::time::timeout(timeout, sink.send(msg)).await {
        Ok(Ok(())) => true,
        Ok(Err(e)) => {
            debug!(connection_id = %handle.connection_id, error = %e, "write failed");
            false
        }
        Err(_) => {
            info!(connection_id = %handle.connection_id, "write timed out");
            false
        }
    }
}

async fn read_pump<R, E>(mut stream: R, handle: SessionHandle, dispatcher: Dispatcher, settings: SessionSettings)
where
    R: Stream<Item = Result<WsMessage, E>> + Unpin,
    E: std::fmt::Display,
{
    handle.touch();
    loop {
        let deadline = settings.pong_wait.saturating_sub(handle.idle_for());
        let next = tokio::select! {
            _ = handle.shutdown_token().cancelled() => break,
            next = tokio::time::timeout(deadline, stream.next()) => next,
        };

        let msg = match next {
            Err(_) => {
                if handle.idle_for() < settings.pong_wait {
                    continue;
                }
                info!(user_id = %handle.user_id, connection_id = %handle.connection_id, "liveness deadline exceeded");
                break;
            }
            Ok(None) => break,
            Ok(Some(Err(e))) => {
                debug!(connection_id = %handle.connection_id, error = %e, "read failed");
                break;
            }
            Ok(Some(Ok(msg))) => msg,
        };

        match msg {
            WsMessage::Text(text) => {
                let len = text.as_str().len();
                if len > settings.max_frame_bytes {
                    info!(connection_id = %handle.connection_id, len, "inbound frame too large");
                    break;
                }
                handle_client_frame(text.as_str(), &handle, &dispatcher).await;
            }
            WsMessage::Pong(_) => handle.touch(),
            WsMessage::Close(_) => break,
            // Transport pings are answered by the websocket layer.
            WsMessage::Ping(_) => {}
            WsMessage::Binary(_) => debug!(connection_id = %handle.connection_id, "ignoring binary frame"),
        }
    }
}

/// Inbound frames never change durable state: only liveness and typing
/// signals are acted on.
async fn handle_client_frame(raw: &str, handle: &SessionHandle, dispatcher: &Dispatcher) {
    let frame = match serde_json::from_str::<ClientFrame>(raw) {
        Ok(frame) => frame,
        Err(e) => {
            debug!(connection_id = %handle.connection_id, error = %e, "unparseable client frame");
            return;
        }
    };

    match frame {
        ClientFrame::Ping => {
            handle.touch();
            reply(handle, Event::Pong);
        }
        ClientFrame::Pong => handle.touch(),
        ClientFrame::Typing(signal) => dispatcher.typing(handle, &signal.conversation_id, true).await,
        ClientFrame::StopTyping(signal) => dispatcher.typing(handle, &signal.conversation_id, false).await,
        ClientFrame::Message(_) => {
            debug!(user_id = %handle.user_id, "ignoring socket message frame; messages are sent over HTTP");
        }
        ClientFrame::Unknown => debug!(user_id = %handle.user_id, "ignoring unknown client frame"),
    }
}

fn reply(handle: &SessionHandle, event: Event) {
    let frame = match encode(&Envelope::new(event)) {
        Ok(frame) => frame,
        Err(e) => {
            warn!(error = %e, "failed to encode reply");
            return;
        }
    };
    if let Err(EnqueueError::Full) = handle.enqueue(frame) {
        warn!(user_id = %handle.user_id, connection_id = %handle.connection_id, "outbound queue full, closing session");
        handle.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::tests::StaticDirectory;
    use crate::registry::{Registry, RegistrySettings};
    use futures::channel::mpsc as fmpsc;

    type Inbound = fmpsc::UnboundedSender<Result<WsMessage, String>>;
    type Outbound = fmpsc::UnboundedReceiver<WsMessage>;

    struct Harness {
        inbound: Inbound,
        outbound: Outbound,
        handle: SessionHandle,
        task: tokio::task::JoinHandle<()>,
    }

    fn spawn_session(dispatcher: &Dispatcher, user: &str, settings: SessionSettings) -> Harness {
        let (in_tx, in_rx) = fmpsc::unbounded::<Result<WsMessage, String>>();
        let (out_tx, out_rx) = fmpsc::unbounded::<WsMessage>();
        let session = Session::new(UserId::from_raw(user), user.trim_start_matches("usr_"), settings.queue_capacity);
        let handle = session.handle();
        let task = tokio::spawn(session.run(out_tx, in_rx, dispatcher.clone(), settings));
        Harness {
            inbound: in_tx,
            outbound: out_rx,
            handle,
            task,
        }
    }

    fn text(msg: WsMessage) -> serde_json::Value {
        match msg {
            WsMessage::Text(t) => serde_json::from_str(t.as_str()).unwrap(),
            other => panic!("expected text frame, got {other:?}"),
        }
    }

    async fn next_text(outbound: &mut Outbound) -> serde_json::Value {
        loop {
            let msg = tokio::time::timeout(Duration::from_secs(2), outbound.next())
                .await
                .unwrap()
                .unwrap();
            if matches!(msg, WsMessage::Text(_)) {
                return text(msg);
            }
        }
    }

    async fn wait_online(registry: &Registry, user: &str, expected: bool) {
        for _ in 0..100 {
            if registry.is_online(&UserId::from_raw(user)).await.unwrap() == expected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("{user} never became online={expected}");
    }

    fn setup(directory: StaticDirectory) -> (Registry, Dispatcher) {
        let (registry, _) = Registry::spawn(RegistrySettings::default());
        let dispatcher = Dispatcher::new(registry.clone(), Arc::new(directory));
        (registry, dispatcher)
    }

    fn assert_spawnable<F: std::future::Future + Send + 'static>(_: &F) {}

    #[tokio::test]
    async fn run_is_spawnable_over_axum_socket_halves() {
        let (_in_tx, in_rx) = fmpsc::unbounded::<Result<WsMessage, axum::Error>>();
        let (out_tx, _out_rx) = fmpsc::unbounded::<WsMessage>();
        let (_, dispatcher) = setup(StaticDirectory::default());
        let session = Session::new(UserId::from_raw("usr_a"), "a", 1);
        let run = session.run(out_tx, in_rx, dispatcher, SessionSettings::default());
        assert_spawnable(&run);
    }

    #[test]
    fn encode_produces_wire_json() {
        let frame = encode(&Envelope::new(Event::Pong)).unwrap();
        let value: serde_json::Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(value["type"], "pong");
    }

    #[tokio::test]
    async fn enqueue_reports_full_queue() {
        let session = Session::new(UserId::from_raw("usr_a"), "a", 1);
        let handle = session.handle();
        handle.enqueue(Frame::from("one")).unwrap();
        assert_eq!(handle.enqueue(Frame::from("two")), Err(EnqueueError::Full));
        handle.close();
        assert_eq!(handle.enqueue(Frame::from("three")), Err(EnqueueError::Closed));
    }

    #[tokio::test(start_paused = true)]
    async fn idle_time_tracks_touch() {
        let session = Session::new(UserId::from_raw("usr_a"), "a", 1);
        let handle = session.handle();
        tokio::time::advance(Duration::from_secs(30)).await;
        assert!(handle.idle_for() >= Duration::from_secs(30));
        handle.touch();
        assert!(handle.idle_for() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn session_registers_and_answers_app_ping() {
        let (registry, dispatcher) = setup(StaticDirectory::default());
        let mut h = spawn_session(&dispatcher, "usr_a", SessionSettings::default());
        wait_online(&registry, "usr_a", true).await;

        h.inbound.unbounded_send(Ok(WsMessage::Text(r#"{"type":"ping"}"#.into()))).unwrap();
        let reply = next_text(&mut h.outbound).await;
        assert_eq!(reply["type"], "pong");
        assert!(reply["timestamp"].is_string());
    }

    #[tokio::test]
    async fn socket_message_frames_are_ignored() {
        let (registry, dispatcher) = setup(StaticDirectory::default());
        let mut h = spawn_session(&dispatcher, "usr_a", SessionSettings::default());
        wait_online(&registry, "usr_a", true).await;

        h.inbound
            .unbounded_send(Ok(WsMessage::Text(
                r#"{"type":"message","data":{"conversation_id":"conv_1","content":"hi"}}"#.into(),
            )))
            .unwrap();
        h.inbound.unbounded_send(Ok(WsMessage::Text(r#"{"type":"ping"}"#.into()))).unwrap();

        // The only reply is the pong; the message frame produced nothing.
        let reply = next_text(&mut h.outbound).await;
        assert_eq!(reply["type"], "pong");
        assert!(registry.is_online(&UserId::from_raw("usr_a")).await.unwrap());
    }

    #[tokio::test]
    async fn transport_close_unregisters() {
        let (registry, dispatcher) = setup(StaticDirectory::default());
        let h = spawn_session(&dispatcher, "usr_a", SessionSettings::default());
        wait_online(&registry, "usr_a", true).await;

        h.inbound.unbounded_send(Ok(WsMessage::Close(None))).unwrap();
        tokio::time::timeout(Duration::from_secs(2), h.task).await.unwrap().unwrap();
        assert!(!registry.is_online(&UserId::from_raw("usr_a")).await.unwrap());
    }

    #[tokio::test]
    async fn read_error_tears_down() {
        let (registry, dispatcher) = setup(StaticDirectory::default());
        let h = spawn_session(&dispatcher, "usr_a", SessionSettings::default());
        wait_online(&registry, "usr_a", true).await;

        h.inbound.unbounded_send(Err("connection reset".into())).unwrap();
        tokio::time::timeout(Duration::from_secs(2), h.task).await.unwrap().unwrap();
        assert!(!registry.is_online(&UserId::from_raw("usr_a")).await.unwrap());
    }

    #[tokio::test]
    async fn oversized_frame_closes_session() {
        let (registry, dispatcher) = setup(StaticDirectory::default());
        let settings = SessionSettings {
            max_frame_bytes: 16,
            ..Default::default()
        };
        let h = spawn_session(&dispatcher, "usr_a", settings);
        wait_online(&registry, "usr_a", true).await;

        h.inbound
            .unbounded_send(Ok(WsMessage::Text("x".repeat(64).into())))
            .unwrap();
        tokio::time::timeout(Duration::from_secs(2), h.task).await.unwrap().unwrap();
        assert!(!registry.is_online(&UserId::from_raw("usr_a")).await.unwrap());
    }

    #[tokio::test]
    async fn supersession_closes_previous_session() {
        let (registry, dispatcher) = setup(StaticDirectory::default());
        let first = spawn_session(&dispatcher, "usr_a", SessionSettings::default());
        wait_online(&registry, "usr_a", true).await;

        let second = spawn_session(&dispatcher, "usr_a", SessionSettings::default());
        tokio::time::timeout(Duration::from_secs(2), first.task).await.unwrap().unwrap();
        assert!(first.handle.is_closed());

        // The stale unregister from the first session left the second in place.
        assert!(registry.is_online(&UserId::from_raw("usr_a")).await.unwrap());
        assert!(!second.handle.is_closed());
    }

    #[tokio::test]
    async fn typing_is_relayed_to_other_participants() {
        let directory = StaticDirectory::default().with_conversation("conv_1", &["usr_a", "usr_b"]);
        let (registry, dispatcher) = setup(directory);
        let a = spawn_session(&dispatcher, "usr_a", SessionSettings::default());
        let mut b = spawn_session(&dispatcher, "usr_b", SessionSettings::default());
        wait_online(&registry, "usr_a", true).await;
        wait_online(&registry, "usr_b", true).await;

        a.inbound
            .unbounded_send(Ok(WsMessage::Text(
                r#"{"type":"typing","data":{"conversation_id":"conv_1"}}"#.into(),
            )))
            .unwrap();

        let event = next_text(&mut b.outbound).await;
        assert_eq!(event["type"], "typing");
        assert_eq!(event["data"]["user_id"], "usr_a");
        assert_eq!(event["data"]["is_typing"], true);
    }

    #[tokio::test(start_paused = true)]
    async fn writer_pings_when_idle() {
        let (registry, dispatcher) = setup(StaticDirectory::default());
        let settings = SessionSettings {
            ping_interval: Duration::from_secs(5),
            pong_wait: Duration::from_secs(600),
            ..Default::default()
        };
        let mut h = spawn_session(&dispatcher, "usr_a", settings);
        wait_online(&registry, "usr_a", true).await;

        tokio::time::advance(Duration::from_secs(6)).await;
        let msg = tokio::time::timeout(Duration::from_secs(1), h.outbound.next())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(msg, WsMessage::Ping(_)), "got {msg:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn missing_liveness_closes_session() {
        let (registry, dispatcher) = setup(StaticDirectory::default());
        let settings = SessionSettings {
            ping_interval: Duration::from_secs(600),
            pong_wait: Duration::from_secs(10),
            ..Default::default()
        };
        let h = spawn_session(&dispatcher, "usr_a", settings);
        wait_online(&registry, "usr_a", true).await;

        tokio::time::advance(Duration::from_secs(11)).await;
        tokio::time::timeout(Duration::from_secs(1), h.task).await.unwrap().unwrap();
        assert!(!registry.is_online(&UserId::from_raw("usr_a")).await.unwrap());
    }
}
