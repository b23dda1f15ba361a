use crate::config::{ConfigError, StreamConfig};
use crate::notify::{spawn_notifier, CueSender, Notifier};
use crate::supervisor::{Control, ConnectionState, DropReason, SendOutcome, Supervisor};
use crate::transport::{Connector, WsConnector};
use appeals_core::{Command, QueueItem};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

/// Handle to a running stream supervisor.
///
/// The queue can only be read through snapshots; every change goes through
/// the supervisor task. Dropping the handle stops the supervisor.
pub struct StreamClient {
    control: mpsc::Sender<Control>,
    queue_rx: watch::Receiver<Vec<QueueItem>>,
    state_rx: watch::Receiver<ConnectionState>,
    task: JoinHandle<()>,
    notifier_task: Option<JoinHandle<()>>,
}

impl StreamClient {
    /// WebSocket client for `config.url` with cues routed to `notifier`.
    /// Must be called inside a tokio runtime. Does not connect until [`start`](Self::start).
    pub fn connect<N: Notifier>(config: StreamConfig, notifier: N) -> Result<Self, ConfigError> {
        config.validate()?;
        let (cues, notifier_task) = spawn_notifier(notifier);
        let connector = WsConnector::new(config.url.clone());
        let mut client = Self::spawn(config, connector, cues);
        client.notifier_task = Some(notifier_task);
        Ok(client)
    }

    pub fn spawn<C: Connector>(config: StreamConfig, connector: C, cues: CueSender) -> Self {
        let (control, inbox) = mpsc::channel(config.control_capacity.max(1));
        let (queue_tx, queue_rx) = watch::channel(Vec::new());
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let supervisor = Supervisor::new(config, connector, inbox, cues, queue_tx, state_tx);
        let task = tokio::spawn(supervisor.run());
        Self {
            control,
            queue_rx,
            state_rx,
            task,
            notifier_task: None,
        }
    }

    pub async fn start(&self) {
        let _ = self.control.send(Control::Start).await;
    }

    pub async fn stop(&self) {
        let _ = self.control.send(Control::Stop).await;
    }

    /// Sends `command` if the connection is open. Never queued for later.
    pub async fn send(&self, command: Command) -> SendOutcome {
        self.dispatch(command, None).await
    }

    /// Sends `command` on behalf of one appeal, marking it as having an
    /// action in flight. Refused while a previous action on the same appeal
    /// has not been superseded by a fresh snapshot.
    pub async fn send_for_item(&self, id: impl Into<String>, command: Command) -> SendOutcome {
        self.dispatch(command, Some(id.into())).await
    }

    async fn dispatch(&self, command: Command, target: Option<String>) -> SendOutcome {
        let (reply, rx) = oneshot::channel();
        let msg = Control::Send {
            command,
            target,
            reply,
        };
        if self.control.send(msg).await.is_err() {
            return SendOutcome::Dropped(DropReason::NotConnected);
        }
        rx.await
            .unwrap_or(SendOutcome::Dropped(DropReason::NotConnected))
    }

    pub fn snapshot(&self) -> Vec<QueueItem> {
        self.queue_rx.borrow().clone()
    }

    pub fn queue_updates(&self) -> watch::Receiver<Vec<QueueItem>> {
        self.queue_rx.clone()
    }

    pub fn connection_state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    pub fn state_updates(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }

    /// Stops the connection and waits for the supervisor and notifier tasks to exit.
    pub async fn shutdown(self) {
        let Self {
            control,
            task,
            notifier_task,
            ..
        } = self;
        drop(control);
        let _ = task.await;
        if let Some(handle) = notifier_task {
            let _ = handle.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::RecordingNotifier;
    use crate::transport::channel::{ChannelConnector, ServerEnd};
    use appeals_core::wire::tags;
    use appeals_core::Cue;
    use serde_json::json;
    use std::sync::atomic::Ordering;
    use std::time::Duration;
    use tokio::time::{timeout, Instant};
    use url::Url;

    struct Harness {
        client: StreamClient,
        connector: ChannelConnector,
        accepted: mpsc::UnboundedReceiver<ServerEnd>,
        recorder: RecordingNotifier,
        config: StreamConfig,
    }

    impl Harness {
        fn new() -> Self {
            let config = StreamConfig::new(Url::parse("ws://appeals.test/ws").expect("url"));
            let (connector, accepted) = ChannelConnector::new();
            let recorder = RecordingNotifier::new();
            let (cues, _) = spawn_notifier(recorder.clone());
            let client = StreamClient::spawn(config.clone(), connector.clone(), cues);
            Self {
                client,
                connector,
                accepted,
                recorder,
                config,
            }
        }

        async fn accept(&mut self) -> ServerEnd {
            timeout(Duration::from_secs(60), self.accepted.recv())
                .await
                .expect("no connection attempt")
                .expect("connector dropped")
        }

        /// Start, accept the first connection and consume its snapshot request.
        async fn open(&mut self) -> ServerEnd {
            self.client.start().await;
            let mut server = self.accept().await;
            assert_eq!(server.next_event().await.as_deref(), Some(tags::ALL_APPEALS));
            server
        }

        async fn wait_state(&self, state: ConnectionState) {
            let mut rx = self.client.state_updates();
            timeout(Duration::from_secs(60), rx.wait_for(|current| *current == state))
                .await
                .expect("state timeout")
                .expect("supervisor gone");
        }

        async fn wait_queue_len(&self, len: usize) {
            let mut rx = self.client.queue_updates();
            timeout(Duration::from_secs(60), rx.wait_for(|items| items.len() == len))
                .await
                .expect("queue timeout")
                .expect("supervisor gone");
        }
    }

    fn snapshot_frame(ids: &[&str]) -> serde_json::Value {
        let items: Vec<_> = ids.iter().map(|id| json!({"id": id})).collect();
        json!({"event": tags::ALL_APPEALS, "data": items})
    }

    fn assert_close(elapsed: Duration, expected: Duration) {
        assert!(
            elapsed >= expected && elapsed <= expected + Duration::from_millis(5),
            "elapsed {elapsed:?}, expected {expected:?}"
        );
    }

    fn pong() -> serde_json::Value {
        json!({"event": tags::PONG})
    }

    #[tokio::test(start_paused = true)]
    async fn start_opens_and_requests_snapshot() {
        let mut h = Harness::new();
        assert_eq!(h.client.connection_state(), ConnectionState::Disconnected);
        let server = h.open().await;
        assert_eq!(h.client.connection_state(), ConnectionState::Open);

        server.push_json(snapshot_frame(&["a1", "a2"]));
        h.wait_queue_len(2).await;
        let ids: Vec<_> = h.client.snapshot().into_iter().map(|item| item.id).collect();
        assert_eq!(ids, ["a1", "a2"]);
    }

    #[tokio::test(start_paused = true)]
    async fn start_is_idempotent_while_open() {
        let mut h = Harness::new();
        let mut server = h.open().await;
        h.client.start().await;
        h.client.start().await;
        assert!(timeout(Duration::from_secs(1), h.accepted.recv()).await.is_err());
        assert_eq!(h.connector.attempts(), 1);
        server.push_json(pong());
        assert!(timeout(Duration::from_secs(1), server.next_event()).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn reconnects_within_one_retry_delay_with_single_heartbeat() {
        let mut h = Harness::new();
        let mut server = h.open().await;

        for _ in 0..3 {
            drop(server);
            let closed_at = Instant::now();
            server = h.accept().await;
            assert!(Instant::now() - closed_at <= h.config.retry_delay + Duration::from_millis(5));
            assert_eq!(server.next_event().await.as_deref(), Some(tags::ALL_APPEALS));
        }
        assert_eq!(h.connector.attempts(), 4);
        assert_eq!(h.client.connection_state(), ConnectionState::Open);

        let opened_at = Instant::now();
        assert_eq!(server.next_event().await.as_deref(), Some(tags::PING));
        assert_close(Instant::now() - opened_at, h.config.heartbeat_interval);
        server.push_json(pong());
        let quiet = h.config.heartbeat_interval - Duration::from_millis(1);
        assert!(timeout(quiet, server.next_event()).await.is_err());
        assert_eq!(server.next_event().await.as_deref(), Some(tags::PING));
    }

    #[tokio::test(start_paused = true)]
    async fn transport_error_takes_the_same_recovery_path() {
        let mut h = Harness::new();
        let server = h.open().await;
        server.fail(crate::transport::TransportError::Closed);
        h.wait_state(ConnectionState::Disconnected).await;
        let mut server = h.accept().await;
        assert_eq!(server.next_event().await.as_deref(), Some(tags::ALL_APPEALS));
    }

    #[tokio::test(start_paused = true)]
    async fn refused_connects_retry_until_the_server_is_back() {
        let mut h = Harness::new();
        h.connector.refuse.store(true, Ordering::SeqCst);
        h.client.start().await;
        tokio::time::sleep(h.config.retry_delay * 3 + Duration::from_millis(10)).await;
        assert_eq!(h.connector.attempts(), 4);
        assert_eq!(h.client.connection_state(), ConnectionState::Disconnected);

        h.connector.refuse.store(false, Ordering::SeqCst);
        let mut server = h.accept().await;
        assert_eq!(server.next_event().await.as_deref(), Some(tags::ALL_APPEALS));
        assert_eq!(h.connector.attempts(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn missed_heartbeat_forces_exactly_one_close() {
        let mut h = Harness::new();
        let mut server = h.open().await;

        assert_eq!(server.next_event().await.as_deref(), Some(tags::PING));
        let probed_at = Instant::now();
        assert_eq!(server.next_event().await, None);
        assert_close(Instant::now() - probed_at, h.config.liveness_deadline);

        let mut server = h.accept().await;
        assert_eq!(server.next_event().await.as_deref(), Some(tags::ALL_APPEALS));
        for _ in 0..3 {
            assert_eq!(server.next_event().await.as_deref(), Some(tags::PING));
            server.push_json(pong());
            server.push_json(pong());
        }
        assert_eq!(h.connector.attempts(), 2);
        assert_eq!(h.client.connection_state(), ConnectionState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_cancels_timers_and_clears_queue() {
        let mut h = Harness::new();
        let mut server = h.open().await;
        server.push_json(snapshot_frame(&["a1"]));
        h.wait_queue_len(1).await;

        h.client.stop().await;
        assert_eq!(server.next_event().await, None);
        h.wait_state(ConnectionState::Disconnected).await;
        h.wait_queue_len(0).await;

        tokio::time::sleep(h.config.heartbeat_interval + h.config.retry_delay * 2).await;
        assert_eq!(h.connector.attempts(), 1);
        assert!(h.accepted.try_recv().is_err());
        assert_eq!(h.client.connection_state(), ConnectionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_during_retry_wait_cancels_the_retry() {
        let mut h = Harness::new();
        let server = h.open().await;
        drop(server);
        h.wait_state(ConnectionState::Disconnected).await;
        h.client.stop().await;

        tokio::time::sleep(h.config.retry_delay * 3).await;
        assert_eq!(h.connector.attempts(), 1);
        assert!(h.accepted.try_recv().is_err());

        h.client.start().await;
        let mut server = h.accept().await;
        assert_eq!(server.next_event().await.as_deref(), Some(tags::ALL_APPEALS));
    }

    #[tokio::test(start_paused = true)]
    async fn commands_while_disconnected_are_dropped_untouched() {
        let mut h = Harness::new();
        assert_eq!(
            h.client.send(Command::new(tags::TAKE_APPEAL)).await,
            SendOutcome::Dropped(DropReason::NotConnected)
        );

        let server = h.open().await;
        server.push_json(snapshot_frame(&["a1"]));
        h.wait_queue_len(1).await;

        h.connector.refuse.store(true, Ordering::SeqCst);
        drop(server);
        h.wait_state(ConnectionState::Disconnected).await;
        let before = h.client.snapshot();
        assert_eq!(
            h.client
                .send_for_item("a1", Command::new(tags::TAKE_APPEAL))
                .await,
            SendOutcome::Dropped(DropReason::NotConnected)
        );
        assert_eq!(h.client.snapshot(), before);
        assert!(!before[0].action_in_flight);

        h.connector.refuse.store(false, Ordering::SeqCst);
        let mut server = h.accept().await;
        assert_eq!(server.next_event().await.as_deref(), Some(tags::ALL_APPEALS));
        server.push_json(pong());
        assert!(timeout(Duration::from_secs(5), server.next_event()).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn item_action_is_guarded_until_next_snapshot() {
        let mut h = Harness::new();
        let mut server = h.open().await;
        server.push_json(json!({
            "event": tags::ALL_APPEALS,
            "data": [{"id": "a1", "chat": {"id": "c1"}}, {"id": "a2"}]
        }));
        h.wait_queue_len(2).await;

        let take = || Command::new(tags::TAKE_APPEAL).with_data(json!({"operator": "op-7"}));
        assert_eq!(h.client.send_for_item("a1", take()).await, SendOutcome::Sent);
        let sent = server.recv().await.expect("command");
        assert_eq!(
            sent,
            json!({
                "event": tags::TAKE_APPEAL,
                "data": {"operator": "op-7", "appealId": "a1", "chat": {"id": "c1"}}
            })
        );
        assert!(h.client.snapshot()[0].action_in_flight);
        assert!(!h.client.snapshot()[1].action_in_flight);

        assert_eq!(
            h.client.send_for_item("a1", take()).await,
            SendOutcome::Dropped(DropReason::ActionInFlight)
        );
        assert_eq!(
            h.client.send_for_item("zz", take()).await,
            SendOutcome::Dropped(DropReason::UnknownItem)
        );

        server.push_json(snapshot_frame(&["a1", "a2"]));
        let mut rx = h.client.queue_updates();
        timeout(
            Duration::from_secs(1),
            rx.wait_for(|items| items.iter().all(|item| !item.action_in_flight)),
        )
        .await
        .expect("snapshot applied")
        .expect("supervisor gone");
        assert_eq!(h.client.send_for_item("a1", take()).await, SendOutcome::Sent);
        assert_eq!(server.next_event().await.as_deref(), Some(tags::TAKE_APPEAL));
    }

    #[tokio::test(start_paused = true)]
    async fn plain_send_is_stateless() {
        let mut h = Harness::new();
        let mut server = h.open().await;
        server.push_json(snapshot_frame(&["a1"]));
        h.wait_queue_len(1).await;

        let note = Command::new("Note").with_data(json!({"appealId": "a1", "text": "hi"}));
        assert_eq!(h.client.send(note.clone()).await, SendOutcome::Sent);
        assert_eq!(h.client.send(note).await, SendOutcome::Sent);
        assert_eq!(server.next_event().await.as_deref(), Some("Note"));
        assert_eq!(server.next_event().await.as_deref(), Some("Note"));
        assert!(!h.client.snapshot()[0].action_in_flight);
    }

    #[tokio::test(start_paused = true)]
    async fn frames_apply_in_order_and_fire_cues_once() {
        let mut h = Harness::new();
        let server = h.open().await;
        server.push_json(snapshot_frame(&["a1", "a2", "a3"]));
        server.push("this is not json");
        server.push_json(json!({"event": "OperatorTyping", "data": {"id": "a1"}}));
        server.push_json(json!({"event": tags::NEW_APPEAL, "data": {"id": "n1"}}));
        server.push_json(json!({"event": tags::APPEAL_REMOVED, "data": {"id": "a2"}}));
        server.push_json(json!({"event": tags::NEW_APPEAL, "data": {"id": "gone"}}));
        server.push_json(json!({"event": tags::APPEAL_REMOVED, "data": "gone"}));
        server.push_json(json!({
            "event": tags::APPEAL_UPDATED,
            "data": {"id": "a3", "lastMessage": {"text": "still waiting"}}
        }));
        server.push_json(json!({"event": tags::APPEALS_BROADCAST, "data": []}));

        let mut rx = h.client.queue_updates();
        timeout(
            Duration::from_secs(1),
            rx.wait_for(|items| {
                items
                    .iter()
                    .any(|item| item.id == "a3" && item.last_message.is_some())
            }),
        )
        .await
        .expect("update applied")
        .expect("supervisor gone");

        let ids: Vec<_> = h.client.snapshot().into_iter().map(|item| item.id).collect();
        assert_eq!(ids, ["n1", "a1", "a3"]);
        assert_eq!(h.client.connection_state(), ConnectionState::Open);

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(
            h.recorder.played(),
            vec![Cue::NewItem, Cue::NewItem, Cue::MessageReceived]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn burst_of_inserts_plays_every_cue() {
        let mut h = Harness::new();
        let server = h.open().await;
        for n in 0..40 {
            server.push_json(json!({"event": tags::NEW_APPEAL, "data": {"id": format!("n{n}")}}));
        }
        h.wait_queue_len(40).await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(h.recorder.played(), vec![Cue::NewItem; 40]);
    }

    #[tokio::test(start_paused = true)]
    async fn unanswered_ping_closes_even_when_deadline_outlasts_interval() {
        let mut config = StreamConfig::new(Url::parse("ws://appeals.test/ws").expect("url"));
        config.heartbeat_interval = Duration::from_secs(1);
        config.liveness_deadline = Duration::from_secs(2);
        let (connector, mut accepted) = ChannelConnector::new();
        let client = StreamClient::spawn(config, connector.clone(), CueSender::disabled());
        client.start().await;

        let mut server = accepted.recv().await.expect("connect");
        assert_eq!(server.next_event().await.as_deref(), Some(tags::ALL_APPEALS));
        let opened_at = Instant::now();
        assert_eq!(server.next_event().await.as_deref(), Some(tags::PING));
        assert_eq!(server.next_event().await, None);
        assert_close(Instant::now() - opened_at, Duration::from_secs(2));

        let mut server = timeout(Duration::from_secs(60), accepted.recv())
            .await
            .expect("no retry")
            .expect("connector dropped");
        assert_eq!(server.next_event().await.as_deref(), Some(tags::ALL_APPEALS));
        assert_eq!(connector.attempts(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_handshake_times_out_and_retries() {
        let mut h = Harness::new();
        h.connector.stall.store(true, Ordering::SeqCst);
        h.client.start().await;
        h.wait_state(ConnectionState::Connecting).await;

        let started = Instant::now();
        h.wait_state(ConnectionState::Disconnected).await;
        assert_close(Instant::now() - started, h.config.connect_timeout);
        assert_eq!(h.connector.attempts(), 1);

        h.connector.stall.store(false, Ordering::SeqCst);
        let mut server = h.accept().await;
        assert_close(
            Instant::now() - started,
            h.config.connect_timeout + h.config.retry_delay,
        );
        assert_eq!(server.next_event().await.as_deref(), Some(tags::ALL_APPEALS));
        assert_eq!(h.connector.attempts(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_closes_connection_and_joins() {
        let mut h = Harness::new();
        let mut server = h.open().await;
        let Harness { client, .. } = h;
        timeout(Duration::from_secs(5), client.shutdown())
            .await
            .expect("shutdown");
        assert_eq!(server.next_event().await, None);
    }
}
