use crate::config::StreamConfig;
use crate::heartbeat::Heartbeat;
use crate::notify::CueSender;
use crate::transport::{Connection, Connector, TransportError};
use appeals_core::{decode_inbound, encode_command, Command, InboundFrame, Queue, QueueItem};
use futures_util::future::BoxFuture;
use futures_util::{FutureExt, SinkExt, StreamExt};
use std::fmt;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Open,
    Closing,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Open => "open",
            ConnectionState::Closing => "closing",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    Sent,
    Dropped(DropReason),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DropReason {
    NotConnected,
    UnknownItem,
    ActionInFlight,
    Encode(String),
    TransportFailed,
}

pub(crate) enum Control {
    Start,
    Stop,
    Send {
        command: Command,
        target: Option<String>,
        reply: oneshot::Sender<SendOutcome>,
    },
}

enum Wake {
    Control(Option<Control>),
    Connected(Result<Connection, TransportError>),
    Frame(Option<Result<String, TransportError>>),
    Probe,
    Deadline,
    Retry,
}

/// Single owner of the connection, its timers and the queue. Every mutation
/// happens on the task running [`Supervisor::run`].
pub(crate) struct Supervisor<C> {
    config: StreamConfig,
    connector: C,
    inbox: mpsc::Receiver<Control>,
    state: ConnectionState,
    queue: Queue,
    heartbeat: Heartbeat,
    pending: Option<BoxFuture<'static, Result<Connection, TransportError>>>,
    link: Option<Connection>,
    retry_at: Option<Instant>,
    cues: CueSender,
    queue_tx: watch::Sender<Vec<QueueItem>>,
    state_tx: watch::Sender<ConnectionState>,
    attempt: u64,
}

impl<C: Connector> Supervisor<C> {
    pub(crate) fn new(
        config: StreamConfig,
        connector: C,
        inbox: mpsc::Receiver<Control>,
        cues: CueSender,
        queue_tx: watch::Sender<Vec<QueueItem>>,
        state_tx: watch::Sender<ConnectionState>,
    ) -> Self {
        let heartbeat = Heartbeat::new(config.heartbeat_interval, config.liveness_deadline);
        Self {
            config,
            connector,
            inbox,
            state: ConnectionState::Disconnected,
            queue: Queue::new(),
            heartbeat,
            pending: None,
            link: None,
            retry_at: None,
            cues,
            queue_tx,
            state_tx,
            attempt: 0,
        }
    }

    pub(crate) async fn run(mut self) {
        loop {
            let wake = tokio::select! {
                msg = self.inbox.recv() => Wake::Control(msg),
                result = await_pending(&mut self.pending) => Wake::Connected(result),
                frame = next_frame(&mut self.link) => Wake::Frame(frame),
                _ = sleep_until(self.heartbeat.next_probe_at()) => Wake::Probe,
                _ = sleep_until(self.heartbeat.deadline_at()) => Wake::Deadline,
                _ = sleep_until(self.retry_at) => Wake::Retry,
            };
            match wake {
                Wake::Control(None) => {
                    self.stop().await;
                    break;
                }
                Wake::Control(Some(Control::Start)) => self.start(),
                Wake::Control(Some(Control::Stop)) => self.stop().await,
                Wake::Control(Some(Control::Send {
                    command,
                    target,
                    reply,
                })) => {
                    let outcome = self.send_command(command, target).await;
                    let _ = reply.send(outcome);
                }
                Wake::Connected(result) => {
                    self.pending = None;
                    self.on_connected(result).await;
                }
                Wake::Frame(Some(Ok(text))) => self.on_text(&text),
                Wake::Frame(Some(Err(err))) => {
                    warn!(event = "stream_transport_error", attempt = self.attempt, error = %err);
                    self.connection_lost("transport_error");
                }
                Wake::Frame(None) => self.connection_lost("closed"),
                Wake::Probe => self.probe().await,
                Wake::Deadline => {
                    if self.heartbeat.deadline_elapsed() {
                        warn!(event = "heartbeat_timeout", attempt = self.attempt);
                        self.force_close("heartbeat_timeout").await;
                    }
                }
                Wake::Retry => {
                    self.retry_at = None;
                    self.start();
                }
            }
        }
        debug!(event = "supervisor_exit");
    }

    fn start(&mut self) {
        if self.state != ConnectionState::Disconnected {
            debug!(event = "start_ignored", state = %self.state);
            return;
        }
        self.retry_at = None;
        self.attempt += 1;
        self.set_state(ConnectionState::Connecting);
        info!(event = "stream_connecting", attempt = self.attempt, url = %self.config.url);
        let connect = self.connector.connect();
        let limit = self.config.connect_timeout;
        let connecting = async move {
            match tokio::time::timeout(limit, connect).await {
                Ok(result) => result,
                Err(_) => Err(TransportError::ConnectTimeout(limit)),
            }
        };
        self.pending = Some(connecting.boxed());
    }

    async fn stop(&mut self) {
        self.heartbeat.cancel();
        self.retry_at = None;
        self.pending = None;
        if let Some(mut link) = self.link.take() {
            self.set_state(ConnectionState::Closing);
            let _ = tokio::time::timeout(self.config.write_timeout, link.sink.close()).await;
        }
        self.set_state(ConnectionState::Disconnected);
        self.queue.clear();
        self.publish_queue();
        info!(event = "stream_stopped");
    }

    async fn on_connected(&mut self, result: Result<Connection, TransportError>) {
        match result {
            Ok(link) => {
                self.link = Some(link);
                self.set_state(ConnectionState::Open);
                info!(event = "stream_open", attempt = self.attempt);
                if let Err(err) = self.transmit(&Command::snapshot_request()).await {
                    warn!(event = "snapshot_request_failed", error = %err);
                    self.connection_lost("snapshot_request_failed");
                    return;
                }
                self.heartbeat.start(Instant::now());
            }
            Err(err) => {
                warn!(event = "stream_connect_error", attempt = self.attempt, error = %err);
                self.connection_lost("connect_failed");
            }
        }
    }

    fn on_text(&mut self, text: &str) {
        let frame = match decode_inbound(text, self.config.max_frame_bytes) {
            Ok(frame) => frame,
            Err(err) => {
                warn!(event = "frame_decode_error", error = %err);
                return;
            }
        };
        match frame {
            InboundFrame::LivenessReply => self.heartbeat.reply_received(),
            InboundFrame::Unknown { event: tag } => {
                debug!(event = "frame_unknown", tag = %tag);
            }
            frame => {
                let kind = frame.kind().to_string();
                let cue = self.queue.apply(frame);
                self.publish_queue();
                debug!(event = "frame_applied", tag = %kind, items = self.queue.len());
                if let Some(cue) = cue {
                    self.cues.emit(cue);
                }
            }
        }
    }

    async fn probe(&mut self) {
        if self.link.is_none() {
            self.heartbeat.cancel();
            return;
        }
        if self.heartbeat.awaiting_reply() {
            warn!(event = "heartbeat_timeout", attempt = self.attempt, reason = "probe_unanswered");
            self.force_close("heartbeat_timeout").await;
            return;
        }
        if let Err(err) = self.transmit(&Command::ping()).await {
            warn!(event = "probe_send_failed", error = %err);
            self.connection_lost("probe_send_failed");
            return;
        }
        self.heartbeat.probe_sent(Instant::now());
    }

    async fn send_command(&mut self, command: Command, target: Option<String>) -> SendOutcome {
        if self.state != ConnectionState::Open || self.link.is_none() {
            warn!(
                event = "command_dropped",
                command = %command.event,
                reason = "not_connected",
                state = %self.state
            );
            return SendOutcome::Dropped(DropReason::NotConnected);
        }
        let command = match &target {
            Some(id) => {
                let Some(item) = self.queue.get(id) else {
                    warn!(
                        event = "command_dropped",
                        command = %command.event,
                        appeal_id = %id,
                        reason = "unknown_item"
                    );
                    return SendOutcome::Dropped(DropReason::UnknownItem);
                };
                if item.action_in_flight {
                    debug!(
                        event = "command_dropped",
                        command = %command.event,
                        appeal_id = %id,
                        reason = "action_in_flight"
                    );
                    return SendOutcome::Dropped(DropReason::ActionInFlight);
                }
                command.targeting(item)
            }
            None => command,
        };
        let text = match encode_command(&command, self.config.max_frame_bytes) {
            Ok(text) => text,
            Err(err) => {
                warn!(event = "command_dropped", command = %command.event, error = %err);
                return SendOutcome::Dropped(DropReason::Encode(err.to_string()));
            }
        };
        if let Some(id) = &target {
            if self.queue.begin_action(id).is_ok() {
                self.publish_queue();
            }
        }
        match self.transmit_text(text).await {
            Ok(()) => {
                debug!(event = "command_sent", command = %command.event);
                SendOutcome::Sent
            }
            Err(err) => {
                warn!(event = "command_send_failed", command = %command.event, error = %err);
                self.connection_lost("command_send_failed");
                SendOutcome::Dropped(DropReason::TransportFailed)
            }
        }
    }

    async fn transmit(&mut self, command: &Command) -> Result<(), TransportError> {
        let text = encode_command(command, self.config.max_frame_bytes)?;
        self.transmit_text(text).await
    }

    async fn transmit_text(&mut self, text: String) -> Result<(), TransportError> {
        let link = self.link.as_mut().ok_or(TransportError::Closed)?;
        match tokio::time::timeout(self.config.write_timeout, link.sink.send(text)).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::SendTimeout(self.config.write_timeout)),
        }
    }

    async fn force_close(&mut self, reason: &str) {
        if let Some(mut link) = self.link.take() {
            self.set_state(ConnectionState::Closing);
            let _ = tokio::time::timeout(self.config.write_timeout, link.sink.close()).await;
        }
        self.connection_lost(reason);
    }

    /// The one recovery path: close, error, failed connect, failed send and
    /// heartbeat timeout all end here.
    fn connection_lost(&mut self, reason: &str) {
        self.heartbeat.cancel();
        self.pending = None;
        self.link = None;
        self.set_state(ConnectionState::Disconnected);
        self.retry_at = Some(Instant::now() + self.config.retry_delay);
        warn!(
            event = "stream_disconnected",
            reason,
            attempt = self.attempt,
            retry_in_ms = self.config.retry_delay.as_millis() as u64
        );
    }

    fn set_state(&mut self, state: ConnectionState) {
        if self.state == state {
            return;
        }
        self.state = state;
        self.state_tx.send_replace(state);
    }

    fn publish_queue(&self) {
        self.queue_tx.send_replace(self.queue.items().to_vec());
    }
}

async fn await_pending(
    pending: &mut Option<BoxFuture<'static, Result<Connection, TransportError>>>,
) -> Result<Connection, TransportError> {
    match pending {
        Some(fut) => fut.await,
        None => std::future::pending().await,
    }
}

async fn next_frame(link: &mut Option<Connection>) -> Option<Result<String, TransportError>> {
    match link {
        Some(conn) => conn.stream.next().await,
        None => std::future::pending().await,
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}
