//! Resilient client for the appeals event stream.
//!
//! A single supervisor task owns the connection, the heartbeat and the queue.
//! [`StreamClient`] is the handle UI code holds: it sends control messages in
//! and reads queue and connection snapshots out.

pub mod client;
pub mod config;
pub mod heartbeat;
pub mod notify;
pub mod supervisor;
pub mod transport;

pub use appeals_core::{Command, Cue, QueueItem};
pub use client::StreamClient;
pub use config::{ConfigError, StreamConfig};
pub use notify::{
    spawn_notifier, AudioCues, CommandNotifier, CueSender, Notifier, NotifyError,
    RecordingNotifier, SilentNotifier,
};
pub use supervisor::{ConnectionState, DropReason, SendOutcome};
pub use transport::{Connection, Connector, TransportError, WsConnector};
