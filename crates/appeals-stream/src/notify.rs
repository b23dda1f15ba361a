use appeals_core::Cue;
use std::{
    io,
    path::{Path, PathBuf},
    process::Stdio,
    sync::{Arc, Mutex, PoisonError},
};
use thiserror::Error;
use tokio::{sync::mpsc, task::JoinHandle};
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("no audio resource loaded for cue {0}")]
    MissingResource(Cue),
    #[error("audio player failed to start: {0}")]
    Spawn(#[from] io::Error),
}

/// Plays a cue. Called from the notification task, never from the supervisor.
pub trait Notifier: Send + 'static {
    fn play(&mut self, cue: Cue) -> Result<(), NotifyError>;
}

/// Supervisor side of the notification channel. Unbounded, so emitting never
/// blocks and never loses a cue while the notifier task is alive.
#[derive(Clone, Debug)]
pub struct CueSender {
    tx: Option<mpsc::UnboundedSender<Cue>>,
}

impl CueSender {
    pub fn disabled() -> Self {
        Self { tx: None }
    }

    pub fn emit(&self, cue: Cue) {
        let Some(tx) = &self.tx else {
            return;
        };
        if tx.send(cue).is_err() {
            debug!(event = "cue_dropped", cue = %cue, reason = "notifier_gone");
        }
    }
}

/// Spawns the task that drains cues into `notifier`. Failures are logged and swallowed.
pub fn spawn_notifier<N: Notifier>(mut notifier: N) -> (CueSender, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::unbounded_channel::<Cue>();
    let handle = tokio::spawn(async move {
        while let Some(cue) = rx.recv().await {
            if let Err(err) = notifier.play(cue) {
                debug!(event = "cue_failed", cue = %cue, error = %err);
            }
        }
    });
    (CueSender { tx: Some(tx) }, handle)
}

#[derive(Clone, Copy, Debug, Default)]
pub struct SilentNotifier;

impl Notifier for SilentNotifier {
    fn play(&mut self, _cue: Cue) -> Result<(), NotifyError> {
        Ok(())
    }
}

/// Keeps every cue it is asked to play; clones share the same log.
#[derive(Clone, Debug, Default)]
pub struct RecordingNotifier {
    played: Arc<Mutex<Vec<Cue>>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn played(&self) -> Vec<Cue> {
        self.played
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl Notifier for RecordingNotifier {
    fn play(&mut self, cue: Cue) -> Result<(), NotifyError> {
        self.played
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(cue);
        Ok(())
    }
}

#[derive(Clone, Debug, Default)]
pub struct AudioCues {
    pub message_received: Option<PathBuf>,
    pub new_item: Option<PathBuf>,
}

/// Plays cue files through an external player such as `paplay` or `afplay`.
#[derive(Clone, Debug)]
pub struct CommandNotifier {
    player: String,
    cues: AudioCues,
}

impl CommandNotifier {
    /// Files that are not readable now are dropped here, so a missing sound
    /// surfaces once at startup instead of on every cue.
    pub fn new(player: impl Into<String>, cues: AudioCues) -> Self {
        Self {
            player: player.into(),
            cues: AudioCues {
                message_received: preload(cues.message_received),
                new_item: preload(cues.new_item),
            },
        }
    }

    fn resource(&self, cue: Cue) -> Option<&Path> {
        match cue {
            Cue::MessageReceived => self.cues.message_received.as_deref(),
            Cue::NewItem => self.cues.new_item.as_deref(),
        }
    }
}

fn preload(path: Option<PathBuf>) -> Option<PathBuf> {
    let path = path?;
    match std::fs::metadata(&path) {
        Ok(meta) if meta.is_file() => Some(path),
        Ok(_) => {
            warn!(event = "cue_resource_invalid", path = %path.display());
            None
        }
        Err(err) => {
            warn!(event = "cue_resource_missing", path = %path.display(), error = %err);
            None
        }
    }
}

impl Notifier for CommandNotifier {
    fn play(&mut self, cue: Cue) -> Result<(), NotifyError> {
        let path = self.resource(cue).ok_or(NotifyError::MissingResource(cue))?;
        tokio::process::Command::new(&self.player)
            .arg(path)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()?;
        Ok(())
    }
}
