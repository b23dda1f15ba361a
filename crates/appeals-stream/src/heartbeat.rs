use std::time::Duration;
use tokio::time::Instant;

/// Liveness probe schedule for one open connection.
///
/// Holds deadlines rather than spawned timers: the supervisor sleeps until
/// whichever instant is armed, so a cancelled schedule can never fire.
#[derive(Debug, Clone)]
pub struct Heartbeat {
    interval: Duration,
    deadline: Duration,
    next_probe_at: Option<Instant>,
    deadline_at: Option<Instant>,
    last_probe_sent_at: Option<Instant>,
    awaiting_reply: bool,
}

impl Heartbeat {
    pub fn new(interval: Duration, deadline: Duration) -> Self {
        Self {
            interval,
            deadline,
            next_probe_at: None,
            deadline_at: None,
            last_probe_sent_at: None,
            awaiting_reply: false,
        }
    }

    pub fn start(&mut self, now: Instant) {
        self.cancel();
        if self.interval.is_zero() {
            return;
        }
        self.next_probe_at = Some(now + self.interval);
    }

    pub fn cancel(&mut self) {
        self.next_probe_at = None;
        self.deadline_at = None;
        self.awaiting_reply = false;
    }

    pub fn probe_sent(&mut self, now: Instant) {
        self.last_probe_sent_at = Some(now);
        self.awaiting_reply = true;
        self.deadline_at = Some(now + self.deadline);
        self.next_probe_at = Some(now + self.interval);
    }

    pub fn reply_received(&mut self) {
        self.awaiting_reply = false;
        self.deadline_at = None;
    }

    /// Disarms the deadline; true when the last probe went unanswered.
    pub fn deadline_elapsed(&mut self) -> bool {
        self.deadline_at = None;
        self.awaiting_reply
    }

    pub fn next_probe_at(&self) -> Option<Instant> {
        self.next_probe_at
    }

    pub fn deadline_at(&self) -> Option<Instant> {
        self.deadline_at
    }

    pub fn last_probe_sent_at(&self) -> Option<Instant> {
        self.last_probe_sent_at
    }

    pub fn awaiting_reply(&self) -> bool {
        self.awaiting_reply
    }

    pub fn is_running(&self) -> bool {
        self.next_probe_at.is_some()
    }
}
