use std::fmt;

/// Side-effect token produced by the queue reducer for the notification channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Cue {
    /// An existing conversation advanced.
    MessageReceived,
    /// A new appeal arrived.
    NewItem,
}

impl Cue {
    pub fn as_str(&self) -> &'static str {
        match self {
            Cue::MessageReceived => "message_received",
            Cue::NewItem => "new_item",
        }
    }
}

impl fmt::Display for Cue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
