use std::fmt;

/// A command delivered by the broker, with the topic prefix already stripped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandMessage {
    pub name: String,
    pub payload: String,
}

impl CommandMessage {
    pub fn new(name: impl Into<String>, payload: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            payload: payload.into(),
        }
    }

    pub fn action(&self) -> Action {
        Action::from_payload(&self.payload)
    }
}

/// What the payload of a command message asks for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    Record,
    Replay,
    /// Replay when a signal is stored, learn one otherwise
    AutoRecordOrReplay,
    Unrecognized(String),
}

impl Action {
    /// Matching is exact: no trimming and case-sensitive.
    pub fn from_payload(payload: &str) -> Self {
        match payload {
            "" | "auto" => Action::AutoRecordOrReplay,
            "record" => Action::Record,
            "replay" => Action::Replay,
            other => Action::Unrecognized(other.to_string()),
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::Record => write!(f, "record"),
            Action::Replay => write!(f, "replay"),
            Action::AutoRecordOrReplay => write!(f, "auto"),
            Action::Unrecognized(payload) => write!(f, "unrecognized '{}'", payload),
        }
    }
}
