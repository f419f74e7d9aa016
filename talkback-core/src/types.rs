use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Agent,
    System,
    Error,
}

impl Role {
    /// Stable label for logs and serialized output.
    pub fn label(self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Agent => "agent",
            Role::System => "system",
            Role::Error => "error",
        }
    }

    /// Tag shown next to a transcript entry.
    pub fn display_tag(self) -> &'static str {
        match self {
            Role::User => "User",
            Role::Agent => "Agent",
            Role::System => "System",
            Role::Error => "Error",
        }
    }
}

/// One transcript entry.
///
/// `sequence` is assigned by the relay when the message is accepted and strictly
/// increases in emission order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub text: String,
    pub sequence: u64,
}

impl Message {
    pub fn new(role: Role, text: impl Into<String>, sequence: u64) -> Self {
        Self {
            role,
            text: text.into(),
            sequence,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    #[default]
    Idle,
    Starting,
    Active,
    Stopping,
    Ended,
    Failed,
}

impl SessionState {
    /// A worker exists for this session.
    pub fn is_running(self) -> bool {
        matches!(
            self,
            SessionState::Starting | SessionState::Active | SessionState::Stopping
        )
    }

    /// `Ended`/`Failed` count as idle for the single-session guard.
    pub fn can_start(self) -> bool {
        !self.is_running()
    }

    pub fn label(self) -> &'static str {
        match self {
            SessionState::Idle => "idle",
            SessionState::Starting => "starting",
            SessionState::Active => "active",
            SessionState::Stopping => "stopping",
            SessionState::Ended => "ended",
            SessionState::Failed => "failed",
        }
    }
}
