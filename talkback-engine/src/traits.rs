use std::sync::Arc;

/// Connection settings handed to the session factory for each new session.
#[derive(Clone, PartialEq, Eq, Default)]
pub struct SessionSettings {
    pub api_key: Option<String>,
    pub agent_id: String,
}

impl SessionSettings {
    pub fn new(agent_id: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            api_key,
            agent_id: agent_id.into(),
        }
    }

    /// A missing credential only turns authentication off; it is not an error here.
    pub fn requires_auth(&self) -> bool {
        self.api_key
            .as_deref()
            .map(|k| !k.trim().is_empty())
            .unwrap_or(false)
    }
}

impl std::fmt::Debug for SessionSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionSettings")
            .field("api_key", &self.api_key.as_ref().map(|_| "[REDACTED]"))
            .field("agent_id", &self.agent_id)
            .finish()
    }
}

pub type TextCallback = Box<dyn Fn(String) + Send + Sync + 'static>;
pub type CorrectionCallback = Box<dyn Fn(String, String) + Send + Sync + 'static>;

/// Event callbacks registered with the external session.
///
/// They fire on the SDK's own threads and must stay cheap.
pub struct SessionCallbacks {
    pub on_user_transcript: TextCallback,
    pub on_agent_response: TextCallback,
    pub on_agent_response_correction: CorrectionCallback,
}

impl SessionCallbacks {
    pub fn noop() -> Self {
        Self {
            on_user_transcript: Box::new(|_| {}),
            on_agent_response: Box::new(|_| {}),
            on_agent_response_correction: Box::new(|_, _| {}),
        }
    }
}

/// One live bidirectional conversation with the remote agent.
pub trait StreamingSession: Send + Sync {
    /// Blocks until the session is connected or has faulted.
    fn start_session(&self) -> anyhow::Result<()>;

    /// Signals a graceful close. Does not block.
    fn end_session(&self);

    /// Blocks until the session is fully closed and returns its conversation id.
    fn wait_for_session_end(&self) -> anyhow::Result<String>;

    /// True once the remote side has closed the session on its own.
    fn has_ended(&self) -> bool {
        false
    }
}

pub trait SessionFactory: Send + Sync {
    fn create(
        &self,
        settings: &SessionSettings,
        callbacks: SessionCallbacks,
    ) -> anyhow::Result<Arc<dyn StreamingSession>>;
}
