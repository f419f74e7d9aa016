use talkback_core::types::{Message, SessionState};

use crate::controller::SessionController;
use crate::scheduler::{PollingScheduler, WakeUp};

/// Visible conversation history. Append-only until explicitly cleared.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Transcript {
    messages: Vec<Message>,
}

impl Transcript {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn extend(&mut self, messages: impl IntoIterator<Item = Message>) {
        self.messages.extend(messages);
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn clear(&mut self) {
        self.messages.clear();
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Observation {
    pub new_messages: Vec<Message>,
    pub state: SessionState,
    pub running: bool,
    pub wakeup: WakeUp,
}

/// The observer side of the bridge: one call to `observe` is one refresh of a polling
/// front end.
pub struct Observer {
    controller: SessionController,
    scheduler: PollingScheduler,
    transcript: Transcript,
}

impl Observer {
    pub fn new(controller: SessionController, scheduler: PollingScheduler) -> Self {
        Self {
            controller,
            scheduler,
            transcript: Transcript::new(),
        }
    }

    pub fn controller(&self) -> &SessionController {
        &self.controller
    }

    pub fn transcript(&self) -> &Transcript {
        &self.transcript
    }

    pub fn observe(&mut self) -> Observation {
        // State before drain: the drained messages may run ahead of the state we report,
        // never behind it.
        let state = self.controller.state();
        let relay = self.controller.relay();

        let new_messages = relay.drain_all();
        self.transcript.extend(new_messages.iter().cloned());

        let pending = relay.len();
        Observation {
            new_messages,
            state,
            running: state.is_running(),
            wakeup: self.scheduler.next_wakeup(state, pending),
        }
    }

    /// Empties the transcript and throws away anything still queued.
    pub fn clear(&mut self) -> usize {
        self.transcript.clear();
        let dropped = self.controller.relay().discard_all();
        log::info!("transcript cleared ({dropped} queued messages dropped)");
        dropped
    }
}
