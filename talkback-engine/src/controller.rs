use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use talkback_core::types::{Role, SessionState};
use thiserror::Error;

use crate::relay::MessageRelay;
use crate::signal::StopSignal;
use crate::traits::{SessionCallbacks, SessionFactory, SessionSettings, StreamingSession};

pub const MSG_STARTING: &str = "Starting conversation... please wait for confirmation.";
pub const MSG_ACTIVE: &str = "Conversation active! You can now speak into your microphone.";
pub const MSG_ENDING: &str = "Ending conversation...";
pub const MSG_REMOTE_CLOSED: &str = "The agent closed the conversation.";
pub const CORRECTION_PREFIX: &str = "[corrected] ";

const WORKER_THREAD_NAME: &str = "conversation-worker";

#[derive(Debug, Error)]
pub enum ControlError {
    #[error("a conversation is already running")]
    AlreadyRunning,

    #[error("conversation worker still running after stop timeout")]
    StillRunning,

    #[error("failed to spawn conversation worker: {0}")]
    Spawn(#[from] std::io::Error),
}

// State, session handle and worker handle change together, under one lock.
#[derive(Default)]
struct SessionSlot {
    state: SessionState,
    session: Option<Arc<dyn StreamingSession>>,
    worker: Option<JoinHandle<()>>,
    stop: Option<StopSignal>,
    generation: u64,
}

impl SessionSlot {
    fn transition(&mut self, next: SessionState) {
        let prev = self.state;
        self.state = next;
        if prev != next {
            log::info!("session state: {:?} -> {:?}", prev, next);
        }
    }
}

#[derive(Default)]
struct SessionShared {
    slot: Mutex<SessionSlot>,
    // Signalled whenever a worker finishes its cleanup.
    finished: Condvar,
}

impl SessionShared {
    fn lock(&self) -> MutexGuard<'_, SessionSlot> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Owns the single conversation worker and the session state it drives.
#[derive(Clone)]
pub struct SessionController {
    shared: Arc<SessionShared>,
    relay: MessageRelay,
    factory: Arc<dyn SessionFactory>,
    settings: SessionSettings,
    poll_interval: Duration,
}

impl SessionController {
    pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

    pub fn new(
        factory: Arc<dyn SessionFactory>,
        settings: SessionSettings,
        relay: MessageRelay,
    ) -> Self {
        Self {
            shared: Arc::new(SessionShared::default()),
            relay,
            factory,
            settings,
            poll_interval: Self::DEFAULT_POLL_INTERVAL,
        }
    }

    /// How often the worker rechecks the stop signal while the session is live.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval.max(Duration::from_millis(1));
        self
    }

    pub fn relay(&self) -> &MessageRelay {
        &self.relay
    }

    pub fn settings(&self) -> &SessionSettings {
        &self.settings
    }

    pub fn state(&self) -> SessionState {
        self.shared.lock().state
    }

    pub fn is_running(&self) -> bool {
        self.state().is_running()
    }

    pub fn has_worker(&self) -> bool {
        self.shared.lock().worker.is_some()
    }

    pub fn has_session(&self) -> bool {
        self.shared.lock().session.is_some()
    }

    /// Spawns the conversation worker. Returns as soon as the worker exists; it does not
    /// wait for the remote session to connect.
    pub fn start(&self) -> Result<(), ControlError> {
        let mut slot = self.shared.lock();
        if !slot.state.can_start() {
            log::warn!("start ignored: session is {}", slot.state.label());
            return Err(ControlError::AlreadyRunning);
        }

        let stop = StopSignal::new();
        slot.generation = slot.generation.wrapping_add(1);
        let ctx = WorkerContext {
            generation: slot.generation,
            shared: self.shared.clone(),
            relay: self.relay.clone(),
            factory: self.factory.clone(),
            settings: self.settings.clone(),
            stop: stop.clone(),
            poll_interval: self.poll_interval,
        };

        // The worker can't touch the slot until we release the lock below.
        let worker = thread::Builder::new()
            .name(WORKER_THREAD_NAME.into())
            .spawn(move || run_worker(ctx))
            .map_err(|e| {
                log::error!("spawn conversation worker failed: {e}");
                ControlError::Spawn(e)
            })?;

        slot.transition(SessionState::Starting);
        slot.stop = Some(stop);
        slot.worker = Some(worker);
        Ok(())
    }

    /// Asks the worker to end the session and waits up to `join_timeout` for it to exit.
    ///
    /// On timeout the worker keeps running detached; `start()` stays refused until it
    /// has cleaned up.
    pub fn stop(&self, join_timeout: Duration) -> Result<(), ControlError> {
        let mut slot = self.shared.lock();
        if !matches!(slot.state, SessionState::Starting | SessionState::Active) {
            return Ok(());
        }

        if let Some(stop) = slot.stop.as_ref() {
            stop.set();
        }
        slot.transition(SessionState::Stopping);

        let generation = slot.generation;
        let (slot, _) = self
            .shared
            .finished
            .wait_timeout_while(slot, join_timeout, |s| {
                s.generation == generation && s.worker.is_some()
            })
            .unwrap_or_else(PoisonError::into_inner);

        if slot.generation == generation && slot.worker.is_some() {
            log::warn!(
                "conversation worker did not exit within {}ms",
                join_timeout.as_millis()
            );
            return Err(ControlError::StillRunning);
        }
        Ok(())
    }

    /// Blocks until no worker is alive or the timeout elapses. Returns true when idle.
    pub fn wait_until_idle(&self, timeout: Duration) -> bool {
        let slot = self.shared.lock();
        let (slot, _) = self
            .shared
            .finished
            .wait_timeout_while(slot, timeout, |s| s.worker.is_some())
            .unwrap_or_else(PoisonError::into_inner);
        slot.worker.is_none()
    }
}

struct WorkerContext {
    generation: u64,
    shared: Arc<SessionShared>,
    relay: MessageRelay,
    factory: Arc<dyn SessionFactory>,
    settings: SessionSettings,
    stop: StopSignal,
    poll_interval: Duration,
}

impl WorkerContext {
    fn attach_session(&self, session: Arc<dyn StreamingSession>) {
        let mut slot = self.shared.lock();
        if slot.generation == self.generation {
            slot.session = Some(session);
        }
    }

    fn mark_active(&self) {
        let mut slot = self.shared.lock();
        // A stop that raced the connect keeps the state at Stopping.
        if slot.generation == self.generation && slot.state == SessionState::Starting {
            slot.transition(SessionState::Active);
        }
    }

    /// Returns true if the remote side closed the session before we were asked to stop.
    fn wait_for_stop(&self, session: &dyn StreamingSession) -> bool {
        loop {
            if self.stop.is_set() {
                return false;
            }
            if session.has_ended() {
                return true;
            }
            thread::sleep(self.poll_interval);
        }
    }
}

// Resets the shared slot exactly once, on every exit route of the worker.
struct WorkerCleanup {
    shared: Arc<SessionShared>,
    generation: u64,
    outcome: SessionState,
}

impl Drop for WorkerCleanup {
    fn drop(&mut self) {
        {
            let mut slot = self.shared.lock();
            if slot.generation == self.generation {
                slot.session = None;
                slot.stop = None;
                // Dropping our own handle detaches this thread; it is about to return.
                slot.worker = None;
                slot.transition(self.outcome);
            }
        }
        self.shared.finished.notify_all();
    }
}

fn run_worker(ctx: WorkerContext) {
    let mut cleanup = WorkerCleanup {
        shared: ctx.shared.clone(),
        generation: ctx.generation,
        outcome: SessionState::Failed,
    };

    let result = panic::catch_unwind(AssertUnwindSafe(|| drive_session(&ctx)));
    cleanup.outcome = match result {
        Ok(Ok(conversation_id)) => {
            log::info!("conversation ended: {conversation_id}");
            SessionState::Ended
        }
        Ok(Err(e)) => {
            log::error!("conversation error: {e:#}");
            ctx.relay
                .push(Role::Error, format!("Conversation error: {e:#}"));
            SessionState::Failed
        }
        Err(payload) => {
            let reason = panic_message(payload.as_ref());
            log::error!("conversation worker panicked: {reason}");
            ctx.relay
                .push(Role::Error, format!("Conversation error: {reason}"));
            SessionState::Failed
        }
    };
}

fn drive_session(ctx: &WorkerContext) -> anyhow::Result<String> {
    let session = ctx
        .factory
        .create(&ctx.settings, relay_callbacks(&ctx.relay))?;
    ctx.attach_session(session.clone());

    ctx.relay.push(Role::System, MSG_STARTING);
    session.start_session()?;

    // Message first, then state: the observer must never see Active before "active".
    ctx.relay.push(Role::System, MSG_ACTIVE);
    ctx.mark_active();

    if ctx.wait_for_stop(session.as_ref()) {
        ctx.relay.push(Role::System, MSG_REMOTE_CLOSED);
    } else {
        log::info!("stop requested, ending conversation");
        ctx.relay.push(Role::System, MSG_ENDING);
        session.end_session();
    }

    let conversation_id = session.wait_for_session_end()?;
    ctx.relay.push(
        Role::System,
        format!("Conversation ended (id={conversation_id})"),
    );
    Ok(conversation_id)
}

fn relay_callbacks(relay: &MessageRelay) -> SessionCallbacks {
    let user = relay.clone();
    let agent = relay.clone();
    let correction = relay.clone();

    SessionCallbacks {
        on_user_transcript: Box::new(move |text| {
            log::info!("[user] {text}");
            user.push(Role::User, text);
        }),
        on_agent_response: Box::new(move |text| {
            log::info!("[agent] {text}");
            agent.push(Role::Agent, text);
        }),
        on_agent_response_correction: Box::new(move |_original, corrected| {
            log::info!("[correction] {corrected}");
            correction.push(Role::Agent, format!("{CORRECTION_PREFIX}{corrected}"));
        }),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "worker panicked".into()
    }
}
