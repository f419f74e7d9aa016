use std::io::{BufRead, Write};
use std::sync::mpsc;
use std::time::Duration;

use talkback_core::types::Message;
use talkback_engine::{ControlError, Observation, Observer, WakeUp};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsoleCommand {
    Start,
    Stop,
    Refresh,
    Clear,
    Status,
    Help,
    Quit,
}

pub const HELP: &str = "commands: start, stop, refresh, clear, status, help, quit";

impl ConsoleCommand {
    pub fn parse(line: &str) -> Result<Option<Self>, String> {
        let word = line.trim().to_ascii_lowercase();
        let cmd = match word.as_str() {
            "" => return Ok(None),
            "start" | "s" => ConsoleCommand::Start,
            "stop" | "x" => ConsoleCommand::Stop,
            "refresh" | "r" => ConsoleCommand::Refresh,
            "clear" | "c" => ConsoleCommand::Clear,
            "status" => ConsoleCommand::Status,
            "help" | "?" => ConsoleCommand::Help,
            "quit" | "exit" | "q" => ConsoleCommand::Quit,
            other => return Err(format!("unknown command: {other} ({HELP})")),
        };
        Ok(Some(cmd))
    }
}

pub enum Input {
    Command(ConsoleCommand),
    Invalid(String),
}

/// Reads commands from `reader` on a background thread. End of input is reported as `quit`.
pub fn spawn_reader<R>(reader: R) -> std::io::Result<mpsc::Receiver<Input>>
where
    R: BufRead + Send + 'static,
{
    let (tx, rx) = mpsc::channel();
    std::thread::Builder::new()
        .name("stdin-reader".into())
        .spawn(move || {
            for line in reader.lines() {
                let Ok(line) = line else { break };
                let input = match ConsoleCommand::parse(&line) {
                    Ok(Some(cmd)) => Input::Command(cmd),
                    Ok(None) => continue,
                    Err(e) => Input::Invalid(e),
                };
                if tx.send(input).is_err() {
                    return;
                }
            }
            let _ = tx.send(Input::Command(ConsoleCommand::Quit));
        })?;
    Ok(rx)
}

pub fn format_message(m: &Message) -> String {
    format!("[{}] {}", m.role.display_tag(), m.text)
}

pub fn status_line(running: bool) -> &'static str {
    if running {
        "● LIVE: conversation in progress (type `stop` to end)"
    } else {
        "○ Ready: type `start` to talk to the agent"
    }
}

/// Terminal front end: prints transcript updates and forwards commands to the controller.
pub struct Console<W: Write> {
    observer: Observer,
    out: W,
    stop_timeout: Duration,
    last_running: Option<bool>,
}

impl<W: Write> Console<W> {
    pub fn new(observer: Observer, out: W, stop_timeout: Duration) -> Self {
        Self {
            observer,
            out,
            stop_timeout,
            last_running: None,
        }
    }

    pub fn observer(&self) -> &Observer {
        &self.observer
    }

    #[cfg(test)]
    pub fn into_output(self) -> W {
        self.out
    }

    /// One refresh: print what arrived and report when to look again.
    pub fn refresh(&mut self) -> std::io::Result<WakeUp> {
        let Observation {
            new_messages,
            state,
            running,
            wakeup,
        } = self.observer.observe();

        for m in &new_messages {
            writeln!(self.out, "{}", format_message(m))?;
        }
        if self.last_running != Some(running) {
            log::debug!("session state: {}", state.label());
            writeln!(self.out, "{}", status_line(running))?;
            self.last_running = Some(running);
        }
        self.out.flush()?;
        Ok(wakeup)
    }

    /// Returns `false` once the console should exit.
    pub fn handle(&mut self, cmd: ConsoleCommand) -> std::io::Result<bool> {
        let controller = self.observer.controller().clone();
        match cmd {
            ConsoleCommand::Start => match controller.start() {
                Ok(()) => {}
                Err(ControlError::AlreadyRunning) => {
                    writeln!(self.out, "warning: a conversation is already running")?;
                }
                Err(e) => writeln!(self.out, "error: {e}")?,
            },
            ConsoleCommand::Stop => self.stop(&controller)?,
            ConsoleCommand::Refresh => {}
            ConsoleCommand::Clear => {
                self.observer.clear();
                writeln!(self.out, "transcript cleared")?;
            }
            ConsoleCommand::Status => {
                let state = controller.state();
                writeln!(
                    self.out,
                    "state: {} | agent: {} | auth: {} | transcript: {} messages",
                    state.label(),
                    controller.settings().agent_id,
                    if controller.settings().requires_auth() { "api key" } else { "public" },
                    self.observer.transcript().len(),
                )?;
            }
            ConsoleCommand::Help => writeln!(self.out, "{HELP}")?,
            ConsoleCommand::Quit => {
                if controller.is_running() {
                    self.stop(&controller)?;
                }
                self.refresh()?;
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn stop(&mut self, controller: &talkback_engine::SessionController) -> std::io::Result<()> {
        match controller.stop(self.stop_timeout) {
            Ok(()) => Ok(()),
            Err(ControlError::StillRunning) => writeln!(
                self.out,
                "warning: the conversation did not finish within {} ms; it will end in the background",
                self.stop_timeout.as_millis()
            ),
            Err(e) => writeln!(self.out, "error: {e}"),
        }
    }

    /// Drives the console until `quit` or end of input.
    pub fn run(&mut self, input: mpsc::Receiver<Input>) -> std::io::Result<()> {
        writeln!(self.out, "{HELP}")?;
        loop {
            let wakeup = self.refresh()?;

            let next = match wakeup {
                WakeUp::After(delay) => match input.recv_timeout(delay) {
                    Ok(i) => Some(i),
                    Err(mpsc::RecvTimeoutError::Timeout) => None,
                    Err(mpsc::RecvTimeoutError::Disconnected) => {
                        Some(Input::Command(ConsoleCommand::Quit))
                    }
                },
                // Nothing is running or pending; only the user can change that.
                WakeUp::Idle => Some(
                    input
                        .recv()
                        .unwrap_or(Input::Command(ConsoleCommand::Quit)),
                ),
            };

            match next {
                None => {}
                Some(Input::Invalid(msg)) => writeln!(self.out, "{msg}")?,
                Some(Input::Command(cmd)) => {
                    if !self.handle(cmd)? {
                        return Ok(());
                    }
                }
            }
        }
    }
}
