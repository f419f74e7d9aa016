mod args;
mod repl;

use std::io::{BufRead, IsTerminal};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, anyhow};
use clap::Parser;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use talkback_core::config::AppConfig;
use talkback_engine::{MessageRelay, Observer, PollingScheduler, SessionController};
use talkback_providers::audio::{AudioInterface, NullAudio};
use talkback_runtime::secrets::{SecretKey, SecretStore};
use talkback_runtime::settings::{Overrides, load_dotenv, process_env};
use talkback_runtime::{ConfigStore, ElevenLabsSessionFactory, resolve_settings};

use args::{Cli, Command, ConfigCommand, RunArgs, SecretCommand};
use repl::{Console, spawn_reader};

fn setup_logging() {
    // Logs go to stderr so they don't interleave with the transcript on stdout.
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false),
        )
        .try_init();
}

fn main() -> ExitCode {
    // `.env` may supply RUST_LOG and clap env fallbacks, so it is read first.
    let dotenv = load_dotenv();
    let cli = Cli::parse();
    setup_logging();
    dotenv.log();

    match dispatch(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

fn dispatch(cli: Cli) -> anyhow::Result<()> {
    let store = match &cli.config {
        Some(path) => ConfigStore::at_path(path),
        None => ConfigStore::default_location()?,
    };

    match cli.command {
        None => run(&store, cli.run),
        Some(Command::Run(run_args)) => run(&store, run_args),
        Some(Command::Secret(cmd)) => secret(&store, cmd),
        Some(Command::Config(cmd)) => config(&store, cmd),
    }
}

fn run(store: &ConfigStore, args: RunArgs) -> anyhow::Result<()> {
    let overrides = Overrides {
        api_key: args.api_key.clone(),
        agent_id: args.agent_id.clone(),
        stop_timeout_ms: args.stop_timeout_ms,
    };
    let config = store.load_or_default()?;
    let resolved = resolve_settings(&overrides, process_env, config, &SecretStore::default())?;
    let config = resolved.config;

    let audio = open_audio(&args)?;
    let factory = ElevenLabsSessionFactory::new(config.clone(), audio);
    let controller = SessionController::new(Arc::new(factory), resolved.session, MessageRelay::new())
        .with_poll_interval(config.worker_poll_interval());
    let observer = Observer::new(
        controller,
        PollingScheduler::new(config.live_poll_interval(), config.drain_poll_interval()),
    );

    let input = spawn_reader(std::io::BufReader::new(std::io::stdin())).context("spawn stdin reader")?;
    let mut console = Console::new(observer, std::io::stdout(), config.stop_timeout());
    console.run(input).context("write to terminal")?;

    // A stop that timed out leaves the worker finishing in the background.
    let controller = console.observer().controller();
    if controller.has_worker() && !controller.wait_until_idle(config.stop_timeout()) {
        log::warn!("exiting while the conversation is still shutting down");
    }
    Ok(())
}

#[cfg(feature = "device-audio")]
fn open_audio(args: &RunArgs) -> anyhow::Result<Arc<dyn AudioInterface>> {
    if args.no_audio {
        return Ok(Arc::new(NullAudio));
    }
    Ok(Arc::new(talkback_audio::DeviceAudio::new(
        args.input_device.clone(),
    )))
}

#[cfg(not(feature = "device-audio"))]
fn open_audio(args: &RunArgs) -> anyhow::Result<Arc<dyn AudioInterface>> {
    if !args.no_audio {
        log::warn!("built without device audio; running in transcript-only mode");
    }
    if args.input_device.is_some() {
        log::warn!("--input-device ignored: built without device audio");
    }
    Ok(Arc::new(NullAudio))
}

fn secret(store: &ConfigStore, cmd: SecretCommand) -> anyhow::Result<()> {
    match cmd {
        SecretCommand::Set { value } => {
            let value = match value {
                Some(v) => v,
                None => read_secret_from_stdin()?,
            };
            let value = value.trim();
            if value.is_empty() {
                return Err(anyhow!("refusing to store an empty API key"));
            }
            SecretStore::default().set(SecretKey::ElevenLabsApiKey, value)?;
            mark_key_present(store, true)?;
            println!("API key stored in the OS keyring");
        }
        SecretCommand::Delete => {
            SecretStore::default().delete(SecretKey::ElevenLabsApiKey)?;
            mark_key_present(store, false)?;
            println!("API key removed");
        }
    }
    Ok(())
}

fn read_secret_from_stdin() -> anyhow::Result<String> {
    let stdin = std::io::stdin();
    if stdin.is_terminal() {
        eprint!("ElevenLabs API key: ");
    }
    let mut line = String::new();
    stdin.lock().read_line(&mut line).context("read API key")?;
    Ok(line)
}

fn mark_key_present(store: &ConfigStore, present: bool) -> anyhow::Result<()> {
    // Only bookkeeping; the file is not created just for this flag.
    if !store.exists() {
        return Ok(());
    }
    let mut cfg = store.load()?;
    cfg.api_key_present = present;
    store.save(&cfg)
}

fn config(store: &ConfigStore, cmd: ConfigCommand) -> anyhow::Result<()> {
    match cmd {
        ConfigCommand::Init { agent_id, force } => {
            if store.exists() && !force {
                return Err(anyhow!(
                    "config already exists at {} (use --force to replace it)",
                    store.path().display()
                ));
            }
            let cfg = AppConfig {
                agent_id,
                ..AppConfig::default()
            };
            store.save(&cfg)?;
            println!("wrote {}", store.path().display());
        }
        ConfigCommand::Show => {
            let cfg = store.load_or_default()?;
            println!("# {}", store.path().display());
            println!(
                "{}",
                serde_json::to_string_pretty(&cfg).context("encode config JSON")?
            );
        }
    }
    Ok(())
}
