use std::path::PathBuf;

use anyhow::anyhow;
use talkback_core::config::AppConfig;
use talkback_engine::traits::SessionSettings;

use crate::secrets::{SecretKey, SecretStore};

pub const ENV_API_KEY: &str = "ELEVENLABS_API_KEY";
pub const ENV_AGENT_ID: &str = "AGENT_ID";

/// Values given on the command line. They win over everything else.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Overrides {
    pub api_key: Option<String>,
    pub agent_id: Option<String>,
    pub stop_timeout_ms: Option<u64>,
}

impl std::fmt::Debug for Overrides {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Overrides")
            .field("api_key", &self.api_key.as_ref().map(|_| "[REDACTED]"))
            .field("agent_id", &self.agent_id)
            .field("stop_timeout_ms", &self.stop_timeout_ms)
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialSource {
    Flag,
    Environment,
    Keyring,
    Missing,
}

impl CredentialSource {
    pub fn label(self) -> &'static str {
        match self {
            CredentialSource::Flag => "command line",
            CredentialSource::Environment => ENV_API_KEY,
            CredentialSource::Keyring => "OS keyring",
            CredentialSource::Missing => "none (public agent)",
        }
    }
}

/// Where the stored credential comes from. Split out so resolution can be tested without
/// touching the real keyring.
pub trait SecretSource {
    fn elevenlabs_api_key(&self) -> anyhow::Result<Option<String>>;
}

impl SecretSource for SecretStore {
    fn elevenlabs_api_key(&self) -> anyhow::Result<Option<String>> {
        self.get(SecretKey::ElevenLabsApiKey)
    }
}

#[derive(Debug, Clone)]
pub struct ResolvedSettings {
    pub session: SessionSettings,
    pub config: AppConfig,
    pub credential_source: CredentialSource,
}

/// What became of the `.env` file.
///
/// The file is read before logging is installed so that it can set `RUST_LOG`; the outcome
/// is reported once the subscriber exists.
#[derive(Debug)]
pub enum DotenvOutcome {
    Loaded(PathBuf),
    Absent,
    Unreadable(String),
}

impl DotenvOutcome {
    fn from_result(result: Result<PathBuf, dotenvy::Error>) -> Self {
        match result {
            Ok(path) => DotenvOutcome::Loaded(path),
            Err(e) if e.not_found() => DotenvOutcome::Absent,
            Err(e) => DotenvOutcome::Unreadable(e.to_string()),
        }
    }

    pub fn log(&self) {
        match self {
            DotenvOutcome::Loaded(path) => log::debug!("loaded environment from {}", path.display()),
            DotenvOutcome::Absent => {}
            DotenvOutcome::Unreadable(e) => log::warn!("ignoring unreadable .env file: {e}"),
        }
    }
}

/// Loads a `.env` file from the working directory (or a parent) into the process env.
pub fn load_dotenv() -> DotenvOutcome {
    DotenvOutcome::from_result(dotenvy::dotenv())
}

pub fn process_env(name: &str) -> Option<String> {
    std::env::var(name).ok()
}

fn non_blank(v: Option<String>) -> Option<String> {
    v.map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}

/// Picks the credential and agent id for new sessions.
///
/// Credential: flag, then `ELEVENLABS_API_KEY`, then the keyring. A missing credential only
/// disables authentication. Agent id: flag, then `AGENT_ID`, then the config file; it is
/// required.
pub fn resolve_settings(
    overrides: &Overrides,
    env: impl Fn(&str) -> Option<String>,
    mut config: AppConfig,
    secrets: &dyn SecretSource,
) -> anyhow::Result<ResolvedSettings> {
    let (api_key, credential_source) = if let Some(k) = non_blank(overrides.api_key.clone()) {
        (Some(k), CredentialSource::Flag)
    } else if let Some(k) = non_blank(env(ENV_API_KEY)) {
        (Some(k), CredentialSource::Environment)
    } else {
        match secrets.elevenlabs_api_key() {
            Ok(k) => match non_blank(k) {
                Some(k) => (Some(k), CredentialSource::Keyring),
                None => (None, CredentialSource::Missing),
            },
            Err(e) => {
                log::warn!("keyring unavailable, continuing without a stored credential: {e:#}");
                (None, CredentialSource::Missing)
            }
        }
    };

    let agent_id = non_blank(overrides.agent_id.clone())
        .or_else(|| non_blank(env(ENV_AGENT_ID)))
        .or_else(|| non_blank(config.agent_id.clone()))
        .ok_or_else(|| {
            anyhow!(
                "no agent id configured: pass --agent-id, set {ENV_AGENT_ID}, or add agent_id to the config file"
            )
        })?;

    if let Some(ms) = overrides.stop_timeout_ms {
        config.stop_timeout_ms = ms;
    }
    config.agent_id = Some(agent_id.clone());
    config.api_key_present = api_key.is_some();

    log::info!(
        "agent {agent_id}, credential from {}",
        credential_source.label()
    );

    Ok(ResolvedSettings {
        session: SessionSettings::new(agent_id, api_key),
        config,
        credential_source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    struct FixedSecret(Option<&'static str>);

    impl SecretSource for FixedSecret {
        fn elevenlabs_api_key(&self) -> anyhow::Result<Option<String>> {
            Ok(self.0.map(str::to_string))
        }
    }

    struct BrokenKeyring;

    impl SecretSource for BrokenKeyring {
        fn elevenlabs_api_key(&self) -> anyhow::Result<Option<String>> {
            Err(anyhow!("no secret service"))
        }
    }

    #[test]
    fn dotenv_outcome_distinguishes_missing_from_unreadable() {
        let dir = tempfile::tempdir().unwrap();

        let missing = dir.path().join(".env");
        let outcome = DotenvOutcome::from_result(dotenvy::from_path(&missing).map(|()| missing.clone()));
        assert!(matches!(outcome, DotenvOutcome::Absent));

        // A directory opens but cannot be read as a file.
        let outcome = DotenvOutcome::from_result(
            dotenvy::from_path(dir.path()).map(|()| dir.path().to_path_buf()),
        );
        assert!(matches!(outcome, DotenvOutcome::Unreadable(_)), "{outcome:?}");

        let present = dir.path().join("talkback.env");
        std::fs::write(&present, "TALKBACK_TEST_DOTENV_LOADED=1\n").unwrap();
        let outcome = DotenvOutcome::from_result(dotenvy::from_path(&present).map(|()| present.clone()));
        assert!(matches!(&outcome, DotenvOutcome::Loaded(p) if p == &present));
        assert_eq!(process_env("TALKBACK_TEST_DOTENV_LOADED").as_deref(), Some("1"));
    }

    fn env_of(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn flag_beats_env_beats_keyring() {
        let env = env_of(&[(ENV_API_KEY, "env-key"), (ENV_AGENT_ID, "env-agent")]);
        let overrides = Overrides {
            api_key: Some("flag-key".into()),
            agent_id: Some("flag-agent".into()),
            ..Default::default()
        };

        let r = resolve_settings(&overrides, &env, AppConfig::default(), &FixedSecret(Some("ring"))).unwrap();
        assert_eq!(r.session.api_key.as_deref(), Some("flag-key"));
        assert_eq!(r.session.agent_id, "flag-agent");
        assert_eq!(r.credential_source, CredentialSource::Flag);

        let r = resolve_settings(&Overrides::default(), &env, AppConfig::default(), &FixedSecret(Some("ring"))).unwrap();
        assert_eq!(r.session.api_key.as_deref(), Some("env-key"));
        assert_eq!(r.session.agent_id, "env-agent");
        assert_eq!(r.credential_source, CredentialSource::Environment);

        let cfg = AppConfig {
            agent_id: Some("cfg-agent".into()),
            ..AppConfig::default()
        };
        let r = resolve_settings(&Overrides::default(), env_of(&[]), cfg, &FixedSecret(Some("ring"))).unwrap();
        assert_eq!(r.session.api_key.as_deref(), Some("ring"));
        assert_eq!(r.session.agent_id, "cfg-agent");
        assert_eq!(r.credential_source, CredentialSource::Keyring);
        assert!(r.config.api_key_present);
    }

    #[test]
    fn missing_credential_disables_auth() {
        let env = env_of(&[(ENV_AGENT_ID, "agent"), (ENV_API_KEY, "   ")]);
        let r = resolve_settings(&Overrides::default(), env, AppConfig::default(), &FixedSecret(None)).unwrap();
        assert!(!r.session.requires_auth());
        assert_eq!(r.credential_source, CredentialSource::Missing);
        assert!(!r.config.api_key_present);
    }

    #[test]
    fn broken_keyring_is_not_fatal() {
        let env = env_of(&[(ENV_AGENT_ID, "agent")]);
        let r = resolve_settings(&Overrides::default(), env, AppConfig::default(), &BrokenKeyring).unwrap();
        assert!(!r.session.requires_auth());
    }

    #[test]
    fn missing_agent_id_is_an_error() {
        let err = resolve_settings(&Overrides::default(), env_of(&[]), AppConfig::default(), &FixedSecret(Some("k")))
            .unwrap_err();
        assert!(err.to_string().contains("agent id"));
    }

    #[test]
    fn stop_timeout_override_applies_to_config() {
        let overrides = Overrides {
            agent_id: Some("a".into()),
            stop_timeout_ms: Some(250),
            ..Default::default()
        };
        let r = resolve_settings(&overrides, env_of(&[]), AppConfig::default(), &FixedSecret(None)).unwrap();
        assert_eq!(r.config.stop_timeout_ms, 250);
        assert_eq!(r.config.agent_id.as_deref(), Some("a"));
    }

    #[test]
    fn debug_redacts_flag_key() {
        let o = Overrides {
            api_key: Some("xi-secret".into()),
            ..Default::default()
        };
        assert!(!format!("{o:?}").contains("xi-secret"));
    }
}
