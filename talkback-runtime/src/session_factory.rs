use std::sync::Arc;

use talkback_core::config::AppConfig;
use talkback_engine::traits::{SessionCallbacks, SessionFactory, SessionSettings, StreamingSession};
use talkback_providers::audio::AudioInterface;
use talkback_providers::elevenlabs_convai::{ConvaiConfig, Conversation, ConversationCallbacks};

/// Builds ElevenLabs conversations for the session controller.
///
/// One audio interface is shared by every session; the controller never runs two at once.
pub struct ElevenLabsSessionFactory {
    config: AppConfig,
    audio: Arc<dyn AudioInterface>,
}

impl ElevenLabsSessionFactory {
    pub fn new(config: AppConfig, audio: Arc<dyn AudioInterface>) -> Self {
        Self { config, audio }
    }

    pub fn convai_config(&self, settings: &SessionSettings) -> anyhow::Result<ConvaiConfig> {
        let mut cfg = ConvaiConfig::with_endpoints(
            &self.config.api_base_url,
            &self.config.ws_url,
            settings.agent_id.clone(),
            settings.api_key.clone(),
        )?;
        cfg.requires_auth = settings.requires_auth();
        cfg.connect_timeout = self.config.connect_timeout();
        cfg.end_timeout = self.config.stop_timeout();
        Ok(cfg)
    }
}

impl SessionFactory for ElevenLabsSessionFactory {
    fn create(
        &self,
        settings: &SessionSettings,
        callbacks: SessionCallbacks,
    ) -> anyhow::Result<Arc<dyn StreamingSession>> {
        let cfg = self.convai_config(settings)?;
        log::debug!("creating conversation: {cfg:?}");

        let callbacks = ConversationCallbacks {
            user_transcript: Some(callbacks.on_user_transcript),
            agent_response: Some(callbacks.on_agent_response),
            agent_response_correction: Some(callbacks.on_agent_response_correction),
        };

        Ok(Arc::new(ConversationSession(Conversation::new(
            cfg,
            self.audio.clone(),
            callbacks,
        ))))
    }
}

struct ConversationSession(Conversation);

impl StreamingSession for ConversationSession {
    fn start_session(&self) -> anyhow::Result<()> {
        self.0.start_session()
    }

    fn end_session(&self) {
        self.0.end_session();
    }

    fn wait_for_session_end(&self) -> anyhow::Result<String> {
        self.0.wait_for_session_end()
    }

    fn has_ended(&self) -> bool {
        self.0.has_ended()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use talkback_providers::audio::NullAudio;

    fn factory(config: AppConfig) -> ElevenLabsSessionFactory {
        ElevenLabsSessionFactory::new(config, Arc::new(NullAudio))
    }

    #[test]
    fn convai_config_follows_app_config_and_settings() {
        let f = factory(AppConfig {
            connect_timeout_ms: 1_234,
            stop_timeout_ms: 900,
            ..AppConfig::default()
        });

        let cfg = f
            .convai_config(&SessionSettings::new("agent_1", Some("xi-key".into())))
            .unwrap();
        assert!(cfg.requires_auth);
        assert_eq!(cfg.agent_id, "agent_1");
        assert_eq!(cfg.connect_timeout, Duration::from_millis(1_234));
        assert_eq!(cfg.end_timeout, Duration::from_millis(900));

        let public = f.convai_config(&SessionSettings::new("agent_1", None)).unwrap();
        assert!(!public.requires_auth);
    }

    #[test]
    fn bad_endpoint_fails_at_construction() {
        let f = factory(AppConfig {
            ws_url: "not a url".into(),
            ..AppConfig::default()
        });
        let err = f
            .create(&SessionSettings::new("agent_1", None), SessionCallbacks::noop())
            .err()
            .unwrap();
        assert!(format!("{err:#}").contains("conversation url"));
    }

    #[test]
    fn created_session_is_idle_until_started() {
        let f = factory(AppConfig::default());
        let s = f
            .create(&SessionSettings::new("agent_1", None), SessionCallbacks::noop())
            .unwrap();
        assert!(!s.has_ended());
        // Ending a session that never started is harmless.
        s.end_session();
        assert!(s.wait_for_session_end().is_err());
    }
}
