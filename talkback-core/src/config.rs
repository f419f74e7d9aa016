use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const DEFAULT_API_BASE_URL: &str = "https://api.elevenlabs.io";
pub const DEFAULT_WS_URL: &str = "wss://api.elevenlabs.io/v1/convai/conversation";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub agent_id: Option<String>,
    pub api_base_url: String,
    pub ws_url: String,

    // Worker wait-loop granularity; bounds stop latency.
    pub worker_poll_interval_ms: u64,
    pub live_poll_interval_ms: u64,
    pub drain_poll_interval_ms: u64,

    pub stop_timeout_ms: u64,
    pub connect_timeout_ms: u64,

    // The credential itself is stored outside this struct at rest.
    pub api_key_present: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            agent_id: None,
            api_base_url: DEFAULT_API_BASE_URL.into(),
            ws_url: DEFAULT_WS_URL.into(),
            worker_poll_interval_ms: 100,
            live_poll_interval_ms: 500,
            drain_poll_interval_ms: 100,
            stop_timeout_ms: 3_000,
            connect_timeout_ms: 10_000,
            api_key_present: false,
        }
    }
}

impl AppConfig {
    pub fn worker_poll_interval(&self) -> Duration {
        Duration::from_millis(self.worker_poll_interval_ms.max(1))
    }

    pub fn live_poll_interval(&self) -> Duration {
        Duration::from_millis(self.live_poll_interval_ms)
    }

    pub fn drain_poll_interval(&self) -> Duration {
        Duration::from_millis(self.drain_poll_interval_ms)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}
