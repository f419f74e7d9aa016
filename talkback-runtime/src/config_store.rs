use anyhow::Context;
use std::path::{Path, PathBuf};
use talkback_core::config::AppConfig;

const CONFIG_FILE_NAME: &str = "config.json";

#[derive(Debug, Clone)]
pub struct ConfigStore {
    path: PathBuf,
}

impl ConfigStore {
    pub fn at_path(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// `talkback/config.json` under the platform config directory.
    pub fn default_location() -> anyhow::Result<Self> {
        let base = dirs::config_dir().context("cannot determine a config directory (set --config)")?;
        Ok(Self::in_dir(&base))
    }

    fn in_dir(base: &Path) -> Self {
        Self::at_path(base.join("talkback").join(CONFIG_FILE_NAME))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    pub fn load(&self) -> anyhow::Result<AppConfig> {
        let bytes = std::fs::read(&self.path)
            .with_context(|| format!("read config: {}", self.path.display()))?;
        let cfg: AppConfig = serde_json::from_slice(&bytes).context("decode config JSON")?;
        Ok(cfg)
    }

    /// Like `load`, but a missing file yields the defaults.
    pub fn load_or_default(&self) -> anyhow::Result<AppConfig> {
        if !self.exists() {
            log::debug!("no config at {}, using defaults", self.path.display());
            return Ok(AppConfig::default());
        }
        self.load()
    }

    pub fn save(&self, cfg: &AppConfig) -> anyhow::Result<()> {
        let json = serde_json::to_vec_pretty(cfg).context("encode config JSON")?;
        crate::fs::write_atomic(&self.path, &json)
            .with_context(|| format!("save config: {}", self.path.display()))?;
        log::debug!("saved config to {}", self.path.display());
        Ok(())
    }
}
