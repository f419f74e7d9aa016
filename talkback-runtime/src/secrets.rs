use anyhow::Context;

/// Keyring service name. Kept constant so upgrades don't orphan secrets.
pub const DEFAULT_SERVICE: &str = "talkback";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecretKey {
    ElevenLabsApiKey,
}

impl SecretKey {
    fn user(self) -> &'static str {
        match self {
            SecretKey::ElevenLabsApiKey => "elevenlabs_api_key",
        }
    }
}

/// Credentials kept in the OS keyring (Secret Service, Keychain, Credential Manager).
#[derive(Debug, Clone)]
pub struct SecretStore {
    service: String,
}

impl Default for SecretStore {
    fn default() -> Self {
        Self::new(DEFAULT_SERVICE)
    }
}

impl SecretStore {
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
        }
    }

    fn entry(&self, key: SecretKey) -> anyhow::Result<keyring::Entry> {
        keyring::Entry::new(&self.service, key.user()).context("open keyring entry")
    }

    pub fn get(&self, key: SecretKey) -> anyhow::Result<Option<String>> {
        match self.entry(key)?.get_password() {
            Ok(v) => Ok(Some(v)),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(e) => Err(anyhow::Error::new(e)).context("read secret from keyring"),
        }
    }

    pub fn set(&self, key: SecretKey, value: &str) -> anyhow::Result<()> {
        self.entry(key)?
            .set_password(value)
            .context("write secret to keyring")?;
        log::info!("stored {} in keyring service {}", key.user(), self.service);
        Ok(())
    }

    /// Removing a secret that was never stored is not an error.
    pub fn delete(&self, key: SecretKey) -> anyhow::Result<()> {
        match self.entry(key)?.delete_credential() {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(e) => Err(anyhow::Error::new(e)).context("delete secret from keyring"),
        }
    }
}
