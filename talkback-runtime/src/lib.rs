pub mod config_store;
pub mod fs;
pub mod secrets;
pub mod session_factory;
pub mod settings;

pub use config_store::ConfigStore;
pub use session_factory::ElevenLabsSessionFactory;
pub use settings::{CredentialSource, Overrides, ResolvedSettings, resolve_settings};
