pub mod audio;
pub mod elevenlabs_convai;
pub mod parse;
pub mod request;
pub mod runtime;

pub use audio::{AudioInputCallback, AudioInterface, NullAudio};
pub use elevenlabs_convai::{ConvaiConfig, Conversation, ConversationCallbacks};
