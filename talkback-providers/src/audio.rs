/// Sample rate of the PCM exchanged with the conversation service, both directions.
pub const CONVERSATION_SAMPLE_RATE_HZ: u32 = 16_000;

pub type AudioInputCallback = Box<dyn Fn(Vec<u8>) + Send + Sync + 'static>;

/// Audio boundary of a conversation.
///
/// All audio is mono PCM s16le at `CONVERSATION_SAMPLE_RATE_HZ`. `stop` may be called
/// more than once and must be idempotent.
pub trait AudioInterface: Send + Sync {
    /// Begins capturing; every captured chunk is handed to `on_input`.
    fn start(&self, on_input: AudioInputCallback) -> anyhow::Result<()>;

    fn stop(&self);

    /// Queues agent speech for playback. Must not block for the duration of playback.
    fn output(&self, pcm_s16le: &[u8]);

    /// Drops any queued playback; the user started talking over the agent.
    fn interrupt(&self);
}

/// Audio interface that captures nothing and discards playback.
///
/// Useful for text-only sessions and for machines without audio devices.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullAudio;

impl AudioInterface for NullAudio {
    fn start(&self, _on_input: AudioInputCallback) -> anyhow::Result<()> {
        log::info!("audio disabled: microphone input will not be captured");
        Ok(())
    }

    fn stop(&self) {}

    fn output(&self, _pcm_s16le: &[u8]) {}

    fn interrupt(&self) {}
}
