pub mod pcm;
pub mod resample;

// Device access needs system audio libraries (ALSA on Linux), so it is opt-in.
#[cfg(feature = "device")]
pub mod device;

#[cfg(feature = "device")]
pub use device::{AudioError, DeviceAudio};
pub use pcm::{downmix_to_mono, f32_to_pcm_s16le, pcm_s16le_to_f32};
pub use resample::resample_mono_f32;
