//! Microphone and speaker access through cpal.
//!
//! cpal streams are not `Send` on every platform, so both streams live on a dedicated worker
//! thread for the duration of a conversation. The thread also chunks and resamples the
//! microphone signal; playback is fed through a shared queue the output callback drains.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, mpsc};
use std::thread::JoinHandle;
use std::time::Duration;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, FromSample, Sample, SampleFormat, SizedSample, Stream};
use talkback_providers::audio::{AudioInputCallback, AudioInterface, CONVERSATION_SAMPLE_RATE_HZ};

use crate::pcm::{downmix_to_mono, f32_to_pcm_s16le, pcm_s16le_to_f32};
use crate::resample::MonoResampler;

const WORKER_STARTUP_TIMEOUT: Duration = Duration::from_secs(2);
const INPUT_CHUNK: Duration = Duration::from_millis(250);
// Agent speech is resampled in fixed 20ms pieces regardless of how the server splits it.
const SPEAKER_CHUNK: Duration = Duration::from_millis(20);
// Upper bound on buffered agent speech; older audio is dropped first.
const MAX_PLAYBACK_SECONDS: usize = 30;

#[derive(Debug, thiserror::Error)]
pub enum AudioError {
    #[error("no input device found")]
    NoInputDevice,

    #[error("no output device found")]
    NoOutputDevice,

    #[error("failed to get default config: {0}")]
    DefaultConfig(#[from] cpal::DefaultStreamConfigError),

    #[error("failed to build stream: {0}")]
    BuildStream(#[from] cpal::BuildStreamError),

    #[error("failed to play stream: {0}")]
    PlayStream(#[from] cpal::PlayStreamError),

    #[error("audio worker failed: {0}")]
    Worker(String),

    #[error("audio worker startup timeout")]
    WorkerTimeout,

    #[error("audio already started")]
    AlreadyStarted,

    #[error("internal channel error")]
    Channel,
}

#[derive(Debug, Default)]
struct PlaybackQueue {
    rate_hz: u32,
    samples: VecDeque<f32>,
}

impl PlaybackQueue {
    fn push(&mut self, mono: Vec<f32>) {
        self.samples.extend(mono);
        let cap = self.rate_hz as usize * MAX_PLAYBACK_SECONDS;
        if cap > 0 && self.samples.len() > cap {
            let excess = self.samples.len() - cap;
            self.samples.drain(..excess);
        }
    }
}

enum Cmd {
    Shutdown,
}

enum WorkerMsg {
    Ready { input_rate_hz: u32, output_rate_hz: u32 },
    Error(String),
}

struct Worker {
    cmd_tx: mpsc::Sender<Cmd>,
    handle: JoinHandle<()>,
}

/// Default (or named) system microphone and speakers.
pub struct DeviceAudio {
    input_device_name: Option<String>,
    playback: Arc<Mutex<PlaybackQueue>>,
    // 16kHz agent speech to the output device rate; set while started.
    speaker_resampler: Mutex<Option<MonoResampler>>,
    worker: Mutex<Option<Worker>>,
}

impl DeviceAudio {
    pub fn new(input_device_name: Option<String>) -> Self {
        Self {
            input_device_name: input_device_name.filter(|n| !n.trim().is_empty()),
            playback: Arc::new(Mutex::new(PlaybackQueue::default())),
            speaker_resampler: Mutex::new(None),
            worker: Mutex::new(None),
        }
    }

    fn playback(&self) -> MutexGuard<'_, PlaybackQueue> {
        self.playback.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn speaker(&self) -> MutexGuard<'_, Option<MonoResampler>> {
        self.speaker_resampler
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn open(&self, on_input: AudioInputCallback) -> Result<Worker, AudioError> {
        let input = pick_input_device(self.input_device_name.as_deref())?;
        let output = cpal::default_host()
            .default_output_device()
            .ok_or(AudioError::NoOutputDevice)?;

        let (cmd_tx, cmd_rx) = mpsc::channel::<Cmd>();
        let (ready_tx, ready_rx) = mpsc::channel::<WorkerMsg>();
        let playback = self.playback.clone();

        let handle = std::thread::Builder::new()
            .name("audio-device".into())
            .spawn(move || run_worker(input, output, on_input, playback, cmd_rx, ready_tx))
            .map_err(|e| AudioError::Worker(format!("spawn: {e}")))?;

        // Block briefly until the worker has either started the streams or failed.
        match ready_rx.recv_timeout(WORKER_STARTUP_TIMEOUT) {
            Ok(WorkerMsg::Ready {
                input_rate_hz,
                output_rate_hz,
            }) => {
                log::info!(
                    "audio started: input {input_rate_hz} Hz, output {output_rate_hz} Hz"
                );
                self.playback().rate_hz = output_rate_hz;
                let chunk_len = chunk_samples(CONVERSATION_SAMPLE_RATE_HZ, SPEAKER_CHUNK);
                match MonoResampler::new(CONVERSATION_SAMPLE_RATE_HZ, output_rate_hz, chunk_len) {
                    Ok(r) => *self.speaker() = Some(r),
                    Err(e) => log::warn!("agent audio disabled: {e:#}"),
                }
                Ok(Worker { cmd_tx, handle })
            }
            Ok(WorkerMsg::Error(e)) => {
                let _ = handle.join();
                Err(AudioError::Worker(e))
            }
            Err(mpsc::RecvTimeoutError::Timeout) => {
                let _ = cmd_tx.send(Cmd::Shutdown);
                Err(AudioError::WorkerTimeout)
            }
            Err(mpsc::RecvTimeoutError::Disconnected) => Err(AudioError::Channel),
        }
    }
}

impl AudioInterface for DeviceAudio {
    fn start(&self, on_input: AudioInputCallback) -> anyhow::Result<()> {
        let mut worker = self.worker.lock().unwrap_or_else(PoisonError::into_inner);
        if worker.is_some() {
            return Err(AudioError::AlreadyStarted.into());
        }
        *worker = Some(self.open(on_input)?);
        Ok(())
    }

    fn stop(&self) {
        let worker = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(w) = worker {
            let _ = w.cmd_tx.send(Cmd::Shutdown);
            let _ = w.handle.join();
            log::info!("audio stopped");
        }
        self.playback().samples.clear();
        *self.speaker() = None;
    }

    fn output(&self, pcm_s16le: &[u8]) {
        let mut speaker = self.speaker();
        let Some(resampler) = speaker.as_mut() else {
            return;
        };
        let mono = pcm_s16le_to_f32(pcm_s16le);
        match resampler.process(&mono) {
            Ok(samples) => self.playback().push(samples),
            Err(e) => log::warn!("dropping agent audio chunk: {e:#}"),
        }
    }

    fn interrupt(&self) {
        if let Some(resampler) = self.speaker().as_mut() {
            resampler.reset();
        }
        let dropped = {
            let mut q = self.playback();
            let n = q.samples.len();
            q.samples.clear();
            n
        };
        log::debug!("playback interrupted ({dropped} samples dropped)");
    }
}

impl Drop for DeviceAudio {
    fn drop(&mut self) {
        self.stop();
    }
}

fn pick_input_device(name: Option<&str>) -> Result<Device, AudioError> {
    let host = cpal::default_host();

    if let Some(needle) = name.map(str::trim) {
        if let Ok(devices) = host.input_devices() {
            for dev in devices {
                if dev.name().is_ok_and(|n| n == needle) {
                    log::info!("Using input device: {needle}");
                    return Ok(dev);
                }
            }
        }
        log::warn!("Preferred input device not found, falling back to default: {needle}");
    }

    host.default_input_device().ok_or(AudioError::NoInputDevice)
}

fn run_worker(
    input: Device,
    output: Device,
    on_input: AudioInputCallback,
    playback: Arc<Mutex<PlaybackQueue>>,
    cmd_rx: mpsc::Receiver<Cmd>,
    ready_tx: mpsc::Sender<WorkerMsg>,
) {
    let streams = open_streams(&input, &output, playback);
    let (input_stream, output_stream, sample_rx, input_rate_hz, output_rate_hz) = match streams {
        Ok(s) => s,
        Err(e) => {
            log::error!("Audio stream setup failed: {e}");
            let _ = ready_tx.send(WorkerMsg::Error(e.to_string()));
            return;
        }
    };

    let _ = ready_tx.send(WorkerMsg::Ready {
        input_rate_hz,
        output_rate_hz,
    });

    run_consumer(sample_rx, cmd_rx, input_rate_hz, &on_input);
    drop(input_stream);
    drop(output_stream);
}

type OpenedStreams = (Stream, Stream, mpsc::Receiver<Vec<f32>>, u32, u32);

fn open_streams(
    input: &Device,
    output: &Device,
    playback: Arc<Mutex<PlaybackQueue>>,
) -> Result<OpenedStreams, AudioError> {
    let in_cfg = input.default_input_config()?;
    let out_cfg = output.default_output_config()?;
    let input_rate_hz = in_cfg.sample_rate().0;
    let output_rate_hz = out_cfg.sample_rate().0;

    let (sample_tx, sample_rx) = mpsc::channel::<Vec<f32>>();
    let in_channels = in_cfg.channels() as usize;
    let in_stream_cfg: cpal::StreamConfig = in_cfg.clone().into();
    let input_stream = match in_cfg.sample_format() {
        SampleFormat::I16 => build_input_stream::<i16>(input, &in_stream_cfg, in_channels, sample_tx),
        SampleFormat::U16 => build_input_stream::<u16>(input, &in_stream_cfg, in_channels, sample_tx),
        SampleFormat::I32 => build_input_stream::<i32>(input, &in_stream_cfg, in_channels, sample_tx),
        SampleFormat::U8 => build_input_stream::<u8>(input, &in_stream_cfg, in_channels, sample_tx),
        SampleFormat::F64 => build_input_stream::<f64>(input, &in_stream_cfg, in_channels, sample_tx),
        _ => build_input_stream::<f32>(input, &in_stream_cfg, in_channels, sample_tx),
    }?;

    let out_channels = out_cfg.channels() as usize;
    let out_stream_cfg: cpal::StreamConfig = out_cfg.clone().into();
    let output_stream = match out_cfg.sample_format() {
        SampleFormat::I16 => build_output_stream::<i16>(output, &out_stream_cfg, out_channels, playback),
        SampleFormat::U16 => build_output_stream::<u16>(output, &out_stream_cfg, out_channels, playback),
        SampleFormat::I32 => build_output_stream::<i32>(output, &out_stream_cfg, out_channels, playback),
        SampleFormat::U8 => build_output_stream::<u8>(output, &out_stream_cfg, out_channels, playback),
        SampleFormat::F64 => build_output_stream::<f64>(output, &out_stream_cfg, out_channels, playback),
        _ => build_output_stream::<f32>(output, &out_stream_cfg, out_channels, playback),
    }?;

    input_stream.play()?;
    output_stream.play()?;

    Ok((input_stream, output_stream, sample_rx, input_rate_hz, output_rate_hz))
}

fn build_input_stream<T>(
    device: &Device,
    config: &cpal::StreamConfig,
    channels: usize,
    sample_tx: mpsc::Sender<Vec<f32>>,
) -> Result<Stream, cpal::BuildStreamError>
where
    T: Sample + SizedSample + Send + 'static,
    f32: FromSample<T>,
{
    let cb = move |data: &[T], _: &cpal::InputCallbackInfo| {
        let floats: Vec<f32> = data.iter().map(|&s| s.to_sample::<f32>()).collect();
        let _ = sample_tx.send(downmix_to_mono(&floats, channels));
    };

    device.build_input_stream(
        config,
        cb,
        |err| log::error!("Audio input stream error: {err}"),
        None,
    )
}

fn build_output_stream<T>(
    device: &Device,
    config: &cpal::StreamConfig,
    channels: usize,
    playback: Arc<Mutex<PlaybackQueue>>,
) -> Result<Stream, cpal::BuildStreamError>
where
    T: Sample + SizedSample + FromSample<f32> + Send + 'static,
{
    let channels = channels.max(1);
    let cb = move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
        let mut q = playback.lock().unwrap_or_else(PoisonError::into_inner);
        for frame in data.chunks_mut(channels) {
            let s = q.samples.pop_front().unwrap_or(0.0);
            for slot in frame.iter_mut() {
                *slot = T::from_sample(s);
            }
        }
    };

    device.build_output_stream(
        config,
        cb,
        |err| log::error!("Audio output stream error: {err}"),
        None,
    )
}

/// Collects microphone audio into fixed-length chunks and hands them out as 16kHz s16le.
fn run_consumer(
    sample_rx: mpsc::Receiver<Vec<f32>>,
    cmd_rx: mpsc::Receiver<Cmd>,
    input_rate_hz: u32,
    on_input: &AudioInputCallback,
) {
    let chunk_len = chunk_samples(input_rate_hz, INPUT_CHUNK);
    let mut pending: Vec<f32> = Vec::with_capacity(chunk_len * 2);
    let mut resampler = match MonoResampler::new(input_rate_hz, CONVERSATION_SAMPLE_RATE_HZ, chunk_len) {
        Ok(r) => r,
        Err(e) => {
            log::error!("microphone disabled: {e:#}");
            return;
        }
    };

    loop {
        // Always drain commands promptly, even if the stream is stalled.
        while let Ok(cmd) = cmd_rx.try_recv() {
            match cmd {
                Cmd::Shutdown => return,
            }
        }

        match sample_rx.recv_timeout(Duration::from_millis(50)) {
            Ok(samples) => {
                pending.extend_from_slice(&samples);
                while pending.len() >= chunk_len {
                    let chunk: Vec<f32> = pending.drain(..chunk_len).collect();
                    match resampler.process(&chunk) {
                        Ok(resampled) => on_input(f32_to_pcm_s16le(&resampled)),
                        Err(e) => log::warn!("dropping microphone chunk: {e:#}"),
                    }
                }
            }
            Err(mpsc::RecvTimeoutError::Timeout) => continue,
            Err(mpsc::RecvTimeoutError::Disconnected) => return,
        }
    }
}

fn chunk_samples(rate_hz: u32, len: Duration) -> usize {
    ((rate_hz as u128 * len.as_millis()) / 1000).max(1) as usize
}
