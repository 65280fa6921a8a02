//! Microphone capture
//!
//! The cpal stream lives on a dedicated thread (it is `!Send` on some
//! platforms) for as long as capture is started. Device frames are converted
//! to 16 kHz mono PCM inside the audio callback and pushed onto an unbounded
//! channel, so the callback never blocks. Muting keeps the device open and
//! simply withholds chunks.

use crate::audio::{frames_to_mono_pcm16, AudioChunk, AudioConfig, StreamResampler};
use crate::error::{VoiceError, VoiceResult};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{FromSample, Sample, SampleFormat, SizedSample, Stream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc as std_mpsc, Arc};
use std::thread;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, info, warn};

struct CaptureWorker {
    stop_tx: std_mpsc::Sender<()>,
    thread: thread::JoinHandle<()>,
}

/// Owns the input device between `start()` and `stop()`.
pub struct AudioCapturePipeline {
    config: AudioConfig,
    chunk_tx: mpsc::UnboundedSender<AudioChunk>,
    chunk_rx: Option<mpsc::UnboundedReceiver<AudioChunk>>,
    muted: Arc<AtomicBool>,
    worker: Option<CaptureWorker>,
}

impl AudioCapturePipeline {
    /// Create an idle pipeline. No device is touched until `start()`.
    pub fn new(config: AudioConfig) -> Self {
        let (chunk_tx, chunk_rx) = mpsc::unbounded_channel();
        Self {
            config,
            chunk_tx,
            chunk_rx: Some(chunk_rx),
            muted: Arc::new(AtomicBool::new(false)),
            worker: None,
        }
    }

    /// The chunk sequence. It survives stop/start cycles and only ends when
    /// the pipeline is dropped.
    pub fn take_stream(&mut self) -> Option<UnboundedReceiverStream<AudioChunk>> {
        self.chunk_rx.take().map(UnboundedReceiverStream::new)
    }

    /// Acquire the default input device and begin emitting chunks.
    /// No-op when already started.
    pub fn start(&mut self) -> VoiceResult<()> {
        if self.worker.is_some() {
            debug!(target: "callerpro::capture", "Capture already running");
            return Ok(());
        }

        info!(target: "callerpro::capture", "🎤 Starting microphone capture ({} Hz mono)", self.config.sample_rate);

        let (ready_tx, ready_rx) = std_mpsc::sync_channel::<VoiceResult<()>>(1);
        let (stop_tx, stop_rx) = std_mpsc::channel::<()>();
        let chunk_tx = self.chunk_tx.clone();
        let muted = Arc::clone(&self.muted);
        let target_rate = self.config.sample_rate;

        let thread = thread::Builder::new()
            .name("callerpro-capture".to_string())
            .spawn(move || {
                let stream = match open_input_stream(chunk_tx, muted, target_rate) {
                    Ok(stream) => stream,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                let _ = ready_tx.send(Ok(()));
                // Parked until stop() signals or the pipeline is dropped.
                let _ = stop_rx.recv();
                drop(stream);
                debug!(target: "callerpro::capture", "Input stream released");
            })?;

        match ready_rx.recv() {
            Ok(Ok(())) => {
                self.worker = Some(CaptureWorker { stop_tx, thread });
                info!(target: "callerpro::capture", "✅ Microphone capture started");
                Ok(())
            }
            Ok(Err(e)) => {
                let _ = thread.join();
                warn!(target: "callerpro::capture", "Microphone unavailable: {}", e);
                Err(e)
            }
            Err(_) => {
                let _ = thread.join();
                Err(VoiceError::Device(
                    "capture thread exited before the stream was ready".to_string(),
                ))
            }
        }
    }

    /// Release the input device. No-op when already stopped.
    pub fn stop(&mut self) {
        if let Some(worker) = self.worker.take() {
            let _ = worker.stop_tx.send(());
            if worker.thread.join().is_err() {
                warn!(target: "callerpro::capture", "Capture thread panicked");
            }
            info!(target: "callerpro::capture", "⏹️ Microphone capture stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.worker.is_some()
    }

    /// Withhold (or resume) chunk emission without closing the device.
    pub fn set_muted(&self, muted: bool) {
        let was = self.muted.swap(muted, Ordering::SeqCst);
        if was != muted {
            info!(target: "callerpro::capture", muted, "Microphone mute changed");
        }
    }

    pub fn is_muted(&self) -> bool {
        self.muted.load(Ordering::SeqCst)
    }

    /// List available input devices
    pub fn list_input_devices() -> VoiceResult<Vec<String>> {
        let host = cpal::default_host();
        let devices = host.input_devices()?;
        Ok(devices.filter_map(|d| d.name().ok()).collect())
    }
}

impl Drop for AudioCapturePipeline {
    fn drop(&mut self) {
        self.stop();
    }
}

fn open_input_stream(
    chunk_tx: mpsc::UnboundedSender<AudioChunk>,
    muted: Arc<AtomicBool>,
    target_rate: u32,
) -> VoiceResult<Stream> {
    let device = cpal::default_host()
        .default_input_device()
        .ok_or_else(|| VoiceError::Device("No input device available".to_string()))?;

    info!(
        target: "callerpro::capture",
        "📱 Using input device: {}",
        device.name().unwrap_or_else(|_| "Unknown".to_string())
    );

    let supported = device.default_input_config()?;
    let sample_format = supported.sample_format();
    let stream_config = supported.config();

    debug!(target: "callerpro::capture", ?stream_config, ?sample_format, "Native input format");

    let stream = match sample_format {
        SampleFormat::F32 => build_stream::<f32>(&device, &stream_config, chunk_tx, muted, target_rate)?,
        SampleFormat::I16 => build_stream::<i16>(&device, &stream_config, chunk_tx, muted, target_rate)?,
        SampleFormat::U16 => build_stream::<u16>(&device, &stream_config, chunk_tx, muted, target_rate)?,
        other => {
            return Err(VoiceError::Device(format!(
                "Unsupported input sample format: {:?}",
                other
            )))
        }
    };

    stream.play()?;
    Ok(stream)
}

fn build_stream<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    chunk_tx: mpsc::UnboundedSender<AudioChunk>,
    muted: Arc<AtomicBool>,
    target_rate: u32,
) -> VoiceResult<Stream>
where
    T: SizedSample,
    f32: FromSample<T>,
{
    let channels = config.channels as usize;
    let mut resampler = StreamResampler::new(config.sample_rate.0, target_rate);

    let stream = device.build_input_stream(
        config,
        move |data: &[T], _: &cpal::InputCallbackInfo| {
            let frames: Vec<f32> = data.iter().map(|&s| f32::from_sample(s)).collect();
            forward_frames(&frames, channels, &mut resampler, &muted, &chunk_tx);
        },
        move |err| {
            warn!(target: "callerpro::capture", "Audio stream error: {}", err);
        },
        None,
    )?;
    Ok(stream)
}

/// Handle one device callback. Returns whether a chunk was emitted.
fn forward_frames(
    frames: &[f32],
    channels: usize,
    resampler: &mut StreamResampler,
    muted: &AtomicBool,
    chunk_tx: &mpsc::UnboundedSender<AudioChunk>,
) -> bool {
    if muted.load(Ordering::Relaxed) {
        // After unmuting the audio starts over as a new signal.
        resampler.reset();
        return false;
    }
    let pcm = frames_to_mono_pcm16(frames, channels, resampler);
    if pcm.is_empty() {
        return false;
    }
    // Receiver gone means nobody is listening any more; drop quietly.
    chunk_tx.send(AudioChunk::new(pcm, resampler.output_rate())).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::INPUT_SAMPLE_RATE;

    #[test]
    fn test_new_pipeline_is_idle() {
        let mut capture = AudioCapturePipeline::new(AudioConfig::capture());
        assert!(!capture.is_running());
        assert!(!capture.is_muted());
        assert!(capture.take_stream().is_some());
        assert!(capture.take_stream().is_none());
    }

    #[test]
    fn test_stop_is_idempotent() {
        let mut capture = AudioCapturePipeline::new(AudioConfig::capture());
        capture.stop();
        capture.stop();
        assert!(!capture.is_running());
    }

    #[test]
    fn test_mute_toggle() {
        let capture = AudioCapturePipeline::new(AudioConfig::capture());
        capture.set_muted(true);
        assert!(capture.is_muted());
        capture.set_muted(false);
        assert!(!capture.is_muted());
    }

    fn callback_frames(rate: u32, channels: usize, frames: usize) -> Vec<f32> {
        (0..frames * channels)
            .map(|i| ((i / channels) as f32 * 440.0 / rate as f32).sin() * 0.5)
            .collect()
    }

    #[test]
    fn test_callbacks_resample_without_losing_samples() {
        let (chunk_tx, mut chunk_rx) = mpsc::unbounded_channel();
        let muted = AtomicBool::new(false);
        let mut resampler = StreamResampler::new(44100, INPUT_SAMPLE_RATE);

        // One second of stereo input in 512-frame callbacks.
        let mut fed = 0;
        while fed < 44100 {
            let frames = 512.min(44100 - fed);
            let data = callback_frames(44100, 2, frames);
            forward_frames(&data, 2, &mut resampler, &muted, &chunk_tx);
            fed += frames;
        }

        let mut total = 0;
        while let Ok(chunk) = chunk_rx.try_recv() {
            assert_eq!(chunk.sample_rate, INPUT_SAMPLE_RATE);
            total += chunk.samples.len();
        }
        assert_eq!(total, 16000);
    }

    #[test]
    fn test_muted_callbacks_emit_nothing() {
        let (chunk_tx, mut chunk_rx) = mpsc::unbounded_channel();
        let muted = AtomicBool::new(true);
        let mut resampler = StreamResampler::new(48000, INPUT_SAMPLE_RATE);
        let data = callback_frames(48000, 1, 480);

        assert!(!forward_frames(&data, 1, &mut resampler, &muted, &chunk_tx));
        assert!(!forward_frames(&data, 1, &mut resampler, &muted, &chunk_tx));
        assert!(chunk_rx.try_recv().is_err());

        muted.store(false, Ordering::SeqCst);
        assert!(forward_frames(&data, 1, &mut resampler, &muted, &chunk_tx));
        let chunk = chunk_rx.try_recv().unwrap();
        assert_eq!(chunk.samples.len(), 160);
    }

    #[test]
    fn test_callback_after_receiver_dropped() {
        let (chunk_tx, chunk_rx) = mpsc::unbounded_channel();
        drop(chunk_rx);
        let muted = AtomicBool::new(false);
        let mut resampler = StreamResampler::new(16000, INPUT_SAMPLE_RATE);
        assert!(!forward_frames(&[0.1; 160], 1, &mut resampler, &muted, &chunk_tx));
    }

    #[test]
    fn test_list_devices() {
        // This might fail in CI environments without audio devices
        if let Ok(devices) = AudioCapturePipeline::list_input_devices() {
            println!("Available input devices: {:?}", devices);
        }
    }

    #[test]
    #[ignore] // Requires a microphone
    fn test_start_twice_is_noop() {
        let mut capture = AudioCapturePipeline::new(AudioConfig::capture());
        capture.start().expect("microphone");
        capture.start().expect("second start is a no-op");
        assert!(capture.is_running());
        capture.stop();
        assert!(!capture.is_running());
    }
}
