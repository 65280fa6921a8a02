//! Gapless playback of the agent's voice
//!
//! Chunks pushed by the session are appended to a shared sample queue. A single
//! never-ending rodio `Source` drains that queue on the device clock and plays
//! silence only while the queue is empty, so consecutive chunks are joined
//! without gaps. `stop()` flushes the queue and bumps an epoch so any samples
//! the device already pulled are discarded too.

use crate::audio::{i16_to_f32, rms, AudioChunk, AudioConfig};
use crate::error::{VoiceError, VoiceResult};
use rodio::{OutputStream, Sink, Source};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{mpsc as std_mpsc, Arc, Mutex, MutexGuard};
use std::thread;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Samples pulled from the queue per lock; ~10 ms at 24 kHz.
const BLOCK_SAMPLES: usize = 240;

/// Sample queue shared between the enqueuing side and the output source.
pub struct PlaybackQueue {
    samples: Mutex<VecDeque<i16>>,
    sample_rate: u32,
    epoch: AtomicU64,
    amplitude: AtomicU32,
}

impl PlaybackQueue {
    pub fn new(sample_rate: u32) -> Self {
        Self {
            samples: Mutex::new(VecDeque::new()),
            sample_rate,
            epoch: AtomicU64::new(0),
            amplitude: AtomicU32::new(0f32.to_bits()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<i16>> {
        match self.samples.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Append a chunk, resampling it to the playback clock when needed.
    pub fn push(&self, chunk: AudioChunk) {
        let chunk = chunk.resampled(self.sample_rate);
        self.lock().extend(chunk.samples);
    }

    /// Drop everything not yet played. Returns the number of discarded samples.
    pub fn flush(&self) -> usize {
        let mut queue = self.lock();
        let discarded = queue.len();
        queue.clear();
        self.epoch.fetch_add(1, Ordering::SeqCst);
        self.amplitude.store(0f32.to_bits(), Ordering::Relaxed);
        discarded
    }

    pub fn pending_samples(&self) -> usize {
        self.lock().len()
    }

    /// Latest RMS level of the audio handed to the device, 0.0..=1.0.
    pub fn amplitude(&self) -> f32 {
        f32::from_bits(self.amplitude.load(Ordering::Relaxed))
    }

    fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::SeqCst)
    }

    /// Move up to `max` queued samples into `out`. Returns how many were moved.
    fn drain_into(&self, out: &mut Vec<i16>, max: usize) -> usize {
        let mut queue = self.lock();
        let n = queue.len().min(max);
        out.extend(queue.drain(..n));
        n
    }

    fn set_amplitude(&self, level: f32) {
        self.amplitude.store(level.to_bits(), Ordering::Relaxed);
    }
}

/// Endless mono source fed from a [`PlaybackQueue`].
pub struct QueueSource {
    queue: Arc<PlaybackQueue>,
    block: Vec<i16>,
    pos: usize,
    epoch: u64,
}

impl QueueSource {
    pub fn new(queue: Arc<PlaybackQueue>) -> Self {
        let epoch = queue.epoch();
        Self {
            queue,
            block: Vec::with_capacity(BLOCK_SAMPLES),
            pos: 0,
            epoch,
        }
    }

    fn refill(&mut self) {
        self.block.clear();
        self.pos = 0;
        if self.queue.drain_into(&mut self.block, BLOCK_SAMPLES) == 0 {
            // Nothing buffered: one block of silence, then look again.
            self.block.resize(BLOCK_SAMPLES, 0);
            self.queue.set_amplitude(0.0);
        } else {
            self.queue.set_amplitude(rms(&self.block));
        }
    }
}

impl Iterator for QueueSource {
    type Item = f32;

    fn next(&mut self) -> Option<f32> {
        let epoch = self.queue.epoch();
        if epoch != self.epoch {
            // Flushed since this block was pulled.
            self.epoch = epoch;
            self.block.clear();
            self.pos = 0;
        }
        if self.pos >= self.block.len() {
            self.refill();
        }
        let sample = self.block[self.pos];
        self.pos += 1;
        Some(i16_to_f32(sample))
    }
}

impl Source for QueueSource {
    fn current_frame_len(&self) -> Option<usize> {
        None
    }

    fn channels(&self) -> u16 {
        1
    }

    fn sample_rate(&self) -> u32 {
        self.queue.sample_rate()
    }

    fn total_duration(&self) -> Option<Duration> {
        None
    }
}

struct PlaybackWorker {
    stop_tx: std_mpsc::Sender<()>,
    thread: thread::JoinHandle<()>,
}

/// Owns the output device. `enqueue`/`stop` work whether or not the device is
/// open, so the queue semantics hold in headless runs too.
pub struct AudioPlaybackPipeline {
    queue: Arc<PlaybackQueue>,
    worker: Mutex<Option<PlaybackWorker>>,
}

impl AudioPlaybackPipeline {
    pub fn new(config: AudioConfig) -> Self {
        Self {
            queue: Arc::new(PlaybackQueue::new(config.sample_rate)),
            worker: Mutex::new(None),
        }
    }

    fn worker(&self) -> MutexGuard<'_, Option<PlaybackWorker>> {
        match self.worker.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Open the default output device. No-op when already open.
    pub fn start(&self) -> VoiceResult<()> {
        let mut worker = self.worker();
        if worker.is_some() {
            return Ok(());
        }

        info!(target: "callerpro::playback", "🔊 Opening audio output ({} Hz)", self.queue.sample_rate());

        let (ready_tx, ready_rx) = std_mpsc::sync_channel::<VoiceResult<()>>(1);
        let (stop_tx, stop_rx) = std_mpsc::channel::<()>();
        let queue = Arc::clone(&self.queue);

        // OutputStream is !Send; it lives and dies on this thread.
        let thread = thread::Builder::new()
            .name("callerpro-playback".to_string())
            .spawn(move || {
                let (_stream, handle) = match OutputStream::try_default() {
                    Ok(pair) => pair,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e.into()));
                        return;
                    }
                };
                let sink = match Sink::try_new(&handle) {
                    Ok(sink) => sink,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e.into()));
                        return;
                    }
                };
                sink.append(QueueSource::new(queue));
                let _ = ready_tx.send(Ok(()));
                let _ = stop_rx.recv();
                sink.stop();
                debug!(target: "callerpro::playback", "Output stream released");
            })?;

        match ready_rx.recv() {
            Ok(Ok(())) => {
                *worker = Some(PlaybackWorker { stop_tx, thread });
                info!(target: "callerpro::playback", "✅ Audio output ready");
                Ok(())
            }
            Ok(Err(e)) => {
                let _ = thread.join();
                warn!(target: "callerpro::playback", "Speaker unavailable: {}", e);
                Err(e)
            }
            Err(_) => {
                let _ = thread.join();
                Err(VoiceError::Device(
                    "playback thread exited before the device was ready".to_string(),
                ))
            }
        }
    }

    /// Schedule a chunk after everything already queued. Never blocks on the device.
    pub fn enqueue(&self, chunk: AudioChunk) {
        if chunk.is_empty() {
            return;
        }
        self.queue.push(chunk);
    }

    /// Halt playback now and discard all scheduled audio. The device stays
    /// open and plays whatever is enqueued afterwards.
    pub fn stop(&self) {
        let discarded = self.queue.flush();
        if discarded > 0 {
            info!(target: "callerpro::playback", discarded, "⏹️ Playback flushed");
        }
    }

    pub fn is_playing(&self) -> bool {
        self.queue.pending_samples() > 0
    }

    pub fn is_open(&self) -> bool {
        self.worker().is_some()
    }

    pub fn amplitude(&self) -> f32 {
        self.queue.amplitude()
    }

    /// Flush and release the output device.
    pub fn shutdown(&self) {
        self.stop();
        let worker = self.worker().take();
        if let Some(worker) = worker {
            let _ = worker.stop_tx.send(());
            if worker.thread.join().is_err() {
                warn!(target: "callerpro::playback", "Playback thread panicked");
            }
            info!(target: "callerpro::playback", "Audio output closed");
        }
    }
}

impl Drop for AudioPlaybackPipeline {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::OUTPUT_SAMPLE_RATE;

    fn pull(source: &mut QueueSource, n: usize) -> Vec<f32> {
        (0..n).map(|_| source.next().unwrap()).collect()
    }

    fn level(sample: i16, n: usize) -> Vec<f32> {
        vec![i16_to_f32(sample); n]
    }

    #[test]
    fn test_chunks_play_back_to_back() {
        let queue = Arc::new(PlaybackQueue::new(OUTPUT_SAMPLE_RATE));
        let mut source = QueueSource::new(Arc::clone(&queue));

        queue.push(AudioChunk::new(vec![1000; 100], OUTPUT_SAMPLE_RATE));
        queue.push(AudioChunk::new(vec![2000; 100], OUTPUT_SAMPLE_RATE));

        let played = pull(&mut source, 200);
        assert_eq!(played[..100], level(1000, 100)[..]);
        assert_eq!(played[100..], level(2000, 100)[..]);
    }

    #[test]
    fn test_silence_only_when_empty() {
        let queue = Arc::new(PlaybackQueue::new(OUTPUT_SAMPLE_RATE));
        let mut source = QueueSource::new(Arc::clone(&queue));

        assert_eq!(pull(&mut source, BLOCK_SAMPLES), level(0, BLOCK_SAMPLES));
        assert_eq!(queue.amplitude(), 0.0);

        queue.push(AudioChunk::new(vec![5000; 10], OUTPUT_SAMPLE_RATE));
        assert_eq!(pull(&mut source, 10), level(5000, 10));
        assert!(queue.amplitude() > 0.0);
    }

    #[test]
    fn test_flush_then_resume() {
        let queue = Arc::new(PlaybackQueue::new(OUTPUT_SAMPLE_RATE));
        let mut source = QueueSource::new(Arc::clone(&queue));

        queue.push(AudioChunk::new(vec![111; BLOCK_SAMPLES * 3], OUTPUT_SAMPLE_RATE));
        // Device has pulled part of the first block.
        assert_eq!(pull(&mut source, 5), level(111, 5));

        assert_eq!(queue.flush(), BLOCK_SAMPLES * 2);
        queue.push(AudioChunk::new(vec![222; 50], OUTPUT_SAMPLE_RATE));

        assert_eq!(pull(&mut source, 50), level(222, 50));
    }

    #[test]
    fn test_enqueue_resamples_to_output_clock() {
        let playback = AudioPlaybackPipeline::new(AudioConfig::playback());
        playback.enqueue(AudioChunk::new(vec![7; 160], 16000));
        assert_eq!(playback.queue.pending_samples(), 240);
        assert!(playback.is_playing());

        playback.stop();
        assert!(!playback.is_playing());
        assert_eq!(playback.amplitude(), 0.0);
    }

    #[test]
    fn test_headless_pipeline_is_closed() {
        let playback = AudioPlaybackPipeline::new(AudioConfig::playback());
        assert!(!playback.is_open());
        playback.stop();
        playback.shutdown();
        playback.enqueue(AudioChunk::new(Vec::new(), OUTPUT_SAMPLE_RATE));
        assert!(!playback.is_playing());
    }

    #[test]
    #[ignore] // Requires an output device
    fn test_open_and_close_device() {
        let playback = AudioPlaybackPipeline::new(AudioConfig::playback());
        playback.start().expect("speaker");
        assert!(playback.is_open());
        playback.enqueue(AudioChunk::new(vec![0; 2400], OUTPUT_SAMPLE_RATE));
        std::thread::sleep(Duration::from_millis(200));
        playback.shutdown();
        assert!(!playback.is_open());
    }
}
