//! Audio formats shared by the capture and playback pipelines
//!
//! Everything exchanged with the live session is mono 16-bit linear PCM.
//! Capture runs at 16 kHz, the agent's voice arrives at 24 kHz.

use crate::error::{VoiceError, VoiceResult};

/// Sample rate the remote service expects for microphone audio.
pub const INPUT_SAMPLE_RATE: u32 = 16_000;

/// Sample rate of the agent's synthesized voice.
pub const OUTPUT_SAMPLE_RATE: u32 = 24_000;

/// Audio configuration for a pipeline
#[derive(Debug, Clone)]
pub struct AudioConfig {
    /// Sample rate in Hz of the PCM exchanged with the session
    pub sample_rate: u32,

    /// Number of channels (always 1 on the session side)
    pub channels: u16,
}

impl AudioConfig {
    /// Microphone side: 16 kHz mono.
    pub fn capture() -> Self {
        Self {
            sample_rate: INPUT_SAMPLE_RATE,
            channels: 1,
        }
    }

    /// Speaker side: 24 kHz mono.
    pub fn playback() -> Self {
        Self {
            sample_rate: OUTPUT_SAMPLE_RATE,
            channels: 1,
        }
    }
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self::capture()
    }
}

/// A buffer of mono 16-bit PCM plus its sample rate.
///
/// Ownership moves with the chunk; producers build a fresh buffer for every
/// emit.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioChunk {
    pub samples: Vec<i16>,
    pub sample_rate: u32,
}

impl AudioChunk {
    pub fn new(samples: Vec<i16>, sample_rate: u32) -> Self {
        Self {
            samples,
            sample_rate,
        }
    }

    /// Decode little-endian 16-bit PCM bytes.
    pub fn from_le_bytes(bytes: &[u8], sample_rate: u32) -> VoiceResult<Self> {
        if bytes.len() % 2 != 0 {
            return Err(VoiceError::Protocol(format!(
                "PCM payload has odd length {}",
                bytes.len()
            )));
        }
        let samples = bytes
            .chunks_exact(2)
            .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
            .collect();
        Ok(Self::new(samples, sample_rate))
    }

    /// Encode as little-endian 16-bit PCM bytes.
    pub fn to_le_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.samples.len() * 2);
        for s in &self.samples {
            out.extend_from_slice(&s.to_le_bytes());
        }
        out
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// Playback length of the chunk.
    pub fn duration(&self) -> std::time::Duration {
        if self.sample_rate == 0 {
            return std::time::Duration::ZERO;
        }
        std::time::Duration::from_secs_f64(self.samples.len() as f64 / self.sample_rate as f64)
    }

    /// Same audio at another rate. Returns `self` untouched when the rates match.
    pub fn resampled(self, target_rate: u32) -> Self {
        if self.sample_rate == target_rate || self.sample_rate == 0 {
            return self;
        }
        let samples = resample_linear(&self.samples, self.sample_rate, target_rate);
        Self::new(samples, target_rate)
    }
}

/// Convert a normalized float sample to 16-bit PCM, clamping out-of-range input.
pub fn f32_to_i16(sample: f32) -> i16 {
    let clamped = sample.clamp(-1.0, 1.0);
    if clamped < 0.0 {
        (clamped * 32768.0) as i16
    } else {
        (clamped * 32767.0) as i16
    }
}

pub fn i16_to_f32(sample: i16) -> f32 {
    if sample < 0 {
        sample as f32 / 32768.0
    } else {
        sample as f32 / 32767.0
    }
}

/// Average interleaved frames down to one channel.
pub fn downmix(samples: &[f32], channels: usize) -> Vec<f32> {
    if channels <= 1 {
        return samples.to_vec();
    }
    samples
        .chunks_exact(channels)
        .map(|frame| frame.iter().sum::<f32>() / channels as f32)
        .collect()
}

/// Linear-interpolation resampler for mono 16-bit PCM.
pub fn resample_linear(samples: &[i16], from_rate: u32, to_rate: u32) -> Vec<i16> {
    if from_rate == to_rate || samples.is_empty() || from_rate == 0 || to_rate == 0 {
        return samples.to_vec();
    }
    let out_len = (samples.len() as u64 * to_rate as u64 / from_rate as u64) as usize;
    let step = from_rate as f64 / to_rate as f64;
    let last = samples.len() - 1;
    let mut out = Vec::with_capacity(out_len);
    for i in 0..out_len {
        let pos = i as f64 * step;
        let idx = pos as usize;
        if idx >= last {
            out.push(samples[last]);
            continue;
        }
        let frac = pos - idx as f64;
        let a = samples[idx] as f64;
        let b = samples[idx + 1] as f64;
        out.push((a + (b - a) * frac).round() as i16);
    }
    out
}

/// Linear-interpolation resampler for a continuous stream delivered in blocks.
///
/// Output positions are tracked as exact source offsets across calls, and the
/// last sample of each block is held back so the next block interpolates
/// across the seam. Feeding a signal block by block yields the same samples as
/// feeding it whole.
#[derive(Debug, Clone)]
pub struct StreamResampler {
    from_rate: u32,
    to_rate: u32,
    /// Source samples fed so far.
    consumed: u64,
    /// Output samples produced so far.
    emitted: u64,
    /// Last source sample seen, at index `consumed - 1`.
    last: Option<i16>,
}

impl StreamResampler {
    pub fn new(from_rate: u32, to_rate: u32) -> Self {
        Self {
            from_rate,
            to_rate,
            consumed: 0,
            emitted: 0,
            last: None,
        }
    }

    pub fn output_rate(&self) -> u32 {
        self.to_rate
    }

    pub fn is_passthrough(&self) -> bool {
        self.from_rate == self.to_rate || self.from_rate == 0 || self.to_rate == 0
    }

    /// Forget the stream so far. The next block starts a new signal.
    pub fn reset(&mut self) {
        self.consumed = 0;
        self.emitted = 0;
        self.last = None;
    }

    /// Resample the next block of the stream, appending to `out`.
    pub fn process_into(&mut self, block: &[i16], out: &mut Vec<i16>) {
        if self.is_passthrough() {
            out.extend_from_slice(block);
            return;
        }
        if block.is_empty() {
            return;
        }

        let from = self.from_rate as u64;
        let to = self.to_rate as u64;
        let consumed = self.consumed;
        let held = self.last;
        let available = consumed + block.len() as u64;
        // Source sample at an absolute index; `consumed - 1` is the held sample.
        let at = |idx: u64| -> Option<f64> {
            if idx >= consumed {
                block.get((idx - consumed) as usize).map(|&s| s as f64)
            } else if idx + 1 == consumed {
                held.map(|s| s as f64)
            } else {
                None
            }
        };

        loop {
            let num = self.emitted * from;
            let idx = num / to;
            if idx + 1 >= available {
                break;
            }
            let (Some(a), Some(b)) = (at(idx), at(idx + 1)) else {
                break;
            };
            let frac = (num % to) as f64 / to as f64;
            out.push((a + (b - a) * frac).round() as i16);
            self.emitted += 1;
        }

        self.consumed = available;
        self.last = block.last().copied();
    }

    pub fn process(&mut self, block: &[i16]) -> Vec<i16> {
        let mut out = Vec::with_capacity(
            (block.len() as u64 * self.to_rate.max(1) as u64 / self.from_rate.max(1) as u64) as usize + 1,
        );
        self.process_into(block, &mut out);
        out
    }
}

/// Interleaved device frames into one block of mono 16-bit PCM at the
/// resampler's output rate.
pub fn frames_to_mono_pcm16(samples: &[f32], channels: usize, resampler: &mut StreamResampler) -> Vec<i16> {
    if channels == 0 || samples.is_empty() {
        return Vec::new();
    }
    let mono: Vec<i16> = downmix(samples, channels)
        .into_iter()
        .map(f32_to_i16)
        .collect();
    resampler.process(&mono)
}

/// Root-mean-square level of a block of samples, in 0.0..=1.0.
pub fn rms(samples: &[i16]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum: f64 = samples
        .iter()
        .map(|&s| {
            let v = i16_to_f32(s) as f64;
            v * v
        })
        .sum();
    (sum / samples.len() as f64).sqrt() as f32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_audio_config_defaults() {
        let config = AudioConfig::default();
        assert_eq!(config.sample_rate, 16000);
        assert_eq!(config.channels, 1);
        assert_eq!(AudioConfig::playback().sample_rate, 24000);
    }

    #[test]
    fn test_le_bytes_decode() {
        let chunk = AudioChunk::from_le_bytes(&[0x01, 0x00, 0xff, 0xff], 24000).unwrap();
        assert_eq!(chunk.samples, vec![1, -1]);
        assert_eq!(chunk.sample_rate, 24000);
        assert_eq!(chunk.to_le_bytes(), vec![0x01, 0x00, 0xff, 0xff]);
    }

    #[test]
    fn test_odd_payload_rejected() {
        let err = AudioChunk::from_le_bytes(&[0x01, 0x00, 0x02], 16000).unwrap_err();
        assert!(matches!(err, VoiceError::Protocol(_)));
    }

    #[test]
    fn test_float_conversion_clamps() {
        assert_eq!(f32_to_i16(1.5), i16::MAX);
        assert_eq!(f32_to_i16(-1.5), i16::MIN);
        assert_eq!(f32_to_i16(0.0), 0);
    }

    #[test]
    fn test_downmix_stereo() {
        let mono = downmix(&[0.5, -0.5, 1.0, 0.0], 2);
        assert_eq!(mono, vec![0.0, 0.5]);
    }

    #[test]
    fn test_resample_lengths() {
        let input = vec![100i16; 480];
        assert_eq!(resample_linear(&input, 48000, 16000).len(), 160);
        assert_eq!(resample_linear(&input, 16000, 24000).len(), 720);
        assert!(resample_linear(&input, 16000, 24000).iter().all(|&s| s == 100));
    }

    #[test]
    fn test_resample_interpolates() {
        let out = resample_linear(&[0, 100], 1, 2);
        assert_eq!(out, vec![0, 50, 100, 100]);
    }

    #[test]
    fn test_device_frames_to_session_format() {
        let mut resampler = StreamResampler::new(48000, INPUT_SAMPLE_RATE);
        let frames = vec![0.25f32; 48000 * 2 / 100]; // 10ms stereo at 48kHz
        let mut pcm = frames_to_mono_pcm16(&frames, 2, &mut resampler);
        pcm.extend(frames_to_mono_pcm16(&frames, 2, &mut resampler));
        // The last source sample is held back until the next block arrives.
        assert_eq!(pcm.len(), 320);
        assert!(pcm.iter().all(|&s| s == f32_to_i16(0.25)));
    }

    #[test]
    fn test_stream_resampler_blocks_match_whole_buffer() {
        let signal: Vec<i16> = (0..44100).map(|i| ((i * 37) % 2000) as i16 - 1000).collect();

        let mut whole = StreamResampler::new(44100, 16000);
        let expected = whole.process(&signal);
        assert_eq!(expected.len(), 16000);

        let mut blockwise = StreamResampler::new(44100, 16000);
        let mut out = Vec::new();
        for block in signal.chunks(512) {
            blockwise.process_into(block, &mut out);
        }
        assert_eq!(out.len(), expected.len());
        assert_eq!(out, expected);
    }

    #[test]
    fn test_stream_resampler_has_no_seams() {
        // A ramp stays a ramp when it arrives in odd-sized blocks.
        let ramp: Vec<i16> = (0..4410).map(|i| (i * 5) as i16).collect();
        let mut resampler = StreamResampler::new(44100, 16000);
        let mut out = Vec::new();
        for block in ramp.chunks(333) {
            resampler.process_into(block, &mut out);
        }
        for (k, &s) in out.iter().enumerate() {
            let exact = k as f64 * 44100.0 / 16000.0 * 5.0;
            assert!((s as f64 - exact).abs() <= 0.5 + 1e-6, "sample {} was {} not {}", k, s, exact);
        }
    }

    #[test]
    fn test_stream_resampler_reset_and_passthrough() {
        let mut same = StreamResampler::new(16000, 16000);
        assert!(same.is_passthrough());
        assert_eq!(same.process(&[1, 2, 3]), vec![1, 2, 3]);

        let mut resampler = StreamResampler::new(2, 1);
        assert_eq!(resampler.process(&[10, 20, 30, 40]), vec![10, 30]);
        resampler.reset();
        assert_eq!(resampler.process(&[50, 60, 70]), vec![50]);
    }

    #[test]
    fn test_rms_levels() {
        assert_eq!(rms(&[]), 0.0);
        assert_eq!(rms(&[0, 0, 0]), 0.0);
        let full = rms(&[i16::MAX, i16::MIN]);
        assert!((full - 1.0).abs() < 1e-3);
    }

    #[test]
    fn test_chunk_duration() {
        let chunk = AudioChunk::new(vec![0; 2400], OUTPUT_SAMPLE_RATE);
        assert_eq!(chunk.duration().as_millis(), 100);
    }
}
