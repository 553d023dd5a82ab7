//! Alert tone playback through the default output device (`cpal`).
//!
//! Each `play` call opens a short-lived output stream on its own thread and
//! invokes the completion callback once the last sample has been rendered.

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{FromSample, Sample, SizedSample};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};
use std::time::{Duration, Instant};
use thiserror::Error;

/// Sample rate the synthesized tone is generated at.
const TONE_SAMPLE_RATE: u32 = 48_000;
/// Warning pattern: (frequency Hz, duration ms), silence between notes.
const WARNING_PATTERN: [(f32, u32); 3] = [(880.0, 220), (660.0, 220), (880.0, 320)];
const WARNING_GAP_MS: u32 = 60;
const WARNING_AMPLITUDE: f32 = 0.35;
/// Fade in/out per note, avoids clicks at note boundaries.
const FADE_MS: u32 = 8;
/// Slack added to the expected duration before giving up on completion.
const DRAIN_GRACE: Duration = Duration::from_millis(1000);

#[derive(Error, Debug)]
pub enum AudioError {
    #[error("no default output device found")]
    NoOutputDevice,
    #[error("failed to open output stream: {0}")]
    StreamOpenFailed(String),
    #[error("unsupported output sample format: {0}")]
    UnsupportedFormat(String),
    #[error("failed to read WAV file: {0}")]
    Wav(String),
    #[error("playback thread exited")]
    ThreadExited,
}

/// A mono alert sound held in memory.
#[derive(Debug, Clone)]
pub struct AlertTone {
    samples: Arc<Vec<f32>>,
    sample_rate: u32,
}

impl AlertTone {
    /// Synthesize the built-in three-note warning beep.
    pub fn warning() -> Self {
        let mut samples = Vec::new();
        let gap = (TONE_SAMPLE_RATE * WARNING_GAP_MS / 1000) as usize;
        for (i, &(freq, ms)) in WARNING_PATTERN.iter().enumerate() {
            if i > 0 {
                samples.extend(std::iter::repeat(0.0).take(gap));
            }
            samples.extend(sine_note(freq, ms, TONE_SAMPLE_RATE));
        }
        Self {
            samples: Arc::new(samples),
            sample_rate: TONE_SAMPLE_RATE,
        }
    }

    /// Load a WAV file, mixing all channels down to mono.
    pub fn from_wav(path: &Path) -> Result<Self, AudioError> {
        let mut reader = hound::WavReader::open(path)
            .map_err(|e| AudioError::Wav(format!("{}: {e}", path.display())))?;
        let spec = reader.spec();
        let interleaved: Vec<f32> = match spec.sample_format {
            hound::SampleFormat::Float => reader
                .samples::<f32>()
                .collect::<Result<_, _>>()
                .map_err(|e| AudioError::Wav(e.to_string()))?,
            hound::SampleFormat::Int => {
                let scale = (1i64 << (spec.bits_per_sample.saturating_sub(1))) as f32;
                reader
                    .samples::<i32>()
                    .map(|s| s.map(|v| v as f32 / scale))
                    .collect::<Result<_, _>>()
                    .map_err(|e| AudioError::Wav(e.to_string()))?
            }
        };

        let channels = spec.channels.max(1) as usize;
        let samples = interleaved
            .chunks(channels)
            .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32)
            .collect();

        tracing::info!(
            path = %path.display(),
            sample_rate = spec.sample_rate,
            channels = spec.channels,
            "loaded alert sound"
        );

        Ok(Self {
            samples: Arc::new(samples),
            sample_rate: spec.sample_rate,
        })
    }

    /// Playback length at the tone's native rate.
    pub fn duration(&self) -> Duration {
        if self.sample_rate == 0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(self.samples.len() as f64 / self.sample_rate as f64)
    }

    /// Play the tone on the default output device.
    ///
    /// Returns once the stream is running; `on_end` is called from the
    /// playback thread after the last sample was rendered. If the stream
    /// cannot be opened the error is returned and `on_end` is never called.
    pub fn play<F>(&self, on_end: F) -> Result<(), AudioError>
    where
        F: FnOnce() + Send + 'static,
    {
        let tone = self.clone();
        let (ready_tx, ready_rx) = mpsc::channel::<Result<(), AudioError>>();

        std::thread::Builder::new()
            .name("touchguard-alert".into())
            .spawn(move || {
                let (stream, finished, expected) = match tone.open_stream() {
                    Ok(parts) => parts,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                let _ = ready_tx.send(Ok(()));

                let deadline = Instant::now() + expected + DRAIN_GRACE;
                while !finished.load(Ordering::Acquire) && Instant::now() < deadline {
                    std::thread::sleep(Duration::from_millis(20));
                }
                drop(stream);
                tracing::debug!("alert sound finished");
                on_end();
            })
            .map_err(|e| AudioError::StreamOpenFailed(format!("failed to spawn thread: {e}")))?;

        ready_rx.recv().map_err(|_| AudioError::ThreadExited)?
    }

    fn open_stream(&self) -> Result<(cpal::Stream, Arc<AtomicBool>, Duration), AudioError> {
        let host = cpal::default_host();
        let device = host
            .default_output_device()
            .ok_or(AudioError::NoOutputDevice)?;

        let config = device
            .default_output_config()
            .map_err(|e| AudioError::StreamOpenFailed(format!("default output config: {e:?}")))?;

        let stream_config: cpal::StreamConfig = config.clone().into();
        let device_rate = stream_config.sample_rate.0;

        let samples = Arc::new(resample_linear(&self.samples, self.sample_rate, device_rate));
        let expected = Duration::from_secs_f64(samples.len() as f64 / device_rate.max(1) as f64);
        let finished = Arc::new(AtomicBool::new(false));

        let stream = match config.sample_format() {
            cpal::SampleFormat::I8 => build_stream::<i8>(&device, &stream_config, samples, &finished),
            cpal::SampleFormat::I16 => build_stream::<i16>(&device, &stream_config, samples, &finished),
            cpal::SampleFormat::I32 => build_stream::<i32>(&device, &stream_config, samples, &finished),
            cpal::SampleFormat::U8 => build_stream::<u8>(&device, &stream_config, samples, &finished),
            cpal::SampleFormat::U16 => build_stream::<u16>(&device, &stream_config, samples, &finished),
            cpal::SampleFormat::U32 => build_stream::<u32>(&device, &stream_config, samples, &finished),
            cpal::SampleFormat::F32 => build_stream::<f32>(&device, &stream_config, samples, &finished),
            cpal::SampleFormat::F64 => build_stream::<f64>(&device, &stream_config, samples, &finished),
            other => Err(AudioError::UnsupportedFormat(format!("{other:?}"))),
        }?;

        stream
            .play()
            .map_err(|e| AudioError::StreamOpenFailed(format!("{e:?}")))?;

        Ok((stream, finished, expected))
    }
}

/// Output stream in the device's native sample type `T`.
fn build_stream<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    samples: Arc<Vec<f32>>,
    finished: &Arc<AtomicBool>,
) -> Result<cpal::Stream, AudioError>
where
    T: SizedSample + FromSample<f32>,
{
    let channels = config.channels as usize;
    let position = AtomicUsize::new(0);
    let finished = Arc::clone(finished);
    let err_fn = |err: cpal::StreamError| tracing::warn!(error = %err, "alert output stream error");

    device
        .build_output_stream(
            config,
            move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
                let start = position.load(Ordering::Relaxed);
                let pos = fill_frames(data, channels, &samples, start);
                position.store(pos, Ordering::Relaxed);
                if pos >= samples.len() {
                    finished.store(true, Ordering::Release);
                }
            },
            err_fn,
            None,
        )
        .map_err(|e| AudioError::StreamOpenFailed(format!("{e:?}")))
}

/// Write mono `samples` from `position` into interleaved `data`, copying
/// each sample to every channel and padding with silence past the end.
/// Returns the position after the written frames.
fn fill_frames<T>(data: &mut [T], channels: usize, samples: &[f32], position: usize) -> usize
where
    T: Sample + FromSample<f32>,
{
    let mut pos = position;
    for frame in data.chunks_mut(channels.max(1)) {
        let value = T::from_sample(samples.get(pos).copied().unwrap_or(0.0));
        frame.iter_mut().for_each(|s| *s = value);
        pos += 1;
    }
    pos
}

/// One sine note with a short linear fade at both ends.
fn sine_note(freq: f32, duration_ms: u32, sample_rate: u32) -> Vec<f32> {
    let len = (sample_rate * duration_ms / 1000) as usize;
    let fade = ((sample_rate * FADE_MS / 1000) as usize).min(len / 2).max(1);
    (0..len)
        .map(|i| {
            let t = i as f32 / sample_rate as f32;
            let envelope = (i.min(len - 1 - i) as f32 / fade as f32).min(1.0);
            (2.0 * std::f32::consts::PI * freq * t).sin() * WARNING_AMPLITUDE * envelope
        })
        .collect()
}

/// Linear-interpolation resampler, good enough for a short alert sound.
fn resample_linear(input: &[f32], from_rate: u32, to_rate: u32) -> Vec<f32> {
    if from_rate == to_rate || from_rate == 0 || to_rate == 0 || input.is_empty() {
        return input.to_vec();
    }
    let ratio = from_rate as f64 / to_rate as f64;
    let out_len = ((input.len() as f64) / ratio).round() as usize;
    (0..out_len)
        .map(|i| {
            let src = i as f64 * ratio;
            let idx = src.floor() as usize;
            let frac = (src - idx as f64) as f32;
            let a = input[idx.min(input.len() - 1)];
            let b = input[(idx + 1).min(input.len() - 1)];
            a + (b - a) * frac
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_warning_tone_length() {
        let tone = AlertTone::warning();
        let notes_ms: u32 = WARNING_PATTERN.iter().map(|&(_, ms)| ms).sum();
        let total_ms = notes_ms + WARNING_GAP_MS * (WARNING_PATTERN.len() as u32 - 1);
        let expected = Duration::from_millis(total_ms as u64);
        let diff = tone.duration().as_secs_f64() - expected.as_secs_f64();
        assert!(diff.abs() < 0.001, "duration {:?}", tone.duration());
    }

    #[test]
    fn test_warning_tone_amplitude_bounded() {
        let tone = AlertTone::warning();
        assert!(tone.samples.iter().all(|s| s.abs() <= WARNING_AMPLITUDE + 1e-6));
        // Faded edges start at silence
        assert!(tone.samples[0].abs() < 1e-3);
    }

    #[test]
    fn test_resample_identity() {
        let input = vec![0.1, 0.2, 0.3];
        assert_eq!(resample_linear(&input, 48_000, 48_000), input);
    }

    #[test]
    fn test_resample_halves_length() {
        let input: Vec<f32> = (0..100).map(|i| i as f32).collect();
        let out = resample_linear(&input, 48_000, 24_000);
        assert_eq!(out.len(), 50);
        assert!((out[10] - 20.0).abs() < 1e-4);
    }

    #[test]
    fn test_from_wav_roundtrip_mono_mix() {
        let dir = std::env::temp_dir().join(format!("touchguard-wav-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("alert.wav");

        let spec = hound::WavSpec {
            channels: 2,
            sample_rate: 8_000,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut writer = hound::WavWriter::create(&path, spec).unwrap();
        for _ in 0..80 {
            writer.write_sample(16_384i16).unwrap();
            writer.write_sample(0i16).unwrap();
        }
        writer.finalize().unwrap();

        let tone = AlertTone::from_wav(&path).unwrap();
        assert_eq!(tone.sample_rate, 8_000);
        assert_eq!(tone.samples.len(), 80);
        // (0.5 + 0.0) / 2
        assert!((tone.samples[0] - 0.25).abs() < 1e-3);

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_fill_frames_integer_output() {
        let samples = [0.5, -0.5];
        let mut data = [0i16; 6];
        let pos = fill_frames(&mut data, 2, &samples, 0);
        assert_eq!(pos, 3);
        assert_eq!(data[0], data[1]);
        assert!((data[0] - 16_384).abs() <= 1, "got {}", data[0]);
        assert!((data[2] + 16_384).abs() <= 1, "got {}", data[2]);
        assert_eq!(&data[4..], &[0, 0]);
    }

    #[test]
    fn test_fill_frames_unsigned_silence_is_midpoint() {
        let mut data = [0u16; 4];
        let pos = fill_frames(&mut data, 1, &[0.0], 0);
        assert_eq!(pos, 4);
        assert!(data.iter().all(|&s| s == 32_768));
    }

    #[test]
    fn test_fill_frames_resumes_mid_buffer() {
        let samples = [0.1, 0.2, 0.3];
        let mut data = [0.0f32; 2];
        assert_eq!(fill_frames(&mut data, 1, &samples, 1), 3);
        assert_eq!(data, [0.2, 0.3]);
    }

    #[test]
    fn test_from_wav_missing_file() {
        let result = AlertTone::from_wav(Path::new("/nonexistent/alert.wav"));
        assert!(matches!(result, Err(AudioError::Wav(_))));
    }
}
