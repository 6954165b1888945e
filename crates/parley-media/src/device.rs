//! Local voice gateway over the host microphone and speakers (cpal).
//!
//! Room and channel ids are accepted for interface parity and ignored.
//! Inbound audio is delivered as 48kHz mono s16le PCM; outbound frames
//! are expected as 48kHz stereo s16le.

use std::collections::VecDeque;
use std::sync::mpsc as std_mpsc;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use cpal::StreamConfig;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use parley_core::audio_format::SAMPLE_RATE;
use parley_core::config::VoiceConfig;
use parley_core::error::{ParleyError, Result};

use crate::audio::{InboundAudio, PlayerEvent, VoiceConnection, VoiceGateway};

pub struct LocalVoiceGateway {
    input_device: Option<String>,
    output_device: Option<String>,
}

impl LocalVoiceGateway {
    pub fn new(config: &VoiceConfig) -> Self {
        Self {
            input_device: config.input_device.clone(),
            output_device: config.output_device.clone(),
        }
    }
}

#[async_trait]
impl VoiceGateway for LocalVoiceGateway {
    async fn join(&self, room_id: &str, channel_id: &str) -> Result<Arc<dyn VoiceConnection>> {
        debug!(room_id, channel_id, "Joining local audio devices");
        let input = self.input_device.clone();
        let output = self.output_device.clone();

        // Device probing can block on some hosts
        tokio::task::spawn_blocking(move || -> anyhow::Result<()> {
            find_input(input.as_deref())?;
            find_output(output.as_deref())?;
            Ok(())
        })
        .await
        .map_err(|e| ParleyError::ConnectionNotReady(format!("device probe panicked: {e}")))?
        .map_err(|e| ParleyError::ConnectionNotReady(e.to_string()))?;

        Ok(Arc::new(LocalConnection {
            input_device: self.input_device.clone(),
            output_device: self.output_device.clone(),
            stops: Mutex::new(Vec::new()),
        }))
    }
}

struct LocalConnection {
    input_device: Option<String>,
    output_device: Option<String>,
    /// Dropping a sender stops the matching stream thread.
    stops: Mutex<Vec<std_mpsc::Sender<()>>>,
}

impl LocalConnection {
    fn register_stop(&self) -> Result<std_mpsc::Receiver<()>> {
        let (tx, rx) = std_mpsc::channel();
        self.stops
            .lock()
            .map_err(|_| ParleyError::Playback("device registry poisoned".into()))?
            .push(tx);
        Ok(rx)
    }
}

impl VoiceConnection for LocalConnection {
    fn subscribe(&self, participant_id: &str) -> Result<mpsc::UnboundedReceiver<InboundAudio>> {
        let (tx, rx) = mpsc::unbounded_channel();
        let stop = self.register_stop()?;
        let device = self.input_device.clone();
        info!(participant = participant_id, "Subscribing to local microphone");

        std::thread::Builder::new()
            .name("parley-capture".into())
            .spawn(move || {
                if let Err(e) = run_capture(device.as_deref(), &tx, &stop) {
                    error!("microphone capture failed: {e:#}");
                    let _ = tx.send(InboundAudio::Error(e.to_string()));
                }
            })?;
        Ok(rx)
    }

    fn play(
        &self,
        frames: mpsc::UnboundedReceiver<Vec<u8>>,
    ) -> Result<mpsc::UnboundedReceiver<PlayerEvent>> {
        let (tx, rx) = mpsc::unbounded_channel();
        let stop = self.register_stop()?;
        let device = self.output_device.clone();

        std::thread::Builder::new()
            .name("parley-playback".into())
            .spawn(move || {
                if let Err(e) = run_playback(device.as_deref(), frames, &tx, &stop) {
                    error!("speaker playback failed: {e:#}");
                    let _ = tx.send(PlayerEvent::Error(e.to_string()));
                }
            })?;
        Ok(rx)
    }

    fn disconnect(&self) {
        if let Ok(mut stops) = self.stops.lock() {
            if !stops.is_empty() {
                debug!(streams = stops.len(), "Stopping local audio streams");
            }
            stops.clear();
        }
    }
}

fn find_input(name: Option<&str>) -> anyhow::Result<cpal::Device> {
    let host = cpal::default_host();
    match name {
        Some(name) => host
            .input_devices()
            .context("cannot enumerate input devices")?
            .find(|d| d.description().ok().is_some_and(|desc| desc.name() == name))
            .with_context(|| format!("input device '{name}' not found")),
        None => host
            .default_input_device()
            .context("no default input device"),
    }
}

fn find_output(name: Option<&str>) -> anyhow::Result<cpal::Device> {
    let host = cpal::default_host();
    match name {
        Some(name) => host
            .output_devices()
            .context("cannot enumerate output devices")?
            .find(|d| d.description().ok().is_some_and(|desc| desc.name() == name))
            .with_context(|| format!("output device '{name}' not found")),
        None => host
            .default_output_device()
            .context("no default output device"),
    }
}

/// Hold an input stream open until `stop` disconnects.
fn run_capture(
    device_name: Option<&str>,
    tx: &mpsc::UnboundedSender<InboundAudio>,
    stop: &std_mpsc::Receiver<()>,
) -> anyhow::Result<()> {
    let device = find_input(device_name)?;
    let default_config = device
        .default_input_config()
        .context("no default input config")?;
    let native_rate = default_config.sample_rate();
    let native_channels = default_config.channels();
    let stream_config = StreamConfig {
        channels: native_channels,
        sample_rate: native_rate,
        buffer_size: cpal::BufferSize::Default,
    };

    let data_tx = tx.clone();
    let error_tx = tx.clone();
    let stream = device
        .build_input_stream(
            &stream_config,
            move |data: &[f32], _info: &cpal::InputCallbackInfo| {
                let mono = to_mono(data, native_channels);
                let samples = resample(&mono, native_rate, SAMPLE_RATE);
                let _ = data_tx.send(InboundAudio::Packet(to_s16le(&samples)));
            },
            move |err| {
                let _ = error_tx.send(InboundAudio::Error(err.to_string()));
            },
            None,
        )
        .context("failed to build input stream")?;
    stream.play().context("failed to start input stream")?;
    info!(native_rate, native_channels, "Microphone capture started");

    // Blocks until the connection drops our stop sender
    let _ = stop.recv();
    drop(stream);
    info!("Microphone capture stopped");
    Ok(())
}

struct PlaybackBuffer {
    frames: VecDeque<[f32; 2]>,
    closed: bool,
}

/// Feed stereo s16le frames to the output device until input closes and drains.
fn run_playback(
    device_name: Option<&str>,
    mut frames: mpsc::UnboundedReceiver<Vec<u8>>,
    tx: &mpsc::UnboundedSender<PlayerEvent>,
    stop: &std_mpsc::Receiver<()>,
) -> anyhow::Result<()> {
    let device = find_output(device_name)?;
    let default_config = device
        .default_output_config()
        .context("no default output config")?;
    let native_rate = default_config.sample_rate();
    let native_channels = default_config.channels() as usize;
    let stream_config = StreamConfig {
        channels: default_config.channels(),
        sample_rate: native_rate,
        buffer_size: cpal::BufferSize::Default,
    };

    let buffer = Arc::new(Mutex::new(PlaybackBuffer {
        frames: VecDeque::new(),
        closed: false,
    }));
    let callback_buffer = Arc::clone(&buffer);
    let error_tx = tx.clone();

    let stream = device
        .build_output_stream(
            &stream_config,
            move |data: &mut [f32], _info: &cpal::OutputCallbackInfo| {
                let Ok(mut buf) = callback_buffer.lock() else {
                    return;
                };
                for out in data.chunks_mut(native_channels) {
                    let [left, right] = buf.frames.pop_front().unwrap_or([0.0, 0.0]);
                    match out.len() {
                        1 => out[0] = (left + right) / 2.0,
                        _ => {
                            out[0] = left;
                            out[1] = right;
                            for extra in &mut out[2..] {
                                *extra = 0.0;
                            }
                        }
                    }
                }
            },
            move |err| {
                let _ = error_tx.send(PlayerEvent::Error(err.to_string()));
            },
            None,
        )
        .context("failed to build output stream")?;
    stream.play().context("failed to start output stream")?;
    let _ = tx.send(PlayerEvent::Playing);

    while let Some(bytes) = frames.blocking_recv() {
        if bytes.len() % 4 != 0 {
            warn!(len = bytes.len(), "Dropping partial stereo frame");
            continue;
        }
        let (left, right): (Vec<f32>, Vec<f32>) = bytes
            .chunks_exact(4)
            .map(|f| {
                (
                    i16::from_le_bytes([f[0], f[1]]) as f32 / 32768.0,
                    i16::from_le_bytes([f[2], f[3]]) as f32 / 32768.0,
                )
            })
            .unzip();
        let left = resample(&left, SAMPLE_RATE, native_rate);
        let right = resample(&right, SAMPLE_RATE, native_rate);
        if let Ok(mut buf) = buffer.lock() {
            buf.frames.extend(left.into_iter().zip(right).map(|(l, r)| [l, r]));
        }
    }

    if let Ok(mut buf) = buffer.lock() {
        buf.closed = true;
    }

    loop {
        std::thread::sleep(Duration::from_millis(10));
        if matches!(stop.try_recv(), Err(std_mpsc::TryRecvError::Disconnected)) {
            debug!("Playback stopped by disconnect");
            break;
        }
        let drained = buffer
            .lock()
            .map(|buf| buf.closed && buf.frames.is_empty())
            .unwrap_or(true);
        if drained {
            break;
        }
    }

    drop(stream);
    let _ = tx.send(PlayerEvent::Idle);
    Ok(())
}

/// Average interleaved channels down to mono.
fn to_mono(data: &[f32], channels: u16) -> Vec<f32> {
    if channels <= 1 {
        return data.to_vec();
    }
    let ch = channels as usize;
    data.chunks_exact(ch)
        .map(|frame| frame.iter().sum::<f32>() / ch as f32)
        .collect()
}

/// Linear-interpolation resampler.
fn resample(samples: &[f32], src_rate: u32, dst_rate: u32) -> Vec<f32> {
    if src_rate == dst_rate || samples.is_empty() {
        return samples.to_vec();
    }

    let ratio = src_rate as f64 / dst_rate as f64;
    let out_len = ((samples.len() as f64) / ratio).round() as usize;
    (0..out_len)
        .map(|i| {
            let pos = i as f64 * ratio;
            let idx = pos as usize;
            let frac = (pos - idx as f64) as f32;
            let a = samples[idx.min(samples.len() - 1)];
            let b = samples[(idx + 1).min(samples.len() - 1)];
            a + (b - a) * frac
        })
        .collect()
}

fn to_s16le(samples: &[f32]) -> Vec<u8> {
    samples
        .iter()
        .flat_map(|s| ((s.clamp(-1.0, 1.0) * i16::MAX as f32) as i16).to_le_bytes())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_to_mono_averages() {
        assert_eq!(to_mono(&[0.25, 0.75, -1.0, 1.0], 2), vec![0.5, 0.0]);
        assert_eq!(to_mono(&[0.5], 1), vec![0.5]);
    }

    #[test]
    fn test_resample_lengths() {
        let input = vec![0.0f32; 441];
        assert_eq!(resample(&input, 44_100, 48_000).len(), 480);
        assert_eq!(resample(&vec![0.0f32; 480], 48_000, 16_000).len(), 160);
        assert_eq!(resample(&[0.25, 0.5], 48_000, 48_000), vec![0.25, 0.5]);
    }

    #[test]
    fn test_resample_interpolates() {
        let out = resample(&[0.0, 1.0], 2, 4);
        assert_eq!(out.len(), 4);
        assert!((out[1] - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_to_s16le_clamps() {
        let bytes = to_s16le(&[2.0, -2.0, 0.0]);
        let samples: Vec<i16> = bytes
            .chunks_exact(2)
            .map(|c| i16::from_le_bytes([c[0], c[1]]))
            .collect();
        assert_eq!(samples, vec![i16::MAX, -i16::MAX, 0]);
    }
}
