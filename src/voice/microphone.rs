//! Default input device via cpal

use std::sync::mpsc;

use async_trait::async_trait;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{BuildStreamError, Device, SampleFormat, SampleRate, Stream, StreamConfig};
use tokio::sync::oneshot;

use super::capture::{MicHandle, Microphone, Permission, SAMPLE_RATE, SampleSink};
use crate::{Error, Result};

/// Captures from the default input device
///
/// cpal streams are not `Send`, so each open capture lives on its own thread and is
/// dropped there when the handle is closed.
#[derive(Debug, Default)]
pub struct CpalMicrophone;

impl CpalMicrophone {
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Microphone for CpalMicrophone {
    async fn permission(&self) -> Permission {
        // Desktop hosts have no prompt; a visible device is a usable one
        if cpal::default_host().default_input_device().is_some() {
            Permission::Granted
        } else {
            Permission::Prompt
        }
    }

    async fn request_permission(&self) -> Permission {
        if cpal::default_host().default_input_device().is_some() {
            Permission::Granted
        } else {
            tracing::warn!("no input device available");
            Permission::Denied
        }
    }

    async fn open(&self, sink: SampleSink) -> Result<Box<dyn MicHandle>> {
        let (ready_tx, ready_rx) = oneshot::channel::<Result<u32>>();
        let (stop_tx, stop_rx) = mpsc::channel::<()>();

        std::thread::Builder::new()
            .name("voxlink-capture".to_string())
            .spawn(move || {
                let stream = match build_capture_stream(sink) {
                    Ok((stream, rate)) => {
                        let _ = ready_tx.send(Ok(rate));
                        stream
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };

                // Blocks until the handle sends stop or is dropped
                let _ = stop_rx.recv();
                drop(stream);
            })?;

        let sample_rate = ready_rx
            .await
            .map_err(|_| Error::Audio("capture thread exited during setup".to_string()))??;

        Ok(Box::new(CpalMicHandle {
            sample_rate,
            stop: Some(stop_tx),
        }))
    }
}

struct CpalMicHandle {
    sample_rate: u32,
    stop: Option<mpsc::Sender<()>>,
}

impl MicHandle for CpalMicHandle {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn close(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
    }
}

impl Drop for CpalMicHandle {
    fn drop(&mut self) {
        self.close();
    }
}

/// Pick a capture config: mono at 16kHz if offered, otherwise the device default
fn capture_config(device: &Device) -> Result<(StreamConfig, SampleFormat)> {
    let preferred = device
        .supported_input_configs()
        .map_err(|e| Error::Audio(e.to_string()))?
        .find(|c| {
            c.channels() == 1
                && c.sample_format() == SampleFormat::F32
                && c.min_sample_rate() <= SampleRate(SAMPLE_RATE)
                && c.max_sample_rate() >= SampleRate(SAMPLE_RATE)
        });

    if let Some(range) = preferred {
        return Ok((
            range.with_sample_rate(SampleRate(SAMPLE_RATE)).config(),
            SampleFormat::F32,
        ));
    }

    let fallback = device
        .default_input_config()
        .map_err(|e| Error::Audio(e.to_string()))?;
    Ok((fallback.config(), fallback.sample_format()))
}

fn map_build_error(e: BuildStreamError) -> Error {
    match e {
        BuildStreamError::DeviceNotAvailable => {
            Error::DeviceBusy("input device not available".to_string())
        }
        other => Error::Audio(other.to_string()),
    }
}

/// Downmix interleaved frames to mono
fn downmix(data: &[f32], channels: usize) -> Vec<f32> {
    if channels <= 1 {
        return data.to_vec();
    }
    #[allow(clippy::cast_precision_loss)]
    let scale = 1.0 / channels as f32;
    data.chunks(channels)
        .map(|frame| frame.iter().sum::<f32>() * scale)
        .collect()
}

fn build_capture_stream(mut sink: SampleSink) -> Result<(Stream, u32)> {
    let host = cpal::default_host();
    let device = host
        .default_input_device()
        .ok_or_else(|| Error::DeviceBusy("no input device available".to_string()))?;

    let (config, format) = capture_config(&device)?;
    let channels = usize::from(config.channels);
    let rate = config.sample_rate.0;

    tracing::debug!(
        device = device.name().unwrap_or_default(),
        sample_rate = rate,
        channels,
        ?format,
        "opening input stream"
    );

    let on_error = |err: cpal::StreamError| tracing::error!(error = %err, "audio capture error");

    let stream = match format {
        SampleFormat::F32 => device.build_input_stream(
            &config,
            move |data: &[f32], _: &cpal::InputCallbackInfo| {
                sink(&downmix(data, channels), rate);
            },
            on_error,
            None,
        ),
        SampleFormat::I16 => device.build_input_stream(
            &config,
            move |data: &[i16], _: &cpal::InputCallbackInfo| {
                let floats: Vec<f32> = data.iter().map(|&s| f32::from(s) / 32768.0).collect();
                sink(&downmix(&floats, channels), rate);
            },
            on_error,
            None,
        ),
        other => {
            return Err(Error::Audio(format!("unsupported input sample format: {other:?}")));
        }
    }
    .map_err(map_build_error)?;

    stream.play().map_err(|e| Error::Audio(e.to_string()))?;
    Ok((stream, rate))
}
