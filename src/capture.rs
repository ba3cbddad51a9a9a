//! Microphone capture and framing
//!
//! Pulls audio from the default cpal input device, reduces it to mono 16kHz
//! float samples, and cuts it into fixed-size frames for encoding.
//!
//! Backpressure contract: at most one frame is ever in flight. If the
//! session consumes slower than capture produces, the newest frame replaces
//! the stale one (bounded staleness is acceptable for voice). Frames are
//! never reordered.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleFormat, StreamConfig};
use tokio::sync::Notify;

use crate::protocol::INPUT_SAMPLE_RATE;

/// Samples per capture frame at 16kHz (256ms of audio)
pub const FRAME_LEN: usize = 4096;

/// Errors that can occur during audio capture
#[derive(Debug, Clone)]
pub enum CaptureError {
    NoInputDevice,
    NoSupportedConfig,
    StreamCreationFailed(String),
}

impl std::fmt::Display for CaptureError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CaptureError::NoInputDevice => write!(f, "No audio input device found"),
            CaptureError::NoSupportedConfig => write!(f, "No supported audio configuration"),
            CaptureError::StreamCreationFailed(e) => {
                write!(f, "Failed to create audio stream: {}", e)
            }
        }
    }
}

impl std::error::Error for CaptureError {}

/// An immutable block of mono samples ready for encoding
///
/// The sequence index increases monotonically and is used only for
/// diagnostics; ordering on the wire is guaranteed by the transport.
#[derive(Debug, Clone)]
pub struct AudioFrame {
    pub samples: Vec<f32>,
    pub sequence: u64,
}

/// Single-frame handoff slot shared between the capture callback and the
/// session's frame pump. Newest frame wins.
#[derive(Debug, Default)]
struct FrameSlot {
    frame: Mutex<Option<AudioFrame>>,
    notify: Notify,
    dropped: AtomicU64,
    closed: AtomicBool,
}

impl FrameSlot {
    fn publish(&self, frame: AudioFrame) {
        let mut guard = match self.frame.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if guard.replace(frame).is_some() {
            let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
            if dropped % 50 == 0 {
                log::warn!("Capture: {} stale frames dropped so far", dropped);
            }
        }
        drop(guard);
        self.notify.notify_one();
    }

    fn take(&self) -> Option<AudioFrame> {
        match self.frame.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        }
    }
}

/// Receiving side of the capture pipeline
pub struct FrameReceiver {
    slot: Arc<FrameSlot>,
}

impl FrameReceiver {
    /// Wait for the next captured frame.
    ///
    /// Returns `None` once the framer has been closed and the slot drained.
    pub async fn recv(&mut self) -> Option<AudioFrame> {
        loop {
            let notified = self.slot.notify.notified();
            if let Some(frame) = self.slot.take() {
                return Some(frame);
            }
            if self.slot.closed.load(Ordering::Acquire) {
                return None;
            }
            notified.await;
        }
    }
}

enum CaptureCommand {
    Shutdown,
}

/// Continuously pulls fixed-size 16kHz mono frames from the microphone
///
/// The cpal stream lives on a dedicated thread; `close()` stops it and
/// releases the device handle. Starting only succeeds after the device
/// grants access, so a permission failure surfaces once, from `start`.
pub struct AudioFramer {
    slot: Arc<FrameSlot>,
    command_tx: Option<std::sync::mpsc::Sender<CaptureCommand>>,
    thread: Option<std::thread::JoinHandle<()>>,
}

impl AudioFramer {
    /// Open the default input device and begin producing frames.
    pub fn start() -> Result<(Self, FrameReceiver), CaptureError> {
        let slot = Arc::new(FrameSlot::default());
        let (command_tx, command_rx) = std::sync::mpsc::channel();
        let (ready_tx, ready_rx) = std::sync::mpsc::channel();

        let callback_slot = slot.clone();
        let thread = std::thread::spawn(move || {
            let stream = match build_input_stream(callback_slot) {
                Ok(stream) => {
                    let _ = ready_tx.send(Ok(()));
                    stream
                }
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                    return;
                }
            };

            if let Err(e) = stream.play() {
                log::error!("Input stream failed to start: {}", e);
                return;
            }

            let _ = command_rx.recv();
            drop(stream);
            log::debug!("Capture thread exiting");
        });

        match ready_rx.recv() {
            Ok(Ok(())) => {
                log::info!(
                    "Capture started ({}Hz mono, {}-sample frames)",
                    INPUT_SAMPLE_RATE,
                    FRAME_LEN
                );
                let receiver = FrameReceiver { slot: slot.clone() };
                Ok((
                    Self {
                        slot,
                        command_tx: Some(command_tx),
                        thread: Some(thread),
                    },
                    receiver,
                ))
            }
            Ok(Err(e)) => {
                let _ = thread.join();
                Err(e)
            }
            Err(_) => Err(CaptureError::StreamCreationFailed(
                "Capture thread exited before reporting readiness".to_string(),
            )),
        }
    }

    /// Total frames dropped because the consumer lagged behind capture
    pub fn dropped_frames(&self) -> u64 {
        self.slot.dropped.load(Ordering::Relaxed)
    }

    /// Stop capture and release the device handle. Idempotent.
    pub fn close(&mut self) {
        self.slot.closed.store(true, Ordering::Release);
        self.slot.notify.notify_one();
        if let Some(tx) = self.command_tx.take() {
            let _ = tx.send(CaptureCommand::Shutdown);
        }
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for AudioFramer {
    fn drop(&mut self) {
        self.close();
    }
}

fn build_input_stream(slot: Arc<FrameSlot>) -> Result<cpal::Stream, CaptureError> {
    let host = cpal::default_host();
    let device = host
        .default_input_device()
        .ok_or(CaptureError::NoInputDevice)?;

    log::info!("Using audio input device: {:?}", device.name());

    let supported_config = device
        .default_input_config()
        .map_err(|_| CaptureError::NoSupportedConfig)?;

    log::info!(
        "Capture config: {} Hz, {} channels, {:?}",
        supported_config.sample_rate().0,
        supported_config.channels(),
        supported_config.sample_format()
    );

    if supported_config.sample_format() != SampleFormat::F32 {
        // Most hosts expose f32; other formats would need per-type streams
        return Err(CaptureError::NoSupportedConfig);
    }

    let channels = supported_config.channels() as usize;
    let source_rate = supported_config.sample_rate().0;
    let config: StreamConfig = supported_config.into();

    let mut framer = FrameAccumulator::new(channels, source_rate, FRAME_LEN);
    let err_fn = |err| log::error!("Input stream error: {}", err);

    let stream = device
        .build_input_stream(
            &config,
            move |data: &[f32], _: &cpal::InputCallbackInfo| {
                for frame in framer.push(data) {
                    slot.publish(frame);
                }
            },
            err_fn,
            None,
        )
        .map_err(|e| CaptureError::StreamCreationFailed(e.to_string()))?;

    Ok(stream)
}

/// Turns interleaved device samples into fixed-size mono 16kHz frames
///
/// Separate from the cpal wiring so the framing arithmetic is testable
/// without hardware.
#[derive(Debug)]
struct FrameAccumulator {
    channels: usize,
    source_rate: u32,
    frame_len: usize,
    pending: Vec<f32>,
    next_sequence: u64,
}

impl FrameAccumulator {
    fn new(channels: usize, source_rate: u32, frame_len: usize) -> Self {
        Self {
            channels: channels.max(1),
            source_rate,
            frame_len,
            pending: Vec::with_capacity(frame_len * 2),
            next_sequence: 0,
        }
    }

    /// Feed an interleaved callback buffer; returns zero or more full frames.
    fn push(&mut self, interleaved: &[f32]) -> Vec<AudioFrame> {
        let mono: Vec<f32> = interleaved
            .chunks(self.channels)
            .map(|group| group.iter().sum::<f32>() / group.len() as f32)
            .collect();
        self.pending
            .extend(downsample(&mono, self.source_rate, INPUT_SAMPLE_RATE));

        let mut frames = Vec::new();
        while self.pending.len() >= self.frame_len {
            let samples: Vec<f32> = self.pending.drain(..self.frame_len).collect();
            let sequence = self.next_sequence;
            self.next_sequence += 1;
            if sequence % 50 == 0 {
                log::debug!("Capture: produced frame {}", sequence);
            }
            frames.push(AudioFrame { samples, sequence });
        }
        frames
    }
}

/// Downsample mono audio from source rate to target rate.
///
/// Integer ratios (48kHz → 16kHz) use block averaging; other ratios fall
/// back to nearest-sample decimation, which is adequate for speech.
fn downsample(samples: &[f32], source_rate: u32, target_rate: u32) -> Vec<f32> {
    if source_rate == 0 || target_rate == 0 {
        log::warn!(
            "Invalid sample rate (source: {}, target: {}), returning original",
            source_rate,
            target_rate
        );
        return samples.to_vec();
    }

    if source_rate == target_rate {
        return samples.to_vec();
    }

    if source_rate % target_rate == 0 {
        let ratio = (source_rate / target_rate) as usize;
        return samples
            .chunks(ratio)
            .map(|chunk| chunk.iter().sum::<f32>() / chunk.len() as f32)
            .collect();
    }

    let out_len = (samples.len() as u64 * target_rate as u64 / source_rate as u64) as usize;
    (0..out_len)
        .map(|i| {
            let src = (i as u64 * source_rate as u64 / target_rate as u64) as usize;
            samples[src.min(samples.len() - 1)]
        })
        .collect()
}
