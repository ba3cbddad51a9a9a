//! Gapless playback scheduling for agent speech
//!
//! Decoded output buffers arrive at irregular intervals relative to real
//! time. The scheduler lines them up back-to-back on a sample-frame clock:
//! each new buffer starts at `max(next_start, now)` and advances `next_start`
//! by its length, so intervals abut exactly with no overlap and play in
//! arrival order.
//!
//! The scheduling core is pure (no audio I/O) and shared with the cpal
//! output callback through a mutex. The sink thread owns the cpal stream so
//! the rest of the session never touches a non-Send handle.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleRate, StreamConfig};
use tokio::sync::mpsc;

use crate::protocol::OUTPUT_SAMPLE_RATE;

/// Errors that can occur bringing up the output graph
#[derive(Debug, Clone)]
pub enum PlaybackError {
    NoOutputDevice,
    StreamCreationFailed(String),
}

impl std::fmt::Display for PlaybackError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PlaybackError::NoOutputDevice => write!(f, "No audio output device found"),
            PlaybackError::StreamCreationFailed(e) => {
                write!(f, "Failed to create output stream: {}", e)
            }
        }
    }
}

impl std::error::Error for PlaybackError {}

/// A buffer scheduled on the frame clock but not yet finished
#[derive(Debug)]
struct ScheduledBuffer {
    /// Frame-clock position of the first sample
    start: u64,
    samples: Vec<f32>,
    /// How many samples have been rendered so far
    cursor: usize,
}

/// Fired by the render side when the active set transitions to empty
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlaybackDrained;

/// Pure scheduling core over a monotonic sample-frame clock
///
/// Not internally synchronized; the scheduler wraps it in `Arc<Mutex<>>` so
/// the push side and the render callback can both mutate it.
#[derive(Debug)]
pub struct ScheduleCore {
    /// Frames rendered so far (the output clock)
    clock: u64,
    /// Frame position where the next buffer should start
    next_start: u64,
    /// Scheduled-but-unfinished buffers, ordered by start position
    active: VecDeque<ScheduledBuffer>,
    /// Notifies the session when the active set empties
    drained_tx: mpsc::UnboundedSender<PlaybackDrained>,
}

impl ScheduleCore {
    fn new(drained_tx: mpsc::UnboundedSender<PlaybackDrained>) -> Self {
        Self {
            clock: 0,
            next_start: 0,
            active: VecDeque::new(),
            drained_tx,
        }
    }

    /// Schedule a buffer for gapless playback. Returns its [start, end)
    /// interval on the frame clock.
    ///
    /// An empty buffer is a no-op: it occupies no interval, and admitting it
    /// would leave a zero-length entry in the active set that the render loop
    /// can never finish.
    pub fn schedule(&mut self, samples: Vec<f32>) -> (u64, u64) {
        let start = self.next_start.max(self.clock);
        if samples.is_empty() {
            return (start, start);
        }
        let end = start + samples.len() as u64;
        self.next_start = end;
        self.active.push_back(ScheduledBuffer {
            start,
            samples,
            cursor: 0,
        });
        (start, end)
    }

    /// Render the next `out.len()` frames: scheduled samples where a buffer
    /// covers the clock position, silence in the gaps. Finished buffers
    /// leave the active set; emptying it fires the drained notification.
    pub fn render(&mut self, out: &mut [f32]) {
        let was_active = !self.active.is_empty();

        for slot in out.iter_mut() {
            *slot = 0.0;
            if let Some(front) = self.active.front_mut() {
                if self.clock >= front.start {
                    *slot = front.samples[front.cursor];
                    front.cursor += 1;
                    if front.cursor == front.samples.len() {
                        self.active.pop_front();
                    }
                }
            }
            self.clock += 1;
        }

        if was_active && self.active.is_empty() {
            let _ = self.drained_tx.send(PlaybackDrained);
        }
    }

    /// Force-stop every scheduled buffer immediately, regardless of
    /// playback position.
    pub fn stop_all(&mut self) {
        if !self.active.is_empty() {
            log::debug!("Playback: force-stopping {} buffers", self.active.len());
            self.active.clear();
            let _ = self.drained_tx.send(PlaybackDrained);
        }
        self.next_start = self.clock;
    }

    /// Number of scheduled-but-unfinished buffers
    pub fn active_len(&self) -> usize {
        self.active.len()
    }

    pub fn is_active(&self) -> bool {
        !self.active.is_empty()
    }
}

/// Commands for the sink thread that owns the cpal stream
enum SinkCommand {
    Shutdown,
}

/// Schedules decoded agent speech for gapless sequential playback
///
/// Owns the scheduling core and, when started against real hardware, a
/// dedicated thread holding the cpal output stream. All controls are
/// idempotent so teardown can run from any partial state.
pub struct PlaybackScheduler {
    core: Arc<Mutex<ScheduleCore>>,
    sink_tx: Option<std::sync::mpsc::Sender<SinkCommand>>,
    sink_thread: Option<std::thread::JoinHandle<()>>,
}

impl PlaybackScheduler {
    /// Create a scheduler with no output graph attached.
    ///
    /// Returns the scheduler and the receiver for drained notifications.
    /// Used directly by tests; real sessions call `start_output` as well.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<PlaybackDrained>) {
        let (drained_tx, drained_rx) = mpsc::unbounded_channel();
        (
            Self {
                core: Arc::new(Mutex::new(ScheduleCore::new(drained_tx))),
                sink_tx: None,
                sink_thread: None,
            },
            drained_rx,
        )
    }

    /// Bring up the cpal output graph at 24kHz mono.
    ///
    /// The stream lives on a dedicated thread; the render callback pulls
    /// from the shared scheduling core. No-op if already started.
    pub fn start_output(&mut self) -> Result<(), PlaybackError> {
        if self.sink_tx.is_some() {
            return Ok(());
        }

        let core = self.core.clone();
        let (sink_tx, sink_rx) = std::sync::mpsc::channel();
        let (ready_tx, ready_rx) = std::sync::mpsc::channel();

        let thread = std::thread::spawn(move || {
            let stream = match build_output_stream(core) {
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
                log::error!("Output stream failed to start: {}", e);
                return;
            }

            // Hold the stream alive until shutdown
            let _ = sink_rx.recv();
            drop(stream);
            log::debug!("Playback sink thread exiting");
        });

        match ready_rx.recv() {
            Ok(Ok(())) => {
                self.sink_tx = Some(sink_tx);
                self.sink_thread = Some(thread);
                log::info!("Playback output started ({}Hz mono)", OUTPUT_SAMPLE_RATE);
                Ok(())
            }
            Ok(Err(e)) => {
                let _ = thread.join();
                Err(e)
            }
            Err(_) => Err(PlaybackError::StreamCreationFailed(
                "Sink thread exited before reporting readiness".to_string(),
            )),
        }
    }

    /// Schedule a decoded buffer for playback
    pub fn push(&self, samples: Vec<f32>) {
        let (start, end) = self.lock_core().schedule(samples);
        log::trace!("Playback: scheduled [{}, {}) on frame clock", start, end);
    }

    /// True while at least one scheduled buffer has not finished
    pub fn is_active(&self) -> bool {
        self.lock_core().is_active()
    }

    /// Number of scheduled-but-unfinished buffers
    pub fn active_len(&self) -> usize {
        self.lock_core().active_len()
    }

    /// Force-stop every scheduled buffer. Idempotent.
    pub fn stop_all(&self) {
        self.lock_core().stop_all();
    }

    /// Stop all playback and release the output graph. Idempotent.
    pub fn close(&mut self) {
        self.stop_all();
        if let Some(tx) = self.sink_tx.take() {
            let _ = tx.send(SinkCommand::Shutdown);
        }
        if let Some(thread) = self.sink_thread.take() {
            let _ = thread.join();
        }
    }

    /// Render frames directly from the core, bypassing the audio graph.
    /// Test hook for driving the clock without hardware.
    #[cfg(test)]
    pub(crate) fn render_direct(&self, out: &mut [f32]) {
        self.lock_core().render(out);
    }

    fn lock_core(&self) -> std::sync::MutexGuard<'_, ScheduleCore> {
        // A panic while holding this lock leaves no broken invariant worth
        // preserving; recover the guard and keep playing.
        self.core.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Drop for PlaybackScheduler {
    fn drop(&mut self) {
        self.close();
    }
}

fn build_output_stream(core: Arc<Mutex<ScheduleCore>>) -> Result<cpal::Stream, PlaybackError> {
    let host = cpal::default_host();
    let device = host
        .default_output_device()
        .ok_or(PlaybackError::NoOutputDevice)?;

    log::info!("Using audio output device: {:?}", device.name());

    let config = StreamConfig {
        channels: 1,
        sample_rate: SampleRate(OUTPUT_SAMPLE_RATE),
        buffer_size: cpal::BufferSize::Default,
    };

    let err_fn = |err| log::error!("Output stream error: {}", err);

    device
        .build_output_stream(
            &config,
            move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                let mut guard = match core.lock() {
                    Ok(guard) => guard,
                    Err(poisoned) => poisoned.into_inner(),
                };
                guard.render(data);
            },
            err_fn,
            None,
        )
        .map_err(|e| PlaybackError::StreamCreationFailed(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn core() -> (ScheduleCore, mpsc::UnboundedReceiver<PlaybackDrained>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (ScheduleCore::new(tx), rx)
    }

    #[test]
    fn test_back_to_back_buffers_abut_exactly() {
        let (mut core, _rx) = core();

        let (s1, e1) = core.schedule(vec![0.1; 240]);
        let (s2, e2) = core.schedule(vec![0.2; 480]);
        let (s3, e3) = core.schedule(vec![0.3; 120]);

        assert_eq!((s1, e1), (0, 240));
        assert_eq!((s2, e2), (240, 720));
        assert_eq!((s3, e3), (720, 840));
    }

    #[test]
    fn test_no_overlap_and_arrival_order_with_late_arrivals() {
        let (mut core, _rx) = core();

        // First buffer plays out fully, clock runs past its end
        core.schedule(vec![0.1; 100]);
        let mut out = vec![0.0f32; 300];
        core.render(&mut out);

        // Late arrival: starts at the current clock, not at stale next_start
        let (s2, e2) = core.schedule(vec![0.2; 100]);
        assert_eq!(s2, 300);

        // Burst of buffers while the clock is behind: strictly sequential
        let (s3, e3) = core.schedule(vec![0.3; 50]);
        let (s4, e4) = core.schedule(vec![0.4; 75]);

        let intervals = [(s2, e2), (s3, e3), (s4, e4)];
        for pair in intervals.windows(2) {
            assert!(pair[0].1 <= pair[1].0, "intervals overlap: {:?}", intervals);
            assert!(pair[0].0 < pair[1].0, "intervals out of order");
        }
    }

    #[test]
    fn test_schedule_empty_buffer_is_noop() {
        let (mut core, mut rx) = core();

        let (start, end) = core.schedule(Vec::new());
        assert_eq!(start, end);
        assert!(!core.is_active());

        // Rendering after an empty schedule must not panic or fire drained
        let mut out = vec![0.0f32; 4];
        core.render(&mut out);
        assert_eq!(out, vec![0.0; 4]);
        assert!(rx.try_recv().is_err());

        // Later buffers are unaffected
        let (s, e) = core.schedule(vec![0.5; 8]);
        assert_eq!((s, e), (4, 12));
    }

    #[test]
    fn test_render_outputs_silence_in_gaps() {
        let (mut core, _rx) = core();

        // Render 10 frames of nothing, then schedule: buffer starts at 10
        let mut gap = vec![1.0f32; 10];
        core.render(&mut gap);
        assert!(gap.iter().all(|&s| s == 0.0));

        core.schedule(vec![0.5; 4]);
        let mut out = vec![0.0f32; 6];
        core.render(&mut out);
        assert_eq!(out, vec![0.5, 0.5, 0.5, 0.5, 0.0, 0.0]);
    }

    #[test]
    fn test_drained_fires_when_active_set_empties() {
        let (mut core, mut rx) = core();

        core.schedule(vec![0.1; 8]);
        core.schedule(vec![0.2; 8]);
        assert_eq!(core.active_len(), 2);

        let mut out = vec![0.0f32; 8];
        core.render(&mut out);
        assert_eq!(core.active_len(), 1);
        assert!(rx.try_recv().is_err(), "drained too early");

        core.render(&mut out);
        assert_eq!(core.active_len(), 0);
        assert!(rx.try_recv().is_ok());
    }

    #[test]
    fn test_varying_buffer_lengths_render_seamlessly() {
        let (mut core, _rx) = core();

        core.schedule(vec![0.1; 3]);
        core.schedule(vec![0.2; 5]);
        core.schedule(vec![0.3; 2]);

        let mut out = vec![0.0f32; 10];
        core.render(&mut out);
        assert_eq!(
            out,
            vec![0.1, 0.1, 0.1, 0.2, 0.2, 0.2, 0.2, 0.2, 0.3, 0.3]
        );
        assert!(!core.is_active());
    }

    #[test]
    fn test_stop_all_clears_active_set_immediately() {
        let (mut core, mut rx) = core();

        core.schedule(vec![0.1; 1000]);
        core.schedule(vec![0.2; 1000]);
        core.stop_all();

        assert_eq!(core.active_len(), 0);
        assert!(rx.try_recv().is_ok());

        // Idempotent: a second stop does not fire again
        core.stop_all();
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_schedule_after_stop_all_starts_at_clock() {
        let (mut core, _rx) = core();

        core.schedule(vec![0.1; 500]);
        let mut out = vec![0.0f32; 100];
        core.render(&mut out);
        core.stop_all();

        let (start, _end) = core.schedule(vec![0.2; 10]);
        assert_eq!(start, 100);
    }

    #[test]
    fn test_scheduler_push_and_render() {
        let (scheduler, mut drained_rx) = PlaybackScheduler::new();

        scheduler.push(vec![0.25; 16]);
        assert!(scheduler.is_active());
        assert_eq!(scheduler.active_len(), 1);

        let mut out = vec![0.0f32; 16];
        scheduler.render_direct(&mut out);
        assert!(!scheduler.is_active());
        assert!(drained_rx.try_recv().is_ok());
    }

    #[test]
    fn test_scheduler_close_is_idempotent() {
        let (mut scheduler, _rx) = PlaybackScheduler::new();
        scheduler.push(vec![0.1; 64]);

        scheduler.close();
        assert_eq!(scheduler.active_len(), 0);
        scheduler.close();
    }

    #[test]
    #[ignore] // Requires an audio output device
    fn test_start_output_on_real_hardware() {
        let (mut scheduler, _rx) = PlaybackScheduler::new();
        scheduler.start_output().expect("output graph");
        scheduler.push(vec![0.0; 2400]);
        std::thread::sleep(std::time::Duration::from_millis(200));
        scheduler.close();
    }
}
