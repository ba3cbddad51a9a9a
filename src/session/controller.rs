//! Session controller
//!
//! Owns the connection lifecycle: wires captured frames into the outbound
//! channel, routes inbound agent messages to the transcript aggregator,
//! playback scheduler, and tool call handler, drives the state machine, and
//! runs the coordinated teardown.
//!
//! All inbound events flow through one dispatch loop over the transport's
//! message channel, so there are no ordering assumptions between independent
//! callbacks. Every resource handle is a field of the session core; nothing
//! lives in module statics.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::state::SessionState;
use crate::capture::{AudioFramer, FrameReceiver};
use crate::codec;
use crate::error::SessionError;
use crate::ledger::{BudgetCatalog, StagedTransaction, ToolCallHandler};
use crate::playback::{PlaybackDrained, PlaybackScheduler};
use crate::protocol::{ClientMessage, ServerMessage};
use crate::transcript::{Speaker, TranscriptAggregator, TranscriptItem};
use crate::transport::{Transport, TransportConfig, WsTransport};

/// Consecutive decode failures that escalate to a transport error
const MAX_CONSECUTIVE_DECODE_FAILURES: u32 = 5;

/// Caller-supplied observers for session updates
///
/// All callbacks fire from the session's background tasks; keep them cheap.
#[derive(Default)]
pub struct SessionCallbacks {
    pub on_transcript_update: Option<Box<dyn Fn(&[TranscriptItem]) + Send + Sync>>,
    pub on_staged_changed: Option<Box<dyn Fn(&[StagedTransaction]) + Send + Sync>>,
    pub on_state_changed: Option<Box<dyn Fn(SessionState) + Send + Sync>>,
}

impl SessionCallbacks {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Audio graphs for one session: microphone in, scheduled playback out
pub struct AudioIo {
    framer: Option<AudioFramer>,
    frames: Option<FrameReceiver>,
    scheduler: PlaybackScheduler,
    drained_rx: mpsc::UnboundedReceiver<PlaybackDrained>,
    /// False when no output graph exists; decoded agent audio is then
    /// validated and discarded instead of scheduled, so the session never
    /// sticks in `Speaking` with nothing rendering.
    schedule_output: bool,
}

impl AudioIo {
    /// Open the microphone and the playback output graph.
    ///
    /// Microphone failure is fatal (surfaces as a permission error); a
    /// missing output device degrades to a silent session rather than
    /// blocking capture.
    pub fn open() -> Result<Self, SessionError> {
        let (framer, frames) =
            AudioFramer::start().map_err(|e| SessionError::Permission(e.to_string()))?;

        let (mut scheduler, drained_rx) = PlaybackScheduler::new();
        let schedule_output = match scheduler.start_output() {
            Ok(()) => true,
            Err(e) => {
                log::warn!("Playback unavailable, agent audio will be discarded: {}", e);
                false
            }
        };

        Ok(Self {
            framer: Some(framer),
            frames: Some(frames),
            scheduler,
            drained_rx,
            schedule_output,
        })
    }

    /// Audio-less graphs for hosts without capture/playback devices.
    /// Inbound audio is decoded and dropped; no frames are produced.
    pub fn disabled() -> Self {
        let (scheduler, drained_rx) = PlaybackScheduler::new();
        Self {
            framer: None,
            frames: None,
            scheduler,
            drained_rx,
            schedule_output: false,
        }
    }

    /// Graphs with scheduling active but no hardware behind it, so unit
    /// tests can drive the frame clock by hand.
    #[cfg(test)]
    fn headless_scheduling() -> Self {
        let (scheduler, drained_rx) = PlaybackScheduler::new();
        Self {
            framer: None,
            frames: None,
            scheduler,
            drained_rx,
            schedule_output: true,
        }
    }
}

/// Shared observable state: the state cell and the caller's callbacks
struct Shared {
    state: Mutex<SessionState>,
    last_error: Mutex<Option<SessionError>>,
    callbacks: SessionCallbacks,
}

impl Shared {
    fn new(callbacks: SessionCallbacks) -> Self {
        Self {
            state: Mutex::new(SessionState::Idle),
            last_error: Mutex::new(None),
            callbacks,
        }
    }

    fn state(&self) -> SessionState {
        *lock(&self.state)
    }

    /// Unconditional transition (terminal states stay sticky)
    fn set_state(&self, next: SessionState) {
        let changed = {
            let mut state = lock(&self.state);
            if *state == next || state.is_terminal() {
                false
            } else {
                log::info!("Session state: {} -> {}", state, next);
                *state = next;
                true
            }
        };
        if changed {
            if let Some(cb) = &self.callbacks.on_state_changed {
                cb(next);
            }
        }
    }

    /// Transition only when currently in `from`
    fn set_state_from(&self, from: SessionState, next: SessionState) {
        let changed = {
            let mut state = lock(&self.state);
            if *state != from {
                false
            } else {
                log::info!("Session state: {} -> {}", state, next);
                *state = next;
                true
            }
        };
        if changed {
            if let Some(cb) = &self.callbacks.on_state_changed {
                cb(next);
            }
        }
    }

    fn record_error(&self, error: SessionError) {
        log::error!("Session error: {}", error);
        *lock(&self.last_error) = Some(error);
        self.set_state(SessionState::Error);
    }
}

/// Everything the background tasks and the handle share
struct Core {
    id: Uuid,
    shared: Arc<Shared>,
    transport: Mutex<Box<dyn Transport>>,
    framer: Mutex<Option<AudioFramer>>,
    scheduler: Mutex<Option<PlaybackScheduler>>,
    handler: Mutex<ToolCallHandler>,
    transcript: Mutex<TranscriptAggregator>,
    schedule_output: bool,
    frames_sent: AtomicU64,
    cancel: CancellationToken,
}

impl Core {
    fn send(&self, msg: ClientMessage) {
        lock(&self.transport).send(msg);
    }

    /// Coordinated teardown, in order, without short-circuiting on partial
    /// failure. Every step is a no-op when its resource was never acquired
    /// or is already released, so close is idempotent from any state.
    fn close(&self) {
        // 1. Signal the transport to close
        lock(&self.transport).close();

        // 2 + 3. Stop the microphone and discard the capture graph
        if let Some(mut framer) = lock(&self.framer).take() {
            framer.close();
        }

        // 4 + 5. Stop every scheduled buffer and release the output graph
        if let Some(mut scheduler) = lock(&self.scheduler).take() {
            scheduler.stop_all();
            scheduler.close();
        }

        if !self.cancel.is_cancelled() {
            log::info!("Session {} closed", self.id);
            self.cancel.cancel();
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Entry point for opening capture sessions
pub struct Session;

impl Session {
    /// Open a session against the endpoint configured in the environment:
    /// connect the transport, open the audio graphs, and start streaming.
    ///
    /// Microphone denial and connection failure are the only blocking
    /// errors; both leave already-acquired resources released.
    pub async fn open(
        catalog: BudgetCatalog,
        callbacks: SessionCallbacks,
    ) -> Result<SessionHandle, SessionError> {
        let shared = Arc::new(Shared::new(callbacks));
        shared.set_state(SessionState::Connecting);

        let config = TransportConfig::from_env()?;
        let mut transport = match WsTransport::connect(&config).await {
            Ok(transport) => transport,
            Err(e) => {
                shared.record_error(e.clone());
                return Err(e);
            }
        };

        let audio = match AudioIo::open() {
            Ok(audio) => audio,
            Err(e) => {
                transport.close();
                shared.record_error(e.clone());
                return Err(e);
            }
        };

        let handle = wire(shared.clone(), Box::new(transport), audio, catalog)?;
        shared.set_state(SessionState::Listening);
        Ok(handle)
    }

    /// Wire a session over an existing transport and audio graphs.
    ///
    /// Seam for callers that manage their own connection (and for tests,
    /// which inject a mock transport).
    pub fn attach(
        transport: Box<dyn Transport>,
        audio: AudioIo,
        catalog: BudgetCatalog,
        callbacks: SessionCallbacks,
    ) -> Result<SessionHandle, SessionError> {
        let shared = Arc::new(Shared::new(callbacks));
        shared.set_state(SessionState::Connecting);
        let handle = wire(shared.clone(), transport, audio, catalog)?;
        shared.set_state(SessionState::Listening);
        Ok(handle)
    }
}

fn wire(
    shared: Arc<Shared>,
    mut transport: Box<dyn Transport>,
    audio: AudioIo,
    catalog: BudgetCatalog,
) -> Result<SessionHandle, SessionError> {
    let incoming = transport.take_incoming().ok_or_else(|| {
        SessionError::Transport("Transport inbound receiver already taken".to_string())
    })?;

    let AudioIo {
        framer,
        frames,
        scheduler,
        drained_rx,
        schedule_output,
    } = audio;

    let id = Uuid::new_v4();
    log::info!("Session {} starting", id);

    let core = Arc::new(Core {
        id,
        shared,
        transport: Mutex::new(transport),
        framer: Mutex::new(framer),
        scheduler: Mutex::new(Some(scheduler)),
        handler: Mutex::new(ToolCallHandler::new(catalog)),
        transcript: Mutex::new(TranscriptAggregator::new()),
        schedule_output,
        frames_sent: AtomicU64::new(0),
        cancel: CancellationToken::new(),
    });

    let pump_task = frames.map(|frames| {
        let core = core.clone();
        tokio::spawn(run_frame_pump(core, frames))
    });

    let dispatch_task = {
        let core = core.clone();
        tokio::spawn(run_dispatch(core, incoming, drained_rx))
    };

    Ok(SessionHandle {
        core,
        dispatch_task: Mutex::new(Some(dispatch_task)),
        pump_task: Mutex::new(pump_task),
    })
}

/// Forwards captured frames to the transport in capture order.
/// Sends are fire-and-forget; backpressure was already absorbed by the
/// newest-wins slot in the framer.
async fn run_frame_pump(core: Arc<Core>, mut frames: FrameReceiver) {
    loop {
        let frame = tokio::select! {
            _ = core.cancel.cancelled() => break,
            frame = frames.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
        };

        core.send(ClientMessage::audio_chunk(&frame.samples));

        let sent = core.frames_sent.fetch_add(1, Ordering::Relaxed) + 1;
        if sent % 50 == 0 {
            log::debug!("Sent {} audio frames (latest sequence {})", sent, frame.sequence);
        }
    }
    log::debug!("Frame pump exiting");
}

/// The single inbound dispatch loop: every agent event and every playback
/// drain notification is handled here, in arrival order.
async fn run_dispatch(
    core: Arc<Core>,
    mut incoming: mpsc::Receiver<ServerMessage>,
    mut drained_rx: mpsc::UnboundedReceiver<PlaybackDrained>,
) {
    let mut consecutive_decode_failures = 0u32;

    loop {
        tokio::select! {
            _ = core.cancel.cancelled() => break,

            Some(PlaybackDrained) = drained_rx.recv() => {
                core.shared.set_state_from(SessionState::Speaking, SessionState::Listening);
            }

            msg = incoming.recv() => {
                let Some(msg) = msg else { break };
                match msg {
                    ServerMessage::InputTranscriptFragment { text } => {
                        push_fragment(&core, Speaker::User, &text);
                    }
                    ServerMessage::OutputTranscriptFragment { text } => {
                        push_fragment(&core, Speaker::Agent, &text);
                    }
                    ServerMessage::TurnComplete => {
                        lock(&core.transcript).complete_turn();
                        notify_transcript(&core);
                    }
                    ServerMessage::AudioChunk { audio } => {
                        match decode_chunk(&audio) {
                            Ok(samples) => {
                                consecutive_decode_failures = 0;
                                if samples.is_empty() {
                                    // Nothing to play; entering Speaking here
                                    // would leave no buffer to drain back out of
                                    log::debug!("Ignoring empty audio chunk");
                                } else if core.schedule_output {
                                    if let Some(scheduler) = lock(&core.scheduler).as_ref() {
                                        scheduler.push(samples);
                                        core.shared.set_state_from(
                                            SessionState::Listening,
                                            SessionState::Speaking,
                                        );
                                        core.shared.set_state_from(
                                            SessionState::Processing,
                                            SessionState::Speaking,
                                        );
                                    }
                                } else {
                                    log::trace!("Discarding {} output samples (no playback)", samples.len());
                                }
                            }
                            Err(e) => {
                                log::warn!("Dropping undecodable audio chunk: {}", e);
                                consecutive_decode_failures += 1;
                                if consecutive_decode_failures >= MAX_CONSECUTIVE_DECODE_FAILURES {
                                    core.shared.record_error(SessionError::Transport(format!(
                                        "{} consecutive audio decode failures",
                                        consecutive_decode_failures
                                    )));
                                    core.close();
                                    break;
                                }
                            }
                        }
                    }
                    ServerMessage::ToolCallRequest(request) => {
                        core.shared.set_state_from(SessionState::Listening, SessionState::Processing);
                        let (ack, staged_changed) = {
                            let mut handler = lock(&core.handler);
                            let before = handler.staged().len();
                            let ack = handler.handle(&request);
                            (ack, handler.staged().len() > before)
                        };
                        core.send(ack);
                        if staged_changed {
                            if let Some(cb) = &core.shared.callbacks.on_staged_changed {
                                // Snapshot outside the lock so the callback can
                                // re-enter the handle freely
                                let staged = lock(&core.handler).staged().to_vec();
                                cb(&staged);
                            }
                        }
                        core.shared.set_state_from(SessionState::Processing, SessionState::Listening);
                    }
                    ServerMessage::Error { message } => {
                        core.shared.record_error(SessionError::Transport(message));
                        core.close();
                        break;
                    }
                    ServerMessage::Close => {
                        log::info!("Session closed by agent");
                        core.shared.set_state(SessionState::Finished);
                        core.close();
                        break;
                    }
                    ServerMessage::Unknown => {
                        log::debug!("Ignoring unknown inbound message type");
                    }
                }
            }
        }
    }
    log::debug!("Dispatch loop exiting");
}

fn push_fragment(core: &Core, speaker: Speaker, text: &str) {
    lock(&core.transcript).push_fragment(speaker, text);
    notify_transcript(core);
}

fn notify_transcript(core: &Core) {
    if let Some(cb) = &core.shared.callbacks.on_transcript_update {
        let items = lock(&core.transcript).items().to_vec();
        cb(&items);
    }
}

fn decode_chunk(audio: &str) -> Result<Vec<f32>, SessionError> {
    codec::decode_pcm16(&codec::from_transport_text(audio)?)
}

/// Handle to an open capture session
///
/// The handle is the caller-facing surface: observe state, read the
/// transcript and staged list, and end the session with `finish` or `close`.
pub struct SessionHandle {
    core: Arc<Core>,
    dispatch_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
    pump_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl SessionHandle {
    /// Unique id of this session, for correlating logs
    pub fn id(&self) -> Uuid {
        self.core.id
    }

    /// Current session state
    pub fn state(&self) -> SessionState {
        self.core.shared.state()
    }

    /// The error that moved the session to `Error`, if any
    pub fn last_error(&self) -> Option<SessionError> {
        lock(&self.core.shared.last_error).clone()
    }

    /// Snapshot of the transcript log
    pub fn transcript(&self) -> Vec<TranscriptItem> {
        lock(&self.core.transcript).items().to_vec()
    }

    /// Snapshot of the staged transactions accumulated so far
    pub fn staged(&self) -> Vec<StagedTransaction> {
        lock(&self.core.handler).staged().to_vec()
    }

    /// Frames dropped on the capture side because the session lagged
    pub fn dropped_frames(&self) -> u64 {
        lock(&self.core.framer)
            .as_ref()
            .map(|f| f.dropped_frames())
            .unwrap_or(0)
    }

    /// End the session and hand back the accumulated staged transactions.
    pub async fn finish(&self) -> Vec<StagedTransaction> {
        self.close().await;
        self.staged()
    }

    /// Abort the session without consuming results. Idempotent: closing
    /// twice, or closing a session whose microphone was never granted,
    /// releases whatever was acquired and nothing else.
    pub async fn close(&self) {
        self.core.shared.set_state(SessionState::Finished);
        self.core.close();

        // Take the handles before awaiting: holding the guard across the
        // await would block a concurrent closer for the whole join
        let dispatch = lock(&self.dispatch_task).take();
        if let Some(task) = dispatch {
            let _ = task.await;
        }
        let pump = lock(&self.pump_task).take();
        if let Some(task) = pump {
            let _ = task.await;
        }
    }
}

impl Drop for SessionHandle {
    fn drop(&mut self) {
        // Background tasks exit on the cancellation token; resources are
        // released by the same guarded teardown close() uses.
        self.core.close();
    }
}
