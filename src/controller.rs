//! Session controller
//!
//! Owns the single live session and runs every effect produced by the state
//! machine. One task multiplexes four event sources with `tokio::select!`:
//!
//! ```text
//! consumer commands ──┐
//! capture frames ─────┤
//! channel events ─────┼──▶ SessionController (single context) ──▶ watch<SessionSnapshot>
//! playback ended ─────┤
//! render tick ────────┘
//! ```
//!
//! Because everything runs on one context, the playback scheduler and the
//! transcript buffers need no locking: `interrupt()` can never interleave
//! with `enqueue()`.

use std::collections::VecDeque;

use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::audio::capture::{CaptureEncoder, EncoderConfig};
use crate::audio::chunk::AudioChunk;
use crate::audio::level::{frame_interval, AnalyserTap, LevelMeter, SharedTap, VolumeSample, VolumeSmoother};
use crate::audio::pcm::{self, INBOUND_SAMPLE_RATE, OUTBOUND_MIME_TYPE, OUTBOUND_SAMPLE_RATE};
use crate::audio::playback::{BufferId, PlaybackScheduler};
use crate::audio::{AudioBackend, CaptureStream};
use crate::error::SessionError;
use crate::live::{ChannelConnector, ChannelEvent, InboundContent, LiveTransport, OpenRequest, SetupConfig};
use crate::settings::AppSettings;
use crate::state_machine::{reduce, ConnectionStatus, Effect, Event, State};
use crate::transcript::{Message, TranscriptAssembler};

/// Commands accepted from consumers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Connect,
    Disconnect,
}

/// Observable state published to consumers
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    pub status: ConnectionStatus,
    pub is_connecting: bool,
    pub transcript: Vec<Message>,
    pub volume: VolumeSample,
    pub last_error: Option<String>,
}

impl Default for SessionSnapshot {
    fn default() -> Self {
        Self {
            status: ConnectionStatus::Idle,
            is_connecting: false,
            transcript: Vec::new(),
            volume: VolumeSample::default(),
            last_error: None,
        }
    }
}

/// Resources owned by the live session
///
/// Every field is optional so release is safe at any point of acquisition.
#[derive(Default)]
struct Session {
    capture: Option<Box<dyn CaptureStream>>,
    encoder: Option<CaptureEncoder>,
    scheduler: Option<PlaybackScheduler>,
    transport: Option<Box<dyn LiveTransport>>,
    frames: Option<mpsc::Receiver<Vec<f32>>>,
    recycle: Option<mpsc::Sender<Vec<f32>>>,
    ended: Option<mpsc::UnboundedReceiver<BufferId>>,
    faults: Option<mpsc::UnboundedReceiver<String>>,
    events: Option<mpsc::Receiver<ChannelEvent>>,
    /// Sequence for inbound chunks
    inbound_sequence: u64,
    /// Outbound frames dropped on send failure (for logging)
    dropped_frames: u64,
}

impl Session {
    fn holds_resources(&self) -> bool {
        self.capture.is_some() || self.scheduler.is_some() || self.transport.is_some()
    }

    /// Release everything exactly once. Safe to call repeatedly.
    fn release(&mut self) {
        let held = self.holds_resources();
        if let Some(mut transport) = self.transport.take() {
            transport.close();
        }
        if let Some(mut scheduler) = self.scheduler.take() {
            scheduler.reset();
        }
        // Dropping the handles stops the device streams
        *self = Session::default();
        if held {
            log::info!("Session: resources released");
        }
    }
}

/// Drives one conversation at a time
pub struct SessionController {
    state: State,
    settings: AppSettings,
    api_key: Option<String>,
    audio: Box<dyn AudioBackend>,
    connector: Box<dyn ChannelConnector>,
    session: Session,
    transcript: TranscriptAssembler,
    input_meter: LevelMeter,
    output_meter: LevelMeter,
    smoother: VolumeSmoother,
    volume: VolumeSample,
    last_error: Option<String>,
    snapshot_tx: watch::Sender<SessionSnapshot>,
}

impl SessionController {
    pub fn new(
        settings: AppSettings,
        api_key: Option<String>,
        audio: Box<dyn AudioBackend>,
        connector: Box<dyn ChannelConnector>,
    ) -> Self {
        let volume = VolumeSample::resting(settings.resting_level);
        let (snapshot_tx, _) = watch::channel(SessionSnapshot {
            volume,
            ..Default::default()
        });

        Self {
            state: State::default(),
            smoother: VolumeSmoother::new(settings.resting_level),
            settings,
            api_key: api_key.filter(|k| !k.trim().is_empty()),
            audio,
            connector,
            session: Session::default(),
            transcript: TranscriptAssembler::new(),
            input_meter: LevelMeter::new(AnalyserTap::shared()),
            output_meter: LevelMeter::new(AnalyserTap::shared()),
            volume,
            last_error: None,
            snapshot_tx,
        }
    }

    // ------------------------------------------------------------------
    // Consumer operations
    // ------------------------------------------------------------------

    pub fn connect(&mut self) {
        let has_credential = self.api_key.is_some();
        self.dispatch(Event::Connect { has_credential });
    }

    pub fn disconnect(&mut self) {
        self.dispatch(Event::Disconnect);
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.snapshot_tx.subscribe()
    }

    pub fn state(&self) -> &State {
        &self.state
    }

    pub fn status(&self) -> ConnectionStatus {
        self.state.status()
    }

    pub fn transcript(&self) -> &[Message] {
        self.transcript.messages()
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn volume(&self) -> VolumeSample {
        self.volume
    }

    pub fn input_tap(&self) -> &SharedTap {
        self.input_meter.tap()
    }

    pub fn output_tap(&self) -> &SharedTap {
        self.output_meter.tap()
    }

    /// Whether capture, playback or channel handles are still held
    pub fn holds_resources(&self) -> bool {
        self.session.holds_resources()
    }

    /// Output-clock time at which the next inbound chunk would start
    pub fn next_playback_start(&self) -> Option<f64> {
        self.session.scheduler.as_ref().map(|s| s.next_start())
    }

    pub fn in_flight_buffers(&self) -> usize {
        self.session
            .scheduler
            .as_ref()
            .map_or(0, |s| s.in_flight_len())
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            status: self.state.status(),
            is_connecting: matches!(self.state, State::Connecting { .. }),
            transcript: self.transcript.messages().to_vec(),
            volume: self.volume,
            last_error: self.last_error.clone(),
        }
    }

    // ------------------------------------------------------------------
    // Event sources
    // ------------------------------------------------------------------

    /// Handle one event from the live channel
    pub fn handle_channel_event(&mut self, event: ChannelEvent) {
        let Some(id) = self.state.session_id() else {
            log::debug!("Channel event outside a session ignored: {:?}", event);
            return;
        };

        match event {
            ChannelEvent::Opened => self.dispatch(Event::ChannelOpened { id }),
            ChannelEvent::Message(content) => {
                if self.state.is_active() {
                    self.handle_inbound(content);
                } else {
                    log::debug!("Message before session became active ignored");
                }
            }
            ChannelEvent::Closed { reason } => self.dispatch(Event::ChannelClosed { id, reason }),
            ChannelEvent::Error { message } => self.dispatch(Event::ChannelError {
                id,
                message: SessionError::Channel(message).to_string(),
            }),
        }
    }

    /// Encode and transmit one captured microphone frame
    pub fn handle_capture_frame(&mut self, frame: Vec<f32>) {
        if !self.state.is_active() {
            return;
        }
        let (Some(encoder), Some(transport)) =
            (self.session.encoder.as_mut(), self.session.transport.as_mut())
        else {
            return;
        };

        for chunk in encoder.push(&frame) {
            let payload = pcm::encode_outbound(&chunk);
            if let Err(e) = transport.send_audio(payload, OUTBOUND_MIME_TYPE) {
                // Stale audio is worthless; drop rather than retry
                self.session.dropped_frames += 1;
                if self.session.dropped_frames % 50 == 1 {
                    log::warn!(
                        "Session: {} ({} frame(s) dropped)",
                        e,
                        self.session.dropped_frames
                    );
                }
            }
        }

        if let Some(recycle) = &self.session.recycle {
            // Pool full or capture gone: let it drop
            let _ = recycle.try_send(frame);
        }
    }

    /// A playback buffer finished naturally
    pub fn on_buffer_ended(&mut self, id: BufferId) {
        if let Some(scheduler) = self.session.scheduler.as_mut() {
            scheduler.on_buffer_ended(id);
        }
    }

    /// A capture or output stream failed after start
    pub fn on_device_fault(&mut self, message: String) {
        let Some(id) = self.state.session_id() else {
            return;
        };
        let err = SessionError::Permission(message).to_string();
        self.dispatch(Event::DeviceLost { id, err });
    }

    /// Sample both meters and publish the smoothed pair
    pub fn tick_levels(&mut self) -> VolumeSample {
        let target = if self.state.is_active() {
            Some(VolumeSample {
                input: self.input_meter.level(),
                output: self.output_meter.level(),
            })
        } else {
            None
        };

        self.volume = self.smoother.apply(target);
        let volume = self.volume;
        self.snapshot_tx.send_if_modified(|snapshot| {
            if snapshot.volume == volume {
                return false;
            }
            snapshot.volume = volume;
            true
        });
        volume
    }

    fn handle_inbound(&mut self, content: InboundContent) {
        for payload in &content.audio {
            match pcm::decode_inbound(payload) {
                Ok(samples) => {
                    let chunk =
                        AudioChunk::mono(samples, INBOUND_SAMPLE_RATE, self.session.inbound_sequence);
                    self.session.inbound_sequence += 1;
                    if let Some(scheduler) = self.session.scheduler.as_mut() {
                        scheduler.enqueue(&chunk);
                    }
                }
                Err(e) => log::warn!("Session: dropping inbound chunk: {}", e),
            }
        }

        if content.interrupted {
            if let Some(scheduler) = self.session.scheduler.as_mut() {
                scheduler.interrupt();
            }
            self.transcript.on_interruption();
        }

        if let Some(text) = &content.input_text {
            self.transcript.append_input(text);
        }
        if let Some(text) = &content.output_text {
            self.transcript.append_output(text);
        }

        if content.turn_complete {
            let committed = self.transcript.on_turn_complete().len();
            if committed > 0 {
                log::debug!("Session: committed {} message(s)", committed);
                self.publish();
            }
        }
    }

    // ------------------------------------------------------------------
    // State machine plumbing
    // ------------------------------------------------------------------

    fn dispatch(&mut self, event: Event) {
        let mut queue = VecDeque::from([event]);

        while let Some(event) = queue.pop_front() {
            log::debug!("Received event: {:?}", event);

            let (next, effects) = reduce(&self.state, event);
            if std::mem::discriminant(&self.state) != std::mem::discriminant(&next) {
                log::info!("State transition: {:?} -> {:?}", self.state, next);
            }
            self.state = next;

            for effect in effects {
                if let Some(follow_up) = self.run_effect(effect) {
                    queue.push_back(follow_up);
                }
            }
        }
    }

    /// Execute one effect, returning the completion event if it has one
    fn run_effect(&mut self, effect: Effect) -> Option<Event> {
        match effect {
            Effect::AcquireAudio { id } => {
                self.clear_taps();
                match self.audio.acquire(
                    self.input_meter.tap().clone(),
                    self.output_meter.tap().clone(),
                ) {
                    Ok(streams) => {
                        let source_sample_rate = streams.capture.sample_rate();
                        self.session.encoder = Some(CaptureEncoder::new(EncoderConfig {
                            source_sample_rate,
                            target_sample_rate: OUTBOUND_SAMPLE_RATE,
                            chunk_duration_ms: self.settings.capture_chunk_ms,
                        }));
                        self.session.capture = Some(streams.capture);
                        self.session.scheduler = Some(PlaybackScheduler::new(streams.output));
                        self.session.frames = Some(streams.frames);
                        self.session.recycle = streams.recycle;
                        self.session.ended = Some(streams.ended);
                        self.session.faults = Some(streams.faults);
                        Some(Event::AudioReady { id })
                    }
                    Err(e) => Some(Event::AcquireFailed {
                        id,
                        err: SessionError::from(e).to_string(),
                    }),
                }
            }
            Effect::OpenChannel { id } => {
                let setup = SetupConfig::new(
                    &self.settings.model,
                    &self.settings.voice,
                    &self.settings.system_instruction(),
                );
                let request = OpenRequest {
                    api_key: self.api_key.clone().unwrap_or_default(),
                    setup,
                };
                match self.connector.open(request) {
                    Ok((transport, events)) => {
                        self.session.transport = Some(transport);
                        self.session.events = Some(events);
                        None
                    }
                    Err(e) => Some(Event::AcquireFailed {
                        id,
                        err: e.to_string(),
                    }),
                }
            }
            Effect::StartPlaybackClock => {
                if let Some(scheduler) = self.session.scheduler.as_mut() {
                    scheduler.start_clock();
                }
                None
            }
            Effect::CloseChannel => {
                if let Some(transport) = self.session.transport.as_mut() {
                    transport.close();
                }
                None
            }
            Effect::ResetPlayback => {
                if let Some(scheduler) = self.session.scheduler.as_mut() {
                    scheduler.reset();
                }
                None
            }
            Effect::ReleaseResources => {
                self.session.release();
                self.clear_taps();
                None
            }
            Effect::ClearTranscript => {
                self.transcript.reset();
                None
            }
            Effect::RecordError { message } => {
                log::error!("Session error: {}", message);
                self.last_error = Some(message);
                None
            }
            Effect::ClearError => {
                self.last_error = None;
                None
            }
            Effect::EmitUi => {
                self.publish();
                None
            }
        }
    }

    fn clear_taps(&self) {
        for meter in [&self.input_meter, &self.output_meter] {
            if let Ok(mut tap) = meter.tap().lock() {
                tap.clear();
            }
        }
    }

    fn publish(&self) {
        let snapshot = self.snapshot();
        log::debug!(
            "Publishing snapshot: status={:?}, messages={}",
            snapshot.status,
            snapshot.transcript.len()
        );
        self.snapshot_tx.send_replace(snapshot);
    }

    // ------------------------------------------------------------------
    // Async driver
    // ------------------------------------------------------------------

    /// Run until cancelled or every command sender is gone
    ///
    /// Resources are released on exit.
    pub async fn run(mut self, mut commands: mpsc::Receiver<Command>, cancel: CancellationToken) {
        let mut tick = tokio::time::interval(frame_interval(self.settings.meter_fps));
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

        self.publish();
        log::info!("Session loop started");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                command = commands.recv() => match command {
                    Some(Command::Connect) => self.connect(),
                    Some(Command::Disconnect) => self.disconnect(),
                    None => break,
                },
                frame = recv_opt(&mut self.session.frames) => match frame {
                    Some(frame) => self.handle_capture_frame(frame),
                    None => self.session.frames = None,
                },
                event = recv_opt(&mut self.session.events) => match event {
                    Some(event) => self.handle_channel_event(event),
                    None => {
                        self.session.events = None;
                        self.handle_channel_event(ChannelEvent::Closed {
                            reason: Some("channel dropped".to_string()),
                        });
                    }
                },
                ended = recv_opt_unbounded(&mut self.session.ended) => match ended {
                    Some(id) => self.on_buffer_ended(id),
                    None => self.session.ended = None,
                },
                fault = recv_opt_unbounded(&mut self.session.faults) => match fault {
                    Some(message) => self.on_device_fault(message),
                    None => self.session.faults = None,
                },
                _ = tick.tick() => {
                    self.tick_levels();
                }
            }
        }

        self.disconnect();
        log::info!("Session loop ended");
    }

    /// Spawn the controller loop on the current runtime
    pub fn spawn(self, cancel: CancellationToken) -> (SessionHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(16);
        let handle = SessionHandle {
            tx,
            snapshots: self.subscribe(),
        };
        let task = tokio::spawn(self.run(rx, cancel));
        (handle, task)
    }
}

/// Receive from an optional queue; pends forever when there is none
async fn recv_opt<T>(rx: &mut Option<mpsc::Receiver<T>>) -> Option<T> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn recv_opt_unbounded<T>(rx: &mut Option<mpsc::UnboundedReceiver<T>>) -> Option<T> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

/// Cloneable consumer handle to a running controller
#[derive(Clone)]
pub struct SessionHandle {
    tx: mpsc::Sender<Command>,
    snapshots: watch::Receiver<SessionSnapshot>,
}

impl SessionHandle {
    pub async fn connect(&self) -> Result<(), mpsc::error::SendError<Command>> {
        self.tx.send(Command::Connect).await
    }

    pub async fn disconnect(&self) -> Result<(), mpsc::error::SendError<Command>> {
        self.tx.send(Command::Disconnect).await
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.snapshots.clone()
    }

    /// Latest published snapshot
    pub fn snapshot(&self) -> SessionSnapshot {
        self.snapshots.borrow().clone()
    }
}
