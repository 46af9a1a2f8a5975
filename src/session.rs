//! The bridge session: source → parser → filter → rate limiter →
//! health monitor → sink broadcast.
//!
//! Flow:
//!   1. `start` validates the config, opens the source and every enabled
//!      sink, and spawns one writer task per sink plus the pipeline task
//!   2. The pipeline task drains source chunks, runs each sentence
//!      through the gates, and fans accepted frames out to every ready
//!      sink queue without waiting on any of them
//!   3. A failed sink parks in `error` and is skipped from then on; a
//!      failed source escalates the whole session to `error`
//!   4. `stop` cancels everything and joins the tasks under a grace
//!      period
//!
//! Sink writes ride per-sink bounded queues with a single writer task
//! each, so one slow or dead consumer can never stall the source read
//! path or the other sinks.

use std::fmt;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::SessionConfig;
use crate::endpoint::{
    join_with_grace, ConnectionState, EndpointKind, StateCell, StateEvent,
};
use crate::error::{BridgeError, Result};
use crate::filter::SentenceFilter;
use crate::health::{HealthMonitor, HealthStatus, TICK_INTERVAL};
use crate::parser::scan_chunk;
use crate::rate_limit::RateLimiter;
use crate::sentence::NmeaSentence;
use crate::sink::DataSink;
use crate::source::{DataChunk, DataSource};
use crate::stats::{SessionStats, StatsSnapshot};

/// Source chunks in flight between the receive task and the pipeline.
const DATA_QUEUE: usize = 64;
/// Frames queued per sink before the sink counts drops as write errors.
const SINK_QUEUE: usize = 64;

/// Lifecycle state of the whole session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Stopped,
    Starting,
    Running,
    Stopping,
    Error,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionState::Stopped  => "stopped",
            SessionState::Starting => "starting",
            SessionState::Running  => "running",
            SessionState::Stopping => "stopping",
            SessionState::Error    => "error",
        };
        f.write_str(s)
    }
}

/// Everything the session reports to its owner.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    StateChanged {
        old:     SessionState,
        new:     SessionState,
        message: Option<String>,
    },
    /// A source or sink connection transition.
    Endpoint(StateEvent),
    /// One sentence that passed every gate.
    Sentence(NmeaSentence),
    Health {
        old: HealthStatus,
        new: HealthStatus,
    },
}

/// Session state plus the event channel, shared with the pipeline task.
#[derive(Clone)]
struct SharedState {
    state:  Arc<Mutex<SessionState>>,
    events: mpsc::UnboundedSender<SessionEvent>,
}

impl SharedState {
    fn get(&self) -> SessionState {
        *self.state.lock().unwrap()
    }

    fn set(&self, new: SessionState, message: Option<String>) {
        let old = {
            let mut state = self.state.lock().unwrap();
            if *state == new {
                return;
            }
            std::mem::replace(&mut *state, new)
        };
        info!("session: {old} -> {new}");
        let _ = self
            .events
            .send(SessionEvent::StateChanged { old, new, message });
    }
}

/// Pipeline-side view of one sink: its state cell and frame queue.
struct SinkPort {
    name:   String,
    cell:   Arc<StateCell>,
    frames: mpsc::Sender<Vec<u8>>,
}

impl SinkPort {
    fn ready(&self) -> bool {
        self.cell.get() == ConnectionState::Connected && !self.frames.is_closed()
    }
}

struct Running {
    cancel:   CancellationToken,
    source:   DataSource,
    writers:  Vec<JoinHandle<()>>,
    pipeline: JoinHandle<()>,
    health:   Arc<HealthMonitor>,
}

/// One bridge session.  Create it once, `start` it with a config, and
/// `stop` it; `start` is legal again after `stop`.
pub struct Session {
    shared:  SharedState,
    stats:   Arc<SessionStats>,
    running: Option<Running>,
}

impl Session {
    /// Build a session and the receiver for its events.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<SessionEvent>) {
        let (events, events_rx) = mpsc::unbounded_channel();
        let session = Session {
            shared: SharedState {
                state: Arc::new(Mutex::new(SessionState::Stopped)),
                events,
            },
            stats:   Arc::new(SessionStats::new()),
            running: None,
        };
        (session, events_rx)
    }

    pub fn state(&self) -> SessionState {
        self.shared.get()
    }

    pub fn statistics(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Bring the pipeline up.  Only legal from `stopped`; on any failure
    /// every resource opened so far is released again, the session
    /// reports `error`, and the cause is returned.
    pub async fn start(&mut self, config: SessionConfig) -> Result<()> {
        if self.shared.get() != SessionState::Stopped {
            return Err(BridgeError::Lifecycle(format!(
                "cannot start a session that is {}",
                self.shared.get()
            )));
        }
        self.shared.set(SessionState::Starting, None);

        match self.bring_up(config).await {
            Ok(running) => {
                self.running = Some(running);
                self.shared.set(SessionState::Running, None);
                Ok(())
            }
            Err(e) => {
                error!("session start failed: {e}");
                self.shared.set(SessionState::Error, Some(e.to_string()));
                self.shared.set(SessionState::Stopped, None);
                Err(e)
            }
        }
    }

    async fn bring_up(&mut self, config: SessionConfig) -> Result<Running> {
        config.validate()?;
        self.stats.reset(Utc::now());

        let filter = config
            .filter
            .as_ref()
            .map(SentenceFilter::new)
            .unwrap_or_else(SentenceFilter::allow_all);
        let limiter = config
            .rate_limit
            .as_ref()
            .map(RateLimiter::new)
            .unwrap_or_else(RateLimiter::unlimited);
        let health = Arc::new(HealthMonitor::new());

        let cancel = CancellationToken::new();
        let (data_tx, data_rx) = mpsc::channel::<DataChunk>(DATA_QUEUE);
        let (state_tx, state_rx) = mpsc::unbounded_channel::<StateEvent>();

        let mut source = DataSource::from_config(
            &config.input,
            data_tx,
            state_tx.clone(),
            cancel.child_token(),
        );
        if let Err(e) = source.start().await {
            cancel.cancel();
            source.stop().await;
            return Err(e);
        }

        let mut sinks: Vec<DataSink> = Vec::new();
        for output in config.outputs.iter().filter(|o| o.enabled) {
            let mut sink = DataSink::from_config(&output.kind, state_tx.clone());
            if let Err(e) = sink.start().await {
                cancel.cancel();
                source.stop().await;
                for mut opened in sinks {
                    opened.stop().await;
                }
                return Err(e);
            }
            sinks.push(sink);
        }

        let mut ports = Vec::new();
        let mut writers = Vec::new();
        for sink in sinks {
            let (frames_tx, frames_rx) = mpsc::channel::<Vec<u8>>(SINK_QUEUE);
            ports.push(SinkPort {
                name:   sink.name().to_string(),
                cell:   sink.state_cell(),
                frames: frames_tx,
            });
            writers.push(tokio::spawn(run_sink_writer(
                sink,
                frames_rx,
                Arc::clone(&self.stats),
                cancel.child_token(),
            )));
        }

        let pipeline = Pipeline {
            shared:  self.shared.clone(),
            stats:   Arc::clone(&self.stats),
            filter,
            limiter,
            health:  Arc::clone(&health),
            sinks:   ports,
            cancel:  cancel.clone(),
        };
        let pipeline = tokio::spawn(pipeline.run(data_rx, state_rx));

        Ok(Running { cancel, source, writers, pipeline, health })
    }

    /// Tear the pipeline down.  Idempotent; safe to call in any state.
    pub async fn stop(&mut self) {
        match self.shared.get() {
            SessionState::Stopped | SessionState::Stopping => return,
            _ => {}
        }
        self.shared.set(SessionState::Stopping, None);

        if let Some(running) = self.running.take() {
            let Running { cancel, mut source, writers, pipeline, health } = running;
            cancel.cancel();
            source.stop().await;
            // The pipeline drops the sink queues on exit, which lets each
            // writer drain and close its sink.
            join_with_grace("pipeline", pipeline).await;
            let joins = writers
                .into_iter()
                .map(|w| join_with_grace("sink-writer", w));
            futures_util::future::join_all(joins).await;
            health.reset();
        }

        self.shared.set(SessionState::Stopped, None);
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if let Some(running) = &self.running {
            running.cancel.cancel();
        }
    }
}

// ── Pipeline task ─────────────────────────────────────────────────────────────

struct Pipeline {
    shared:  SharedState,
    stats:   Arc<SessionStats>,
    filter:  SentenceFilter,
    limiter: RateLimiter,
    health:  Arc<HealthMonitor>,
    sinks:   Vec<SinkPort>,
    cancel:  CancellationToken,
}

impl Pipeline {
    async fn run(
        self,
        mut data: mpsc::Receiver<DataChunk>,
        mut states: mpsc::UnboundedReceiver<StateEvent>,
    ) {
        let mut ticker = tokio::time::interval(TICK_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut states_open = true;

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                chunk = data.recv() => match chunk {
                    Some((bytes, at)) => self.process_chunk(&bytes, at),
                    None => break,
                },
                ev = states.recv(), if states_open => match ev {
                    Some(ev) => self.handle_state_event(ev),
                    None => states_open = false,
                },
                _ = ticker.tick() => {
                    if let Some((old, new)) = self.health.tick() {
                        self.emit(SessionEvent::Health { old, new });
                    }
                    self.stats.set_current_rate(self.health.data_rate_hz());
                }
            }
        }
        debug!("pipeline task ended");
    }

    /// The per-chunk data path: count, parse, gate, record, broadcast.
    fn process_chunk(&self, bytes: &[u8], at: DateTime<Utc>) {
        self.stats.add_bytes_received(bytes.len() as u64);
        self.stats.mark_data_received(at);

        let (sentences, malformed) = scan_chunk(bytes, at);
        if malformed > 0 {
            self.stats.add_parse_errors(malformed);
            debug!("dropped {malformed} malformed frame(s)");
        }

        for sentence in sentences {
            self.stats.add_sentences_received(1);
            if !sentence.is_valid() {
                self.stats.incr_checksum_errors();
                warn!("checksum mismatch on {}", sentence.full_type());
                continue;
            }
            if !self.filter.allowed(&sentence) {
                continue;
            }
            if !self.limiter.should_emit(&sentence) {
                continue;
            }
            if let Some((old, new)) = self.health.record() {
                self.emit(SessionEvent::Health { old, new });
            }
            self.stats.set_current_rate(self.health.data_rate_hz());
            self.emit(SessionEvent::Sentence(sentence.clone()));
            // An errored session stops feeding the sinks.
            if self.shared.get() == SessionState::Running {
                self.broadcast(&sentence);
            }
        }
    }

    fn broadcast(&self, sentence: &NmeaSentence) {
        let frame = terminate_crlf(sentence.raw());
        for port in &self.sinks {
            if !port.ready() {
                continue;
            }
            if let Err(e) = port.frames.try_send(frame.clone()) {
                self.stats.incr_write_errors();
                warn!("{}: dropping frame: {e}", port.name);
            }
        }
    }

    fn handle_state_event(&self, ev: StateEvent) {
        match &ev.message {
            Some(msg) => info!("{}: {} -> {} ({msg})", ev.endpoint, ev.old, ev.new),
            None => info!("{}: {} -> {}", ev.endpoint, ev.old, ev.new),
        }
        if ev.kind == EndpointKind::Source
            && ev.new == ConnectionState::Error
            && self.shared.get() == SessionState::Running
        {
            let msg = ev
                .message
                .clone()
                .unwrap_or_else(|| format!("{} failed", ev.endpoint));
            error!("source error, session giving up: {msg}");
            if let Some((old, new)) = self.health.set_error() {
                self.emit(SessionEvent::Health { old, new });
            }
            self.shared.set(SessionState::Error, Some(msg));
            self.cancel.cancel();
        }
        self.emit(SessionEvent::Endpoint(ev));
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.shared.events.send(event);
    }
}

/// Single-writer loop for one sink.  Exits when the session cancels, the
/// frame queue closes, or the sink faults; a faulted sink is dropped in
/// `error` state rather than reset to `disconnected`.
async fn run_sink_writer(
    mut sink: DataSink,
    mut frames: mpsc::Receiver<Vec<u8>>,
    stats: Arc<SessionStats>,
    cancel: CancellationToken,
) {
    let clean = loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => break true,
            f = frames.recv() => match f {
                Some(f) => f,
                None => break true,
            },
        };
        match sink.write(&frame).await {
            Ok(()) => {
                stats.add_sentences_sent(1);
                stats.add_bytes_sent(frame.len() as u64);
            }
            Err(e) => {
                stats.incr_write_errors();
                warn!("{}: write failed: {e}", sink.name());
                if sink.state() == ConnectionState::Error {
                    break false;
                }
            }
        }
    };
    if clean {
        sink.stop().await;
    }
}

/// Normalise a raw frame to end in exactly CR+LF, matching reference
/// receiver output.
fn terminate_crlf(raw: &[u8]) -> Vec<u8> {
    match raw {
        [.., b'\r', b'\n'] => raw.to_vec(),
        [.., b'\r'] => {
            let mut v = raw.to_vec();
            v.push(b'\n');
            v
        }
        [.., b'\n'] => {
            let mut v = raw[..raw.len() - 1].to_vec();
            v.extend_from_slice(b"\r\n");
            v
        }
        _ => {
            let mut v = raw.to_vec();
            v.extend_from_slice(b"\r\n");
            v
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{FilterConfig, FilterMode, RateLimitConfig};

    const GGA: &str =
        "$GNGGA,123519,4807.038,N,01131.000,E,1,08,0.9,545.4,M,47.0,M,,*51\r\n";
    const RMC: &str =
        "$GNRMC,123519,A,4807.038,N,01131.000,E,022.4,084.4,230394,003.1,W*74\r\n";

    #[test]
    fn crlf_termination_rule() {
        assert_eq!(terminate_crlf(b"$X*00\r\n"), b"$X*00\r\n");
        assert_eq!(terminate_crlf(b"$X*00\r"), b"$X*00\r\n");
        assert_eq!(terminate_crlf(b"$X*00\n"), b"$X*00\r\n");
        assert_eq!(terminate_crlf(b"$X*00"), b"$X*00\r\n");
    }

    struct TestRig {
        pipeline: Pipeline,
        good_rx:  mpsc::Receiver<Vec<u8>>,
        events:   mpsc::UnboundedReceiver<SessionEvent>,
        /// Held so the wedged sink's queue stays open (but never drained).
        _wedged_rx: Option<mpsc::Receiver<Vec<u8>>>,
    }

    /// Pipeline with an in-memory "good" sink port and, optionally, a
    /// wedged one whose single-slot queue is pre-filled so every
    /// broadcast to it fails.
    fn test_pipeline(
        filter: Option<FilterConfig>,
        rate: Option<RateLimitConfig>,
        with_wedged_sink: bool,
    ) -> TestRig {
        let (events, events_rx) = mpsc::unbounded_channel();
        let shared = SharedState {
            state: Arc::new(Mutex::new(SessionState::Running)),
            events,
        };
        let (state_tx, _state_rx) = mpsc::unbounded_channel();

        let mut sinks = Vec::new();
        let (good_tx, good_rx) = mpsc::channel(16);
        let good_cell = Arc::new(StateCell::new(
            "good",
            EndpointKind::Sink,
            state_tx.clone(),
        ));
        good_cell.set(ConnectionState::Connected);
        sinks.push(SinkPort { name: "good".into(), cell: good_cell, frames: good_tx });

        let mut wedged_rx = None;
        if with_wedged_sink {
            let (tx, rx) = mpsc::channel::<Vec<u8>>(1);
            tx.try_send(Vec::new()).unwrap();
            let cell = Arc::new(StateCell::new("wedged", EndpointKind::Sink, state_tx));
            cell.set(ConnectionState::Connected);
            sinks.push(SinkPort { name: "wedged".into(), cell, frames: tx });
            wedged_rx = Some(rx);
        }

        let pipeline = Pipeline {
            shared,
            stats: Arc::new(SessionStats::new()),
            filter: filter
                .as_ref()
                .map(SentenceFilter::new)
                .unwrap_or_else(SentenceFilter::allow_all),
            limiter: rate
                .as_ref()
                .map(RateLimiter::new)
                .unwrap_or_else(RateLimiter::unlimited),
            health: Arc::new(HealthMonitor::new()),
            sinks,
            cancel: CancellationToken::new(),
        };
        TestRig { pipeline, good_rx, events: events_rx, _wedged_rx: wedged_rx }
    }

    #[tokio::test]
    async fn data_path_counts_and_broadcasts() {
        let mut rig = test_pipeline(None, None, false);
        let chunk = format!("{GGA}{RMC}");
        rig.pipeline.process_chunk(chunk.as_bytes(), Utc::now());

        let snap = rig.pipeline.stats.snapshot();
        assert_eq!(snap.sentences_received, 2);
        assert_eq!(snap.bytes_received, chunk.len() as u64);
        assert_eq!(snap.checksum_errors, 0);

        let first = rig.good_rx.try_recv().unwrap();
        assert_eq!(first, GGA.as_bytes());
        let second = rig.good_rx.try_recv().unwrap();
        assert_eq!(second, RMC.as_bytes());
    }

    #[tokio::test]
    async fn checksum_failures_counted_and_dropped() {
        let mut rig = test_pipeline(None, None, false);
        let chunk = GGA.replace("*51", "*99");
        rig.pipeline.process_chunk(chunk.as_bytes(), Utc::now());

        let snap = rig.pipeline.stats.snapshot();
        assert_eq!(snap.sentences_received, 1);
        assert_eq!(snap.checksum_errors, 1);
        assert!(rig.good_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn malformed_frames_count_as_parse_errors() {
        let rig = test_pipeline(None, None, false);
        rig.pipeline.process_chunk(format!("$NOPE\r\n{GGA}").as_bytes(), Utc::now());
        let snap = rig.pipeline.stats.snapshot();
        assert_eq!(snap.parse_errors, 1);
        assert_eq!(snap.sentences_received, 1);
    }

    #[tokio::test]
    async fn allow_list_gates_broadcast() {
        let filter = FilterConfig {
            mode:  FilterMode::AllowList,
            allow: vec!["GGA".into()],
            block: vec![],
        };
        let mut rig = test_pipeline(Some(filter), None, false);
        rig.pipeline.process_chunk(format!("{GGA}{RMC}").as_bytes(), Utc::now());

        let frame = rig.good_rx.try_recv().unwrap();
        assert!(frame.starts_with(b"$GNGGA"));
        assert!(rig.good_rx.try_recv().is_err());
        // Filtered sentences still count as received.
        assert_eq!(rig.pipeline.stats.snapshot().sentences_received, 2);
    }

    #[tokio::test]
    async fn per_type_rate_limit_drops_repeat() {
        let rate = RateLimitConfig { max_hz: 1.0, per_type: true };
        let mut rig = test_pipeline(None, Some(rate), false);
        rig.pipeline.process_chunk(format!("{GGA}{GGA}{RMC}").as_bytes(), Utc::now());

        let first = rig.good_rx.try_recv().unwrap();
        assert!(first.starts_with(b"$GNGGA"));
        let second = rig.good_rx.try_recv().unwrap();
        assert!(second.starts_with(b"$GNRMC"));
        assert!(rig.good_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn broadcast_isolation_between_sinks() {
        let mut rig = test_pipeline(None, None, true);
        for _ in 0..3 {
            rig.pipeline.process_chunk(GGA.as_bytes(), Utc::now());
        }
        // Every sentence reached the good sink and failed once on the
        // wedged one.
        for _ in 0..3 {
            rig.good_rx.try_recv().unwrap();
        }
        assert_eq!(rig.pipeline.stats.snapshot().write_errors, 3);
    }

    #[tokio::test]
    async fn sentence_events_emitted() {
        let mut rig = test_pipeline(None, None, false);
        rig.pipeline.process_chunk(GGA.as_bytes(), Utc::now());

        let mut saw_sentence = false;
        let mut saw_health = false;
        while let Ok(ev) = rig.events.try_recv() {
            match ev {
                SessionEvent::Sentence(s) => {
                    assert_eq!(s.full_type(), "GNGGA");
                    saw_sentence = true;
                }
                SessionEvent::Health { new, .. } => {
                    assert_eq!(new, HealthStatus::Healthy);
                    saw_health = true;
                }
                _ => {}
            }
        }
        assert!(saw_sentence);
        assert!(saw_health);
    }

    #[tokio::test]
    async fn source_error_escalates_once_running() {
        let mut rig = test_pipeline(None, None, false);
        rig.pipeline.handle_state_event(StateEvent {
            endpoint: "udp-in:10110".into(),
            kind:     EndpointKind::Source,
            old:      ConnectionState::Connected,
            new:      ConnectionState::Error,
            message:  Some("receive: permission denied".into()),
        });

        assert_eq!(rig.pipeline.shared.get(), SessionState::Error);
        assert!(rig.pipeline.cancel.is_cancelled());
        let mut saw_error_state = false;
        while let Ok(ev) = rig.events.try_recv() {
            if matches!(
                ev,
                SessionEvent::StateChanged { new: SessionState::Error, .. }
            ) {
                saw_error_state = true;
            }
        }
        assert!(saw_error_state);
    }

    #[tokio::test]
    async fn sink_error_does_not_escalate() {
        let rig = test_pipeline(None, None, false);
        rig.pipeline.handle_state_event(StateEvent {
            endpoint: "serial:/dev/ttyUSB1".into(),
            kind:     EndpointKind::Sink,
            old:      ConnectionState::Connected,
            new:      ConnectionState::Error,
            message:  Some("write: input/output error".into()),
        });
        assert_eq!(rig.pipeline.shared.get(), SessionState::Running);
        assert!(!rig.pipeline.cancel.is_cancelled());
    }

    #[tokio::test]
    async fn start_rejects_invalid_config() {
        let (mut session, mut events) = Session::new();
        let config = SessionConfig {
            input:      crate::config::InputConfig::Udp { port: 10110, bind: None },
            outputs:    vec![],
            filter:     None,
            rate_limit: None,
        };
        assert!(session.start(config).await.is_err());
        assert_eq!(session.state(), SessionState::Stopped);

        let mut states = Vec::new();
        while let Ok(ev) = events.try_recv() {
            if let SessionEvent::StateChanged { new, .. } = ev {
                states.push(new);
            }
        }
        assert_eq!(
            states,
            vec![SessionState::Starting, SessionState::Error, SessionState::Stopped]
        );
    }

    #[tokio::test]
    async fn stop_is_idempotent() {
        let (mut session, _events) = Session::new();
        session.stop().await;
        session.stop().await;
        assert_eq!(session.state(), SessionState::Stopped);
    }
}
