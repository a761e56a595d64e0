//! Engine host
//!
//! [`Engine`] is the single owned handle to the live-recording engine. One actor
//! task serialises everything that mutates a session: accepted readings, the
//! tick and persist timers, connection events, and lifecycle or control calls.
//! Trainer writes run on per-endpoint [`ControlWorker`]s so a slow round-trip
//! never holds up ingestion.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::connection::{ConnectionEvent, ConnectionManager};
use crate::control::{ControlNotice, ControlTarget, ControlWorker, FitnessMachineController, SimulationParameters};
use crate::error::{ControlError, Result, SessionError, TrainLinkError};
use crate::logging::log_error;
use crate::metrics::MetricsSnapshot;
use crate::models::{ConnectionState, EndpointId, MonotonicClock, SensorReading};
use crate::persistence::{JsonFileSink, SnapshotSink};
use crate::plan::{FlatPlan, StepChange};
use crate::session::{RecordingSession, SessionState, SessionSummary, StepOutcome};
use crate::transport::Transport;

const COMMAND_CAPACITY: usize = 64;
const SNAPSHOT_CAPACITY: usize = 256;
const STEP_CAPACITY: usize = 64;
const NOTICE_CAPACITY: usize = 64;

type Reply<T> = oneshot::Sender<Result<T>>;

enum Command {
    Start {
        plan: Option<FlatPlan>,
        reply: Reply<Uuid>,
    },
    Pause(Reply<()>),
    Resume(Reply<()>),
    Finish(Reply<SessionSummary>),
    Abort(Reply<()>),
    AdvanceStep(Reply<()>),
    AddRepetitions(u32),
    SetManualOverride {
        enabled: bool,
        reply: Reply<()>,
    },
    ApplyTarget {
        endpoint: EndpointId,
        target: ControlTarget,
        reply: Reply<()>,
    },
    Snapshot(oneshot::Sender<Option<MetricsSnapshot>>),
    SessionState(oneshot::Sender<Option<SessionState>>),
    Shutdown(oneshot::Sender<()>),
}

/// Owned handle to a running engine
pub struct Engine<T: Transport> {
    commands: mpsc::Sender<Command>,
    connections: ConnectionManager<T>,
    snapshots: broadcast::Sender<MetricsSnapshot>,
    step_changes: broadcast::Sender<StepChange>,
    notices: broadcast::Sender<ControlNotice>,
    actor: JoinHandle<()>,
    health_check: JoinHandle<()>,
}

impl<T: Transport> Engine<T> {
    /// Spawn the engine, persisting sessions as JSON under the configured data dir
    pub fn new(transport: Arc<T>, config: EngineConfig) -> Self {
        let sink = Arc::new(JsonFileSink::new(config.recording.data_dir.join("sessions")));
        Self::with_sink(transport, config, sink)
    }

    pub fn with_sink(transport: Arc<T>, config: EngineConfig, sink: Arc<dyn SnapshotSink>) -> Self {
        let connections = ConnectionManager::new(
            transport,
            config.connection.clone(),
            config.recording.wheel_circumference_m,
        );
        let (commands, command_rx) = mpsc::channel(COMMAND_CAPACITY);
        let (snapshots, _) = broadcast::channel(SNAPSHOT_CAPACITY);
        let (step_changes, _) = broadcast::channel(STEP_CAPACITY);
        let (notices, _) = broadcast::channel(NOTICE_CAPACITY);

        let actor = Actor {
            clock: connections.clock(),
            readings: connections.subscribe_readings(),
            events: connections.subscribe_events(),
            connections: connections.clone(),
            config,
            sink,
            session: None,
            workers: HashMap::new(),
            snapshots: snapshots.clone(),
            step_changes: step_changes.clone(),
            notices: notices.clone(),
            tick_timer: None,
            persist_timer: None,
            persist_task: None,
        };
        let actor = tokio::spawn(actor.run(command_rx));
        let health_check = connections.spawn_health_check();
        info!("Engine started");

        Self {
            commands,
            connections,
            snapshots,
            step_changes,
            notices,
            actor,
            health_check,
        }
    }

    /// Discovery, connect and disconnect go straight to the manager
    pub fn connections(&self) -> &ConnectionManager<T> {
        &self.connections
    }

    /// Snapshot after every tick and every accepted reading
    pub fn subscribe_snapshots(&self) -> broadcast::Receiver<MetricsSnapshot> {
        self.snapshots.subscribe()
    }

    pub fn subscribe_step_changes(&self) -> broadcast::Receiver<StepChange> {
        self.step_changes.subscribe()
    }

    /// Connection state and battery updates per endpoint
    pub fn subscribe_connection_events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.connections.subscribe_events()
    }

    pub fn subscribe_control_notices(&self) -> broadcast::Receiver<ControlNotice> {
        self.notices.subscribe()
    }

    /// Start a new session; fails while one is recording or paused
    pub async fn start(&self, plan: Option<FlatPlan>) -> Result<Uuid> {
        self.request(|reply| Command::Start { plan, reply }).await
    }

    pub async fn pause(&self) -> Result<()> {
        self.request(Command::Pause).await
    }

    pub async fn resume(&self) -> Result<()> {
        self.request(Command::Resume).await
    }

    pub async fn finish(&self) -> Result<SessionSummary> {
        self.request(Command::Finish).await
    }

    pub async fn abort(&self) -> Result<()> {
        self.request(Command::Abort).await
    }

    /// End the active plan step early
    pub async fn advance_step(&self) -> Result<()> {
        self.request(Command::AdvanceStep).await
    }

    pub async fn add_repetitions(&self, count: u32) -> Result<()> {
        self.commands
            .send(Command::AddRepetitions(count))
            .await
            .map_err(|_| TrainLinkError::EngineStopped)
    }

    pub async fn set_manual_override(&self, enabled: bool) -> Result<()> {
        self.request(|reply| Command::SetManualOverride { enabled, reply }).await
    }

    /// Send a target to one trainer and wait for its answer
    ///
    /// Manual targets switch the active session to manual override so the plan
    /// does not overwrite them.
    pub async fn apply_target(&self, endpoint: &EndpointId, target: ControlTarget) -> Result<()> {
        let endpoint = endpoint.clone();
        self.request(|reply| Command::ApplyTarget {
            endpoint,
            target,
            reply,
        })
        .await
    }

    pub async fn set_power_target(&self, endpoint: &EndpointId, watts: f64) -> Result<()> {
        self.apply_target(endpoint, ControlTarget::Power { watts }).await
    }

    pub async fn set_simulation(&self, endpoint: &EndpointId, params: SimulationParameters) -> Result<()> {
        self.apply_target(endpoint, ControlTarget::Simulation(params)).await
    }

    pub async fn set_resistance_level(&self, endpoint: &EndpointId, level: f64) -> Result<()> {
        self.apply_target(endpoint, ControlTarget::Resistance { level }).await
    }

    pub async fn snapshot(&self) -> Result<Option<MetricsSnapshot>> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Snapshot(reply)).await?;
        rx.await.map_err(|_| TrainLinkError::EngineStopped)
    }

    pub async fn session_state(&self) -> Result<Option<SessionState>> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::SessionState(reply)).await?;
        rx.await.map_err(|_| TrainLinkError::EngineStopped)
    }

    /// Stop timers and workers, then disconnect every endpoint
    pub async fn shutdown(self) {
        let (reply, rx) = oneshot::channel();
        if self.commands.send(Command::Shutdown(reply)).await.is_ok() {
            let _ = rx.await;
        }
        let _ = self.actor.await;
        self.health_check.abort();
        self.connections.disconnect_all().await;
        info!("Engine stopped");
    }

    async fn send(&self, command: Command) -> Result<()> {
        self.commands.send(command).await.map_err(|_| TrainLinkError::EngineStopped)
    }

    async fn request<R>(&self, command: impl FnOnce(Reply<R>) -> Command) -> Result<R> {
        let (reply, rx) = oneshot::channel();
        self.send(command(reply)).await?;
        rx.await.map_err(|_| TrainLinkError::EngineStopped)?
    }
}

struct Actor<T: Transport> {
    config: EngineConfig,
    connections: ConnectionManager<T>,
    sink: Arc<dyn SnapshotSink>,
    clock: MonotonicClock,
    readings: broadcast::Receiver<SensorReading>,
    events: broadcast::Receiver<ConnectionEvent>,
    session: Option<RecordingSession>,
    workers: HashMap<EndpointId, Arc<ControlWorker>>,
    snapshots: broadcast::Sender<MetricsSnapshot>,
    step_changes: broadcast::Sender<StepChange>,
    notices: broadcast::Sender<ControlNotice>,
    tick_timer: Option<Interval>,
    persist_timer: Option<Interval>,
    /// Latest periodic write; each one waits for its predecessor
    persist_task: Option<JoinHandle<()>>,
}

impl<T: Transport> Actor<T> {
    async fn run(mut self, mut commands: mpsc::Receiver<Command>) {
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Shutdown(reply)) => {
                        self.stop_timers();
                        let _ = reply.send(());
                        break;
                    }
                    Some(command) => self.handle(command).await,
                    None => break,
                },
                reading = self.readings.recv() => match reading {
                    Ok(reading) => self.on_reading(reading),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Reading stream lagged, samples dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => {}
                },
                event = self.events.recv() => match event {
                    Ok(event) => self.on_connection_event(event).await,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Connection event stream lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => {}
                },
                Some(_) = next_tick(self.tick_timer.as_mut()) => self.on_tick(),
                Some(_) = next_tick(self.persist_timer.as_mut()) => self.persist_in_background(),
            }
        }

        for worker in self.workers.values() {
            worker.stop();
        }
        self.wait_for_persist().await;
        debug!("Engine actor exited");
    }

    async fn handle(&mut self, command: Command) {
        match command {
            Command::Start { plan, reply } => {
                let _ = reply.send(self.start(plan));
            }
            Command::Pause(reply) => {
                let now = self.clock.now();
                let _ = reply.send(self.with_session(|session| session.pause(now)));
            }
            Command::Resume(reply) => {
                let now = self.clock.now();
                let result = self.with_session(|session| session.resume(now));
                let _ = reply.send(result.map(|target| {
                    if let Some(target) = target {
                        self.forward(target);
                    }
                }));
            }
            Command::Finish(reply) => {
                let _ = reply.send(self.finish().await);
            }
            Command::Abort(reply) => {
                let _ = reply.send(self.abort().await);
            }
            Command::AdvanceStep(reply) => {
                let result = self.with_session(|session| session.advance_step());
                let _ = reply.send(result.map(|outcome| self.publish_steps(outcome)));
            }
            Command::AddRepetitions(count) => {
                if let Some(session) = self.session.as_mut() {
                    session.add_repetitions(count);
                }
            }
            Command::SetManualOverride { enabled, reply } => {
                let result = self.with_session(|session| session.set_manual_override(enabled));
                let _ = reply.send(result.map(|target| {
                    if let Some(target) = target {
                        self.forward(target);
                    }
                }));
            }
            Command::ApplyTarget {
                endpoint,
                target,
                reply,
            } => self.apply_target(endpoint, target, reply),
            Command::Snapshot(reply) => {
                let now = self.clock.now();
                let _ = reply.send(self.session.as_ref().map(|session| session.snapshot(now)));
            }
            Command::SessionState(reply) => {
                let _ = reply.send(self.session.as_ref().map(RecordingSession::state));
            }
            Command::Shutdown(reply) => {
                let _ = reply.send(());
            }
        }
    }

    fn with_session<R>(
        &mut self,
        action: impl FnOnce(&mut RecordingSession) -> std::result::Result<R, SessionError>,
    ) -> Result<R> {
        let session = self.session.as_mut().ok_or(SessionError::NoActiveSession)?;
        action(session).map_err(|err| {
            let err = TrainLinkError::from(err);
            log_error("Session command rejected", &err);
            err
        })
    }

    fn start(&mut self, plan: Option<FlatPlan>) -> Result<Uuid> {
        let now = self.clock.now();

        // An active session answers with the illegal transition itself
        if let Some(session) = self.session.as_mut().filter(|s| s.state().is_active()) {
            let err = TrainLinkError::from(session.start(now).err().unwrap_or(SessionError::IllegalTransition {
                action: "start",
                state: session.state(),
            }));
            log_error("Start rejected", &err);
            return Err(err);
        }

        let mut session = RecordingSession::new(&self.config.recording, self.config.athlete.clone(), plan);
        let outcome = session.start(now)?;
        let id = session.id();
        self.session = Some(session);

        self.tick_timer = Some(timer(self.config.recording.tick_interval));
        self.persist_timer = Some(timer(self.config.recording.persist_interval));
        self.publish_steps(outcome);
        Ok(id)
    }

    async fn finish(&mut self) -> Result<SessionSummary> {
        let now = self.clock.now();
        let summary = self.with_session(|session| session.finish(now))?;
        self.stop_timers();
        self.forward(ControlTarget::Neutral);
        let _ = self.snapshots.send(summary.snapshot.clone());
        self.persist_now().await;
        Ok(summary)
    }

    async fn abort(&mut self) -> Result<()> {
        let now = self.clock.now();
        self.with_session(|session| session.abort(now))?;
        self.stop_timers();
        self.forward(ControlTarget::Neutral);
        self.persist_now().await;
        Ok(())
    }

    fn stop_timers(&mut self) {
        self.tick_timer = None;
        self.persist_timer = None;
    }

    fn on_reading(&mut self, reading: SensorReading) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        if let Some(snapshot) = session.ingest(&reading) {
            let _ = self.snapshots.send(snapshot);
        }
    }

    fn on_tick(&mut self) {
        let now = self.clock.now();
        let dt = self.config.recording.tick_interval;
        let Some(outcome) = self.session.as_mut().and_then(|session| session.tick(dt, now)) else {
            return;
        };

        let _ = self.snapshots.send(outcome.snapshot);
        self.publish_steps(StepOutcome {
            step_changes: outcome.step_changes,
            control: outcome.control,
        });
    }

    fn publish_steps(&mut self, outcome: StepOutcome) {
        for change in outcome.step_changes {
            info!(index = ?change.index, step = ?change.step.as_ref().map(|s| &s.name), "Step changed");
            let _ = self.step_changes.send(change);
        }
        if let Some(target) = outcome.control {
            self.forward(target);
        }
    }

    /// Queue a target on every controllable trainer
    fn forward(&self, target: ControlTarget) {
        for worker in self.workers.values() {
            if !worker.submit(target) {
                warn!(endpoint = %worker.endpoint(), %target, "Control worker stopped, target dropped");
            }
        }
    }

    fn apply_target(&mut self, endpoint: EndpointId, target: ControlTarget, reply: Reply<()>) {
        let Some(worker) = self.workers.get(&endpoint).cloned() else {
            let _ = reply.send(Err(ControlError::NotControllable(endpoint).into()));
            return;
        };

        if let Some(session) = self.session.as_mut().filter(|s| s.state().is_active()) {
            if !session.is_manual_override() {
                let _ = session.set_manual_override(true);
            }
        }

        tokio::spawn(async move {
            let result = worker.apply(target).await.map_err(TrainLinkError::from);
            let _ = reply.send(result);
        });
    }

    async fn on_connection_event(&mut self, event: ConnectionEvent) {
        match event {
            ConnectionEvent::StateChanged {
                endpoint,
                state: ConnectionState::Connected,
                ..
            } => {
                if self.workers.contains_key(&endpoint) {
                    return;
                }
                let controllable = self
                    .connections
                    .endpoint(&endpoint)
                    .await
                    .is_some_and(|e| e.is_controllable());
                if !controllable {
                    return;
                }

                let controller = FitnessMachineController::new(
                    self.connections.transport(),
                    endpoint.clone(),
                    self.config.connection.control_timeout,
                );
                let worker = ControlWorker::spawn(controller, self.notices.clone());
                info!(endpoint = %endpoint, "Trainer control ready");

                // A trainer joining mid-step picks up the current target
                if let Some(target) = self.session.as_ref().and_then(RecordingSession::active_target) {
                    worker.submit(target);
                }
                self.workers.insert(endpoint, Arc::new(worker));
            }
            ConnectionEvent::StateChanged {
                endpoint,
                state: ConnectionState::Disconnected | ConnectionState::Failed,
                ..
            }
            | ConnectionEvent::Forgotten(endpoint) => {
                if let Some(worker) = self.workers.remove(&endpoint) {
                    worker.stop();
                    debug!(endpoint = %endpoint, "Trainer control released");
                }
            }
            _ => {}
        }
    }

    fn persist_in_background(&mut self) {
        let Some(session) = self.session.as_ref().filter(|s| s.state() == SessionState::Recording) else {
            return;
        };
        let record = session.record(self.clock.now());
        let sink = Arc::clone(&self.sink);
        let previous = self.persist_task.take();
        self.persist_task = Some(tokio::spawn(async move {
            if let Some(previous) = previous {
                let _ = previous.await;
            }
            if let Err(err) = sink.persist(&record).await {
                log_error("Periodic persist failed", &err);
            }
        }));
    }

    async fn wait_for_persist(&mut self) {
        if let Some(pending) = self.persist_task.take() {
            if let Err(err) = pending.await {
                warn!(error = %err, "Periodic persist task did not complete");
            }
        }
    }

    /// Final record for the session, written after any periodic write still in flight
    async fn persist_now(&mut self) {
        self.wait_for_persist().await;
        let Some(session) = self.session.as_ref() else {
            return;
        };
        let record = session.record(self.clock.now());
        if let Err(err) = self.sink.persist(&record).await {
            log_error("Final persist failed", &err);
        }
    }
}

fn timer(period: Duration) -> Interval {
    let mut interval = tokio::time::interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

async fn next_tick(timer: Option<&mut Interval>) -> Option<Instant> {
    match timer {
        Some(interval) => Some(interval.tick().await),
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{SensorEndpoint, SensorService};
    use crate::persistence::MemorySink;
    use crate::plan::{IntensityTarget, WorkoutStep};
    use crate::protocol::uuids;
    use crate::transport::SimulatedTransport;

    fn config() -> EngineConfig {
        let mut config = EngineConfig::default();
        config.athlete.ftp = Some(250);
        config.athlete.lthr = Some(165);
        config
    }

    async fn engine() -> (Engine<SimulatedTransport>, SimulatedTransport, MemorySink) {
        let transport = SimulatedTransport::new();
        let sink = MemorySink::new();
        let engine = Engine::with_sink(Arc::new(transport.clone()), config(), Arc::new(sink.clone()));
        (engine, transport, sink)
    }

    #[tokio::test(start_paused = true)]
    async fn test_double_start_rejected() {
        let (engine, _, _) = engine().await;
        engine.start(None).await.unwrap();

        let err = engine.start(None).await.unwrap_err();
        assert!(matches!(
            err,
            TrainLinkError::Session(SessionError::IllegalTransition {
                state: SessionState::Recording,
                ..
            })
        ));
        assert!(!err.is_recoverable());

        engine.pause().await.unwrap();
        assert!(engine.start(None).await.is_err());

        engine.finish().await.unwrap();
        // A finished session makes room for a new one
        engine.start(None).await.unwrap();
        engine.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_lifecycle_without_session() {
        let (engine, _, _) = engine().await;
        assert!(matches!(
            engine.pause().await,
            Err(TrainLinkError::Session(SessionError::NoActiveSession))
        ));
        assert_eq!(engine.session_state().await.unwrap(), None);
        engine.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_ticks_and_persists() {
        let (engine, _, sink) = engine().await;
        let mut snapshots = engine.subscribe_snapshots();
        engine.start(None).await.unwrap();

        tokio::time::sleep(Duration::from_millis(30_500)).await;
        let latest = snapshots.recv().await.unwrap();
        assert!(latest.elapsed >= Duration::from_secs(1));
        assert_eq!(sink.records().await.len(), 1);

        let summary = engine.finish().await.unwrap();
        assert_eq!(summary.snapshot.elapsed, Duration::from_secs(30));
        assert_eq!(sink.latest().await.unwrap().state, SessionState::Finished);

        // Timers are gone after finish
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(sink.records().await.len(), 2);
        engine.shutdown().await;
    }

    /// Holds periodic writes long enough for finish to overtake them
    #[derive(Clone, Default)]
    struct SlowSink {
        states: Arc<tokio::sync::Mutex<Vec<SessionState>>>,
    }

    #[async_trait::async_trait]
    impl SnapshotSink for SlowSink {
        async fn persist(&self, record: &crate::persistence::SessionRecord) -> Result<()> {
            if record.state == SessionState::Recording {
                tokio::time::sleep(Duration::from_secs(5)).await;
            }
            self.states.lock().await.push(record.state);
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_final_record_lands_after_periodic_write() {
        let transport = SimulatedTransport::new();
        let sink = SlowSink::default();
        let engine = Engine::with_sink(Arc::new(transport), config(), Arc::new(sink.clone()));
        engine.start(None).await.unwrap();

        // First periodic write is still sleeping when finish arrives
        tokio::time::sleep(Duration::from_millis(30_100)).await;
        assert!(sink.states.lock().await.is_empty());
        engine.finish().await.unwrap();

        assert_eq!(
            *sink.states.lock().await,
            vec![SessionState::Recording, SessionState::Finished]
        );
        engine.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_plan_drives_trainer() {
        let (engine, transport, _) = engine().await;
        let trainer = EndpointId::new("kickr");
        transport.add_trainer(trainer.clone(), "KICKR").await;
        engine
            .connections()
            .register(
                SensorEndpoint::new(trainer.clone(), "KICKR")
                    .with_services([SensorService::FitnessMachine, SensorService::CyclingPower]),
            )
            .await;
        engine.connections().connect(&trainer).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        let plan = FlatPlan::from_steps(vec![
            WorkoutStep::timed("A", 5).with_target(IntensityTarget::Watts(200.0)),
            WorkoutStep::open_ended("B").with_target(IntensityTarget::PercentFtp(50.0)),
        ]);
        let mut notices = engine.subscribe_control_notices();
        engine.start(Some(plan)).await.unwrap();

        let first = notices.recv().await.unwrap();
        assert_eq!(first.target, ControlTarget::Power { watts: 200.0 });
        assert!(first.result.is_ok());

        // Keep the trainer alive while the step runs out
        for _ in 0..6 {
            transport
                .notify(&trainer, uuids::INDOOR_BIKE_DATA, &[0x40, 0x00, 0xB8, 0x0B, 0xC8, 0x00])
                .await;
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
        let second = notices.recv().await.unwrap();
        assert_eq!(second.target, ControlTarget::Power { watts: 125.0 });

        engine.set_power_target(&trainer, 150.0).await.unwrap();
        let writes = transport.control_writes(&trainer).await;
        assert_eq!(writes.last(), Some(&vec![0x05, 150, 0]));

        engine.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_manual_target_requires_trainer() {
        let (engine, _, _) = engine().await;
        let result = engine.set_power_target(&EndpointId::new("nope"), 200.0).await;
        assert!(matches!(
            result,
            Err(TrainLinkError::Control(ControlError::NotControllable(_)))
        ));
        engine.shutdown().await;
    }
}
