//! Top-level `Engine`: wires every component together and owns the
//! background tasks (heartbeat sweep, queue drain, pressure classification)
//! that the spec requires to be joined on shutdown (spec §5, §9, §10.5).
//!
//! Grounded on `knhk_swarm::core::swarm::AgentSwarm::shutdown()`'s
//! per-subsystem stop sequence.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{info, instrument};

use crate::agent::AgentController;
use crate::config::EngineConfig;
use crate::error::EngineResult;
use crate::events::{EngineEvent, EventBus};
use crate::ledger::AllocationLedger;
use crate::pressure::PressureDetector;
use crate::rebalancer::Rebalancer;
use crate::registry::{FleetHealth, ServerRegistry};
use crate::scheduler::Scheduler;
use crate::types::ServerStatus;

/// How often the pressure detector re-samples each server's last known
/// report, independent of new report arrivals (spec §4.6: "≈ 8 minutes at
/// 5 s interval" implies a fixed sampling cadence, not just report-driven).
const PRESSURE_SAMPLE_INTERVAL_MS: u64 = 5_000;

fn now_nanos() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before unix epoch")
        .as_nanos() as i64
}

pub struct Engine {
    pub registry: Arc<ServerRegistry>,
    pub ledger: Arc<AllocationLedger>,
    pub scheduler: Arc<Scheduler>,
    pub pressure: Arc<PressureDetector>,
    pub rebalancer: Arc<Rebalancer>,
    pub agents: Arc<AgentController>,
    pub events: Arc<EventBus>,
    config: EngineConfig,
    shutdown: tokio::sync::watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Engine {
    /// Build and start the engine: validates `config`, wires every
    /// component, and spawns the background tasks.
    pub fn start(config: EngineConfig) -> EngineResult<Arc<Self>> {
        config.validate()?;

        let events = Arc::new(EventBus::new(config.event_buffer_size));
        let registry = Arc::new(ServerRegistry::new(config.clone(), events.clone()));
        let ledger = Arc::new(AllocationLedger::new(registry.clone(), events.clone()));
        let scheduler = Arc::new(Scheduler::new(
            registry.clone(),
            ledger.clone(),
            events.clone(),
            config.clone(),
        ));
        let pressure = Arc::new(PressureDetector::new(config.clone(), events.clone()));
        let rebalancer = Arc::new(Rebalancer::new(
            ledger.clone(),
            scheduler.clone(),
            events.clone(),
            config.clone(),
        ));
        let agents = Arc::new(AgentController::new(ledger.clone(), scheduler.clone(), events.clone()));

        let (shutdown, _) = tokio::sync::watch::channel(false);

        let engine = Arc::new(Self {
            registry,
            ledger,
            scheduler,
            pressure,
            rebalancer,
            agents,
            events,
            config,
            shutdown,
            tasks: Mutex::new(Vec::new()),
        });

        engine.spawn_background_tasks();
        info!("engine started");
        Ok(engine)
    }

    fn spawn_background_tasks(self: &Arc<Self>) {
        let mut tasks = self.tasks.lock();
        tasks.push(self.spawn_heartbeat_sweep());
        tasks.push(self.spawn_queue_drain());
        tasks.push(self.spawn_pressure_tick());
        tasks.push(self.spawn_rebalance_reactor());
    }

    fn spawn_heartbeat_sweep(self: &Arc<Self>) -> JoinHandle<()> {
        let engine = self.clone();
        let mut stop = engine.shutdown.subscribe();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_millis(engine.config.heartbeat_interval_ms));
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        engine.registry.heartbeat_sweep(now_nanos());
                    }
                    _ = stop.changed() => {
                        if *stop.borrow() { break; }
                    }
                }
            }
        })
    }

    fn spawn_queue_drain(self: &Arc<Self>) -> JoinHandle<()> {
        let engine = self.clone();
        let mut stop = engine.shutdown.subscribe();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_millis(engine.config.heartbeat_interval_ms));
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        engine.scheduler.drain_queue(now_nanos());
                    }
                    _ = stop.changed() => {
                        if *stop.borrow() { break; }
                    }
                }
            }
        })
    }

    fn spawn_pressure_tick(self: &Arc<Self>) -> JoinHandle<()> {
        let engine = self.clone();
        let mut stop = engine.shutdown.subscribe();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_millis(PRESSURE_SAMPLE_INTERVAL_MS));
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let now = now_nanos();
                        for server in engine.registry.snapshot().servers {
                            engine.pressure.record_sample(server.server_id, now, &server.last_report);
                        }
                    }
                    _ = stop.changed() => {
                        if *stop.borrow() { break; }
                    }
                }
            }
        })
    }

    /// Subscribes to the event bus and drives the rebalancer off server
    /// status transitions: `Overloaded` sheds load, `Offline` evacuates, and
    /// a transition into a schedulable status (new server or recovery) wakes
    /// the pending queue (spec §4.7 "Rebalancer listens for...").
    fn spawn_rebalance_reactor(self: &Arc<Self>) -> JoinHandle<()> {
        let engine = self.clone();
        let mut stop = engine.shutdown.subscribe();
        let mut events = engine.events.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    event = events.recv() => {
                        match event {
                            Some(EngineEvent::ServerStateChanged { server_id, old_status, new_status, generation }) => {
                                let now = now_nanos();
                                match new_status {
                                    ServerStatus::Overloaded => engine.rebalancer.shed_load(&server_id, now),
                                    ServerStatus::Offline => engine.rebalancer.evacuate(&server_id, now),
                                    ServerStatus::Healthy | ServerStatus::Degraded
                                        if old_status != new_status || generation == 0 =>
                                    {
                                        engine.rebalancer.on_capacity_increase(now);
                                    }
                                    _ => {}
                                }
                            }
                            Some(_) => {}
                            None => break,
                        }
                    }
                    _ = stop.changed() => {
                        if *stop.borrow() { break; }
                    }
                }
            }
        })
    }

    pub fn fleet_health(&self) -> FleetHealth {
        self.registry.fleet_health()
    }

    /// Signal every background task to stop and join them before returning,
    /// guaranteeing release on all exit paths (spec §5, §9).
    #[instrument(skip(self))]
    pub async fn shutdown(&self) {
        let _ = self.shutdown.send(true);
        let handles: Vec<_> = self.tasks.lock().drain(..).collect();
        for handle in handles {
            let _ = handle.await;
        }
        info!("engine shut down");
    }
}
