//! Asynchronous shell around the simulation kernel: the `EngineApi` facade,
//! SQLite persistence, the self-scheduling step driver, per-agent tasks, the
//! LLM client, and the HTTP surface.

pub mod agents;
pub mod llm;
pub mod persistence;
pub mod server;

use contracts::constants::IDLE_WORLD_TIMEOUT;
use contracts::{
    AgentDoc, EngineDoc, Id, InputPayload, InputReturn, WorldConfig, WorldSnapshot, WorldStatus,
};
use town_core::agent::{self, AgentDecision};
use town_core::engine::{Engine, InputQueue};
use town_core::world::AiTown;

pub use persistence::{AgentMemoryRow, PersistenceError, PersistedWorld, SqliteWorldStore};
pub use server::{serve, ServerError};

/// Owns one world, its engine, its input queue, and optional persistence.
/// All methods are synchronous; the async driver and HTTP handlers hold this
/// behind a mutex, which keeps the one-writer-per-engine rule by
/// construction.
#[derive(Debug)]
pub struct EngineApi {
    town: AiTown,
    engine: Engine,
    inputs: InputQueue,
    memories: Vec<AgentMemoryRow>,
    persistence: Option<SqliteWorldStore>,
    last_persistence_error: Option<String>,
}

impl EngineApi {
    pub fn from_config(config: WorldConfig) -> Self {
        let town = AiTown::seed(config);
        let engine = Engine::from_doc(town.engine_doc_template());
        let inputs = InputQueue::new(engine.id.clone());
        Self {
            town,
            engine,
            inputs,
            memories: Vec::new(),
            persistence: None,
            last_persistence_error: None,
        }
    }

    /// Resume a previously persisted world, or `None` for a fresh database.
    pub fn load(path: impl AsRef<std::path::Path>) -> Result<Option<Self>, PersistenceError> {
        let store = SqliteWorldStore::open(&path)?;
        let Some(persisted) = store.load_world()? else {
            return Ok(None);
        };

        let mut engine = Engine::from_doc(persisted.engine);
        // The store's deferred-step row survives restarts; re-arm from it
        // when its generation still matches, otherwise the row is stale.
        if let Some((generation, run_at)) = persisted.scheduled_step {
            if engine.is_running() && generation == engine.generation_number {
                engine.state = contracts::EngineState::Running {
                    scheduled_self_ts: run_at,
                };
            }
        }
        let inputs = InputQueue::hydrate(engine.id.clone(), persisted.inputs);
        let town = AiTown::hydrate(
            persisted.config,
            persisted.world,
            persisted.map,
            persisted.players,
            persisted.locations,
            persisted.conversations,
            persisted.members,
            persisted.messages,
            persisted.agents,
        );

        Ok(Some(Self {
            town,
            engine,
            inputs,
            memories: persisted.memories,
            persistence: Some(store),
            last_persistence_error: None,
        }))
    }

    pub fn attach_sqlite_store(
        &mut self,
        path: impl AsRef<std::path::Path>,
    ) -> Result<(), PersistenceError> {
        let mut store = SqliteWorldStore::open(path)?;
        let flush = self.town.flush_everything();
        store.persist_bootstrap(&self.town.config, &self.engine.doc(), &self.town.map, &flush)?;
        for memory in &self.memories {
            store.persist_memory(memory)?;
        }
        self.persistence = Some(store);
        Ok(())
    }

    pub fn engine_doc(&self) -> EngineDoc {
        self.engine.doc()
    }

    pub fn snapshot(&self) -> WorldSnapshot {
        self.town.snapshot()
    }

    pub fn world_id(&self) -> &str {
        &self.town.world.id
    }

    pub fn config(&self) -> &WorldConfig {
        &self.town.config
    }

    pub fn last_persistence_error(&self) -> Option<&str> {
        self.last_persistence_error.as_deref()
    }

    pub fn start(&mut self, now: f64) -> EngineDoc {
        self.engine.start(now);
        self.town.set_status(WorldStatus::Running);
        self.town.touch(now);
        self.persist_engine_and_world();
        self.engine.doc()
    }

    pub fn stop(&mut self, now: f64) -> EngineDoc {
        self.engine.stop();
        self.town.set_status(WorldStatus::StoppedByDeveloper);
        self.town.touch(now);
        self.persist_engine_and_world();
        self.engine.doc()
    }

    pub fn kick(&mut self, now: f64) -> EngineDoc {
        self.engine.kick(now);
        self.persist_engine_and_world();
        self.engine.doc()
    }

    /// Record a client sighting so the idle sweep leaves this world alone.
    pub fn heartbeat(&mut self, now: f64) {
        self.town.touch(now);
        self.persist_engine_and_world();
    }

    /// Stop a world nobody has viewed for the idle window. Returns whether
    /// the sweep fired.
    pub fn stop_if_idle(&mut self, now: f64) -> bool {
        if !self.engine.is_running() {
            return false;
        }
        if now - self.town.world.last_viewed < IDLE_WORLD_TIMEOUT {
            return false;
        }
        self.engine.stop();
        self.town.set_status(WorldStatus::Inactive);
        self.persist_engine_and_world();
        true
    }

    /// Queue an input. Bounds input latency by kicking the engine when its
    /// next step is too far out.
    pub fn send_input(&mut self, payload: InputPayload, now: f64) -> Id {
        let doc = self.inputs.insert(payload, now);
        if self.engine.wants_kick(now) {
            self.engine.kick(now);
        }
        if let Some(store) = self.persistence.as_mut() {
            if let Err(err) = store
                .persist_input(&doc)
                .and_then(|_| store.persist_engine(&self.engine.doc()))
            {
                self.last_persistence_error = Some(err.to_string());
            }
        }
        doc.id
    }

    /// `None`: unknown id. `Some(None)`: accepted, not yet processed.
    pub fn input_status(&self, input_id: &str) -> Option<Option<InputReturn>> {
        self.inputs
            .get_by_id(input_id)
            .map(|input| input.return_value.clone())
    }

    /// The generation to run now, if the engine's self-schedule is due.
    pub fn due_generation(&self, now: f64) -> Option<u64> {
        let scheduled = self.engine.doc().state.scheduled_self_ts()?;
        (scheduled <= now).then_some(self.engine.generation_number)
    }

    pub fn next_scheduled_ts(&self) -> Option<f64> {
        self.engine.doc().state.scheduled_self_ts()
    }

    /// Run one engine step under the given generation and persist the write
    /// set atomically. A persistence failure leaves the error on record and
    /// the next step re-persists the full dirty state.
    pub fn run_step(&mut self, generation: u64, now: f64) -> bool {
        let outcome = self
            .engine
            .run_step(&mut self.town, &mut self.inputs, generation, now);

        if let Some(store) = self.persistence.as_mut() {
            let result = match (&outcome.flush, outcome.committed) {
                (Some(flush), true) => {
                    store.persist_step(&self.engine.doc(), &outcome.processed_inputs, flush)
                }
                _ => store.persist_engine(&self.engine.doc()),
            };
            match result {
                Ok(()) => self.last_persistence_error = None,
                Err(err) => self.last_persistence_error = Some(err.to_string()),
            }
        }

        outcome.committed
    }

    pub fn agent_ids(&self) -> Vec<Id> {
        self.town.agents.iter_active().map(|a| a.id.clone()).collect()
    }

    pub fn agent(&self, agent_id: &str) -> Option<AgentDoc> {
        self.town.agents.get(agent_id).cloned()
    }

    /// Consult the pure policy for one agent.
    pub fn decide(&self, agent_id: &str, now: f64) -> Option<AgentDecision> {
        let agent = self.town.agents.get(agent_id)?;
        Some(agent::decide(&self.town, agent, now))
    }

    pub fn town(&self) -> &AiTown {
        &self.town
    }

    pub fn store_memory(&mut self, memory: AgentMemoryRow) {
        if let Some(store) = self.persistence.as_mut() {
            if let Err(err) = store.persist_memory(&memory) {
                self.last_persistence_error = Some(err.to_string());
            }
        }
        self.memories.push(memory);
    }

    pub fn memories_for(&self, player_id: &str) -> Vec<&AgentMemoryRow> {
        self.memories
            .iter()
            .filter(|memory| memory.player_id == player_id)
            .collect()
    }

    fn persist_engine_and_world(&mut self) {
        if let Some(store) = self.persistence.as_mut() {
            let result = store
                .persist_engine(&self.engine.doc())
                .and_then(|_| store.persist_world(&self.town.world));
            if let Err(err) = result {
                self.last_persistence_error = Some(err.to_string());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use contracts::constants::{INPUT_DELAY, STEP_INTERVAL};
    use contracts::geometry::Point;

    fn temp_db_path(name: &str) -> std::path::PathBuf {
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .expect("clock moves forward")
            .as_nanos();
        std::env::temp_dir().join(format!("town_api_{name}_{nanos}.sqlite"))
    }

    fn cleanup(path: &std::path::Path) {
        let _ = std::fs::remove_file(path);
        let _ = std::fs::remove_file(path.with_extension("sqlite-wal"));
        let _ = std::fs::remove_file(path.with_extension("sqlite-shm"));
    }

    fn join(name: &str) -> InputPayload {
        InputPayload::Join {
            name: name.to_string(),
            character: "f7".to_string(),
            description: format!("{name} from the tests"),
        }
    }

    #[test]
    fn input_status_moves_from_pending_to_processed() {
        let mut api = EngineApi::from_config(WorldConfig::default());
        api.start(0.0);

        let input_id = api.send_input(join("Wren"), 100.0);
        assert_eq!(api.input_status(&input_id), Some(None));
        assert_eq!(api.input_status("inputs:404"), None);

        let generation = api.due_generation(500.0).expect("step due");
        assert!(api.run_step(generation, 500.0));

        match api.input_status(&input_id) {
            Some(Some(InputReturn::Ok { value })) => {
                assert!(value.get("playerId").is_some());
            }
            other => panic!("expected ok return, got {other:?}"),
        }
    }

    #[test]
    fn distant_schedule_kicks_on_input() {
        let mut api = EngineApi::from_config(WorldConfig::default());
        api.start(0.0);
        let generation = api.due_generation(0.0).expect("due at start");
        api.run_step(generation, 400.0);

        // Next step sits STEP_INTERVAL out; a fresh input inside the delay
        // window must not kick...
        let before = api.engine_doc().generation_number;
        let scheduled = api.next_scheduled_ts().expect("scheduled");
        assert!(scheduled - 400.0 <= INPUT_DELAY);
        api.send_input(join("Wren"), 400.0);
        assert_eq!(api.engine_doc().generation_number, before);

        // ...but one sent while the schedule is far away does.
        let mut api = EngineApi::from_config(WorldConfig::default());
        api.start(0.0);
        let generation = api.due_generation(0.0).expect("due");
        api.run_step(generation, 600_000.0);
        let scheduled = api.next_scheduled_ts().expect("scheduled");
        let now = scheduled - INPUT_DELAY - 500.0;
        let before = api.engine_doc().generation_number;
        api.send_input(join("Brin"), now);
        assert_eq!(api.engine_doc().generation_number, before + 1);
        assert_eq!(api.next_scheduled_ts(), Some(now));
    }

    #[test]
    fn persisted_world_resumes_with_queue_and_schedule() {
        let path = temp_db_path("resume");
        let mut api = EngineApi::from_config(WorldConfig::default());
        api.attach_sqlite_store(&path).expect("attach");
        api.start(0.0);

        let input_id = api.send_input(join("Wren"), 100.0);
        let generation = api.due_generation(500.0).expect("due");
        assert!(api.run_step(generation, 500.0));
        assert!(api.last_persistence_error().is_none());
        let engine_before = api.engine_doc();
        let snapshot_before = api.snapshot();
        drop(api);

        let resumed = EngineApi::load(&path).expect("load").expect("world present");
        assert_eq!(resumed.engine_doc(), engine_before);
        assert_eq!(
            resumed.next_scheduled_ts(),
            Some(500.0 + STEP_INTERVAL)
        );
        match resumed.input_status(&input_id) {
            Some(Some(InputReturn::Ok { .. })) => {}
            other => panic!("processed input lost across restart: {other:?}"),
        }
        assert_eq!(resumed.snapshot().players, snapshot_before.players);

        cleanup(&path);
    }

    #[test]
    fn fresh_database_loads_as_none() {
        let path = temp_db_path("fresh");
        assert!(EngineApi::load(&path).expect("open").is_none());
        cleanup(&path);
    }

    #[test]
    fn idle_sweep_stops_unviewed_worlds() {
        let mut api = EngineApi::from_config(WorldConfig::default());
        api.start(0.0);

        assert!(!api.stop_if_idle(IDLE_WORLD_TIMEOUT - 1.0));
        api.heartbeat(1000.0);
        assert!(!api.stop_if_idle(1000.0 + IDLE_WORLD_TIMEOUT - 1.0));
        assert!(api.stop_if_idle(1000.0 + IDLE_WORLD_TIMEOUT));

        let doc = api.engine_doc();
        assert!(!doc.state.is_running());
        assert_eq!(api.snapshot().world.status, WorldStatus::Inactive);
    }

    #[test]
    fn memories_round_trip_through_the_store() {
        let path = temp_db_path("memories");
        let mut api = EngineApi::from_config(WorldConfig::default());
        api.attach_sqlite_store(&path).expect("attach");

        api.store_memory(AgentMemoryRow {
            id: "memories:1".to_string(),
            player_id: "players:1".to_string(),
            partner_id: "players:2".to_string(),
            summary: "Talked about the harvest with Brin.".to_string(),
            embedding: vec![0.25, -0.5, 1.0],
            created_ts: 123.0,
        });
        drop(api);

        let resumed = EngineApi::load(&path).expect("load").expect("present");
        let memories = resumed.memories_for("players:1");
        assert_eq!(memories.len(), 1);
        assert_eq!(memories[0].embedding, vec![0.25, -0.5, 1.0]);

        cleanup(&path);
    }

    #[test]
    fn blocked_destination_surfaces_as_an_input_error() {
        let mut api = EngineApi::from_config(WorldConfig {
            blocked_tiles: vec![(9, 9)],
            ..WorldConfig::default()
        });
        api.start(0.0);
        let player_id = api
            .snapshot()
            .players
            .first()
            .map(|p| p.id.clone())
            .expect("seeded player");

        let input_id = api.send_input(
            InputPayload::MoveTo {
                player_id,
                destination: Some(Point { x: 9.0, y: 9.0 }),
            },
            100.0,
        );
        let generation = api.due_generation(500.0).expect("due");
        api.run_step(generation, 500.0);

        match api.input_status(&input_id) {
            Some(Some(InputReturn::Error { message })) => {
                assert!(message.contains("blocked"));
            }
            other => panic!("expected error return, got {other:?}"),
        }
    }
}
