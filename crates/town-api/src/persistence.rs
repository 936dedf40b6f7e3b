use std::fmt;
use std::path::Path;

use contracts::{
    AgentDoc, ConversationDoc, EngineDoc, Id, InputDoc, LocationDoc, MemberDoc, MessageDoc,
    PlayerDoc, WorldConfig, WorldDoc, WorldMap,
};
use rusqlite::{params, Connection, OptionalExtension};
use serde::de::DeserializeOwned;
use serde::Serialize;
use town_core::world::WorldFlush;

#[derive(Debug)]
pub enum PersistenceError {
    Sqlite(rusqlite::Error),
    Serde(serde_json::Error),
    NotAttached,
    Corrupt(String),
}

impl fmt::Display for PersistenceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sqlite(err) => write!(f, "sqlite error: {err}"),
            Self::Serde(err) => write!(f, "serde error: {err}"),
            Self::NotAttached => write!(f, "sqlite store is not attached"),
            Self::Corrupt(what) => write!(f, "persisted state is corrupt: {what}"),
        }
    }
}

impl std::error::Error for PersistenceError {}

impl From<rusqlite::Error> for PersistenceError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Sqlite(value)
    }
}

impl From<serde_json::Error> for PersistenceError {
    fn from(value: serde_json::Error) -> Self {
        Self::Serde(value)
    }
}

/// A remembered conversation, embedded for later retrieval.
#[derive(Debug, Clone, PartialEq)]
pub struct AgentMemoryRow {
    pub id: Id,
    pub player_id: Id,
    pub partner_id: Id,
    pub summary: String,
    pub embedding: Vec<f32>,
    pub created_ts: f64,
}

/// Everything needed to resume a world after a restart.
#[derive(Debug)]
pub struct PersistedWorld {
    pub config: WorldConfig,
    pub engine: EngineDoc,
    pub world: WorldDoc,
    pub map: WorldMap,
    pub players: Vec<PlayerDoc>,
    pub locations: Vec<LocationDoc>,
    pub conversations: Vec<ConversationDoc>,
    pub members: Vec<MemberDoc>,
    pub messages: Vec<MessageDoc>,
    pub agents: Vec<AgentDoc>,
    pub inputs: Vec<InputDoc>,
    pub memories: Vec<AgentMemoryRow>,
    pub scheduled_step: Option<(u64, f64)>,
}

#[derive(Debug)]
pub struct SqliteWorldStore {
    conn: Connection,
}

impl SqliteWorldStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, PersistenceError> {
        let conn = Connection::open(path)?;
        let mut store = Self { conn };
        store.configure()?;
        store.migrate()?;
        Ok(store)
    }

    fn configure(&mut self) -> Result<(), PersistenceError> {
        self.conn.pragma_update(None, "journal_mode", "WAL")?;
        self.conn.pragma_update(None, "foreign_keys", "ON")?;
        Ok(())
    }

    fn migrate(&mut self) -> Result<(), PersistenceError> {
        self.conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS meta (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS engines (
                id TEXT PRIMARY KEY,
                payload_json TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS inputs (
                id TEXT PRIMARY KEY,
                engine_id TEXT NOT NULL,
                number INTEGER NOT NULL,
                payload_json TEXT NOT NULL,
                UNIQUE (engine_id, number)
            );

            CREATE TABLE IF NOT EXISTS worlds (
                id TEXT PRIMARY KEY,
                payload_json TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS maps (
                id TEXT PRIMARY KEY,
                payload_json TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS players (
                id TEXT PRIMARY KEY,
                payload_json TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS locations (
                id TEXT PRIMARY KEY,
                payload_json TEXT NOT NULL,
                history BLOB
            );

            CREATE TABLE IF NOT EXISTS conversations (
                id TEXT PRIMARY KEY,
                payload_json TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS conversation_members (
                id TEXT PRIMARY KEY,
                payload_json TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS messages (
                id TEXT PRIMARY KEY,
                payload_json TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS agents (
                id TEXT PRIMARY KEY,
                payload_json TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS agent_memories (
                id TEXT PRIMARY KEY,
                player_id TEXT NOT NULL,
                partner_id TEXT NOT NULL,
                summary TEXT NOT NULL,
                embedding BLOB NOT NULL,
                created_ts REAL NOT NULL
            );

            CREATE TABLE IF NOT EXISTS scheduled_steps (
                engine_id TEXT PRIMARY KEY,
                generation INTEGER NOT NULL,
                run_at REAL NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_inputs_engine_number ON inputs(engine_id, number);
            CREATE INDEX IF NOT EXISTS idx_memories_player ON agent_memories(player_id);
            ",
        )?;
        Ok(())
    }

    /// First write for a fresh world: config, engine, map, and every table
    /// row, in one transaction.
    pub fn persist_bootstrap(
        &mut self,
        config: &WorldConfig,
        engine: &EngineDoc,
        map: &WorldMap,
        flush: &WorldFlush,
    ) -> Result<(), PersistenceError> {
        let tx = self.conn.transaction()?;
        tx.execute(
            "INSERT OR REPLACE INTO meta (key, value) VALUES ('config', ?1)",
            params![serde_json::to_string(config)?],
        )?;
        tx.execute(
            "INSERT OR REPLACE INTO maps (id, payload_json) VALUES (?1, ?2)",
            params![map.id.as_str(), serde_json::to_string(map)?],
        )?;
        upsert_json(&tx, "engines", &engine.id, engine)?;
        apply_flush(&tx, flush)?;
        tx.commit()?;
        Ok(())
    }

    /// One committed engine step: input return values, the world write set,
    /// the engine row, and the next self-schedule, atomically.
    pub fn persist_step(
        &mut self,
        engine: &EngineDoc,
        processed_inputs: &[InputDoc],
        flush: &WorldFlush,
    ) -> Result<(), PersistenceError> {
        let tx = self.conn.transaction()?;
        for input in processed_inputs {
            upsert_input(&tx, input)?;
        }
        apply_flush(&tx, flush)?;
        upsert_json(&tx, "engines", &engine.id, engine)?;
        upsert_schedule(&tx, engine)?;
        tx.commit()?;
        Ok(())
    }

    pub fn persist_input(&mut self, input: &InputDoc) -> Result<(), PersistenceError> {
        let tx = self.conn.transaction()?;
        upsert_input(&tx, input)?;
        tx.commit()?;
        Ok(())
    }

    pub fn persist_engine(&mut self, engine: &EngineDoc) -> Result<(), PersistenceError> {
        let tx = self.conn.transaction()?;
        upsert_json(&tx, "engines", &engine.id, engine)?;
        upsert_schedule(&tx, engine)?;
        tx.commit()?;
        Ok(())
    }

    pub fn persist_world(&mut self, world: &WorldDoc) -> Result<(), PersistenceError> {
        let tx = self.conn.transaction()?;
        upsert_json(&tx, "worlds", &world.id, world)?;
        tx.commit()?;
        Ok(())
    }

    pub fn persist_memory(&mut self, memory: &AgentMemoryRow) -> Result<(), PersistenceError> {
        let embedding = encode_embedding(&memory.embedding);
        self.conn.execute(
            "INSERT OR REPLACE INTO agent_memories
                (id, player_id, partner_id, summary, embedding, created_ts)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                memory.id.as_str(),
                memory.player_id.as_str(),
                memory.partner_id.as_str(),
                memory.summary.as_str(),
                embedding,
                memory.created_ts,
            ],
        )?;
        Ok(())
    }

    /// Load the single persisted world, or `None` for a fresh database.
    pub fn load_world(&self) -> Result<Option<PersistedWorld>, PersistenceError> {
        let config_raw: Option<String> = self
            .conn
            .query_row("SELECT value FROM meta WHERE key = 'config'", [], |row| {
                row.get(0)
            })
            .optional()?;
        let Some(config_raw) = config_raw else {
            return Ok(None);
        };
        let config: WorldConfig = serde_json::from_str(&config_raw)?;

        let world: WorldDoc = self
            .load_all_json("worlds")?
            .into_iter()
            .next()
            .ok_or_else(|| PersistenceError::Corrupt("no world row".to_string()))?;
        let engine: EngineDoc = self
            .load_all_json("engines")?
            .into_iter()
            .next()
            .ok_or_else(|| PersistenceError::Corrupt("no engine row".to_string()))?;
        let map: WorldMap = self
            .load_all_json("maps")?
            .into_iter()
            .next()
            .ok_or_else(|| PersistenceError::Corrupt("no map row".to_string()))?;

        let scheduled_step: Option<(u64, f64)> = self
            .conn
            .query_row(
                "SELECT generation, run_at FROM scheduled_steps WHERE engine_id = ?1",
                params![engine.id.as_str()],
                |row| Ok((row.get::<_, i64>(0)? as u64, row.get::<_, f64>(1)?)),
            )
            .optional()?;

        Ok(Some(PersistedWorld {
            config,
            world,
            map,
            players: self.load_all_json("players")?,
            locations: self.load_locations()?,
            conversations: self.load_all_json("conversations")?,
            members: self.load_all_json("conversation_members")?,
            messages: self.load_all_json("messages")?,
            agents: self.load_all_json("agents")?,
            inputs: self.load_inputs(&engine.id)?,
            memories: self.load_memories()?,
            engine,
            scheduled_step,
        }))
    }

    pub fn load_memories(&self) -> Result<Vec<AgentMemoryRow>, PersistenceError> {
        let mut stmt = self.conn.prepare(
            "SELECT id, player_id, partner_id, summary, embedding, created_ts
             FROM agent_memories ORDER BY created_ts ASC",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, Vec<u8>>(4)?,
                row.get::<_, f64>(5)?,
            ))
        })?;

        let mut memories = Vec::new();
        for row in rows {
            let (id, player_id, partner_id, summary, embedding, created_ts) = row?;
            memories.push(AgentMemoryRow {
                id,
                player_id,
                partner_id,
                summary,
                embedding: decode_embedding(&embedding),
                created_ts,
            });
        }
        Ok(memories)
    }

    fn load_inputs(&self, engine_id: &str) -> Result<Vec<InputDoc>, PersistenceError> {
        let mut stmt = self.conn.prepare(
            "SELECT payload_json FROM inputs WHERE engine_id = ?1 ORDER BY number ASC",
        )?;
        let rows = stmt.query_map(params![engine_id], |row| row.get::<_, String>(0))?;
        let mut inputs = Vec::new();
        for row in rows {
            inputs.push(serde_json::from_str(&row?)?);
        }
        Ok(inputs)
    }

    fn load_locations(&self) -> Result<Vec<LocationDoc>, PersistenceError> {
        let mut stmt = self
            .conn
            .prepare("SELECT payload_json, history FROM locations ORDER BY id ASC")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, Option<Vec<u8>>>(1)?))
        })?;
        let mut locations = Vec::new();
        for row in rows {
            let (payload, history) = row?;
            let mut doc: LocationDoc = serde_json::from_str(&payload)?;
            doc.history = history;
            locations.push(doc);
        }
        Ok(locations)
    }

    fn load_all_json<T: DeserializeOwned>(&self, table: &str) -> Result<Vec<T>, PersistenceError> {
        let mut stmt = self
            .conn
            .prepare(&format!("SELECT payload_json FROM {table} ORDER BY id ASC"))?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        let mut docs = Vec::new();
        for row in rows {
            docs.push(serde_json::from_str(&row?)?);
        }
        Ok(docs)
    }
}

fn apply_flush(
    tx: &rusqlite::Transaction<'_>,
    flush: &WorldFlush,
) -> Result<(), PersistenceError> {
    upsert_json(tx, "worlds", &flush.world.id, &flush.world)?;

    for id in &flush.players.deleted {
        tx.execute("DELETE FROM players WHERE id = ?1", params![id.as_str()])?;
    }
    for doc in &flush.players.replaced {
        upsert_json(tx, "players", &doc.id, doc)?;
    }

    for id in &flush.locations.deleted {
        tx.execute("DELETE FROM locations WHERE id = ?1", params![id.as_str()])?;
    }
    for doc in &flush.locations.replaced {
        // History rides in its own blob column, not the JSON payload.
        let mut stripped = doc.clone();
        let history = stripped.history.take();
        tx.execute(
            "INSERT OR REPLACE INTO locations (id, payload_json, history) VALUES (?1, ?2, ?3)",
            params![
                doc.id.as_str(),
                serde_json::to_string(&stripped)?,
                history,
            ],
        )?;
    }

    for id in &flush.conversations.deleted {
        tx.execute(
            "DELETE FROM conversations WHERE id = ?1",
            params![id.as_str()],
        )?;
    }
    for doc in &flush.conversations.replaced {
        upsert_json(tx, "conversations", &doc.id, doc)?;
    }

    for id in &flush.members.deleted {
        tx.execute(
            "DELETE FROM conversation_members WHERE id = ?1",
            params![id.as_str()],
        )?;
    }
    for doc in &flush.members.replaced {
        upsert_json(tx, "conversation_members", &doc.id, doc)?;
    }

    for id in &flush.messages.deleted {
        tx.execute("DELETE FROM messages WHERE id = ?1", params![id.as_str()])?;
    }
    for doc in &flush.messages.replaced {
        upsert_json(tx, "messages", &doc.id, doc)?;
    }

    for id in &flush.agents.deleted {
        tx.execute("DELETE FROM agents WHERE id = ?1", params![id.as_str()])?;
    }
    for doc in &flush.agents.replaced {
        upsert_json(tx, "agents", &doc.id, doc)?;
    }

    Ok(())
}

fn upsert_json<T: Serialize>(
    tx: &rusqlite::Transaction<'_>,
    table: &str,
    id: &str,
    doc: &T,
) -> Result<(), PersistenceError> {
    tx.execute(
        &format!("INSERT OR REPLACE INTO {table} (id, payload_json) VALUES (?1, ?2)"),
        params![id, serde_json::to_string(doc)?],
    )?;
    Ok(())
}

fn upsert_input(
    tx: &rusqlite::Transaction<'_>,
    input: &InputDoc,
) -> Result<(), PersistenceError> {
    tx.execute(
        "INSERT OR REPLACE INTO inputs (id, engine_id, number, payload_json)
         VALUES (?1, ?2, ?3, ?4)",
        params![
            input.id.as_str(),
            input.engine_id.as_str(),
            i64::try_from(input.number).unwrap_or(i64::MAX),
            serde_json::to_string(input)?,
        ],
    )?;
    Ok(())
}

fn upsert_schedule(
    tx: &rusqlite::Transaction<'_>,
    engine: &EngineDoc,
) -> Result<(), PersistenceError> {
    match engine.state.scheduled_self_ts() {
        Some(run_at) => {
            tx.execute(
                "INSERT OR REPLACE INTO scheduled_steps (engine_id, generation, run_at)
                 VALUES (?1, ?2, ?3)",
                params![
                    engine.id.as_str(),
                    i64::try_from(engine.generation_number).unwrap_or(i64::MAX),
                    run_at,
                ],
            )?;
        }
        None => {
            tx.execute(
                "DELETE FROM scheduled_steps WHERE engine_id = ?1",
                params![engine.id.as_str()],
            )?;
        }
    }
    Ok(())
}

fn encode_embedding(embedding: &[f32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(embedding.len() * 4);
    for value in embedding {
        out.extend_from_slice(&value.to_le_bytes());
    }
    out
}

fn decode_embedding(raw: &[u8]) -> Vec<f32> {
    raw.chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}
