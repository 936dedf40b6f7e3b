//! Deterministic simulation kernel for the town: game tables, historical
//! sampling, pathfinding, the engine step loop, world rules, the agent
//! policy, and client-side time playback. Pure and synchronous; callers own
//! the clock, the store, and every other effect.

pub mod agent;
pub mod engine;
pub mod game_table;
pub mod historical;
pub mod pathfinding;
pub mod sync;
pub mod util;
pub mod world;

pub use agent::{decide, AgentDecision};
pub use engine::{Engine, InputQueue, StepOutcome};
pub use game_table::{GameRecord, GameTable, TableError, TableFlush};
pub use historical::{HistoricalRecord, HistoricalTable};
pub use pathfinding::{find_route, Obstacle, RouteError, RouteResult};
pub use sync::{HistoricalTime, SyncError};
pub use util::MinHeap;
pub use world::{AiTown, WorldFlush};
