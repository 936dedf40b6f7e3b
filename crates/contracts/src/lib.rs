//! Cross-boundary contracts for the town kernel, API, persistence, and clients.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub mod constants;
pub mod geometry;
pub mod history;
pub mod serde_u64_string;

use geometry::{Path, Point};

pub const SCHEMA_VERSION_V1: &str = "1.0";

/// Document ids are strings prefixed with their table name, e.g. `players:3`.
pub type Id = String;

pub fn make_id(table: &str, n: u64) -> Id {
    format!("{table}:{n}")
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EngineState {
    Stopped,
    Running { scheduled_self_ts: f64 },
}

impl EngineState {
    pub fn is_running(&self) -> bool {
        matches!(self, Self::Running { .. })
    }

    pub fn scheduled_self_ts(&self) -> Option<f64> {
        match self {
            Self::Running { scheduled_self_ts } => Some(*scheduled_self_ts),
            Self::Stopped => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EngineDoc {
    pub id: Id,
    pub generation_number: u64,
    pub state: EngineState,
    pub current_time: Option<f64>,
    pub last_step_ts: Option<f64>,
    pub processed_input_number: Option<u64>,
}

// ---------------------------------------------------------------------------
// Inputs
// ---------------------------------------------------------------------------

/// An externally submitted command, applied by the engine in `number` order.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InputDoc {
    pub id: Id,
    pub engine_id: Id,
    pub number: u64,
    #[serde(flatten)]
    pub payload: InputPayload,
    pub received_ts: f64,
    pub return_value: Option<InputReturn>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "name", content = "args", rename_all = "camelCase")]
pub enum InputPayload {
    Join {
        name: String,
        character: String,
        description: String,
    },
    Leave {
        player_id: Id,
    },
    MoveTo {
        player_id: Id,
        destination: Option<Point>,
    },
    StartConversation {
        player_id: Id,
        invitee_id: Id,
    },
    AcceptInvite {
        player_id: Id,
        conversation_id: Id,
    },
    RejectInvite {
        player_id: Id,
        conversation_id: Id,
    },
    LeaveConversation {
        player_id: Id,
        conversation_id: Id,
    },
    SendMessage {
        player_id: Id,
        conversation_id: Id,
        text: String,
    },
    StartTyping {
        player_id: Id,
        conversation_id: Id,
    },
}

impl InputPayload {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Join { .. } => "join",
            Self::Leave { .. } => "leave",
            Self::MoveTo { .. } => "moveTo",
            Self::StartConversation { .. } => "startConversation",
            Self::AcceptInvite { .. } => "acceptInvite",
            Self::RejectInvite { .. } => "rejectInvite",
            Self::LeaveConversation { .. } => "leaveConversation",
            Self::SendMessage { .. } => "sendMessage",
            Self::StartTyping { .. } => "startTyping",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum InputReturn {
    Ok { value: Value },
    Error { message: String },
}

impl InputReturn {
    pub fn ok(value: Value) -> Self {
        Self::Ok { value }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// World, map, players
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum WorldStatus {
    Running,
    StoppedByDeveloper,
    Inactive,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorldDoc {
    pub id: Id,
    pub engine_id: Id,
    pub map_id: Id,
    pub status: WorldStatus,
    pub is_default: bool,
    pub last_viewed: f64,
}

/// Static tile map. `object_tiles[y][x]` is `-1` for walkable, any other
/// value marks the cell blocked by scenery.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorldMap {
    pub id: Id,
    pub width: i64,
    pub height: i64,
    pub object_tiles: Vec<Vec<i64>>,
}

impl WorldMap {
    pub fn in_bounds(&self, x: i64, y: i64) -> bool {
        x >= 0 && y >= 0 && x < self.width && y < self.height
    }

    pub fn tile_blocked(&self, x: i64, y: i64) -> bool {
        if !self.in_bounds(x, y) {
            return true;
        }
        self.object_tiles[y as usize][x as usize] != -1
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PlayerDoc {
    pub id: Id,
    pub world_id: Id,
    pub name: String,
    pub description: String,
    pub character: String,
    pub location_id: Id,
    pub active: bool,
    pub human: bool,
    pub path: Option<Path>,
    pub destination: Option<Point>,
    /// When the current routing attempt began, for the give-up deadline.
    pub pathfinding_started: Option<f64>,
    /// Earliest time the next routing attempt may run.
    pub next_pathfinding_ts: Option<f64>,
}

/// The history-sampled record: `x`, `y`, `dx`, `dy`, `velocity` are the
/// tracked fields, `history` carries the packed sample buffer after a flush.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LocationDoc {
    pub id: Id,
    pub x: f64,
    pub y: f64,
    pub dx: f64,
    pub dy: f64,
    pub velocity: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub history: Option<Vec<u8>>,
}

// ---------------------------------------------------------------------------
// Conversations
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConversationDoc {
    pub id: Id,
    pub world_id: Id,
    pub creator_id: Id,
    pub created_ts: f64,
    pub num_messages: u32,
    pub last_message_ts: Option<f64>,
    pub typing: Option<TypingClaim>,
    pub finished: Option<ConversationFinished>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TypingClaim {
    pub player_id: Id,
    pub started_ts: f64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct ConversationFinished {
    pub ended_at: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum MemberStatus {
    Invited { invited_ts: f64 },
    WalkingOver,
    Participating { started_ts: f64 },
    Left,
}

impl MemberStatus {
    pub fn is_participating(&self) -> bool {
        matches!(self, Self::Participating { .. })
    }

    pub fn has_left(&self) -> bool {
        matches!(self, Self::Left)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MemberDoc {
    pub id: Id,
    pub conversation_id: Id,
    pub player_id: Id,
    pub status: MemberStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MessageDoc {
    pub id: Id,
    pub conversation_id: Id,
    pub author_id: Id,
    pub text: String,
    pub ts: f64,
}

// ---------------------------------------------------------------------------
// Agents
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentDoc {
    pub id: Id,
    pub world_id: Id,
    pub player_id: Id,
    pub identity: String,
    pub plan: String,
    /// Next time the policy should be consulted at all.
    pub next_decision_ts: f64,
    /// When this agent last finished any conversation.
    pub last_conversation_ts: Option<f64>,
    /// When this agent last sent an invite, successful or not.
    pub last_invite_ts: Option<f64>,
    /// Per-peer conversation cooldowns, keyed by the partner's player id.
    #[serde(default)]
    pub conversation_cooldowns: BTreeMap<Id, f64>,
}

/// Seed material for one townsperson.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentPersona {
    pub name: String,
    pub character: String,
    pub identity: String,
    pub plan: String,
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorldConfig {
    pub schema_version: String,
    pub world_id: Id,
    #[serde(with = "serde_u64_string")]
    pub seed: u64,
    #[serde(default = "default_map_width")]
    pub map_width: i64,
    #[serde(default = "default_map_height")]
    pub map_height: i64,
    /// Blocked cells of the object layer, as `(x, y)` pairs.
    #[serde(default)]
    pub blocked_tiles: Vec<(i64, i64)>,
    #[serde(default = "default_personas")]
    pub personas: Vec<AgentPersona>,
    pub notes: Option<String>,
}

impl Default for WorldConfig {
    fn default() -> Self {
        Self {
            schema_version: SCHEMA_VERSION_V1.to_string(),
            world_id: "worlds:default".to_string(),
            seed: 1337,
            map_width: default_map_width(),
            map_height: default_map_height(),
            blocked_tiles: Vec::new(),
            personas: default_personas(),
            notes: None,
        }
    }
}

fn default_map_width() -> i64 {
    32
}

fn default_map_height() -> i64 {
    24
}

fn default_personas() -> Vec<AgentPersona> {
    vec![
        AgentPersona {
            name: "Maren".to_string(),
            character: "f1".to_string(),
            identity: "Maren runs the bakery and knows every regular by their order. \
                       She is warm, talkative, and collects gossip like flour dust."
                .to_string(),
            plan: "Keep the ovens going and find out what the newcomers are up to."
                .to_string(),
        },
        AgentPersona {
            name: "Toby".to_string(),
            character: "f2".to_string(),
            identity: "Toby repairs clocks and dislikes being interrupted, though he \
                       secretly enjoys company once a conversation gets going."
                .to_string(),
            plan: "Finish the town hall clock and avoid small talk, mostly.".to_string(),
        },
        AgentPersona {
            name: "Suki".to_string(),
            character: "f3".to_string(),
            identity: "Suki is a travelling botanist cataloguing the hedgerows. She \
                       asks a lot of questions and answers even more."
                .to_string(),
            plan: "Survey the east meadow and trade cuttings with anyone willing."
                .to_string(),
        },
        AgentPersona {
            name: "Aldous".to_string(),
            character: "f4".to_string(),
            identity: "Aldous retired from the coastal ferry and narrates the weather \
                       like it owes him money. Slow to warm, loyal after."
                .to_string(),
            plan: "Walk the square twice a day and correct anyone wrong about tides."
                .to_string(),
        },
    ]
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// World-level failures surfaced as an input's `{kind:"error"}` return value.
#[derive(Debug, Clone, PartialEq)]
pub enum InputError {
    InvalidId { id: Id },
    InactiveId { id: Id },
    BlockedDestination { x: f64, y: f64 },
    NoRoute,
    PathExhausted,
    ConversationFull { conversation_id: Id },
    ConversationFinished { conversation_id: Id },
    DuplicateJoin { name: String },
    InConversation { player_id: Id },
    NotInConversation { player_id: Id },
}

impl fmt::Display for InputError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidId { id } => write!(f, "invalid id: {id}"),
            Self::InactiveId { id } => write!(f, "id is no longer active: {id}"),
            Self::BlockedDestination { x, y } => {
                write!(f, "destination ({x}, {y}) is blocked")
            }
            Self::NoRoute => write!(f, "no route to destination"),
            Self::PathExhausted => write!(f, "path consulted past its final timestamp"),
            Self::ConversationFull { conversation_id } => {
                write!(f, "conversation {conversation_id} already has two members")
            }
            Self::ConversationFinished { conversation_id } => {
                write!(f, "conversation {conversation_id} has finished")
            }
            Self::DuplicateJoin { name } => {
                write!(f, "player {name} has already joined")
            }
            Self::InConversation { player_id } => {
                write!(f, "player {player_id} is in a conversation")
            }
            Self::NotInConversation { player_id } => {
                write!(f, "player {player_id} is not in that conversation")
            }
        }
    }
}

impl std::error::Error for InputError {}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    WorldNotFound,
    InputNotFound,
    InvalidInput,
    EngineStateConflict,
    ContractVersionUnsupported,
    InternalError,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ApiError {
    pub schema_version: String,
    pub error_code: ErrorCode,
    pub message: String,
    pub details: Option<String>,
}

impl ApiError {
    pub fn new(error_code: ErrorCode, message: impl Into<String>, details: Option<String>) -> Self {
        Self {
            schema_version: SCHEMA_VERSION_V1.to_string(),
            error_code,
            message: message.into(),
            details,
        }
    }
}

// ---------------------------------------------------------------------------
// Snapshots
// ---------------------------------------------------------------------------

/// Read-only view of a world handed to clients; assembled fresh per request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorldSnapshot {
    pub world: WorldDoc,
    pub players: Vec<PlayerDoc>,
    pub locations: Vec<LocationDoc>,
    pub conversations: Vec<ConversationDoc>,
    pub members: Vec<MemberDoc>,
    pub messages: Vec<MessageDoc>,
    pub agents: Vec<AgentDoc>,
}

// ---------------------------------------------------------------------------
// Time sync feed
// ---------------------------------------------------------------------------

/// One contiguous stretch of server time covered by committed engine steps.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct ServerTimeInterval {
    pub start_ts: f64,
    pub end_ts: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn input_payload_round_trips_with_rpc_field_names() {
        let payload = InputPayload::MoveTo {
            player_id: "players:1".to_string(),
            destination: Some(Point { x: 3.0, y: 4.0 }),
        };
        let raw = serde_json::to_value(&payload).expect("serialize");
        assert_eq!(raw.get("name").and_then(Value::as_str), Some("moveTo"));
        assert!(raw.get("args").is_some());

        let decoded: InputPayload = serde_json::from_value(raw).expect("deserialize");
        assert_eq!(decoded, payload);
    }

    #[test]
    fn input_return_uses_lowercase_kind_tags() {
        let ok = serde_json::to_value(InputReturn::ok(Value::Null)).expect("ok");
        assert_eq!(ok.get("kind").and_then(Value::as_str), Some("ok"));

        let err = serde_json::to_value(InputReturn::error("boom")).expect("err");
        assert_eq!(err.get("kind").and_then(Value::as_str), Some("error"));
    }

    #[test]
    fn map_blocking_respects_bounds_and_object_layer() {
        let map = WorldMap {
            id: "maps:1".to_string(),
            width: 2,
            height: 2,
            object_tiles: vec![vec![-1, 7], vec![-1, -1]],
        };
        assert!(!map.tile_blocked(0, 0));
        assert!(map.tile_blocked(1, 0));
        assert!(map.tile_blocked(-1, 0));
        assert!(map.tile_blocked(0, 2));
    }

    #[test]
    fn default_config_seeds_distinct_personas() {
        let config = WorldConfig::default();
        let names = config
            .personas
            .iter()
            .map(|p| p.name.clone())
            .collect::<std::collections::BTreeSet<_>>();
        assert_eq!(names.len(), config.personas.len());
    }
}
