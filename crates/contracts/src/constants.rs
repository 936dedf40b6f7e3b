//! Operational constants shared by the kernel, the API shell, and clients.
//! All durations are milliseconds unless noted.

/// One simulated time increment inside a step.
pub const TICK: f64 = 16.0;
/// Cadence at which a running engine schedules its next step.
pub const STEP_INTERVAL: f64 = 1000.0;
/// Upper bound on simulated time advanced by a single step.
pub const MAX_STEP: f64 = 600_000.0;
/// An input waiting longer than this kicks the engine.
pub const INPUT_DELAY: f64 = 1000.0;

pub const PATHFINDING_TIMEOUT: f64 = 60_000.0;
pub const PATHFINDING_BACKOFF: f64 = 1000.0;
/// Tiles per second.
pub const MOVEMENT_SPEED: f64 = 0.75;
/// Tiles. A candidate closer than this to another player is blocked.
pub const COLLISION_THRESHOLD: f64 = 0.75;
/// Tiles. Members this close may begin participating.
pub const CONVERSATION_DISTANCE: f64 = 1.3;

pub const TYPING_TIMEOUT: f64 = 15_000.0;
pub const MAX_CONVERSATION_DURATION: f64 = 120_000.0;
pub const MAX_CONVERSATION_MESSAGES: u32 = 8;

pub const MESSAGE_COOLDOWN: f64 = 2000.0;
pub const ACTION_TIMEOUT: f64 = 60_000.0;
pub const INVITE_TIMEOUT: f64 = 60_000.0;
pub const AWKWARD_CONVERSATION_TIMEOUT: f64 = 20_000.0;
pub const CONVERSATION_COOLDOWN: f64 = 15_000.0;
pub const PLAYER_CONVERSATION_COOLDOWN: f64 = 60_000.0;
/// Chance, in percent, that an idle agent accepts a pending invite.
pub const INVITE_ACCEPT_PERCENT: u64 = 80;

pub const IDLE_WORLD_TIMEOUT: f64 = 300_000.0;
pub const WORLD_HEARTBEAT_INTERVAL: f64 = 60_000.0;

/// Playback rate control: buffers below the soft minimum slow the client
/// down, buffers above the soft maximum speed it up, and the hard clamp
/// keeps the cursor within one tick interval of received server time.
pub const SOFT_MIN_SERVER_BUFFER: f64 = 100.0;
pub const SOFT_MAX_SERVER_BUFFER: f64 = 1000.0;
pub const MAX_SERVER_BUFFER: f64 = 1250.0;
pub const SLOW_PLAYBACK_RATE: f64 = 0.8;
pub const FAST_PLAYBACK_RATE: f64 = 1.2;
