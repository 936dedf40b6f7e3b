use std::collections::BTreeMap;

mod conversations;
mod init;
mod inputs;
mod movement;

use contracts::geometry::Point;
use contracts::{
    make_id, AgentDoc, ConversationDoc, Id, LocationDoc, MemberDoc, MemberStatus, MessageDoc,
    PlayerDoc, WorldConfig, WorldDoc, WorldMap, WorldSnapshot, WorldStatus,
};

use crate::game_table::{GameRecord, GameTable, TableFlush};
use crate::historical::{HistoricalRecord, HistoricalTable};

const SNAPSHOT_MESSAGE_LIMIT: usize = 256;

impl GameRecord for PlayerDoc {
    fn id(&self) -> &str {
        &self.id
    }

    fn is_active(&self) -> bool {
        self.active
    }
}

impl GameRecord for LocationDoc {
    fn id(&self) -> &str {
        &self.id
    }
}

impl GameRecord for ConversationDoc {
    fn id(&self) -> &str {
        &self.id
    }

    fn is_active(&self) -> bool {
        self.finished.is_none()
    }
}

impl GameRecord for MemberDoc {
    fn id(&self) -> &str {
        &self.id
    }
}

impl GameRecord for MessageDoc {
    fn id(&self) -> &str {
        &self.id
    }
}

impl GameRecord for AgentDoc {
    fn id(&self) -> &str {
        &self.id
    }
}

impl HistoricalRecord for LocationDoc {
    const TRACKED_FIELDS: &'static [&'static str] = &["dx", "dy", "velocity", "x", "y"];

    fn tracked_value(&self, field: &str) -> f64 {
        match field {
            "x" => self.x,
            "y" => self.y,
            "dx" => self.dx,
            "dy" => self.dy,
            "velocity" => self.velocity,
            _ => 0.0,
        }
    }

    fn set_history(&mut self, blob: Vec<u8>) {
        self.history = Some(blob);
    }
}

/// The write set one committed step hands to the transaction.
#[derive(Debug)]
pub struct WorldFlush {
    pub world: WorldDoc,
    pub players: TableFlush<PlayerDoc>,
    pub locations: TableFlush<LocationDoc>,
    pub conversations: TableFlush<ConversationDoc>,
    pub members: TableFlush<MemberDoc>,
    pub messages: TableFlush<MessageDoc>,
    pub agents: TableFlush<AgentDoc>,
}

/// One tick's worth of world state: map, players, locations, conversations,
/// and agents, mutated only through `apply_input` and `tick`.
#[derive(Debug)]
pub struct AiTown {
    pub config: WorldConfig,
    pub world: WorldDoc,
    pub map: WorldMap,
    pub players: GameTable<PlayerDoc>,
    pub locations: HistoricalTable<LocationDoc>,
    pub conversations: GameTable<ConversationDoc>,
    pub members: GameTable<MemberDoc>,
    pub messages: GameTable<MessageDoc>,
    pub agents: GameTable<AgentDoc>,
    next_doc_number: u64,
}

impl AiTown {
    /// Advance the world by one tick ending at `now`. Rule order is fixed:
    /// movement (with collision stalls and replanning), then conversation
    /// membership and lifetime enforcement, then history sampling.
    pub fn tick(&mut self, now: f64) {
        self.tick_movement(now);
        self.tick_conversations(now);
        self.locations.sample_tick(now);
    }

    pub fn flush(&mut self) -> WorldFlush {
        WorldFlush {
            world: self.world.clone(),
            players: self.players.save(),
            locations: self.locations.save(),
            conversations: self.conversations.save(),
            members: self.members.save(),
            messages: self.messages.save(),
            agents: self.agents.save(),
        }
    }

    /// A flush carrying every row regardless of dirtiness, for bootstrap
    /// writes. Also drains the pending dirty sets.
    pub fn flush_everything(&mut self) -> WorldFlush {
        let _ = self.flush();
        WorldFlush {
            world: self.world.clone(),
            players: TableFlush {
                deleted: Vec::new(),
                replaced: self.players.iter_all().cloned().collect(),
            },
            locations: TableFlush {
                deleted: Vec::new(),
                replaced: self.locations.iter_all().cloned().collect(),
            },
            conversations: TableFlush {
                deleted: Vec::new(),
                replaced: self.conversations.iter_all().cloned().collect(),
            },
            members: TableFlush {
                deleted: Vec::new(),
                replaced: self.members.iter_all().cloned().collect(),
            },
            messages: TableFlush {
                deleted: Vec::new(),
                replaced: self.messages.iter_all().cloned().collect(),
            },
            agents: TableFlush {
                deleted: Vec::new(),
                replaced: self.agents.iter_all().cloned().collect(),
            },
        }
    }

    pub fn touch(&mut self, now: f64) {
        self.world.last_viewed = now;
    }

    pub fn set_status(&mut self, status: WorldStatus) {
        self.world.status = status;
    }

    pub fn snapshot(&self) -> WorldSnapshot {
        let mut messages: Vec<MessageDoc> = self.messages.iter_active().cloned().collect();
        if messages.len() > SNAPSHOT_MESSAGE_LIMIT {
            messages.drain(..messages.len() - SNAPSHOT_MESSAGE_LIMIT);
        }
        WorldSnapshot {
            world: self.world.clone(),
            players: self.players.iter_all().cloned().collect(),
            locations: self.locations.iter_active().cloned().collect(),
            conversations: self.conversations.iter_all().cloned().collect(),
            members: self.members.iter_all().cloned().collect(),
            messages,
            agents: self.agents.iter_all().cloned().collect(),
        }
    }

    pub(crate) fn allocate_id(&mut self, table: &str) -> Id {
        let id = make_id(table, self.next_doc_number);
        self.next_doc_number += 1;
        id
    }

    /// Current position of a player, read through its location row.
    pub fn player_point(&self, player: &PlayerDoc) -> Option<Point> {
        self.locations
            .get(&player.location_id)
            .map(|loc| Point { x: loc.x, y: loc.y })
    }

    /// The player's membership in its current unfinished conversation.
    pub fn active_member(&self, player_id: &str) -> Option<&MemberDoc> {
        self.members.find(|member| {
            member.player_id == player_id
                && !member.status.has_left()
                && self
                    .conversations
                    .get(&member.conversation_id)
                    .map(|c| c.finished.is_none())
                    .unwrap_or(false)
        })
    }

    pub fn members_of(&self, conversation_id: &str) -> Vec<&MemberDoc> {
        self.members
            .filter(|member| member.conversation_id == conversation_id)
    }

    pub fn messages_of(&self, conversation_id: &str) -> Vec<&MessageDoc> {
        self.messages
            .filter(|message| message.conversation_id == conversation_id)
    }
}

pub(crate) fn mix_seed(seed: u64, salt: u64) -> u64 {
    let mut value = seed ^ salt.wrapping_mul(0x9E37_79B9_7F4A_7C15);
    value ^= value.rotate_left(29);
    value = value.wrapping_mul(0x517C_C1B7_2722_0A95);
    value ^ (value >> 31)
}

pub(crate) fn sample_range(seed: u64, stream: u64, min: i64, max: i64) -> i64 {
    if max <= min {
        return min;
    }
    let span = (max - min + 1) as u64;
    min + (mix_seed(seed, stream) % span) as i64
}

/// Deterministic percentage draw in [0, 100).
pub(crate) fn draw_percent(seed: u64, stream: u64) -> u64 {
    mix_seed(seed, stream) % 100
}

pub(crate) fn stable_str_salt(text: &str) -> u64 {
    let mut hash = 0_u64;
    for byte in text.as_bytes() {
        hash = hash.rotate_left(5) ^ u64::from(*byte);
        hash = hash.wrapping_mul(0x9E37_79B9_7F4A_7C15);
    }
    hash
}

pub(crate) fn member_pair<'a>(
    members: &[&'a MemberDoc],
) -> Option<(&'a MemberDoc, &'a MemberDoc)> {
    match members {
        [a, b] => Some((*a, *b)),
        _ => None,
    }
}

pub(crate) fn earliest_participation(members: &[&MemberDoc]) -> Option<f64> {
    members
        .iter()
        .filter_map(|member| match member.status {
            MemberStatus::Participating { started_ts } => Some(started_ts),
            _ => None,
        })
        .fold(None, |acc, ts| {
            Some(match acc {
                Some(best) if best <= ts => best,
                _ => ts,
            })
        })
}

#[cfg(test)]
mod tests;
