use super::*;

use contracts::EngineDoc;
use contracts::EngineState;

/// Tiles near the map edge are kept clear so spawns never start boxed in.
const SPAWN_MARGIN: i64 = 2;

impl AiTown {
    /// Build a world from config: the map with deterministic scenery, one
    /// player + location + agent per persona, and an empty conversation set.
    pub fn seed(config: WorldConfig) -> Self {
        let world_id = config.world_id.clone();
        let engine_id = format!("engines:{world_id}");
        let map_id = format!("maps:{world_id}");

        let map = generate_map(&config, map_id.clone());
        let world = WorldDoc {
            id: world_id.clone(),
            engine_id,
            map_id,
            status: WorldStatus::Running,
            is_default: true,
            last_viewed: 0.0,
        };

        let mut town = Self {
            config,
            world,
            map,
            players: GameTable::new(),
            locations: HistoricalTable::new(),
            conversations: GameTable::new(),
            members: GameTable::new(),
            messages: GameTable::new(),
            agents: GameTable::new(),
            next_doc_number: 0,
        };

        for index in 0..town.config.personas.len() {
            let persona = town.config.personas[index].clone();
            let spawn = town
                .free_spawn_tile(town.config.seed, index as u64)
                .unwrap_or(Point { x: 1.0, y: 1.0 });

            let location_id = town.allocate_id("locations");
            town.locations.insert(LocationDoc {
                id: location_id.clone(),
                x: spawn.x,
                y: spawn.y,
                dx: 0.0,
                dy: 1.0,
                velocity: 0.0,
                history: None,
            });

            let player_id = town.allocate_id("players");
            town.players.insert(PlayerDoc {
                id: player_id.clone(),
                world_id: town.world.id.clone(),
                name: persona.name.clone(),
                description: persona.identity.clone(),
                character: persona.character.clone(),
                location_id,
                active: true,
                human: false,
                path: None,
                destination: None,
                pathfinding_started: None,
                next_pathfinding_ts: None,
            });

            let agent_id = town.allocate_id("agents");
            town.agents.insert(AgentDoc {
                id: agent_id,
                world_id: town.world.id.clone(),
                player_id,
                identity: persona.identity,
                plan: persona.plan,
                next_decision_ts: 0.0,
                last_conversation_ts: None,
                last_invite_ts: None,
                conversation_cooldowns: BTreeMap::new(),
            });
        }

        town
    }

    /// Rebuild a world from persisted rows. Dirty tracking starts clean;
    /// the id allocator resumes past the highest persisted id.
    #[allow(clippy::too_many_arguments)]
    pub fn hydrate(
        config: WorldConfig,
        world: WorldDoc,
        map: WorldMap,
        players: Vec<PlayerDoc>,
        locations: Vec<LocationDoc>,
        conversations: Vec<ConversationDoc>,
        members: Vec<MemberDoc>,
        messages: Vec<MessageDoc>,
        agents: Vec<AgentDoc>,
    ) -> Self {
        let next_doc_number = [
            max_id_number(players.iter().map(|d| d.id.as_str())),
            max_id_number(locations.iter().map(|d| d.id.as_str())),
            max_id_number(conversations.iter().map(|d| d.id.as_str())),
            max_id_number(members.iter().map(|d| d.id.as_str())),
            max_id_number(messages.iter().map(|d| d.id.as_str())),
            max_id_number(agents.iter().map(|d| d.id.as_str())),
        ]
        .into_iter()
        .flatten()
        .max()
        .map(|n| n + 1)
        .unwrap_or(0);

        Self {
            config,
            world,
            map,
            players: GameTable::hydrate(players),
            locations: HistoricalTable::hydrate(locations),
            conversations: GameTable::hydrate(conversations),
            members: GameTable::hydrate(members),
            messages: GameTable::hydrate(messages),
            agents: GameTable::hydrate(agents),
            next_doc_number,
        }
    }

    pub fn engine_doc_template(&self) -> EngineDoc {
        EngineDoc {
            id: self.world.engine_id.clone(),
            generation_number: 0,
            state: EngineState::Stopped,
            current_time: None,
            last_step_ts: None,
            processed_input_number: None,
        }
    }

    /// A walkable tile clear of every existing player.
    pub(super) fn free_spawn_tile(&self, seed: u64, stream: u64) -> Option<Point> {
        let occupied: Vec<Point> = self
            .players
            .iter_active()
            .filter_map(|player| self.player_point(player))
            .collect();

        let max_x = (self.map.width - 1 - SPAWN_MARGIN).max(SPAWN_MARGIN);
        let max_y = (self.map.height - 1 - SPAWN_MARGIN).max(SPAWN_MARGIN);

        for attempt in 0..256_u64 {
            let x = sample_range(seed, stream.wrapping_mul(1024) + attempt * 2, SPAWN_MARGIN, max_x);
            let y = sample_range(
                seed,
                stream.wrapping_mul(1024) + attempt * 2 + 1,
                SPAWN_MARGIN,
                max_y,
            );
            let candidate = Point {
                x: x as f64,
                y: y as f64,
            };
            if self.map.tile_blocked(x, y) {
                continue;
            }
            let clear = occupied.iter().all(|p| {
                contracts::geometry::distance(*p, candidate)
                    >= contracts::constants::COLLISION_THRESHOLD
            });
            if clear {
                return Some(candidate);
            }
        }

        None
    }
}

fn max_id_number<'a>(ids: impl Iterator<Item = &'a str>) -> Option<u64> {
    ids.filter_map(|id| id.rsplit(':').next())
        .filter_map(|suffix| suffix.parse::<u64>().ok())
        .max()
}

fn generate_map(config: &WorldConfig, map_id: Id) -> WorldMap {
    let width = config.map_width.max(4);
    let height = config.map_height.max(4);
    let mut object_tiles = vec![vec![-1_i64; width as usize]; height as usize];

    // Deterministic scenery scattered away from the spawn margin.
    let scenery_count = ((width * height) / 40) as u64;
    for n in 0..scenery_count {
        let x = sample_range(config.seed, 7000 + n * 2, SPAWN_MARGIN + 1, width - 2 - SPAWN_MARGIN);
        let y = sample_range(
            config.seed,
            7001 + n * 2,
            SPAWN_MARGIN + 1,
            height - 2 - SPAWN_MARGIN,
        );
        object_tiles[y as usize][x as usize] = 1;
    }

    for &(x, y) in &config.blocked_tiles {
        if x >= 0 && y >= 0 && x < width && y < height {
            object_tiles[y as usize][x as usize] = 1;
        }
    }

    WorldMap {
        id: map_id,
        width,
        height,
        object_tiles,
    }
}
