use super::*;

use contracts::constants::{COLLISION_THRESHOLD, PATHFINDING_BACKOFF, PATHFINDING_TIMEOUT};
use contracts::geometry::{self, distance, Path};

use crate::pathfinding::{find_route, Obstacle, RouteError};

impl AiTown {
    /// Advance every travelling player by one tick, stalling on collisions,
    /// and run routing for players that need a path. Failures here never
    /// escape: a player that cannot move is parked and scheduled to replan.
    pub(super) fn tick_movement(&mut self, now: f64) {
        let player_ids: Vec<Id> = self.players.iter_active().map(|p| p.id.clone()).collect();

        for player_id in player_ids {
            let Some(player) = self.players.get(&player_id) else {
                continue;
            };
            if player.path.is_some() {
                self.advance_along_path(&player_id, now);
            } else if player.destination.is_some() {
                self.plan_route(&player_id, now);
            }
        }
    }

    fn advance_along_path(&mut self, player_id: &str, now: f64) {
        let Some(player) = self.players.get(player_id) else {
            return;
        };
        let Some(path) = player.path.clone() else {
            return;
        };
        let location_id = player.location_id.clone();

        let Some(last) = path.last().copied() else {
            let _ = self.players.update(player_id, |p| p.path = None);
            return;
        };

        // Arrival: plant at the endpoint and clear routing state.
        if now >= last.t {
            let _ = self.players.update(player_id, |p| {
                p.path = None;
                p.destination = None;
                p.pathfinding_started = None;
                p.next_pathfinding_ts = None;
            });
            let _ = self.locations.update(&location_id, |loc| {
                loc.x = last.position.x;
                loc.y = last.position.y;
                loc.dx = last.facing.dx;
                loc.dy = last.facing.dy;
                loc.velocity = 0.0;
            });
            return;
        }

        // Interpolation only makes sense inside the path's time span; a
        // walk scheduled to start later has nothing to advance yet.
        if !geometry::path_overlaps(&path, now) {
            return;
        }

        let Ok(step) = geometry::path_position(&path, now) else {
            let _ = self.players.update(player_id, |p| p.path = None);
            return;
        };

        // A planted player sitting on the next position stalls this walker;
        // it parks and replans after the backoff.
        let blocked = self.planted_player_near(player_id, step.position);
        if blocked {
            let _ = self.players.update(player_id, |p| {
                p.path = None;
                p.next_pathfinding_ts = Some(now + PATHFINDING_BACKOFF);
            });
            let _ = self.locations.update(&location_id, |loc| {
                loc.velocity = 0.0;
            });
            return;
        }

        let _ = self.locations.update(&location_id, |loc| {
            loc.x = step.position.x;
            loc.y = step.position.y;
            loc.dx = step.facing.dx;
            loc.dy = step.facing.dy;
            loc.velocity = step.velocity;
        });
    }

    fn plan_route(&mut self, player_id: &str, now: f64) {
        let Some(player) = self.players.get(player_id) else {
            return;
        };
        let Some(destination) = player.destination else {
            return;
        };

        // Routing that keeps failing is abandoned after the deadline.
        if player
            .pathfinding_started
            .map(|started| started + PATHFINDING_TIMEOUT <= now)
            .unwrap_or(false)
        {
            let _ = self.players.update(player_id, |p| {
                p.destination = None;
                p.pathfinding_started = None;
                p.next_pathfinding_ts = None;
            });
            return;
        }

        let ready = player
            .next_pathfinding_ts
            .map(|ts| ts <= now)
            .unwrap_or(true);
        if !ready {
            return;
        }

        let Some(start) = self.player_point(player) else {
            return;
        };
        if geometry::points_equal(start, destination) {
            let _ = self.players.update(player_id, |p| {
                p.destination = None;
                p.pathfinding_started = None;
                p.next_pathfinding_ts = None;
            });
            return;
        }

        let obstacle_data: Vec<(Point, Option<Path>)> = self
            .players
            .iter_active()
            .filter(|other| other.id != player_id)
            .filter_map(|other| {
                self.player_point(other)
                    .map(|point| (point, other.path.clone()))
            })
            .collect();
        let obstacles: Vec<Obstacle<'_>> = obstacle_data
            .iter()
            .map(|(position, path)| Obstacle {
                position: *position,
                path: path.as_ref(),
            })
            .collect();

        match find_route(&self.map, &obstacles, start, destination, now) {
            Ok(route) => {
                let _ = self.players.update(player_id, |p| {
                    p.path = Some(route.path.clone());
                    if let Some(substitute) = route.new_destination {
                        p.destination = Some(substitute);
                    }
                    p.next_pathfinding_ts = None;
                });
            }
            Err(RouteError::NoRoute) => {
                let _ = self.players.update(player_id, |p| {
                    p.next_pathfinding_ts = Some(now + PATHFINDING_BACKOFF);
                });
            }
        }
    }

    fn planted_player_near(&self, player_id: &str, position: Point) -> bool {
        self.players
            .iter_active()
            .filter(|other| other.id != player_id && other.path.is_none())
            .filter_map(|other| self.player_point(other))
            .any(|point| distance(point, position) < COLLISION_THRESHOLD)
    }
}
