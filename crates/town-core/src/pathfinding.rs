//! Grid A* with time-indexed dynamic obstacles. Starts may sit between
//! tiles; every expansion step lands on the integer lattice, so segment
//! costs are Euclidean and the Manhattan heuristic stays admissible.

use contracts::constants::{COLLISION_THRESHOLD, MOVEMENT_SPEED};
use contracts::geometry::{
    self, distance, manhattan_distance, normalize, vector_between, Path, PathComponent, Point,
    Vector,
};
use contracts::WorldMap;

use crate::util::MinHeap;

const ALIGN_EPSILON: f64 = 1e-9;

/// Another traveller the route must stay clear of. When a committed path is
/// present the obstacle is evaluated where that path puts it at the
/// candidate's arrival time, not where it stands now.
#[derive(Debug, Clone)]
pub struct Obstacle<'a> {
    pub position: Point,
    pub path: Option<&'a Path>,
}

impl Obstacle<'_> {
    fn position_at(&self, t: f64) -> Point {
        match self.path {
            Some(path) => geometry::path_position(path, t)
                .map(|p| p.position)
                .unwrap_or(self.position),
            None => self.position,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RouteResult {
    pub path: Path,
    /// Set when the requested destination was unreachable; the path ends at
    /// this substitute instead.
    pub new_destination: Option<Point>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteError {
    NoRoute,
}

impl std::fmt::Display for RouteError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NoRoute => write!(f, "no route"),
        }
    }
}

impl std::error::Error for RouteError {}

#[derive(Debug, Clone)]
struct Candidate {
    position: Point,
    prev: Option<usize>,
    /// Cumulative tiles travelled from the start.
    length: f64,
    /// Scheduled arrival time.
    t: f64,
}

struct QueueEntry {
    candidate_index: usize,
    priority: f64,
}

fn ms_per_tile() -> f64 {
    1000.0 / MOVEMENT_SPEED
}

fn axis_aligned(v: f64) -> bool {
    (v - v.round()).abs() < ALIGN_EPSILON
}

/// Tiles a (possibly fractional) position overlaps.
fn covering_tiles(p: Point) -> Vec<(i64, i64)> {
    let xs = if axis_aligned(p.x) {
        vec![p.x.round() as i64]
    } else {
        vec![p.x.floor() as i64, p.x.ceil() as i64]
    };
    let ys = if axis_aligned(p.y) {
        vec![p.y.round() as i64]
    } else {
        vec![p.y.floor() as i64, p.y.ceil() as i64]
    };
    let mut tiles = Vec::with_capacity(xs.len() * ys.len());
    for &x in &xs {
        for &y in &ys {
            tiles.push((x, y));
        }
    }
    tiles
}

fn statically_blocked(map: &WorldMap, p: Point) -> bool {
    covering_tiles(p)
        .into_iter()
        .any(|(x, y)| map.tile_blocked(x, y))
}

fn dynamically_blocked(others: &[Obstacle<'_>], p: Point, t: f64) -> bool {
    others
        .iter()
        .any(|other| distance(other.position_at(t), p) < COLLISION_THRESHOLD)
}

fn neighbours(p: Point) -> Vec<Point> {
    let mut out = Vec::with_capacity(4);
    if !axis_aligned(p.x) {
        out.push(Point {
            x: p.x.floor(),
            y: p.y,
        });
        out.push(Point {
            x: p.x.ceil(),
            y: p.y,
        });
    }
    if !axis_aligned(p.y) {
        out.push(Point {
            x: p.x,
            y: p.y.floor(),
        });
        out.push(Point {
            x: p.x,
            y: p.y.ceil(),
        });
    }
    if axis_aligned(p.x) && axis_aligned(p.y) {
        let (x, y) = (p.x.round(), p.y.round());
        out.push(Point { x: x - 1.0, y });
        out.push(Point { x: x + 1.0, y });
        out.push(Point { x, y: y - 1.0 });
        out.push(Point { x, y: y + 1.0 });
    }
    out
}

fn grid_key(p: Point) -> Option<(i64, i64)> {
    if axis_aligned(p.x) && axis_aligned(p.y) {
        Some((p.x.round() as i64, p.y.round() as i64))
    } else {
        None
    }
}

/// Route from `start` to `destination`, leaving `now`. When the destination
/// cannot be reached the closest explored point (by Manhattan distance)
/// becomes the returned path's end and `new_destination`; when not even one
/// step away from the start is possible the search fails with `NoRoute`.
pub fn find_route(
    map: &WorldMap,
    others: &[Obstacle<'_>],
    start: Point,
    destination: Point,
    now: f64,
) -> Result<RouteResult, RouteError> {
    let mut candidates = vec![Candidate {
        position: start,
        prev: None,
        length: 0.0,
        t: now,
    }];

    let mut min_distances: std::collections::BTreeMap<(i64, i64), f64> =
        std::collections::BTreeMap::new();
    if let Some(key) = grid_key(start) {
        min_distances.insert(key, 0.0);
    }

    let mut open: MinHeap<QueueEntry> = MinHeap::new(|a, b| a.priority > b.priority);
    open.push(QueueEntry {
        candidate_index: 0,
        priority: manhattan_distance(start, destination),
    });

    let mut best_index = 0_usize;
    let mut best_remaining = manhattan_distance(start, destination);
    let mut goal_index = None;

    while let Some(entry) = open.pop() {
        let current = candidates[entry.candidate_index].clone();

        if geometry::points_equal(current.position, destination) {
            goal_index = Some(entry.candidate_index);
            break;
        }

        let remaining = manhattan_distance(current.position, destination);
        if remaining < best_remaining {
            best_remaining = remaining;
            best_index = entry.candidate_index;
        }

        for next in neighbours(current.position) {
            let step = distance(current.position, next);
            let length = current.length + step;
            let arrival = now + length * ms_per_tile();

            if statically_blocked(map, next) || dynamically_blocked(others, next, arrival) {
                continue;
            }
            if let Some(key) = grid_key(next) {
                if let Some(&existing) = min_distances.get(&key) {
                    if existing <= length {
                        continue;
                    }
                }
                min_distances.insert(key, length);
            }

            let index = candidates.len();
            candidates.push(Candidate {
                position: next,
                prev: Some(entry.candidate_index),
                length,
                t: arrival,
            });
            open.push(QueueEntry {
                candidate_index: index,
                priority: length + manhattan_distance(next, destination),
            });
        }
    }

    let (end_index, new_destination) = match goal_index {
        Some(index) => (index, None),
        None if best_index == 0 => return Err(RouteError::NoRoute),
        None => (best_index, Some(candidates[best_index].position)),
    };

    Ok(RouteResult {
        path: chain_to_path(&candidates, end_index),
        new_destination,
    })
}

fn chain_to_path(candidates: &[Candidate], end_index: usize) -> Path {
    let mut indices = Vec::new();
    let mut cursor = Some(end_index);
    while let Some(index) = cursor {
        indices.push(index);
        cursor = candidates[index].prev;
    }
    indices.reverse();

    let fallback = Vector { dx: 0.0, dy: 1.0 };
    let mut path: Path = Vec::with_capacity(indices.len());
    for (slot, &index) in indices.iter().enumerate() {
        let node = &candidates[index];
        let facing = indices
            .get(slot + 1)
            .and_then(|&next| {
                normalize(vector_between(node.position, candidates[next].position))
            })
            .or_else(|| path.last().map(|prev: &PathComponent| prev.facing))
            .unwrap_or(fallback);
        path.push(PathComponent {
            position: node.position,
            facing,
            t: node.t,
        });
    }
    path
}
