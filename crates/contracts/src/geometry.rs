//! Points, vectors, and timed paths shared between the kernel and clients.

use std::fmt;

use serde::{Deserialize, Serialize};

const EPSILON: f64 = 1e-4;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct Vector {
    pub dx: f64,
    pub dy: f64,
}

/// One node of a timed path. `t` values strictly increase along the path.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct PathComponent {
    pub position: Point,
    pub facing: Vector,
    pub t: f64,
}

pub type Path = Vec<PathComponent>;

/// The state of a traveller consulted at some time along its path.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PathPosition {
    pub position: Point,
    pub facing: Vector,
    /// Tiles per millisecond over the enclosing segment; zero when clamped.
    pub velocity: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GeometryError {
    VectorTooSmall,
    EmptyPath,
}

impl fmt::Display for GeometryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::VectorTooSmall => write!(f, "vector too small to orient"),
            Self::EmptyPath => write!(f, "path has no components"),
        }
    }
}

impl std::error::Error for GeometryError {}

pub fn distance(a: Point, b: Point) -> f64 {
    let dx = a.x - b.x;
    let dy = a.y - b.y;
    (dx * dx + dy * dy).sqrt()
}

pub fn manhattan_distance(a: Point, b: Point) -> f64 {
    (a.x - b.x).abs() + (a.y - b.y).abs()
}

pub fn points_equal(a: Point, b: Point) -> bool {
    distance(a, b) < EPSILON
}

pub fn vector_between(from: Point, to: Point) -> Vector {
    Vector {
        dx: to.x - from.x,
        dy: to.y - from.y,
    }
}

/// Unit-length copy of `v`, or `None` when `v` is too short to carry a
/// direction.
pub fn normalize(v: Vector) -> Option<Vector> {
    let len = (v.dx * v.dx + v.dy * v.dy).sqrt();
    if len < EPSILON {
        return None;
    }
    Some(Vector {
        dx: v.dx / len,
        dy: v.dy / len,
    })
}

/// Heading of `v` in degrees, measured clockwise from +x in [0, 360).
pub fn orientation_degrees(v: Vector) -> Result<f64, GeometryError> {
    if v.dx.abs() < EPSILON && v.dy.abs() < EPSILON {
        return Err(GeometryError::VectorTooSmall);
    }
    let degrees = v.dy.atan2(v.dx).to_degrees();
    Ok((degrees + 360.0) % 360.0)
}

/// Interpolated state at time `t`. Outside `[path[0].t, path[-1].t]` the
/// nearest endpoint is returned with zero velocity.
pub fn path_position(path: &Path, t: f64) -> Result<PathPosition, GeometryError> {
    let first = path.first().ok_or(GeometryError::EmptyPath)?;
    let last = path.last().ok_or(GeometryError::EmptyPath)?;

    if t <= first.t {
        return Ok(PathPosition {
            position: first.position,
            facing: first.facing,
            velocity: 0.0,
        });
    }
    if t >= last.t {
        return Ok(PathPosition {
            position: last.position,
            facing: last.facing,
            velocity: 0.0,
        });
    }

    for pair in path.windows(2) {
        let (from, to) = (pair[0], pair[1]);
        if t < from.t || t >= to.t {
            continue;
        }
        let span = to.t - from.t;
        let fraction = (t - from.t) / span;
        let position = Point {
            x: from.position.x + (to.position.x - from.position.x) * fraction,
            y: from.position.y + (to.position.y - from.position.y) * fraction,
        };
        return Ok(PathPosition {
            position,
            facing: from.facing,
            velocity: distance(from.position, to.position) / span,
        });
    }

    // Unreachable while path timestamps strictly increase.
    Ok(PathPosition {
        position: last.position,
        facing: last.facing,
        velocity: 0.0,
    })
}

pub fn path_overlaps(path: &Path, t: f64) -> bool {
    match (path.first(), path.last()) {
        (Some(first), Some(last)) => first.t <= t && t <= last.t,
        _ => false,
    }
}
