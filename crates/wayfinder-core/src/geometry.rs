//! Minimal 3-D vector math plus curve sampling for guide markers.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{Add, Mul, Sub};
use std::str::FromStr;
use thiserror::Error;

/// Number of straight pieces used to approximate a Bézier curve before
/// walking it at a fixed spacing.
const CURVE_RESOLUTION: usize = 64;

/// A point or direction in world space.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Vec3 {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Vec3 {
    pub const ZERO: Vec3 = Vec3 {
        x: 0.0,
        y: 0.0,
        z: 0.0,
    };

    pub const fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }

    pub fn length(self) -> f64 {
        (self.x * self.x + self.y * self.y + self.z * self.z).sqrt()
    }

    /// Euclidean distance between two points.
    pub fn distance(self, other: Vec3) -> f64 {
        (self - other).length()
    }

    /// Unit vector in the same direction, or zero for a zero vector.
    pub fn normalized(self) -> Vec3 {
        let len = self.length();
        if len <= f64::EPSILON {
            Vec3::ZERO
        } else {
            self * (1.0 / len)
        }
    }

    pub fn lerp(self, other: Vec3, t: f64) -> Vec3 {
        self + (other - self) * t
    }

    pub fn midpoint(self, other: Vec3) -> Vec3 {
        self.lerp(other, 0.5)
    }
}

impl Add for Vec3 {
    type Output = Vec3;

    fn add(self, rhs: Vec3) -> Vec3 {
        Vec3::new(self.x + rhs.x, self.y + rhs.y, self.z + rhs.z)
    }
}

impl Sub for Vec3 {
    type Output = Vec3;

    fn sub(self, rhs: Vec3) -> Vec3 {
        Vec3::new(self.x - rhs.x, self.y - rhs.y, self.z - rhs.z)
    }
}

impl Mul<f64> for Vec3 {
    type Output = Vec3;

    fn mul(self, rhs: f64) -> Vec3 {
        Vec3::new(self.x * rhs, self.y * rhs, self.z * rhs)
    }
}

impl fmt::Display for Vec3 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.2},{:.2},{:.2}", self.x, self.y, self.z)
    }
}

/// Error returned when a coordinate string is not `x,y,z`.
#[derive(Debug, Error, PartialEq)]
#[error("expected coordinates as x,y,z but got \"{0}\"")]
pub struct ParseVec3Error(String);

impl FromStr for Vec3 {
    type Err = ParseVec3Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<f64> = s
            .split(',')
            .map(|p| p.trim().parse::<f64>())
            .collect::<Result<_, _>>()
            .map_err(|_| ParseVec3Error(s.to_string()))?;

        match parts.as_slice() {
            [x, y, z] if x.is_finite() && y.is_finite() && z.is_finite() => {
                Ok(Vec3::new(*x, *y, *z))
            }
            _ => Err(ParseVec3Error(s.to_string())),
        }
    }
}

/// Points every `spacing` units along the straight line `a`..`b`, both ends
/// included, stopping after `limit` points.
pub fn sample_line(a: Vec3, b: Vec3, spacing: f64, limit: usize) -> Vec<Vec3> {
    walk_polyline(&[a, b], spacing, limit)
}

/// Points every `spacing` units along the cubic Bézier curve
/// `p0`, `c1`, `c2`, `p3`, both ends included, stopping after `limit` points.
pub fn sample_curve(
    p0: Vec3,
    c1: Vec3,
    c2: Vec3,
    p3: Vec3,
    spacing: f64,
    limit: usize,
) -> Vec<Vec3> {
    let polyline: Vec<Vec3> = (0..=CURVE_RESOLUTION)
        .map(|i| cubic_bezier(p0, c1, c2, p3, i as f64 / CURVE_RESOLUTION as f64))
        .collect();
    walk_polyline(&polyline, spacing, limit)
}

fn cubic_bezier(p0: Vec3, c1: Vec3, c2: Vec3, p3: Vec3, t: f64) -> Vec3 {
    let u = 1.0 - t;
    p0 * (u * u * u) + c1 * (3.0 * u * u * t) + c2 * (3.0 * u * t * t) + p3 * (t * t * t)
}

fn walk_polyline(points: &[Vec3], spacing: f64, limit: usize) -> Vec<Vec3> {
    let (Some(&first), Some(&last)) = (points.first(), points.last()) else {
        return Vec::new();
    };
    if limit == 0 {
        return Vec::new();
    }
    let mut out = vec![first];
    if spacing <= 0.0 || !spacing.is_finite() {
        if points.len() > 1 && limit > 1 {
            out.push(last);
        }
        return out;
    }

    // Distance travelled since the last emitted point.
    let mut carried = 0.0;
    for pair in points.windows(2) {
        let (a, b) = (pair[0], pair[1]);
        let len = a.distance(b);
        if len <= f64::EPSILON {
            continue;
        }
        let start = spacing - carried;
        // Offsets are computed from a step count so a spacing too small to
        // change the running sum still makes progress.
        let mut step = 0u64;
        let mut offset = start;
        while offset <= len {
            if out.len() >= limit {
                return out;
            }
            out.push(a.lerp(b, offset / len));
            step += 1;
            offset = start + step as f64 * spacing;
        }
        carried = len - (offset - spacing);
    }

    let ends_on_last = out.last().map(|p| p.distance(last) < 1e-9).unwrap_or(false);
    if !ends_on_last && out.len() < limit {
        out.push(last);
    }
    out
}
