use ndarray::Array1;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{Add, Sub};

/// A machine axis. Only the three linear axes participate in soft-limit and
/// position bookkeeping; rotary words (A/B/C) pass through the parser but are
/// not modelled here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Axis {
    X,
    Y,
    Z,
}

impl Axis {
    pub const ALL: [Axis; 3] = [Axis::X, Axis::Y, Axis::Z];

    pub fn letter(self) -> char {
        match self {
            Axis::X => 'X',
            Axis::Y => 'Y',
            Axis::Z => 'Z',
        }
    }
}

impl fmt::Display for Axis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.letter())
    }
}

/// A point in machine space, millimetres.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Position {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Position {
    pub const ZERO: Position = Position { x: 0.0, y: 0.0, z: 0.0 };

    pub fn new(x: f64, y: f64, z: f64) -> Position {
        Position { x, y, z }
    }

    pub fn axis(&self, axis: Axis) -> f64 {
        match axis {
            Axis::X => self.x,
            Axis::Y => self.y,
            Axis::Z => self.z,
        }
    }

    pub fn set_axis(&mut self, axis: Axis, value: f64) {
        match axis {
            Axis::X => self.x = value,
            Axis::Y => self.y = value,
            Axis::Z => self.z = value,
        }
    }

    /// Largest per-axis absolute difference; the step-loss check compares
    /// this against the position tolerance.
    pub fn max_axis_delta(&self, other: &Position) -> f64 {
        Axis::ALL
            .iter()
            .map(|&axis| (self.axis(axis) - other.axis(axis)).abs())
            .fold(0.0, f64::max)
    }

    pub fn distance(&self, other: &Position) -> f64 {
        let delta = *self - *other;
        (delta.x * delta.x + delta.y * delta.y + delta.z * delta.z).sqrt()
    }

    /// First three components of a raw position vector, missing axes zero.
    pub fn from_array(values: &Array1<f64>) -> Position {
        Position {
            x: values.get(0).copied().unwrap_or(0.0),
            y: values.get(1).copied().unwrap_or(0.0),
            z: values.get(2).copied().unwrap_or(0.0),
        }
    }
}

impl Add for Position {
    type Output = Position;

    fn add(self, rhs: Position) -> Position {
        Position::new(self.x + rhs.x, self.y + rhs.y, self.z + rhs.z)
    }
}

impl Sub for Position {
    type Output = Position;

    fn sub(self, rhs: Position) -> Position {
        Position::new(self.x - rhs.x, self.y - rhs.y, self.z - rhs.z)
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({:.3}, {:.3}, {:.3})", self.x, self.y, self.z)
    }
}

/// Axis-aligned hull of the positions a program passes through.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub min: Position,
    pub max: Position,
}

impl BoundingBox {
    pub fn around(point: Position) -> BoundingBox {
        BoundingBox { min: point, max: point }
    }

    pub fn expand(&mut self, point: Position) {
        for axis in Axis::ALL {
            let value = point.axis(axis);
            if value < self.min.axis(axis) {
                self.min.set_axis(axis, value);
            }
            if value > self.max.axis(axis) {
                self.max.set_axis(axis, value);
            }
        }
    }

    pub fn size(&self) -> Position {
        self.max - self.min
    }
}

impl Default for BoundingBox {
    fn default() -> BoundingBox {
        BoundingBox::around(Position::ZERO)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use ndarray::array;

    #[test]
    fn expand_keeps_min_below_max() {
        let mut hull = BoundingBox::around(Position::ZERO);
        hull.expand(Position::new(10.0, -5.0, 3.0));
        hull.expand(Position::new(-2.0, 8.0, -1.0));
        assert_eq!(hull.min, Position::new(-2.0, -5.0, -1.0));
        assert_eq!(hull.max, Position::new(10.0, 8.0, 3.0));
        let size = hull.size();
        assert!(size.x >= 0.0 && size.y >= 0.0 && size.z >= 0.0);
    }

    #[test]
    fn from_array_tolerates_short_vectors() {
        assert_eq!(Position::from_array(&array![1.5, -2.0, 3.25]), Position::new(1.5, -2.0, 3.25));
        assert_eq!(Position::from_array(&array![7.0]), Position::new(7.0, 0.0, 0.0));
    }

    #[test]
    fn max_axis_delta_picks_worst_axis() {
        let a = Position::new(0.0, 0.0, 0.0);
        let b = Position::new(0.05, -0.2, 0.1);
        assert!((a.max_axis_delta(&b) - 0.2).abs() < 1e-12);
    }
}
