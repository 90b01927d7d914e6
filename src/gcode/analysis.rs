use std::f64::consts::FRAC_PI_2;
use std::fmt;

use super::display::render_block;
use super::{Block, ModalGroup};
use crate::config::{SoftLimits, SpeedLimits};
use crate::geometry::{Axis, BoundingBox, Position};

const SPINDLE_START_SECONDS: f64 = 2.0;
const SPINDLE_STOP_SECONDS: f64 = 1.0;
const TOOL_CHANGE_SECONDS: f64 = 10.0;
const BLOCK_OVERHEAD_SECONDS: f64 = 0.05;

/// Cursor model shared by the bounding box, the time estimate and the
/// safety scan. Starts at the origin in absolute millimetre mode.
struct Cursor {
    position: Position,
    incremental: bool,
    feed: f64,
}

impl Cursor {
    fn new() -> Cursor {
        Cursor { position: Position::ZERO, incremental: false, feed: 0.0 }
    }

    /// Apply one block; returns `(from, to)` when it moves the cursor.
    fn apply(&mut self, block: &Block) -> Option<(Position, Position)> {
        if let Some(mode) = block.modal_groups.get(&ModalGroup::Distance) {
            self.incremental = *mode == 91.0;
        }
        if let Some(feed) = block.feed_rate {
            self.feed = feed;
        }
        if !block.is_motion() {
            return None;
        }
        let mut target = self.position;
        let mut moved = false;
        for (letter, value) in block.coordinates.iter() {
            let axis = match letter {
                'X' => Axis::X,
                'Y' => Axis::Y,
                'Z' => Axis::Z,
                _ => continue,
            };
            let resolved = if self.incremental { target.axis(axis) + value } else { value };
            target.set_axis(axis, resolved);
            moved = true;
        }
        if !moved {
            return None;
        }
        let from = self.position;
        self.position = target;
        Some((from, target))
    }
}

/// Axis-aligned hull of every position a program passes through.
pub fn bounding_box(blocks: &[Block]) -> BoundingBox {
    let mut cursor = Cursor::new();
    let mut hull = BoundingBox::default();
    for block in blocks.iter().filter(|b| b.valid) {
        if let Some((_, to)) = cursor.apply(block) {
            hull.expand(to);
        }
    }
    hull
}

/// Rough upper-bound runtime. Linear moves run at the current feed, arcs
/// are charged as a quarter circle of their radius, and spindle and tool
/// commands carry fixed costs.
pub fn estimate_seconds(blocks: &[Block]) -> f64 {
    let mut cursor = Cursor::new();
    let mut total = 0.0;
    for block in blocks.iter().filter(|b| b.valid) {
        total += BLOCK_OVERHEAD_SECONDS;
        match block.m_code {
            Some(3) | Some(4) => total += SPINDLE_START_SECONDS,
            Some(5) => total += SPINDLE_STOP_SECONDS,
            Some(6) => total += TOOL_CHANGE_SECONDS,
            _ => {}
        }
        if block.g_code == Some(4.0) {
            total += block.parameters.get(&'P').copied().unwrap_or(0.0);
        }
        let motion = block.motion_g();
        let travelled = cursor.apply(block);
        if cursor.feed <= 0.0 {
            continue;
        }
        match motion {
            Some(2) | Some(3) => {
                let radius = block.parameters.get(&'R').copied().unwrap_or_else(|| {
                    let i = block.parameters.get(&'I').copied().unwrap_or(0.0);
                    let j = block.parameters.get(&'J').copied().unwrap_or(0.0);
                    (i * i + j * j).sqrt()
                });
                total += FRAC_PI_2 * radius / cursor.feed * 60.0;
            }
            _ => {
                if let Some((from, to)) = travelled {
                    total += from.distance(&to) / cursor.feed * 60.0;
                }
            }
        }
    }
    total
}

#[derive(Debug, Clone, PartialEq)]
pub enum SafetyIssue {
    FeedExceeded { line_number: usize, feed: f64, limit: f64 },
    SpindleExceeded { line_number: usize, speed: f64, limit: f64 },
    TravelExceeded { line_number: usize, axis: Axis, value: f64 },
}

impl fmt::Display for SafetyIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SafetyIssue::FeedExceeded { line_number, feed, limit } => {
                write!(f, "line {}: feed {} exceeds limit {}", line_number, feed, limit)
            }
            SafetyIssue::SpindleExceeded { line_number, speed, limit } => {
                write!(f, "line {}: spindle {} exceeds limit {}", line_number, speed, limit)
            }
            SafetyIssue::TravelExceeded { line_number, axis, value } => {
                write!(f, "line {}: {}{} exceeds travel limits", line_number, axis, value)
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SafetyWarning {
    RapidDescent { line_number: usize },
    SpindleOn { line_number: usize },
}

impl fmt::Display for SafetyWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SafetyWarning::RapidDescent { line_number } => {
                write!(f, "line {}: rapid move descends in Z", line_number)
            }
            SafetyWarning::SpindleOn { line_number } => {
                write!(f, "line {}: spindle start", line_number)
            }
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct SafetyScan {
    pub issues: Vec<SafetyIssue>,
    pub warnings: Vec<SafetyWarning>,
}

impl SafetyScan {
    pub fn is_safe(&self) -> bool {
        self.issues.is_empty()
    }
}

/// Walk a program against the machine envelope. Read-only: blocks are never
/// modified.
pub fn check_safety(blocks: &[Block], limits: &SoftLimits, speeds: &SpeedLimits) -> SafetyScan {
    let mut cursor = Cursor::new();
    let mut scan = SafetyScan::default();
    for block in blocks.iter().filter(|b| b.valid) {
        if let Some(feed) = block.feed_rate {
            if feed > speeds.max_feed_rate {
                scan.issues.push(SafetyIssue::FeedExceeded {
                    line_number: block.line_number,
                    feed,
                    limit: speeds.max_feed_rate,
                });
            }
        }
        if let Some(speed) = block.spindle_speed {
            if speed > speeds.max_spindle_speed {
                scan.issues.push(SafetyIssue::SpindleExceeded {
                    line_number: block.line_number,
                    speed,
                    limit: speeds.max_spindle_speed,
                });
            }
        }
        if matches!(block.m_code, Some(3) | Some(4)) {
            scan.warnings.push(SafetyWarning::SpindleOn { line_number: block.line_number });
        }
        let motion = block.motion_g();
        if let Some((from, to)) = cursor.apply(block) {
            for axis in Axis::ALL {
                let value = to.axis(axis);
                if !limits.axis(axis).contains(value) {
                    scan.issues.push(SafetyIssue::TravelExceeded {
                        line_number: block.line_number,
                        axis,
                        value,
                    });
                }
            }
            if motion == Some(0) && to.z < from.z {
                scan.warnings.push(SafetyWarning::RapidDescent { line_number: block.line_number });
            }
        }
    }
    scan
}

fn mergeable(prev: &Block, next: &Block) -> bool {
    prev.valid
        && next.valid
        && matches!(prev.motion_g(), Some(0) | Some(1))
        && prev.g_code == next.g_code
        && prev.m_code.is_none()
        && next.m_code.is_none()
        && prev.tool_number.is_none()
        && next.tool_number.is_none()
        && prev.parameters.is_empty()
        && next.parameters.is_empty()
        && prev.feed_rate == next.feed_rate
        && prev.spindle_speed == next.spindle_speed
        && prev.modal_groups == next.modal_groups
        && prev.coordinates.disjoint(&next.coordinates)
}

/// Coalesce runs of rapid or linear moves that agree on feed, spindle and
/// modal state and touch disjoint axes. Merging overlapping axes would
/// erase positions the program visits, so those runs are left alone.
pub fn optimize(blocks: &[Block]) -> Vec<Block> {
    let mut output: Vec<Block> = Vec::with_capacity(blocks.len());
    for block in blocks {
        if let Some(prev) = output.last_mut() {
            if mergeable(prev, block) {
                for (letter, value) in block.coordinates.iter() {
                    prev.coordinates.set(letter, value);
                }
                prev.raw = render_block(prev);
                continue;
            }
        }
        output.push(block.clone());
    }
    output
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::gcode::parse;

    #[test]
    fn bounding_box_tracks_the_cursor() {
        let result = parse("G0 X10 Y10\nG1 Z-5 F100\nG0 X-2 Y30\n");
        let hull = result.bounding_box;
        assert_eq!(hull.min, Position::new(-2.0, 0.0, -5.0));
        assert_eq!(hull.max, Position::new(10.0, 30.0, 0.0));
        let size = hull.size();
        assert!(size.x >= 0.0 && size.y >= 0.0 && size.z >= 0.0);
    }

    #[test]
    fn incremental_moves_accumulate() {
        let result = parse("G91\nG0 X10\nG0 X10\n");
        assert_eq!(result.bounding_box.max.x, 20.0);
    }

    #[test]
    fn estimate_charges_fixed_costs() {
        let result = parse("M3\nM5\nM6\nG4 P2\n");
        let expected = 2.0 + 1.0 + 10.0 + 2.0 + 4.0 * 0.05;
        assert!((result.estimated_seconds - expected).abs() < 1e-9);
    }

    #[test]
    fn estimate_charges_linear_moves_at_feed() {
        let result = parse("G1 X60 F60\n");
        assert!((result.estimated_seconds - (60.0 + 0.05)).abs() < 1e-9);
    }

    #[test]
    fn estimate_charges_arcs_as_quarter_circles() {
        let result = parse("F60\nG2 X10 Y0 R10\n");
        let arc = FRAC_PI_2 * 10.0 / 60.0 * 60.0;
        assert!((result.estimated_seconds - (arc + 0.1)).abs() < 1e-9);
    }

    #[test]
    fn safety_scan_flags_travel_and_feed() {
        let limits = SoftLimits::default();
        let speeds = SpeedLimits::default();
        let result = parse("G0 X400 Y10\nG1 X10 F5000\nM3 S90000\n");
        let scan = check_safety(&result.blocks, &limits, &speeds);
        assert!(!scan.is_safe());
        assert!(scan.issues.iter().any(|i| matches!(i, SafetyIssue::TravelExceeded { axis: Axis::X, .. })));
        assert!(scan.issues.iter().any(|i| matches!(i, SafetyIssue::FeedExceeded { .. })));
        assert!(scan.issues.iter().any(|i| matches!(i, SafetyIssue::SpindleExceeded { .. })));
        assert!(scan.warnings.iter().any(|w| matches!(w, SafetyWarning::SpindleOn { .. })));
    }

    #[test]
    fn rapid_descent_warns() {
        let result = parse("G0 Z-5\n");
        let scan = check_safety(&result.blocks, &SoftLimits::default(), &SpeedLimits::default());
        assert!(scan.warnings.iter().any(|w| matches!(w, SafetyWarning::RapidDescent { .. })));
    }

    #[test]
    fn optimize_merges_disjoint_runs() {
        let result = parse("G0 X10\nG0 Y20\nG0 X5\n");
        let merged = optimize(&result.blocks);
        // X10 + Y20 merge; the second X word would overwrite a visited
        // position, so it stays separate.
        assert_eq!(merged.len(), 2);
        assert_eq!(merged[0].coordinates.x, Some(10.0));
        assert_eq!(merged[0].coordinates.y, Some(20.0));
        assert_eq!(merged[1].coordinates.x, Some(5.0));
    }

    #[test]
    fn optimize_respects_feed_boundaries() {
        let result = parse("G1 X10 F100\nG1 Y20 F200\n");
        assert_eq!(optimize(&result.blocks).len(), 2);
    }

    #[test]
    fn safety_outcome_survives_optimization() {
        let limits = SoftLimits::default();
        let speeds = SpeedLimits::default();
        for source in ["G0 X10\nG0 Y20\nG1 Z-5 F100\n", "G0 X400\nG0 Y500\nG1 X10 F9000\n"] {
            let result = parse(source);
            let before = check_safety(&result.blocks, &limits, &speeds);
            let after = check_safety(&optimize(&result.blocks), &limits, &speeds);
            assert_eq!(before.is_safe(), after.is_safe());
        }
    }
}
