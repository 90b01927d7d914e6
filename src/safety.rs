use crate::config::{SoftLimits, SpeedLimits};
use crate::gcode::parser::scan_words;
use crate::geometry::{Axis, Position};

/// Verdict of the static line check. Warnings are forwarded to the caller
/// out of band; only `Invalid` blocks the command.
#[derive(Debug, Clone, PartialEq)]
pub enum Validation {
    Valid,
    Warn(String),
    Invalid(String),
}

impl Validation {
    pub fn is_blocking(&self) -> bool {
        matches!(self, Validation::Invalid(_))
    }
}

/// Gate applied to every outgoing line: soft limits, feed caps and the
/// warn-and-proceed policy for spindle, coolant and probe commands.
#[derive(Debug, Clone)]
pub struct SafetyValidator {
    soft_limits: SoftLimits,
    speed_limits: SpeedLimits,
}

fn word_key(letter: char, value: f64) -> (char, i64) {
    (letter, (value * 10.0).round() as i64)
}

// Legal but hazardous: accepted with a warning rather than blocked.
const UNSAFE_WORDS: [(char, i64); 10] = [
    ('M', 30),
    ('M', 40),
    ('M', 50),
    ('M', 70),
    ('M', 80),
    ('M', 90),
    ('G', 382),
    ('G', 383),
    ('G', 384),
    ('G', 385),
];

impl SafetyValidator {
    pub fn new(soft_limits: SoftLimits, speed_limits: SpeedLimits) -> SafetyValidator {
        SafetyValidator { soft_limits, speed_limits }
    }

    pub fn soft_limits(&self) -> &SoftLimits {
        &self.soft_limits
    }

    pub fn speed_limits(&self) -> &SpeedLimits {
        &self.speed_limits
    }

    /// Validate one outgoing line against the envelope. `current` is the
    /// expected position, used to project always-relative jog targets.
    pub fn validate(&self, line: &str, current: &Position) -> Validation {
        let text = line.trim();
        if text.is_empty() {
            return Validation::Invalid("empty command".to_string());
        }
        if let Some(jog) = text.strip_prefix("$J=") {
            return self.validate_jog(jog, current);
        }
        let words = match scan_words(text) {
            Ok(words) => words,
            Err(_) => return Validation::Valid, // opaque line; the device will answer
        };
        let first = match words.first() {
            Some(&(letter, value)) => word_key(letter, value),
            None => return Validation::Invalid("empty command".to_string()),
        };
        if UNSAFE_WORDS.contains(&first) {
            return Validation::Warn(format!(
                "{}{} is accepted but not gated by the host",
                first.0,
                (first.1 as f64) / 10.0
            ));
        }
        if matches!(first, ('G', 0) | ('G', 10) | ('G', 20) | ('G', 30)) {
            for &(letter, value) in &words {
                let axis = match letter {
                    'X' => Axis::X,
                    'Y' => Axis::Y,
                    'Z' => Axis::Z,
                    'F' => {
                        if value > self.speed_limits.max_feed_rate {
                            return Validation::Invalid(format!(
                                "feed {} exceeds limit {}",
                                value, self.speed_limits.max_feed_rate
                            ));
                        }
                        continue;
                    }
                    _ => continue,
                };
                if !self.soft_limits.axis(axis).contains(value) {
                    return Validation::Invalid(format!(
                        "{}{} exceeds soft limits",
                        letter, value
                    ));
                }
            }
        }
        Validation::Valid
    }

    fn validate_jog(&self, jog: &str, current: &Position) -> Validation {
        let words = match scan_words(jog) {
            Ok(words) => words,
            Err(message) => return Validation::Invalid(format!("invalid jog command: {}", message)),
        };
        let mut projected = *current;
        for &(letter, value) in &words {
            let axis = match letter {
                'X' => Axis::X,
                'Y' => Axis::Y,
                'Z' => Axis::Z,
                'F' => {
                    if value > self.speed_limits.max_jog_rate {
                        return Validation::Invalid(format!(
                            "jog feed {} exceeds limit {}",
                            value, self.speed_limits.max_jog_rate
                        ));
                    }
                    continue;
                }
                _ => continue,
            };
            // Jogs are issued in G91, so words are always deltas.
            projected.set_axis(axis, projected.axis(axis) + value);
            if !self.soft_limits.axis(axis).contains(projected.axis(axis)) {
                return Validation::Invalid(format!(
                    "jog target {}{} exceeds soft limits",
                    letter,
                    projected.axis(axis)
                ));
            }
        }
        Validation::Valid
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn validator() -> SafetyValidator {
        SafetyValidator::new(SoftLimits::default(), SpeedLimits::default())
    }

    #[test]
    fn empty_line_is_invalid() {
        assert!(validator().validate("   ", &Position::ZERO).is_blocking());
    }

    #[test]
    fn soft_limit_rejection() {
        let verdict = validator().validate("G0 X1000 Y1000", &Position::ZERO);
        match verdict {
            Validation::Invalid(message) => assert!(message.contains("exceeds soft limits")),
            other => panic!("expected rejection, got {:?}", other),
        }
    }

    #[test]
    fn boundary_coordinates_are_accepted() {
        let v = validator();
        assert_eq!(v.validate("G0 X0 Y300", &Position::ZERO), Validation::Valid);
        assert_eq!(v.validate("G0 Z100", &Position::ZERO), Validation::Valid);
        assert!(v.validate("G0 X-0.001", &Position::ZERO).is_blocking());
        assert!(v.validate("G0 Z100.001", &Position::ZERO).is_blocking());
    }

    #[test]
    fn feed_cap_rejection() {
        let verdict = validator().validate("G1 X10 F5000", &Position::ZERO);
        match verdict {
            Validation::Invalid(message) => assert!(message.contains("feed")),
            other => panic!("expected rejection, got {:?}", other),
        }
        assert_eq!(validator().validate("G1 X10 F3000", &Position::ZERO), Validation::Valid);
    }

    #[test]
    fn unsafe_commands_warn_but_pass() {
        let v = validator();
        assert!(matches!(v.validate("M3 S10000", &Position::ZERO), Validation::Warn(_)));
        assert!(matches!(v.validate("M8", &Position::ZERO), Validation::Warn(_)));
        assert!(matches!(v.validate("G38.2 Z-10 F50", &Position::ZERO), Validation::Warn(_)));
        // M30 is program end, not a spindle word.
        assert_eq!(v.validate("M30", &Position::ZERO), Validation::Valid);
    }

    #[test]
    fn jog_projection_uses_current_position() {
        let v = validator();
        let current = Position::new(295.0, 0.0, 0.0);
        assert!(v.validate("$J=G91 X10 F1000", &current).is_blocking());
        assert_eq!(v.validate("$J=G91 X5 F1000", &current), Validation::Valid);
        assert!(v.validate("$J=G91 X-1 F1000", &Position::ZERO).is_blocking());
    }

    #[test]
    fn jog_feed_cap() {
        let verdict = validator().validate("$J=G91 X10 F6000", &Position::ZERO);
        assert!(verdict.is_blocking());
        assert_eq!(validator().validate("$J=G91 X10 F5000", &Position::ZERO), Validation::Valid);
    }

    #[test]
    fn other_commands_pass_through() {
        let v = validator();
        assert_eq!(v.validate("G4 P1", &Position::ZERO), Validation::Valid);
        assert_eq!(v.validate("$H", &Position::ZERO), Validation::Valid);
        assert_eq!(v.validate("G90", &Position::ZERO), Validation::Valid);
    }
}
