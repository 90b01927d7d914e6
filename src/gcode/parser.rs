use nom::character::complete::{satisfy, space0};
use nom::combinator::map_res;
use nom::bytes::complete::take_while1;
use nom::sequence::{pair, preceded};
use nom::IResult;

use super::{analysis, Block, ModalGroup, ParseIssue, ParseResult};

fn number(input: &str) -> IResult<&str, f64> {
    map_res(
        take_while1(|c: char| c.is_ascii_digit() || c == '.' || c == '-' || c == '+'),
        str::parse::<f64>,
    )(input)
}

fn word(input: &str) -> IResult<&str, (char, f64)> {
    preceded(space0, pair(satisfy(|c| c.is_ascii_alphabetic()), number))(input)
}

/// Drop `(...)` and `;` comments, leaving the machine-visible text.
fn strip_comments(line: &str) -> String {
    let mut output = String::with_capacity(line.len());
    let mut depth = 0usize;
    for c in line.chars() {
        match c {
            ';' if depth == 0 => break,
            '(' => depth += 1,
            ')' if depth > 0 => depth -= 1,
            _ if depth == 0 => output.push(c),
            _ => {}
        }
    }
    output
}

/// Tokenise a line into `<letter><number>` words. Letters are upper-cased.
pub(crate) fn scan_words(line: &str) -> Result<Vec<(char, f64)>, String> {
    let mut rest = line.trim();
    let mut words = Vec::new();
    while !rest.is_empty() {
        match word(rest) {
            Ok((remaining, (letter, value))) => {
                words.push((letter.to_ascii_uppercase(), value));
                rest = remaining.trim_start();
            }
            Err(_) => return Err(format!("unparsable text {:?}", rest)),
        }
    }
    Ok(words)
}

fn assemble(line_number: usize, raw: &str, words: &[(char, f64)]) -> (Block, Vec<String>) {
    let mut block = Block::new(line_number, raw);
    let mut errors = Vec::new();
    for &(letter, value) in words {
        match letter {
            'G' => {
                if let Some(group) = ModalGroup::of_g(value) {
                    if block.modal_groups.insert(group, value).is_some() {
                        errors.push(format!(
                            "two words from modal group {} in one block",
                            group.number()
                        ));
                    }
                    if group == ModalGroup::Motion {
                        block.g_code = Some(value);
                    }
                } else {
                    // Non-modal commands such as G4, G10, G28, G92.
                    block.g_code = Some(value);
                }
            }
            'M' => block.m_code = Some(value as u16),
            'F' => block.feed_rate = Some(value),
            'S' => block.spindle_speed = Some(value),
            'T' => block.tool_number = Some(value as u16),
            'N' => {}
            'I' | 'J' | 'K' | 'L' | 'P' | 'Q' | 'R' => {
                block.parameters.insert(letter, value);
            }
            _ => {
                if !block.coordinates.set(letter, value) {
                    errors.push(format!("unsupported word {}{}", letter, value));
                }
            }
        }
    }
    validate(&block, &mut errors);
    block.valid = errors.is_empty();
    (block, errors)
}

fn validate(block: &Block, errors: &mut Vec<String>) {
    match block.motion_g() {
        Some(0) | Some(1) => {
            if block.coordinates.is_empty() {
                errors.push("linear move without axis words".to_string());
            }
            if block.motion_g() == Some(1) && block.feed_rate == Some(0.0) {
                errors.push("feed rate must be positive".to_string());
            }
        }
        Some(2) | Some(3) => {
            if block.coordinates.is_empty() {
                errors.push("arc move without endpoint".to_string());
            }
            let has_offsets =
                block.parameters.contains_key(&'I') && block.parameters.contains_key(&'J');
            if !has_offsets && !block.parameters.contains_key(&'R') {
                errors.push("arc move requires I,J offsets or R radius".to_string());
            }
        }
        Some(38) => {
            let tenths = (block.g_code.unwrap_or(0.0) * 10.0).round() as i64;
            if tenths == 382 {
                if block.coordinates.z.is_none() {
                    errors.push("probe requires a Z target".to_string());
                }
                if block.feed_rate.is_none() {
                    errors.push("probe requires a feed rate".to_string());
                }
            }
        }
        _ => {}
    }
}

/// Parse a whole program. Never fails: problems land in `errors` and the
/// offending blocks are marked invalid.
pub fn parse(source: &str) -> ParseResult {
    let mut blocks = Vec::new();
    let mut errors = Vec::new();
    for (index, raw_line) in source.lines().enumerate() {
        let line_number = index + 1;
        let cleaned = strip_comments(raw_line);
        let text = cleaned.trim();
        if text.is_empty() || text == "%" {
            continue;
        }
        match scan_words(text) {
            Ok(words) => {
                let (block, block_errors) = assemble(line_number, text, &words);
                for message in block_errors {
                    errors.push(ParseIssue { line_number, message });
                }
                blocks.push(block);
            }
            Err(message) => {
                let mut block = Block::new(line_number, text);
                block.valid = false;
                blocks.push(block);
                errors.push(ParseIssue { line_number, message });
            }
        }
    }
    let warnings = program_warnings(&blocks);
    let bounding_box = analysis::bounding_box(&blocks);
    let estimated_seconds = analysis::estimate_seconds(&blocks);
    ParseResult { blocks, errors, warnings, bounding_box, estimated_seconds }
}

fn program_warnings(blocks: &[Block]) -> Vec<String> {
    let mut warnings = Vec::new();
    if blocks.iter().any(|b| b.modal_groups.get(&ModalGroup::Units) == Some(&20.0)) {
        warnings.push("program selects inch units (G20)".to_string());
    }
    if blocks.iter().any(|b| b.modal_groups.get(&ModalGroup::Distance) == Some(&91.0)) {
        warnings.push("program uses incremental positioning (G91)".to_string());
    }
    if blocks.iter().any(|b| b.m_code == Some(6)) {
        warnings.push("program contains a tool change (M6)".to_string());
    }
    let cutting = blocks.iter().any(|b| matches!(b.motion_g(), Some(1) | Some(2) | Some(3)));
    let spindle = blocks.iter().any(|b| matches!(b.m_code, Some(3) | Some(4)));
    if cutting && !spindle {
        warnings.push("cutting moves without a spindle start command".to_string());
    }
    warnings
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::gcode::ModalGroup;

    #[test]
    fn words_and_fields_land_in_place() {
        let result = parse("G1 X10.5 Y-2 F600 S12000 T2\n");
        assert!(result.is_clean());
        let block = &result.blocks[0];
        assert_eq!(block.g_code, Some(1.0));
        assert_eq!(block.coordinates.x, Some(10.5));
        assert_eq!(block.coordinates.y, Some(-2.0));
        assert_eq!(block.feed_rate, Some(600.0));
        assert_eq!(block.spindle_speed, Some(12000.0));
        assert_eq!(block.tool_number, Some(2));
    }

    #[test]
    fn modal_groups_are_tracked() {
        let result = parse("G21 G90 G17 G94\nG1 X5 F100\n");
        let modal = &result.blocks[0].modal_groups;
        assert_eq!(modal.get(&ModalGroup::Units), Some(&21.0));
        assert_eq!(modal.get(&ModalGroup::Distance), Some(&90.0));
        assert_eq!(modal.get(&ModalGroup::Plane), Some(&17.0));
        assert_eq!(modal.get(&ModalGroup::FeedMode), Some(&94.0));
        assert_eq!(result.blocks[0].g_code, None);
        assert_eq!(result.blocks[1].modal_groups.get(&ModalGroup::Motion), Some(&1.0));
    }

    #[test]
    fn comments_are_stripped() {
        let result = parse("G0 X1 (move clear) Y2 ; trailing\n(full comment line)\n");
        assert_eq!(result.blocks.len(), 1);
        assert_eq!(result.blocks[0].coordinates.y, Some(2.0));
    }

    #[test]
    fn bare_move_without_axes_is_an_error() {
        let result = parse("G0\n");
        assert!(!result.blocks[0].valid);
        assert_eq!(result.errors.len(), 1);
    }

    #[test]
    fn zero_feed_on_controlled_move_is_an_error() {
        let result = parse("G1 X5 F0\n");
        assert!(!result.is_clean());
        assert!(result.errors[0].message.contains("feed rate"));
    }

    #[test]
    fn arcs_require_offsets_or_radius() {
        let bad = parse("G2 X10 Y0\n");
        assert!(!bad.is_clean());
        let with_offsets = parse("G2 X10 Y0 I5 J0\n");
        assert!(with_offsets.is_clean());
        assert!(with_offsets.blocks[0].parameters.contains_key(&'I'));
        let with_radius = parse("G3 X10 Y0 R5\n");
        assert!(with_radius.is_clean());
    }

    #[test]
    fn probe_requires_z_and_feed() {
        let bad = parse("G38.2 X5\n");
        assert_eq!(bad.errors.len(), 2);
        let good = parse("G38.2 Z-10 F50\n");
        assert!(good.is_clean());
        assert_eq!(good.blocks[0].g_code, Some(38.2));
    }

    #[test]
    fn conflicting_modals_in_one_block() {
        let result = parse("G90 G91 X5\n");
        assert!(!result.is_clean());
        assert!(result.errors[0].message.contains("modal group"));
    }

    #[test]
    fn unparsable_text_marks_block_invalid() {
        let result = parse("G1 X== Y10\n");
        assert!(!result.blocks[0].valid);
        assert!(!result.is_clean());
    }

    #[test]
    fn program_warnings_cover_units_distance_and_spindle() {
        let result = parse("G20\nG91\nG1 X5 F100\nM6 T1\n");
        assert!(result.warnings.iter().any(|w| w.contains("G20")));
        assert!(result.warnings.iter().any(|w| w.contains("G91")));
        assert!(result.warnings.iter().any(|w| w.contains("M6")));
        assert!(result.warnings.iter().any(|w| w.contains("spindle")));
    }
}
