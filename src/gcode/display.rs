use itertools::Itertools;

use super::{Block, ModalGroup};

/// Shortest faithful rendering of a numeric word: integers lose the point,
/// fractions keep three digits at most.
pub(crate) fn format_value(value: f64) -> String {
    if value == value.trunc() && value.abs() < 1e15 {
        format!("{}", value as i64)
    } else {
        let text = format!("{:.3}", value);
        text.trim_end_matches('0').trim_end_matches('.').to_string()
    }
}

/// Render a block back to machine-visible text. Invalid blocks reproduce
/// their raw source so nothing silently disappears from a listing.
pub fn render_block(block: &Block) -> String {
    if !block.valid {
        return block.raw.clone();
    }
    let mut parts: Vec<String> = Vec::new();
    for (&group, &code) in &block.modal_groups {
        if group == ModalGroup::Motion {
            continue;
        }
        parts.push(format!("G{}", format_value(code)));
    }
    if let Some(g) = block.g_code {
        parts.push(format!("G{}", format_value(g)));
    }
    if let Some(m) = block.m_code {
        parts.push(format!("M{}", m));
    }
    for (letter, value) in block.coordinates.iter() {
        parts.push(format!("{}{}", letter, format_value(value)));
    }
    for (&letter, &value) in &block.parameters {
        parts.push(format!("{}{}", letter, format_value(value)));
    }
    if let Some(feed) = block.feed_rate {
        parts.push(format!("F{}", format_value(feed)));
    }
    if let Some(speed) = block.spindle_speed {
        parts.push(format!("S{}", format_value(speed)));
    }
    if let Some(tool) = block.tool_number {
        parts.push(format!("T{}", tool));
    }
    parts.join(" ")
}

/// Render a program, one line per block.
pub fn join(blocks: &[Block]) -> String {
    blocks.iter().map(render_block).join("\n")
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::gcode::parse;

    #[test]
    fn format_value_drops_noise() {
        assert_eq!(format_value(10.0), "10");
        assert_eq!(format_value(-5.0), "-5");
        assert_eq!(format_value(38.2), "38.2");
        assert_eq!(format_value(0.05), "0.05");
        assert_eq!(format_value(1.2345), "1.234");
    }

    #[test]
    fn render_orders_words() {
        let result = parse("F250 G21 G90 G1 X5 Y123 Z23\n");
        assert_eq!(render_block(&result.blocks[0]), "G21 G90 G1 X5 Y123 Z23 F250");
    }

    #[test]
    fn reparsing_rendered_text_is_stable() {
        let source = "G21 G90\nG0 X10 Y10\nG1 Z-5 F100\nG2 X20 Y0 I5 J0 F150\nM3 S10000\nG38.2 Z-10 F50\n";
        let first = parse(source);
        assert!(first.is_clean());
        let rendered = join(&first.blocks);
        let second = parse(&rendered);
        assert!(second.is_clean());
        assert_eq!(join(&second.blocks), rendered);
        assert_eq!(first.blocks.len(), second.blocks.len());
        for (a, b) in first.blocks.iter().zip(second.blocks.iter()) {
            assert_eq!(a.g_code, b.g_code);
            assert_eq!(a.m_code, b.m_code);
            assert_eq!(a.modal_groups, b.modal_groups);
            assert_eq!(a.coordinates, b.coordinates);
            assert_eq!(a.parameters, b.parameters);
            assert_eq!(a.feed_rate, b.feed_rate);
            assert_eq!(a.spindle_speed, b.spindle_speed);
        }
    }
}
