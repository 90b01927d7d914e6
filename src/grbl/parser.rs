use ndarray::Array1;
use nom::branch::alt;
use nom::bytes::complete::{tag, take_until, take_while1};
use nom::character::complete::char;
use nom::combinator::{all_consuming, map, map_res, value};
use nom::multi::separated_list1;
use nom::sequence::{delimited, preceded, separated_pair};
use nom::IResult;

use super::{GrblMessage, MachineState, ProbeReport, StatusReport};

fn number(input: &str) -> IResult<&str, f64> {
    map_res(
        take_while1(|c: char| c.is_ascii_digit() || c == '.' || c == '-'),
        str::parse::<f64>,
    )(input)
}

fn integer(input: &str) -> IResult<&str, i64> {
    map_res(
        take_while1(|c: char| c.is_ascii_digit() || c == '-'),
        str::parse::<i64>,
    )(input)
}

fn float_list(input: &str) -> IResult<&str, Array1<f64>> {
    map(separated_list1(tag(","), number), |values| {
        values.into_iter().collect()
    })(input)
}

fn machine_state(input: &str) -> IResult<&str, MachineState> {
    alt((
        map(preceded(tag("Hold:"), integer), MachineState::Hold),
        map(preceded(tag("Door:"), integer), MachineState::Door),
        value(MachineState::Hold(0), tag("Hold")),
        value(MachineState::Door(0), tag("Door")),
        value(MachineState::Idle, tag("Idle")),
        value(MachineState::Run, tag("Run")),
        value(MachineState::Jog, tag("Jog")),
        value(MachineState::Alarm(None), tag("Alarm")),
        value(MachineState::Check, tag("Check")),
        value(MachineState::Home, tag("Home")),
        value(MachineState::Sleep, tag("Sleep")),
    ))(input)
}

enum StatusField {
    MachinePosition(Array1<f64>),
    WorkPosition(Array1<f64>),
    Feed(f64),
    FeedSpindle(f64, f64),
    Unknown(String),
}

fn status_field(part: &str) -> StatusField {
    let parsed: Option<StatusField> = match part.split_once(':') {
        Some(("MPos", rest)) => all_consuming(float_list)(rest)
            .ok()
            .map(|(_, values)| StatusField::MachinePosition(values)),
        Some(("WPos", rest)) => all_consuming(float_list)(rest)
            .ok()
            .map(|(_, values)| StatusField::WorkPosition(values)),
        Some(("F", rest)) => all_consuming(number)(rest)
            .ok()
            .map(|(_, feed)| StatusField::Feed(feed)),
        Some(("FS", rest)) => all_consuming(separated_pair(number, tag(","), number))(rest)
            .ok()
            .map(|(_, (feed, spindle))| StatusField::FeedSpindle(feed, spindle)),
        _ => None,
    };
    parsed.unwrap_or_else(|| StatusField::Unknown(part.to_string()))
}

fn apply_field(mut report: StatusReport, field: StatusField) -> StatusReport {
    match field {
        StatusField::MachinePosition(values) => report.machine_position = values,
        StatusField::WorkPosition(values) => report.work_position = Some(values.to_vec()),
        StatusField::Feed(feed) => report.feed = Some(feed),
        StatusField::FeedSpindle(feed, spindle) => {
            report.feed = Some(feed);
            report.spindle = Some(spindle);
        }
        StatusField::Unknown(text) => report.unknown_fields.push(text),
    }
    report
}

fn parse_status(line: &str) -> Option<StatusReport> {
    let result: IResult<&str, &str> =
        delimited(char('<'), take_until(">"), char('>'))(line);
    let (_, body) = result.ok()?;
    let mut parts = body.split('|');
    let (_, state) = all_consuming(machine_state)(parts.next()?).ok()?;
    let mut report = parts
        .map(status_field)
        .fold(StatusReport::new(state), apply_field);
    if report.machine_position.is_empty() {
        // Some firmware builds report WPos only; without a work coordinate
        // offset the host treats it as the machine position.
        match report.work_position.as_ref() {
            Some(work) => report.machine_position = work.iter().copied().collect(),
            None => return None,
        }
    }
    Some(report)
}

fn parse_setting(line: &str) -> Option<(u16, f64)> {
    let rest = line.strip_prefix('$')?;
    let (index, value) = rest.split_once('=')?;
    Some((index.trim().parse().ok()?, value.trim().parse().ok()?))
}

fn parse_probe(line: &str) -> Option<ProbeReport> {
    let result: IResult<&str, (Array1<f64>, i64)> = delimited(
        tag("[PRB:"),
        separated_pair(float_list, char(':'), integer),
        char(']'),
    )(line);
    let (_, (position, contact)) = result.ok()?;
    Some(ProbeReport { position, contact: contact != 0 })
}

/// Classify one complete line from the device. Never fails: anything the
/// grammar does not cover comes back as `Unrecognized` for the caller to
/// log and drop.
pub fn parse_line(line: &str) -> GrblMessage {
    let line = line.trim();
    if line.starts_with('<') {
        return match parse_status(line) {
            Some(report) => GrblMessage::Status(report),
            None => GrblMessage::Unrecognized(line.to_string()),
        };
    }
    if line.starts_with("[PRB") {
        return match parse_probe(line) {
            Some(report) => GrblMessage::Probe(report),
            None => GrblMessage::Unrecognized(line.to_string()),
        };
    }
    if line.starts_with('[') && line.ends_with(']') {
        return GrblMessage::Feedback(line[1..line.len() - 1].to_string());
    }
    if let Some(setting) = parse_setting(line) {
        return GrblMessage::Setting { index: setting.0, value: setting.1 };
    }
    if line == "ok" {
        return GrblMessage::Ok;
    }
    if let Some(rest) = line.strip_prefix("error:") {
        if let Ok(code) = rest.trim().parse::<u8>() {
            return GrblMessage::Error(code);
        }
    }
    if let Some(rest) = line.strip_prefix("ALARM:") {
        if let Ok(code) = rest.trim().parse::<u8>() {
            return GrblMessage::Alarm(code);
        }
    }
    if line.starts_with("Grbl") {
        return GrblMessage::Greeting(line.to_string());
    }
    GrblMessage::Unrecognized(line.to_string())
}

#[cfg(test)]
mod test {
    use super::*;
    use ndarray::array;

    #[test]
    fn status_with_feed_tail() {
        let message = parse_line("<Idle|MPos:1.5,-2.0,3.25|F:0>");
        match message {
            GrblMessage::Status(report) => {
                assert_eq!(report.state, MachineState::Idle);
                assert_eq!(report.machine_position, array![1.5, -2.0, 3.25]);
                assert_eq!(report.feed, Some(0.0));
                assert_eq!(report.spindle, None);
            }
            other => panic!("expected status, got {:?}", other),
        }
    }

    #[test]
    fn status_with_feed_spindle_tail() {
        let message = parse_line("<Run|MPos:0.000,10.000,-1.000|FS:500,12000>");
        match message {
            GrblMessage::Status(report) => {
                assert_eq!(report.state, MachineState::Run);
                assert_eq!(report.feed, Some(500.0));
                assert_eq!(report.spindle, Some(12000.0));
            }
            other => panic!("expected status, got {:?}", other),
        }
    }

    #[test]
    fn status_with_work_position_and_unknown_fields() {
        let message = parse_line("<Hold:0|MPos:5.0,5.0,5.0|WPos:0.0,0.0,0.0|Pn:XY|Bf:15,128>");
        match message {
            GrblMessage::Status(report) => {
                assert_eq!(report.state, MachineState::Hold(0));
                assert_eq!(report.work_position, Some(vec![0.0, 0.0, 0.0]));
                assert_eq!(report.unknown_fields, vec!["Pn:XY".to_string(), "Bf:15,128".to_string()]);
            }
            other => panic!("expected status, got {:?}", other),
        }
    }

    #[test]
    fn status_with_work_position_only() {
        let message = parse_line("<Idle|WPos:1.0,2.0,3.0>");
        match message {
            GrblMessage::Status(report) => {
                assert_eq!(report.machine_position, array![1.0, 2.0, 3.0]);
            }
            other => panic!("expected status, got {:?}", other),
        }
    }

    #[test]
    fn garbled_status_is_unrecognized() {
        assert!(matches!(
            parse_line("<Idle|MPos:1.0,banana,3.0>"),
            GrblMessage::Unrecognized(_)
        ));
        assert!(matches!(parse_line("<Nonsense|MPos:0,0,0>"), GrblMessage::Unrecognized(_)));
    }

    #[test]
    fn probe_report_with_contact() {
        let message = parse_line("[PRB:0.000,0.000,-1.234:1]");
        assert_eq!(
            message,
            GrblMessage::Probe(ProbeReport { position: array![0.0, 0.0, -1.234], contact: true })
        );
    }

    #[test]
    fn probe_report_without_contact() {
        let message = parse_line("[PRB:10.5,20.25,-5.0:0]");
        assert_eq!(
            message,
            GrblMessage::Probe(ProbeReport {
                position: array![10.5, 20.25, -5.0],
                contact: false
            })
        );
    }

    #[test]
    fn terminator_lines() {
        assert_eq!(parse_line("ok"), GrblMessage::Ok);
        assert_eq!(parse_line("error:33"), GrblMessage::Error(33));
        assert_eq!(parse_line("ALARM:1"), GrblMessage::Alarm(1));
    }

    #[test]
    fn settings_and_feedback_lines() {
        assert_eq!(parse_line("$110=5000.000"), GrblMessage::Setting { index: 110, value: 5000.0 });
        assert_eq!(parse_line("$1=25"), GrblMessage::Setting { index: 1, value: 25.0 });
        assert_eq!(
            parse_line("[VER:1.1h.20190825:]"),
            GrblMessage::Feedback("VER:1.1h.20190825:".to_string())
        );
        assert_eq!(parse_line("[MSG:Check door]"), GrblMessage::Feedback("MSG:Check door".to_string()));
        // A `$` command echo is not a setting.
        assert!(matches!(parse_line("$H"), GrblMessage::Unrecognized(_)));
    }

    #[test]
    fn greeting_and_noise() {
        assert!(matches!(parse_line("Grbl 1.1h ['$' for help]"), GrblMessage::Greeting(_)));
        assert!(matches!(parse_line("<<garbage>>"), GrblMessage::Unrecognized(_)));
    }
}
