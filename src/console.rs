//! Line-oriented operator commands for the terminal console.

use std::fmt::Write as _;
use std::time::Instant;

use thiserror::Error;

use crate::control::ControlPatch;
use crate::observer::ConsoleSnapshot;
use crate::protocol::CommandSink;
use crate::session::Session;

pub const HELP: &str = "\
Commands:
  consent                       Grant informed consent for this session
  start | stop                  Start or stop stimulation
  estop | e                     EMERGENCY STOP (always accepted)
  set <param> <value> [...]     Update parameters; params: modulation, target, intensity (0..1)
  dismiss                       Dismiss the active alert
  status                        Show current state (empty line also works)
  help                          Show this help
  quit                          Close the session and exit";

#[derive(Debug, Clone, PartialEq)]
pub enum OperatorCommand {
    Consent,
    Start,
    Stop,
    EmergencyStop,
    Set(ControlPatch),
    Dismiss,
    Status,
    Help,
    Quit,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConsoleError {
    #[error("unknown command `{0}` (try `help`)")]
    UnknownCommand(String),
    #[error("`set` needs <param> <value> pairs")]
    MissingValue,
    #[error("unknown parameter `{0}`")]
    UnknownParameter(String),
    #[error("`{0}` is not a number")]
    InvalidNumber(String),
    #[error("{param} must be within [0, 1], got {value}")]
    OutOfRange { param: &'static str, value: f64 },
}

impl OperatorCommand {
    pub fn parse(line: &str) -> Result<Self, ConsoleError> {
        let mut words = line.split_whitespace();
        let Some(head) = words.next() else {
            return Ok(OperatorCommand::Status);
        };
        let cmd = match head.to_ascii_lowercase().as_str() {
            "consent" => OperatorCommand::Consent,
            "start" => OperatorCommand::Start,
            "stop" => OperatorCommand::Stop,
            "estop" | "e" | "emergency" => OperatorCommand::EmergencyStop,
            "dismiss" | "ok" => OperatorCommand::Dismiss,
            "status" | "s" => OperatorCommand::Status,
            "help" | "?" => OperatorCommand::Help,
            "quit" | "exit" | "q" => OperatorCommand::Quit,
            "set" => OperatorCommand::Set(parse_set(words.collect())?),
            other => return Err(ConsoleError::UnknownCommand(other.to_string())),
        };
        Ok(cmd)
    }
}

fn parse_set(args: Vec<&str>) -> Result<ControlPatch, ConsoleError> {
    if args.is_empty() || args.len() % 2 != 0 {
        return Err(ConsoleError::MissingValue);
    }
    let mut patch = ControlPatch::default();
    for pair in args.chunks(2) {
        let (name, raw) = (pair[0], pair[1]);
        let param = match name.to_ascii_lowercase().as_str() {
            "modulation" | "mod" => "modulation",
            "target" | "rate" => "target",
            "intensity" => "intensity",
            _ => return Err(ConsoleError::UnknownParameter(name.to_string())),
        };
        let value: f64 = raw
            .parse()
            .map_err(|_| ConsoleError::InvalidNumber(raw.to_string()))?;
        if !(0.0..=1.0).contains(&value) {
            return Err(ConsoleError::OutOfRange { param, value });
        }
        patch = match param {
            "modulation" => patch.with_modulation_level(value),
            "target" => patch.with_target_firing_rate(value),
            _ => patch.with_stimulus_intensity(value),
        };
    }
    Ok(patch)
}

/// What the console loop should do after a command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Continue(Option<String>),
    Quit,
}

pub fn execute<S: CommandSink>(session: &mut Session<S>, command: OperatorCommand) -> Outcome {
    let reply = match command {
        OperatorCommand::Consent => {
            if session.grant_consent() {
                Some("consent recorded".to_string())
            } else {
                Some("consent already granted".to_string())
            }
        }
        OperatorCommand::Start => {
            if session.start_experiment() {
                Some("start requested".to_string())
            } else {
                // The refusal is shown as the active alert.
                None
            }
        }
        OperatorCommand::Stop => {
            session.stop_experiment();
            Some("stop requested".to_string())
        }
        OperatorCommand::EmergencyStop => {
            session.emergency_stop();
            None
        }
        OperatorCommand::Set(patch) => {
            session.update_control_parameters(patch);
            Some("parameters updated".to_string())
        }
        OperatorCommand::Dismiss => match session.dismiss_alert() {
            Some(_) => Some("alert dismissed".to_string()),
            None => Some("no active alert".to_string()),
        },
        OperatorCommand::Status => Some(status_line(&session.snapshot(), Instant::now())),
        OperatorCommand::Help => Some(HELP.to_string()),
        OperatorCommand::Quit => return Outcome::Quit,
    };
    Outcome::Continue(reply)
}

/// One-line summary for the terminal.
pub fn status_line(snap: &ConsoleSnapshot, now: Instant) -> String {
    let c = &snap.control;
    let mut line = format!(
        "[{}] {} | consent={} | mod={:.2} target={:.2} intensity={:.2}",
        snap.connection.label(),
        if c.is_running { "RUNNING" } else { "idle" },
        if snap.consent_granted { "yes" } else { "no" },
        c.modulation_level,
        c.target_firing_rate,
        c.stimulus_intensity,
    );
    if snap.halt_latched {
        line.push_str(" | HALTED");
    }
    let _ = write!(
        line,
        " | fr={:.3} sync={:.2} | hr={:.0} hrv={:.0} gsr={:.2}",
        snap.neural.firing_rate,
        snap.neural.synchrony,
        snap.biosignal.heart_rate,
        snap.biosignal.heart_rate_variability,
        snap.biosignal.skin_conductance,
    );
    if let Some(alert) = &snap.alert {
        let _ = write!(
            line,
            "\n  {} {}",
            alert.severity.label().to_uppercase(),
            alert.message
        );
        if let Some(left) = alert.remaining(now) {
            let _ = write!(line, " ({}s)", left.as_secs_f32().ceil());
        }
    }
    line
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Command;

    #[test]
    fn parses_basic_commands() {
        assert_eq!(OperatorCommand::parse("  start "), Ok(OperatorCommand::Start));
        assert_eq!(OperatorCommand::parse("E"), Ok(OperatorCommand::EmergencyStop));
        assert_eq!(OperatorCommand::parse(""), Ok(OperatorCommand::Status));
        assert_eq!(OperatorCommand::parse("quit"), Ok(OperatorCommand::Quit));
        assert!(matches!(
            OperatorCommand::parse("launch"),
            Err(ConsoleError::UnknownCommand(_))
        ));
    }

    #[test]
    fn set_builds_a_partial_patch() {
        let cmd = OperatorCommand::parse("set modulation 0.4 target 0.6").unwrap();
        assert_eq!(
            cmd,
            OperatorCommand::Set(
                ControlPatch::default()
                    .with_modulation_level(0.4)
                    .with_target_firing_rate(0.6)
            )
        );
    }

    #[test]
    fn set_rejects_bad_input() {
        assert_eq!(OperatorCommand::parse("set"), Err(ConsoleError::MissingValue));
        assert_eq!(
            OperatorCommand::parse("set modulation"),
            Err(ConsoleError::MissingValue)
        );
        assert!(matches!(
            OperatorCommand::parse("set volume 0.2"),
            Err(ConsoleError::UnknownParameter(_))
        ));
        assert!(matches!(
            OperatorCommand::parse("set intensity lots"),
            Err(ConsoleError::InvalidNumber(_))
        ));
        assert!(matches!(
            OperatorCommand::parse("set intensity 1.5"),
            Err(ConsoleError::OutOfRange { param: "intensity", .. })
        ));
    }

    #[test]
    fn executes_against_a_session() {
        let mut s: Session<Vec<Command>> = Session::with_defaults(Vec::new());

        assert_eq!(execute(&mut s, OperatorCommand::Start), Outcome::Continue(None));
        assert!(s.sink().is_empty());

        execute(&mut s, OperatorCommand::Consent);
        execute(&mut s, OperatorCommand::Start);
        execute(&mut s, OperatorCommand::EmergencyStop);
        assert_eq!(s.sink().len(), 2);
        assert_eq!(s.sink()[1], Command::EmergencyStop);

        assert_eq!(execute(&mut s, OperatorCommand::Quit), Outcome::Quit);
    }

    #[test]
    fn status_line_shows_alert_and_halt() {
        let mut s: Session<Vec<Command>> = Session::with_defaults(Vec::new());
        s.emergency_stop();
        let line = status_line(&s.snapshot(), Instant::now());
        assert!(line.contains("HALTED"));
        assert!(line.contains("INFO Emergency stop activated"));
        assert!(line.starts_with("[disconnected] idle"));
    }
}
