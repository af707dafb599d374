//! Line protocol spoken with the stage firmware.
//!
//! Host -> firmware, one line each:
//! - `<Y><X>` move token, Y in {U,D,S}, X in {L,R,S}
//! - `SPEED:<n>`, `STEPS:<n>`, `PULSE:<n>`
//! - `STATUS`
//!
//! Firmware -> host:
//! - `MOVE_OK:<abs_x>,<abs_y>`
//! - `<FIELD>_SET:<n>`
//! - `STATUS:<stepDelay>,<stepsPerCommand>,<pulseWidth>`
//! - `ERROR:<reason>`

use std::fmt;

use crate::servo::{AxisDir, ServoCommand};

use super::state::{Direction, MotorSettings, StagePosition};

/// Two-character move token. Each token moves every non-stay axis by the
/// firmware's steps-per-command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MoveToken {
    /// Positive is up (`U`).
    pub y: AxisDir,
    /// Positive is right (`R`).
    pub x: AxisDir,
}

impl MoveToken {
    pub const STOP: MoveToken = MoveToken {
        y: AxisDir::Stay,
        x: AxisDir::Stay,
    };

    pub fn new(y: AxisDir, x: AxisDir) -> Self {
        Self { y, x }
    }

    pub fn from_command(cmd: &ServoCommand) -> Self {
        Self::new(cmd.axis_y, cmd.axis_x)
    }

    pub fn from_direction(dir: Direction) -> Self {
        match dir {
            Direction::Up => Self::new(AxisDir::Positive, AxisDir::Stay),
            Direction::Down => Self::new(AxisDir::Negative, AxisDir::Stay),
            Direction::Left => Self::new(AxisDir::Stay, AxisDir::Negative),
            Direction::Right => Self::new(AxisDir::Stay, AxisDir::Positive),
            Direction::Stop => Self::STOP,
        }
    }

    pub fn parse(token: &str) -> Option<Self> {
        let mut chars = token.trim().chars();
        let y = match chars.next()?.to_ascii_uppercase() {
            'U' => AxisDir::Positive,
            'D' => AxisDir::Negative,
            'S' => AxisDir::Stay,
            _ => return None,
        };
        let x = match chars.next()?.to_ascii_uppercase() {
            'R' => AxisDir::Positive,
            'L' => AxisDir::Negative,
            'S' => AxisDir::Stay,
            _ => return None,
        };
        if chars.next().is_some() {
            return None;
        }
        Some(Self::new(y, x))
    }

    pub fn is_stop(&self) -> bool {
        self.x.is_stay() && self.y.is_stay()
    }

    /// Displacement this token produces for a given steps-per-command.
    pub fn delta(&self, steps_per_command: u32) -> (i64, i64) {
        let s = steps_per_command as i64;
        (self.x.value() * s, self.y.value() * s)
    }

    /// Position after this token, assuming it is executed in full.
    pub fn apply(&self, from: StagePosition, steps_per_command: u32) -> StagePosition {
        let (dx, dy) = self.delta(steps_per_command);
        from.offset(dx, dy)
    }
}

impl fmt::Display for MoveToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let y = match self.y {
            AxisDir::Positive => 'U',
            AxisDir::Negative => 'D',
            AxisDir::Stay => 'S',
        };
        let x = match self.x {
            AxisDir::Positive => 'R',
            AxisDir::Negative => 'L',
            AxisDir::Stay => 'S',
        };
        write!(f, "{}{}", y, x)
    }
}

/// Configurable firmware fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigField {
    Speed,
    Steps,
    Pulse,
}

impl ConfigField {
    pub fn name(self) -> &'static str {
        match self {
            ConfigField::Speed => "SPEED",
            ConfigField::Steps => "STEPS",
            ConfigField::Pulse => "PULSE",
        }
    }

    fn from_name(name: &str) -> Option<Self> {
        match name {
            "SPEED" => Some(ConfigField::Speed),
            "STEPS" => Some(ConfigField::Steps),
            "PULSE" => Some(ConfigField::Pulse),
            _ => None,
        }
    }
}

/// One request line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Request {
    Move(MoveToken),
    Config(ConfigField, u32),
    Status,
}

impl Request {
    pub fn line(&self) -> String {
        match self {
            Request::Move(token) => token.to_string(),
            Request::Config(field, value) => format!("{}:{}", field.name(), value),
            Request::Status => "STATUS".to_string(),
        }
    }

    /// Whether `reply` is the acknowledgement this request waits for.
    pub fn is_acked_by(&self, reply: &Reply) -> bool {
        match (self, reply) {
            (Request::Move(_), Reply::MoveOk(_)) => true,
            (Request::Config(field, _), Reply::ConfigSet { field: f, .. }) => field == f,
            (Request::Status, Reply::Status(_)) => true,
            _ => false,
        }
    }

    fn expects_prefix(&self) -> String {
        match self {
            Request::Move(_) => "MOVE_OK".to_string(),
            Request::Config(field, _) => format!("{}_SET", field.name()),
            Request::Status => "STATUS".to_string(),
        }
    }

    /// Whether a malformed line looks like a garbled version of this
    /// request's acknowledgement.
    pub fn owns_malformed(&self, line: &str) -> bool {
        line.starts_with(&self.expects_prefix())
    }
}

/// One parsed firmware line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    MoveOk(StagePosition),
    ConfigSet { field: ConfigField, value: u32 },
    Status(MotorSettings),
    Error(String),
    /// A known reply prefix with an unparseable payload.
    Malformed(String),
    /// Anything else (boot banners, debug prints).
    Other(String),
}

impl Reply {
    pub fn parse(line: &str) -> Self {
        let line = line.trim();
        let Some((head, payload)) = line.split_once(':') else {
            return Reply::Other(line.to_string());
        };
        let malformed = || Reply::Malformed(line.to_string());

        match head {
            "ERROR" => Reply::Error(payload.trim().to_string()),
            "MOVE_OK" => match parse_ints::<i64>(payload).as_deref() {
                Some([x, y]) => Reply::MoveOk(StagePosition::new(*x, *y)),
                _ => malformed(),
            },
            "STATUS" => match parse_ints::<u32>(payload).as_deref() {
                Some([delay, steps, pulse]) => Reply::Status(MotorSettings {
                    step_delay_us: *delay,
                    steps_per_command: *steps,
                    pulse_width_us: *pulse,
                }),
                _ => malformed(),
            },
            _ => match head.strip_suffix("_SET").and_then(ConfigField::from_name) {
                Some(field) => match payload.trim().parse() {
                    Ok(value) => Reply::ConfigSet { field, value },
                    Err(_) => malformed(),
                },
                None => Reply::Other(line.to_string()),
            },
        }
    }
}

fn parse_ints<T: std::str::FromStr>(payload: &str) -> Option<Vec<T>> {
    payload.split(',').map(|v| v.trim().parse().ok()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_text() {
        assert_eq!(MoveToken::STOP.to_string(), "SS");
        let ur = MoveToken::parse("UR").unwrap();
        assert_eq!(ur.y, AxisDir::Positive);
        assert_eq!(ur.x, AxisDir::Positive);
        assert_eq!(ur.to_string(), "UR");
        assert_eq!(MoveToken::parse("dl").unwrap().to_string(), "DL");
        assert!(MoveToken::parse("RU").is_none());
        assert!(MoveToken::parse("URX").is_none());
        assert!(MoveToken::parse("U").is_none());
    }

    #[test]
    fn test_token_from_servo_command() {
        let cmd = ServoCommand {
            axis_x: AxisDir::Positive,
            axis_y: AxisDir::Stay,
            ..ServoCommand::stop()
        };
        assert_eq!(MoveToken::from_command(&cmd).to_string(), "SR");
        assert_eq!(MoveToken::from_command(&ServoCommand::stop()), MoveToken::STOP);
    }

    #[test]
    fn test_token_delta() {
        let ur = MoveToken::parse("UR").unwrap();
        assert_eq!(ur.apply(StagePosition::default(), 100), StagePosition::new(100, 100));
        let dl = MoveToken::parse("DL").unwrap();
        assert_eq!(dl.delta(50), (-50, -50));
        assert_eq!(MoveToken::STOP.delta(100), (0, 0));
    }

    #[test]
    fn test_request_lines() {
        assert_eq!(Request::Config(ConfigField::Speed, 4000).line(), "SPEED:4000");
        assert_eq!(Request::Status.line(), "STATUS");
        assert_eq!(Request::Move(MoveToken::parse("DS").unwrap()).line(), "DS");
    }

    #[test]
    fn test_parse_replies() {
        assert_eq!(
            Reply::parse("MOVE_OK:100,-20\r"),
            Reply::MoveOk(StagePosition::new(100, -20))
        );
        assert_eq!(
            Reply::parse("STEPS_SET:50"),
            Reply::ConfigSet {
                field: ConfigField::Steps,
                value: 50
            }
        );
        assert_eq!(
            Reply::parse("STATUS:4000,100,1500"),
            Reply::Status(MotorSettings::default())
        );
        assert_eq!(
            Reply::parse("ERROR:SPEED_OUT_OF_RANGE"),
            Reply::Error("SPEED_OUT_OF_RANGE".to_string())
        );
        assert_eq!(
            Reply::parse("MOVE_OK:abc"),
            Reply::Malformed("MOVE_OK:abc".to_string())
        );
        assert_eq!(Reply::parse("Stage ready"), Reply::Other("Stage ready".to_string()));
    }

    #[test]
    fn test_ack_matching() {
        let speed = Request::Config(ConfigField::Speed, 4000);
        assert!(speed.is_acked_by(&Reply::parse("SPEED_SET:4000")));
        assert!(!speed.is_acked_by(&Reply::parse("STEPS_SET:4000")));
        assert!(!speed.is_acked_by(&Reply::parse("MOVE_OK:0,0")));
        assert!(speed.owns_malformed("SPEED_SET:fast"));
        assert!(Request::Move(MoveToken::STOP).is_acked_by(&Reply::parse("MOVE_OK:0,0")));
    }
}
