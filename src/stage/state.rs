//! Stage position, limits and motor settings as known to the host.

use std::fmt;

use serde::Deserialize;

/// Position in motor steps.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct StagePosition {
    pub x: i64,
    pub y: i64,
}

impl StagePosition {
    pub fn new(x: i64, y: i64) -> Self {
        Self { x, y }
    }

    pub fn offset(self, dx: i64, dy: i64) -> Self {
        Self::new(self.x + dx, self.y + dy)
    }
}

impl fmt::Display for StagePosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.x, self.y)
    }
}

/// Software boundary, enforced only once an origin has been set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SoftLimits {
    pub min_x: i64,
    pub max_x: i64,
    pub min_y: i64,
    pub max_y: i64,
}

impl SoftLimits {
    pub fn contains(&self, p: StagePosition) -> bool {
        (self.min_x..=self.max_x).contains(&p.x) && (self.min_y..=self.max_y).contains(&p.y)
    }
}

impl Default for SoftLimits {
    fn default() -> Self {
        Self {
            min_x: 0,
            max_x: 50_000,
            min_y: 0,
            max_y: 50_000,
        }
    }
}

impl fmt::Display for SoftLimits {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "x in [{}, {}], y in [{}, {}]",
            self.min_x, self.max_x, self.min_y, self.max_y
        )
    }
}

/// Firmware driver settings, as reported by `STATUS`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MotorSettings {
    /// Delay between step pulses in microseconds (`SPEED`). Larger is slower.
    pub step_delay_us: u32,
    /// Steps executed per move token (`STEPS`).
    pub steps_per_command: u32,
    /// Step pulse width in microseconds (`PULSE`).
    pub pulse_width_us: u32,
}

impl Default for MotorSettings {
    fn default() -> Self {
        Self {
            step_delay_us: 4000,
            steps_per_command: 100,
            pulse_width_us: 1500,
        }
    }
}

/// Named speed / step-size combinations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MotorPreset {
    Fine,
    Normal,
    Fast,
}

impl MotorPreset {
    pub fn step_delay_us(self) -> u32 {
        match self {
            MotorPreset::Fine => 8000,
            MotorPreset::Normal => 4000,
            MotorPreset::Fast => 2000,
        }
    }

    pub fn steps_per_command(self) -> u32 {
        match self {
            MotorPreset::Fine => 50,
            MotorPreset::Normal => 100,
            MotorPreset::Fast => 200,
        }
    }

    /// Name the preset a step delay falls into.
    pub fn classify(step_delay_us: u32) -> Self {
        if step_delay_us > 6000 {
            MotorPreset::Fine
        } else if step_delay_us < 3000 {
            MotorPreset::Fast
        } else {
            MotorPreset::Normal
        }
    }
}

/// Manual jog directions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Up,
    Down,
    Left,
    Right,
    Stop,
}

/// Everything the host believes about the stage. Only acknowledged
/// replies change it.
#[derive(Debug, Clone, Default)]
pub struct StageState {
    /// Last position reported by the firmware, in its own frame.
    pub firmware_position: StagePosition,
    /// Firmware position that was declared home.
    pub origin: Option<StagePosition>,
    pub limits: SoftLimits,
    pub settings: MotorSettings,
}

impl StageState {
    pub fn origin_set(&self) -> bool {
        self.origin.is_some()
    }

    /// Position relative to home, or the raw firmware position before home
    /// is set.
    pub fn position(&self) -> StagePosition {
        match self.origin {
            Some(o) => StagePosition::new(
                self.firmware_position.x - o.x,
                self.firmware_position.y - o.y,
            ),
            None => self.firmware_position,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_preset_classification() {
        assert_eq!(MotorPreset::classify(8000), MotorPreset::Fine);
        assert_eq!(MotorPreset::classify(6001), MotorPreset::Fine);
        assert_eq!(MotorPreset::classify(6000), MotorPreset::Normal);
        assert_eq!(MotorPreset::classify(3000), MotorPreset::Normal);
        assert_eq!(MotorPreset::classify(2999), MotorPreset::Fast);
        for preset in [MotorPreset::Fine, MotorPreset::Normal, MotorPreset::Fast] {
            assert_eq!(MotorPreset::classify(preset.step_delay_us()), preset);
        }
    }

    #[test]
    fn test_position_relative_to_origin() {
        let mut state = StageState {
            firmware_position: StagePosition::new(300, -200),
            ..StageState::default()
        };
        assert_eq!(state.position(), StagePosition::new(300, -200));
        state.origin = Some(StagePosition::new(300, -200));
        assert_eq!(state.position(), StagePosition::new(0, 0));
        state.firmware_position = StagePosition::new(400, -100);
        assert_eq!(state.position(), StagePosition::new(100, 100));
    }

    #[test]
    fn test_limits_inclusive() {
        let limits = SoftLimits {
            max_x: 500,
            ..SoftLimits::default()
        };
        assert!(limits.contains(StagePosition::new(500, 0)));
        assert!(!limits.contains(StagePosition::new(501, 0)));
        assert!(!limits.contains(StagePosition::new(0, -1)));
    }
}
