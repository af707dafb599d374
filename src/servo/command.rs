//! Discrete motor directives produced by the servo controller.

use nalgebra::Vector2;

/// Direction of one stage axis for a single command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AxisDir {
    Negative,
    Stay,
    Positive,
}

impl AxisDir {
    pub fn from_sign(value: f64) -> Self {
        if value > 0.0 {
            AxisDir::Positive
        } else if value < 0.0 {
            AxisDir::Negative
        } else {
            AxisDir::Stay
        }
    }

    /// -1, 0 or +1.
    pub fn value(self) -> i64 {
        match self {
            AxisDir::Negative => -1,
            AxisDir::Stay => 0,
            AxisDir::Positive => 1,
        }
    }

    pub fn is_stay(self) -> bool {
        self == AxisDir::Stay
    }
}

/// One directive for the motor link, consumed exactly once.
///
/// Stage axes: `axis_x` positive moves right (`R`), `axis_y` positive moves
/// up (`U`).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ServoCommand {
    pub axis_x: AxisDir,
    pub axis_y: AxisDir,
    /// Requested magnitude in motor steps, already clamped.
    pub step_count: u32,
    /// Pixel error that produced the command (zero for stops).
    pub error_px: Vector2<f64>,
}

impl ServoCommand {
    /// Stop-all directive.
    pub fn stop() -> Self {
        Self {
            axis_x: AxisDir::Stay,
            axis_y: AxisDir::Stay,
            step_count: 0,
            error_px: Vector2::zeros(),
        }
    }

    pub fn is_stop(&self) -> bool {
        self.axis_x.is_stay() && self.axis_y.is_stay()
    }
}
