//! Closed-loop stimulus controller.
//!
//! A PID loop that drives the measured mean firing rate toward the target by
//! adjusting the modulation level. Output is clamped to [0, 1]; the integral
//! term is clamped to the same range so it cannot wind up while saturated.
//! The derivative acts on the measurement, not the error, so a setpoint
//! change does not kick the output.

pub const KP: f64 = 2.0;
pub const KI: f64 = 0.1;
pub const KD: f64 = 0.05;

const OUTPUT_MIN: f64 = 0.0;
const OUTPUT_MAX: f64 = 1.0;

#[derive(Debug, Clone)]
pub struct StimulusController {
    setpoint: f64,
    integral: f64,
    last_input: Option<f64>,
    last_output: f64,
}

impl StimulusController {
    pub fn new(target_rate: f64) -> Self {
        Self {
            setpoint: target_rate,
            integral: 0.0,
            last_input: None,
            last_output: 0.0,
        }
    }

    pub fn setpoint(&self) -> f64 {
        self.setpoint
    }

    pub fn set_setpoint(&mut self, target_rate: f64) {
        self.setpoint = target_rate;
    }

    /// Next modulation level for a measured firing rate, `dt` seconds after
    /// the previous update. A non-positive `dt` repeats the last output.
    pub fn update(&mut self, measured_rate: f64, dt: f64) -> f64 {
        if dt <= 0.0 || !measured_rate.is_finite() {
            return self.last_output;
        }

        let error = self.setpoint - measured_rate;
        let proportional = KP * error;

        self.integral = (self.integral + KI * error * dt).clamp(OUTPUT_MIN, OUTPUT_MAX);

        let d_input = self.last_input.map_or(0.0, |prev| measured_rate - prev);
        let derivative = -KD * d_input / dt;

        let output = (proportional + self.integral + derivative).clamp(OUTPUT_MIN, OUTPUT_MAX);
        self.last_input = Some(measured_rate);
        self.last_output = output;
        output
    }

    /// Forget integral and derivative history (after a halt or a restart).
    pub fn reset(&mut self) {
        self.integral = 0.0;
        self.last_input = None;
        self.last_output = 0.0;
    }
}
