use anyhow::{ensure, Result};
use candle_core::Tensor;

/// Rectified-flow sigma schedule with an optional time-shift warp.
///
/// For `N` steps the schedule holds `N + 1` sigmas over `t` evenly spaced in
/// `[0, 1]`, warped as `sigma = t / (t + s - s * t)`. A shift factor of one
/// leaves the grid linear; larger factors spend more steps near `t = 0`.
#[derive(Debug, Clone)]
pub struct FlowMatchSchedule {
    sigmas: Vec<f64>,
}

impl FlowMatchSchedule {
    pub fn new(num_steps: usize) -> Result<Self> {
        Self::with_time_shift(num_steps, 1.0)
    }

    pub fn with_time_shift(num_steps: usize, shift: f64) -> Result<Self> {
        ensure!(num_steps > 0, "schedule needs at least one step");
        ensure!(
            shift.is_finite() && shift > 0.0,
            "time shift factor must be finite and positive, got {shift}"
        );
        let sigmas = (0..=num_steps)
            .map(|i| {
                let t = i as f64 / num_steps as f64;
                t / (t + shift - shift * t)
            })
            .collect();
        Ok(Self { sigmas })
    }

    pub fn num_steps(&self) -> usize {
        self.sigmas.len() - 1
    }

    /// Noise level fed to the model at step `index`.
    pub fn sigma(&self, index: usize) -> f64 {
        self.sigmas[index]
    }

    /// One Euler update: `latents + (sigma[i+1] - sigma[i]) * velocity`.
    pub fn step(&self, latents: &Tensor, velocity: &Tensor, index: usize) -> Result<Tensor> {
        ensure!(
            index < self.num_steps(),
            "step index {index} out of range for a {}-step schedule",
            self.num_steps()
        );
        let dt = self.sigmas[index + 1] - self.sigmas[index];
        Ok(latents.add(&velocity.affine(dt, 0.0)?)?)
    }
}
