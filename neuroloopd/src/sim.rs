//! Simulated culture and subject.
//!
//! Deterministic for a given seed. The firing rate follows the stimulation
//! drive with first-order lag; biosignals respond to sustained drive, so a
//! high modulation level at high intensity pushes heart rate up far enough
//! to trip the backend's safety limit.

use neuroloop::protocol::{BiosignalUpdate, NeuralUpdate, VisualUpdate};
use neuroloop::reconcile::EegBands;

pub const GRID_SIZE: usize = 8;
pub const LATENT_DIM: usize = 16;

const BASELINE_RATE: f64 = 0.15;
const RATE_LAG: f64 = 0.2;

#[derive(Debug, Clone)]
pub struct NeuralSim {
    rng_state: u64,
    rate: f64,
    arousal: f64,
    elapsed_ms: f64,
}

impl NeuralSim {
    pub fn new(seed: u64) -> Self {
        Self {
            // xorshift must not start at zero
            rng_state: 0x9E37_79B9_7F4A_7C15u64 ^ seed.max(1),
            rate: BASELINE_RATE,
            arousal: 0.0,
            elapsed_ms: 0.0,
        }
    }

    pub fn rate(&self) -> f64 {
        self.rate
    }

    #[inline]
    fn next_u64(&mut self) -> u64 {
        // xorshift64*
        let mut x = self.rng_state;
        x ^= x >> 12;
        x ^= x << 25;
        x ^= x >> 27;
        self.rng_state = x;
        x.wrapping_mul(2685821657736338717)
    }

    /// Uniform in [0, 1).
    #[inline]
    fn next_f64(&mut self) -> f64 {
        (self.next_u64() >> 11) as f64 / (1u64 << 53) as f64
    }

    /// Uniform in [-amp, amp).
    fn noise(&mut self, amp: f64) -> f64 {
        (self.next_f64() * 2.0 - 1.0) * amp
    }

    /// Advance the culture by `dt_ms` under the given stimulation.
    pub fn step(&mut self, modulation: f64, intensity: f64, dt_ms: f64) -> NeuralUpdate {
        let drive = (BASELINE_RATE + 0.85 * modulation * (0.4 + 0.6 * intensity)).clamp(0.0, 1.0);
        let noise = self.noise(0.02);
        self.rate = (self.rate + (drive - self.rate) * RATE_LAG + noise).clamp(0.0, 1.0);
        self.arousal += (modulation * intensity - self.arousal) * 0.05;

        let spike_count = (self.rate * 30.0).round() as usize;
        let mut spike_times: Vec<f64> = (0..spike_count)
            .map(|_| self.elapsed_ms + self.next_f64() * dt_ms)
            .collect();
        spike_times.sort_by(f64::total_cmp);
        self.elapsed_ms += dt_ms;

        let grid_activity = (0..GRID_SIZE)
            .map(|_| {
                (0..GRID_SIZE)
                    .map(|_| (self.rate + self.noise(0.15)).clamp(0.0, 1.0))
                    .collect()
            })
            .collect();

        let synchrony = (0.2 + 0.6 * modulation + self.noise(0.05)).clamp(0.0, 1.0);
        let entropy = (2.0 - 1.2 * synchrony + self.noise(0.05)).max(0.0);

        NeuralUpdate {
            mean_firing_rate: self.rate,
            spike_times,
            grid_activity,
            synchrony,
            entropy,
        }
    }

    pub fn biosignals(&mut self) -> BiosignalUpdate {
        let a = self.arousal;
        BiosignalUpdate {
            eeg_bands: EegBands {
                alpha: (10.0 - 6.0 * a + self.noise(0.5)).max(0.0),
                beta: (6.0 + 8.0 * a + self.noise(0.5)).max(0.0),
                theta: (5.0 + self.noise(0.5)).max(0.0),
                gamma: (2.0 + 4.0 * a + self.noise(0.3)).max(0.0),
            },
            heart_rate: 68.0 + 62.0 * a + self.noise(2.0),
            hrv: (50.0 - 30.0 * a + self.noise(3.0)).max(1.0),
            gsr: (0.4 + 0.8 * a + self.noise(0.02)).max(0.0),
        }
    }

    /// Latent vector for the generative visual stage; no rendered image.
    pub fn visual(&mut self) -> VisualUpdate {
        let rate = self.rate;
        let latent_vector = (0..LATENT_DIM)
            .map(|i| ((i as f64 + 1.0) * rate).sin() + self.noise(0.1))
            .collect();
        VisualUpdate {
            image: None,
            latent_vector,
            generation_time: 35.0 + self.next_f64() * 15.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_seed_same_trace() {
        let mut a = NeuralSim::new(7);
        let mut b = NeuralSim::new(7);
        for _ in 0..20 {
            assert_eq!(a.step(0.5, 0.5, 100.0).spike_times, b.step(0.5, 0.5, 100.0).spike_times);
        }
    }

    #[test]
    fn modulation_raises_firing_rate() {
        let mut idle = NeuralSim::new(1);
        let mut driven = NeuralSim::new(1);
        for _ in 0..100 {
            idle.step(0.0, 0.5, 100.0);
            driven.step(0.8, 0.5, 100.0);
        }
        assert!(driven.rate() > idle.rate() + 0.2);
    }

    #[test]
    fn outputs_stay_in_range() {
        let mut sim = NeuralSim::new(3);
        for _ in 0..200 {
            let n = sim.step(1.0, 1.0, 100.0);
            assert!((0.0..=1.0).contains(&n.mean_firing_rate));
            assert_eq!(n.grid_activity.len(), GRID_SIZE);
            assert!(n.spike_times.windows(2).all(|w| w[0] <= w[1]));
            let b = sim.biosignals();
            assert!(b.hrv > 0.0 && b.gsr >= 0.0);
        }
    }

    #[test]
    fn sustained_full_drive_trips_heart_rate() {
        let mut sim = NeuralSim::new(11);
        let mut peak: f64 = 0.0;
        for _ in 0..300 {
            sim.step(1.0, 1.0, 100.0);
            peak = peak.max(sim.biosignals().heart_rate);
        }
        assert!(peak > 120.0);
    }
}
