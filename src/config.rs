use crate::error::{configuration_error, Result};
use serde::{Deserialize, Serialize};

/// Hyperparameters of an RNN-DBN. Everything here is fixed for the lifetime of a model.
///
/// The setters consume and return the configuration so they can be chained:
///
/// ```
/// use mj_rnndbn::ModelConfiguration;
/// let config = ModelConfiguration::new().n_hidden(64).n_hidden_recurrent(32).seed(1);
/// assert_eq!(config.n_visible(), 88);
/// ```
#[derive(Clone, Debug, Copy, PartialEq, Serialize, Deserialize)]
pub struct ModelConfiguration {
    pub n_hidden: usize,
    pub n_hidden_recurrent: usize,
    pub learning_rate: f64,
    /// MIDI note numbers, lower bound included and upper bound excluded.
    pub pitch_range: (u8, u8),
    /// Seconds between consecutive time steps of the piano-roll.
    pub dt: f64,
    pub training_gibbs_steps: usize,
    pub generation_gibbs_steps: usize,
    pub generation_horizon: usize,
    pub weight_scale: f64,
    pub recurrent_weight_scale: f64,
    pub seed: u64,
}

impl ModelConfiguration {
    pub fn new() -> Self {
        ModelConfiguration {
            n_hidden: 150,
            n_hidden_recurrent: 100,
            learning_rate: 0.001,
            pitch_range: (21, 109),
            dt: 0.3,
            training_gibbs_steps: 15,
            generation_gibbs_steps: 25,
            generation_horizon: 200,
            weight_scale: 0.01,
            recurrent_weight_scale: 0.0001,
            seed: 0xbeef,
        }
    }

    pub fn n_hidden(self, n_hidden: usize) -> Self {
        Self { n_hidden, ..self }
    }

    pub fn n_hidden_recurrent(self, n_hidden_recurrent: usize) -> Self {
        Self {
            n_hidden_recurrent,
            ..self
        }
    }

    pub fn learning_rate(self, learning_rate: f64) -> Self {
        Self {
            learning_rate,
            ..self
        }
    }

    pub fn pitch_range(self, lo: u8, hi: u8) -> Self {
        Self {
            pitch_range: (lo, hi),
            ..self
        }
    }

    pub fn dt(self, dt: f64) -> Self {
        Self { dt, ..self }
    }

    pub fn training_gibbs_steps(self, training_gibbs_steps: usize) -> Self {
        Self {
            training_gibbs_steps,
            ..self
        }
    }

    pub fn generation_gibbs_steps(self, generation_gibbs_steps: usize) -> Self {
        Self {
            generation_gibbs_steps,
            ..self
        }
    }

    pub fn generation_horizon(self, generation_horizon: usize) -> Self {
        Self {
            generation_horizon,
            ..self
        }
    }

    pub fn weight_scale(self, weight_scale: f64) -> Self {
        Self {
            weight_scale,
            ..self
        }
    }

    pub fn recurrent_weight_scale(self, recurrent_weight_scale: f64) -> Self {
        Self {
            recurrent_weight_scale,
            ..self
        }
    }

    pub fn seed(self, seed: u64) -> Self {
        Self { seed, ..self }
    }

    /// Number of visible units, one per pitch in the range.
    pub fn n_visible(&self) -> usize {
        let (lo, hi) = self.pitch_range;
        (hi as usize).saturating_sub(lo as usize)
    }

    pub fn validate(&self) -> Result<()> {
        let (lo, hi) = self.pitch_range;
        if hi <= lo {
            return configuration_error(format!(
                "pitch range ({}, {}) is empty",
                lo, hi
            ));
        }
        if hi > 128 {
            return configuration_error(format!(
                "pitch range upper bound {} is outside MIDI note numbers",
                hi
            ));
        }
        if self.n_hidden == 0 || self.n_hidden_recurrent == 0 {
            return configuration_error("hidden layer sizes must be positive");
        }
        if self.training_gibbs_steps == 0 || self.generation_gibbs_steps == 0 {
            return configuration_error("Gibbs chains need at least one step");
        }
        if self.generation_horizon == 0 {
            return configuration_error("generation horizon must be positive");
        }
        if !(self.learning_rate > 0.0) || !self.learning_rate.is_finite() {
            return configuration_error(format!(
                "learning rate {} must be positive",
                self.learning_rate
            ));
        }
        if !(self.dt > 0.0) || !self.dt.is_finite() {
            return configuration_error(format!("sampling period {} must be positive", self.dt));
        }
        if !(self.weight_scale >= 0.0) || !(self.recurrent_weight_scale >= 0.0) {
            return configuration_error("initialization scales must be non-negative");
        }
        Ok(())
    }
}

impl Default for ModelConfiguration {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid_and_cover_the_piano() {
        let config = ModelConfiguration::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.n_visible(), 88);
        assert_eq!(config.n_hidden, 150);
        assert_eq!(config.n_hidden_recurrent, 100);
    }

    #[test]
    fn empty_pitch_range_is_rejected() {
        assert!(ModelConfiguration::new()
            .pitch_range(60, 60)
            .validate()
            .is_err());
    }

    #[test]
    fn zero_length_chain_is_rejected() {
        assert!(ModelConfiguration::new()
            .training_gibbs_steps(0)
            .validate()
            .is_err());
        assert!(ModelConfiguration::new()
            .generation_gibbs_steps(0)
            .validate()
            .is_err());
    }

    #[test]
    fn bad_learning_rate_is_rejected() {
        assert!(ModelConfiguration::new()
            .learning_rate(0.0)
            .validate()
            .is_err());
        assert!(ModelConfiguration::new()
            .learning_rate(std::f64::NAN)
            .validate()
            .is_err());
    }
}
