// Parameter registry of the RNN-DBN.
//
// Both trainable layers look at the same registry through a list of names (a "view"). bh1 and
// Wuh1 appear in both views, so an update made while training one layer is seen by the other.
//
// Gradients are stored in a registry of the same layout; only the entries named by the view that
// produced them are meaningful.

use crate::config::ModelConfiguration;
use crate::error::{RnnDbnError, Result};
use crate::matrix::Matrix;
use rand::Rng;
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};
use std::ops::{Index, IndexMut};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ParamName {
    /// visible <-> hidden1 weights
    W1,
    /// visible bias
    Bv,
    /// hidden1 bias (also the visible bias of the second RBM)
    Bh1,
    /// recurrent state -> hidden1 bias
    Wuh1,
    /// recurrent state -> visible bias
    Wuv,
    /// visible -> recurrent state
    Wvu,
    /// recurrent state -> recurrent state
    Wuu,
    /// recurrent state bias
    Bu,
    /// hidden1 <-> hidden2 weights
    W2,
    /// hidden2 bias
    Bh2,
    /// recurrent state -> hidden2 bias
    Wuh2,
}

use ParamName::*;

pub const LAYER1_PARAMS: &[ParamName] = &[W1, Bv, Bh1, Wuh1, Wuv, Wvu, Wuu, Bu];
pub const LAYER2_PARAMS: &[ParamName] = &[W2, Bh2, Bh1, Wuh2, Wuh1];
pub const JOINT_PARAMS: &[ParamName] = &[W1, Bv, Bh1, Wuh1, Wuv, Wvu, Wuu, Bu, W2, Bh2, Wuh2];

impl ParamName {
    pub const ALL: [ParamName; 11] = [W1, Bv, Bh1, Wuh1, Wuv, Wvu, Wuu, Bu, W2, Bh2, Wuh2];

    #[inline]
    pub fn index(self) -> usize {
        self as usize
    }

    pub fn label(self) -> &'static str {
        match self {
            W1 => "W1",
            Bv => "bv",
            Bh1 => "bh1",
            Wuh1 => "Wuh1",
            Wuv => "Wuv",
            Wvu => "Wvu",
            Wuu => "Wuu",
            Bu => "bu",
            W2 => "W2",
            Bh2 => "bh2",
            Wuh2 => "Wuh2",
        }
    }

    pub fn is_bias(self) -> bool {
        matches!(self, Bv | Bh1 | Bu | Bh2)
    }

    /// (rows, cols) of the tensor. Biases are single-row matrices.
    pub fn shape(self, n_visible: usize, n_hidden: usize, n_recurrent: usize) -> (usize, usize) {
        match self {
            W1 => (n_visible, n_hidden),
            Bv => (1, n_visible),
            Bh1 => (1, n_hidden),
            Wuh1 => (n_recurrent, n_hidden),
            Wuv => (n_recurrent, n_visible),
            Wvu => (n_visible, n_recurrent),
            Wuu => (n_recurrent, n_recurrent),
            Bu => (1, n_recurrent),
            W2 => (n_hidden, n_hidden),
            Bh2 => (1, n_hidden),
            Wuh2 => (n_recurrent, n_hidden),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Parameters {
    tensors: Vec<Matrix>,
}

/// Gradients live in the same layout as the parameters they belong to.
pub type Gradients = Parameters;

impl Index<ParamName> for Parameters {
    type Output = Matrix;

    fn index(&self, name: ParamName) -> &Matrix {
        &self.tensors[name.index()]
    }
}

impl IndexMut<ParamName> for Parameters {
    fn index_mut(&mut self, name: ParamName) -> &mut Matrix {
        &mut self.tensors[name.index()]
    }
}

impl Parameters {
    pub fn zeros(n_visible: usize, n_hidden: usize, n_recurrent: usize) -> Self {
        let tensors = ParamName::ALL
            .iter()
            .map(|name| {
                let (rows, cols) = name.shape(n_visible, n_hidden, n_recurrent);
                Matrix::zeros(rows, cols)
            })
            .collect();
        Parameters { tensors }
    }

    /// Fresh parameters: gaussian weights, zero biases.
    pub fn initialize<R: Rng>(config: &ModelConfiguration, rng: &mut R) -> Result<Self> {
        config.validate()?;
        let mut params = Self::zeros(
            config.n_visible(),
            config.n_hidden,
            config.n_hidden_recurrent,
        );
        let weights = normal(config.weight_scale)?;
        let recurrent = normal(config.recurrent_weight_scale)?;
        for name in ParamName::ALL.iter() {
            let dist = match name {
                W1 | W2 => &weights,
                Wuh1 | Wuv | Wvu | Wuu | Wuh2 => &recurrent,
                Bv | Bh1 | Bu | Bh2 => continue,
            };
            for v in params[*name].as_mut_slice().iter_mut() {
                *v = dist.sample(rng);
            }
        }
        Ok(params)
    }

    pub fn zero_like(&self) -> Self {
        Parameters {
            tensors: self.tensors.iter().map(|t| t.zero_like()).collect(),
        }
    }

    pub fn num_parameters(&self) -> usize {
        self.tensors.iter().map(|t| t.as_slice().len()).sum()
    }

    /// The single row of a bias tensor.
    #[inline]
    pub fn bias(&self, name: ParamName) -> &[f64] {
        debug_assert!(name.is_bias());
        self[name].row(0)
    }

    pub fn n_visible(&self) -> usize {
        self[Bv].cols()
    }

    pub fn n_hidden(&self) -> usize {
        self[Bh1].cols()
    }

    pub fn n_recurrent(&self) -> usize {
        self[Bu].cols()
    }

    /// Checks every tensor has the shape implied by the configuration.
    pub fn check_shapes(&self, config: &ModelConfiguration) -> Result<()> {
        if self.tensors.len() != ParamName::ALL.len() {
            return Err(RnnDbnError::Configuration(format!(
                "expected {} parameter tensors, got {}",
                ParamName::ALL.len(),
                self.tensors.len()
            )));
        }
        for name in ParamName::ALL.iter() {
            let expected =
                name.shape(config.n_visible(), config.n_hidden, config.n_hidden_recurrent);
            if !self[*name].is_consistent() {
                return Err(RnnDbnError::Configuration(format!(
                    "{} holds {} values, not {}x{}",
                    name.label(),
                    self[*name].as_slice().len(),
                    self[*name].rows(),
                    self[*name].cols()
                )));
            }
            if self[*name].shape() != expected {
                return Err(RnnDbnError::Configuration(format!(
                    "{} has shape {:?}, expected {:?}",
                    name.label(),
                    self[*name].shape(),
                    expected
                )));
            }
        }
        Ok(())
    }

    /// self[name] += other[name] for every name in the view.
    pub fn accumulate(&mut self, other: &Parameters, view: &[ParamName]) {
        for name in view.iter() {
            self[*name].add_scaled(&other[*name], 1.0);
        }
    }

    /// Fails with the first non-finite gradient entry in the view.
    pub fn check_finite(&self, view: &[ParamName]) -> Result<()> {
        for name in view.iter() {
            if let Some(bad) = self[*name].as_slice().iter().find(|v| !v.is_finite()) {
                return Err(RnnDbnError::NumericInstability {
                    what: format!("gradient of {}", name.label()),
                    value: *bad,
                });
            }
        }
        Ok(())
    }

    /// Vanilla SGD, p <- p - learning_rate * g, for the names in the view.
    ///
    /// The gradients must have been computed completely before this is called; every entry of
    /// the view is checked first, so either all of the view is updated or none of it is.
    pub fn apply_sgd(
        &mut self,
        gradients: &Gradients,
        view: &[ParamName],
        learning_rate: f64,
    ) -> Result<()> {
        gradients.check_finite(view)?;
        let mut seen: Vec<ParamName> = Vec::with_capacity(view.len());
        for name in view.iter() {
            if seen.contains(name) {
                continue;
            }
            seen.push(*name);
            self[*name].add_scaled(&gradients[*name], -learning_rate);
        }
        Ok(())
    }
}

fn normal(scale: f64) -> Result<Normal<f64>> {
    Normal::new(0.0, scale).map_err(|e| {
        RnnDbnError::Configuration(format!("bad initialization scale {}: {}", scale, e))
    })
}

#[cfg(test)]
use quickcheck::{Arbitrary, Gen};

#[cfg(test)]
impl Arbitrary for Parameters {
    fn arbitrary<G: Gen>(g: &mut G) -> Self {
        let n_visible = std::cmp::max(1, usize::arbitrary(g) % 6);
        let n_hidden = std::cmp::max(1, usize::arbitrary(g) % 6);
        let n_recurrent = std::cmp::max(1, usize::arbitrary(g) % 6);
        let mut params = Parameters::zeros(n_visible, n_hidden, n_recurrent);
        for t in params.tensors.iter_mut() {
            for v in t.as_mut_slice().iter_mut() {
                *v = (i16::arbitrary(g) as f64) / 1000.0;
            }
        }
        params
    }
}
