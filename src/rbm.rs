// Restricted Boltzmann Machine sampler.
//
// A layer is described by borrowed parameters: a weight matrix (visible x hidden) and the two
// bias vectors. Biases may be given once for all rows of the input or one row per time step; the
// latter is how the recurrent conditioner hands its time-varying biases over.
//
// Inputs are matrices with one configuration per row. All rows run their own Gibbs chain, they
// only share the weights.
//
// cost = (F(v) - F(v_sample)) / rows, where F(x) = -x·bv - sum(softplus(x·W + bh)).
// v_sample is a constant as far as cost_gradient() is concerned.

use crate::error::{check_finite, configuration_error, Result};
use crate::matrix::Matrix;
use crate::numeric::{clamp_probability, sigmoid, softplus, xlogy0};
use rand::Rng;
use rayon::prelude::*;

#[derive(Clone, Copy, Debug)]
pub enum Bias<'a> {
    /// Same bias for every row.
    Shared(&'a [f64]),
    /// One bias row per input row.
    PerStep(&'a Matrix),
}

impl<'a> Bias<'a> {
    #[inline]
    pub fn row(&self, t: usize) -> &'a [f64] {
        match *self {
            Bias::Shared(b) => b,
            Bias::PerStep(m) => m.row(t),
        }
    }

    pub fn len(&self) -> usize {
        match *self {
            Bias::Shared(b) => b.len(),
            Bias::PerStep(m) => m.cols(),
        }
    }

    fn check(&self, what: &str, expected_len: usize, rows: usize) -> Result<()> {
        if self.len() != expected_len {
            return configuration_error(format!(
                "{} has {} entries, expected {}",
                what,
                self.len(),
                expected_len
            ));
        }
        if let Bias::PerStep(m) = *self {
            if m.rows() != rows {
                return configuration_error(format!(
                    "{} has {} time steps, input has {}",
                    what,
                    m.rows(),
                    rows
                ));
            }
        }
        Ok(())
    }
}

#[derive(Clone, Copy, Debug)]
pub struct Rbm<'a> {
    weights: &'a Matrix,
    visible_bias: Bias<'a>,
    hidden_bias: Bias<'a>,
}

/// Result of running a CD-k chain from a batch of data.
#[derive(Clone, Debug)]
pub struct ContrastiveDivergence {
    /// Negative particles, same shape as the input.
    pub sample: Matrix,
    pub cost: f64,
    /// Pseudo-log-likelihood of the input, averaged over rows. Always <= 0.
    pub monitor: f64,
}

/// Gradient of the CD cost. Bias gradients are kept per row so the caller can route them back
/// through whatever produced the time-varying biases.
#[derive(Clone, Debug)]
pub struct RbmGradient {
    pub weights: Matrix,
    pub visible_bias: Matrix,
    pub hidden_bias: Matrix,
    /// Derivative of the cost with respect to the data rows (not the sample).
    pub input: Matrix,
}

impl<'a> Rbm<'a> {
    pub fn new(weights: &'a Matrix, visible_bias: Bias<'a>, hidden_bias: Bias<'a>) -> Self {
        Rbm {
            weights,
            visible_bias,
            hidden_bias,
        }
    }

    pub fn num_visible(&self) -> usize {
        self.weights.rows()
    }

    pub fn num_hidden(&self) -> usize {
        self.weights.cols()
    }

    fn check_input(&self, v: &Matrix) -> Result<()> {
        if v.rows() == 0 {
            return configuration_error("RBM input has no rows");
        }
        if v.cols() != self.num_visible() {
            return configuration_error(format!(
                "RBM input has {} columns, weights expect {}",
                v.cols(),
                self.num_visible()
            ));
        }
        self.visible_bias
            .check("visible bias", self.num_visible(), v.rows())?;
        self.hidden_bias
            .check("hidden bias", self.num_hidden(), v.rows())?;
        Ok(())
    }

    /// sigmoid(x·W + bh_t)
    #[inline]
    pub fn hidden_probabilities(&self, t: usize, visible: &[f64], out: &mut [f64]) {
        self.weights.left_multiply(visible, out);
        for (o, b) in out.iter_mut().zip(self.hidden_bias.row(t).iter()) {
            *o = sigmoid(*o + b);
        }
    }

    /// sigmoid(h·Wᵀ + bv_t)
    #[inline]
    pub fn visible_probabilities(&self, t: usize, hidden: &[f64], out: &mut [f64]) {
        self.weights.left_multiply_transposed(hidden, out);
        for (o, b) in out.iter_mut().zip(self.visible_bias.row(t).iter()) {
            *o = sigmoid(*o + b);
        }
    }

    fn all_hidden_probabilities(&self, v: &Matrix) -> Matrix {
        let mut probs = Matrix::zeros(v.rows(), self.num_hidden());
        let nh = self.num_hidden();
        probs
            .as_mut_slice()
            .par_chunks_mut(nh.max(1))
            .enumerate()
            .for_each(|(t, out)| self.hidden_probabilities(t, v.row(t), out));
        probs
    }

    fn all_visible_probabilities(&self, h: &Matrix) -> Matrix {
        let mut probs = Matrix::zeros(h.rows(), self.num_visible());
        let nv = self.num_visible();
        probs
            .as_mut_slice()
            .par_chunks_mut(nv.max(1))
            .enumerate()
            .for_each(|(t, out)| self.visible_probabilities(t, h.row(t), out));
        probs
    }

    /// One alternating update v -> h -> v. Returns (visible probabilities, visible sample).
    pub fn gibbs_step<R: Rng>(&self, v: &Matrix, rng: &mut R) -> (Matrix, Matrix) {
        let mut h = self.all_hidden_probabilities(v);
        sample_bernoulli(&mut h, rng);
        let mean_v = self.all_visible_probabilities(&h);
        let mut v_next = mean_v.clone();
        sample_bernoulli(&mut v_next, rng);
        (mean_v, v_next)
    }

    /// Runs `k` Gibbs steps starting from `v` and returns the final visible sample.
    pub fn gibbs_chain<R: Rng>(&self, v: &Matrix, k: usize, rng: &mut R) -> Result<Matrix> {
        if k == 0 {
            return configuration_error("Gibbs chain length must be at least 1");
        }
        self.check_input(v)?;
        let mut state = v.clone();
        for _ in 0..k {
            let (_mean_v, v_next) = self.gibbs_step(&state, rng);
            state = v_next;
        }
        Ok(state)
    }

    /// Free energy of one row, using the biases of time step `t`.
    pub fn free_energy_row(&self, t: usize, x: &[f64]) -> f64 {
        let mut activation = vec![0.0; self.num_hidden()];
        self.weights.left_multiply(x, &mut activation);
        let mut energy: f64 = 0.0;
        for (xv, bv) in x.iter().zip(self.visible_bias.row(t).iter()) {
            energy -= xv * bv;
        }
        for (a, bh) in activation.iter().zip(self.hidden_bias.row(t).iter()) {
            energy -= softplus(a + bh);
        }
        energy
    }

    /// Sum of free energies over all rows.
    pub fn free_energy(&self, v: &Matrix) -> f64 {
        (0..v.rows())
            .into_par_iter()
            .map(|t| self.free_energy_row(t, v.row(t)))
            .collect::<Vec<f64>>()
            .iter()
            .sum()
    }

    /// (F(v) - F(v_sample)) / rows.
    pub fn cost(&self, v: &Matrix, v_sample: &Matrix) -> f64 {
        (self.free_energy(v) - self.free_energy(v_sample)) / v.rows() as f64
    }

    /// Pseudo-log-likelihood of `v` under the reconstruction that the final chain state produces:
    /// one more hidden sample is drawn from `v_sample` and the visible probabilities computed
    /// from it (without sampling the visible layer again).
    pub fn pseudo_log_likelihood<R: Rng>(&self, v: &Matrix, v_sample: &Matrix, rng: &mut R) -> f64 {
        let mut h = self.all_hidden_probabilities(v_sample);
        sample_bernoulli(&mut h, rng);
        let mean_v = self.all_visible_probabilities(&h);
        let mut monitor: f64 = 0.0;
        for (x, m) in v.as_slice().iter().zip(mean_v.as_slice().iter()) {
            let m = clamp_probability(*m);
            monitor += xlogy0(*x, m) + xlogy0(1.0 - *x, 1.0 - m);
        }
        monitor / v.rows() as f64
    }

    /// CD-k: chain, cost and monitor in one go.
    pub fn contrastive_divergence<R: Rng>(
        &self,
        v: &Matrix,
        k: usize,
        rng: &mut R,
    ) -> Result<ContrastiveDivergence> {
        let sample = self.gibbs_chain(v, k, rng)?;
        let monitor = self.pseudo_log_likelihood(v, &sample, rng);
        let cost = self.cost(v, &sample);
        Ok(ContrastiveDivergence {
            cost: check_finite("CD cost", cost)?,
            monitor: check_finite("pseudo-log-likelihood", monitor)?,
            sample,
        })
    }

    /// Gradient of cost(v, sample) with the sample held constant.
    pub fn cost_gradient(&self, v: &Matrix, sample: &Matrix) -> RbmGradient {
        assert_eq!(v.shape(), sample.shape());
        let rows = v.rows();
        let scale = 1.0 / rows as f64;
        let p_data = self.all_hidden_probabilities(v);
        let p_sample = self.all_hidden_probabilities(sample);

        let mut weights = self.weights.zero_like();
        let mut visible_bias = Matrix::zeros(rows, self.num_visible());
        let mut hidden_bias = Matrix::zeros(rows, self.num_hidden());
        let mut input = Matrix::zeros(rows, self.num_visible());

        for t in 0..rows {
            weights.add_outer(v.row(t), p_data.row(t), -scale);
            weights.add_outer(sample.row(t), p_sample.row(t), scale);

            visible_bias.add_to_row(t, sample.row(t), scale);
            visible_bias.add_to_row(t, v.row(t), -scale);
            hidden_bias.add_to_row(t, p_sample.row(t), scale);
            hidden_bias.add_to_row(t, p_data.row(t), -scale);

            // dF/dx = -bv - sigmoid(x·W + bh)·Wᵀ
            let dx = input.row_mut(t);
            self.weights.left_multiply_transposed(p_data.row(t), dx);
            for (d, b) in dx.iter_mut().zip(self.visible_bias.row(t).iter()) {
                *d = -(*d + b) * scale;
            }
        }

        RbmGradient {
            weights,
            visible_bias,
            hidden_bias,
            input,
        }
    }
}

/// Replaces every probability with a 0/1 draw.
pub fn sample_bernoulli<R: Rng>(probabilities: &mut Matrix, rng: &mut R) {
    for p in probabilities.as_mut_slice().iter_mut() {
        *p = if rng.random::<f64>() < *p { 1.0 } else { 0.0 };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn weights(nv: usize, nh: usize, seed: u64) -> Matrix {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut w = Matrix::zeros(nv, nh);
        for v in w.as_mut_slice().iter_mut() {
            *v = rng.random_range(-0.5..0.5);
        }
        w
    }

    fn binary_input(rows: usize, cols: usize, seed: u64) -> Matrix {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut m = Matrix::replicate(0.5, rows, cols);
        sample_bernoulli(&mut m, &mut rng);
        m
    }

    quickcheck! {
        fn chain_keeps_the_shape_of_its_input(rows: usize, k: usize) -> bool {
            let rows = 1 + rows % 6;
            let k = 1 + k % 4;
            let w = weights(5, 3, 1);
            let bv = vec![0.1; 5];
            let bh = vec![-0.1; 3];
            let rbm = Rbm::new(&w, Bias::Shared(&bv), Bias::Shared(&bh));
            let v = binary_input(rows, 5, 2);
            let mut rng = StdRng::seed_from_u64(3);
            let out = rbm.gibbs_chain(&v, k, &mut rng).unwrap();
            out.shape() == v.shape() && out.as_slice().iter().all(|x| *x == 0.0 || *x == 1.0)
        }
    }

    quickcheck! {
        fn monitor_is_never_positive(seed: u64) -> bool {
            let w = weights(6, 4, seed);
            let bv = vec![0.0; 6];
            let bh = vec![0.0; 4];
            let rbm = Rbm::new(&w, Bias::Shared(&bv), Bias::Shared(&bh));
            let mut rng = StdRng::seed_from_u64(seed);
            let mut v = Matrix::zeros(3, 6);
            for x in v.as_mut_slice().iter_mut() {
                *x = rng.random::<f64>();
            }
            let cd = rbm.contrastive_divergence(&v, 2, &mut rng).unwrap();
            cd.monitor <= 0.0
        }
    }

    #[test]
    fn zero_length_chain_is_rejected() {
        let w = weights(4, 2, 1);
        let bv = vec![0.0; 4];
        let bh = vec![0.0; 2];
        let rbm = Rbm::new(&w, Bias::Shared(&bv), Bias::Shared(&bh));
        let v = binary_input(2, 4, 1);
        let mut rng = StdRng::seed_from_u64(1);
        assert!(rbm.gibbs_chain(&v, 0, &mut rng).is_err());
    }

    #[test]
    fn cost_is_zero_when_sample_equals_input() {
        let w = weights(8, 5, 4);
        let bv = Matrix::from_vec(2, 8, (0..16).map(|x| x as f64 * 0.01).collect());
        let bh = Matrix::from_vec(2, 5, (0..10).map(|x| x as f64 * -0.02).collect());
        let rbm = Rbm::new(&w, Bias::PerStep(&bv), Bias::PerStep(&bh));
        let v = binary_input(2, 8, 5);
        assert_eq!(rbm.cost(&v, &v), 0.0);
    }

    #[test]
    fn per_step_bias_must_match_number_of_rows() {
        let w = weights(3, 2, 1);
        let bv = Matrix::zeros(4, 3);
        let bh = vec![0.0; 2];
        let rbm = Rbm::new(&w, Bias::PerStep(&bv), Bias::Shared(&bh));
        let v = binary_input(2, 3, 1);
        let mut rng = StdRng::seed_from_u64(1);
        assert!(rbm.gibbs_chain(&v, 1, &mut rng).is_err());
    }

    #[test]
    fn free_energy_survives_saturation() {
        let w = Matrix::replicate(1000.0, 3, 2);
        let bv = vec![0.0; 3];
        let bh = vec![0.0; 2];
        let rbm = Rbm::new(&w, Bias::Shared(&bv), Bias::Shared(&bh));
        let v = Matrix::replicate(1.0, 1, 3);
        assert!(rbm.free_energy(&v).is_finite());
        let mut rng = StdRng::seed_from_u64(1);
        let cd = rbm.contrastive_divergence(&v, 1, &mut rng).unwrap();
        assert!(cd.monitor.is_finite());
    }

    // Compare the analytic gradient against central differences of cost() with the sample fixed.
    #[test]
    fn cost_gradient_matches_finite_differences() {
        let mut w = weights(4, 3, 11);
        let bv = Matrix::from_vec(2, 4, vec![0.1, -0.2, 0.3, 0.0, 0.2, 0.1, -0.1, 0.05]);
        let bh = Matrix::from_vec(2, 3, vec![-0.1, 0.2, 0.0, 0.3, -0.3, 0.1]);
        let v = Matrix::from_vec(2, 4, vec![1.0, 0.0, 1.0, 0.0, 0.0, 1.0, 1.0, 1.0]);
        let sample = Matrix::from_vec(2, 4, vec![0.0, 0.0, 1.0, 1.0, 1.0, 1.0, 0.0, 1.0]);

        let grad = Rbm::new(&w, Bias::PerStep(&bv), Bias::PerStep(&bh)).cost_gradient(&v, &sample);

        let eps = 1e-6;
        for idx in 0..w.as_slice().len() {
            let orig = w.as_slice()[idx];
            w.as_mut_slice()[idx] = orig + eps;
            let plus = Rbm::new(&w, Bias::PerStep(&bv), Bias::PerStep(&bh)).cost(&v, &sample);
            w.as_mut_slice()[idx] = orig - eps;
            let minus = Rbm::new(&w, Bias::PerStep(&bv), Bias::PerStep(&bh)).cost(&v, &sample);
            w.as_mut_slice()[idx] = orig;
            let numeric = (plus - minus) / (2.0 * eps);
            assert!((numeric - grad.weights.as_slice()[idx]).abs() < 1e-6);
        }

        let mut bh2 = bh.clone();
        for idx in 0..bh2.as_slice().len() {
            let orig = bh2.as_slice()[idx];
            bh2.as_mut_slice()[idx] = orig + eps;
            let plus = Rbm::new(&w, Bias::PerStep(&bv), Bias::PerStep(&bh2)).cost(&v, &sample);
            bh2.as_mut_slice()[idx] = orig - eps;
            let minus = Rbm::new(&w, Bias::PerStep(&bv), Bias::PerStep(&bh2)).cost(&v, &sample);
            bh2.as_mut_slice()[idx] = orig;
            let numeric = (plus - minus) / (2.0 * eps);
            assert!((numeric - grad.hidden_bias.as_slice()[idx]).abs() < 1e-6);
        }

        // data rows only; the sample stays fixed
        let mut v2 = v.clone();
        for idx in 0..v2.as_slice().len() {
            let orig = v2.as_slice()[idx];
            v2.as_mut_slice()[idx] = orig + eps;
            let rbm = Rbm::new(&w, Bias::PerStep(&bv), Bias::PerStep(&bh));
            let plus = rbm.cost(&v2, &sample);
            v2.as_mut_slice()[idx] = orig - eps;
            let minus = rbm.cost(&v2, &sample);
            v2.as_mut_slice()[idx] = orig;
            let numeric = (plus - minus) / (2.0 * eps);
            assert!((numeric - grad.input.as_slice()[idx]).abs() < 1e-6);
        }
    }
}
