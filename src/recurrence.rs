// Recurrent conditioner of the RNN-DBN.
//
// The recurrent hidden state u advances as
//
//   u_t = tanh(bu + v_t·Wvu + u_{t-1}·Wuu),    u_0 = 0
//
// and at every time step it shifts the RBM biases:
//
//   bv_t  = bv  + u_{t-1}·Wuv
//   bh1_t = bh1 + u_{t-1}·Wuh1
//   bh2_t = bh2 + u_{t-1}·Wuh2
//
// There are two ways to drive it. The forced recurrences run over an observed sequence and are
// fully deterministic; they produce the per-step biases for a whole minibatch at once. The
// generative recurrence has no data and has to sample each time step (with a Gibbs chain in the
// top RBM) before it can advance.

use crate::error::{configuration_error, Result};
use crate::matrix::Matrix;
use crate::numeric::{sigmoid, tanh_derivative_from_output};
use crate::params::{Gradients, ParamName, Parameters};
use crate::rbm::{sample_bernoulli, Bias, Rbm};
use crate::rnn::RNNState;
use rand::Rng;

#[derive(Clone, Debug)]
pub struct RecurrentState<'a> {
    params: &'a Parameters,
    memories: Vec<f64>,
    activation: Vec<f64>,
    scratch: Vec<f64>,
}

impl<'a> RecurrentState<'a> {
    pub fn new(params: &'a Parameters) -> Self {
        let nr = params.n_recurrent();
        RecurrentState {
            params,
            memories: vec![0.0; nr],
            activation: vec![0.0; nr],
            scratch: vec![0.0; nr],
        }
    }

    /// bias + u_{t-1}·weights, where u_{t-1} is the current memory.
    pub fn conditioned_bias(&self, bias: ParamName, weights: ParamName, out: &mut [f64]) {
        self.params[weights].left_multiply(&self.memories, out);
        for (o, b) in out.iter_mut().zip(self.params.bias(bias).iter()) {
            *o += b;
        }
    }
}

impl<'a> RNNState for RecurrentState<'a> {
    fn propagate<'b, 'c>(&'b mut self, inputs: &'c [f64]) -> &'b [f64] {
        let params = self.params;
        params[ParamName::Wvu].left_multiply(inputs, &mut self.activation);
        params[ParamName::Wuu].left_multiply(&self.memories, &mut self.scratch);
        for ((m, a), (s, b)) in self
            .memories
            .iter_mut()
            .zip(self.activation.iter())
            .zip(self.scratch.iter().zip(params.bias(ParamName::Bu).iter()))
        {
            *m = (a + s + b).tanh();
        }
        &self.memories
    }

    fn memories(&self) -> &[f64] {
        &self.memories
    }
}

/// Everything the first layer's forced recurrence produced for one minibatch.
#[derive(Clone, Debug, PartialEq)]
pub struct Layer1Trace {
    /// u_{t-1}, the state the biases of step t were computed from.
    pub previous_states: Matrix,
    /// u_t
    pub states: Matrix,
    /// bv_t
    pub visible_bias: Matrix,
    /// bh1_t
    pub hidden_bias: Matrix,
}

/// Per-step biases of the second layer's RBM. Its visible layer is hidden layer 1.
#[derive(Clone, Debug, PartialEq)]
pub struct Layer2Trace {
    pub previous_states: Matrix,
    /// bh1_t
    pub visible_bias: Matrix,
    /// bh2_t
    pub hidden_bias: Matrix,
}

fn check_visible(params: &Parameters, v: &Matrix) -> Result<()> {
    if v.cols() != params.n_visible() {
        return configuration_error(format!(
            "sequence has {} pitches per time step, model has {} visible units",
            v.cols(),
            params.n_visible()
        ));
    }
    Ok(())
}

/// Left-to-right scan of the layer-1 recurrence over an observed sequence.
pub fn forced_recurrence_layer1(params: &Parameters, v: &Matrix) -> Result<Layer1Trace> {
    check_visible(params, v)?;
    let steps = v.rows();
    let mut trace = Layer1Trace {
        previous_states: Matrix::zeros(steps, params.n_recurrent()),
        states: Matrix::zeros(steps, params.n_recurrent()),
        visible_bias: Matrix::zeros(steps, params.n_visible()),
        hidden_bias: Matrix::zeros(steps, params.n_hidden()),
    };
    let mut state = RecurrentState::new(params);
    for t in 0..steps {
        trace
            .previous_states
            .row_mut(t)
            .copy_from_slice(state.memories());
        state.conditioned_bias(ParamName::Bv, ParamName::Wuv, trace.visible_bias.row_mut(t));
        state.conditioned_bias(ParamName::Bh1, ParamName::Wuh1, trace.hidden_bias.row_mut(t));
        let u = state.propagate(v.row(t));
        trace.states.row_mut(t).copy_from_slice(u);
    }
    Ok(trace)
}

/// Layer-2 recurrence over an observed sequence. `h` is the layer-1 hidden activation for the
/// same time steps; the state itself is driven by `v` only.
pub fn forced_recurrence_layer2(params: &Parameters, v: &Matrix, h: &Matrix) -> Result<Layer2Trace> {
    check_visible(params, v)?;
    if h.rows() != v.rows() || h.cols() != params.n_hidden() {
        return configuration_error(format!(
            "hidden activations have shape {:?}, expected ({}, {})",
            h.shape(),
            v.rows(),
            params.n_hidden()
        ));
    }
    let steps = v.rows();
    let mut trace = Layer2Trace {
        previous_states: Matrix::zeros(steps, params.n_recurrent()),
        visible_bias: Matrix::zeros(steps, params.n_hidden()),
        hidden_bias: Matrix::zeros(steps, params.n_hidden()),
    };
    let mut state = RecurrentState::new(params);
    for t in 0..steps {
        trace
            .previous_states
            .row_mut(t)
            .copy_from_slice(state.memories());
        state.conditioned_bias(ParamName::Bh1, ParamName::Wuh1, trace.visible_bias.row_mut(t));
        state.conditioned_bias(ParamName::Bh2, ParamName::Wuh2, trace.hidden_bias.row_mut(t));
        state.propagate(v.row(t));
    }
    Ok(trace)
}

impl Layer1Trace {
    /// Backpropagation through time.
    ///
    /// `visible_bias_grad` and `hidden_bias_grad` are the derivatives of the cost with respect to
    /// bv_t and bh1_t (one row per time step). Adds the gradients of bv, bh1, Wuv, Wuh1, Wvu, Wuu
    /// and bu to `grads`.
    pub fn backpropagate(
        &self,
        params: &Parameters,
        v: &Matrix,
        visible_bias_grad: &Matrix,
        hidden_bias_grad: &Matrix,
        grads: &mut Gradients,
    ) {
        let steps = v.rows();
        let nr = params.n_recurrent();
        assert_eq!(self.states.rows(), steps);
        assert_eq!(visible_bias_grad.rows(), steps);
        assert_eq!(hidden_bias_grad.rows(), steps);

        // d cost / d u_t, flowing back from step t+1. The last state feeds nothing.
        let mut carry: Vec<f64> = vec![0.0; nr];
        let mut d_activation: Vec<f64> = vec![0.0; nr];
        let mut d_previous: Vec<f64> = vec![0.0; nr];
        let mut tmp: Vec<f64> = vec![0.0; nr];

        for t in (0..steps).rev() {
            let u_prev = self.previous_states.row(t);
            let u = self.states.row(t);
            for idx in 0..nr {
                d_activation[idx] = carry[idx] * tanh_derivative_from_output(u[idx]);
            }
            grads[ParamName::Bu].add_to_row(0, &d_activation, 1.0);
            grads[ParamName::Wvu].add_outer(v.row(t), &d_activation, 1.0);
            grads[ParamName::Wuu].add_outer(u_prev, &d_activation, 1.0);

            let dbv = visible_bias_grad.row(t);
            let dbh = hidden_bias_grad.row(t);
            grads[ParamName::Bv].add_to_row(0, dbv, 1.0);
            grads[ParamName::Bh1].add_to_row(0, dbh, 1.0);
            grads[ParamName::Wuv].add_outer(u_prev, dbv, 1.0);
            grads[ParamName::Wuh1].add_outer(u_prev, dbh, 1.0);

            params[ParamName::Wuu].left_multiply_transposed(&d_activation, &mut d_previous);
            params[ParamName::Wuv].left_multiply_transposed(dbv, &mut tmp);
            for idx in 0..nr {
                d_previous[idx] += tmp[idx];
            }
            params[ParamName::Wuh1].left_multiply_transposed(dbh, &mut tmp);
            for idx in 0..nr {
                d_previous[idx] += tmp[idx];
            }
            std::mem::swap(&mut carry, &mut d_previous);
        }
    }
}

impl Layer2Trace {
    /// Adds the gradients of bh1, bh2, Wuh1 and Wuh2 that flow through the per-step biases.
    ///
    /// The recurrent state is not differentiated here: the second layer does not own Wvu, Wuu
    /// or bu.
    pub fn backpropagate(
        &self,
        visible_bias_grad: &Matrix,
        hidden_bias_grad: &Matrix,
        grads: &mut Gradients,
    ) {
        for t in 0..self.previous_states.rows() {
            let u_prev = self.previous_states.row(t);
            let dbh1 = visible_bias_grad.row(t);
            let dbh2 = hidden_bias_grad.row(t);
            grads[ParamName::Bh1].add_to_row(0, dbh1, 1.0);
            grads[ParamName::Bh2].add_to_row(0, dbh2, 1.0);
            grads[ParamName::Wuh1].add_outer(u_prev, dbh1, 1.0);
            grads[ParamName::Wuh2].add_outer(u_prev, dbh2, 1.0);
        }
    }
}

/// One generated time step.
#[derive(Clone, Debug)]
pub struct GeneratedStep {
    /// Hidden layer 1 sample from the top RBM's Gibbs chain.
    pub hidden: Vec<f64>,
    /// Binary visible sample.
    pub visible: Vec<f64>,
}

/// The recurrence used for sampling: no observed data, every step draws h_t from the top RBM
/// and then v_t from the bottom one before the state can advance.
#[derive(Clone, Debug)]
pub struct GenerativeRecurrence<'a> {
    state: RecurrentState<'a>,
    gibbs_steps: usize,
    visible_bias: Matrix,
    hidden_bias: Matrix,
    start: Matrix,
}

impl<'a> GenerativeRecurrence<'a> {
    pub fn new(params: &'a Parameters, gibbs_steps: usize) -> Result<Self> {
        if gibbs_steps == 0 {
            return configuration_error("Gibbs chain length must be at least 1");
        }
        let nh = params.n_hidden();
        Ok(GenerativeRecurrence {
            state: RecurrentState::new(params),
            gibbs_steps,
            visible_bias: Matrix::zeros(1, nh),
            hidden_bias: Matrix::zeros(1, nh),
            start: Matrix::zeros(1, nh),
        })
    }

    pub fn memories(&self) -> &[f64] {
        self.state.memories()
    }

    pub fn step<R: Rng>(&mut self, rng: &mut R) -> Result<GeneratedStep> {
        let params = self.state.params;
        self.state
            .conditioned_bias(ParamName::Bh1, ParamName::Wuh1, self.visible_bias.row_mut(0));
        self.state
            .conditioned_bias(ParamName::Bh2, ParamName::Wuh2, self.hidden_bias.row_mut(0));

        let top = Rbm::new(
            &params[ParamName::W2],
            Bias::PerStep(&self.visible_bias),
            Bias::PerStep(&self.hidden_bias),
        );
        let hidden = top.gibbs_chain(&self.start, self.gibbs_steps, rng)?;

        // the visible layer uses the static bias bv here
        let bottom = Rbm::new(
            &params[ParamName::W1],
            Bias::Shared(params.bias(ParamName::Bv)),
            Bias::Shared(params.bias(ParamName::Bh1)),
        );
        let mut visible = Matrix::zeros(1, params.n_visible());
        bottom.visible_probabilities(0, hidden.row(0), visible.row_mut(0));
        sample_bernoulli(&mut visible, rng);

        self.state.propagate(visible.row(0));
        Ok(GeneratedStep {
            hidden: hidden.row(0).to_vec(),
            visible: visible.row(0).to_vec(),
        })
    }
}

/// Deterministic layer-1 hidden activation sigmoid(v·W1 + bh1), one row per time step.
pub fn hidden_activations(params: &Parameters, v: &Matrix) -> Matrix {
    let mut h = Matrix::zeros(v.rows(), params.n_hidden());
    let bh1 = params.bias(ParamName::Bh1);
    for t in 0..v.rows() {
        let out = h.row_mut(t);
        params[ParamName::W1].left_multiply(v.row(t), out);
        for (o, b) in out.iter_mut().zip(bh1.iter()) {
            *o = sigmoid(*o + b);
        }
    }
    h
}
