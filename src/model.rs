use crate::config::ModelConfiguration;
use crate::error::{configuration_error, Result};
use crate::matrix::Matrix;
use crate::numeric::sigmoid_derivative_from_output;
use crate::params::{Gradients, ParamName, Parameters, JOINT_PARAMS, LAYER1_PARAMS, LAYER2_PARAMS};
use crate::rbm::{Bias, Rbm};
use crate::recurrence::{
    forced_recurrence_layer1, forced_recurrence_layer2, hidden_activations, GenerativeRecurrence,
    Layer1Trace, Layer2Trace,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;

/// The two trainable layers of the stack.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Layer {
    /// visible <-> hidden1, conditioned on the recurrent state
    First,
    /// hidden1 <-> hidden2
    Second,
}

impl Layer {
    pub fn view(self) -> &'static [ParamName] {
        match self {
            Layer::First => LAYER1_PARAMS,
            Layer::Second => LAYER2_PARAMS,
        }
    }
}

impl fmt::Display for Layer {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Layer::First => write!(f, "layer 1"),
            Layer::Second => write!(f, "layer 2"),
        }
    }
}

/// Cost, monitor and gradients of one layer for one minibatch.
#[derive(Clone, Debug)]
pub struct LayerObjective {
    pub cost: f64,
    pub monitor: f64,
    /// Only the entries of the layer's view are filled in.
    pub gradients: Gradients,
}

/// Monitors reported by a joint update.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct JointMonitors {
    pub first: f64,
    pub second: f64,
}

fn first_layer_rbm<'a>(params: &'a Parameters, trace: &'a Layer1Trace) -> Rbm<'a> {
    Rbm::new(
        &params[ParamName::W1],
        Bias::PerStep(&trace.visible_bias),
        Bias::PerStep(&trace.hidden_bias),
    )
}

fn second_layer_rbm<'a>(params: &'a Parameters, trace: &'a Layer2Trace) -> Rbm<'a> {
    Rbm::new(
        &params[ParamName::W2],
        Bias::PerStep(&trace.visible_bias),
        Bias::PerStep(&trace.hidden_bias),
    )
}

/// Gradients of the first layer's cost for a fixed negative sample.
fn first_layer_gradients(
    params: &Parameters,
    trace: &Layer1Trace,
    v: &Matrix,
    sample: &Matrix,
) -> Gradients {
    let grad = first_layer_rbm(params, trace).cost_gradient(v, sample);
    let mut gradients = params.zero_like();
    gradients[ParamName::W1] = grad.weights;
    trace.backpropagate(
        params,
        v,
        &grad.visible_bias,
        &grad.hidden_bias,
        &mut gradients,
    );
    gradients
}

/// Gradients of the second layer's cost for a fixed negative sample.
///
/// h depends on bh1, which is also in this layer's view, so the gradient of bh1 has a second
/// path through the data rows of the RBM. W1 is not in the view and is treated as a constant.
fn second_layer_gradients(
    params: &Parameters,
    trace: &Layer2Trace,
    h: &Matrix,
    sample: &Matrix,
) -> Gradients {
    let grad = second_layer_rbm(params, trace).cost_gradient(h, sample);
    let mut gradients = params.zero_like();
    gradients[ParamName::W2] = grad.weights;
    trace.backpropagate(&grad.visible_bias, &grad.hidden_bias, &mut gradients);
    let dbh1 = gradients[ParamName::Bh1].row_mut(0);
    for t in 0..h.rows() {
        for ((d, dh), hv) in dbh1
            .iter_mut()
            .zip(grad.input.row(t).iter())
            .zip(h.row(t).iter())
        {
            *d += dh * sigmoid_derivative_from_output(*hv);
        }
    }
    gradients
}

/// First layer: an RBM over v with biases bv_t, bh1_t from the recurrence.
pub fn layer1_objective<R: Rng>(
    params: &Parameters,
    config: &ModelConfiguration,
    v: &Matrix,
    rng: &mut R,
) -> Result<LayerObjective> {
    let trace = forced_recurrence_layer1(params, v)?;
    let cd = first_layer_rbm(params, &trace).contrastive_divergence(
        v,
        config.training_gibbs_steps,
        rng,
    )?;
    Ok(LayerObjective {
        cost: cd.cost,
        monitor: cd.monitor,
        gradients: first_layer_gradients(params, &trace, v, &cd.sample),
    })
}

/// Second layer: an RBM over h = sigmoid(v·W1 + bh1) with biases bh1_t, bh2_t.
pub fn layer2_objective<R: Rng>(
    params: &Parameters,
    config: &ModelConfiguration,
    v: &Matrix,
    rng: &mut R,
) -> Result<LayerObjective> {
    let h = hidden_activations(params, v);
    let trace = forced_recurrence_layer2(params, v, &h)?;
    let cd = second_layer_rbm(params, &trace).contrastive_divergence(
        &h,
        config.training_gibbs_steps,
        rng,
    )?;
    Ok(LayerObjective {
        cost: cd.cost,
        monitor: cd.monitor,
        gradients: second_layer_gradients(params, &trace, &h, &cd.sample),
    })
}

/// Samples `horizon` time steps of piano-roll. Parameters are not touched.
pub fn generate_roll<R: Rng>(
    params: &Parameters,
    config: &ModelConfiguration,
    horizon: usize,
    rng: &mut R,
) -> Result<Matrix> {
    let mut recurrence = GenerativeRecurrence::new(params, config.generation_gibbs_steps)?;
    let mut roll = Matrix::zeros(horizon, params.n_visible());
    for t in 0..horizon {
        let step = recurrence.step(rng)?;
        roll.row_mut(t).copy_from_slice(&step.visible);
    }
    Ok(roll)
}

/// Serializable state of a model: hyperparameters and every parameter tensor.
///
/// The random number generator is not part of it; a loaded model is reseeded.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ModelSnapshot {
    pub config: ModelConfiguration,
    pub params: Parameters,
}

impl ModelSnapshot {
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let snapshot: ModelSnapshot = serde_json::from_str(json)?;
        snapshot.check()?;
        Ok(snapshot)
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let writer = BufWriter::new(File::create(path)?);
        serde_json::to_writer(writer, self)?;
        Ok(())
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let reader = BufReader::new(File::open(path)?);
        let snapshot: ModelSnapshot = serde_json::from_reader(reader)?;
        snapshot.check()?;
        Ok(snapshot)
    }

    fn check(&self) -> Result<()> {
        self.config.validate()?;
        self.params.check_shapes(&self.config)?;
        if self.params.check_finite(JOINT_PARAMS).is_err() {
            return configuration_error("snapshot contains non-finite parameters");
        }
        Ok(())
    }
}

/// Two-layer RNN-DBN: an RNN-RBM over piano-roll frames with a second RBM stacked on top of
/// its hidden layer.
#[derive(Clone, Debug)]
pub struct RnnDbn {
    config: ModelConfiguration,
    params: Parameters,
    rng: StdRng,
}

impl RnnDbn {
    /// Builds a fresh model. The same configuration (seed included) always gives the same
    /// initial parameters.
    pub fn new(config: ModelConfiguration) -> Result<Self> {
        config.validate()?;
        let mut rng = StdRng::seed_from_u64(config.seed);
        let params = Parameters::initialize(&config, &mut rng)?;
        Ok(RnnDbn {
            config,
            params,
            rng,
        })
    }

    pub fn from_snapshot(snapshot: ModelSnapshot) -> Result<Self> {
        snapshot.check()?;
        Ok(RnnDbn {
            rng: StdRng::seed_from_u64(snapshot.config.seed),
            config: snapshot.config,
            params: snapshot.params,
        })
    }

    pub fn snapshot(&self) -> ModelSnapshot {
        ModelSnapshot {
            config: self.config,
            params: self.params.clone(),
        }
    }

    pub fn to_json(&self) -> Result<String> {
        self.snapshot().to_json()
    }

    pub fn from_json(json: &str) -> Result<Self> {
        Self::from_snapshot(ModelSnapshot::from_json(json)?)
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        self.snapshot().save(path)
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::from_snapshot(ModelSnapshot::load(path)?)
    }

    pub fn config(&self) -> &ModelConfiguration {
        &self.config
    }

    pub fn params(&self) -> &Parameters {
        &self.params
    }

    pub fn n_visible(&self) -> usize {
        self.config.n_visible()
    }

    pub fn reseed(&mut self, seed: u64) {
        self.rng = StdRng::seed_from_u64(seed);
    }

    pub(crate) fn rng_mut(&mut self) -> &mut StdRng {
        &mut self.rng
    }

    /// Checks a sequence can be fed to the model.
    pub fn check_sequence(&self, sequence: &Matrix) -> Result<()> {
        if sequence.cols() != self.n_visible() {
            return configuration_error(format!(
                "sequence has {} pitches per time step, model has {} visible units",
                sequence.cols(),
                self.n_visible()
            ));
        }
        if sequence.rows() == 0 {
            return configuration_error("sequence has no time steps");
        }
        Ok(())
    }

    pub fn objective(&mut self, layer: Layer, v: &Matrix) -> Result<LayerObjective> {
        self.check_sequence(v)?;
        match layer {
            Layer::First => layer1_objective(&self.params, &self.config, v, &mut self.rng),
            Layer::Second => layer2_objective(&self.params, &self.config, v, &mut self.rng),
        }
    }

    /// One SGD update of the given layer on a minibatch. Returns the monitor.
    ///
    /// If anything in the gradient is not finite, nothing is updated and the error is
    /// NumericInstability.
    pub fn train_step(&mut self, layer: Layer, v: &Matrix) -> Result<f64> {
        let objective = self.objective(layer, v)?;
        self.params
            .apply_sgd(&objective.gradients, layer.view(), self.config.learning_rate)?;
        Ok(objective.monitor)
    }

    /// Updates both layers from the same minibatch in one step. Both gradients are computed
    /// from the parameters as they were before the step; bh1 and Wuh1 receive the sum.
    pub fn joint_step(&mut self, v: &Matrix) -> Result<JointMonitors> {
        let first = self.objective(Layer::First, v)?;
        let second = self.objective(Layer::Second, v)?;
        let mut gradients = first.gradients;
        gradients.accumulate(&second.gradients, LAYER2_PARAMS);
        self.params
            .apply_sgd(&gradients, JOINT_PARAMS, self.config.learning_rate)?;
        Ok(JointMonitors {
            first: first.monitor,
            second: second.monitor,
        })
    }

    /// Samples a piano-roll of `generation_horizon` time steps.
    pub fn generate(&mut self) -> Result<Matrix> {
        generate_roll(
            &self.params,
            &self.config,
            self.config.generation_horizon,
            &mut self.rng,
        )
    }
}
