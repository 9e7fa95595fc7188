use crate::error::{configuration_error, RnnDbnError, Result};
use crate::matrix::Matrix;
use crate::model::{Layer, RnnDbn};
use crate::stop_condition::series_is_trending_up;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Schedule {
    /// Every epoch of the first layer, then every epoch of the second.
    Sequential,
    /// Both layers updated together from each minibatch.
    Joint,
}

#[derive(Clone, Debug, Copy, PartialEq, Serialize, Deserialize)]
pub struct TrainingConfiguration {
    pub(crate) batch_size: usize,
    pub(crate) num_epochs: usize,
    pub(crate) schedule: Schedule,
    pub(crate) plateau_window: Option<usize>,
    pub(crate) plateau_threshold: f64,
}

impl TrainingConfiguration {
    pub fn new() -> Self {
        TrainingConfiguration {
            batch_size: 100,
            num_epochs: 200,
            schedule: Schedule::Sequential,
            plateau_window: None,
            plateau_threshold: 0.5,
        }
    }

    pub fn batch_size(self, batch_size: usize) -> Self {
        Self { batch_size, ..self }
    }

    pub fn num_epochs(self, num_epochs: usize) -> Self {
        Self { num_epochs, ..self }
    }

    pub fn schedule(self, schedule: Schedule) -> Self {
        Self { schedule, ..self }
    }

    /// Stop a phase early once the probability that the last `plateau_window` epoch monitors
    /// are trending up drops to `plateau_threshold` or below.
    pub fn plateau_window(self, plateau_window: usize) -> Self {
        Self {
            plateau_window: Some(plateau_window),
            ..self
        }
    }

    pub fn plateau_threshold(self, plateau_threshold: f64) -> Self {
        Self {
            plateau_threshold,
            ..self
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return configuration_error("batch size must be positive");
        }
        if let Some(window) = self.plateau_window {
            if window < 3 {
                return configuration_error(format!(
                    "plateau window {} is too short, need at least 3 epochs",
                    window
                ));
            }
        }
        if !(0.0..=1.0).contains(&self.plateau_threshold) {
            return configuration_error(format!(
                "plateau threshold {} is not a probability",
                self.plateau_threshold
            ));
        }
        Ok(())
    }
}

impl Default for TrainingConfiguration {
    fn default() -> Self {
        Self::new()
    }
}

/// Cooperative cancellation for a training run. Clones share the same flag, so one can be
/// handed to a signal handler while training holds another.
#[derive(Clone, Debug, Default)]
pub struct Interrupt {
    flag: Arc<AtomicBool>,
}

impl Interrupt {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_requested(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Returns whether an interrupt was pending and clears it.
    pub fn take(&self) -> bool {
        self.flag.swap(false, Ordering::SeqCst)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Phase {
    Layer(Layer),
    Joint,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Phase::Layer(layer) => write!(f, "{}", layer),
            Phase::Joint => write!(f, "joint"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EpochReport {
    pub phase: Phase,
    pub epoch: usize,
    /// Mean monitor over the minibatches that were applied. For the joint phase this is the
    /// first layer's monitor. NaN if every minibatch was skipped.
    pub mean_monitor: f64,
    /// Second layer's mean monitor, joint phase only.
    pub mean_second_monitor: Option<f64>,
    pub minibatches: usize,
    /// Minibatches whose update was dropped because of non-finite values.
    pub skipped: usize,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TrainingReport {
    pub epochs: Vec<EpochReport>,
    pub interrupted_phases: Vec<Phase>,
    pub plateaued_phases: Vec<Phase>,
}

impl TrainingReport {
    pub fn last_epoch(&self, phase: Phase) -> Option<&EpochReport> {
        self.epochs.iter().rev().find(|e| e.phase == phase)
    }
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return std::f64::NAN;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

fn check_dataset(model: &RnnDbn, dataset: &[Matrix]) -> Result<()> {
    if dataset.iter().all(|sequence| sequence.rows() == 0) {
        return configuration_error("dataset has no time steps to train on");
    }
    for (idx, sequence) in dataset.iter().enumerate() {
        if sequence.cols() != model.n_visible() {
            return configuration_error(format!(
                "sequence {} has {} pitches per time step, model has {} visible units",
                idx,
                sequence.cols(),
                model.n_visible()
            ));
        }
    }
    Ok(())
}

enum PhaseEnd {
    Completed,
    Interrupted,
    Plateaued,
}

fn run_phase(
    model: &mut RnnDbn,
    dataset: &[Matrix],
    config: &TrainingConfiguration,
    interrupt: &Interrupt,
    phase: Phase,
    report: &mut TrainingReport,
) -> Result<PhaseEnd> {
    let mut order: Vec<usize> = (0..dataset.len()).collect();
    let mut history: Vec<f64> = vec![];

    for epoch in 0..config.num_epochs {
        order.shuffle(model.rng_mut());

        let mut monitors: Vec<f64> = vec![];
        let mut second_monitors: Vec<f64> = vec![];
        let mut minibatches = 0;
        let mut skipped = 0;

        for idx in order.iter() {
            let sequence = &dataset[*idx];
            let mut start = 0;
            while start < sequence.rows() {
                if interrupt.take() {
                    warn!("Interrupted during {} epoch {}.", phase, epoch);
                    return Ok(PhaseEnd::Interrupted);
                }
                let batch = sequence.slice_rows(start, start + config.batch_size);
                start += config.batch_size;
                minibatches += 1;

                let outcome = match phase {
                    Phase::Layer(layer) => model.train_step(layer, &batch).map(|m| (m, None)),
                    Phase::Joint => model
                        .joint_step(&batch)
                        .map(|m| (m.first, Some(m.second))),
                };
                match outcome {
                    Ok((monitor, second)) => {
                        debug!(
                            "{} epoch {} sequence {} rows {}: monitor {}",
                            phase,
                            epoch,
                            idx,
                            batch.rows(),
                            monitor
                        );
                        monitors.push(monitor);
                        if let Some(second) = second {
                            second_monitors.push(second);
                        }
                    }
                    Err(RnnDbnError::NumericInstability { what, value }) => {
                        warn!(
                            "Skipping minibatch of sequence {} in {} epoch {}: {} is {}",
                            idx, phase, epoch, what, value
                        );
                        skipped += 1;
                    }
                    Err(e) => return Err(e),
                }
            }
        }

        let epoch_report = EpochReport {
            phase,
            epoch,
            mean_monitor: mean(&monitors),
            mean_second_monitor: match phase {
                Phase::Joint => Some(mean(&second_monitors)),
                Phase::Layer(_) => None,
            },
            minibatches,
            skipped,
        };
        match epoch_report.mean_second_monitor {
            Some(second) => info!(
                "{} epoch {}: monitors {} {}",
                phase, epoch, epoch_report.mean_monitor, second
            ),
            None => info!("{} epoch {}: monitor {}", phase, epoch, epoch_report.mean_monitor),
        }
        if skipped > 0 {
            warn!(
                "{} epoch {}: skipped {} of {} minibatches",
                phase, epoch, skipped, minibatches
            );
        }
        if epoch_report.mean_monitor.is_finite() {
            history.push(epoch_report.mean_monitor);
        }
        report.epochs.push(epoch_report);

        if let Some(window) = config.plateau_window {
            if history.len() >= window {
                let p = series_is_trending_up(&history[history.len() - window..]);
                if p <= config.plateau_threshold {
                    info!(
                        "{} plateaued after epoch {} (P(improving) = {})",
                        phase, epoch, p
                    );
                    return Ok(PhaseEnd::Plateaued);
                }
            }
        }
    }
    Ok(PhaseEnd::Completed)
}

/// Trains the model on a set of piano-roll sequences.
///
/// An interrupt stops the phase that is running and training continues with the next one, so a
/// second interrupt is needed to skip the second layer. Parameters are never left half updated.
pub fn train(
    model: &mut RnnDbn,
    dataset: &[Matrix],
    config: &TrainingConfiguration,
    interrupt: &Interrupt,
) -> Result<TrainingReport> {
    config.validate()?;
    check_dataset(model, dataset)?;

    let phases = match config.schedule {
        Schedule::Sequential => vec![Phase::Layer(Layer::First), Phase::Layer(Layer::Second)],
        Schedule::Joint => vec![Phase::Joint],
    };

    info!(
        "Training {} parameters on {} sequences ({} time steps).",
        model.params().num_parameters(),
        dataset.len(),
        dataset.iter().map(|s| s.rows()).sum::<usize>()
    );
    let mut report = TrainingReport::default();
    for phase in phases.iter() {
        info!("Training {}.", phase);
        match run_phase(model, dataset, config, interrupt, *phase, &mut report)? {
            PhaseEnd::Completed => {}
            PhaseEnd::Interrupted => report.interrupted_phases.push(*phase),
            PhaseEnd::Plateaued => report.plateaued_phases.push(*phase),
        }
    }
    Ok(report)
}

impl RnnDbn {
    /// Sequential training with default settings and no way to interrupt it.
    pub fn train(
        &mut self,
        dataset: &[Matrix],
        batch_size: usize,
        num_epochs: usize,
    ) -> Result<TrainingReport> {
        let config = TrainingConfiguration::new()
            .batch_size(batch_size)
            .num_epochs(num_epochs);
        train(self, dataset, &config, &Interrupt::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ModelConfiguration;
    use crate::params::{ParamName, JOINT_PARAMS};
    use crate::rbm::sample_bernoulli;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn small_model() -> RnnDbn {
        RnnDbn::new(
            ModelConfiguration::new()
                .pitch_range(60, 68)
                .n_hidden(6)
                .n_hidden_recurrent(5)
                .training_gibbs_steps(2)
                .seed(3),
        )
        .unwrap()
    }

    fn dataset() -> Vec<Matrix> {
        let mut rng = StdRng::seed_from_u64(5);
        [7, 12, 3]
            .iter()
            .map(|steps| {
                let mut roll = Matrix::replicate(0.25, *steps, 8);
                sample_bernoulli(&mut roll, &mut rng);
                roll
            })
            .collect()
    }

    #[test]
    fn single_epoch_on_silence() {
        let mut model = RnnDbn::new(ModelConfiguration::default()).unwrap();
        let before = model.params().clone();
        let report = model.train(&[Matrix::zeros(10, 88)], 10, 1).unwrap();
        assert_eq!(report.epochs.len(), 2);
        for epoch in report.epochs.iter() {
            assert!(epoch.mean_monitor.is_finite());
            assert_eq!(epoch.minibatches, 1);
            assert_eq!(epoch.skipped, 0);
        }
        assert_ne!(&before, model.params());
    }

    #[test]
    fn sequential_schedule_trains_layers_in_order() {
        let mut model = small_model();
        let config = TrainingConfiguration::new().batch_size(5).num_epochs(3);
        let report = train(&mut model, &dataset(), &config, &Interrupt::new()).unwrap();
        let phases: Vec<Phase> = report.epochs.iter().map(|e| e.phase).collect();
        assert_eq!(
            phases,
            vec![
                Phase::Layer(Layer::First),
                Phase::Layer(Layer::First),
                Phase::Layer(Layer::First),
                Phase::Layer(Layer::Second),
                Phase::Layer(Layer::Second),
                Phase::Layer(Layer::Second),
            ]
        );
        // 7 -> 2, 12 -> 3, 3 -> 1
        assert!(report.epochs.iter().all(|e| e.minibatches == 6));
        assert!(report.interrupted_phases.is_empty());
    }

    #[test]
    fn joint_schedule_reports_both_monitors() {
        let mut model = small_model();
        let config = TrainingConfiguration::new()
            .batch_size(4)
            .num_epochs(2)
            .schedule(Schedule::Joint);
        let report = train(&mut model, &dataset(), &config, &Interrupt::new()).unwrap();
        assert_eq!(report.epochs.len(), 2);
        for epoch in report.epochs.iter() {
            assert_eq!(epoch.phase, Phase::Joint);
            assert!(epoch.mean_monitor.is_finite());
            assert!(epoch.mean_second_monitor.unwrap().is_finite());
        }
    }

    #[test]
    fn interrupt_falls_through_to_next_phase() {
        let mut model = small_model();
        let before = model.params().clone();
        let interrupt = Interrupt::new();
        interrupt.request();
        let config = TrainingConfiguration::new().batch_size(5).num_epochs(2);
        let report = train(&mut model, &dataset(), &config, &interrupt).unwrap();
        assert_eq!(report.interrupted_phases, vec![Phase::Layer(Layer::First)]);
        assert!(!interrupt.is_requested());
        assert_eq!(report.epochs.len(), 2);
        assert!(report
            .epochs
            .iter()
            .all(|e| e.phase == Phase::Layer(Layer::Second)));
        // the first layer never took a step
        assert_eq!(before[ParamName::Wuu], model.params()[ParamName::Wuu]);
        assert!(model.params().check_finite(JOINT_PARAMS).is_ok());
    }

    #[test]
    fn mismatched_dataset_is_rejected_before_training() {
        let mut model = small_model();
        let before = model.params().clone();
        let mut data = dataset();
        data.push(Matrix::zeros(4, 9));
        let result = train(
            &mut model,
            &data,
            &TrainingConfiguration::new(),
            &Interrupt::new(),
        );
        match result {
            Err(RnnDbnError::Configuration(_)) => {}
            other => panic!("expected configuration error, got {:?}", other),
        }
        assert_eq!(&before, model.params());
    }

    #[test]
    fn empty_dataset_is_rejected() {
        let mut model = small_model();
        assert!(model.train(&[], 5, 1).is_err());
        match model.train(&[Matrix::zeros(0, 8)], 5, 1) {
            Err(RnnDbnError::Configuration(_)) => {}
            other => panic!("expected configuration error, got {:?}", other),
        }
    }

    #[test]
    fn overflowing_minibatches_are_skipped() {
        // Weights this large overflow the free energy to -inf, so every CD cost is NaN.
        let mut snapshot = small_model().snapshot();
        snapshot.params[ParamName::W1].map_inplace(|_| 1e308);
        snapshot.params[ParamName::W2].map_inplace(|_| 1e308);
        let mut model = RnnDbn::from_snapshot(snapshot).unwrap();
        let before = model.params().clone();

        let data = vec![Matrix::replicate(1.0, 6, model.n_visible())];
        let config = TrainingConfiguration::new().batch_size(3).num_epochs(2);
        let report = train(&mut model, &data, &config, &Interrupt::new()).unwrap();

        assert_eq!(report.epochs.len(), 4);
        for epoch in report.epochs.iter() {
            assert_eq!(epoch.minibatches, 2);
            assert_eq!(epoch.skipped, 2);
            assert!(epoch.mean_monitor.is_nan());
        }
        assert_eq!(&before, model.params());
    }

    #[test]
    fn zero_batch_size_is_rejected() {
        let mut model = small_model();
        assert!(model.train(&dataset(), 0, 1).is_err());
    }

    #[test]
    fn plateau_stops_each_phase_early() {
        let mut model = small_model();
        // every probability is <= 1.0, so the phase stops as soon as the window fills
        let config = TrainingConfiguration::new()
            .batch_size(5)
            .num_epochs(10)
            .plateau_window(3)
            .plateau_threshold(1.0);
        let report = train(&mut model, &dataset(), &config, &Interrupt::new()).unwrap();
        assert_eq!(report.epochs.len(), 6);
        assert_eq!(
            report.plateaued_phases,
            vec![Phase::Layer(Layer::First), Phase::Layer(Layer::Second)]
        );
    }

    #[test]
    fn interrupt_clones_share_the_flag() {
        let a = Interrupt::new();
        let b = a.clone();
        b.request();
        assert!(a.is_requested());
        assert!(a.take());
        assert!(!b.is_requested());
        assert!(!a.take());
    }
}
