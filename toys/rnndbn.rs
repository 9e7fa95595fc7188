use clap::{Parser, Subcommand, ValueEnum};
use mj_rnndbn::generation::{generate_to_midi, numbered_paths};
use mj_rnndbn::piano_roll::load_midi_dir;
use mj_rnndbn::{train, Interrupt, ModelConfiguration, RnnDbn, Schedule, TrainingConfiguration};
use std::error::Error;
use std::path::PathBuf;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "rnndbn")]
#[command(about = "Train an RNN-DBN on MIDI files and sample new piano-rolls from it")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Train a new model on a directory of MIDI files
    Train {
        /// Directory with .mid files
        #[arg(short, long)]
        data: PathBuf,

        /// Where to write the trained model (JSON)
        #[arg(short, long, default_value = "model.json")]
        out: PathBuf,

        #[arg(long, default_value_t = 200)]
        epochs: usize,

        /// Minibatch length in time steps
        #[arg(long, default_value_t = 100)]
        batch_size: usize,

        #[arg(long, value_enum, default_value_t = ScheduleArg::Sequential)]
        schedule: ScheduleArg,

        #[arg(long, default_value_t = 150)]
        hidden: usize,

        #[arg(long, default_value_t = 100)]
        recurrent: usize,

        #[arg(long, default_value_t = 0.001)]
        lr: f64,

        /// Stop a layer early when the last N epoch monitors stop improving
        #[arg(long)]
        plateau_window: Option<usize>,

        #[arg(long, default_value_t = 0xbeef)]
        seed: u64,
    },
    /// Sample piano-rolls from a trained model and write them as MIDI
    Generate {
        #[arg(short, long, default_value = "model.json")]
        model: PathBuf,

        #[arg(short, long, default_value = "sample.mid")]
        out: PathBuf,

        #[arg(long, default_value_t = 1)]
        count: usize,

        /// Seed for sampling; defaults to the seed stored with the model
        #[arg(long)]
        seed: Option<u64>,
    },
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum ScheduleArg {
    Sequential,
    Joint,
}

impl From<ScheduleArg> for Schedule {
    fn from(arg: ScheduleArg) -> Self {
        match arg {
            ScheduleArg::Sequential => Schedule::Sequential,
            ScheduleArg::Joint => Schedule::Joint,
        }
    }
}

pub fn main() -> Result<(), Box<dyn Error>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let args = Args::parse();
    match args.command {
        Command::Train {
            data,
            out,
            epochs,
            batch_size,
            schedule,
            hidden,
            recurrent,
            lr,
            plateau_window,
            seed,
        } => {
            let config = ModelConfiguration::new()
                .n_hidden(hidden)
                .n_hidden_recurrent(recurrent)
                .learning_rate(lr)
                .seed(seed);
            let mut model = RnnDbn::new(config)?;
            let dataset = load_midi_dir(&data, config.pitch_range, config.dt)?;
            if dataset.is_empty() {
                return Err(format!("no usable MIDI files in {}", data.display()).into());
            }

            let interrupt = Interrupt::new();
            let handler = interrupt.clone();
            ctrlc::set_handler(move || handler.request())?;

            let mut training = TrainingConfiguration::new()
                .batch_size(batch_size)
                .num_epochs(epochs)
                .schedule(schedule.into());
            if let Some(window) = plateau_window {
                training = training.plateau_window(window);
            }
            let report = train(&mut model, &dataset, &training, &interrupt)?;
            for phase in report.interrupted_phases.iter() {
                warn!("{} was interrupted", phase);
            }
            model.save(&out)?;
            info!("Saved model to {}", out.display());
        }
        Command::Generate {
            model,
            out,
            count,
            seed,
        } => {
            let mut rnndbn = RnnDbn::load(&model)?;
            if let Some(seed) = seed {
                rnndbn.reseed(seed);
            }
            let paths = numbered_paths(&out, count);
            generate_to_midi(&mut rnndbn, &paths)?;
        }
    }
    Ok(())
}
