#![allow(clippy::needless_range_loop)]

#[cfg(test)]
#[macro_use]
extern crate quickcheck;

pub mod config;
pub mod error;
pub mod generation;
pub mod matrix;
pub mod model;
pub mod numeric;
pub mod params;
pub mod piano_roll;
pub mod rbm;
pub mod recurrence;
pub mod rnn;
pub mod stop_condition;
pub mod training;

pub use crate::config::*;
pub use crate::error::{Result, RnnDbnError};
pub use crate::generation::*;
pub use crate::matrix::Matrix;
pub use crate::model::*;
pub use crate::params::{Gradients, ParamName, Parameters};
pub use crate::stop_condition::*;
pub use crate::training::*;
