#![doc = include_str!("../README.md")]

mod clock;
mod prediction;

pub use clock::ServerClock;
pub use prediction::{Misprediction, Predictor};
