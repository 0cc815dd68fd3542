//! Strategy evaluation: moving-average crossover over buffer snapshots.

pub mod crossover;

pub use crossover::{CrossoverStrategy, Evaluation};
