//! # Datastream CLI
//!
//! Support code for the `datastream` binary: command-line flags, the
//! sequencer entry types and a demo producer that commits one block per
//! atomic unit.

pub mod config;
pub mod producer;
pub mod sequencer;

pub use producer::{BlockOutcome, Producer, ProducerConfig, ProducerStats};
