//! Optional network simulator for deterministic testing.
//!
//! Real networks drop, reorder, duplicate and corrupt datagrams.  To exercise
//! the reliability mechanisms without depending on actual network conditions,
//! the channel's send thread can run every outbound datagram through a
//! [`Simulator`] that applies a configurable fault model:
//!
//! | Fault            | Description                                      |
//! |------------------|--------------------------------------------------|
//! | Packet loss      | Drop a datagram with probability `loss_rate`.    |
//! | Reordering       | Hold a datagram back for up to `reorder_delay`,  |
//! |                  | letting later datagrams overtake it.             |
//! | Duplication      | Transmit a datagram twice.                       |
//! | Corruption       | Flip one payload bit after the checksum is set,  |
//! |                  | so the receiver drops it.                        |
//!
//! Decisions come from a seeded [`StdRng`], so a given seed always produces
//! the same sequence of faults for the same sequence of datagrams.

use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Configuration for the fault-injection model.
///
/// All probabilities are in the range `[0.0, 1.0]`.
#[derive(Debug, Clone)]
pub struct SimulatorConfig {
    /// Probability that any given datagram is silently dropped.
    pub loss_rate: f64,
    /// Probability that a datagram is held back and reordered.
    pub reorder_rate: f64,
    /// Longest time a held-back datagram waits for a successor.
    pub reorder_delay: Duration,
    /// Probability that a datagram is sent twice.
    pub duplicate_rate: f64,
    /// Probability that a datagram has one bit flipped.
    pub corrupt_rate: f64,
    /// RNG seed.
    pub seed: u64,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        // No faults by default: the simulator is a transparent pass-through.
        Self {
            loss_rate: 0.0,
            reorder_rate: 0.0,
            reorder_delay: Duration::from_millis(20),
            duplicate_rate: 0.0,
            corrupt_rate: 0.0,
            seed: 0,
        }
    }
}

impl SimulatorConfig {
    /// A link that drops datagrams with probability `loss_rate`.
    pub fn lossy(loss_rate: f64, seed: u64) -> Self {
        Self {
            loss_rate,
            seed,
            ..Default::default()
        }
    }
}

/// What to do with one outbound datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fate {
    Deliver,
    Drop,
    Duplicate,
    /// Flip the bit at this index (taken modulo the datagram length in bits).
    Corrupt(usize),
    /// Hold the datagram until the next one has been sent.
    Reorder,
}

/// Fault-injection decision maker.
#[derive(Debug)]
pub struct Simulator {
    config: SimulatorConfig,
    rng: StdRng,
}

impl Simulator {
    pub fn new(config: SimulatorConfig) -> Self {
        let rng = StdRng::seed_from_u64(config.seed);
        Self { config, rng }
    }

    pub fn config(&self) -> &SimulatorConfig {
        &self.config
    }

    /// Decide the fate of the next datagram.  Loss is checked first, then
    /// corruption, duplication and reordering.
    pub fn decide(&mut self) -> Fate {
        let c = &self.config;
        if c.loss_rate > 0.0 && self.rng.gen_bool(c.loss_rate.min(1.0)) {
            Fate::Drop
        } else if c.corrupt_rate > 0.0 && self.rng.gen_bool(c.corrupt_rate.min(1.0)) {
            Fate::Corrupt(self.rng.gen())
        } else if c.duplicate_rate > 0.0 && self.rng.gen_bool(c.duplicate_rate.min(1.0)) {
            Fate::Duplicate
        } else if c.reorder_rate > 0.0 && self.rng.gen_bool(c.reorder_rate.min(1.0)) {
            Fate::Reorder
        } else {
            Fate::Deliver
        }
    }

    /// Flip one bit of `frame`, skipping the first `skip` bytes.
    pub fn corrupt(frame: &mut [u8], skip: usize, bit: usize) {
        let body = frame.len().saturating_sub(skip);
        if body == 0 {
            return;
        }
        let bit = bit % (body * 8);
        frame[skip + bit / 8] ^= 1 << (bit % 8);
    }
}
