//! Difficulty calibration.
//!
//! Times a fixed number of solves at a known trial difficulty, then scales
//! the trial target: expected solve time is inversely proportional to the
//! target, so either a desired difficulty or a desired average time can be
//! solved for from one measurement.

use std::fmt;
use std::sync::atomic::AtomicBool;
use std::time::Instant;

use bitcoin::block::{Header, Version};
use bitcoin::hashes::Hash;
use bitcoin::{BlockHash, CompactTarget, TxMerkleNode};
use tracing::{debug, info};

use signet_core::constants::{
    CALIBRATION_TRIAL_BITS, CALIBRATION_TRIALS, DEFAULT_CALIBRATION_SECONDS,
};
use signet_core::difficulty::{
    nbits_to_target, target_from_f64, target_to_f64, target_to_nbits_checked,
};

use crate::error::{GrindError, MinerError};
use crate::finalize::ProofOfWorkSolver;

/// What the caller wants calibrated.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CalibrationGoal {
    /// Report the average solve time at this compact target.
    Nbits(u32),
    /// Find the compact target giving this average solve time.
    Seconds(f64),
}

impl Default for CalibrationGoal {
    fn default() -> Self {
        Self::Seconds(DEFAULT_CALIBRATION_SECONDS)
    }
}

/// A compact target and its expected average solve time.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Calibration {
    pub nbits: u32,
    pub seconds: f64,
}

impl fmt::Display for Calibration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "nbits={:08x} for {}s average mining time",
            self.nbits,
            self.seconds.trunc() as i64
        )
    }
}

/// Header solved during trial `i`: all-zero except time `i` and the trial bits.
pub fn trial_header(i: u32) -> Header {
    Header {
        version: Version::from_consensus(0),
        prev_blockhash: BlockHash::all_zeros(),
        merkle_root: TxMerkleNode::all_zeros(),
        time: i,
        bits: CompactTarget::from_consensus(CALIBRATION_TRIAL_BITS),
        nonce: 0,
    }
}

/// Average wall-clock seconds per solve over `trials` trial headers.
pub fn measure_average(solver: &dyn ProofOfWorkSolver, trials: u32) -> Result<f64, GrindError> {
    measure_average_while(solver, trials, &AtomicBool::new(true))
}

/// [`measure_average`], stopping with [`GrindError::Cancelled`] once
/// `running` is cleared.
pub fn measure_average_while(
    solver: &dyn ProofOfWorkSolver,
    trials: u32,
    running: &AtomicBool,
) -> Result<f64, GrindError> {
    let trials = trials.max(1);
    let start = Instant::now();
    for i in 0..trials {
        solver.solve_while(&trial_header(i), running)?;
    }
    let avg = start.elapsed().as_secs_f64() / f64::from(trials);
    debug!(trials, avg, "measured solve time");
    Ok(avg)
}

/// Derive a calibration from a measured average solve time at the trial
/// difficulty.
pub fn calibrate_from_average(avg: f64, goal: CalibrationGoal) -> Result<Calibration, MinerError> {
    let trial_target = nbits_to_target(CALIBRATION_TRIAL_BITS)
        .map_err(|e| MinerError::Config(e.to_string()))?;
    let trial = target_to_f64(trial_target);

    match goal {
        CalibrationGoal::Nbits(nbits) => {
            let want = nbits_to_target(nbits).map_err(|e| MinerError::Config(e.to_string()))?;
            if want.is_zero() {
                return Err(MinerError::Config(format!("nbits {nbits:08x} is a zero target")));
            }
            Ok(Calibration {
                nbits,
                seconds: avg * trial / target_to_f64(want),
            })
        }
        CalibrationGoal::Seconds(seconds) => {
            if seconds.is_nan() || seconds <= 0.0 {
                return Err(MinerError::Config("calibration time must be positive".into()));
            }
            let want = target_from_f64(trial * (avg / seconds));
            let nbits = target_to_nbits_checked(want).map_err(|e| {
                MinerError::Config(format!("no compact target gives {seconds}s: {e}"))
            })?;
            Ok(Calibration { nbits, seconds })
        }
    }
}

/// Measure `solver` over the standard trial count and calibrate for `goal`.
pub fn calibrate(solver: &dyn ProofOfWorkSolver, goal: CalibrationGoal) -> Result<Calibration, MinerError> {
    info!(trials = CALIBRATION_TRIALS, bits = %format!("{CALIBRATION_TRIAL_BITS:08x}"), "calibrating");
    let avg = measure_average(solver, CALIBRATION_TRIALS)?;
    calibrate_from_average(avg, goal)
}
