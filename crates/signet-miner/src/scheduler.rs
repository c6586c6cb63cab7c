//! Block production scheduler.
//!
//! Pure functions of the chain tip decide when the next block is due and
//! whether this instance owns it. All randomness is drawn from the tip hash,
//! so every cooperating miner reaches the same decisions:
//!
//! - bytes `0..4` (little-endian) drive the Poisson interval jitter,
//! - bytes `4..8` pick the multi-miner bucket.
//!
//! Decisions are returned as [`SchedulerDecision`] values and threaded
//! through the control loop explicitly.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use bitcoin::hashes::Hash;
use bitcoin::BlockHash;
use tracing::{debug, error, info, warn};

use signet_core::constants::{
    GENESIS_BACKDATE_INTERVALS, MAX_FUTURE_BLOCK_SAFETY, MAX_RETARGET_FACTOR,
    MIN_RETARGET_FACTOR, RETARGET_CORRECTION,
};
use signet_core::difficulty::nbits_to_f64;
use signet_core::template::BlockTemplate;

use crate::config::SchedulerConfig;
use crate::error::MinerError;
use crate::util::seconds_to_hms;

/// Pause before re-polling after a stale template.
pub const RETRY_DELAY: Duration = Duration::from_secs(1);

/// Little-endian word at byte `offset` of the hash in serialization order.
pub fn hash_word(hash: &BlockHash, offset: usize) -> u32 {
    let bytes = hash.as_byte_array();
    u32::from_le_bytes([
        bytes[offset],
        bytes[offset + 1],
        bytes[offset + 2],
        bytes[offset + 3],
    ])
}

/// The node's best header, as seen by one poll.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainTip {
    pub height: u64,
    pub hash: BlockHash,
    pub bits: u32,
    pub time: u32,
}

impl ChainTip {
    pub fn is_genesis(&self) -> bool {
        self.height == 0
    }
}

/// Bucket range `[low, high)` modulo `period` owned by this instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MultiMinerPartition {
    low: u32,
    high: u32,
    period: u32,
}

impl Default for MultiMinerPartition {
    /// A single miner owning every block.
    fn default() -> Self {
        Self { low: 0, high: 1, period: 1 }
    }
}

impl MultiMinerPartition {
    pub fn new(low: u32, high: u32, period: u32) -> Result<Self, MinerError> {
        if period == 0 || low >= high || high > period {
            return Err(MinerError::Config(format!(
                "invalid partition [{low}, {high}) mod {period}"
            )));
        }
        Ok(Self { low, high, period })
    }

    pub fn low(&self) -> u32 {
        self.low
    }

    pub fn high(&self) -> u32 {
        self.high
    }

    pub fn period(&self) -> u32 {
        self.period
    }

    pub fn contains(&self, bucket: u32) -> bool {
        (self.low..self.high).contains(&(bucket % self.period))
    }

    /// Share of blocks owned, `(high - low) / period`.
    pub fn fraction(&self) -> f64 {
        f64::from(self.high - self.low) / f64::from(self.period)
    }
}

/// Parses `k/n` or `k-l/n`: 1-based, inclusive miner slots out of `n`.
impl FromStr for MultiMinerPartition {
    type Err = MinerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bad = || MinerError::Config(format!("multiminer must be k/n or k-l/n, got {s:?}"));
        let number = |part: &str| -> Result<u32, MinerError> {
            if part.is_empty() || !part.bytes().all(|b| b.is_ascii_digit()) {
                return Err(bad());
            }
            part.parse().map_err(|_| bad())
        };

        let (range, total) = s.split_once('/').ok_or_else(bad)?;
        let (start, stop) = match range.split_once('-') {
            Some((a, b)) => (number(a)?, number(b)?),
            None => {
                let k = number(range)?;
                (k, k)
            }
        };
        let total = number(total)?;

        if stop < start || start == 0 || total < stop || total == 0 {
            return Err(MinerError::Config(format!(
                "inconsistent multiminer argument {s:?}"
            )));
        }
        Self::new(start - 1, stop, total)
    }
}

impl fmt::Display for MultiMinerPartition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.high == self.low + 1 {
            write!(f, "{}/{}", self.high, self.period)
        } else {
            write!(f, "{}-{}/{}", self.low + 1, self.high, self.period)
        }
    }
}

/// Timing decision for the block after one tip.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerDecision {
    /// Timestamp the next block should carry.
    pub mine_time: i64,
    /// When this instance should start mining it.
    pub action_time: i64,
    /// Whether this instance owns the block, as opposed to backing up.
    pub is_mine: bool,
}

impl SchedulerDecision {
    /// How long the loop should sleep before acting, if at all.
    ///
    /// Sleeps are capped at 60s, and at 20s once `mine_time` has passed so a
    /// block found by someone else is noticed quickly.
    pub fn sleep_before_action(&self, now: f64) -> Option<Duration> {
        let action = self.action_time as f64;
        if action <= now {
            return None;
        }
        let mut secs = (action - now).min(60.0);
        if (self.mine_time as f64) < now {
            secs = secs.min(20.0);
        }
        Some(Duration::from_secs_f64(secs))
    }
}

/// Result of fetching a template for the current tip.
#[derive(Debug)]
pub enum PollOutcome {
    /// Template matches the tip; mine it with the (possibly adjusted) decision.
    Ready {
        template: Box<BlockTemplate>,
        decision: SchedulerDecision,
    },
    /// Benign condition; poll again after `after`.
    Retry { reason: MinerError, after: Duration },
    /// The loop cannot continue.
    Fatal(MinerError),
}

/// Deterministic block timing policy.
#[derive(Debug, Clone)]
pub struct Scheduler {
    config: SchedulerConfig,
    interval: f64,
    ultimate_target: f64,
}

impl Scheduler {
    pub fn new(config: SchedulerConfig) -> Result<Self, MinerError> {
        config.validate()?;
        Ok(Self {
            interval: config.target_spacing * RETARGET_CORRECTION,
            ultimate_target: nbits_to_f64(config.ultimate_bits),
            config,
        })
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Nominal spacing with the retarget correction applied.
    pub fn base_interval(&self) -> f64 {
        self.interval
    }

    /// How far the current difficulty is from the ultimate one, limited to a
    /// single retarget period's worth of adjustment.
    pub fn retarget_factor(&self, current_bits: u32) -> f64 {
        let factor = self.ultimate_target / nbits_to_f64(current_bits);
        if factor.is_nan() {
            return MAX_RETARGET_FACTOR;
        }
        factor.clamp(MIN_RETARGET_FACTOR, MAX_RETARGET_FACTOR)
    }

    /// Seconds from the tip to the next block, in `[1, max_interval]`.
    pub fn next_block_delta(&self, last_bits: u32, last_hash: &BlockHash) -> f64 {
        let avg_interval = self.interval * self.retarget_factor(last_bits);

        let variance = if self.config.poisson {
            let u = f64::from(hash_word(last_hash, 0)) * 2f64.powi(-32);
            -(-u).ln_1p()
        } else {
            1.0
        };

        (avg_interval * variance).clamp(1.0, self.config.max_interval)
    }

    pub fn next_block_is_mine(&self, last_hash: &BlockHash) -> bool {
        self.config.partition.contains(hash_word(last_hash, 4))
    }

    /// Decide when to produce the block on top of `tip`.
    pub fn next_block_time(&self, now: f64, tip: &ChainTip, is_first_attempt: bool) -> SchedulerDecision {
        let (mine_time, action_time, is_mine) = if let Some(t) = self.config.set_block_time {
            debug!(time = t, "using fixed block time");
            (t as f64, now, true)
        } else if tip.is_genesis() {
            let backdate = self.interval * GENESIS_BACKDATE_INTERVALS;
            info!("backdating first block by {}", seconds_to_hms(backdate as i64));
            (now - backdate, now, true)
        } else {
            let mine_time = f64::from(tip.time) + self.next_block_delta(tip.bits, &tip.hash);
            let is_mine = self.next_block_is_mine(&tip.hash);

            let mut action_time = mine_time;
            if !is_mine {
                action_time += self.config.backup_delay as f64;
            }
            if self.config.standby_delay > 0 {
                action_time += self.config.standby_delay as f64;
            } else if is_first_attempt {
                action_time = now;
            }
            (mine_time, action_time, is_mine)
        };

        let mine_time = mine_time.floor() as i64;
        let action_time = (action_time.floor() as i64).max(mine_time - MAX_FUTURE_BLOCK_SAFETY);
        SchedulerDecision {
            mine_time,
            action_time,
            is_mine,
        }
    }

    /// Check a freshly fetched template against the expected tip and raise
    /// the block time to the template's minimum if needed.
    pub fn refresh_template(
        &self,
        decision: SchedulerDecision,
        expected_tip: &BlockHash,
        template: serde_json::Value,
        now: f64,
    ) -> PollOutcome {
        let template = match BlockTemplate::from_json_value(template) {
            Ok(t) => t,
            Err(e) => return PollOutcome::Fatal(e.into()),
        };

        if template.previous_block_hash != *expected_tip {
            warn!(
                got = %template.previous_block_hash,
                expected = %expected_tip,
                "template based on unexpected block, retrying"
            );
            return PollOutcome::Retry {
                reason: MinerError::TipMismatch {
                    expected: *expected_tip,
                    got: template.previous_block_hash,
                },
                after: RETRY_DELAY,
            };
        }

        let mut decision = decision;
        let min_time = i64::from(template.min_time);
        if min_time > decision.mine_time {
            info!(from = decision.mine_time, to = min_time, "raising block time to template mintime");
            decision.mine_time = min_time;
            let ahead = (min_time as f64 - now).ceil() as i64;
            if ahead > 0 {
                error!(min_time, ahead, "template mintime is in the future");
                return PollOutcome::Retry {
                    reason: MinerError::MinTimeInFuture { min_time, ahead },
                    after: RETRY_DELAY,
                };
            }
        }

        PollOutcome::Ready {
            template: Box::new(template),
            decision,
        }
    }
}
