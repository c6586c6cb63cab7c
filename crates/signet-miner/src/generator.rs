//! Control loop: poll the node, wait until a block is due, then build, sign,
//! finalize and submit it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bitcoin::{Block, BlockHash, Script};
use tracing::{debug, error, info, warn};

use signet_core::template::BlockTemplate;

use crate::commitment::{ChallengeScript, ExtensionSignal};
use crate::config::MinerConfig;
use crate::envelope::{pack, unpack, Envelope};
use crate::error::{GrindError, MinerError};
use crate::finalize::{finish, finish_while, ProofOfWorkSolver};
use crate::rpc::NodeRpc;
use crate::scheduler::{ChainTip, PollOutcome, Scheduler, SchedulerDecision, RETRY_DELAY};
use crate::util::{format_unix_time, seconds_to_hms, unix_now};

/// Assemble a candidate block from `template` and package it for signing.
pub fn create_envelope(
    template: &BlockTemplate,
    reward_script: &Script,
    block_time: Option<u32>,
    pool_id: Option<&[u8]>,
    signal: &ExtensionSignal,
) -> Result<Envelope, MinerError> {
    let block = template.assemble(reward_script, block_time, pool_id)?;
    let challenge = ChallengeScript::new(template.challenge.clone())?;
    pack(&block, &challenge, signal)
}

/// Turn a signed envelope into a submittable block.
pub fn solve_envelope(envelope: &Envelope, solver: &dyn ProofOfWorkSolver) -> Result<Block, MinerError> {
    let (block, solution) = unpack(envelope)?;
    finish(block, &solution, solver)
}

/// Drives block production against one node.
pub struct Generator {
    rpc: Arc<dyn NodeRpc>,
    scheduler: Scheduler,
    solver: Arc<dyn ProofOfWorkSolver>,
    config: MinerConfig,
    running: Arc<AtomicBool>,
}

impl Generator {
    pub fn new(rpc: Arc<dyn NodeRpc>, config: MinerConfig) -> Result<Self, MinerError> {
        config.validate()?;
        Ok(Self {
            rpc,
            scheduler: Scheduler::new(config.scheduler.clone())?,
            solver: config.solver.clone().into_solver(),
            config,
            running: Arc::new(AtomicBool::new(true)),
        })
    }

    /// Replace the solver selected by the configuration.
    pub fn with_solver(mut self, solver: Arc<dyn ProofOfWorkSolver>) -> Self {
        self.solver = solver;
        self
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    /// Flag the control loop and solver watch; clearing it stops [`run`](Self::run)
    /// at the next check, including mid-solve.
    pub fn running_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.running)
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    /// Sleep for `total`, waking every [`RETRY_DELAY`] to check the running flag.
    async fn pause(&self, total: Duration) {
        let mut left = total;
        while !left.is_zero() && self.is_running() {
            let step = left.min(RETRY_DELAY);
            tokio::time::sleep(step).await;
            left -= step;
        }
    }

    /// Build, sign and finalize one block for `template`.
    pub async fn mine(
        &self,
        template: &BlockTemplate,
        decision: &SchedulerDecision,
    ) -> Result<Block, MinerError> {
        let block_time = u32::try_from(decision.mine_time).map_err(|_| {
            MinerError::MalformedTemplate(format!("block time {} out of range", decision.mine_time))
        })?;
        let envelope = create_envelope(
            template,
            &self.config.reward_script,
            Some(block_time),
            self.config.pool_id.as_deref(),
            &self.config.signal,
        )?;
        let encoded = envelope.to_base64();

        let processed = self.rpc.process_envelope(&encoded).await?;
        if !processed.complete {
            debug!(envelope = %encoded, "signer left envelope incomplete");
            return Err(MinerError::SigningIncomplete);
        }

        let signed = Envelope::from_base64(&processed.psbt)?;
        let (block, solution) = unpack(&signed)?;

        let solver = Arc::clone(&self.solver);
        let running = Arc::clone(&self.running);
        tokio::task::spawn_blocking(move || {
            finish_while(block, &solution, solver.as_ref(), &running)
        })
        .await
        .map_err(|e| MinerError::Grind(GrindError::Task(e.to_string())))?
    }

    /// Produce blocks until `max_blocks` have been submitted, or forever.
    ///
    /// Returns the number of blocks submitted, counting ones the node
    /// rejected.
    pub async fn run(&self, max_blocks: Option<u64>) -> Result<u64, MinerError> {
        let mut mined = 0u64;
        let mut tip: Option<ChainTip> = None;
        let mut last_seen: Option<BlockHash> = None;
        let mut is_first_attempt = true;

        while self.is_running() && max_blocks.is_none_or(|max| mined < max) {
            let best = self.rpc.best_block_hash().await?;
            let current = match tip.take() {
                Some(t) if t.hash == best => t,
                _ => self.rpc.block_header(&best).await?,
            };

            if last_seen != Some(current.hash) {
                if last_seen.is_some() {
                    self.log_next(&current, "received new block");
                }
                last_seen = Some(current.hash);
            }

            let now = unix_now();
            let decision = self.scheduler.next_block_time(now, &current, is_first_attempt);
            let tip_hash = current.hash;
            let tip_time = current.time;
            tip = Some(current);

            if let Some(pause) = decision.sleep_before_action(now) {
                debug!(
                    "sleeping for {}, next block due in {} ({})",
                    seconds_to_hms(pause.as_secs() as i64),
                    seconds_to_hms(decision.mine_time - now as i64),
                    if decision.is_mine { "mine" } else { "backup" }
                );
                self.pause(pause).await;
                continue;
            }

            let template = self.rpc.block_template().await?;
            let (template, decision) =
                match self.scheduler.refresh_template(decision, &tip_hash, template, now) {
                    PollOutcome::Ready { template, decision } => (template, decision),
                    PollOutcome::Retry { reason, after } => {
                        debug!(%reason, "retrying poll");
                        self.pause(after).await;
                        continue;
                    }
                    PollOutcome::Fatal(e) => return Err(e),
                };

            debug!(
                delta = %seconds_to_hms(decision.mine_time - i64::from(tip_time)),
                start = %format_unix_time(decision.mine_time),
                is_mine = decision.is_mine,
                "mining block"
            );
            is_first_attempt = false;

            let block = match self.mine(&template, &decision).await {
                Ok(block) => block,
                Err(MinerError::SigningIncomplete) => {
                    warn!("envelope signing incomplete, skipping attempt");
                    self.pause(RETRY_DELAY).await;
                    continue;
                }
                Err(MinerError::Grind(GrindError::Cancelled)) => {
                    warn!(height = template.height, "shutdown requested, abandoning block");
                    break;
                }
                Err(e) => {
                    error!(error = %e, height = template.height, "mining failed");
                    return Err(e);
                }
            };

            mined += 1;
            match self.rpc.submit_block(&block).await {
                Ok(()) => {}
                Err(MinerError::SubmissionRejected(reason)) => {
                    warn!(%reason, height = template.height, hash = %block.block_hash(), "submitblock rejected block");
                }
                Err(e) => return Err(e),
            }

            let next = ChainTip {
                height: template.height,
                hash: block.block_hash(),
                bits: block.header.bits.to_consensus(),
                time: block.header.time,
            };
            let kind = if decision.is_mine { "mined block" } else { "mined backup block" };
            self.log_next(&next, kind);
            last_seen = Some(next.hash);
        }

        info!(blocks = mined, "block production finished");
        Ok(mined)
    }

    fn log_next(&self, tip: &ChainTip, event: &str) {
        let delta = self.scheduler.next_block_delta(tip.bits, &tip.hash) + f64::from(tip.time) - unix_now();
        let owner = if self.scheduler.next_block_is_mine(&tip.hash) { "mine" } else { "backup" };
        info!(
            height = tip.height,
            hash = %tip.hash,
            "{event}; next in {} ({owner})",
            seconds_to_hms(delta as i64)
        );
    }
}
