//! Finalizer: splice the signet solution into a block and solve its
//! proof-of-work.
//!
//! The solution is pushed, behind [`SIGNET_HEADER`], onto the coinbase's
//! witness commitment output: the same output the commitment merkle root was
//! computed over. The witness root ignores the coinbase, so the commitment
//! stays valid.

use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use bitcoin::block::Header;
use bitcoin::consensus::encode::{deserialize, serialize_hex};
use bitcoin::Block;
use tracing::{debug, info};

use signet_core::constants::SIGNET_HEADER;
use signet_core::difficulty::check_pow;
use signet_core::script::{append_push, witness_commitment_index};

use crate::error::{GrindError, MinerError};
use crate::util::format_unix_time;

/// Nonces tried between checks of the running flag.
const NONCE_CHUNK: u64 = 100_000;

/// How often a running grinder process is checked for exit or cancellation.
const GRINDER_POLL: Duration = Duration::from_millis(50);

/// Finds a nonce satisfying a header's compact target.
pub trait ProofOfWorkSolver: Send + Sync {
    /// Return `header` with a nonce whose hash meets `header.bits`.
    fn solve(&self, header: &Header) -> Result<Header, GrindError> {
        self.solve_while(header, &AtomicBool::new(true))
    }

    /// Like [`solve`](Self::solve), but gives up with
    /// [`GrindError::Cancelled`] once `running` is cleared.
    fn solve_while(&self, header: &Header, running: &AtomicBool) -> Result<Header, GrindError>;
}

/// Sequential nonce search in-process.
#[derive(Debug, Clone, Copy, Default)]
pub struct BruteForce;

impl ProofOfWorkSolver for BruteForce {
    fn solve_while(&self, header: &Header, running: &AtomicBool) -> Result<Header, GrindError> {
        let mut candidate = *header;
        let mut attempts: u64 = 0;
        loop {
            if attempts % NONCE_CHUNK == 0 && !running.load(Ordering::Relaxed) {
                return Err(GrindError::Cancelled);
            }
            if check_pow(&candidate)? {
                return Ok(candidate);
            }
            attempts += 1;
            candidate.nonce = candidate.nonce.wrapping_add(1);
            if candidate.nonce == header.nonce {
                return Err(GrindError::NonceSpaceExhausted);
            }
        }
    }
}

/// External grinder process.
///
/// Invoked as `program args... <header hex>` with empty stdin; prints the
/// solved header as hex on stdout. Only the nonce is taken from its answer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExternalGrinder {
    program: String,
    args: Vec<String>,
}

impl ExternalGrinder {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    /// Split a whitespace-separated command line.
    pub fn from_command_line(cmd: &str) -> Result<Self, GrindError> {
        let mut parts = cmd.split_whitespace().map(str::to_owned);
        let program = parts.next().ok_or(GrindError::EmptyCommand)?;
        Ok(Self::new(program, parts.collect()))
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }
}

impl ProofOfWorkSolver for ExternalGrinder {
    fn solve_while(&self, header: &Header, running: &AtomicBool) -> Result<Header, GrindError> {
        let header_hex = serialize_hex(header);
        debug!(program = %self.program, header = %header_hex, "invoking grinder");

        let mut child = Command::new(&self.program)
            .args(&self.args)
            .arg(&header_hex)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| GrindError::Spawn {
                program: self.program.clone(),
                reason: e.to_string(),
            })?;

        loop {
            let exited = child.try_wait().map_err(|e| GrindError::Spawn {
                program: self.program.clone(),
                reason: e.to_string(),
            })?;
            if exited.is_some() {
                break;
            }
            if !running.load(Ordering::Relaxed) {
                let _ = child.kill();
                let _ = child.wait();
                return Err(GrindError::Cancelled);
            }
            thread::sleep(GRINDER_POLL);
        }

        let output = child.wait_with_output().map_err(|e| GrindError::Spawn {
            program: self.program.clone(),
            reason: e.to_string(),
        })?;
        if !output.status.success() {
            return Err(GrindError::ExitStatus {
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let bytes = hex::decode(stdout.trim())
            .map_err(|e| GrindError::InvalidOutput(format!("not hex: {e}")))?;
        let solved: Header =
            deserialize(&bytes).map_err(|e| GrindError::InvalidOutput(e.to_string()))?;

        let mut result = *header;
        result.nonce = solved.nonce;
        Ok(result)
    }
}

/// Which solver the configuration selects.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum SolverChoice {
    #[default]
    BruteForce,
    External(ExternalGrinder),
}

impl SolverChoice {
    /// `None` or a blank command selects brute force.
    pub fn from_grind_cmd(cmd: Option<&str>) -> Result<Self, GrindError> {
        match cmd.map(str::trim) {
            None | Some("") => Ok(Self::BruteForce),
            Some(cmd) => ExternalGrinder::from_command_line(cmd).map(Self::External),
        }
    }

    pub fn into_solver(self) -> Arc<dyn ProofOfWorkSolver> {
        match self {
            Self::BruteForce => Arc::new(BruteForce),
            Self::External(grinder) => Arc::new(grinder),
        }
    }
}

/// Push `SIGNET_HEADER || solution` onto the coinbase's witness commitment
/// output and refresh the header's merkle root.
pub fn embed_solution(block: &mut Block, solution: &[u8]) -> Result<(), MinerError> {
    let coinbase = block
        .txdata
        .first_mut()
        .ok_or_else(|| MinerError::ProtocolViolation("signed block has no transactions".into()))?;
    let index = witness_commitment_index(coinbase).ok_or_else(|| {
        MinerError::ProtocolViolation("signed block has no witness commitment".into())
    })?;

    let mut payload = Vec::with_capacity(SIGNET_HEADER.len() + solution.len());
    payload.extend_from_slice(&SIGNET_HEADER);
    payload.extend_from_slice(solution);
    append_push(&mut coinbase.output[index].script_pubkey, &payload)?;

    block.header.merkle_root = block.compute_merkle_root().ok_or_else(|| {
        MinerError::ProtocolViolation("signed block has no transactions".into())
    })?;
    Ok(())
}

/// Complete a signed candidate block: embed the solution, refresh the merkle
/// root and solve proof-of-work.
pub fn finish(
    block: Block,
    solution: &[u8],
    solver: &dyn ProofOfWorkSolver,
) -> Result<Block, MinerError> {
    finish_while(block, solution, solver, &AtomicBool::new(true))
}

/// [`finish`], abandoning the proof-of-work search once `running` is cleared.
pub fn finish_while(
    mut block: Block,
    solution: &[u8],
    solver: &dyn ProofOfWorkSolver,
    running: &AtomicBool,
) -> Result<Block, MinerError> {
    embed_solution(&mut block, solution)?;
    block.header = solver.solve_while(&block.header, running)?;

    let h = &block.header;
    info!(
        version = %format!("{:08x}", h.version.to_consensus()),
        prev = %h.prev_blockhash,
        merkle_root = %h.merkle_root,
        time = h.time,
        time_utc = %format_unix_time(h.time as i64),
        bits = %format!("{:08x}", h.bits.to_consensus()),
        nonce = h.nonce,
        hash = %block.block_hash(),
        "finalized block"
    );
    Ok(block)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::absolute::LockTime;
    use bitcoin::block::Version;
    use bitcoin::hashes::Hash;
    use bitcoin::{
        transaction, Amount, BlockHash, CompactTarget, OutPoint, ScriptBuf, Sequence,
        Transaction, TxIn, TxMerkleNode, TxOut, Witness,
    };
    use signet_core::constants::WITNESS_RESERVED_VALUE;
    use signet_core::script::add_witness_commitment;

    use crate::commitment::{build_commitment, ChallengeScript, ExtensionSignal};

    const EASY_BITS: u32 = 0x207f_ffff;

    fn block(with_commitment: bool) -> Block {
        let coinbase = Transaction {
            version: transaction::Version::TWO,
            lock_time: LockTime::ZERO,
            input: vec![TxIn {
                previous_output: OutPoint::null(),
                script_sig: ScriptBuf::from_bytes(vec![0x01, 0x64]),
                sequence: Sequence(0xffff_fffe),
                witness: Witness::from_slice(&[WITNESS_RESERVED_VALUE]),
            }],
            output: vec![TxOut {
                value: Amount::from_sat(50),
                script_pubkey: ScriptBuf::from_bytes(vec![0x51]),
            }],
        };
        let mut b = Block {
            header: Header {
                version: Version::from_consensus(0x2000_0000),
                prev_blockhash: BlockHash::from_byte_array([0x21; 32]),
                merkle_root: TxMerkleNode::all_zeros(),
                time: 1_700_000_000,
                bits: CompactTarget::from_consensus(EASY_BITS),
                nonce: 0,
            },
            txdata: vec![coinbase],
        };
        if with_commitment {
            add_witness_commitment(&mut b);
        }
        b
    }

    #[test]
    fn brute_force_meets_target() {
        let header = block(true).header;
        let solved = BruteForce.solve(&header).unwrap();
        assert!(check_pow(&solved).unwrap());
        assert_eq!(solved.merkle_root, header.merkle_root);
    }

    #[test]
    fn brute_force_rejects_zero_target() {
        let mut header = block(true).header;
        header.bits = CompactTarget::from_consensus(0);
        assert!(matches!(BruteForce.solve(&header), Err(GrindError::Difficulty(_))));
    }

    #[test]
    fn brute_force_stops_when_not_running() {
        let mut header = block(true).header;
        header.bits = CompactTarget::from_consensus(0x1d00ffff);
        let running = AtomicBool::new(false);
        assert_eq!(BruteForce.solve_while(&header, &running), Err(GrindError::Cancelled));
    }

    #[test]
    fn solution_lands_on_commitment_output() {
        let b = block(true);
        let commitment = b.txdata[0].output[1].script_pubkey.clone();
        let done = finish(b, &[0x00, 0x00], &BruteForce).unwrap();

        let outputs = &done.txdata[0].output;
        assert_eq!(outputs.len(), 2);
        let script = outputs[1].script_pubkey.as_bytes();
        assert!(script.starts_with(commitment.as_bytes()));
        assert_eq!(
            &script[commitment.len()..],
            &[0x06, 0xec, 0xc7, 0xda, 0xa2, 0x00, 0x00]
        );
        assert!(done.check_merkle_root());
        assert!(done.check_witness_commitment());
        assert!(check_pow(&done.header).unwrap());
    }

    #[test]
    fn signed_root_matches_validator_root() {
        // A validator strips the solution back to a bare header push on the
        // commitment output and recomputes the merkle root the signer saw.
        let mut b = block(true);
        b.txdata[0].output.push(TxOut {
            value: Amount::ZERO,
            script_pubkey: ScriptBuf::from_bytes(vec![0x51]),
        });
        let challenge = ChallengeScript::new(ScriptBuf::from_bytes(vec![0x51])).unwrap();
        let pair = build_commitment(&b, &challenge, &ExtensionSignal::default()).unwrap();
        let signed_root = pair.to_spend.input[0].script_sig.as_bytes()[2 + 36..2 + 68].to_vec();

        let commitment = b.txdata[0].output[1].script_pubkey.clone();
        let done = finish(b, &[0x00, 0x00], &BruteForce).unwrap();

        let mut stripped = done.clone();
        let index = witness_commitment_index(&stripped.txdata[0]).unwrap();
        assert_eq!(index, 1);
        let mut script = commitment;
        append_push(&mut script, &SIGNET_HEADER).unwrap();
        stripped.txdata[0].output[index].script_pubkey = script;

        let validator_root = stripped.compute_merkle_root().unwrap();
        assert_eq!(validator_root.as_byte_array().as_slice(), signed_root.as_slice());
    }

    #[test]
    fn block_without_commitment_rejected() {
        assert!(matches!(
            finish(block(false), &[0x00, 0x00], &BruteForce),
            Err(MinerError::ProtocolViolation(_))
        ));
    }

    #[test]
    fn empty_block_rejected() {
        let mut b = block(true);
        b.txdata.clear();
        assert!(matches!(
            finish(b, &[], &BruteForce),
            Err(MinerError::ProtocolViolation(_))
        ));
    }

    #[test]
    fn grind_command_parsing() {
        assert!(matches!(
            ExternalGrinder::from_command_line("   "),
            Err(GrindError::EmptyCommand)
        ));
        let g = ExternalGrinder::from_command_line("bitcoin-util grind").unwrap();
        assert_eq!(g.program(), "bitcoin-util");
        assert_eq!(g.args(), ["grind".to_string()]);

        assert_eq!(SolverChoice::from_grind_cmd(None).unwrap(), SolverChoice::BruteForce);
        assert_eq!(SolverChoice::from_grind_cmd(Some("")).unwrap(), SolverChoice::BruteForce);
        assert!(matches!(
            SolverChoice::from_grind_cmd(Some("grinder -x")).unwrap(),
            SolverChoice::External(_)
        ));
    }

    #[test]
    fn missing_grinder_binary_is_spawn_error() {
        let g = ExternalGrinder::new("/nonexistent/grinder-binary", Vec::new());
        assert!(matches!(
            g.solve(&block(true).header),
            Err(GrindError::Spawn { .. })
        ));
    }

    #[cfg(unix)]
    #[test]
    fn grinder_nonce_copied_back() {
        // `sh -c 'echo <hex>' sh <header>` prints a fixed header with nonce 7.
        let mut other = block(true).header;
        other.nonce = 7;
        other.time = 1;
        let script = format!("echo {}", serialize_hex(&other));
        let g = ExternalGrinder::new("sh", vec!["-c".into(), script, "sh".into()]);

        let header = block(true).header;
        let solved = g.solve(&header).unwrap();
        assert_eq!(solved.nonce, 7);
        assert_eq!(solved.time, header.time);
    }

    #[cfg(unix)]
    #[test]
    fn grinder_failure_and_garbage_output() {
        let header = block(true).header;
        let fail = ExternalGrinder::new("sh", vec!["-c".into(), "exit 3".into(), "sh".into()]);
        assert!(matches!(fail.solve(&header), Err(GrindError::ExitStatus { .. })));

        let junk = ExternalGrinder::new("sh", vec!["-c".into(), "echo zz".into(), "sh".into()]);
        assert!(matches!(junk.solve(&header), Err(GrindError::InvalidOutput(_))));

        let short = ExternalGrinder::new("sh", vec!["-c".into(), "echo 00".into(), "sh".into()]);
        assert!(matches!(short.solve(&header), Err(GrindError::InvalidOutput(_))));
    }

    #[cfg(unix)]
    #[test]
    fn grinder_killed_when_not_running() {
        let g = ExternalGrinder::new("sh", vec!["-c".into(), "sleep 30".into(), "sh".into()]);
        let running = AtomicBool::new(false);
        let started = std::time::Instant::now();
        assert_eq!(
            g.solve_while(&block(true).header, &running),
            Err(GrindError::Cancelled)
        );
        assert!(started.elapsed() < Duration::from_secs(10));
    }
}
