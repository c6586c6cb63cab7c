//! Signet commitment: the transaction pair whose signature is the block solution.
//!
//! For a candidate block the signer is asked to spend `to_spend`, an output
//! locked by the network's challenge script. `to_spend`'s scriptSig embeds a
//! digest of the block, so the signature commits to the block contents:
//!
//! ```text
//! sd = version (LE 4) || prev hash (32) || merkle root (32) || time (LE 4) || signal (4)
//! ```
//!
//! The merkle root is computed with the coinbase's witness commitment output
//! extended by a push of [`SIGNET_HEADER`], the position the solution will
//! later occupy. A block without a witness commitment has no such position
//! and is rejected.

use std::fmt;
use std::iter;

use bitcoin::absolute::LockTime;
use bitcoin::hashes::Hash;
use bitcoin::merkle_tree;
use bitcoin::opcodes::all::OP_RETURN;
use bitcoin::opcodes::OP_0;
use bitcoin::script::Builder;
use bitcoin::{
    transaction, Amount, Block, OutPoint, Script, ScriptBuf, Sequence, Transaction, TxIn,
    TxMerkleNode, TxOut, Witness,
};

use signet_core::constants::SIGNET_HEADER;
use signet_core::script::{append_push, witness_commitment_index};

use crate::error::MinerError;

/// Length of the signed digest embedded in `to_spend`.
pub const SIGNED_DIGEST_LEN: usize = 4 + 32 + 32 + 4 + 4;

/// Locking script identifying the network's signing authority.
#[derive(Clone, PartialEq, Eq)]
pub struct ChallengeScript(ScriptBuf);

impl ChallengeScript {
    pub fn new(script: ScriptBuf) -> Result<Self, MinerError> {
        if script.is_empty() {
            return Err(MinerError::MalformedTemplate("empty challenge script".into()));
        }
        Ok(Self(script))
    }

    pub fn from_hex(s: &str) -> Result<Self, MinerError> {
        let bytes = hex::decode(s.trim())
            .map_err(|e| MinerError::MalformedTemplate(format!("challenge hex: {e}")))?;
        Self::new(ScriptBuf::from_bytes(bytes))
    }

    pub fn as_script(&self) -> &Script {
        &self.0
    }
}

impl fmt::Debug for ChallengeScript {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ChallengeScript({})", hex::encode(self.0.as_bytes()))
    }
}

/// Feature-activation signaling folded into the signed digest.
///
/// When `version_bit` is set in the block version the digest carries
/// `marker`; otherwise four zero bytes. The field is always present.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExtensionSignal {
    pub version_bit: u8,
    pub marker: [u8; 4],
}

impl Default for ExtensionSignal {
    fn default() -> Self {
        Self {
            version_bit: 28,
            marker: [0x01, 0x00, 0x00, 0x00],
        }
    }
}

impl ExtensionSignal {
    pub fn is_signaled(&self, version: i32) -> bool {
        (version as u32)
            .checked_shr(self.version_bit as u32)
            .is_some_and(|v| v & 1 == 1)
    }

    /// The four bytes appended to the signed digest for `version`.
    pub fn field(&self, version: i32) -> [u8; 4] {
        if self.is_signaled(version) {
            self.marker
        } else {
            [0u8; 4]
        }
    }
}

/// The synthetic transactions of the signet commitment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpendPair {
    /// Zero-value output locked by the challenge script.
    pub to_spend: Transaction,
    /// Spends `to_spend`; its signature is the signet solution.
    pub spend: Transaction,
}

/// Merkle root of the block with the signet header pushed onto the
/// coinbase's witness commitment output.
pub fn commitment_merkle_root(block: &Block) -> Result<TxMerkleNode, MinerError> {
    let mut coinbase = block
        .txdata
        .first()
        .cloned()
        .ok_or_else(|| MinerError::MalformedTemplate("block has no transactions".into()))?;
    let index = witness_commitment_index(&coinbase)
        .ok_or_else(|| MinerError::MalformedTemplate("coinbase has no witness commitment".into()))?;
    append_push(&mut coinbase.output[index].script_pubkey, &SIGNET_HEADER)?;

    let txids = iter::once(coinbase.compute_txid())
        .chain(block.txdata.iter().skip(1).map(Transaction::compute_txid))
        .map(|txid| txid.to_raw_hash());
    merkle_tree::calculate_root(txids)
        .map(TxMerkleNode::from_raw_hash)
        .ok_or_else(|| MinerError::MalformedTemplate("block has no transactions".into()))
}

/// The signed digest `sd` for a block and commitment merkle root.
pub fn signed_digest(block: &Block, merkle_root: &TxMerkleNode, signal: &ExtensionSignal) -> Vec<u8> {
    let version = block.header.version.to_consensus();
    let mut sd = Vec::with_capacity(SIGNED_DIGEST_LEN);
    sd.extend_from_slice(&version.to_le_bytes());
    sd.extend_from_slice(block.header.prev_blockhash.as_byte_array());
    sd.extend_from_slice(merkle_root.as_byte_array());
    sd.extend_from_slice(&block.header.time.to_le_bytes());
    sd.extend_from_slice(&signal.field(version));
    sd
}

/// Derive the commitment transaction pair for a candidate block.
///
/// Deterministic in `(block, challenge, signal)`.
pub fn build_commitment(
    block: &Block,
    challenge: &ChallengeScript,
    signal: &ExtensionSignal,
) -> Result<SpendPair, MinerError> {
    let root = commitment_merkle_root(block)?;
    let sd = signed_digest(block, &root, signal);

    let mut script_sig = Builder::new().push_opcode(OP_0).into_script();
    append_push(&mut script_sig, &sd)?;

    let to_spend = Transaction {
        version: transaction::Version(0),
        lock_time: LockTime::ZERO,
        input: vec![TxIn {
            previous_output: OutPoint::null(),
            script_sig,
            sequence: Sequence::ZERO,
            witness: Witness::new(),
        }],
        output: vec![TxOut {
            value: Amount::ZERO,
            script_pubkey: challenge.as_script().to_owned(),
        }],
    };

    let spend = Transaction {
        version: transaction::Version(0),
        lock_time: LockTime::ZERO,
        input: vec![TxIn {
            previous_output: OutPoint::new(to_spend.compute_txid(), 0),
            script_sig: ScriptBuf::new(),
            sequence: Sequence::ZERO,
            witness: Witness::new(),
        }],
        output: vec![TxOut {
            value: Amount::ZERO,
            script_pubkey: Builder::new().push_opcode(OP_RETURN).into_script(),
        }],
    };

    Ok(SpendPair { to_spend, spend })
}
