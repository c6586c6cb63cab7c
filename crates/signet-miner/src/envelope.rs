//! Transport envelope carrying the signet challenge to an external signer.
//!
//! The envelope is a partially signed transaction (`bitcoin::psbt::Psbt`)
//! with exactly one input and one output. The unsigned transaction is
//! `spend`; the serialized candidate block sits in the global proprietary
//! map under prefix `signet`, subtype `b`. The input map holds `to_spend`
//! and the requested sighash type; the signer adds the final scriptSig and
//! witness.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bitcoin::consensus::encode::{deserialize, serialize};
use bitcoin::psbt::raw::ProprietaryKey;
use bitcoin::psbt::{Psbt, PsbtSighashType};
use bitcoin::{Block, EcdsaSighashType, ScriptBuf, Transaction, Witness};

use signet_core::constants::{SIGNET_PSBT_PREFIX, SIGNET_PSBT_SUBTYPE};

use crate::commitment::{build_commitment, ChallengeScript, ExtensionSignal};
use crate::error::MinerError;

fn violation(msg: impl Into<String>) -> MinerError {
    MinerError::ProtocolViolation(msg.into())
}

/// Proprietary key under which the candidate block travels.
pub fn signet_block_key() -> ProprietaryKey {
    ProprietaryKey {
        prefix: SIGNET_PSBT_PREFIX.to_vec(),
        subtype: SIGNET_PSBT_SUBTYPE,
        key: Vec::new(),
    }
}

/// A validated signet envelope.
///
/// Construction checks the shape: one unsigned transaction with one input
/// and one output, and a block under the proprietary key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope(Psbt);

impl Envelope {
    pub fn new(psbt: Psbt) -> Result<Self, MinerError> {
        let tx = &psbt.unsigned_tx;
        if tx.input.len() != 1 || tx.output.len() != 1 {
            return Err(violation(format!(
                "unsigned transaction has {} inputs and {} outputs, expected 1 and 1",
                tx.input.len(),
                tx.output.len()
            )));
        }
        if tx
            .input
            .iter()
            .any(|i| !i.script_sig.is_empty() || !i.witness.is_empty())
        {
            return Err(violation("unsigned transaction carries signature data"));
        }
        if psbt.inputs.len() != 1 || psbt.outputs.len() != 1 {
            return Err(violation("input and output maps do not match the transaction"));
        }
        if !psbt.proprietary.contains_key(&signet_block_key()) {
            return Err(violation("missing signet block field"));
        }
        Ok(Self(psbt))
    }

    pub fn psbt(&self) -> &Psbt {
        &self.0
    }

    pub fn into_psbt(self) -> Psbt {
        self.0
    }

    pub fn unsigned_tx(&self) -> &Transaction {
        &self.0.unsigned_tx
    }

    /// Serialized candidate block.
    pub fn block_bytes(&self) -> &[u8] {
        self.0
            .proprietary
            .get(&signet_block_key())
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// Record the signer's final scriptSig.
    pub fn set_final_script_sig(&mut self, script_sig: ScriptBuf) {
        self.0.inputs[0].final_script_sig = Some(script_sig);
    }

    /// Record the signer's final witness stack.
    pub fn set_final_script_witness(&mut self, witness: Witness) {
        self.0.inputs[0].final_script_witness = Some(witness);
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        self.0.serialize()
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, MinerError> {
        let psbt =
            Psbt::deserialize(data).map_err(|e| violation(format!("malformed envelope: {e}")))?;
        Self::new(psbt)
    }

    pub fn to_base64(&self) -> String {
        STANDARD.encode(self.to_bytes())
    }

    pub fn from_base64(s: &str) -> Result<Self, MinerError> {
        let bytes = STANDARD
            .decode(s.trim())
            .map_err(|e| violation(format!("invalid base64: {e}")))?;
        Self::from_bytes(&bytes)
    }
}

/// Package a candidate block and its signet challenge for signing.
pub fn pack(
    block: &Block,
    challenge: &ChallengeScript,
    signal: &ExtensionSignal,
) -> Result<Envelope, MinerError> {
    let pair = build_commitment(block, challenge, signal)?;

    let mut psbt = Psbt::from_unsigned_tx(pair.spend)
        .map_err(|e| violation(format!("unsigned transaction rejected: {e}")))?;
    psbt.proprietary.insert(signet_block_key(), serialize(block));

    let input = psbt
        .inputs
        .first_mut()
        .ok_or_else(|| violation("unsigned transaction has no inputs"))?;
    input.non_witness_utxo = Some(pair.to_spend);
    input.sighash_type = Some(PsbtSighashType::from(EcdsaSighashType::All));

    Envelope::new(psbt)
}

/// Recover the candidate block and the signet solution from a signed envelope.
///
/// The solution is the length-prefixed final scriptSig (empty if absent)
/// followed by the serialized final witness (an empty stack if absent).
pub fn unpack(envelope: &Envelope) -> Result<(Block, Vec<u8>), MinerError> {
    let block: Block = deserialize(envelope.block_bytes())
        .map_err(|e| violation(format!("undecodable signet block: {e}")))?;

    let input = envelope
        .psbt()
        .inputs
        .first()
        .ok_or_else(|| violation("envelope has no input map"))?;
    let script_sig = input.final_script_sig.clone().unwrap_or_default();
    let witness = input.final_script_witness.clone().unwrap_or_default();

    let mut solution = serialize(&script_sig);
    solution.extend_from_slice(&serialize(&witness));
    Ok((block, solution))
}
