//! Script construction helpers.
//!
//! Thin wrappers over `bitcoin::script` for the few constructions block
//! production needs: pushes onto existing scripts, BIP34 coinbase heights and
//! witness commitments.

use bitcoin::hashes::Hash;
use bitcoin::opcodes::all::OP_PUSHNUM_1;
use bitcoin::script::{Builder, PushBytesBuf};
use bitcoin::{Amount, Block, Script, ScriptBuf, Transaction, TxOut, WitnessMerkleNode};

use crate::constants::{WITNESS_COMMITMENT_PREFIX, WITNESS_RESERVED_VALUE};
use crate::error::TemplateError;

/// Append a minimal push of `data` to `script`.
pub fn append_push(script: &mut ScriptBuf, data: &[u8]) -> Result<(), TemplateError> {
    let bytes = PushBytesBuf::try_from(data.to_vec())
        .map_err(|_| TemplateError::OversizedPush(data.len()))?;
    script.push_slice(bytes);
    Ok(())
}

/// Coinbase script prefix committing to the block height.
///
/// Heights up to 16 use a small-integer opcode followed by `OP_1` so the
/// script meets the two-byte minimum coinbase script length.
pub fn bip34_height_script(height: u64) -> Result<ScriptBuf, TemplateError> {
    let value = i64::try_from(height).map_err(|_| TemplateError::InvalidField {
        field: "height",
        reason: format!("{height} out of range"),
    })?;
    let builder = Builder::new().push_int(value);
    let builder = if height <= 16 {
        builder.push_opcode(OP_PUSHNUM_1)
    } else {
        builder
    };
    Ok(builder.into_script())
}

/// Witness commitment output script for a witness root, using the all-zero
/// reserved value.
pub fn witness_commitment_script(witness_root: &WitnessMerkleNode) -> ScriptBuf {
    let commitment = Block::compute_witness_commitment(witness_root, &WITNESS_RESERVED_VALUE);
    let mut bytes = Vec::with_capacity(WITNESS_COMMITMENT_PREFIX.len() + 32);
    bytes.extend_from_slice(&WITNESS_COMMITMENT_PREFIX);
    bytes.extend_from_slice(commitment.as_byte_array());
    ScriptBuf::from_bytes(bytes)
}

/// Whether an output script starts with the witness commitment prefix.
pub fn is_witness_commitment(script: &Script) -> bool {
    let bytes = script.as_bytes();
    bytes.len() >= WITNESS_COMMITMENT_PREFIX.len() + 32 && bytes.starts_with(&WITNESS_COMMITMENT_PREFIX)
}

/// Index of the coinbase output holding the witness commitment. As in
/// consensus validation, the last matching output wins.
pub fn witness_commitment_index(coinbase: &Transaction) -> Option<usize> {
    coinbase
        .output
        .iter()
        .rposition(|out| is_witness_commitment(&out.script_pubkey))
}

/// Append a witness commitment output to the coinbase unless one is present.
///
/// Returns whether an output was added. The coinbase witness is left as is;
/// it must already hold the reserved value.
pub fn add_witness_commitment(block: &mut Block) -> bool {
    let Some(root) = block.witness_root() else {
        return false;
    };
    let Some(coinbase) = block.txdata.first_mut() else {
        return false;
    };
    if witness_commitment_index(coinbase).is_some() {
        return false;
    }
    coinbase.output.push(TxOut {
        value: Amount::ZERO,
        script_pubkey: witness_commitment_script(&root),
    });
    true
}
