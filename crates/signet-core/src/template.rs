//! Block templates and candidate block assembly.
//!
//! A [`BlockTemplate`] is the typed form of a node's `getblocktemplate`
//! reply. [`BlockTemplate::assemble`] turns it into a candidate [`Block`]:
//! a coinbase paying the reward script, the template's transactions, and a
//! witness commitment output on the coinbase.

use std::str::FromStr;

use bitcoin::absolute::LockTime;
use bitcoin::block::{Header, Version};
use bitcoin::consensus::encode::deserialize;
use bitcoin::hashes::Hash;
use bitcoin::{
    transaction, Amount, Block, BlockHash, CompactTarget, OutPoint, Script, ScriptBuf, Sequence,
    Transaction, TxIn, TxMerkleNode, TxOut, Witness,
};
use serde::{Deserialize, Serialize};

use crate::constants::{COINBASE_SEQUENCE, WITNESS_RESERVED_VALUE};
use crate::error::TemplateError;
use crate::script::{add_witness_commitment, append_push, bip34_height_script};

/// Raw `getblocktemplate` reply. Only the fields block production reads.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockTemplateJson {
    pub version: i32,
    pub previousblockhash: String,
    pub height: u64,
    pub mintime: u64,
    pub curtime: u64,
    /// Compact target as 8 hex digits.
    pub bits: String,
    pub coinbasevalue: u64,
    #[serde(default)]
    pub signet_challenge: Option<String>,
    #[serde(default)]
    pub transactions: Vec<TemplateTransactionJson>,
}

/// One entry of the template's `transactions` array.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TemplateTransactionJson {
    /// Hex-encoded serialized transaction.
    pub data: String,
    #[serde(default)]
    pub txid: Option<String>,
}

/// Candidate block parameters supplied by the node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockTemplate {
    pub version: Version,
    pub previous_block_hash: BlockHash,
    pub height: u64,
    pub min_time: u32,
    pub cur_time: u32,
    pub bits: CompactTarget,
    pub coinbase_value: Amount,
    /// Locking script whose satisfaction is the signet solution.
    pub challenge: ScriptBuf,
    /// Non-coinbase transactions in template order.
    pub transactions: Vec<Transaction>,
}

fn time_field(field: &'static str, value: u64) -> Result<u32, TemplateError> {
    u32::try_from(value).map_err(|_| TemplateError::InvalidField {
        field,
        reason: format!("{value} does not fit in 32 bits"),
    })
}

fn decode_transaction(index: usize, data: &str) -> Result<Transaction, TemplateError> {
    let bytes = hex::decode(data).map_err(|e| TemplateError::InvalidTransaction {
        index,
        reason: e.to_string(),
    })?;
    deserialize(&bytes).map_err(|e| TemplateError::InvalidTransaction {
        index,
        reason: e.to_string(),
    })
}

impl TryFrom<BlockTemplateJson> for BlockTemplate {
    type Error = TemplateError;

    fn try_from(json: BlockTemplateJson) -> Result<Self, Self::Error> {
        let previous_block_hash = BlockHash::from_str(&json.previousblockhash).map_err(|e| {
            TemplateError::InvalidField {
                field: "previousblockhash",
                reason: e.to_string(),
            }
        })?;

        let bits = u32::from_str_radix(&json.bits, 16).map_err(|e| TemplateError::InvalidField {
            field: "bits",
            reason: e.to_string(),
        })?;

        let challenge_hex = json
            .signet_challenge
            .ok_or(TemplateError::MissingField("signet_challenge"))?;
        let challenge = hex::decode(&challenge_hex).map_err(|e| TemplateError::InvalidField {
            field: "signet_challenge",
            reason: e.to_string(),
        })?;
        if challenge.is_empty() {
            return Err(TemplateError::EmptyChallenge);
        }

        let transactions = json
            .transactions
            .iter()
            .enumerate()
            .map(|(index, tx)| decode_transaction(index, &tx.data))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            version: Version::from_consensus(json.version),
            previous_block_hash,
            height: json.height,
            min_time: time_field("mintime", json.mintime)?,
            cur_time: time_field("curtime", json.curtime)?,
            bits: CompactTarget::from_consensus(bits),
            coinbase_value: Amount::from_sat(json.coinbasevalue),
            challenge: ScriptBuf::from_bytes(challenge),
            transactions,
        })
    }
}

impl BlockTemplate {
    /// Parse a `getblocktemplate` JSON reply.
    pub fn from_json_str(s: &str) -> Result<Self, TemplateError> {
        let json: BlockTemplateJson =
            serde_json::from_str(s).map_err(|e| TemplateError::Json(e.to_string()))?;
        Self::try_from(json)
    }

    /// Parse an already-decoded JSON value.
    pub fn from_json_value(value: serde_json::Value) -> Result<Self, TemplateError> {
        let json: BlockTemplateJson =
            serde_json::from_value(value).map_err(|e| TemplateError::Json(e.to_string()))?;
        Self::try_from(json)
    }

    /// Build the coinbase transaction, without its witness commitment output.
    pub fn coinbase(
        &self,
        reward_script: &Script,
        pool_id: Option<&[u8]>,
    ) -> Result<Transaction, TemplateError> {
        let mut script_sig = bip34_height_script(self.height)?;
        if let Some(id) = pool_id {
            append_push(&mut script_sig, id)?;
        }

        Ok(Transaction {
            version: transaction::Version::TWO,
            lock_time: LockTime::ZERO,
            input: vec![TxIn {
                previous_output: OutPoint::null(),
                script_sig,
                sequence: Sequence(COINBASE_SEQUENCE),
                witness: Witness::from_slice(&[WITNESS_RESERVED_VALUE]),
            }],
            output: vec![TxOut {
                value: self.coinbase_value,
                script_pubkey: reward_script.to_owned(),
            }],
        })
    }

    /// Assemble a candidate block.
    ///
    /// The header time is `block_time` (or the template's current time),
    /// raised to the template's minimum time. The nonce is zero.
    pub fn assemble(
        &self,
        reward_script: &Script,
        block_time: Option<u32>,
        pool_id: Option<&[u8]>,
    ) -> Result<Block, TemplateError> {
        if reward_script.is_empty() {
            return Err(TemplateError::EmptyRewardScript);
        }

        let mut txdata = Vec::with_capacity(self.transactions.len() + 1);
        txdata.push(self.coinbase(reward_script, pool_id)?);
        txdata.extend(self.transactions.iter().cloned());

        let mut block = Block {
            header: Header {
                version: self.version,
                prev_blockhash: self.previous_block_hash,
                merkle_root: TxMerkleNode::all_zeros(),
                time: block_time.unwrap_or(self.cur_time).max(self.min_time),
                bits: self.bits,
                nonce: 0,
            },
            txdata,
        };

        add_witness_commitment(&mut block);
        if let Some(root) = block.compute_merkle_root() {
            block.header.merkle_root = root;
        }
        Ok(block)
    }
}
