//! Shared test helpers: fixtures and an in-memory node.

use std::sync::Mutex;

use async_trait::async_trait;
use bitcoin::absolute::LockTime;
use bitcoin::block::{Header, Version};
use bitcoin::consensus::encode::serialize_hex;
use bitcoin::hashes::Hash;
use bitcoin::script::Builder;
use bitcoin::{
    transaction, Amount, Block, BlockHash, CompactTarget, OutPoint, ScriptBuf, Sequence,
    Transaction, TxIn, TxMerkleNode, TxOut, Txid, Witness,
};

use signet_core::constants::WITNESS_RESERVED_VALUE;
use signet_core::script::{add_witness_commitment, append_push};
use signet_core::template::BlockTemplate;
use signet_miner::commitment::ChallengeScript;
use signet_miner::envelope::Envelope;
use signet_miner::error::MinerError;
use signet_miner::rpc::{NodeRpc, ProcessedEnvelope};
use signet_miner::scheduler::ChainTip;

/// Compact target every nonce nearly satisfies.
pub const EASY_BITS: u32 = 0x207f_ffff;

/// `OP_TRUE` challenge: any solution satisfies it.
pub const TRUE_CHALLENGE: &str = "51";

pub fn op_true() -> ScriptBuf {
    ScriptBuf::from_bytes(vec![0x51])
}

/// 1-of-1 multisig shaped challenge over a fixed key.
pub fn multisig_challenge() -> ChallengeScript {
    let mut script = vec![0x51, 0x21, 0x02];
    script.extend_from_slice(&[0xaa; 32]);
    script.extend_from_slice(&[0x51, 0xae]);
    ChallengeScript::new(ScriptBuf::from_bytes(script)).expect("non-empty")
}

/// Deterministic non-coinbase transaction.
pub fn make_tx(seed: u8) -> Transaction {
    Transaction {
        version: transaction::Version::TWO,
        lock_time: LockTime::ZERO,
        input: vec![TxIn {
            previous_output: OutPoint::new(Txid::from_byte_array([seed; 32]), u32::from(seed)),
            script_sig: ScriptBuf::new(),
            sequence: Sequence(0xffff_fffd),
            witness: Witness::from_slice(&[vec![0x30; 71], vec![0x02; 33]]),
        }],
        output: vec![TxOut {
            value: Amount::from_sat(1_000 + u64::from(seed)),
            script_pubkey: ScriptBuf::from_bytes(vec![0x00, 0x14, seed, seed, seed]),
        }],
    }
}

/// A getblocktemplate reply on top of `prev`.
pub fn template_json(
    prev: &BlockHash,
    height: u64,
    min_time: u32,
    bits: u32,
    challenge_hex: &str,
    transactions: &[Transaction],
) -> serde_json::Value {
    let txs: Vec<serde_json::Value> = transactions
        .iter()
        .map(|tx| {
            serde_json::json!({
                "data": serialize_hex(tx),
                "txid": tx.compute_txid().to_string(),
            })
        })
        .collect();
    serde_json::json!({
        "version": 0x2000_0000,
        "previousblockhash": prev.to_string(),
        "height": height,
        "mintime": min_time,
        "curtime": min_time,
        "bits": format!("{bits:08x}"),
        "coinbasevalue": 5_000_000_000u64,
        "signet_challenge": challenge_hex,
        "transactions": txs,
    })
}

pub fn make_template(prev: &BlockHash, height: u64, min_time: u32, challenge_hex: &str) -> BlockTemplate {
    BlockTemplate::from_json_value(template_json(
        prev,
        height,
        min_time,
        EASY_BITS,
        challenge_hex,
        &[make_tx(1), make_tx(2)],
    ))
    .expect("valid template")
}

/// Block with an assembled-looking coinbase, including its witness
/// commitment, and `extra` further transactions.
pub fn make_block(extra: u8) -> Block {
    let mut coinbase_script = Builder::new().push_int(7).into_script();
    append_push(&mut coinbase_script, b"test").expect("short push");
    let coinbase = Transaction {
        version: transaction::Version::TWO,
        lock_time: LockTime::ZERO,
        input: vec![TxIn {
            previous_output: OutPoint::null(),
            script_sig: coinbase_script,
            sequence: Sequence(0xffff_fffe),
            witness: Witness::from_slice(&[WITNESS_RESERVED_VALUE]),
        }],
        output: vec![TxOut {
            value: Amount::from_sat(5_000_000_000),
            script_pubkey: op_true(),
        }],
    };
    let mut txdata = vec![coinbase];
    txdata.extend((0..extra).map(make_tx));
    let mut block = Block {
        header: Header {
            version: Version::from_consensus(0x2000_0000),
            prev_blockhash: BlockHash::from_byte_array([0x42; 32]),
            merkle_root: TxMerkleNode::all_zeros(),
            time: 1_700_000_000,
            bits: CompactTarget::from_consensus(EASY_BITS),
            nonce: 0,
        },
        txdata,
    };
    add_witness_commitment(&mut block);
    block.header.merkle_root = block.compute_merkle_root().expect("has coinbase");
    block
}

/// How the mock signer answers.
#[derive(Debug, Clone, Default)]
pub struct SignerScript {
    /// Number of initial requests answered as incomplete.
    pub incomplete: u32,
    pub script_sig: ScriptBuf,
    pub witness: Vec<Vec<u8>>,
}

#[derive(Debug, Default)]
struct NodeState {
    tip: Option<ChainTip>,
    stale_templates: u32,
    broken_template: bool,
    template_bits: Option<u32>,
    reject_reason: Option<String>,
    signer: SignerScript,
    sign_requests: u32,
    submitted: Vec<Block>,
}

/// In-memory node that extends its chain with every accepted block.
#[derive(Debug, Default)]
pub struct MockNode {
    state: Mutex<NodeState>,
}

impl MockNode {
    pub fn new(tip: ChainTip) -> Self {
        Self {
            state: Mutex::new(NodeState {
                tip: Some(tip),
                ..NodeState::default()
            }),
        }
    }

    /// Serve `n` templates built on the wrong parent before correct ones.
    pub fn with_stale_templates(self, n: u32) -> Self {
        self.state.lock().expect("lock").stale_templates = n;
        self
    }

    /// Serve templates missing required fields.
    pub fn with_broken_template(self) -> Self {
        self.state.lock().expect("lock").broken_template = true;
        self
    }

    /// Serve templates at this compact target instead of [`EASY_BITS`].
    pub fn with_template_bits(self, bits: u32) -> Self {
        self.state.lock().expect("lock").template_bits = Some(bits);
        self
    }

    /// Reject every submission with `reason`.
    pub fn with_rejection(self, reason: &str) -> Self {
        self.state.lock().expect("lock").reject_reason = Some(reason.to_string());
        self
    }

    pub fn with_signer(self, signer: SignerScript) -> Self {
        self.state.lock().expect("lock").signer = signer;
        self
    }

    pub fn submitted(&self) -> Vec<Block> {
        self.state.lock().expect("lock").submitted.clone()
    }

    pub fn sign_requests(&self) -> u32 {
        self.state.lock().expect("lock").sign_requests
    }

    pub fn tip(&self) -> ChainTip {
        self.state.lock().expect("lock").tip.clone().expect("tip")
    }
}

#[async_trait]
impl NodeRpc for MockNode {
    async fn best_block_hash(&self) -> Result<BlockHash, MinerError> {
        Ok(self.tip().hash)
    }

    async fn block_header(&self, hash: &BlockHash) -> Result<ChainTip, MinerError> {
        let tip = self.tip();
        if tip.hash != *hash {
            return Err(MinerError::Rpc(format!("unknown block {hash}")));
        }
        Ok(tip)
    }

    async fn block_template(&self) -> Result<serde_json::Value, MinerError> {
        let mut state = self.state.lock().expect("lock");
        if state.broken_template {
            return Ok(serde_json::json!({ "height": 1 }));
        }
        let tip = state.tip.clone().expect("tip");
        let prev = if state.stale_templates > 0 {
            state.stale_templates -= 1;
            BlockHash::from_byte_array([0xee; 32])
        } else {
            tip.hash
        };
        let bits = state.template_bits.unwrap_or(EASY_BITS);
        Ok(template_json(&prev, tip.height + 1, tip.time + 1, bits, TRUE_CHALLENGE, &[]))
    }

    async fn process_envelope(&self, envelope: &str) -> Result<ProcessedEnvelope, MinerError> {
        let mut state = self.state.lock().expect("lock");
        state.sign_requests += 1;
        if state.signer.incomplete > 0 {
            state.signer.incomplete -= 1;
            return Ok(ProcessedEnvelope {
                psbt: envelope.to_string(),
                complete: false,
            });
        }
        let mut env = Envelope::from_base64(envelope)?;
        env.set_final_script_sig(state.signer.script_sig.clone());
        if !state.signer.witness.is_empty() {
            env.set_final_script_witness(Witness::from_slice(&state.signer.witness));
        }
        Ok(ProcessedEnvelope {
            psbt: env.to_base64(),
            complete: true,
        })
    }

    async fn submit_block(&self, block: &Block) -> Result<(), MinerError> {
        let mut state = self.state.lock().expect("lock");
        state.submitted.push(block.clone());
        if let Some(reason) = state.reject_reason.clone() {
            return Err(MinerError::SubmissionRejected(reason));
        }
        let height = state.tip.as_ref().map_or(0, |t| t.height + 1);
        state.tip = Some(ChainTip {
            height,
            hash: block.block_hash(),
            bits: block.header.bits.to_consensus(),
            time: block.header.time,
        });
        Ok(())
    }

    async fn address_script(&self, _address: &str) -> Result<ScriptBuf, MinerError> {
        Ok(op_true())
    }
}
