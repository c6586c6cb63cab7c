//! Criterion benchmarks for block finalization.
//!
//! Covers: brute-force solving at an easy target, envelope packing and the
//! full finish step.

use criterion::{black_box, criterion_group, criterion_main, Criterion};

use bitcoin::absolute::LockTime;
use bitcoin::block::{Header, Version};
use bitcoin::hashes::Hash;
use bitcoin::{
    transaction, Amount, Block, BlockHash, CompactTarget, OutPoint, ScriptBuf, Sequence,
    Transaction, TxIn, TxMerkleNode, TxOut, Txid, Witness,
};

use signet_core::constants::WITNESS_RESERVED_VALUE;
use signet_core::script::add_witness_commitment;
use signet_miner::commitment::{ChallengeScript, ExtensionSignal};
use signet_miner::envelope::pack;
use signet_miner::finalize::{finish, BruteForce, ProofOfWorkSolver};

/// One in 16 nonces meets this target.
const BENCH_BITS: u32 = 0x200f_ffff;

fn sample_block(tx_count: usize) -> Block {
    let coinbase = Transaction {
        version: transaction::Version::TWO,
        lock_time: LockTime::ZERO,
        input: vec![TxIn {
            previous_output: OutPoint::null(),
            script_sig: ScriptBuf::from_bytes(vec![0x02, 0xe8, 0x03]),
            sequence: Sequence(0xffff_fffe),
            witness: Witness::from_slice(&[WITNESS_RESERVED_VALUE]),
        }],
        output: vec![TxOut {
            value: Amount::from_sat(5_000_000_000),
            script_pubkey: ScriptBuf::from_bytes(vec![0x51]),
        }],
    };
    let spend = Transaction {
        version: transaction::Version::TWO,
        lock_time: LockTime::ZERO,
        input: vec![TxIn {
            previous_output: OutPoint::new(Txid::from_byte_array([0x11; 32]), 0),
            script_sig: ScriptBuf::new(),
            sequence: Sequence(0xffff_fffd),
            witness: Witness::from_slice(&[vec![0x30; 72], vec![0x02; 33]]),
        }],
        output: vec![TxOut {
            value: Amount::from_sat(10_000),
            script_pubkey: ScriptBuf::from_bytes(vec![0x00; 22]),
        }],
    };
    let mut txdata = vec![coinbase];
    txdata.extend(std::iter::repeat_n(spend, tx_count));
    let mut block = Block {
        header: Header {
            version: Version::from_consensus(0x2000_0000),
            prev_blockhash: BlockHash::from_byte_array([0xAA; 32]),
            merkle_root: TxMerkleNode::all_zeros(),
            time: 1_700_000_000,
            bits: CompactTarget::from_consensus(BENCH_BITS),
            nonce: 0,
        },
        txdata,
    };
    add_witness_commitment(&mut block);
    block
}

fn bench_brute_force(c: &mut Criterion) {
    let header = sample_block(0).header;
    c.bench_function("brute_force_easy", |b| {
        b.iter(|| BruteForce.solve(black_box(&header)))
    });
}

fn bench_pack(c: &mut Criterion) {
    let block = sample_block(200);
    let challenge = ChallengeScript::new(ScriptBuf::from_bytes(vec![0x51])).unwrap();
    let signal = ExtensionSignal::default();
    c.bench_function("pack_200", |b| {
        b.iter(|| pack(black_box(&block), &challenge, &signal))
    });
}

fn bench_finish(c: &mut Criterion) {
    let block = sample_block(200);
    c.bench_function("finish_200", |b| {
        b.iter(|| finish(black_box(block.clone()), &[0x00, 0x00], &BruteForce))
    });
}

criterion_group!(benches, bench_brute_force, bench_pack, bench_finish);
criterion_main!(benches);
