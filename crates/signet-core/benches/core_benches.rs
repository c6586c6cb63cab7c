//! Criterion benchmarks for signet-core hot paths.
//!
//! Covers: proof-of-work checks, compact target encoding, and block assembly.

use criterion::{black_box, criterion_group, criterion_main, Criterion};

use bitcoin::absolute::LockTime;
use bitcoin::block::{Header, Version};
use bitcoin::hashes::Hash;
use bitcoin::{
    transaction, Amount, BlockHash, CompactTarget, OutPoint, ScriptBuf, Sequence, Transaction,
    TxIn, TxMerkleNode, TxOut, Txid, Witness,
};
use primitive_types::U256;

use signet_core::difficulty::{check_pow, nbits_to_target, target_to_nbits};
use signet_core::template::BlockTemplate;

fn sample_header() -> Header {
    Header {
        version: Version::from_consensus(0x2000_0000),
        prev_blockhash: BlockHash::from_byte_array([0xAA; 32]),
        merkle_root: TxMerkleNode::from_byte_array([0xBB; 32]),
        time: 1_700_000_000,
        bits: CompactTarget::from_consensus(0x1e0377ae),
        nonce: 42,
    }
}

fn sample_template(tx_count: usize) -> BlockTemplate {
    let tx = Transaction {
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
    BlockTemplate {
        version: Version::from_consensus(0x2000_0000),
        previous_block_hash: BlockHash::from_byte_array([0xAA; 32]),
        height: 100_000,
        min_time: 1_700_000_000,
        cur_time: 1_700_000_000,
        bits: CompactTarget::from_consensus(0x1e0377ae),
        coinbase_value: Amount::from_sat(5_000_000_000),
        challenge: ScriptBuf::from_bytes(vec![0x51]),
        transactions: vec![tx; tx_count],
    }
}

fn bench_check_pow(c: &mut Criterion) {
    let header = sample_header();
    c.bench_function("check_pow", |b| b.iter(|| check_pow(black_box(&header))));
}

fn bench_compact(c: &mut Criterion) {
    let target = nbits_to_target(0x1e0377ae).unwrap() + U256::one();
    c.bench_function("target_to_nbits", |b| b.iter(|| target_to_nbits(black_box(target))));
}

fn bench_assemble(c: &mut Criterion) {
    let reward = ScriptBuf::from_bytes(vec![0x51]);
    let mut group = c.benchmark_group("assemble");
    for n in [1usize, 256, 2048] {
        let template = sample_template(n);
        group.bench_function(format!("{n}_txs"), |b| {
            b.iter(|| black_box(&template).assemble(&reward, None, None))
        });
    }
    group.finish();
}

criterion_group!(benches, bench_check_pow, bench_compact, bench_assemble);
criterion_main!(benches);
