//! Control loop against an in-memory node.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use bitcoin::hashes::Hash;
use bitcoin::{BlockHash, ScriptBuf};

use signet_core::difficulty::check_pow;
use signet_core::script::is_witness_commitment;
use signet_miner::config::MinerConfig;
use signet_miner::error::MinerError;
use signet_miner::generator::Generator;
use signet_miner::scheduler::ChainTip;
use signet_tests::helpers::*;

fn genesis_tip() -> ChainTip {
    ChainTip {
        height: 0,
        hash: BlockHash::from_byte_array([0x99; 32]),
        bits: EASY_BITS,
        time: 1_000_000,
    }
}

/// Tip far enough in the past that every block is already due.
fn old_tip(height: u64) -> ChainTip {
    ChainTip {
        height,
        hash: BlockHash::from_byte_array([0x77; 32]),
        bits: EASY_BITS,
        time: 1_000_000,
    }
}

fn generator(node: &Arc<MockNode>, config: MinerConfig) -> Generator {
    Generator::new(node.clone(), config).unwrap()
}

#[tokio::test]
async fn mines_a_chain_from_genesis() {
    let node = Arc::new(MockNode::new(genesis_tip()));
    let produced = generator(&node, MinerConfig::new(op_true()))
        .run(Some(3))
        .await
        .unwrap();
    assert_eq!(produced, 3);

    let blocks = node.submitted();
    assert_eq!(blocks.len(), 3);
    assert_eq!(blocks[0].header.prev_blockhash, genesis_tip().hash);
    for pair in blocks.windows(2) {
        assert_eq!(pair[1].header.prev_blockhash, pair[0].block_hash());
        assert!(pair[1].header.time > pair[0].header.time);
    }
    for block in &blocks {
        assert!(check_pow(&block.header).unwrap());
        assert!(block.check_merkle_root());
        assert!(block.check_witness_commitment());
        let last = &block.txdata[0].output.last().unwrap().script_pubkey;
        assert!(is_witness_commitment(last));
        assert!(last.as_bytes().ends_with(&[0xec, 0xc7, 0xda, 0xa2, 0x00, 0x00]));
    }
    assert_eq!(node.tip().height, 3);
}

#[tokio::test]
async fn signer_solution_is_embedded() {
    let node = Arc::new(MockNode::new(old_tip(10)).with_signer(SignerScript {
        script_sig: ScriptBuf::from_bytes(vec![0x01, 0x02, 0x03]),
        witness: vec![vec![0xaa; 4]],
        ..SignerScript::default()
    }));
    generator(&node, MinerConfig::new(op_true())).run(Some(1)).await.unwrap();

    let block = &node.submitted()[0];
    let last = block.txdata[0].output.last().unwrap().script_pubkey.as_bytes();
    assert!(last.ends_with(&[
        0xec, 0xc7, 0xda, 0xa2, 0x03, 0x01, 0x02, 0x03, 0x01, 0x04, 0xaa, 0xaa, 0xaa, 0xaa
    ]));
}

#[tokio::test]
async fn fixed_block_time_mines_one_block() {
    let node = Arc::new(MockNode::new(old_tip(10)));
    let mut config = MinerConfig::new(op_true());
    config.scheduler.set_block_time = Some(1_500_000);
    let max = config.effective_max_blocks();
    let produced = generator(&node, config).run(max).await.unwrap();
    assert_eq!(produced, 1);
    assert_eq!(node.submitted()[0].header.time, 1_500_000);
}

#[tokio::test]
async fn stale_template_is_retried() {
    let node = Arc::new(MockNode::new(old_tip(10)).with_stale_templates(1));
    let produced = generator(&node, MinerConfig::new(op_true())).run(Some(1)).await.unwrap();
    assert_eq!(produced, 1);
    assert_eq!(node.submitted()[0].header.prev_blockhash, old_tip(10).hash);
}

#[tokio::test]
async fn incomplete_signature_is_skipped() {
    let node = Arc::new(MockNode::new(old_tip(10)).with_signer(SignerScript {
        incomplete: 1,
        ..SignerScript::default()
    }));
    let produced = generator(&node, MinerConfig::new(op_true())).run(Some(1)).await.unwrap();
    assert_eq!(produced, 1);
    assert_eq!(node.sign_requests(), 2);
}

#[tokio::test]
async fn rejected_submission_is_not_fatal() {
    let node = Arc::new(MockNode::new(old_tip(10)).with_rejection("duplicate"));
    let produced = generator(&node, MinerConfig::new(op_true())).run(Some(2)).await.unwrap();
    assert_eq!(produced, 2);
    assert_eq!(node.submitted().len(), 2);
    assert_eq!(node.tip().height, 10);
}

#[tokio::test]
async fn malformed_template_stops_the_loop() {
    let node = Arc::new(MockNode::new(old_tip(10)).with_broken_template());
    let err = generator(&node, MinerConfig::new(op_true())).run(Some(1)).await.unwrap_err();
    assert!(matches!(err, MinerError::MalformedTemplate(_)));
    assert!(node.submitted().is_empty());
}

#[test]
fn invalid_config_rejected() {
    let node = Arc::new(MockNode::new(old_tip(10)));
    assert!(matches!(
        Generator::new(node, MinerConfig::new(ScriptBuf::new())),
        Err(MinerError::Config(_))
    ));
}

#[tokio::test]
async fn shutdown_interrupts_a_running_solve() {
    // Mainnet-level difficulty: the solve cannot finish within the test.
    let node = Arc::new(MockNode::new(old_tip(10)).with_template_bits(0x1b00_ffff));
    let generator = generator(&node, MinerConfig::new(op_true()));
    let running = generator.running_flag();

    // Single-threaded runtime: this timer only fires if the solve runs off
    // the async thread.
    let stopper = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        running.store(false, Ordering::Relaxed);
    });

    let produced = tokio::time::timeout(Duration::from_secs(60), generator.run(None))
        .await
        .expect("run returns after shutdown")
        .unwrap();
    stopper.await.unwrap();
    assert_eq!(produced, 0);
    assert!(node.submitted().is_empty());
    assert_eq!(node.sign_requests(), 1);
}

#[tokio::test]
async fn cleared_flag_stops_before_polling() {
    let node = Arc::new(MockNode::new(old_tip(10)));
    let generator = generator(&node, MinerConfig::new(op_true()));
    generator.running_flag().store(false, Ordering::Relaxed);
    assert_eq!(generator.run(None).await.unwrap(), 0);
    assert_eq!(node.sign_requests(), 0);
}
