//! Reorganization: switching to a heavier branch across a snapshot
//! boundary, reversibility of connect/disconnect, and agreement with a
//! fresh node that only ever saw the winning chain.

mod common;

use common::{build_qpos_chain, Harness};
use quill_core::Encodable;

/// Mirror a harness's accepted blocks into a fresh node.
fn mirror(h: &Harness) -> Harness {
    let mut other = Harness::new(h.params.clone());
    other.staker_keys = h.staker_keys.clone();
    for block in &h.blocks {
        other.feed_block(block).expect("mirrored block accepted");
    }
    other
}

#[test]
fn reorg_across_snapshot_boundary() {
    // main chain: G .. height 13; the boundary snapshot at 12 was written
    // while block 13 connected (4-block cadence)
    let mut chain = build_qpos_chain();
    for _ in 0..6 {
        chain.harness.produce_qpos(Vec::new());
    }
    let mut h1 = chain.harness;
    assert_eq!(h1.state.best_height(), 13);
    assert!(h1
        .state
        .db
        .registry_snapshot_is_viable(12)
        .unwrap());

    // a second node on the shared prefix
    let mut h2 = mirror(&h1);
    assert_eq!(h2.state.best_hash(), h1.state.best_hash());

    // h1 extends with D; h2 builds the heavier D' - E'
    let t = h1.next_qpos_time(0);
    h1.produce_qpos_at(t, Vec::new()).unwrap();
    let d_hash = h1.state.best_hash();

    let t2 = h2.next_qpos_time(1);
    h2.produce_qpos_at(t2, Vec::new()).unwrap();
    h2.produce_qpos(Vec::new());
    assert_ne!(h2.state.best_hash(), d_hash);

    // feed the winning branch into h1: first block parks as a side chain,
    // the second triggers the reorganization
    let branch: Vec<_> = h2.blocks[h2.blocks.len() - 2..].to_vec();
    h1.feed_block(&branch[0]).unwrap();
    assert_eq!(h1.state.best_hash(), d_hash, "equal trust keeps the tip");
    h1.feed_block(&branch[1]).unwrap();

    assert_eq!(h1.state.best_hash(), h2.state.best_hash());
    assert_eq!(h1.state.best_height(), h2.state.best_height());
    assert_eq!(
        h1.state.registry.to_bytes(),
        h2.state.registry.to_bytes(),
        "registry state identical after reorg"
    );

    // the abandoned block's transactions are gone from the index
    let d_block = h1
        .blocks
        .iter()
        .find(|b| b.hash(&h1.params) == d_hash)
        .unwrap();
    assert_eq!(
        h1.state.db.read_tx_index(&d_block.vtx[0].txid()).unwrap(),
        None
    );

    // a fresh node that only saw the winning chain fully agrees
    let h3 = mirror(&h2);
    assert_eq!(h3.state.best_hash(), h1.state.best_hash());
    assert_eq!(h3.state.registry.to_bytes(), h1.state.registry.to_bytes());
    for block in &h3.blocks {
        for tx in &block.vtx {
            assert_eq!(
                h1.state.db.read_tx_index(&tx.txid()).unwrap(),
                h3.state.db.read_tx_index(&tx.txid()).unwrap(),
                "tx index entries agree after reorg"
            );
        }
    }
}

#[test]
fn connect_then_disconnect_restores_state() {
    let mut chain = build_qpos_chain();
    for _ in 0..3 {
        chain.harness.produce_qpos(Vec::new());
    }
    let h = &mut chain.harness;

    let tip = h.state.best.unwrap();
    let parent = h.state.index.entry(tip).prev.unwrap();
    let parent_hash = h.state.index.entry(parent).hash;
    let tip_hash = h.state.index.entry(tip).hash;
    let tip_block = h.state.read_block(tip).unwrap();

    // snapshot of the affected index entries before the round trip
    let parent_registry = h.state.rewind_registry(parent).unwrap();
    let spent_before: Vec<_> = tip_block
        .vtx
        .iter()
        .map(|tx| h.state.db.read_tx_index(&tx.txid()).unwrap())
        .collect();

    // roll back one block
    h.state.set_best_chain(parent).unwrap();
    assert_eq!(h.state.best_hash(), parent_hash);
    assert_eq!(h.state.db.read_best_chain().unwrap(), Some(parent_hash));
    assert_eq!(
        h.state.registry.to_bytes(),
        parent_registry.to_bytes(),
        "registry equals the replayed fork-point state"
    );
    for tx in &tip_block.vtx {
        assert_eq!(h.state.db.read_tx_index(&tx.txid()).unwrap(), None);
    }

    // and forward again
    h.state.set_best_chain(tip).unwrap();
    assert_eq!(h.state.best_hash(), tip_hash);
    let spent_after: Vec<_> = tip_block
        .vtx
        .iter()
        .map(|tx| h.state.db.read_tx_index(&tx.txid()).unwrap())
        .collect();
    assert_eq!(spent_before, spent_after);
}

#[test]
fn bootstrap_verification_passes_at_high_level() {
    let mut chain = build_qpos_chain();
    for _ in 0..6 {
        chain.harness.produce_qpos(Vec::new());
    }
    let expected_tip = chain.harness.state.best_hash();
    let common::QposChain { harness, .. } = chain;
    let common::Harness { dir, params, state, .. } = harness;
    drop(state);

    let mut reloaded = quill_chain::ChainState::open(params, dir.path()).unwrap();
    reloaded
        .load_block_index(
            &quill_chain::ManualClock::new(i64::MAX / 2),
            &quill_chain::ShutdownFlag::new(),
            6,
            0,
        )
        .unwrap();
    assert_eq!(reloaded.best_hash(), expected_tip, "level-6 verification holds");
}
