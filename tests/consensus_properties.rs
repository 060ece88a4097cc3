//! Consensus property tests: verification of the safety and determinism
//! invariants the chain relies on, using only the public API.
//!
//! Properties verified:
//! - **Committee**: pure function of the registry snapshot, weight-ordered,
//!   clamped, never includes zero-weight validators
//! - **Proposers**: round-robin over the committee by height and round
//! - **Quorum**: ≥2/3 of committee weight, rounding up; duplicates count once
//! - **Transactions**: strict nonce sequencing, fee credited to the proposer

use tally::consensus::approval::{Approval, ApprovalAggregator, ApprovalOutcome};
use tally::consensus::block::BlockHash;
use tally::consensus::committee::{quorum_weight, select_committee, Committee};
use tally::consensus::schedule::{current_proposer, epoch_of, is_epoch_end, proposer_for};
use tally::consensus::ConsensusError;
use tally::constants;
use tally::crypto::keys::SigningKeypair;
use tally::genesis::{ConsensusParams, GenesisConfig};
use tally::registry::ValidatorRegistry;
use tally::state::StateError;
use tally::transaction::Transaction;
use tally::Address;

// ── Helpers ─────────────────────────────────────────────────────────────

fn test_chain_id() -> tally::Hash {
    tally::hash_domain(b"test.chain", &[0u8; 32])
}

/// Keypairs and a registry holding each of them with the given stake.
fn registry_with(stakes: &[u64]) -> (Vec<SigningKeypair>, ValidatorRegistry) {
    let mut registry = ValidatorRegistry::new();
    let keys: Vec<SigningKeypair> = stakes.iter().map(|_| SigningKeypair::generate()).collect();
    for (kp, &stake) in keys.iter().zip(stakes) {
        registry
            .register(kp.address(), kp.public.clone(), stake, 0)
            .unwrap();
    }
    (keys, registry)
}

fn approve(kp: &SigningKeypair, block: BlockHash, height: u64) -> Approval {
    Approval::sign(kp, &test_chain_id(), block, height, 0)
}

// ── Committee selection ────────────────────────────────────────────────

#[test]
fn committee_is_a_pure_function_of_the_registry() {
    let keys: Vec<SigningKeypair> = (0..8).map(|_| SigningKeypair::generate()).collect();
    let stakes = [50u64, 10, 10, 70, 30, 10, 90, 20];

    let mut forward = ValidatorRegistry::new();
    for (kp, &stake) in keys.iter().zip(&stakes) {
        forward.register(kp.address(), kp.public.clone(), stake, 0).unwrap();
    }
    let mut reverse = ValidatorRegistry::new();
    for (kp, &stake) in keys.iter().zip(&stakes).rev() {
        reverse.register(kp.address(), kp.public.clone(), stake, 0).unwrap();
    }

    let a = select_committee(&forward, 5, 3);
    let b = select_committee(&reverse, 5, 3);
    assert_eq!(a, b);
    assert_eq!(a.hash(), b.hash());
    assert_eq!(forward.root(), reverse.root());
}

#[test]
fn committee_orders_by_weight_then_address() {
    let (_, registry) = registry_with(&[10, 30, 10, 20, 10]);
    let committee = select_committee(&registry, 4, 0);
    let weights: Vec<u64> = committee.members.iter().map(|m| m.weight).collect();
    assert_eq!(weights, vec![30, 20, 10, 10]);
    // Equal weights are broken by ascending address.
    assert!(committee.members[2].address < committee.members[3].address);
}

#[test]
fn committee_size_is_clamped_and_shrinks_to_eligible() {
    let (keys, mut registry) = registry_with(&[10, 10, 0]);
    assert_eq!(select_committee(&registry, 0, 0).len(), 1);
    // The zero-stake validator is never eligible.
    assert_eq!(select_committee(&registry, 21, 0).len(), 2);

    registry.deactivate(&keys[0].address()).unwrap();
    let committee = select_committee(&registry, 21, 0);
    assert_eq!(committee.addresses(), vec![keys[1].address()]);
}

#[test]
fn params_clamp_committee_size() {
    let params = ConsensusParams {
        max_committee_size: 100,
        ..ConsensusParams::default()
    };
    assert_eq!(params.committee_size(), constants::MAX_COMMITTEE_SIZE);
    let params = ConsensusParams {
        max_committee_size: 0,
        ..ConsensusParams::default()
    };
    assert_eq!(params.committee_size(), 1);
}

// ── Proposer schedule ──────────────────────────────────────────────────

#[test]
fn two_member_committee_alternates_proposers() {
    let (_, registry) = registry_with(&[1, 1]);
    let committee = select_committee(&registry, 2, 0);
    let members = committee.addresses();
    assert_eq!(current_proposer(&committee, 0), Some(members[0]));
    assert_eq!(current_proposer(&committee, 1), Some(members[1]));
    assert_eq!(current_proposer(&committee, 2), Some(members[0]));
}

#[test]
fn later_rounds_move_to_the_next_member() {
    let (_, registry) = registry_with(&[5, 4, 3]);
    let committee = select_committee(&registry, 3, 0);
    let members = committee.addresses();
    for height in 0..6u64 {
        for round in 0..4u32 {
            let expected = members[((height as usize % 3) + (round as usize % 3)) % 3];
            assert_eq!(proposer_for(&committee, height, round), Some(expected));
        }
    }
    let empty = Committee {
        epoch: 0,
        members: vec![],
    };
    assert_eq!(proposer_for(&empty, 1, 0), None);
}

#[test]
fn epoch_boundaries() {
    assert_eq!(epoch_of(0, 10), 0);
    assert_eq!(epoch_of(9, 10), 0);
    assert_eq!(epoch_of(10, 10), 1);
    assert!(is_epoch_end(9, 10));
    assert!(!is_epoch_end(10, 10));
}

// ── Quorum ─────────────────────────────────────────────────────────────

#[test]
fn quorum_is_two_thirds_rounded_up() {
    for total in 1u128..=100 {
        let q = quorum_weight(total);
        assert!(3 * q >= 2 * total, "quorum {} too small for {}", q, total);
        assert!(3 * (q - 1) < 2 * total, "quorum {} too large for {}", q, total);
    }
}

#[test]
fn three_equal_members_need_two_approvals() {
    let (keys, registry) = registry_with(&[1, 1, 1]);
    let committee = select_committee(&registry, 3, 0);
    let mut agg = ApprovalAggregator::new(test_chain_id(), 0);
    let block = BlockHash([7u8; 32]);
    agg.track(block, 1, 0, committee).unwrap();

    let first = agg.add(approve(&keys[0], block, 1), &registry).unwrap();
    assert_eq!(first, ApprovalOutcome::Pending { weight: 1, quorum: 2 });

    let second = agg.add(approve(&keys[1], block, 1), &registry).unwrap();
    match second {
        ApprovalOutcome::Quorum(cert) => {
            assert_eq!(cert.approvals.len(), 2);
            assert!(cert.verify(&select_committee(&registry, 3, 0), &registry, &test_chain_id()).is_ok());
        }
        other => panic!("expected quorum, got {:?}", other),
    }
}

#[test]
fn duplicate_approvals_count_once() {
    let (keys, registry) = registry_with(&[1, 1, 1, 1]);
    let committee = select_committee(&registry, 4, 0);
    let mut agg = ApprovalAggregator::new(test_chain_id(), 0);
    let block = BlockHash([3u8; 32]);
    agg.track(block, 1, 0, committee).unwrap();

    let approval = approve(&keys[0], block, 1);
    assert!(matches!(
        agg.add(approval.clone(), &registry).unwrap(),
        ApprovalOutcome::Pending { weight: 1, .. }
    ));
    for _ in 0..5 {
        assert_eq!(agg.add(approval.clone(), &registry).unwrap(), ApprovalOutcome::Duplicate);
    }
    assert_eq!(agg.weight(&block), Some(1));
}

#[test]
fn outsiders_and_forged_approvals_are_rejected() {
    let (keys, registry) = registry_with(&[5, 5, 1]);
    let committee = select_committee(&registry, 2, 0);
    let outsider = committee
        .addresses()
        .iter()
        .all(|a| *a != keys[2].address());
    assert!(outsider);

    let mut agg = ApprovalAggregator::new(test_chain_id(), 0);
    let block = BlockHash([1u8; 32]);
    agg.track(block, 1, 0, committee.clone()).unwrap();

    assert_eq!(
        agg.add(approve(&keys[2], block, 1), &registry),
        Err(ConsensusError::NotCommitteeMember(keys[2].address()))
    );

    let member = keys
        .iter()
        .find(|k| committee.contains(&k.address()))
        .unwrap();
    let other_chain = Approval::sign(member, &[9u8; 32], block, 1, 0);
    assert_eq!(agg.add(other_chain, &registry), Err(ConsensusError::BadSignature));
}

#[test]
fn conflicting_approvals_are_kept_as_evidence() {
    let (keys, registry) = registry_with(&[1, 1, 1, 1]);
    let committee = select_committee(&registry, 4, 0);
    let mut agg = ApprovalAggregator::new(test_chain_id(), 0);
    let a = BlockHash([1u8; 32]);
    let b = BlockHash([2u8; 32]);
    agg.track(a, 1, 0, committee.clone()).unwrap();
    agg.track(b, 1, 0, committee).unwrap();

    agg.add(approve(&keys[0], a, 1), &registry).unwrap();
    assert!(agg.add(approve(&keys[0], b, 1), &registry).is_err());
    assert_eq!(agg.equivocations().len(), 1);
    assert_eq!(agg.equivocations()[0].validator, keys[0].address());
    assert_eq!(agg.weight(&b), Some(0));
}

#[test]
fn finalized_heights_without_a_record_reject_approvals() {
    let (keys, registry) = registry_with(&[1, 1, 1]);
    let committee = select_committee(&registry, 3, 0);
    let mut agg = ApprovalAggregator::new(test_chain_id(), 0);
    let block = BlockHash([4u8; 32]);
    agg.track(block, 1, 0, committee).unwrap();
    agg.mark_finalized(1);
    assert_eq!(
        agg.add(approve(&keys[0], block, 1), &registry),
        Err(ConsensusError::HeightAlreadyFinalized(1))
    );
}

// ── Transactions and state ─────────────────────────────────────────────

fn funded_state(accounts: &[(Address, u64)]) -> (tally::state::ChainState, tally::Hash) {
    let validator = SigningKeypair::generate();
    let genesis = GenesisConfig::new(
        "properties",
        1_000,
        accounts,
        &[(validator.public.clone(), 100)],
        ConsensusParams::default(),
    );
    (genesis.build_state().unwrap(), genesis.chain_id().unwrap())
}

#[test]
fn nonces_must_be_strictly_sequential() {
    let alice = SigningKeypair::generate();
    let (mut state, chain_id) = funded_state(&[(alice.address(), 100)]);
    let bob = Address([2u8; 32]);

    let skipped = Transaction::transfer(&alice, bob, 1, 1, 2, chain_id);
    assert!(matches!(
        state.check_transaction(&skipped),
        Err(StateError::NonceTooHigh { expected: 1, got: 2 })
    ));

    let first = Transaction::transfer(&alice, bob, 1, 1, 1, chain_id);
    state.apply_transaction(&first, &bob).unwrap();
    assert!(matches!(
        state.check_transaction(&first),
        Err(StateError::NonceTooLow { expected: 2, got: 1 })
    ));
    assert!(state.check_transaction(&skipped).is_ok());
}

#[test]
fn transfer_scenario_credits_fee_to_proposer() {
    let a = SigningKeypair::generate();
    let b = Address([0xbb; 32]);
    let proposer = Address([0xcc; 32]);
    let (mut state, chain_id) = funded_state(&[(a.address(), 100)]);

    let tx = Transaction::transfer(&a, b, 10, 1, 1, chain_id);
    state.apply_transaction(&tx, &proposer).unwrap();

    assert_eq!(state.accounts().balance(&a.address()), 89);
    assert_eq!(state.accounts().nonce(&a.address()), 1);
    assert_eq!(state.accounts().balance(&b), 10);
    assert_eq!(state.accounts().balance(&proposer), 1);
}

#[test]
fn overspending_is_rejected_without_side_effects() {
    let a = SigningKeypair::generate();
    let (mut state, chain_id) = funded_state(&[(a.address(), 100)]);
    let root = state.state_root();

    let tx = Transaction::transfer(&a, Address([1u8; 32]), 100, 1, 1, chain_id);
    assert!(matches!(
        state.apply_transaction(&tx, &Address([2u8; 32])),
        Err(StateError::InsufficientBalance { needed: 101, available: 100 })
    ));
    assert_eq!(state.state_root(), root);
}
