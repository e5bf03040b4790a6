//! End-to-end stage scenarios.
//!
//! Drives the engine through whole stages and checks the ledger totals,
//! stage prices and balances that come out the other side, over both the
//! in-memory store and RocksDB.

use std::sync::Arc;

use stagetree_core::constants::{tokens, Amount, MAX_STAGE};
use stagetree_core::profile::{
    RewardProfile, PROFILE_FLAT_TWO_LEG, PROFILE_PRINCIPAL_SIXTY_TWO, PROFILE_TEN_LEG,
};
use stagetree_core::reward::leg_split;
use stagetree_core::traits::{BalanceStore, MatrixStore};
use stagetree_core::types::{OutboxEvent, OwnerId, RewardCategory};
use stagetree_engine::{Engine, EngineConfig};
use stagetree_node_lib::storage::RocksStore;
use stagetree_tests::helpers::{assert_invariants, fill, memory_engine, paid_by_beneficiary, stage_root, unit};

// ---------------------------------------------------------------------------
// Principal profile
// ---------------------------------------------------------------------------

#[test]
fn sixty_two_placements_complete_stage_one() {
    let (store, engine) = memory_engine(PROFILE_PRINCIPAL_SIXTY_TWO);
    fill(&engine, 1, 1, 62, "p");

    let root = stage_root(&engine, 1, 1).unwrap();
    assert!(root.position.is_completed());
    assert_eq!(root.position.legs_filled, 62);
    assert_eq!(root.completion_bonus_total, tokens(10_044));
    assert_eq!(root.next_stage_pool_total, tokens(3_100));
    assert_eq!(root.position.tranches_paid, 62 / 6);

    let next = stage_root(&engine, 1, 2).unwrap();
    assert_eq!(next.economy.unwrap().slot_price, tokens(3_100));
    assert_eq!(next.position.principal, root.position.id);
    assert_eq!(next.position.spawned_from, Some(root.position.id));

    assert_invariants(store.as_ref(), engine.profile(), &[OwnerId(1)]);
}

#[test]
fn sixty_first_placement_does_not_complete() {
    let (_store, engine) = memory_engine(PROFILE_PRINCIPAL_SIXTY_TWO);
    fill(&engine, 1, 1, 61, "p");
    let root = stage_root(&engine, 1, 1).unwrap();
    assert!(!root.position.is_completed());
    assert!(stage_root(&engine, 1, 2).is_none());
}

#[test]
fn pegged_stage_pays_fixed_share_per_leg() {
    let (store, engine) = memory_engine(PROFILE_PRINCIPAL_SIXTY_TWO);
    fill(&engine, 1, 1, 62, "p");
    for stage in 2..=7 {
        fill(&engine, 1, stage, 62, "p");
        assert!(stage_root(&engine, 1, stage).unwrap().position.is_completed(), "stage {stage}");
    }

    let eight = stage_root(&engine, 1, 8).unwrap();
    let economy = eight.economy.unwrap();
    assert_eq!(economy.slot_price, tokens(10_000_000));
    assert_eq!(economy.pegged_total, Some(tokens(10_000_000)));

    engine.place_unit(OwnerId(1), 8).unwrap();
    let mc = store
        .entries_for(eight.position.id)
        .unwrap()
        .into_iter()
        .find(|e| e.category == RewardCategory::CompletionBonus)
        .unwrap();
    // 161,290.32258064 tokens in minor-unit truncation.
    assert_eq!(mc.amount, 16_129_032_258_064);

    assert_invariants(store.as_ref(), engine.profile(), &[OwnerId(1)]);
}

#[test]
fn sixty_two_leg_lineage_climbs_to_max_stage() {
    let (store, engine) = memory_engine(PROFILE_PRINCIPAL_SIXTY_TWO);
    let projection =
        stagetree_core::simulation::project_stages(engine.profile(), tokens(1_000), MAX_STAGE).unwrap();

    fill(&engine, 1, 1, 62, "climb");
    for stage in 2..=MAX_STAGE {
        fill(&engine, 1, stage, 62, "climb");
        let root = stage_root(&engine, 1, stage).unwrap();
        assert!(root.position.is_completed(), "stage {stage}");
        assert_eq!(
            root.economy.unwrap().slot_price,
            projection.stages[(stage - 1) as usize].slot_price,
            "stage {stage}"
        );
    }

    let last = stage_root(&engine, 1, MAX_STAGE).unwrap();
    let economy = last.economy.clone().unwrap();
    assert!(economy.slot_price > u64::MAX as Amount, "stage {MAX_STAGE} price {}", economy.slot_price);
    assert_eq!(store.successor_of(last.position.id).unwrap(), None);
    assert!(store.roots_of(OwnerId(1), MAX_STAGE + 1).unwrap().is_empty());

    let per_leg = leg_split(engine.profile(), &economy, economy.slot_price).unwrap();
    let expected_company_side = per_leg.company_side_total().unwrap() * 62;
    let events = store.outbox_after(0, 100).unwrap();
    assert_eq!(events.len(), 1);
    assert!(matches!(
        &events[0].1,
        OutboxEvent::MaxStageCompleted { position, owner: OwnerId(1), company_side_total }
            if *position == last.position.id && *company_side_total == expected_company_side
    ));

    let paid = paid_by_beneficiary(store.as_ref(), &[OwnerId(1)]);
    let balance = store.balance(OwnerId(1)).unwrap();
    assert_eq!(balance, paid[&OwnerId(1)]);
    assert!(balance > u64::MAX as Amount);

    assert_invariants(store.as_ref(), engine.profile(), &[OwnerId(1)]);
}

#[test]
fn stage_prices_follow_the_pool_recurrence() {
    let (_store, engine) = memory_engine(PROFILE_PRINCIPAL_SIXTY_TWO);
    let projection = stagetree_core::simulation::project_stages(engine.profile(), tokens(1_000), 4).unwrap();
    fill(&engine, 1, 1, 62, "p");
    for stage in 2..=3 {
        fill(&engine, 1, stage, 62, "p");
    }
    for stage in 1..=4u32 {
        let root = stage_root(&engine, 1, stage).unwrap();
        assert_eq!(
            root.economy.unwrap().slot_price,
            projection.stages[(stage - 1) as usize].slot_price,
            "stage {stage}"
        );
    }
}

// ---------------------------------------------------------------------------
// Flat profiles
// ---------------------------------------------------------------------------

#[test]
fn flat_profile_climbs_to_the_last_stage() {
    let (store, engine) = memory_engine(PROFILE_FLAT_TWO_LEG);
    fill(&engine, 1, 1, 2, "f");
    for stage in 2..=MAX_STAGE {
        fill(&engine, 1, stage, 2, "f");
    }

    // 700 tokens at stage 2, then 35% of 2 x 700 = 490 at stage 3.
    assert_eq!(stage_root(&engine, 1, 2).unwrap().economy.unwrap().slot_price, tokens(700));
    assert_eq!(stage_root(&engine, 1, 3).unwrap().economy.unwrap().slot_price, tokens(490));

    let last = stage_root(&engine, 1, MAX_STAGE).unwrap();
    assert!(last.position.is_completed());
    assert!(store.roots_of(OwnerId(1), MAX_STAGE + 1).unwrap().is_empty());

    let events = store.outbox_after(0, 100).unwrap();
    assert_eq!(events.len(), 1);
    assert!(matches!(
        &events[0].1,
        OutboxEvent::MaxStageCompleted { position, owner: OwnerId(1), .. } if *position == last.position.id
    ));

    assert_invariants(store.as_ref(), engine.profile(), &[OwnerId(1)]);
}

#[test]
fn ten_leg_profile_credits_three_levels() {
    let (store, engine) = memory_engine(PROFILE_TEN_LEG);
    fill(&engine, 1, 1, 9, "t");
    assert!(!stage_root(&engine, 1, 1).unwrap().position.is_completed());
    fill(&engine, 1, 1, 1, "t-last");
    let root = stage_root(&engine, 1, 1).unwrap();
    assert!(root.position.is_completed());
    assert_eq!(root.completion_bonus_total, tokens(150) * 10);
    assert_eq!(stage_root(&engine, 1, 2).unwrap().economy.unwrap().slot_price, tokens(3_500));
    assert_invariants(store.as_ref(), engine.profile(), &[OwnerId(1)]);
}

// ---------------------------------------------------------------------------
// Balances and idempotency
// ---------------------------------------------------------------------------

#[test]
fn balances_match_paid_entries() {
    let (store, engine) = memory_engine(PROFILE_PRINCIPAL_SIXTY_TWO);
    for owner in 1..=3 {
        fill(&engine, owner, 1, 20 + owner as u32, "b");
    }
    let owners = [OwnerId(1), OwnerId(2), OwnerId(3)];
    let paid = paid_by_beneficiary(store.as_ref(), &owners);
    for owner in owners {
        assert_eq!(store.balance(owner).unwrap(), paid[&owner], "{owner}");
    }
    assert_eq!(store.balance(EngineConfig::default().treasury).unwrap(), 0);
}

#[test]
fn release_pays_treasury_exactly_once() {
    let (store, engine) = memory_engine(PROFILE_PRINCIPAL_SIXTY_TWO);
    fill(&engine, 1, 1, 10, "r");
    let root = stage_root(&engine, 1, 1).unwrap();
    let pending = root.unreleased_company_side;
    assert_eq!(pending, tokens(400) * 10);

    assert_eq!(engine.admin_release_pending_payout(root.position.id).unwrap(), pending);
    assert_eq!(engine.admin_release_pending_payout(root.position.id).unwrap(), 0);
    assert_eq!(store.balance(engine.config().treasury).unwrap(), pending);

    fill(&engine, 1, 1, 1, "r-more");
    assert_eq!(engine.admin_release_pending_payout(root.position.id).unwrap(), tokens(400));
}

#[test]
fn replayed_purchases_write_nothing() {
    let (store, engine) = memory_engine(PROFILE_PRINCIPAL_SIXTY_TWO);
    let first = engine.process_purchase(&unit(1, "dup")).unwrap();
    let positions = store.position_count();
    let entries = store.entry_count();
    let balance = store.balance(OwnerId(1)).unwrap();

    for _ in 0..5 {
        assert_eq!(engine.process_purchase(&unit(1, "dup")).unwrap(), first);
    }
    assert_eq!(store.position_count(), positions);
    assert_eq!(store.entry_count(), entries);
    assert_eq!(store.balance(OwnerId(1)).unwrap(), balance);
}

// ---------------------------------------------------------------------------
// RocksDB
// ---------------------------------------------------------------------------

#[test]
fn rocksdb_scenario_matches_memory() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(RocksStore::open(dir.path().join("db")).unwrap());
    let profile = RewardProfile::named(PROFILE_PRINCIPAL_SIXTY_TWO).unwrap();
    let engine = Engine::new(store.clone(), profile, EngineConfig::default()).unwrap();

    fill(&engine, 1, 1, 62, "rocks");
    let root = stage_root(&engine, 1, 1).unwrap();
    assert_eq!(root.completion_bonus_total, tokens(10_044));
    assert_eq!(stage_root(&engine, 1, 2).unwrap().economy.unwrap().slot_price, tokens(3_100));
    assert_invariants(store.as_ref(), engine.profile(), &[OwnerId(1)]);

    let paid = paid_by_beneficiary(store.as_ref(), &[OwnerId(1)]);
    assert_eq!(store.balance(OwnerId(1)).unwrap(), paid[&OwnerId(1)]);
}

#[test]
fn rocksdb_replay_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("db");
    let profile = RewardProfile::named(PROFILE_FLAT_TWO_LEG).unwrap();

    let receipt = {
        let store = Arc::new(RocksStore::open(&path).unwrap());
        let engine = Engine::new(store, profile.clone(), EngineConfig::default()).unwrap();
        engine.process_purchase(&unit(4, "restart")).unwrap()
    };

    let store = Arc::new(RocksStore::open(&path).unwrap());
    let engine = Engine::new(store.clone(), profile, EngineConfig::default()).unwrap();
    assert_eq!(engine.process_purchase(&unit(4, "restart")).unwrap(), receipt);
    assert_eq!(store.positions_of(OwnerId(4)).unwrap().len(), 2);

    // Fresh ids continue past the restored ones.
    let next = engine.process_purchase(&unit(4, "after-restart")).unwrap();
    assert!(next.position > receipt.position);
}
