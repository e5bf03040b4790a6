//! Shared helpers for the integration suites.

use std::collections::HashMap;
use std::sync::Arc;

use stagetree_core::constants::{tokens, Amount};
use stagetree_core::profile::RewardProfile;
use stagetree_core::store::MemoryStore;
use stagetree_core::traits::MatrixStore;
use stagetree_core::types::{OwnerId, Position, PositionSnapshot, PurchaseUnit, RewardCategory};
use stagetree_engine::{Engine, EngineConfig};

/// Engine over a fresh in-memory store with a fixed clock.
pub fn memory_engine(profile: &str) -> (Arc<MemoryStore>, Engine) {
    let store = Arc::new(MemoryStore::new());
    let engine = Engine::new(store.clone(), RewardProfile::named(profile).unwrap(), EngineConfig::default())
        .unwrap()
        .with_clock(|| 1_700_000_000);
    (store, engine)
}

/// A stage-1 purchase of 1,000 tokens.
pub fn unit(owner: u64, key: &str) -> PurchaseUnit {
    PurchaseUnit {
        owner: OwnerId(owner),
        stage: 1,
        unit_base_price: tokens(1_000),
        idempotency_key: key.to_string(),
    }
}

/// The owner's lowest-id root at `stage`.
pub fn stage_root(engine: &Engine, owner: u64, stage: u32) -> Option<PositionSnapshot> {
    engine
        .query_positions(OwnerId(owner))
        .unwrap()
        .into_iter()
        .find(|s| s.position.stage == stage && s.position.is_root())
}

/// Place `count` units for `owner` at `stage`. Stage 1 goes through
/// `process_purchase` with keys derived from `tag`.
pub fn fill(engine: &Engine, owner: u64, stage: u32, count: u32, tag: &str) {
    for i in 0..count {
        if stage == 1 {
            engine.process_purchase(&unit(owner, &format!("{tag}-{owner}-{i}"))).unwrap();
        } else {
            engine.place_unit(OwnerId(owner), stage).unwrap();
        }
    }
}

/// Check the structural and ledger invariants over every position of `owners`.
///
/// - children never exceed the tree's width
/// - completion-bonus legs run `1..=legs_filled` without gaps
/// - completed positions sit exactly at the threshold, open ones below it
/// - a next-stage root is priced from its origin's pool or from a peg
pub fn assert_invariants(store: &dyn MatrixStore, profile: &RewardProfile, owners: &[OwnerId]) {
    for owner in owners {
        for position in store.positions_of(*owner).unwrap() {
            check_position(store, profile, &position);
        }
    }
}

fn check_position(store: &dyn MatrixStore, profile: &RewardProfile, position: &Position) {
    let economy = store.economy(position.root).unwrap().expect("every tree has an economy");

    let children = store.child_count(position.id).unwrap();
    assert!(children <= economy.width, "{} has {children} children", position.id);

    let mut legs: Vec<u32> = store
        .entries_for(position.id)
        .unwrap()
        .iter()
        .filter(|e| e.category == RewardCategory::CompletionBonus)
        .map(|e| e.leg_index)
        .collect();
    legs.sort_unstable();
    let expected: Vec<u32> = (1..=position.legs_filled).collect();
    assert_eq!(legs, expected, "leg gap on {}", position.id);

    if position.is_completed() {
        assert_eq!(position.legs_filled, economy.completion_threshold, "{}", position.id);
    } else {
        assert!(position.legs_filled < economy.completion_threshold, "{}", position.id);
    }

    if let Some(origin) = position.spawned_from {
        let own = store.economy(position.id).unwrap().expect("next-stage root has an economy");
        let expected = profile
            .pegged_total(position.stage)
            .unwrap_or_else(|| store.category_total(origin, RewardCategory::NextStagePool).unwrap());
        assert_eq!(own.slot_price, expected, "slot price of {}", position.id);
        assert_eq!(store.successor_of(origin).unwrap(), Some(position.id));
    }
}

/// Sum of paid-out categories (completion and joining bonuses) per beneficiary.
pub fn paid_by_beneficiary(store: &dyn MatrixStore, owners: &[OwnerId]) -> HashMap<OwnerId, Amount> {
    let mut paid = HashMap::new();
    for owner in owners {
        for position in store.positions_of(*owner).unwrap() {
            for entry in store.entries_for(position.id).unwrap() {
                if matches!(entry.category, RewardCategory::CompletionBonus | RewardCategory::JoiningBonus) {
                    *paid.entry(entry.beneficiary).or_insert(0) += entry.amount;
                }
            }
        }
    }
    paid
}
