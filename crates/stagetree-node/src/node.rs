//! Node composition and scheduled jobs.
//!
//! The [`Node`] wires the RocksDB store into the placement [`Engine`], the
//! time-lock sweep and the withdrawal workflow. Placement calls are wrapped
//! in the configured backoff policy. [`Node::run`] drives the unlock sweep
//! and reports new outbox events on a fixed interval.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use stagetree_core::constants::Amount;
use stagetree_core::error::StagetreeError;
use stagetree_core::profile::RewardProfile;
use stagetree_core::traits::{BalanceStore, MatrixStore};
use stagetree_core::types::{
    now_secs, OutboxEvent, OwnerId, PlacementReceipt, PositionId, PositionSnapshot, PurchaseUnit,
    TimeLock, TrancheChunk, Withdrawal, WithdrawalId, WithdrawalMethod,
};
use stagetree_engine::{with_backoff, Engine};

use crate::config::NodeConfig;
use crate::storage::RocksStore;
use crate::unlock::{SweepReport, TimeLocks};
use crate::withdrawal::{DisabledRail, PayoutRail, Withdrawals};

/// Outbox events reported per tick.
const OUTBOX_BATCH: usize = 256;

/// The running service: storage, engine and peripheral workflows.
pub struct Node {
    store: Arc<RocksStore>,
    engine: Engine,
    time_locks: TimeLocks<RocksStore>,
    withdrawals: Withdrawals<RocksStore>,
    /// Highest outbox sequence already reported, mirrored in the store.
    outbox_seen: AtomicU64,
    config: NodeConfig,
}

impl Node {
    /// Open a node with the disabled payout rail.
    pub fn open(config: NodeConfig) -> Result<Arc<Self>, StagetreeError> {
        Self::with_rail(config, Box::new(DisabledRail))
    }

    /// Open a node with a specific payout rail.
    ///
    /// Validates the configuration, creates the data directory and opens
    /// storage.
    pub fn with_rail(config: NodeConfig, rail: Box<dyn PayoutRail>) -> Result<Arc<Self>, StagetreeError> {
        config.validate()?;
        let profile = config.resolve_profile()?;

        std::fs::create_dir_all(&config.data_dir)
            .map_err(|e| StagetreeError::Storage(format!("create {}: {e}", config.data_dir.display())))?;
        let store = Arc::new(RocksStore::open(config.db_path())?);

        let matrix: Arc<dyn MatrixStore> = store.clone();
        let engine = Engine::new(matrix, profile, config.engine.clone())?;
        let time_locks = TimeLocks::new(store.clone(), config.lock_period_secs(), config.lock_reward_bps);
        let withdrawals = Withdrawals::new(store.clone(), rail, config.live_payouts);
        let outbox_seen = store.outbox_watermark()?;

        info!(
            profile = %engine.profile().name,
            treasury = %config.engine.treasury,
            data_dir = %config.data_dir.display(),
            outbox_seen,
            "node opened"
        );

        Ok(Arc::new(Self {
            store,
            engine,
            time_locks,
            withdrawals,
            outbox_seen: AtomicU64::new(outbox_seen),
            config,
        }))
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn profile(&self) -> &RewardProfile {
        self.engine.profile()
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    // --- Placement ---

    /// Process one purchase unit, retrying lock conflicts.
    pub fn submit_purchase(&self, unit: &PurchaseUnit) -> Result<PlacementReceipt, StagetreeError> {
        with_backoff(&self.config.backoff, || self.engine.process_purchase(unit))
    }

    pub fn place_unit(&self, owner: OwnerId, stage: u32) -> Result<PositionSnapshot, StagetreeError> {
        with_backoff(&self.config.backoff, || self.engine.place_unit(owner, stage))
    }

    pub fn query_positions(&self, owner: OwnerId) -> Result<Vec<PositionSnapshot>, StagetreeError> {
        self.engine.query_positions(owner)
    }

    pub fn tranche_report(&self, position: PositionId) -> Result<Vec<TrancheChunk>, StagetreeError> {
        self.engine.tranche_report(position)
    }

    pub fn release_pending_payout(&self, position: PositionId) -> Result<Amount, StagetreeError> {
        with_backoff(&self.config.backoff, || self.engine.admin_release_pending_payout(position))
    }

    // --- Balances and peripheral workflows ---

    pub fn balance(&self, owner: OwnerId) -> Result<Amount, StagetreeError> {
        self.store.balance(owner)
    }

    pub fn lock_deposit(&self, owner: OwnerId, amount: Amount) -> Result<TimeLock, StagetreeError> {
        self.time_locks.lock_deposit(owner, amount, now_secs())
    }

    /// Release every time-lock matured at `now`.
    pub fn sweep_unlocks_at(&self, now: u64) -> Result<SweepReport, StagetreeError> {
        self.time_locks.sweep(now)
    }

    pub fn request_withdrawal(
        &self,
        owner: OwnerId,
        amount: Amount,
        method: WithdrawalMethod,
    ) -> Result<Withdrawal, StagetreeError> {
        self.withdrawals.request(owner, amount, method, now_secs())
    }

    pub fn execute_withdrawal(&self, id: WithdrawalId) -> Result<Withdrawal, StagetreeError> {
        self.withdrawals.execute(id, now_secs())
    }

    pub fn complete_withdrawal(&self, id: WithdrawalId, reference: Option<String>) -> Result<Withdrawal, StagetreeError> {
        self.withdrawals.complete(id, reference, now_secs())
    }

    pub fn fail_withdrawal(&self, id: WithdrawalId, reason: &str) -> Result<Withdrawal, StagetreeError> {
        self.withdrawals.fail(id, reason, now_secs())
    }

    pub fn withdrawals_of(&self, owner: OwnerId) -> Result<Vec<Withdrawal>, StagetreeError> {
        self.withdrawals.list(owner)
    }

    /// Outbox events with sequence above `after`.
    pub fn outbox_after(&self, after: u64, limit: usize) -> Result<Vec<(u64, OutboxEvent)>, StagetreeError> {
        self.store.outbox_after(after, limit)
    }

    // --- Scheduled jobs ---

    /// One scheduler tick: sweep matured locks and report new outbox events.
    pub fn tick(&self, now: u64) -> Result<SweepReport, StagetreeError> {
        let report = self.sweep_unlocks_at(now)?;
        self.report_outbox()?;
        Ok(report)
    }

    fn report_outbox(&self) -> Result<(), StagetreeError> {
        let after = self.outbox_seen.load(Ordering::SeqCst);
        let events = self.store.outbox_after(after, OUTBOX_BATCH)?;
        for (seq, event) in &events {
            match event {
                OutboxEvent::MaxStageCompleted { position, owner, company_side_total } => {
                    info!(seq, position = %position, owner = %owner, company_side_total, "final-stage completion awaiting re-entry");
                }
                OutboxEvent::InvariantViolation { position, detail } => {
                    error!(seq, position = %position, detail = %detail, "structural violation awaiting review");
                }
            }
        }
        if let Some((seq, _)) = events.last() {
            self.store.set_outbox_watermark(*seq)?;
            self.outbox_seen.fetch_max(*seq, Ordering::SeqCst);
        }
        Ok(())
    }

    /// Run the scheduler until the task is dropped.
    pub async fn run(&self) {
        let period = Duration::from_secs(self.config.sweep_interval_secs.max(1));
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            match self.tick(now_secs()) {
                Ok(report) => debug!(released = report.released.len(), "scheduler tick"),
                Err(e) => warn!(error = %e, "scheduler tick failed"),
            }
        }
    }

    pub fn flush(&self) -> Result<(), StagetreeError> {
        self.store.flush()
    }
}
