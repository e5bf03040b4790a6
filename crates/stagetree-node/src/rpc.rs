//! JSON-RPC server for the Stagetree node.
//!
//! Uses jsonrpsee 0.24. Amounts are minor units carried as JSON integers of
//! up to 128 bits; owners, positions and withdrawals are addressed by their
//! numeric ids. Handlers run node calls on the blocking pool.

use std::sync::Arc;

use jsonrpsee::core::async_trait;
use jsonrpsee::proc_macros::rpc;
use jsonrpsee::server::{Server, ServerHandle};
use jsonrpsee::types::ErrorObjectOwned;
use serde::{Deserialize, Serialize};

use stagetree_core::constants::{Amount, MAX_STAGE};
use stagetree_core::error::{
    BalanceError, EngineError, StagetreeError, StructuralError, TimeLockError, WithdrawalError,
};
use stagetree_core::types::{
    OwnerId, PlacementReceipt, PositionId, PositionSnapshot, PositionStatus, PurchaseUnit, TimeLock,
    TrancheChunk, Withdrawal, WithdrawalId, WithdrawalMethod,
};

use crate::node::Node;

/// JSON representation of a position and its ledger totals.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionJson {
    pub id: u64,
    pub owner: u64,
    pub stage: u32,
    pub parent: Option<u64>,
    /// Stage root of the tree.
    pub root: u64,
    pub principal: u64,
    pub depth: u32,
    pub legs_filled: u32,
    pub tranches_paid: u32,
    /// "open" or "completed".
    pub status: String,
    /// Entry price, present for stage roots.
    pub slot_price: Option<Amount>,
    pub child_count: u32,
    pub completion_bonus_total: Amount,
    pub next_stage_pool_total: Amount,
    pub unreleased_company_side: Amount,
}

impl From<PositionSnapshot> for PositionJson {
    fn from(s: PositionSnapshot) -> Self {
        let p = s.position;
        Self {
            id: p.id.get(),
            owner: p.owner.get(),
            stage: p.stage,
            parent: p.parent.map(PositionId::get),
            root: p.root.get(),
            principal: p.principal.get(),
            depth: p.depth,
            legs_filled: p.legs_filled,
            tranches_paid: p.tranches_paid,
            status: match p.status {
                PositionStatus::Open => "open".to_string(),
                PositionStatus::Completed => "completed".to_string(),
            },
            slot_price: s.economy.map(|e| e.slot_price),
            child_count: s.child_count,
            completion_bonus_total: s.completion_bonus_total,
            next_stage_pool_total: s.next_stage_pool_total,
            unreleased_company_side: s.unreleased_company_side,
        }
    }
}

/// JSON representation of a processed purchase.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReceiptJson {
    pub idempotency_key: String,
    pub position: u64,
    pub entries: usize,
    pub completed: Vec<u64>,
    pub opened_roots: Vec<u64>,
    pub created_at: u64,
}

impl From<PlacementReceipt> for ReceiptJson {
    fn from(r: PlacementReceipt) -> Self {
        Self {
            idempotency_key: r.idempotency_key,
            position: r.position.get(),
            entries: r.entries.len(),
            completed: r.completed.into_iter().map(PositionId::get).collect(),
            opened_roots: r.opened_roots.into_iter().map(PositionId::get).collect(),
            created_at: r.created_at,
        }
    }
}

/// JSON representation of node info.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeInfoJson {
    pub version: String,
    pub profile: String,
    pub width: u32,
    pub credit_depth: u32,
    pub completion_threshold: u32,
    pub tranche_size: u32,
    pub max_stage: u32,
    pub treasury: u64,
    pub treasury_balance: Amount,
    pub live_payouts: bool,
}

/// Parse a withdrawal method name and its destination.
pub fn parse_method(method: &str, destination: String) -> Result<WithdrawalMethod, ErrorObjectOwned> {
    if destination.trim().is_empty() {
        return Err(rpc_error(-8, "destination must not be empty"));
    }
    match method {
        "bank" => Ok(WithdrawalMethod::Bank { reference: destination }),
        "token" => Ok(WithdrawalMethod::Token { address: destination }),
        other => Err(rpc_error(-8, &format!("unknown withdrawal method: {other}"))),
    }
}

/// Create a JSON-RPC error.
fn rpc_error(code: i32, msg: &str) -> ErrorObjectOwned {
    ErrorObjectOwned::owned(code, msg.to_string(), None::<()>)
}

/// Map a domain error onto a JSON-RPC error code.
fn to_rpc_error(e: StagetreeError) -> ErrorObjectOwned {
    let code = match &e {
        StagetreeError::Engine(EngineError::ConcurrencyConflict(_) | EngineError::RetriesExhausted { .. }) => -32,
        StagetreeError::Engine(_) | StagetreeError::Config(_) => -8,
        StagetreeError::Balance(BalanceError::Insufficient { .. }) => -6,
        StagetreeError::Balance(_) => -8,
        StagetreeError::Structural(StructuralError::PositionNotFound(_))
        | StagetreeError::Withdrawal(WithdrawalError::NotFound(_))
        | StagetreeError::TimeLock(TimeLockError::NotFound(_)) => -5,
        StagetreeError::Withdrawal(_) | StagetreeError::Ledger(_) => -25,
        _ => -1,
    };
    rpc_error(code, &e.to_string())
}

/// The Stagetree JSON-RPC interface.
#[rpc(server)]
pub trait StagetreeRpc {
    /// Places one unit for `owner` at `stage` at the stage's own price.
    #[method(name = "placeunit")]
    async fn place_unit(&self, owner: u64, stage: u32) -> Result<PositionJson, ErrorObjectOwned>;

    /// Processes a confirmed purchase unit; replaying a key returns the first receipt.
    #[method(name = "submitpurchase")]
    async fn submit_purchase(
        &self,
        owner: u64,
        stage: u32,
        unit_base_price: Amount,
        idempotency_key: String,
    ) -> Result<ReceiptJson, ErrorObjectOwned>;

    /// Returns every position of `owner`, ordered by stage then id.
    #[method(name = "querypositions")]
    async fn query_positions(&self, owner: u64) -> Result<Vec<PositionJson>, ErrorObjectOwned>;

    /// Returns the completion-bonus tranches of a position.
    #[method(name = "tranchereport")]
    async fn tranche_report(&self, position: u64) -> Result<Vec<TrancheChunk>, ErrorObjectOwned>;

    /// Releases a position's pending company-side entries to the treasury.
    #[method(name = "releasependingpayout")]
    async fn release_pending_payout(&self, position: u64) -> Result<Amount, ErrorObjectOwned>;

    #[method(name = "getbalance")]
    async fn get_balance(&self, owner: u64) -> Result<Amount, ErrorObjectOwned>;

    #[method(name = "lockdeposit")]
    async fn lock_deposit(&self, owner: u64, amount: Amount) -> Result<TimeLock, ErrorObjectOwned>;

    /// `method` is "bank" or "token".
    #[method(name = "requestwithdrawal")]
    async fn request_withdrawal(
        &self,
        owner: u64,
        amount: Amount,
        method: String,
        destination: String,
    ) -> Result<Withdrawal, ErrorObjectOwned>;

    #[method(name = "executewithdrawal")]
    async fn execute_withdrawal(&self, id: u64) -> Result<Withdrawal, ErrorObjectOwned>;

    #[method(name = "completewithdrawal")]
    async fn complete_withdrawal(&self, id: u64, reference: Option<String>) -> Result<Withdrawal, ErrorObjectOwned>;

    #[method(name = "failwithdrawal")]
    async fn fail_withdrawal(&self, id: u64, reason: String) -> Result<Withdrawal, ErrorObjectOwned>;

    /// Returns general node info.
    #[method(name = "getinfo")]
    async fn get_info(&self) -> Result<NodeInfoJson, ErrorObjectOwned>;
}

/// Implementation of the Stagetree JSON-RPC server.
pub struct RpcServerImpl {
    node: Arc<Node>,
}

impl RpcServerImpl {
    pub fn new(node: Arc<Node>) -> Self {
        Self { node }
    }
}

/// Run a node call on tokio's blocking pool. Node calls block on RocksDB
/// and on backoff sleeps.
async fn blocking<T, F>(node: &Arc<Node>, call: F) -> Result<T, ErrorObjectOwned>
where
    T: Send + 'static,
    F: FnOnce(&Node) -> Result<T, StagetreeError> + Send + 'static,
{
    let node = Arc::clone(node);
    tokio::task::spawn_blocking(move || call(node.as_ref()))
        .await
        .map_err(|e| rpc_error(-1, &format!("node task failed: {e}")))?
        .map_err(to_rpc_error)
}

#[async_trait]
impl StagetreeRpcServer for RpcServerImpl {
    async fn place_unit(&self, owner: u64, stage: u32) -> Result<PositionJson, ErrorObjectOwned> {
        let snapshot = blocking(&self.node, move |node| node.place_unit(OwnerId(owner), stage)).await?;
        Ok(PositionJson::from(snapshot))
    }

    async fn submit_purchase(
        &self,
        owner: u64,
        stage: u32,
        unit_base_price: Amount,
        idempotency_key: String,
    ) -> Result<ReceiptJson, ErrorObjectOwned> {
        let unit = PurchaseUnit { owner: OwnerId(owner), stage, unit_base_price, idempotency_key };
        let receipt = blocking(&self.node, move |node| node.submit_purchase(&unit)).await?;
        Ok(ReceiptJson::from(receipt))
    }

    async fn query_positions(&self, owner: u64) -> Result<Vec<PositionJson>, ErrorObjectOwned> {
        let positions = blocking(&self.node, move |node| node.query_positions(OwnerId(owner))).await?;
        Ok(positions.into_iter().map(PositionJson::from).collect())
    }

    async fn tranche_report(&self, position: u64) -> Result<Vec<TrancheChunk>, ErrorObjectOwned> {
        blocking(&self.node, move |node| node.tranche_report(PositionId(position))).await
    }

    async fn release_pending_payout(&self, position: u64) -> Result<Amount, ErrorObjectOwned> {
        blocking(&self.node, move |node| node.release_pending_payout(PositionId(position))).await
    }

    async fn get_balance(&self, owner: u64) -> Result<Amount, ErrorObjectOwned> {
        blocking(&self.node, move |node| node.balance(OwnerId(owner))).await
    }

    async fn lock_deposit(&self, owner: u64, amount: Amount) -> Result<TimeLock, ErrorObjectOwned> {
        blocking(&self.node, move |node| node.lock_deposit(OwnerId(owner), amount)).await
    }

    async fn request_withdrawal(
        &self,
        owner: u64,
        amount: Amount,
        method: String,
        destination: String,
    ) -> Result<Withdrawal, ErrorObjectOwned> {
        let method = parse_method(&method, destination)?;
        blocking(&self.node, move |node| node.request_withdrawal(OwnerId(owner), amount, method)).await
    }

    async fn execute_withdrawal(&self, id: u64) -> Result<Withdrawal, ErrorObjectOwned> {
        blocking(&self.node, move |node| node.execute_withdrawal(WithdrawalId(id))).await
    }

    async fn complete_withdrawal(&self, id: u64, reference: Option<String>) -> Result<Withdrawal, ErrorObjectOwned> {
        blocking(&self.node, move |node| node.complete_withdrawal(WithdrawalId(id), reference)).await
    }

    async fn fail_withdrawal(&self, id: u64, reason: String) -> Result<Withdrawal, ErrorObjectOwned> {
        blocking(&self.node, move |node| node.fail_withdrawal(WithdrawalId(id), &reason)).await
    }

    async fn get_info(&self) -> Result<NodeInfoJson, ErrorObjectOwned> {
        let treasury = self.node.config().engine.treasury;
        let treasury_balance = blocking(&self.node, move |node| node.balance(treasury)).await?;
        let profile = self.node.profile();
        Ok(NodeInfoJson {
            version: env!("CARGO_PKG_VERSION").to_string(),
            profile: profile.name.clone(),
            width: profile.width,
            credit_depth: profile.credit_depth,
            completion_threshold: profile.completion_threshold,
            tranche_size: profile.tranche_size,
            max_stage: MAX_STAGE,
            treasury: treasury.get(),
            treasury_balance,
            live_payouts: self.node.config().live_payouts,
        })
    }
}

/// Start the JSON-RPC server on the given address.
///
/// Returns a [`ServerHandle`] that can be used to stop the server.
pub async fn start_rpc_server(addr: &str, node: Arc<Node>) -> Result<ServerHandle, StagetreeError> {
    let server = Server::builder()
        .build(addr)
        .await
        .map_err(|e| StagetreeError::Storage(format!("RPC server error: {e}")))?;

    let rpc_impl = RpcServerImpl::new(node);
    let handle = server.start(rpc_impl.into_rpc());

    Ok(handle)
}
