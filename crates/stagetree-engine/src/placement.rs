//! Breadth-first placement under a stage root.
//!
//! Nodes are visited level by level, children in ascending id order. The
//! first node with fewer than `width` children receives the new position.
//! Placement writes no ledger entries.

use std::collections::VecDeque;

use stagetree_core::error::StagetreeError;
use stagetree_core::traits::IdKind;
use stagetree_core::types::{OutboxEvent, OwnerId, Position, PositionId};

use crate::txn::Txn;

/// Where a unit landed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Placement {
    pub position: Position,
    /// The tree was exhausted and the unit became a new root.
    pub fallback: bool,
}

/// Place one unit for `owner` under `root`.
///
/// Visits at most `visit_limit` nodes. If no capacity is found the unit
/// becomes a fresh root carrying the same economy, and the violation is
/// queued for operator review.
pub fn place_under(
    txn: &mut Txn<'_>,
    owner: OwnerId,
    root: PositionId,
    visit_limit: usize,
) -> Result<Placement, StagetreeError> {
    let economy = txn.economy(root)?;
    let width = economy.width;

    let mut queue = VecDeque::from([root]);
    let mut visited = 0usize;
    while let Some(node) = queue.pop_front() {
        if visited >= visit_limit {
            break;
        }
        visited += 1;

        if txn.child_count(node)? < width {
            let parent = txn.position(node)?;
            let id = PositionId(txn.next_id(IdKind::Position)?);
            let child = Position::new_child(id, owner, &parent, txn.now());
            tracing::debug!(position = %id, parent = %node, depth = child.depth, visited, "unit placed");
            txn.put_position(child.clone())?;
            return Ok(Placement { position: child, fallback: false });
        }
        queue.extend(txn.children(node)?);
    }

    let anchor = txn.position(root)?;
    let id = PositionId(txn.next_id(IdKind::Position)?);
    let detail = format!("no capacity under {root} after visiting {visited} nodes");
    tracing::error!(root = %root, fallback = %id, visited, "{detail}");

    let fallback = Position::new_root(id, owner, anchor.stage, Some(anchor.principal), txn.now());
    txn.put_position(fallback.clone())?;
    txn.put_economy(id, economy);
    txn.push_outbox(OutboxEvent::InvariantViolation { position: root, detail });
    Ok(Placement { position: fallback, fallback: true })
}
