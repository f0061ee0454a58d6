//! Pending membership edges queued on a root instance.

use serde::Serialize;

use crate::entity::EntityRef;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PendingEdge {
    pub relation: String,
    pub target: EntityRef,
    pub add: bool,
}

/// Edges to flush after the owner's own create/patch.
///
/// Adding then removing the same edge (or the reverse) before a commit
/// cancels out; queuing the same edge twice is a no-op.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct MembershipQueue {
    pending: Vec<PendingEdge>,
}

impl MembershipQueue {
    pub fn queue(&mut self, relation: &str, target: EntityRef, add: bool) {
        let same_edge = |e: &PendingEdge| e.relation == relation && e.target == target;
        if let Some(index) = self.pending.iter().position(|e| same_edge(e) && e.add != add) {
            self.pending.remove(index);
            return;
        }
        if self.pending.iter().any(same_edge) {
            return;
        }
        self.pending.push(PendingEdge {
            relation: relation.to_string(),
            target,
            add,
        });
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &PendingEdge> {
        self.pending.iter()
    }

    pub(crate) fn take(&mut self) -> Vec<PendingEdge> {
        std::mem::take(&mut self.pending)
    }

    /// Put back edges that failed to flush.
    pub(crate) fn restore(&mut self, failed: Vec<PendingEdge>) {
        let mut failed = failed;
        failed.append(&mut self.pending);
        self.pending = failed;
    }

    pub fn clear(&mut self) {
        self.pending.clear();
    }
}
