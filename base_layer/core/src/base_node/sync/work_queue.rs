//  Copyright 2022, The Aether Project
//
//  Redistribution and use in source and binary forms, with or without modification, are permitted provided that the
//  following conditions are met:
//
//  1. Redistributions of source code must retain the above copyright notice, this list of conditions and the following
//  disclaimer.
//
//  2. Redistributions in binary form must reproduce the above copyright notice, this list of conditions and the
//  following disclaimer in the documentation and/or other materials provided with the distribution.
//
//  3. Neither the name of the copyright holder nor the names of its contributors may be used to endorse or promote
//  products derived from this software without specific prior written permission.
//
//  THIS SOFTWARE IS PROVIDED BY THE COPYRIGHT HOLDERS AND CONTRIBUTORS "AS IS" AND ANY EXPRESS OR IMPLIED WARRANTIES,
//  INCLUDING, BUT NOT LIMITED TO, THE IMPLIED WARRANTIES OF MERCHANTABILITY AND FITNESS FOR A PARTICULAR PURPOSE ARE
//  DISCLAIMED. IN NO EVENT SHALL THE COPYRIGHT HOLDER OR CONTRIBUTORS BE LIABLE FOR ANY DIRECT, INDIRECT, INCIDENTAL,
//  SPECIAL, EXEMPLARY, OR CONSEQUENTIAL DAMAGES (INCLUDING, BUT NOT LIMITED TO, PROCUREMENT OF SUBSTITUTE GOODS OR
//  SERVICES; LOSS OF USE, DATA, OR PROFITS; OR BUSINESS INTERRUPTION) HOWEVER CAUSED AND ON ANY THEORY OF LIABILITY,
//  WHETHER IN CONTRACT, STRICT LIABILITY, OR TORT (INCLUDING NEGLIGENCE OR OTHERWISE) ARISING IN ANY WAY OUT OF THE
//  USE OF THIS SOFTWARE, EVEN IF ADVISED OF THE POSSIBILITY OF SUCH DAMAGE.

//! The sliding window of block-range work items shared by all download tasks.
//!
//! The queue never grows beyond the number of concurrent workers plus a small reorder tail,
//! because `Persisted` slots are recycled. Slot indices are not stable across claims; a claim is
//! identified by its epoch, and the epoch check makes a claimant that lost its slot to the stale
//! sweeper harmless.

use std::{
    cmp,
    time::{Duration, Instant},
};

use log::*;

use super::sync_peer::PeerId;
use crate::blocks::{BlockBody, BlockHeader, BlockNumber};

const LOG_TARGET: &str = "c::bn::sync::work_queue";

/// Life cycle of a work item. The only backward transition is `Requested -> Initial`, taken when
/// the peer working the range fails or the claim goes stale.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkItemState {
    Initial,
    Requested,
    Received,
    Persisted,
}

#[derive(Debug)]
struct WorkItem {
    start_index: BlockNumber,
    num_blocks: u32,
    state: WorkItemState,
    headers: Vec<BlockHeader>,
    bodies: Vec<BlockBody>,
    claim_epoch: u64,
    claimant: Option<PeerId>,
    requested_at: Option<Instant>,
}

impl WorkItem {
    fn new(start_index: BlockNumber, num_blocks: u32) -> Self {
        debug_assert!(num_blocks > 0);
        Self {
            start_index,
            num_blocks,
            state: WorkItemState::Initial,
            headers: Vec::new(),
            bodies: Vec::new(),
            claim_epoch: 0,
            claimant: None,
            requested_at: None,
        }
    }

    fn end_index(&self) -> BlockNumber {
        self.start_index.saturating_add((self.num_blocks - 1).into())
    }

    fn reset_to_initial(&mut self) {
        self.state = WorkItemState::Initial;
        self.headers = Vec::new();
        self.bodies = Vec::new();
        self.claimant = None;
        self.requested_at = None;
    }
}

/// A successful claim on a slot. The epoch ties later `mark_received`/`revert` calls to this
/// particular claim.
#[derive(Debug, Clone, Copy)]
pub struct ClaimedSlot {
    pub index: usize,
    pub epoch: u64,
    pub start_index: BlockNumber,
    pub num_blocks: u32,
}

/// A contiguous run of blocks removed from the queue for persistence.
#[derive(Debug)]
pub struct PersistBatch {
    pub start_index: BlockNumber,
    pub end_index: BlockNumber,
    pub headers: Vec<BlockHeader>,
    pub bodies: Vec<BlockBody>,
}

/// The claim this call refers to is no longer current for its slot.
#[derive(Debug, Clone, Copy, thiserror::Error)]
#[error("claim is no longer current for this slot")]
pub struct StaleClaim;

#[derive(Debug)]
pub struct WorkQueue {
    items: Vec<WorkItem>,
    finalized: BlockNumber,
    end_block: BlockNumber,
    has_out_of_order: bool,
    next_claim_epoch: u64,
    max_request_size: u32,
}

impl WorkQueue {
    /// An empty window on top of the given finalized block. The window stays empty until
    /// [WorkQueue::raise_end_block] learns of a higher remote tip.
    pub fn new(finalized: BlockNumber, max_request_size: u32) -> Self {
        debug_assert!(max_request_size > 0);
        Self {
            items: Vec::new(),
            finalized,
            end_block: finalized,
            has_out_of_order: false,
            next_claim_epoch: 0,
            max_request_size,
        }
    }

    /// The highest block number persisted so far. Monotonically non-decreasing.
    pub fn finalized(&self) -> BlockNumber {
        self.finalized
    }

    /// The highest block number to fetch (inclusive). Monotonically non-decreasing.
    pub fn end_block(&self) -> BlockNumber {
        self.end_block
    }

    /// True while any `Received` item awaits in-order persistence.
    pub fn has_out_of_order_blocks(&self) -> bool {
        self.has_out_of_order
    }

    pub fn is_complete(&self) -> bool {
        self.finalized >= self.end_block
    }

    /// Raise the sync target. The target is never lowered.
    pub fn raise_end_block(&mut self, candidate: BlockNumber) -> bool {
        if candidate > self.end_block {
            debug!(
                target: LOG_TARGET,
                "Sync target raised from #{} to #{}", self.end_block, candidate
            );
            self.end_block = candidate;
            true
        } else {
            false
        }
    }

    /// True if a claim would currently succeed.
    pub fn has_available_work(&self) -> bool {
        let mut max_pending = self.finalized;
        for item in &self.items {
            if item.state == WorkItemState::Initial {
                return true;
            }
            max_pending = cmp::max(max_pending, item.end_index());
        }
        max_pending.saturating_add(BlockNumber::one()) <= self.end_block
    }

    /// Pick a slot to work on and transition it to `Requested`. The claim is the serialization
    /// point: no two live claims can refer to the same slot.
    ///
    /// An `Initial` slot is recycled before the window is extended. When extending, a `Persisted`
    /// slot is reused (lowest index first) before the queue grows. Returns `None` when the sync
    /// window is exhausted.
    pub fn claim_available(&mut self, claimant: PeerId, now: Instant) -> Option<ClaimedSlot> {
        let mut first_initial = None;
        let mut max_pending = self.finalized;
        for (i, item) in self.items.iter().enumerate() {
            max_pending = cmp::max(max_pending, item.end_index());
            if first_initial.is_none() && item.state == WorkItemState::Initial {
                first_initial = Some(i);
            }
        }

        let index = match first_initial {
            Some(index) => index,
            None => {
                let next_start = max_pending.saturating_add(BlockNumber::one());
                if next_start > self.end_block {
                    return None;
                }
                let span = (self.end_block - next_start).saturating_add(BlockNumber::one());
                let num_blocks = cmp::min(span, self.max_request_size.into()).low_u32();
                self.open_slot(next_start, num_blocks)
            },
        };

        self.next_claim_epoch += 1;
        let epoch = self.next_claim_epoch;
        let item = &mut self.items[index];
        item.state = WorkItemState::Requested;
        item.claim_epoch = epoch;
        item.claimant = Some(claimant);
        item.requested_at = Some(now);
        trace!(
            target: LOG_TARGET,
            "Peer {} claimed blocks #{}..#{} (slot {}, epoch {})",
            claimant,
            item.start_index,
            item.end_index(),
            index,
            epoch
        );
        Some(ClaimedSlot {
            index,
            epoch,
            start_index: item.start_index,
            num_blocks: item.num_blocks,
        })
    }

    /// Store downloaded material, transitioning `Requested -> Received`.
    ///
    /// `headers` and `bodies` must be equal in length, non-empty and no longer than the claimed
    /// range. A shorter run is the tail of the serving peer's chain; the item shrinks to the
    /// delivered prefix and the undelivered remainder is re-opened as a fresh `Initial` slot.
    pub fn mark_received(
        &mut self,
        claim: &ClaimedSlot,
        headers: Vec<BlockHeader>,
        bodies: Vec<BlockBody>,
    ) -> Result<(), StaleClaim> {
        debug_assert_eq!(headers.len(), bodies.len());
        debug_assert!(!headers.is_empty());
        debug_assert!(headers.len() <= claim.num_blocks as usize);

        let next_in_order = self.finalized.saturating_add(BlockNumber::one());
        let undelivered = {
            let item = match self.items.get_mut(claim.index) {
                Some(item) if item.claim_epoch == claim.epoch && item.state == WorkItemState::Requested => item,
                _ => return Err(StaleClaim),
            };

            let delivered = headers.len() as u32;
            let undelivered = if delivered < item.num_blocks {
                let tail_start = item.start_index.saturating_add(delivered.into());
                let tail_len = item.num_blocks - delivered;
                item.num_blocks = delivered;
                Some((tail_start, tail_len))
            } else {
                None
            };

            item.headers = headers;
            item.bodies = bodies;
            item.state = WorkItemState::Received;
            item.claimant = None;
            item.requested_at = None;
            if item.start_index != next_in_order {
                self.has_out_of_order = true;
            }
            undelivered
        };

        if let Some((tail_start, tail_len)) = undelivered {
            debug!(
                target: LOG_TARGET,
                "Short header run for slot {}; re-opening blocks #{}..#{}",
                claim.index,
                tail_start,
                tail_start.saturating_add((tail_len - 1).into())
            );
            self.open_slot(tail_start, tail_len);
        }
        Ok(())
    }

    /// Transition `Requested -> Initial`, discarding any partial data. Returns false if the claim
    /// is stale, in which case the queue is untouched.
    pub fn revert(&mut self, claim: &ClaimedSlot) -> bool {
        match self.items.get_mut(claim.index) {
            Some(item) if item.claim_epoch == claim.epoch && item.state == WorkItemState::Requested => {
                item.reset_to_initial();
                true
            },
            _ => false,
        }
    }

    /// Revert every `Requested` slot whose claim is older than `timeout`. Recovers slots orphaned
    /// by download tasks that were abandoned without reaching their own error path.
    pub fn revert_stale(&mut self, timeout: Duration, now: Instant) -> usize {
        let mut reverted = 0;
        for item in &mut self.items {
            if item.state != WorkItemState::Requested {
                continue;
            }
            let expired = item
                .requested_at
                .map(|at| now.duration_since(at) >= timeout)
                .unwrap_or(true);
            if expired {
                warn!(
                    target: LOG_TARGET,
                    "Reverting stale request for blocks #{}..#{} (claimed by peer {:?})",
                    item.start_index,
                    item.end_index(),
                    item.claimant
                );
                item.reset_to_initial();
                reverted += 1;
            }
        }
        reverted
    }

    /// Remove the `Received` item that directly follows the finalized watermark, marking it
    /// `Persisted` and advancing the watermark to its end.
    ///
    /// Looping until `None` is the reorder drain; the loop is idempotent over any queue state.
    /// Callers must serialise the drain so the chain database sees batches in ascending order.
    pub fn next_batch_to_persist(&mut self) -> Option<PersistBatch> {
        let next_in_order = self.finalized.saturating_add(BlockNumber::one());
        let index = self
            .items
            .iter()
            .position(|item| item.state == WorkItemState::Received && item.start_index == next_in_order)?;

        let item = &mut self.items[index];
        let headers = std::mem::take(&mut item.headers);
        let bodies = std::mem::take(&mut item.bodies);
        let start_index = item.start_index;
        let end_index = item.end_index();
        item.state = WorkItemState::Persisted;
        self.finalized = end_index;
        self.has_out_of_order = self.items.iter().any(|item| item.state == WorkItemState::Received);
        Some(PersistBatch {
            start_index,
            end_index,
            headers,
            bodies,
        })
    }

    fn open_slot(&mut self, start_index: BlockNumber, num_blocks: u32) -> usize {
        let slot = WorkItem::new(start_index, num_blocks);
        match self.items.iter().position(|item| item.state == WorkItemState::Persisted) {
            Some(index) => {
                self.items[index] = slot;
                index
            },
            None => {
                self.items.push(slot);
                self.items.len() - 1
            },
        }
    }

    #[cfg(test)]
    fn states(&self) -> Vec<WorkItemState> {
        self.items.iter().map(|item| item.state).collect()
    }

    #[cfg(test)]
    fn item_range(&self, index: usize) -> (BlockNumber, BlockNumber) {
        (self.items[index].start_index, self.items[index].end_index())
    }
}
