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

use std::{
    collections::HashSet,
    fmt::{Display, Error, Formatter},
    mem,
    sync::{Arc, Mutex, MutexGuard},
    time::Instant,
};

use futures::{future::BoxFuture, stream::FuturesUnordered, FutureExt, StreamExt};
use log::*;
use tari_shutdown::ShutdownSignal;
use tokio::{
    sync::broadcast::error::RecvError,
    time::{self, MissedTickBehavior},
};

use super::{
    config::BlockchainSyncConfig,
    error::BlockSyncError,
    hooks::Hooks,
    sync_peer::{PeerId, SyncPeer},
    trust::{peers_agree_on_chain, TrustedPeerSet},
    work_queue::{ClaimedSlot, WorkQueue},
};
use crate::{
    base_node::peer_pool::{PeerPoolEvent, PeerPoolEventReceiver},
    blocks::{BlockBody, BlockHeader, BlockNumber},
    chain_storage::{ChainSink, ChainStorageError},
    wire::{BlockHeadersRequest, DisconnectReason, WireError},
};

const LOG_TARGET: &str = "c::bn::block_sync";

/// Terminal result of a sync round.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    /// The queue was drained and every block up to the sync target was persisted.
    Synchronized,
    /// The trust threshold was not reached within the configured time bound.
    NotEnoughPeers,
    /// Downloads stalled without progress within the configured time bound.
    TimedOut,
    /// The shutdown signal was triggered before the sync completed.
    Interrupted,
}

impl Display for SyncOutcome {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), Error> {
        match self {
            SyncOutcome::Synchronized => write!(f, "synchronized"),
            SyncOutcome::NotEnoughPeers => write!(f, "not enough peers"),
            SyncOutcome::TimedOut => write!(f, "timed out"),
            SyncOutcome::Interrupted => write!(f, "interrupted"),
        }
    }
}

/// State shared between the synchronizer's event loop and its download tasks. The work queue and
/// trusted set live behind plain mutexes that are never held across an await point; the persist
/// guard serialises the reorder drain so the chain database sees batches in ascending order.
struct SyncShared {
    queue: Mutex<WorkQueue>,
    trusted: Mutex<TrustedPeerSet>,
    persist_guard: tokio::sync::Mutex<()>,
}

impl SyncShared {
    fn queue(&self) -> MutexGuard<'_, WorkQueue> {
        self.queue.lock().unwrap()
    }

    fn trusted(&self) -> MutexGuard<'_, TrustedPeerSet> {
        self.trusted.lock().unwrap()
    }
}

/// Outcome of a trust probe on a candidate peer: the candidate and the pairwise agreement result
/// for every trusted peer that was consulted.
struct TrustProbe {
    candidate: Arc<SyncPeer>,
    agreements: Vec<(PeerId, bool)>,
}

struct TaskExit {
    peer_id: PeerId,
    outcome: TaskOutcome,
}

enum TaskOutcome {
    /// The task ran out of claimable work.
    Completed,
    /// The peer failed a request and was disconnected.
    PeerFailed,
    /// Persistence failed; the whole sync round must abort.
    Fatal(ChainStorageError),
}

/// The parallel fast-sync engine.
///
/// One download task runs per trusted peer, all feeding the shared [WorkQueue]. Peers are admitted
/// to the trusted set by the pairwise agreement protocol; once the set reaches
/// `min_peers_to_start_sync`, downloads begin. The engine reacts to peer churn reported by the
/// peer pool and recovers ranges lost to failed or vanished peers.
pub struct BlockSynchronizer<T> {
    config: BlockchainSyncConfig,
    db: Arc<T>,
    pool_events: PeerPoolEventReceiver,
    hooks: Hooks,
    shutdown_signal: ShutdownSignal,
}

impl<T: ChainSink> BlockSynchronizer<T> {
    pub fn new(
        config: BlockchainSyncConfig,
        db: Arc<T>,
        pool_events: PeerPoolEventReceiver,
        shutdown_signal: ShutdownSignal,
    ) -> Self {
        Self {
            config,
            db,
            pool_events,
            hooks: Default::default(),
            shutdown_signal,
        }
    }

    /// Register a hook that is called once the trust threshold is reached, with the peers the
    /// download starts from.
    pub fn on_starting<H>(&mut self, hook: H)
    where H: Fn(&[Arc<SyncPeer>]) + Send + Sync + 'static {
        self.hooks.add_on_starting_hook(hook);
    }

    /// Register a hook that is called after each batch is persisted, with the finalized height,
    /// the sync target and the peer that supplied the batch.
    pub fn on_progress<H>(&mut self, hook: H)
    where H: Fn(BlockNumber, BlockNumber, &SyncPeer) + Send + Sync + 'static {
        self.hooks.add_on_progress_hook(hook);
    }

    /// Register a hook that is called with the final height once the sync completes.
    pub fn on_complete<H>(&mut self, hook: H)
    where H: Fn(BlockNumber) + Send + Sync + 'static {
        self.hooks.add_on_complete_hook(hook);
    }

    /// Run the sync round to completion.
    ///
    /// Returns [SyncOutcome::Synchronized] once every block up to the sync target has been handed
    /// to the chain database in ascending order. Peer failures are absorbed; only persistence
    /// failures are fatal.
    pub async fn synchronize(&mut self) -> Result<SyncOutcome, BlockSyncError> {
        let best_header = self.db.best_header().await?;
        let local_height = best_header.number;
        info!(
            target: LOG_TARGET,
            "Starting block sync from local best block #{}", local_height
        );

        let shared = Arc::new(SyncShared {
            queue: Mutex::new(WorkQueue::new(local_height, self.config.header_request_size())),
            trusted: Mutex::new(TrustedPeerSet::new(self.config.max_trusted_peers)),
            persist_guard: tokio::sync::Mutex::new(()),
        });
        let hooks = Arc::new(mem::take(&mut self.hooks));

        // Move the buffered receiver into the loop and leave a fresh subscription behind for any
        // later sync round.
        let fresh = self.pool_events.resubscribe();
        let mut pool_events = mem::replace(&mut self.pool_events, fresh);
        let mut shutdown_signal = self.shutdown_signal.clone();

        let mut trust_probes: FuturesUnordered<BoxFuture<'static, TrustProbe>> = FuturesUnordered::new();
        let mut downloads: FuturesUnordered<BoxFuture<'static, TaskExit>> = FuturesUnordered::new();
        let mut active_downloads = HashSet::new();
        let mut bootstrapped = false;
        let mut pool_closed = false;
        let started = Instant::now();
        let mut last_height = local_height;
        let mut last_advance = Instant::now();

        let mut watchdog = time::interval(self.config.watchdog_interval);
        watchdog.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                event = pool_events.recv(), if !pool_closed => match event {
                    Ok(PeerPoolEvent::PeerConnected(peer)) => {
                        self.start_trust_probe(&shared, &mut trust_probes, peer);
                    },
                    Ok(PeerPoolEvent::PeerDisconnected(peer_id)) => {
                        if shared.trusted().remove(peer_id).is_some() {
                            info!(target: LOG_TARGET, "Trusted peer {} disconnected", peer_id);
                        }
                    },
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(
                            target: LOG_TARGET,
                            "Peer pool event stream lagged; {} event(s) dropped", skipped
                        );
                    },
                    Err(RecvError::Closed) => {
                        debug!(target: LOG_TARGET, "Peer pool event stream closed");
                        pool_closed = true;
                    },
                },

                Some(probe) = trust_probes.next(), if !trust_probes.is_empty() => {
                    self.apply_trust_verdict(
                        &shared,
                        probe,
                        &mut trust_probes,
                        &mut downloads,
                        &mut active_downloads,
                        &mut bootstrapped,
                        &hooks,
                    );
                },

                Some(exit) = downloads.next(), if !downloads.is_empty() => {
                    active_downloads.remove(&exit.peer_id);
                    match exit.outcome {
                        TaskOutcome::Completed => {
                            debug!(target: LOG_TARGET, "Download task for peer {} finished", exit.peer_id);
                        },
                        TaskOutcome::PeerFailed => {
                            shared.trusted().remove(exit.peer_id);
                        },
                        TaskOutcome::Fatal(err) => {
                            error!(target: LOG_TARGET, "Aborting block sync: {}", err);
                            return Err(err.into());
                        },
                    }
                    if let Some(outcome) = self.check_completion(&shared, bootstrapped, &active_downloads, &hooks) {
                        return Ok(outcome);
                    }
                },

                _ = watchdog.tick() => {
                    let now = Instant::now();
                    {
                        let mut queue = shared.queue();
                        let swept = queue.revert_stale(self.config.stale_request_timeout, now);
                        if swept > 0 {
                            debug!(target: LOG_TARGET, "Stale-request sweep reverted {} slot(s)", swept);
                        }
                    }
                    self.respawn_idle_workers(&shared, bootstrapped, &mut downloads, &mut active_downloads, &hooks);

                    if let Some(outcome) = self.check_completion(&shared, bootstrapped, &active_downloads, &hooks) {
                        return Ok(outcome);
                    }
                    let finalized = shared.queue().finalized();
                    if finalized > last_height {
                        last_height = finalized;
                        last_advance = now;
                    }
                    if !bootstrapped && started.elapsed() >= self.config.wait_for_peers_timeout {
                        warn!(
                            target: LOG_TARGET,
                            "Could not assemble {} trusted peers within {:.2?}",
                            self.config.min_peers_to_start_sync,
                            self.config.wait_for_peers_timeout
                        );
                        return Ok(SyncOutcome::NotEnoughPeers);
                    }
                    if bootstrapped && last_advance.elapsed() >= self.config.sync_stall_timeout {
                        warn!(
                            target: LOG_TARGET,
                            "No sync progress past #{} within {:.2?}", last_height, self.config.sync_stall_timeout
                        );
                        return Ok(SyncOutcome::TimedOut);
                    }
                },

                _ = shutdown_signal.wait() => {
                    info!(target: LOG_TARGET, "Shutdown signal received; interrupting block sync");
                    return Ok(SyncOutcome::Interrupted);
                },
            }
        }
    }

    /// Schedule the trust protocol for a newly connected candidate as an independent task.
    /// Failures are absorbed by the probe itself; a verdict is always produced.
    fn start_trust_probe(
        &self,
        shared: &Arc<SyncShared>,
        trust_probes: &mut FuturesUnordered<BoxFuture<'static, TrustProbe>>,
        candidate: Arc<SyncPeer>,
    ) {
        if !candidate.claimed_view().initialized {
            debug!(
                target: LOG_TARGET,
                "Ignoring candidate {}: chain view not initialized", candidate
            );
            return;
        }

        let probe_set = {
            let trusted = shared.trusted();
            if trusted.contains(candidate.id()) {
                return;
            }
            if trusted.len() >= self.config.min_peers_to_start_sync {
                trusted.random().into_iter().collect::<Vec<_>>()
            } else {
                trusted.members()
            }
        };

        debug!(
            target: LOG_TARGET,
            "Running trust protocol for candidate {} against {} peer(s)",
            candidate,
            probe_set.len()
        );
        trust_probes.push(
            async move {
                let mut agreements = Vec::with_capacity(probe_set.len());
                for trusted_peer in &probe_set {
                    let agrees = peers_agree_on_chain(&candidate, trusted_peer).await;
                    agreements.push((trusted_peer.id(), agrees));
                }
                TrustProbe { candidate, agreements }
            }
            .boxed(),
        );
    }

    /// Apply a finished trust probe against the current trusted set.
    ///
    /// Membership may have changed while the probe was on the wire. Dissent from peers that have
    /// since vanished is ignored; if the probe did not cover the current membership it is re-run
    /// instead of being trusted.
    #[allow(clippy::too_many_arguments)]
    fn apply_trust_verdict(
        &self,
        shared: &Arc<SyncShared>,
        probe: TrustProbe,
        trust_probes: &mut FuturesUnordered<BoxFuture<'static, TrustProbe>>,
        downloads: &mut FuturesUnordered<BoxFuture<'static, TaskExit>>,
        active_downloads: &mut HashSet<PeerId>,
        bootstrapped: &mut bool,
        hooks: &Arc<Hooks>,
    ) {
        let TrustProbe { candidate, agreements } = probe;
        let probed: HashSet<PeerId> = agreements.iter().map(|(id, _)| *id).collect();

        let mut trusted = shared.trusted();
        if trusted.contains(candidate.id()) {
            return;
        }

        let member_count = trusted.len();
        let admitted = if member_count == 0 {
            trusted.insert(candidate.clone())
        } else if member_count < self.config.min_peers_to_start_sync {
            if trusted.members().iter().any(|m| !probed.contains(&m.id())) {
                drop(trusted);
                debug!(
                    target: LOG_TARGET,
                    "Trusted set changed during probe of {}; probing again", candidate
                );
                self.start_trust_probe(shared, trust_probes, candidate);
                return;
            }
            let dissenters: Vec<PeerId> = agreements
                .iter()
                .filter(|(id, agrees)| !*agrees && trusted.contains(*id))
                .map(|(id, _)| *id)
                .collect();
            match dissenters.len() {
                0 => trusted.insert(candidate.clone()),
                1 => {
                    // A single dissenter is treated as the liar and evicted in favour of the
                    // candidate the rest of the set agrees with.
                    if let Some(evicted) = trusted.remove(dissenters[0]) {
                        warn!(
                            target: LOG_TARGET,
                            "Evicting {}: disagrees with candidate {} on the chain tip", evicted, candidate
                        );
                        let client = evicted.client().clone();
                        tokio::spawn(async move {
                            client.disconnect(DisconnectReason::UselessPeer).await;
                        });
                    }
                    trusted.insert(candidate.clone())
                },
                n => {
                    debug!(
                        target: LOG_TARGET,
                        "Rejecting candidate {}: disagrees with {} trusted peer(s)", candidate, n
                    );
                    false
                },
            }
        } else {
            if !agreements.iter().any(|(id, _)| trusted.contains(*id)) {
                drop(trusted);
                debug!(
                    target: LOG_TARGET,
                    "Probed peer no longer trusted; probing {} again", candidate
                );
                self.start_trust_probe(shared, trust_probes, candidate);
                return;
            }
            if agreements.iter().all(|(_, agrees)| *agrees) {
                trusted.insert(candidate.clone())
            } else {
                debug!(
                    target: LOG_TARGET,
                    "Rejecting candidate {}: disagrees with the trusted set", candidate
                );
                false
            }
        };

        if !admitted {
            return;
        }
        info!(
            target: LOG_TARGET,
            "Peer {} admitted to the trusted set ({} member(s))",
            candidate,
            trusted.len()
        );

        if !*bootstrapped && trusted.len() >= self.config.min_peers_to_start_sync {
            *bootstrapped = true;
            let members = trusted.members();
            drop(trusted);
            info!(
                target: LOG_TARGET,
                "Trust threshold reached with {} peer(s); starting block download",
                members.len()
            );
            hooks.call_on_starting_hooks(&members);
            for peer in members {
                self.spawn_download(shared, downloads, active_downloads, hooks, peer);
            }
        } else if *bootstrapped {
            drop(trusted);
            self.spawn_download(shared, downloads, active_downloads, hooks, candidate);
        }
    }

    fn spawn_download(
        &self,
        shared: &Arc<SyncShared>,
        downloads: &mut FuturesUnordered<BoxFuture<'static, TaskExit>>,
        active_downloads: &mut HashSet<PeerId>,
        hooks: &Arc<Hooks>,
        peer: Arc<SyncPeer>,
    ) {
        if !active_downloads.insert(peer.id()) {
            return;
        }
        debug!(target: LOG_TARGET, "Starting download task for {}", peer);
        downloads.push(
            obtain_blocks_from_peer(
                shared.clone(),
                self.db.clone(),
                hooks.clone(),
                self.config.clone(),
                peer,
            )
            .boxed(),
        );
    }

    /// Restart download tasks for trusted peers that have none while claimable work remains. A
    /// range reverted after its worker exited would otherwise never be reclaimed.
    fn respawn_idle_workers(
        &self,
        shared: &Arc<SyncShared>,
        bootstrapped: bool,
        downloads: &mut FuturesUnordered<BoxFuture<'static, TaskExit>>,
        active_downloads: &mut HashSet<PeerId>,
        hooks: &Arc<Hooks>,
    ) {
        if !bootstrapped || !shared.queue().has_available_work() {
            return;
        }
        let members = shared.trusted().members();
        for peer in members {
            if !active_downloads.contains(&peer.id()) {
                self.spawn_download(shared, downloads, active_downloads, hooks, peer);
            }
        }
    }

    fn check_completion(
        &self,
        shared: &Arc<SyncShared>,
        bootstrapped: bool,
        active_downloads: &HashSet<PeerId>,
        hooks: &Arc<Hooks>,
    ) -> Option<SyncOutcome> {
        if !bootstrapped || !active_downloads.is_empty() {
            return None;
        }
        let final_height = {
            let queue = shared.queue();
            if !queue.is_complete() {
                return None;
            }
            queue.finalized()
        };
        info!(target: LOG_TARGET, "Block sync complete at #{}", final_height);
        hooks.call_on_complete_hooks(final_height);
        Some(SyncOutcome::Synchronized)
    }
}

/// The per-peer download loop.
///
/// Claims a range, fetches its headers and bodies, stores them on the work item and drains the
/// reorder buffer. Any request failure reverts the claimed range, disconnects the peer and ends
/// the task; other workers pick the range up again.
async fn obtain_blocks_from_peer<T: ChainSink>(
    shared: Arc<SyncShared>,
    db: Arc<T>,
    hooks: Arc<Hooks>,
    config: BlockchainSyncConfig,
    peer: Arc<SyncPeer>,
) -> TaskExit {
    let peer_id = peer.id();

    match probe_best_number(&peer).await {
        Ok(best) => {
            if shared.queue().raise_end_block(best) {
                info!(target: LOG_TARGET, "Sync target extended to #{} by {}", best, peer);
            }
        },
        Err(err) => {
            warn!(target: LOG_TARGET, "Best block probe to {} failed: {}", peer, err);
            peer.client().disconnect(DisconnectReason::SubprotocolError).await;
            return TaskExit {
                peer_id,
                outcome: TaskOutcome::PeerFailed,
            };
        },
    }

    loop {
        let claim = { shared.queue().claim_available(peer_id, Instant::now()) };
        let claim = match claim {
            Some(claim) => claim,
            None => {
                debug!(target: LOG_TARGET, "No claimable work left for {}", peer);
                return TaskExit {
                    peer_id,
                    outcome: TaskOutcome::Completed,
                };
            },
        };

        match fetch_range(&peer, &claim, config.body_request_size()).await {
            Ok((headers, bodies)) => {
                if shared.queue().mark_received(&claim, headers, bodies).is_err() {
                    // The claim was swept while the request was on the wire and the slot belongs
                    // to another worker now. Drop the data and move on.
                    debug!(
                        target: LOG_TARGET,
                        "Discarding response for superseded claim on slot {} from {}", claim.index, peer
                    );
                    continue;
                }
                if let Err(err) = drain_in_order(&shared, &*db, &hooks, &peer).await {
                    error!(target: LOG_TARGET, "Failed to persist block batch: {}", err);
                    return TaskExit {
                        peer_id,
                        outcome: TaskOutcome::Fatal(err),
                    };
                }
            },
            Err(err) => {
                warn!(
                    target: LOG_TARGET,
                    "Peer {} failed blocks #{}..#{}: {}",
                    peer,
                    claim.start_index,
                    claim.start_index.saturating_add((claim.num_blocks - 1).into()),
                    err
                );
                shared.queue().revert(&claim);
                peer.client().disconnect(DisconnectReason::SubprotocolError).await;
                return TaskExit {
                    peer_id,
                    outcome: TaskOutcome::PeerFailed,
                };
            },
        }
    }
}

/// Ask the peer for the header at its claimed best hash to learn its height.
async fn probe_best_number(peer: &SyncPeer) -> Result<BlockNumber, RangeFetchError> {
    let request = BlockHeadersRequest::single(peer.claimed_best_hash());
    let response = peer.client().get_block_headers(request).await?;
    let header = response.headers.first().ok_or(RangeFetchError::EmptyResponse)?;
    Ok(header.number)
}

/// Fetch the headers of a claimed range and the bodies that belong to them.
///
/// The header run is checked for protocol sanity before any body is requested: it must start at
/// the claimed height, stay sequential and keep its parent links intact. A run shorter than the
/// claim is accepted as the tail of the peer's chain. Bodies are fetched in sub-batches and must
/// match the headers one to one.
async fn fetch_range(
    peer: &SyncPeer,
    claim: &ClaimedSlot,
    body_request_size: usize,
) -> Result<(Vec<BlockHeader>, Vec<BlockBody>), RangeFetchError> {
    let request = BlockHeadersRequest::forward_from(claim.start_index, claim.num_blocks);
    let response = peer.client().get_block_headers(request).await?;
    let headers = response.headers;
    if headers.is_empty() {
        return Err(RangeFetchError::EmptyResponse);
    }
    if headers.len() > claim.num_blocks as usize {
        return Err(RangeFetchError::TooManyHeaders {
            requested: claim.num_blocks,
            returned: headers.len(),
        });
    }
    check_header_sequence(claim.start_index, &headers)?;

    let hashes: Vec<_> = headers.iter().map(BlockHeader::hash).collect();
    let mut bodies = Vec::with_capacity(headers.len());
    for chunk in hashes.chunks(body_request_size) {
        let response = peer.client().get_block_bodies(chunk.to_vec()).await?;
        bodies.extend(response.bodies);
    }
    if bodies.len() != headers.len() {
        return Err(RangeFetchError::BodyCountMismatch {
            headers: headers.len(),
            bodies: bodies.len(),
        });
    }
    Ok((headers, bodies))
}

fn check_header_sequence(start: BlockNumber, headers: &[BlockHeader]) -> Result<(), RangeFetchError> {
    if headers[0].number != start {
        return Err(RangeFetchError::UnexpectedStart {
            expected: start,
            got: headers[0].number,
        });
    }
    for pair in headers.windows(2) {
        if pair[1].number != pair[0].number.saturating_add(BlockNumber::one()) {
            return Err(RangeFetchError::NonSequentialHeaders { after: pair[0].number });
        }
        if pair[1].parent_hash != pair[0].hash() {
            return Err(RangeFetchError::BrokenChainLink { number: pair[1].number });
        }
    }
    Ok(())
}

/// Persist every `Received` item that directly follows the finalized watermark, in order.
///
/// The persist guard admits one drainer at a time, so repeated invocation from racing workers is
/// safe and the chain database observes a single totally ordered stream of batches.
async fn drain_in_order<T: ChainSink>(
    shared: &SyncShared,
    db: &T,
    hooks: &Hooks,
    peer: &SyncPeer,
) -> Result<(), ChainStorageError> {
    let _guard = shared.persist_guard.lock().await;
    loop {
        let batch = { shared.queue().next_batch_to_persist() };
        let batch = match batch {
            Some(batch) => batch,
            None => return Ok(()),
        };
        debug!(
            target: LOG_TARGET,
            "Persisting blocks #{}..#{} ({} block(s))",
            batch.start_index,
            batch.end_index,
            batch.headers.len()
        );
        db.persist(batch.headers, batch.bodies).await?;
        let (finalized, target) = {
            let queue = shared.queue();
            (queue.finalized(), queue.end_block())
        };
        hooks.call_on_progress_hooks(finalized, target, peer);
    }
}

#[derive(Debug, thiserror::Error)]
enum RangeFetchError {
    #[error("wire error: {0}")]
    Wire(#[from] WireError),
    #[error("peer returned no headers")]
    EmptyResponse,
    #[error("peer returned {returned} headers for a request of {requested}")]
    TooManyHeaders { requested: u32, returned: usize },
    #[error("first header is #{got}, expected #{expected}")]
    UnexpectedStart {
        expected: BlockNumber,
        got: BlockNumber,
    },
    #[error("header run is not sequential after #{after}")]
    NonSequentialHeaders { after: BlockNumber },
    #[error("header after #{number} does not link to its parent")]
    BrokenChainLink { number: BlockNumber },
    #[error("fetched {bodies} bodies for {headers} headers")]
    BodyCountMismatch { headers: usize, bodies: usize },
}

#[cfg(test)]
mod test {
    use ethereum_types::H256;

    use super::*;

    fn headers_from(start: u64, len: usize) -> Vec<BlockHeader> {
        let mut headers: Vec<BlockHeader> = Vec::with_capacity(len);
        for i in 0..len {
            let parent_hash = headers.last().map(BlockHeader::hash).unwrap_or_else(H256::zero);
            headers.push(BlockHeader {
                parent_hash,
                number: (start + i as u64).into(),
                difficulty: 1.into(),
                timestamp: i as u64,
                transactions_root: H256::zero(),
                extra_data: Vec::new(),
            });
        }
        headers
    }

    #[test]
    fn accepts_a_well_formed_sequence() {
        let headers = headers_from(101, 5);
        assert!(check_header_sequence(101.into(), &headers).is_ok());
    }

    #[test]
    fn rejects_a_run_starting_at_the_wrong_height() {
        let headers = headers_from(102, 5);
        let err = check_header_sequence(101.into(), &headers).unwrap_err();
        assert!(matches!(err, RangeFetchError::UnexpectedStart { .. }));
    }

    #[test]
    fn rejects_non_sequential_numbers() {
        let mut headers = headers_from(101, 5);
        headers[3].number = 199.into();
        let err = check_header_sequence(101.into(), &headers).unwrap_err();
        assert!(matches!(err, RangeFetchError::NonSequentialHeaders { .. }));
    }

    #[test]
    fn rejects_broken_parent_links() {
        let mut headers = headers_from(101, 5);
        headers[2].parent_hash = H256::repeat_byte(0xfe);
        let err = check_header_sequence(101.into(), &headers).unwrap_err();
        assert!(matches!(err, RangeFetchError::BrokenChainLink { .. }));
    }
}
