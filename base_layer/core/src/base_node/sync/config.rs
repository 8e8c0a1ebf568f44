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

use std::time::Duration;

use crate::wire;

// The trusted-set size required before block downloads begin.
const MIN_PEERS_TO_START_SYNC: usize = 2;
// Upper bound on trusted-set membership.
const MAX_TRUSTED_PEERS: usize = 8;
// How long to wait for the trust threshold before giving up on this sync round.
const WAIT_FOR_PEERS_TIMEOUT: Duration = Duration::from_secs(60);
// How long the finalized watermark may stand still before the sync round is abandoned.
const SYNC_STALL_TIMEOUT: Duration = Duration::from_secs(90);
// Age at which a slot still marked Requested is assumed orphaned and reverted.
const STALE_REQUEST_TIMEOUT: Duration = Duration::from_secs(45);
// Cadence of the sweep/respawn/timeout checks.
const WATCHDOG_INTERVAL: Duration = Duration::from_secs(1);

/// Configuration for the block synchronizer.
#[derive(Debug, Clone)]
pub struct BlockchainSyncConfig {
    /// Trust-set size required to begin downloads.
    pub min_peers_to_start_sync: usize,
    /// Maximum number of peers held in the trusted set.
    pub max_trusted_peers: usize,
    /// Upper bound on a single header request. Clamped to the wire protocol limit.
    pub max_headers_per_request: u32,
    /// Upper bound on a single body request. Clamped to the wire protocol limit.
    pub max_bodies_per_request: usize,
    /// Time allowed to reach the trust threshold before reporting `NotEnoughPeers`.
    pub wait_for_peers_timeout: Duration,
    /// Time the finalized watermark may stall before reporting `TimedOut`.
    pub sync_stall_timeout: Duration,
    /// Age at which a `Requested` slot is reverted by the sweeper.
    pub stale_request_timeout: Duration,
    /// Interval of the synchronizer's watchdog tick.
    pub watchdog_interval: Duration,
}

impl BlockchainSyncConfig {
    pub(super) fn header_request_size(&self) -> u32 {
        self.max_headers_per_request.clamp(1, wire::MAX_HEADERS_PER_REQUEST)
    }

    pub(super) fn body_request_size(&self) -> usize {
        self.max_bodies_per_request.clamp(1, wire::MAX_BODIES_PER_REQUEST)
    }
}

impl Default for BlockchainSyncConfig {
    fn default() -> Self {
        Self {
            min_peers_to_start_sync: MIN_PEERS_TO_START_SYNC,
            max_trusted_peers: MAX_TRUSTED_PEERS,
            max_headers_per_request: wire::MAX_HEADERS_PER_REQUEST,
            max_bodies_per_request: wire::MAX_BODIES_PER_REQUEST,
            wait_for_peers_timeout: WAIT_FOR_PEERS_TIMEOUT,
            sync_stall_timeout: SYNC_STALL_TIMEOUT,
            stale_request_timeout: STALE_REQUEST_TIMEOUT,
            watchdog_interval: WATCHDOG_INTERVAL,
        }
    }
}
