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

//! Support code for the block sync integration tests: a deterministic chain fixture and a
//! scripted wire client with failure and latency knobs.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
        Mutex,
    },
    time::Duration,
};

use aether_core::{
    base_node::{
        peer_pool::PeerPoolHandle,
        sync::{BlockchainSyncConfig, SyncPeer},
    },
    blocks::{BlockBody, BlockHeader, BlockNumber},
    wire::{
        BlockBodiesResponse,
        BlockHeadersRequest,
        BlockHeadersResponse,
        DisconnectReason,
        HashOrNumber,
        WireClient,
        WireError,
    },
};
use async_trait::async_trait;
use ethereum_types::{H256, U256};

const DIFFICULTY_PER_BLOCK: u64 = 100;

/// A deterministic chain of linked headers and bodies, numbered from genesis.
pub struct ChainFixture {
    headers: Vec<BlockHeader>,
    bodies: Vec<BlockBody>,
    cumulative_difficulty: Vec<U256>,
    index: HashMap<H256, u64>,
}

impl ChainFixture {
    pub fn generate(tip: u64) -> Self {
        Self::build(tip, None)
    }

    /// A chain sharing `base`'s history up to and including `fork_point`, diverging after it.
    pub fn fork_of(base: &ChainFixture, fork_point: u64, tip: u64) -> Self {
        Self::build(tip, Some((base, fork_point)))
    }

    fn build(tip: u64, fork: Option<(&ChainFixture, u64)>) -> Self {
        let mut headers: Vec<BlockHeader> = Vec::with_capacity(tip as usize + 1);
        let mut bodies = Vec::with_capacity(tip as usize + 1);
        let mut cumulative_difficulty = Vec::with_capacity(tip as usize + 1);
        let mut index = HashMap::new();

        for n in 0..=tip {
            let (header, body) = match fork {
                Some((base, fork_point)) if n <= fork_point => (base.headers[n as usize].clone(), base.bodies[n as usize].clone()),
                _ => {
                    let body = BlockBody {
                        transactions: vec![n.to_be_bytes().to_vec()],
                        ommers: Vec::new(),
                    };
                    let header = BlockHeader {
                        parent_hash: headers.last().map(BlockHeader::hash).unwrap_or_else(H256::zero),
                        number: n.into(),
                        difficulty: DIFFICULTY_PER_BLOCK.into(),
                        timestamp: 1_650_000_000 + n,
                        transactions_root: keccak_hash::keccak(&body.transactions[0]),
                        extra_data: if fork.is_some() { b"fork".to_vec() } else { Vec::new() },
                    };
                    (header, body)
                },
            };
            let previous = cumulative_difficulty.last().copied().unwrap_or_else(U256::zero);
            cumulative_difficulty.push(previous + header.difficulty);
            index.insert(header.hash(), n);
            headers.push(header);
            bodies.push(body);
        }

        Self {
            headers,
            bodies,
            cumulative_difficulty,
            index,
        }
    }

    pub fn header(&self, n: u64) -> BlockHeader {
        self.headers[n as usize].clone()
    }

    pub fn body(&self, n: u64) -> BlockBody {
        self.bodies[n as usize].clone()
    }

    pub fn hash(&self, n: u64) -> H256 {
        self.headers[n as usize].hash()
    }

    pub fn total_difficulty(&self, n: u64) -> U256 {
        self.cumulative_difficulty[n as usize]
    }

    pub fn index_of(&self, hash: &H256) -> Option<u64> {
        self.index.get(hash).copied()
    }
}

/// Behaviour knobs for a [TestWireClient].
pub struct TestPeerOptions {
    pub claimed_best: u64,
    pub claimed_difficulty: Option<U256>,
    pub fail_bodies: bool,
    pub header_delay: Duration,
    pub stall_ranges: bool,
}

impl TestPeerOptions {
    pub fn best(claimed_best: u64) -> Self {
        Self {
            claimed_best,
            claimed_difficulty: None,
            fail_bodies: false,
            header_delay: Duration::ZERO,
            stall_ranges: false,
        }
    }
}

/// A wire client serving a [ChainFixture] from memory.
///
/// Hash lookups answer from the whole fixture (the peer has seen the block announcements); range
/// requests serve at most up to `claimed_best`. Once disconnected, every request fails.
pub struct TestWireClient {
    chain: Arc<ChainFixture>,
    claimed_best: u64,
    claimed_difficulty: Option<U256>,
    fail_bodies: bool,
    header_delay: Duration,
    stall_ranges: bool,
    disconnected: AtomicBool,
    disconnect_reason: Mutex<Option<DisconnectReason>>,
    probe_requests: AtomicUsize,
    range_requests: AtomicUsize,
}

impl TestWireClient {
    pub fn new(chain: Arc<ChainFixture>, options: TestPeerOptions) -> Self {
        Self {
            chain,
            claimed_best: options.claimed_best,
            claimed_difficulty: options.claimed_difficulty,
            fail_bodies: options.fail_bodies,
            header_delay: options.header_delay,
            stall_ranges: options.stall_ranges,
            disconnected: AtomicBool::new(false),
            disconnect_reason: Mutex::new(None),
            probe_requests: AtomicUsize::new(0),
            range_requests: AtomicUsize::new(0),
        }
    }

    pub fn is_disconnected(&self) -> bool {
        self.disconnected.load(Ordering::Relaxed)
    }

    pub fn disconnect_reason(&self) -> Option<DisconnectReason> {
        *self.disconnect_reason.lock().unwrap()
    }

    pub fn probe_requests(&self) -> usize {
        self.probe_requests.load(Ordering::Relaxed)
    }

    pub fn range_requests(&self) -> usize {
        self.range_requests.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl WireClient for TestWireClient {
    fn best_block_hash(&self) -> H256 {
        self.chain.hash(self.claimed_best)
    }

    fn best_total_difficulty(&self) -> U256 {
        self.claimed_difficulty
            .unwrap_or_else(|| self.chain.total_difficulty(self.claimed_best))
    }

    async fn get_block_headers(&self, request: BlockHeadersRequest) -> Result<BlockHeadersResponse, WireError> {
        if self.is_disconnected() {
            return Err(WireError::ConnectionClosed);
        }
        match request.start_block {
            HashOrNumber::Hash(hash) => {
                self.probe_requests.fetch_add(1, Ordering::Relaxed);
                let headers = match self.chain.index_of(&hash) {
                    Some(n) => vec![self.chain.header(n)],
                    None => Vec::new(),
                };
                Ok(BlockHeadersResponse { headers })
            },
            HashOrNumber::Number(start) => {
                self.range_requests.fetch_add(1, Ordering::Relaxed);
                if self.stall_ranges {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    return Err(WireError::Timeout);
                }
                if !self.header_delay.is_zero() {
                    tokio::time::sleep(self.header_delay).await;
                }
                let start = start.low_u64();
                if start > self.claimed_best {
                    return Ok(BlockHeadersResponse::default());
                }
                let end = (start + request.max_results as u64 - 1).min(self.claimed_best);
                let headers = (start..=end).map(|n| self.chain.header(n)).collect();
                Ok(BlockHeadersResponse { headers })
            },
        }
    }

    async fn get_block_bodies(&self, hashes: Vec<H256>) -> Result<BlockBodiesResponse, WireError> {
        if self.is_disconnected() {
            return Err(WireError::ConnectionClosed);
        }
        if self.fail_bodies {
            return Err(WireError::RequestFailed("body store unavailable".to_string()));
        }
        let bodies = hashes
            .iter()
            .filter_map(|hash| self.chain.index_of(hash))
            .map(|n| self.chain.body(n))
            .collect();
        Ok(BlockBodiesResponse { bodies })
    }

    async fn disconnect(&self, reason: DisconnectReason) {
        self.disconnected.store(true, Ordering::Relaxed);
        *self.disconnect_reason.lock().unwrap() = Some(reason);
    }
}

/// Register a scripted peer with the pool, keeping a handle on its client for assertions.
pub fn register_peer(
    pool: &PeerPoolHandle,
    chain: &Arc<ChainFixture>,
    options: TestPeerOptions,
) -> (Arc<SyncPeer>, Arc<TestWireClient>) {
    let client = Arc::new(TestWireClient::new(chain.clone(), options));
    let peer = pool.register_peer(client.clone() as Arc<dyn WireClient>);
    (peer, client)
}

/// Sync configuration with time bounds tightened for tests.
pub fn test_config() -> BlockchainSyncConfig {
    BlockchainSyncConfig {
        wait_for_peers_timeout: Duration::from_secs(3),
        sync_stall_timeout: Duration::from_secs(5),
        stale_request_timeout: Duration::from_secs(1),
        watchdog_interval: Duration::from_millis(25),
        ..Default::default()
    }
}

/// Assert that `spans` covers exactly `[first, last]` with contiguous ascending batches.
pub fn assert_contiguous_spans(spans: &[(BlockNumber, BlockNumber)], first: u64, last: u64) {
    assert!(!spans.is_empty(), "no batches were persisted");
    assert_eq!(spans[0].0, first.into());
    assert_eq!(spans[spans.len() - 1].1, last.into());
    for pair in spans.windows(2) {
        assert_eq!(
            pair[0].1 + U256::one(),
            pair[1].0,
            "batches are not contiguous: {:?}",
            spans
        );
    }
}
