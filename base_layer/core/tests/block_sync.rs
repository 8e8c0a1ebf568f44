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

mod helpers;

use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use aether_core::{
    base_node::{
        peer_pool::PeerPoolHandle,
        sync::{BlockSynchronizer, SyncOutcome},
    },
    chain_storage::MemoryChainDatabase,
    wire::DisconnectReason,
};
use ethereum_types::U256;
use helpers::{ChainFixture, TestPeerOptions};
use tari_shutdown::Shutdown;
use tokio::time::{sleep, timeout};

const TEST_TIMEOUT: Duration = Duration::from_secs(30);

fn setup(chain_tip: u64, local_height: u64) -> (Arc<ChainFixture>, Arc<MemoryChainDatabase>, PeerPoolHandle) {
    let fixture = Arc::new(ChainFixture::generate(chain_tip));
    let db = Arc::new(MemoryChainDatabase::with_best_header(fixture.header(local_height)));
    let pool = PeerPoolHandle::new(64);
    (fixture, db, pool)
}

#[tokio::test]
async fn happy_path_downloads_in_ascending_batches() {
    let (fixture, db, pool) = setup(500, 100);
    let shutdown = Shutdown::new();
    let mut synchronizer =
        BlockSynchronizer::new(helpers::test_config(), db.clone(), pool.subscribe(), shutdown.to_signal());

    helpers::register_peer(&pool, &fixture, TestPeerOptions::best(500));
    helpers::register_peer(&pool, &fixture, TestPeerOptions::best(500));

    let outcome = timeout(TEST_TIMEOUT, synchronizer.synchronize()).await.unwrap().unwrap();
    assert_eq!(outcome, SyncOutcome::Synchronized);
    assert_eq!(db.best_height(), 500.into());
    assert_eq!(db.len(), 400);
    assert_eq!(
        db.batch_spans(),
        vec![
            (101.into(), 292.into()),
            (293.into(), 484.into()),
            (485.into(), 500.into())
        ]
    );
}

#[tokio::test]
async fn out_of_order_arrivals_persist_in_order() {
    let (fixture, db, pool) = setup(500, 100);
    let shutdown = Shutdown::new();
    let mut synchronizer =
        BlockSynchronizer::new(helpers::test_config(), db.clone(), pool.subscribe(), shutdown.to_signal());

    let progress = Arc::new(Mutex::new(Vec::new()));
    let progress_log = progress.clone();
    synchronizer.on_progress(move |finalized, _target, _peer| {
        progress_log.lock().unwrap().push(finalized);
    });
    let completed_at = Arc::new(Mutex::new(None));
    let completed = completed_at.clone();
    synchronizer.on_complete(move |height| {
        *completed.lock().unwrap() = Some(height);
    });

    // The slow peer holds its header responses back long enough for the other worker's later
    // ranges to arrive first.
    let slow = TestPeerOptions {
        header_delay: Duration::from_millis(150),
        ..TestPeerOptions::best(500)
    };
    helpers::register_peer(&pool, &fixture, slow);
    helpers::register_peer(&pool, &fixture, TestPeerOptions::best(500));

    let outcome = timeout(TEST_TIMEOUT, synchronizer.synchronize()).await.unwrap().unwrap();
    assert_eq!(outcome, SyncOutcome::Synchronized);
    assert_eq!(db.best_height(), 500.into());
    helpers::assert_contiguous_spans(&db.batch_spans(), 101, 500);

    let progress = progress.lock().unwrap();
    assert!(!progress.is_empty());
    assert!(progress.windows(2).all(|w| w[0] < w[1]), "finalized went backwards: {:?}", progress);
    assert_eq!(*completed_at.lock().unwrap(), Some(500.into()));
}

#[tokio::test]
async fn seated_liar_is_evicted_by_honest_candidate() {
    let (fixture, db, pool) = setup(500, 100);
    let fork = Arc::new(ChainFixture::fork_of(&fixture, 300, 500));
    let shutdown = Shutdown::new();
    let mut synchronizer =
        BlockSynchronizer::new(helpers::test_config(), db.clone(), pool.subscribe(), shutdown.to_signal());
    let handle = tokio::spawn(async move { synchronizer.synchronize().await });

    // The liar claims the heaviest chain, so honest candidates are the ones examined and they do
    // not know its forked tip.
    sleep(Duration::from_millis(100)).await;
    let liar = TestPeerOptions {
        claimed_difficulty: Some(fixture.total_difficulty(500) + U256::from(1000)),
        ..TestPeerOptions::best(500)
    };
    let (_, liar_client) = helpers::register_peer(&pool, &fork, liar);

    sleep(Duration::from_millis(250)).await;
    let (_, honest1) = helpers::register_peer(&pool, &fixture, TestPeerOptions::best(500));
    sleep(Duration::from_millis(250)).await;
    let (_, honest2) = helpers::register_peer(&pool, &fixture, TestPeerOptions::best(500));

    let outcome = timeout(TEST_TIMEOUT, handle).await.unwrap().unwrap().unwrap();
    assert_eq!(outcome, SyncOutcome::Synchronized);
    assert_eq!(db.best_height(), 500.into());
    helpers::assert_contiguous_spans(&db.batch_spans(), 101, 500);

    assert!(liar_client.is_disconnected());
    assert_eq!(liar_client.disconnect_reason(), Some(DisconnectReason::UselessPeer));
    assert_eq!(liar_client.range_requests(), 0, "evicted peer must serve no ranges");
    // The liar claimed the heavier chain, so agreement questions went to the honest side.
    assert_eq!(liar_client.probe_requests(), 0);
    assert!(!honest1.is_disconnected());
    assert!(!honest2.is_disconnected());
}

#[tokio::test]
async fn candidate_disagreeing_with_majority_is_rejected() {
    let (fixture, db, pool) = setup(500, 100);
    let fork = Arc::new(ChainFixture::fork_of(&fixture, 300, 450));
    let mut config = helpers::test_config();
    config.min_peers_to_start_sync = 3;
    config.wait_for_peers_timeout = Duration::from_millis(1500);
    let shutdown = Shutdown::new();
    let mut synchronizer = BlockSynchronizer::new(config, db.clone(), pool.subscribe(), shutdown.to_signal());
    let handle = tokio::spawn(async move { synchronizer.synchronize().await });

    sleep(Duration::from_millis(100)).await;
    helpers::register_peer(&pool, &fixture, TestPeerOptions::best(500));
    sleep(Duration::from_millis(250)).await;
    helpers::register_peer(&pool, &fixture, TestPeerOptions::best(500));
    sleep(Duration::from_millis(250)).await;
    // The candidate's forked chain is lighter, so it is the one examined and it disagrees with
    // both seated peers.
    let (_, liar_client) = helpers::register_peer(&pool, &fork, TestPeerOptions::best(450));

    let outcome = timeout(TEST_TIMEOUT, handle).await.unwrap().unwrap().unwrap();
    assert_eq!(outcome, SyncOutcome::NotEnoughPeers);
    // The lighter candidate was the one examined, once per seated peer.
    assert!(liar_client.probe_requests() >= 2);
    assert_eq!(liar_client.range_requests(), 0);
    // Rejection is not an eviction; the candidate is simply never used.
    assert!(!liar_client.is_disconnected());
    assert!(db.is_empty());
}

#[tokio::test]
async fn failed_range_is_reclaimed_from_another_peer() {
    let (fixture, db, pool) = setup(500, 100);
    let shutdown = Shutdown::new();
    let mut synchronizer =
        BlockSynchronizer::new(helpers::test_config(), db.clone(), pool.subscribe(), shutdown.to_signal());

    let flaky = TestPeerOptions {
        fail_bodies: true,
        ..TestPeerOptions::best(500)
    };
    let (_, flaky_client) = helpers::register_peer(&pool, &fixture, flaky);
    let (_, steady_client) = helpers::register_peer(&pool, &fixture, TestPeerOptions::best(500));

    let outcome = timeout(TEST_TIMEOUT, synchronizer.synchronize()).await.unwrap().unwrap();
    assert_eq!(outcome, SyncOutcome::Synchronized);
    assert_eq!(db.best_height(), 500.into());
    helpers::assert_contiguous_spans(&db.batch_spans(), 101, 500);

    assert!(flaky_client.is_disconnected());
    assert_eq!(flaky_client.disconnect_reason(), Some(DisconnectReason::SubprotocolError));
    assert!(!steady_client.is_disconnected());
}

#[tokio::test]
async fn sync_target_extends_to_the_tallest_trusted_peer() {
    let (fixture, db, pool) = setup(600, 100);
    let shutdown = Shutdown::new();
    let mut synchronizer =
        BlockSynchronizer::new(helpers::test_config(), db.clone(), pool.subscribe(), shutdown.to_signal());

    helpers::register_peer(&pool, &fixture, TestPeerOptions::best(500));
    helpers::register_peer(&pool, &fixture, TestPeerOptions::best(600));

    let outcome = timeout(TEST_TIMEOUT, synchronizer.synchronize()).await.unwrap().unwrap();
    assert_eq!(outcome, SyncOutcome::Synchronized);
    assert_eq!(db.best_height(), 600.into());
    helpers::assert_contiguous_spans(&db.batch_spans(), 101, 600);
}

#[tokio::test]
async fn already_synced_node_completes_without_downloading() {
    let (fixture, db, pool) = setup(500, 100);
    let shutdown = Shutdown::new();
    let mut synchronizer =
        BlockSynchronizer::new(helpers::test_config(), db.clone(), pool.subscribe(), shutdown.to_signal());

    helpers::register_peer(&pool, &fixture, TestPeerOptions::best(100));
    helpers::register_peer(&pool, &fixture, TestPeerOptions::best(100));

    let outcome = timeout(TEST_TIMEOUT, synchronizer.synchronize()).await.unwrap().unwrap();
    assert_eq!(outcome, SyncOutcome::Synchronized);
    assert!(db.is_empty());
    assert_eq!(db.best_height(), 100.into());
}

#[tokio::test]
async fn reports_not_enough_peers_when_none_connect() {
    let (_fixture, db, pool) = setup(500, 100);
    let mut config = helpers::test_config();
    config.wait_for_peers_timeout = Duration::from_millis(400);
    let shutdown = Shutdown::new();
    let mut synchronizer = BlockSynchronizer::new(config, db.clone(), pool.subscribe(), shutdown.to_signal());

    let outcome = timeout(TEST_TIMEOUT, synchronizer.synchronize()).await.unwrap().unwrap();
    assert_eq!(outcome, SyncOutcome::NotEnoughPeers);
    assert!(db.is_empty());
}

#[tokio::test]
async fn reports_timeout_when_downloads_stall() {
    let (fixture, db, pool) = setup(500, 100);
    let mut config = helpers::test_config();
    config.sync_stall_timeout = Duration::from_millis(800);
    config.stale_request_timeout = Duration::from_secs(30);
    let shutdown = Shutdown::new();
    let mut synchronizer = BlockSynchronizer::new(config, db.clone(), pool.subscribe(), shutdown.to_signal());

    let stalled = |best| TestPeerOptions {
        stall_ranges: true,
        ..TestPeerOptions::best(best)
    };
    helpers::register_peer(&pool, &fixture, stalled(500));
    helpers::register_peer(&pool, &fixture, stalled(500));

    let outcome = timeout(TEST_TIMEOUT, synchronizer.synchronize()).await.unwrap().unwrap();
    assert_eq!(outcome, SyncOutcome::TimedOut);
    assert!(db.is_empty());
}

#[tokio::test]
async fn shutdown_signal_interrupts_the_sync() {
    let (fixture, db, pool) = setup(500, 100);
    let mut shutdown = Shutdown::new();
    let mut synchronizer =
        BlockSynchronizer::new(helpers::test_config(), db.clone(), pool.subscribe(), shutdown.to_signal());

    let stalled = |best| TestPeerOptions {
        stall_ranges: true,
        ..TestPeerOptions::best(best)
    };
    helpers::register_peer(&pool, &fixture, stalled(500));
    helpers::register_peer(&pool, &fixture, stalled(500));

    let handle = tokio::spawn(async move { synchronizer.synchronize().await });
    sleep(Duration::from_millis(300)).await;
    shutdown.trigger();

    let outcome = timeout(TEST_TIMEOUT, handle).await.unwrap().unwrap().unwrap();
    assert_eq!(outcome, SyncOutcome::Interrupted);
}
