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

//! The admission side of the peer pool.
//!
//! The pool owns peer lifetimes. It assigns every admitted peer a stable [PeerId] and announces
//! connections and disconnections on a broadcast channel; the sync engine registers as an
//! observer and never outlives a peer on its own authority.

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use log::*;
use tokio::sync::broadcast;

use super::sync::{ChainView, PeerId, SyncPeer};
use crate::wire::WireClient;

const LOG_TARGET: &str = "c::bn::peer_pool";

/// Peer lifecycle notifications emitted by the pool.
#[derive(Debug, Clone)]
pub enum PeerPoolEvent {
    PeerConnected(Arc<SyncPeer>),
    PeerDisconnected(PeerId),
}

pub type PeerPoolEventReceiver = broadcast::Receiver<PeerPoolEvent>;

/// Handle through which the networking layer admits peers and reports their loss.
pub struct PeerPoolHandle {
    event_tx: broadcast::Sender<PeerPoolEvent>,
    next_peer_id: AtomicU64,
}

impl PeerPoolHandle {
    pub fn new(event_capacity: usize) -> Self {
        let (event_tx, _) = broadcast::channel(event_capacity);
        Self {
            event_tx,
            next_peer_id: AtomicU64::new(0),
        }
    }

    /// Subscribe to peer lifecycle events.
    pub fn subscribe(&self) -> PeerPoolEventReceiver {
        self.event_tx.subscribe()
    }

    /// Admit a peer whose sub-protocol handshake has completed. The chain view is read from the
    /// wire client's handshake cache and the peer receives the next monotonic id.
    pub fn register_peer(&self, client: Arc<dyn WireClient>) -> Arc<SyncPeer> {
        let id = PeerId::new(self.next_peer_id.fetch_add(1, Ordering::Relaxed));
        let view = ChainView::new(client.best_block_hash(), client.best_total_difficulty());
        let peer = Arc::new(SyncPeer::new(id, view, client));
        debug!(target: LOG_TARGET, "Admitted {}", peer);
        let _ = self.event_tx.send(PeerPoolEvent::PeerConnected(peer.clone()));
        peer
    }

    /// Report that the peer with the given id has gone away.
    pub fn peer_disconnected(&self, id: PeerId) {
        debug!(target: LOG_TARGET, "Peer {} disconnected", id);
        let _ = self.event_tx.send(PeerPoolEvent::PeerDisconnected(id));
    }
}
