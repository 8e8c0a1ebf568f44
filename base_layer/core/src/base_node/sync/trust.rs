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

//! The set of peers whose chain view has been cross-validated.

use std::sync::Arc;

use log::*;
use rand::seq::SliceRandom;

use super::sync_peer::{PeerId, SyncPeer};
use crate::wire::BlockHeadersRequest;

const LOG_TARGET: &str = "c::bn::sync::trust";

/// Peers eligible to serve download requests. The set owns no peer lifetimes; membership is
/// cleared when the peer pool reports a disconnect.
pub struct TrustedPeerSet {
    peers: Vec<Arc<SyncPeer>>,
    max_size: usize,
}

impl TrustedPeerSet {
    pub fn new(max_size: usize) -> Self {
        Self {
            peers: Vec::new(),
            max_size,
        }
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn contains(&self, id: PeerId) -> bool {
        self.peers.iter().any(|p| p.id() == id)
    }

    /// Add a peer to the set. Returns false if the peer is already a member or the set is full.
    pub fn insert(&mut self, peer: Arc<SyncPeer>) -> bool {
        if self.contains(peer.id()) {
            return false;
        }
        if self.peers.len() >= self.max_size {
            debug!(
                target: LOG_TARGET,
                "Trusted set is full ({} peers); not admitting {}", self.max_size, peer
            );
            return false;
        }
        self.peers.push(peer);
        true
    }

    pub fn remove(&mut self, id: PeerId) -> Option<Arc<SyncPeer>> {
        let index = self.peers.iter().position(|p| p.id() == id)?;
        Some(self.peers.remove(index))
    }

    /// A uniformly random member.
    pub fn random(&self) -> Option<Arc<SyncPeer>> {
        self.peers.choose(&mut rand::thread_rng()).cloned()
    }

    /// A snapshot of the current membership.
    pub fn members(&self) -> Vec<Arc<SyncPeer>> {
        self.peers.clone()
    }
}

/// Test whether two peers agree on the canonical tip.
///
/// The peer with the lower claimed total difficulty is asked whether it knows the other's best
/// hash, by requesting that single header in reverse. Agreement holds iff the response contains a
/// header. A wire failure counts as disagreement; the probe is a policy decision, not an error.
pub(super) async fn peers_agree_on_chain(a: &SyncPeer, b: &SyncPeer) -> bool {
    let (examined, subject) = if a.claimed_total_difficulty() <= b.claimed_total_difficulty() {
        (a, b)
    } else {
        (b, a)
    };
    let request = BlockHeadersRequest::single_reversed(subject.claimed_best_hash());
    match examined.client().get_block_headers(request).await {
        Ok(response) => {
            let agrees = !response.headers.is_empty();
            trace!(
                target: LOG_TARGET,
                "Peer {} {} block {}",
                examined.id(),
                if agrees { "knows" } else { "does not know" },
                subject.claimed_best_hash()
            );
            agrees
        },
        Err(err) => {
            debug!(
                target: LOG_TARGET,
                "Agreement probe to peer {} failed: {}", examined.id(), err
            );
            false
        },
    }
}
