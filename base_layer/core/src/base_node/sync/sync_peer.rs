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
    fmt,
    fmt::{Display, Formatter},
    hash::{Hash, Hasher},
    sync::Arc,
};

use ethereum_types::{H256, U256};

use crate::wire::WireClient;

/// Stable peer identity, assigned monotonically by the peer pool at admission. Peer equality and
/// hashing derive from this id alone, never from the peer's chain view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId(u64);

impl PeerId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl Display for PeerId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A peer's observable chain view, cached from the sub-protocol handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainView {
    pub best_block_hash: H256,
    pub best_total_difficulty: U256,
    pub initialized: bool,
}

impl ChainView {
    pub fn new(best_block_hash: H256, best_total_difficulty: U256) -> Self {
        Self {
            best_block_hash,
            best_total_difficulty,
            initialized: true,
        }
    }
}

impl Default for ChainView {
    fn default() -> Self {
        Self {
            best_block_hash: H256::zero(),
            best_total_difficulty: U256::zero(),
            initialized: false,
        }
    }
}

/// A connected remote peer, as seen by the sync engine. The peer pool owns the peer's lifetime;
/// once the underlying connection goes away, every request through `client` fails and the engine
/// reacts to that failure rather than to the peer object disappearing.
pub struct SyncPeer {
    id: PeerId,
    view: ChainView,
    client: Arc<dyn WireClient>,
}

impl SyncPeer {
    pub fn new(id: PeerId, view: ChainView, client: Arc<dyn WireClient>) -> Self {
        Self { id, view, client }
    }

    pub fn id(&self) -> PeerId {
        self.id
    }

    pub fn claimed_view(&self) -> &ChainView {
        &self.view
    }

    pub fn claimed_best_hash(&self) -> H256 {
        self.view.best_block_hash
    }

    pub fn claimed_total_difficulty(&self) -> U256 {
        self.view.best_total_difficulty
    }

    pub fn client(&self) -> &Arc<dyn WireClient> {
        &self.client
    }
}

impl fmt::Debug for SyncPeer {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncPeer")
            .field("id", &self.id)
            .field("view", &self.view)
            .finish()
    }
}

impl Display for SyncPeer {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "peer {} (best {}, difficulty {})",
            self.id, self.view.best_block_hash, self.view.best_total_difficulty
        )
    }
}

impl PartialEq for SyncPeer {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for SyncPeer {}

impl Hash for SyncPeer {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}
