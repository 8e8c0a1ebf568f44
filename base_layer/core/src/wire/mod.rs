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

//! The block-exchange wire protocol contract.
//!
//! The framed sub-protocol runtime and the encrypted transport live in the networking crates; the
//! sync engine only sees a [WireClient] per connected peer. Request timeouts are enforced by the
//! client implementation, so every error surfaced here is terminal for the request that caused it.

mod error;
mod messages;

use async_trait::async_trait;
use ethereum_types::{H256, U256};

pub use error::WireError;
pub use messages::{
    BlockBodiesResponse,
    BlockHeadersRequest,
    BlockHeadersResponse,
    DisconnectReason,
    HashOrNumber,
};

/// Version of the block-exchange sub-protocol spoken by this node.
pub const PROTOCOL_VERSION: u8 = 63;

/// Upper bound on the number of headers in a single request.
pub const MAX_HEADERS_PER_REQUEST: u32 = 192;
/// Upper bound on the number of bodies in a single request.
pub const MAX_BODIES_PER_REQUEST: usize = 128;
/// Upper bound on the number of receipt sets in a single request.
pub const MAX_RECEIPTS_PER_REQUEST: usize = 256;
/// Upper bound on the number of state trie nodes in a single request.
pub const MAX_STATE_PER_REQUEST: usize = 384;

/// Request/response access to a single remote peer.
///
/// The best block hash and total difficulty are cached from the sub-protocol handshake and do not
/// hit the network. A header response carrying fewer than `max_results` entries is legal and
/// indicates the tail of the remote chain.
#[async_trait]
pub trait WireClient: Send + Sync {
    /// The peer's best block hash, as announced during the handshake.
    fn best_block_hash(&self) -> H256;

    /// The peer's total chain difficulty, as announced during the handshake.
    fn best_total_difficulty(&self) -> U256;

    /// Fetch a run of block headers described by `request`.
    async fn get_block_headers(&self, request: BlockHeadersRequest) -> Result<BlockHeadersResponse, WireError>;

    /// Fetch the block bodies for the given header hashes, in request order.
    async fn get_block_bodies(&self, hashes: Vec<H256>) -> Result<BlockBodiesResponse, WireError>;

    /// Disconnect the peer, citing `reason` in the wire-level disconnect message.
    async fn disconnect(&self, reason: DisconnectReason);
}
