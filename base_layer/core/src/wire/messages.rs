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

use std::fmt::{Display, Error, Formatter};

use ethereum_types::H256;

use crate::blocks::{BlockBody, BlockHeader, BlockNumber};

/// Anchor of a header request: either a known block hash or a height.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashOrNumber {
    Hash(H256),
    Number(BlockNumber),
}

impl From<H256> for HashOrNumber {
    fn from(hash: H256) -> Self {
        HashOrNumber::Hash(hash)
    }
}

impl From<BlockNumber> for HashOrNumber {
    fn from(number: BlockNumber) -> Self {
        HashOrNumber::Number(number)
    }
}

/// A `GetBlockHeaders` request: up to `max_results` headers starting at `start_block`, taking
/// every `skip + 1`-th block, walking toward genesis when `reverse` is set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockHeadersRequest {
    pub start_block: HashOrNumber,
    pub max_results: u32,
    pub skip: u32,
    pub reverse: bool,
}

impl BlockHeadersRequest {
    /// A contiguous forward run of `max_results` headers starting at height `start`.
    pub fn forward_from(start: BlockNumber, max_results: u32) -> Self {
        Self {
            start_block: start.into(),
            max_results,
            skip: 0,
            reverse: false,
        }
    }

    /// The single header with the given hash.
    pub fn single(hash: H256) -> Self {
        Self {
            start_block: hash.into(),
            max_results: 1,
            skip: 0,
            reverse: false,
        }
    }

    /// The single header with the given hash, requested in reverse. Used to probe whether a peer
    /// knows a block at all.
    pub fn single_reversed(hash: H256) -> Self {
        Self {
            start_block: hash.into(),
            max_results: 1,
            skip: 0,
            reverse: true,
        }
    }
}

/// Response to [BlockHeadersRequest]. Fewer headers than requested is a legal response.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BlockHeadersResponse {
    pub headers: Vec<BlockHeader>,
}

/// Response to a block bodies request. Bodies are returned in request order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BlockBodiesResponse {
    pub bodies: Vec<BlockBody>,
}

/// Reason codes carried by the wire-level disconnect message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    /// Disconnect was requested locally.
    Requested,
    /// The peer is of no use to this node.
    UselessPeer,
    /// The peer broke a sub-protocol rule.
    SubprotocolError,
    /// The peer failed to respond in time.
    Timeout,
}

impl Display for DisconnectReason {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), Error> {
        match self {
            DisconnectReason::Requested => write!(f, "disconnect requested"),
            DisconnectReason::UselessPeer => write!(f, "useless peer"),
            DisconnectReason::SubprotocolError => write!(f, "subprotocol error"),
            DisconnectReason::Timeout => write!(f, "timeout"),
        }
    }
}
