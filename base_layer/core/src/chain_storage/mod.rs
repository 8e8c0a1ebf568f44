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

//! The persistence contract consumed by the sync engine, and an in-memory implementation of it.

mod error;
mod memory_db;

use async_trait::async_trait;

pub use error::ChainStorageError;
pub use memory_db::MemoryChainDatabase;

use crate::blocks::{BlockBody, BlockHeader};

/// The narrow slice of the chain database the sync engine needs.
///
/// `persist` accepts one contiguous ascending run of blocks at a time and must validate the
/// batch's internal consistency before committing it atomically. The engine guarantees that
/// `persist` calls are issued by a single logical owner in strictly ascending order.
#[async_trait]
pub trait ChainSink: Send + Sync + 'static {
    /// The header of the current best block.
    async fn best_header(&self) -> Result<BlockHeader, ChainStorageError>;

    /// Atomically persist a contiguous ascending run of blocks. Header `i` must correspond to
    /// body `i`.
    async fn persist(&self, headers: Vec<BlockHeader>, bodies: Vec<BlockBody>) -> Result<(), ChainStorageError>;
}
