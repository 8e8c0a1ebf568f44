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

use std::sync::RwLock;

use async_trait::async_trait;
use log::*;

use super::{ChainSink, ChainStorageError};
use crate::blocks::{BlockBody, BlockHeader, BlockNumber};

const LOG_TARGET: &str = "c::cs::memory_db";

/// A fully in-memory chain database.
///
/// Persisted batches are checked for internal consistency before being committed: equal header and
/// body counts, sequential block numbers, intact parent links, and attachment to the current tip.
/// A failed batch leaves the database untouched.
pub struct MemoryChainDatabase {
    state: RwLock<InnerState>,
}

struct InnerState {
    best_header: BlockHeader,
    blocks: Vec<(BlockHeader, BlockBody)>,
    batch_spans: Vec<(BlockNumber, BlockNumber)>,
}

impl MemoryChainDatabase {
    /// Create a database whose current tip is `best_header`. The tip's ancestry is assumed to be
    /// stored elsewhere; only blocks persisted through this instance are retained.
    pub fn with_best_header(best_header: BlockHeader) -> Self {
        Self {
            state: RwLock::new(InnerState {
                best_header,
                blocks: Vec::new(),
                batch_spans: Vec::new(),
            }),
        }
    }

    /// Height of the current best block.
    pub fn best_height(&self) -> BlockNumber {
        self.state.read().unwrap().best_header.number
    }

    /// Number of blocks persisted through this instance.
    pub fn len(&self) -> usize {
        self.state.read().unwrap().blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.read().unwrap().blocks.is_empty()
    }

    /// The `(first, last)` block numbers of every persisted batch, in commit order.
    pub fn batch_spans(&self) -> Vec<(BlockNumber, BlockNumber)> {
        self.state.read().unwrap().batch_spans.clone()
    }

    /// The headers persisted through this instance, in commit order.
    pub fn headers(&self) -> Vec<BlockHeader> {
        self.state
            .read()
            .unwrap()
            .blocks
            .iter()
            .map(|(header, _)| header.clone())
            .collect()
    }

    fn validate_batch(
        tip: &BlockHeader,
        headers: &[BlockHeader],
        bodies: &[BlockBody],
    ) -> Result<(), ChainStorageError> {
        if headers.is_empty() {
            return Err(ChainStorageError::EmptyBatch);
        }
        if headers.len() != bodies.len() {
            return Err(ChainStorageError::MismatchedCounts {
                headers: headers.len(),
                bodies: bodies.len(),
            });
        }

        let expected = tip.number.saturating_add(BlockNumber::one());
        if headers[0].number != expected {
            return Err(ChainStorageError::BatchDoesNotExtendTip {
                expected,
                got: headers[0].number,
            });
        }
        if headers[0].parent_hash != tip.hash() {
            return Err(ChainStorageError::BrokenChainLink {
                number: headers[0].number,
            });
        }
        for pair in headers.windows(2) {
            if pair[1].number != pair[0].number.saturating_add(BlockNumber::one()) ||
                pair[1].parent_hash != pair[0].hash()
            {
                return Err(ChainStorageError::BrokenChainLink {
                    number: pair[1].number,
                });
            }
        }
        Ok(())
    }
}

#[async_trait]
impl ChainSink for MemoryChainDatabase {
    async fn best_header(&self) -> Result<BlockHeader, ChainStorageError> {
        Ok(self.state.read().unwrap().best_header.clone())
    }

    async fn persist(&self, headers: Vec<BlockHeader>, bodies: Vec<BlockBody>) -> Result<(), ChainStorageError> {
        let mut state = self.state.write().unwrap();
        Self::validate_batch(&state.best_header, &headers, &bodies)?;

        let span = (headers[0].number, headers[headers.len() - 1].number);
        debug!(
            target: LOG_TARGET,
            "Committing blocks #{}..#{} ({} block(s))",
            span.0,
            span.1,
            headers.len()
        );

        state.best_header = headers[headers.len() - 1].clone();
        state.blocks.extend(headers.into_iter().zip(bodies));
        state.batch_spans.push(span);
        Ok(())
    }
}
