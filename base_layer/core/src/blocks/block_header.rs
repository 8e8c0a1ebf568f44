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

use ethereum_types::{H256, U256};
use keccak_hash::keccak;

/// Block height on the canonical chain. All arithmetic on block numbers saturates at the protocol
/// maximum; wraparound is forbidden.
pub type BlockNumber = U256;

/// The header half of a canonical block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockHeader {
    /// Hash of the preceding block header.
    pub parent_hash: H256,
    /// Height of this block on the chain.
    pub number: BlockNumber,
    /// Proof-of-work difficulty target of this block.
    pub difficulty: U256,
    /// Timestamp at which the block was mined, in seconds since the unix epoch.
    pub timestamp: u64,
    /// Root of the transaction trie of the accompanying body.
    pub transactions_root: H256,
    /// Arbitrary miner-supplied data.
    pub extra_data: Vec<u8>,
}

impl BlockHeader {
    /// The Keccak-256 hash of this header's canonical encoding.
    pub fn hash(&self) -> H256 {
        let mut buf = Vec::with_capacity(32 * 4 + 8 + self.extra_data.len());
        buf.extend_from_slice(self.parent_hash.as_bytes());
        let mut word = [0u8; 32];
        self.number.to_big_endian(&mut word);
        buf.extend_from_slice(&word);
        self.difficulty.to_big_endian(&mut word);
        buf.extend_from_slice(&word);
        buf.extend_from_slice(&self.timestamp.to_be_bytes());
        buf.extend_from_slice(self.transactions_root.as_bytes());
        buf.extend_from_slice(&self.extra_data);
        keccak(&buf)
    }
}

impl Display for BlockHeader {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), Error> {
        write!(f, "#{} ({})", self.number, self.hash())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn sample_header() -> BlockHeader {
        BlockHeader {
            parent_hash: H256::repeat_byte(0x11),
            number: 42.into(),
            difficulty: 100_000.into(),
            timestamp: 1_650_000_000,
            transactions_root: H256::repeat_byte(0x22),
            extra_data: b"aether".to_vec(),
        }
    }

    #[test]
    fn hash_is_deterministic() {
        assert_eq!(sample_header().hash(), sample_header().hash());
    }

    #[test]
    fn hash_covers_every_field() {
        let base = sample_header().hash();
        let mut header = sample_header();
        header.parent_hash = H256::repeat_byte(0x12);
        assert_ne!(header.hash(), base);

        let mut header = sample_header();
        header.number = 43.into();
        assert_ne!(header.hash(), base);

        let mut header = sample_header();
        header.difficulty = 100_001.into();
        assert_ne!(header.hash(), base);

        let mut header = sample_header();
        header.timestamp += 1;
        assert_ne!(header.hash(), base);

        let mut header = sample_header();
        header.extra_data = b"other".to_vec();
        assert_ne!(header.hash(), base);
    }
}
