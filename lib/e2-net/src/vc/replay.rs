/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2025 ByteDance and/or its affiliates.
 */

use e2_io_chain::ChainBuffer;

use crate::sock::{self, RawRead, RawSock};

/// Raw bytes pulled from the socket before the handshake settled.
///
/// The chain is never consumed: the feed cursor tracks what the engine
/// has taken, while the full sequence stays intact so a late blind
/// tunnel promotion can replay the client's bytes verbatim.
pub(crate) struct HandshakeReplay {
    chain: ChainBuffer,
    feed_off: u64,
}

impl HandshakeReplay {
    pub(crate) fn new(block_size: usize) -> Self {
        HandshakeReplay {
            chain: ChainBuffer::new(block_size),
            feed_off: 0,
        }
    }

    /// Scatter-read whatever the socket has into the tail.
    pub(crate) fn fill_from(&mut self, sock: RawSock) -> RawRead {
        sock::read_into_chain(sock, &mut self.chain, i32::MAX as usize)
    }

    /// The next contiguous region the engine has not been fed yet.
    pub(crate) fn next_feed_slice(&self) -> Option<&[u8]> {
        self.chain.slice_at(self.feed_off)
    }

    /// Move the feed cursor over bytes the engine consumed.
    pub(crate) fn advance_feed(&mut self, n: usize) {
        self.feed_off += n as u64;
        debug_assert!(self.feed_off <= self.chain.write_offset());
    }

    /// Bytes buffered but not yet taken by the engine.
    pub(crate) fn unfed(&self) -> usize {
        (self.chain.write_offset() - self.feed_off) as usize
    }

    pub(crate) fn is_drained(&self) -> bool {
        self.feed_off == self.chain.write_offset()
    }

    pub(crate) fn total_len(&self) -> usize {
        self.chain.read_avail()
    }

    /// Every byte read during the handshake, in order.
    pub(crate) fn copy_all(&self, out: &mut Vec<u8>) {
        self.chain.copy_unread(out);
    }
}
