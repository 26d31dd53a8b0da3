/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2025 ByteDance and/or its affiliates.
 */

use e2_io_chain::ChainBuffer;

use crate::event::ContRef;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VioOp {
    None,
    Read,
    Write,
}

/// A virtual I/O descriptor: a buffer, a byte demand, and the
/// continuation (with its own mutex) to signal on progress.
pub struct Vio {
    pub op: VioOp,
    pub cont: Option<ContRef>,
    pub buffer: ChainBuffer,
    pub nbytes: i64,
    pub ndone: i64,
}

impl Vio {
    pub(crate) fn idle(block_size: usize) -> Self {
        Vio {
            op: VioOp::None,
            cont: None,
            buffer: ChainBuffer::new(block_size),
            nbytes: 0,
            ndone: 0,
        }
    }

    #[inline]
    pub fn ntodo(&self) -> i64 {
        self.nbytes - self.ndone
    }
}

pub(crate) struct NetState {
    pub enabled: bool,
    pub triggered: bool,
    pub vio: Vio,
}

impl NetState {
    pub(crate) fn idle(block_size: usize) -> Self {
        NetState {
            enabled: false,
            triggered: false,
            vio: Vio::idle(block_size),
        }
    }
}
