/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2025 ByteDance and/or its affiliates.
 */

mod chain;
pub use chain::ChainBuffer;

pub const DEFAULT_BLOCK_SIZE: usize = 4096;
