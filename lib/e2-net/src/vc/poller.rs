/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2025 ByteDance and/or its affiliates.
 */

use std::sync::Arc;

use super::TlsVc;

/// The readiness engine a connection reports back to.
///
/// Implementations must not call back into the connection from inside
/// these methods; they only queue state changes for the next poll
/// round.
pub trait NetPoller: Send + Sync {
    /// Run the read path again on a later round, with read interest
    /// armed.
    fn read_reschedule(&self, vc: &Arc<TlsVc>);
    fn write_reschedule(&self, vc: &Arc<TlsVc>);

    /// Drop read interest entirely until re-enabled from above.
    fn read_disable(&self, vc: &Arc<TlsVc>);
    fn write_disable(&self, vc: &Arc<TlsVc>);

    fn read_ready_in_or_enqueue(&self, vc: &Arc<TlsVc>);
    fn read_ready_remove(&self, vc: &Arc<TlsVc>);
    fn write_ready_remove(&self, vc: &Arc<TlsVc>);
}
