/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2025 ByteDance and/or its affiliates.
 */

use std::sync::Arc;

use arc_swap::{ArcSwap, ArcSwapOption};

use crate::cert::CertStore;
use crate::config::SslConfig;
use crate::event::Runtime;
use crate::hook::HookRegistry;
use crate::stat::SslStats;

/// Process-wide, read-mostly state shared by every connection: the
/// certificate store, the hook chains, the tunables, and the runtime
/// used for rescheduled continuation delivery.
///
/// Consumers take a snapshot per handshake step; publishing a
/// replacement never blocks connections in flight.
pub struct SslEnv {
    config: ArcSwap<SslConfig>,
    cert_store: ArcSwapOption<CertStore>,
    hooks: ArcSwap<HookRegistry>,
    stats: Arc<SslStats>,
    runtime: Arc<dyn Runtime>,
}

impl SslEnv {
    pub fn new(runtime: Arc<dyn Runtime>) -> Self {
        SslEnv {
            config: ArcSwap::from_pointee(SslConfig::default()),
            cert_store: ArcSwapOption::empty(),
            hooks: ArcSwap::from_pointee(HookRegistry::default()),
            stats: Arc::new(SslStats::default()),
            runtime,
        }
    }

    pub fn config(&self) -> Arc<SslConfig> {
        self.config.load_full()
    }

    pub fn set_config(&self, config: SslConfig) {
        self.config.store(Arc::new(config));
    }

    pub fn cert_store(&self) -> Option<Arc<CertStore>> {
        self.cert_store.load_full()
    }

    pub fn set_cert_store(&self, store: Arc<CertStore>) {
        self.cert_store.store(Some(store));
    }

    pub fn hooks(&self) -> Arc<HookRegistry> {
        self.hooks.load_full()
    }

    pub fn set_hooks(&self, hooks: HookRegistry) {
        self.hooks.store(Arc::new(hooks));
    }

    #[inline]
    pub fn stats(&self) -> &Arc<SslStats> {
        &self.stats
    }

    #[inline]
    pub fn runtime(&self) -> &Arc<dyn Runtime> {
        &self.runtime
    }
}
