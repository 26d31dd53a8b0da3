/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2025 ByteDance and/or its affiliates.
 */

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

macro_rules! counter {
    ($field:ident, $add:ident, $get:ident) => {
        pub fn $add(&self) {
            self.$field.fetch_add(1, Ordering::Relaxed);
        }
        pub fn $get(&self) -> u64 {
            self.$field.load(Ordering::Relaxed)
        }
    };
}

/// Engine-wide counters, shared by every connection of one environment.
#[derive(Default)]
pub struct SslStats {
    error_want_read: AtomicU64,
    error_want_write: AtomicU64,
    error_want_x509_lookup: AtomicU64,
    error_syscall: AtomicU64,
    error_ssl: AtomicU64,
    error_zero_return: AtomicU64,

    handshake_count: AtomicU64,
    handshake_time_ns: AtomicU64,

    dyn_def_record: AtomicU64,
    dyn_max_record: AtomicU64,

    sni_name_set_failure: AtomicU64,
    renegotiation_abort: AtomicU64,
    hook_leak: AtomicU64,

    raw_read_calls: AtomicU64,
}

impl SslStats {
    counter!(error_want_read, add_error_want_read, error_want_read);
    counter!(error_want_write, add_error_want_write, error_want_write);
    counter!(
        error_want_x509_lookup,
        add_error_want_x509_lookup,
        error_want_x509_lookup
    );
    counter!(error_syscall, add_error_syscall, error_syscall);
    counter!(error_ssl, add_error_ssl, error_ssl);
    counter!(error_zero_return, add_error_zero_return, error_zero_return);

    counter!(dyn_def_record, add_dyn_def_record, dyn_def_record);
    counter!(dyn_max_record, add_dyn_max_record, dyn_max_record);

    counter!(
        sni_name_set_failure,
        add_sni_name_set_failure,
        sni_name_set_failure
    );
    counter!(
        renegotiation_abort,
        add_renegotiation_abort,
        renegotiation_abort
    );
    counter!(hook_leak, add_hook_leak, hook_leak);

    counter!(raw_read_calls, add_raw_read_call, raw_read_calls);

    pub fn add_handshake_time(&self, d: Duration) {
        self.handshake_count.fetch_add(1, Ordering::Relaxed);
        self.handshake_time_ns
            .fetch_add(d.as_nanos() as u64, Ordering::Relaxed);
    }

    pub fn handshake_count(&self) -> u64 {
        self.handshake_count.load(Ordering::Relaxed)
    }

    pub fn handshake_time(&self) -> Duration {
        Duration::from_nanos(self.handshake_time_ns.load(Ordering::Relaxed))
    }
}
