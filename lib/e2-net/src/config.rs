/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2025 ByteDance and/or its affiliates.
 */

use std::time::Duration;

/// Record cap to use while a write burst is still probing.
pub const DEF_TLS_RECORD_SIZE: usize = 1300;
/// Largest payload a single TLS record may carry.
pub const MAX_TLS_RECORD_SIZE: usize = 16383;
/// Bytes a burst must move before records grow to the maximum.
pub const DEF_TLS_RECORD_BYTE_THRESHOLD: u64 = 1_000_000;
/// Idle gap after which the next write starts a new burst.
pub const DEF_TLS_RECORD_IDLE_THRESHOLD: Duration = Duration::from_millis(1000);

/// Process-wide tunables for the TLS connection engine.
#[derive(Clone, Debug)]
pub struct SslConfig {
    /// Record sizing mode: `> 0` caps every write op at this many
    /// bytes, `0` turns capping off (one op per buffer block), `-1`
    /// selects dynamic sizing from recent write activity.
    pub max_record: i64,
    pub def_record_size: usize,
    pub max_record_size: usize,
    pub record_byte_threshold: u64,
    pub record_idle_threshold: Duration,
    /// Block size for VIO and handshake buffers.
    pub buffer_block_size: usize,
    /// Unconsumed decrypted bytes above this stop socket reads until
    /// the upstream drains.
    pub read_water_mark: usize,
}

impl Default for SslConfig {
    fn default() -> Self {
        SslConfig {
            max_record: -1,
            def_record_size: DEF_TLS_RECORD_SIZE,
            max_record_size: MAX_TLS_RECORD_SIZE,
            record_byte_threshold: DEF_TLS_RECORD_BYTE_THRESHOLD,
            record_idle_threshold: DEF_TLS_RECORD_IDLE_THRESHOLD,
            buffer_block_size: e2_io_chain::DEFAULT_BLOCK_SIZE,
            read_water_mark: 64 * 1024,
        }
    }
}

impl SslConfig {
    /// The per-op record cap while in dynamic mode: short records until
    /// the burst has moved enough bytes, full records afterwards.
    pub(crate) fn dynamic_record_cap(&self, bytes_since_idle: u64) -> usize {
        if bytes_since_idle < self.record_byte_threshold {
            self.def_record_size
        } else {
            self.max_record_size
        }
    }

    pub(crate) fn write_idle_expired(&self, idle: Duration) -> bool {
        idle > self.record_idle_threshold
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dynamic_cap_grows_with_burst() {
        let cfg = SslConfig::default();
        assert_eq!(cfg.dynamic_record_cap(0), DEF_TLS_RECORD_SIZE);
        assert_eq!(cfg.dynamic_record_cap(999_999), DEF_TLS_RECORD_SIZE);
        assert_eq!(cfg.dynamic_record_cap(1_000_000), MAX_TLS_RECORD_SIZE);
        assert_eq!(cfg.dynamic_record_cap(u64::MAX), MAX_TLS_RECORD_SIZE);
    }

    #[test]
    fn burst_reset_threshold() {
        let cfg = SslConfig::default();
        assert!(!cfg.write_idle_expired(Duration::from_millis(1000)));
        assert!(cfg.write_idle_expired(Duration::from_millis(1001)));
    }

    #[test]
    fn simulated_burst_sequence() {
        // a 5 MiB stream: short records first, full records once the
        // burst passes the byte threshold, short again after idling
        let cfg = SslConfig::default();
        let mut sent: u64 = 0;
        let mut caps = Vec::new();
        while sent < 5 * 1024 * 1024 {
            let cap = cfg.dynamic_record_cap(sent);
            caps.push(cap);
            sent += cap as u64;
        }
        assert_eq!(caps[0], DEF_TLS_RECORD_SIZE);
        assert!(caps.iter().take_while(|c| **c == DEF_TLS_RECORD_SIZE).count() >= 769);
        assert_eq!(*caps.last().unwrap(), MAX_TLS_RECORD_SIZE);

        // idle expiry starts the probe phase over
        assert!(cfg.write_idle_expired(Duration::from_secs(2)));
        assert_eq!(cfg.dynamic_record_cap(0), DEF_TLS_RECORD_SIZE);
    }
}
