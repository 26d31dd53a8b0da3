/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2025 ByteDance and/or its affiliates.
 */

pub mod config;
pub use config::SslConfig;

pub mod event;
pub use event::{ContRef, Event, EventSink, Runtime, ScheduledTask};

pub mod sock;
pub use sock::RawSock;

pub mod alpn;
pub use alpn::{AlpnSet, AlpnSetBuilder};

pub mod hook;
pub use hook::{HookPoint, HookRegistry};

pub mod cert;
pub use cert::{CertStore, CertStoreBuilder, CertificatePair};

pub mod stat;
pub use stat::SslStats;

mod env;
pub use env::SslEnv;

pub mod vc;
pub use vc::{HookOp, NetPoller, TlsVc, VcMode, VcOptions, VcRole};
