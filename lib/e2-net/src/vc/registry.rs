/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2025 ByteDance and/or its affiliates.
 */

use std::sync::{Arc, Mutex, OnceLock, Weak};

use openssl::error::ErrorStack;
use openssl::ex_data::Index;
use openssl::ssl::{Ssl, SslRef};

use super::TlsVc;

/// Generational handle stored in a session's ex-data instead of a raw
/// back-pointer: a callback firing after the connection was torn down
/// resolves to nothing instead of to freed memory.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct VcToken {
    slot: usize,
    generation: u64,
}

#[derive(Default)]
struct RegistryInner {
    slots: Vec<Option<(u64, Weak<TlsVc>)>>,
    free: Vec<usize>,
    next_generation: u64,
}

static REGISTRY: OnceLock<Mutex<RegistryInner>> = OnceLock::new();
static VC_INDEX: OnceLock<Index<Ssl, VcToken>> = OnceLock::new();

fn registry() -> &'static Mutex<RegistryInner> {
    REGISTRY.get_or_init(|| Mutex::new(RegistryInner::default()))
}

/// The ex-data index every session stores its token under, created on
/// first use.
pub(crate) fn ssl_vc_index() -> Result<Index<Ssl, VcToken>, ErrorStack> {
    match VC_INDEX.get() {
        Some(index) => Ok(*index),
        None => {
            let index = Ssl::new_ex_index()?;
            Ok(*VC_INDEX.get_or_init(|| index))
        }
    }
}

pub(crate) fn register(vc: Weak<TlsVc>) -> VcToken {
    let mut inner = registry().lock().unwrap();
    inner.next_generation += 1;
    let generation = inner.next_generation;
    let slot = match inner.free.pop() {
        Some(slot) => {
            inner.slots[slot] = Some((generation, vc));
            slot
        }
        None => {
            inner.slots.push(Some((generation, vc)));
            inner.slots.len() - 1
        }
    };
    VcToken { slot, generation }
}

pub(crate) fn unregister(token: VcToken) {
    let mut inner = registry().lock().unwrap();
    if let Some(Some((generation, _))) = inner.slots.get(token.slot) {
        if *generation == token.generation {
            inner.slots[token.slot] = None;
            inner.free.push(token.slot);
        }
    }
}

pub(crate) fn resolve_token(token: VcToken) -> Option<Arc<TlsVc>> {
    let inner = registry().lock().unwrap();
    match inner.slots.get(token.slot) {
        Some(Some((generation, weak))) if *generation == token.generation => weak.upgrade(),
        _ => None,
    }
}

/// Resolve the connection behind a session from inside a library
/// callback. Stale or missing tokens are a no-op for the caller; no
/// session carries a token before the index exists.
pub(crate) fn resolve(ssl: &SslRef) -> Option<Arc<TlsVc>> {
    let index = *VC_INDEX.get()?;
    let token = ssl.ex_data(index)?;
    resolve_token(*token)
}
