/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2025 ByteDance and/or its affiliates.
 */

use anyhow::anyhow;

use crate::event::ContRef;

struct AlpnEntry {
    proto: Vec<u8>,
    endpoint: ContRef,
}

/// The protocols one connection may negotiate, in server preference
/// order, each mapped to the continuation that accepts it.
pub struct AlpnSet {
    entries: Vec<AlpnEntry>,
}

#[derive(Default)]
pub struct AlpnSetBuilder {
    entries: Vec<AlpnEntry>,
}

impl AlpnSetBuilder {
    pub fn add(&mut self, proto: impl Into<Vec<u8>>, endpoint: ContRef) -> anyhow::Result<()> {
        let proto = proto.into();
        if proto.is_empty() || proto.len() > 255 {
            return Err(anyhow!("invalid protocol name length {}", proto.len()));
        }
        if self.entries.iter().any(|e| e.proto == proto) {
            return Err(anyhow!(
                "protocol {} already registered",
                String::from_utf8_lossy(&proto)
            ));
        }
        self.entries.push(AlpnEntry { proto, endpoint });
        Ok(())
    }

    pub fn build(self) -> AlpnSet {
        AlpnSet {
            entries: self.entries,
        }
    }
}

impl AlpnSet {
    pub fn builder() -> AlpnSetBuilder {
        AlpnSetBuilder::default()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Append the wire-format protocol list (length-prefixed names).
    /// Returns false when there is nothing to advertise.
    pub fn advertise(&self, out: &mut Vec<u8>) -> bool {
        if self.entries.is_empty() {
            return false;
        }
        for e in &self.entries {
            out.push(e.proto.len() as u8);
            out.extend_from_slice(&e.proto);
        }
        true
    }

    /// Server-preference selection against the client's wire-format
    /// offer; the returned slice borrows from `client`.
    pub fn select<'a>(&self, client: &'a [u8]) -> Option<&'a [u8]> {
        for e in &self.entries {
            let mut offset = 0;
            while offset < client.len() {
                let name_len = client[offset] as usize;
                let end = offset + 1 + name_len;
                if end > client.len() {
                    return None;
                }
                let name = &client[offset + 1..end];
                if name == e.proto.as_slice() {
                    return Some(name);
                }
                offset = end;
            }
        }
        None
    }

    pub fn find_endpoint(&self, proto: &[u8]) -> Option<ContRef> {
        self.entries
            .iter()
            .find(|e| e.proto == proto)
            .map(|e| e.endpoint.clone())
    }
}
