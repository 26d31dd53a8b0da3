/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2025 ByteDance and/or its affiliates.
 */

use crate::event::ContRef;

/// Named interception points a plugin can attach to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HookPoint {
    /// Before the TLS engine is driven; may demand tunnel or terminate.
    PreAccept,
    /// Inside the engine's client-hello processing; may rebind the
    /// certificate context or demand tunnel.
    Sni,
}

/// Ordered hook chains, process-wide and read-mostly. Publish a new
/// registry through the environment to change the chains; walks in
/// flight keep their snapshot.
#[derive(Default)]
pub struct HookRegistry {
    pre_accept: Vec<ContRef>,
    sni: Vec<ContRef>,
}

impl HookRegistry {
    pub fn append(&mut self, point: HookPoint, cont: ContRef) {
        match point {
            HookPoint::PreAccept => self.pre_accept.push(cont),
            HookPoint::Sni => self.sni.push(cont),
        }
    }

    pub fn chain(&self, point: HookPoint) -> &[ContRef] {
        match point {
            HookPoint::PreAccept => &self.pre_accept,
            HookPoint::Sni => &self.sni,
        }
    }
}
