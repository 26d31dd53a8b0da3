/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2025 ByteDance and/or its affiliates.
 */

use std::sync::Arc;
use std::time::Instant;

use log::{debug, error};

use e2_openssl::{SslEngine, SslStatus};

use crate::event::{self, Event};
use crate::hook::HookPoint;
use crate::sock::RawRead;

use super::registry;
use super::replay::HandshakeReplay;
use super::{
    HookOp, NetPoller, PreAcceptState, TlsVc, VcCore, VcError, VcMode, VcRole,
};

/// What one handshake drive asks of the caller.
#[derive(Debug)]
pub(crate) enum HsStatus {
    Done,
    WantRead,
    WantWrite,
    WantAccept,
    WantConnect,
    /// A pre-accept hook is outstanding; no progress until `reenable`.
    WaitForHook,
    /// Parked on an external event (hook suspension, cert lookup);
    /// stay scheduled but expect no engine progress.
    Continue,
    Error(VcError),
}

pub(crate) fn start_handshake(vc: &Arc<TlsVc>, nh: &dyn NetPoller) -> HsStatus {
    match vc.role() {
        VcRole::Server => server_handshake(vc),
        VcRole::Client => client_handshake(vc, nh),
    }
}

/// Walk the pre-accept chain one hook at a time. Returns `None` once
/// the chain is exhausted, `Some(WaitForHook)` while a hook is in
/// flight.
fn pre_accept_walk(vc: &Arc<TlsVc>) -> Option<HsStatus> {
    let target = {
        let mut cb = vc.cb.lock().unwrap();
        match cb.pre_accept {
            PreAcceptState::Done => return None,
            PreAcceptState::Active => return Some(HsStatus::WaitForHook),
            PreAcceptState::Init => {
                cb.pre_accept = PreAcceptState::Invoke;
                cb.cur_hook = 0;
            }
            PreAcceptState::Invoke => cb.cur_hook += 1,
        }

        let hooks = vc.env().hooks();
        let chain = hooks.chain(HookPoint::PreAccept);
        match chain.get(cb.cur_hook) {
            Some(cont) => {
                cb.pre_accept = PreAcceptState::Active;
                cont.clone()
            }
            None => {
                cb.pre_accept = PreAcceptState::Done;
                return None;
            }
        }
    };

    // deliver under the hook continuation's own mutex; on contention an
    // indirection task takes over
    event::invoke_cont(vc.env().runtime(), &target, Event::PreAccept, vc);
    Some(HsStatus::WaitForHook)
}

fn server_handshake(vc: &Arc<TlsVc>) -> HsStatus {
    if let Some(st) = pre_accept_walk(vc) {
        return st;
    }

    // a verdict from the pre-accept hooks redirects completion before
    // any session exists; no byte has been consumed at this point
    match vc.hook_op() {
        HookOp::Tunnel => {
            debug!("pre-accept verdict: blind tunnel");
            vc.enter_blind_tunnel();
            return HsStatus::Done;
        }
        HookOp::Terminate => {
            debug!("pre-accept verdict: terminate");
            vc.set_handshake_done();
            return HsStatus::Done;
        }
        HookOp::Default => {}
    }

    {
        let mut core = vc.core.lock().unwrap();
        if core.engine.is_none() {
            let Some(store) = vc.env().cert_store() else {
                return HsStatus::Error(VcError::NoCertStore);
            };
            let Some(sock) = core.sock() else {
                return HsStatus::Error(VcError::Closed);
            };

            let local_ip = sock.local_ip();
            if let Some(ip) = local_ip {
                if let Some(entry) = store.find(ip) {
                    if entry.is_tunnel() && vc.options().transparent {
                        drop(core);
                        debug!("listening address {ip} is a tunnel destination");
                        vc.enter_blind_tunnel();
                        return HsStatus::Done;
                    }
                }
            }

            // start on the default context; the client-hello callback
            // rebinds the session once the proper context is known
            debug!("creating server session, local addr {local_ip:?}");
            let vc_index = match registry::ssl_vc_index() {
                Ok(index) => index,
                Err(e) => return HsStatus::Error(VcError::SessionCreate(e)),
            };
            let mut engine = match SslEngine::with_context(store.default_context(), sock) {
                Ok(engine) => engine,
                Err(e) => return HsStatus::Error(VcError::SessionCreate(e)),
            };
            engine.ssl_mut().set_ex_data(vc_index, vc.token());

            core.replay = Some(HandshakeReplay::new(vc.env().config().buffer_block_size));
            core.engine = Some(engine);
            if core.handshake_begin.is_none() {
                core.handshake_begin = Some(Instant::now());
            }
        }
    }

    drive_accept(vc)
}

fn drive_accept(vc: &Arc<TlsVc>) -> HsStatus {
    let stats = vc.env().stats().clone();
    let mut guard = vc.core.lock().unwrap();
    let Some(sock) = guard.sock() else {
        return HsStatus::Error(VcError::Closed);
    };
    let VcCore {
        engine,
        replay,
        mode,
        handshake_begin,
        ..
    } = &mut *guard;
    let (Some(engine), Some(replay)) = (engine.as_mut(), replay.as_mut()) else {
        return HsStatus::Error(VcError::Closed);
    };

    // feed raw bytes once the engine's input side runs dry
    if engine.input_pending() == 0 {
        stats.add_raw_read_call();
        match replay.fill_from(sock) {
            RawRead::Bytes(n) => debug!("buffered {n} raw handshake bytes"),
            RawRead::WouldBlock => {}
            RawRead::Eof => {
                if replay.unfed() == 0 {
                    return HsStatus::Error(VcError::HandshakeEof);
                }
            }
            RawRead::Err(e) => return HsStatus::Error(VcError::HandshakeIo(e)),
        }
        if let Some(slice) = replay.next_feed_slice() {
            engine.set_read_memory(slice);
        }
    }

    let result = engine.accept();

    // reconcile: bytes the engine pulled from the memory input are a
    // consumed prefix of the replay; the rest must stay replayable
    let consumed = engine.take_consumed();
    if consumed > 0 {
        replay.advance_feed(consumed);
    }

    match result {
        Ok(()) => {
            let elapsed = handshake_begin.take().map(|t| t.elapsed());
            let selected = engine.selected_alpn().map(|p| p.to_vec());

            vc.set_handshake_done();
            if let Some(d) = elapsed {
                debug!("ssl handshake time: {d:?}");
                stats.add_handshake_time(d);
            }

            finish_protocol_selection(vc, selected)
        }
        Err(status) => match status {
            SslStatus::WantRead => {
                stats.add_error_want_read();
                HsStatus::WantRead
            }
            SslStatus::WantWrite => {
                stats.add_error_want_write();
                HsStatus::WantWrite
            }
            SslStatus::WantConnect => HsStatus::WantConnect,
            SslStatus::WantAccept => HsStatus::Continue,
            SslStatus::WantX509Lookup => {
                stats.add_error_want_x509_lookup();
                HsStatus::Continue
            }
            SslStatus::WantSniResolve => {
                // the client-hello callback broke out of the accept;
                // either a tunnel was demanded or a hook is still
                // running
                if vc.hook_op() == HookOp::Tunnel || *mode == VcMode::BlindTunnel {
                    *mode = VcMode::BlindTunnel;
                    debug!("sni verdict: blind tunnel, buffered bytes pending replay");
                }
                HsStatus::Continue
            }
            SslStatus::ZeroReturn => {
                stats.add_error_zero_return();
                HsStatus::Error(VcError::Handshake(status))
            }
            SslStatus::Syscall(_) => {
                stats.add_error_syscall();
                HsStatus::Error(VcError::Handshake(status))
            }
            SslStatus::Ssl(_) => {
                stats.add_error_ssl();
                HsStatus::Error(VcError::Handshake(status))
            }
        },
    }
}

/// ALPN decides the next protocol; the registered set must resolve the
/// choice to an endpoint or the handshake is failed.
fn finish_protocol_selection(vc: &Arc<TlsVc>, selected: Option<Vec<u8>>) -> HsStatus {
    let mut cb = vc.cb.lock().unwrap();
    match selected {
        Some(proto) => match cb.alpn_set.take() {
            Some(set) => match set.find_endpoint(&proto) {
                Some(endpoint) => {
                    cb.alpn_endpoint = Some(endpoint);
                    debug!(
                        "client selected next protocol '{}'",
                        String::from_utf8_lossy(&proto)
                    );
                    HsStatus::Done
                }
                None => {
                    error!(
                        "no registered endpoint for '{}'",
                        String::from_utf8_lossy(&proto)
                    );
                    HsStatus::Error(VcError::AlpnUnresolved)
                }
            },
            None => {
                // negotiation cannot happen without a set; plugin bug
                error!("protocol negotiated without a registered alpn set");
                HsStatus::Error(VcError::AlpnSetMissing)
            }
        },
        None => {
            cb.alpn_set = None;
            debug!("client did not select a next protocol");
            HsStatus::Done
        }
    }
}

fn client_handshake(vc: &Arc<TlsVc>, nh: &dyn NetPoller) -> HsStatus {
    let stats = vc.env().stats().clone();
    let mut core = vc.core.lock().unwrap();

    if core.engine.is_none() {
        let Some(store) = vc.env().cert_store() else {
            return HsStatus::Error(VcError::NoCertStore);
        };
        let Some(sock) = core.sock() else {
            return HsStatus::Error(VcError::Closed);
        };

        let vc_index = match registry::ssl_vc_index() {
            Ok(index) => index,
            Err(e) => return HsStatus::Error(VcError::SessionCreate(e)),
        };
        let mut engine = match SslEngine::with_context(store.client_context(), sock) {
            Ok(engine) => engine,
            Err(e) => return HsStatus::Error(VcError::SessionCreate(e)),
        };
        engine.ssl_mut().set_ex_data(vc_index, vc.token());

        if let Some(name) = &vc.options().sni_servername {
            match engine.set_sni_hostname(name) {
                Ok(()) => debug!("using SNI name '{name}' for client handshake"),
                Err(e) => {
                    debug!("failed to set SNI name '{name}': {e}");
                    stats.add_sni_name_set_failure();
                }
            }
        }

        core.engine = Some(engine);
        if core.handshake_begin.is_none() {
            core.handshake_begin = Some(Instant::now());
        }
    }

    let Some(engine) = core.engine.as_mut() else {
        return HsStatus::Error(VcError::Closed);
    };

    match engine.connect() {
        Ok(()) => {
            let elapsed = core.handshake_begin.take().map(|t| t.elapsed());
            vc.set_handshake_done();
            if let Some(d) = elapsed {
                stats.add_handshake_time(d);
            }
            debug!("ssl client handshake completed");

            let resched_write = core.write.enabled && !vc.closed();
            drop(core);
            if resched_write {
                nh.write_reschedule(vc);
            }
            HsStatus::Done
        }
        Err(status) => match status {
            SslStatus::WantWrite => {
                stats.add_error_want_write();
                HsStatus::WantWrite
            }
            SslStatus::WantRead => {
                stats.add_error_want_read();
                HsStatus::WantRead
            }
            SslStatus::WantX509Lookup => {
                stats.add_error_want_x509_lookup();
                HsStatus::Continue
            }
            SslStatus::WantAccept => HsStatus::WantAccept,
            SslStatus::WantConnect | SslStatus::WantSniResolve => HsStatus::Continue,
            SslStatus::ZeroReturn => {
                stats.add_error_zero_return();
                HsStatus::Error(VcError::Handshake(status))
            }
            SslStatus::Syscall(_) => {
                stats.add_error_syscall();
                HsStatus::Error(VcError::Handshake(status))
            }
            SslStatus::Ssl(_) => {
                stats.add_error_ssl();
                HsStatus::Error(VcError::Handshake(status))
            }
        },
    }
}
