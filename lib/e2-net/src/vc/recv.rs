/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2025 ByteDance and/or its affiliates.
 */

use std::sync::Arc;
use std::time::Instant;

use log::debug;

use e2_openssl::SslStatus;

use crate::event::Event;
use crate::sock::{self, RawRead};
use crate::stat::SslStats;

use super::handshake::{self, HsStatus};
use super::{
    try_signal_guard, NetPoller, SignalGuard, SignalResult, TlsVc, VcCore, VcMode, VioOp,
};

/// Outcome of one decrypt pass over the read VIO's write blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReadOutcome {
    None,
    Ready,
    Complete,
    WouldBlockRead,
    WouldBlockWrite,
    Eos,
    Error(i32),
}

pub(crate) fn net_read_io(vc: &Arc<TlsVc>, nh: &dyn NetPoller) {
    if vc.closed() {
        return;
    }
    if vc.mode() == VcMode::BlindTunnel {
        plain_read_io(vc, nh);
        return;
    }

    // every upstream-facing signal runs under the VIO continuation's
    // mutex; contention means another thread owns the upstream now
    let cont = { vc.core.lock().unwrap().read.vio.cont.clone() };
    let mut sig = match try_signal_guard(&cont) {
        Ok(sig) => sig,
        Err(()) => {
            nh.read_reschedule(vc);
            return;
        }
    };

    if vc.reneg_abort() {
        vc.core.lock().unwrap().read.triggered = false;
        debug!("client renegotiation refused, signalling read error");
        vc.read_signal_error(&mut sig, 0);
        return;
    }

    let ntodo = {
        let core = vc.core.lock().unwrap();
        if !core.read.enabled || core.read.vio.op != VioOp::Read {
            drop(core);
            nh.read_disable(vc);
            return;
        }
        core.read.vio.ntodo()
    };

    if !vc.handshake_done() {
        handshake_read_io(vc, nh, &mut sig, ntodo);
        return;
    }

    // backpressure: nothing demanded, or the upstream has not drained
    {
        let core = vc.core.lock().unwrap();
        let cfg = vc.env().config();
        if core.read.vio.ntodo() <= 0 || core.read.vio.buffer.read_avail() >= cfg.read_water_mark {
            drop(core);
            nh.read_disable(vc);
            return;
        }
    }

    // replay drain: hand the engine's read side back to the socket once
    // every buffered handshake byte has been consumed
    {
        let mut core = vc.core.lock().unwrap();
        let drained = core.replay.as_ref().map(|r| r.is_drained());
        match drained {
            Some(true) => {
                if let Some(engine) = core.engine.as_mut() {
                    engine.attach_read_socket();
                }
                core.replay = None;
                debug!("handshake replay drained, engine reads the socket now");
            }
            Some(false) => {
                let VcCore { engine, replay, .. } = &mut *core;
                if let (Some(engine), Some(replay)) = (engine.as_mut(), replay.as_ref()) {
                    if engine.input_pending() == 0 {
                        if let Some(slice) = replay.next_feed_slice() {
                            engine.set_read_memory(slice);
                        }
                    }
                }
            }
            None => {}
        }
    }

    let mut bytes: i64 = 0;
    let mut ret;
    // keep driving while the engine consumes records without producing
    // plaintext; TODO: measure whether a single pass per poll round is
    // enough here
    loop {
        let (r, out) = ssl_read_from_net(vc);
        ret = out;
        if matches!(ret, ReadOutcome::None | ReadOutcome::Ready) {
            bytes += r;
        }
        let again = (ret == ReadOutcome::Ready && bytes == 0) || ret == ReadOutcome::None;
        if !again {
            break;
        }
    }

    if bytes > 0
        && matches!(
            ret,
            ReadOutcome::Ready | ReadOutcome::WouldBlockRead | ReadOutcome::WouldBlockWrite
        )
        && vc.read_signal_and_update(&mut sig, Event::ReadReady) == SignalResult::Stop
    {
        debug!("read continuation stopped processing");
        return;
    }

    match ret {
        ReadOutcome::None | ReadOutcome::Ready => nh.read_reschedule(vc),
        ReadOutcome::WouldBlockRead | ReadOutcome::WouldBlockWrite => {
            if vc.read_retargeted(&sig) {
                debug!("read vio retargeted during signal, rescheduling");
                if ret == ReadOutcome::WouldBlockRead {
                    nh.read_reschedule(vc);
                } else {
                    nh.write_reschedule(vc);
                }
                return;
            }
            vc.core.lock().unwrap().read.triggered = false;
            nh.read_ready_remove(vc);
            if ret == ReadOutcome::WouldBlockRead {
                nh.read_reschedule(vc);
            } else {
                nh.write_reschedule(vc);
            }
        }
        ReadOutcome::Eos => {
            vc.core.lock().unwrap().read.triggered = false;
            vc.read_signal_done(&mut sig, Event::Eos);
        }
        ReadOutcome::Complete => vc.read_signal_done(&mut sig, Event::ReadComplete),
        ReadOutcome::Error(errno) => {
            vc.core.lock().unwrap().read.triggered = false;
            vc.read_signal_error(&mut sig, errno);
        }
    }
}

/// Drive the handshake from a read event and route its status.
fn handshake_read_io(
    vc: &Arc<TlsVc>,
    nh: &dyn NetPoller,
    sig: &mut Option<SignalGuard>,
    ntodo: i64,
) {
    let ret = handshake::start_handshake(vc, nh);

    let replay_present = vc.core.lock().unwrap().replay.is_some();
    if replay_present && vc.mode() == VcMode::BlindTunnel {
        // the tunnel decision was made mid-accept; wake the upstream
        vc.read_signal_done(sig, Event::ReadComplete);

        if !vc.handshake_done() {
            // abandoned TLS state machine: everything the client sent
            // so far moves to the read VIO for forwarding
            vc.set_handshake_done();
            let copied = {
                let mut core = vc.core.lock().unwrap();
                let mut moved = 0usize;
                if let Some(replay) = core.replay.take() {
                    let mut all = Vec::new();
                    replay.copy_all(&mut all);
                    moved = all.len();
                    core.read.vio.buffer.append(&all);
                    core.read.vio.nbytes = core.read.vio.nbytes.saturating_add(moved as i64);
                    core.read.vio.ndone += moved as i64;
                }
                moved
            };
            debug!("blind tunnel promotion replayed {copied} buffered bytes");

            if vc.read_retargeted(sig) {
                // the wakeup retargeted the VIO; finish on the fresh
                // continuation so forwarding starts
                let cont = { vc.core.lock().unwrap().read.vio.cont.clone() };
                match try_signal_guard(&cont) {
                    Ok(mut sig2) => vc.read_signal_done(&mut sig2, Event::ReadComplete),
                    Err(()) => nh.read_reschedule(vc),
                }
            } else {
                vc.read_signal_done(sig, Event::ReadComplete);
            }
        }
        return;
    }

    match ret {
        HsStatus::Error(e) => {
            vc.core.lock().unwrap().read.triggered = false;
            debug!("handshake failed: {e}");
            vc.read_signal_error(sig, e.errno());
        }
        HsStatus::WantRead | HsStatus::WantAccept => {
            vc.core.lock().unwrap().read.triggered = false;
            nh.read_ready_remove(vc);
            nh.read_reschedule(vc);
        }
        HsStatus::WantWrite | HsStatus::WantConnect => {
            vc.core.lock().unwrap().write.triggered = false;
            nh.write_ready_remove(vc);
            nh.write_reschedule(vc);
        }
        HsStatus::Done => {
            // a zero-length read completes here; otherwise set up for
            // continued read processing
            if ntodo <= 0 {
                vc.read_signal_done(sig, Event::ReadComplete);
            } else {
                let enabled = {
                    let mut core = vc.core.lock().unwrap();
                    core.read.triggered = true;
                    core.read.enabled
                };
                if enabled {
                    nh.read_ready_in_or_enqueue(vc);
                }
            }
        }
        HsStatus::WaitForHook => {
            // progress resumes when the plugin calls reenable
        }
        HsStatus::Continue => nh.read_reschedule(vc),
    }
}

/// One decrypt pass: walk the VIO's write blocks in order, consuming
/// each block's write-available space.
fn ssl_read_from_net(vc: &Arc<TlsVc>) -> (i64, ReadOutcome) {
    let stats = vc.env().stats().clone();
    let cfg = vc.env().config();
    let mut core = vc.core.lock().unwrap();
    let core = &mut *core;

    let ntodo = core.read.vio.ntodo();
    if ntodo <= 0 {
        return (0, ReadOutcome::Complete);
    }
    core.read
        .vio
        .buffer
        .grow((ntodo as usize).min(cfg.max_record_size + 1));

    let VcCore {
        engine,
        replay,
        read,
        last_activity,
        ..
    } = core;
    let Some(engine) = engine.as_mut() else {
        return (0, ReadOutcome::Error(0));
    };

    let mut total: usize = 0;
    let mut outcome: Option<ReadOutcome> = None;
    'blocks: for slice in read.vio.buffer.write_slices(sock::NET_MAX_IOV) {
        let mut offset = 0;
        while offset < slice.len() {
            // never decrypt past the VIO's demand
            let want = (slice.len() - offset).min((ntodo as usize) - total);
            if want == 0 {
                break 'blocks;
            }
            match engine.read(&mut slice[offset..offset + want]) {
                Ok(n) => {
                    total += n;
                    offset += n;
                }
                Err(status) => {
                    outcome = Some(classify_read_status(status, &stats));
                    break 'blocks;
                }
            }
        }
    }
    read.vio.buffer.fill(total);

    // plaintext may have come out of still-buffered handshake bytes;
    // keep the replay's feed cursor in step with the engine
    if let Some(replay) = replay.as_mut() {
        let consumed = engine.take_consumed();
        if consumed > 0 {
            replay.advance_feed(consumed);
        }
    }

    if total > 0 {
        read.vio.ndone += total as i64;
        *last_activity = Some(Instant::now());
        let out = if read.vio.ntodo() <= 0 {
            ReadOutcome::Complete
        } else {
            ReadOutcome::Ready
        };
        (total as i64, out)
    } else {
        (0, outcome.unwrap_or(ReadOutcome::None))
    }
}

fn classify_read_status(status: SslStatus, stats: &SslStats) -> ReadOutcome {
    match status {
        SslStatus::WantRead => {
            stats.add_error_want_read();
            ReadOutcome::WouldBlockRead
        }
        SslStatus::WantWrite => {
            stats.add_error_want_write();
            ReadOutcome::WouldBlockWrite
        }
        SslStatus::WantX509Lookup => {
            stats.add_error_want_x509_lookup();
            ReadOutcome::WouldBlockWrite
        }
        SslStatus::WantAccept | SslStatus::WantSniResolve => ReadOutcome::WouldBlockRead,
        SslStatus::WantConnect => ReadOutcome::WouldBlockWrite,
        SslStatus::ZeroReturn => {
            stats.add_error_zero_return();
            ReadOutcome::Eos
        }
        SslStatus::Syscall(None) => ReadOutcome::Eos,
        SslStatus::Syscall(Some(e)) => {
            stats.add_error_syscall();
            debug!("ssl read underlying io error: {e}");
            ReadOutcome::Error(e.raw_os_error().unwrap_or(0))
        }
        SslStatus::Ssl(msg) => {
            stats.add_error_ssl();
            debug!("ssl read protocol error: {msg}");
            ReadOutcome::Error(0)
        }
    }
}

/// Opaque byte forwarding for blind-tunnel mode.
fn plain_read_io(vc: &Arc<TlsVc>, nh: &dyn NetPoller) {
    let cont = { vc.core.lock().unwrap().read.vio.cont.clone() };
    let mut sig = match try_signal_guard(&cont) {
        Ok(sig) => sig,
        Err(()) => {
            nh.read_reschedule(vc);
            return;
        }
    };

    let toread = {
        let core = vc.core.lock().unwrap();
        if !core.read.enabled || core.read.vio.op != VioOp::Read {
            drop(core);
            nh.read_disable(vc);
            return;
        }
        let cfg = vc.env().config();
        if core.read.vio.ntodo() <= 0 || core.read.vio.buffer.read_avail() >= cfg.read_water_mark {
            drop(core);
            nh.read_disable(vc);
            return;
        }
        core.read.vio.ntodo() as usize
    };

    let result = {
        let mut core = vc.core.lock().unwrap();
        let Some(sock) = core.sock() else {
            return;
        };
        sock::read_into_chain(sock, &mut core.read.vio.buffer, toread)
    };

    match result {
        RawRead::Bytes(n) => {
            let ntodo = {
                let mut core = vc.core.lock().unwrap();
                core.read.vio.ndone += n as i64;
                core.last_activity = Some(Instant::now());
                core.read.vio.ntodo()
            };
            if ntodo <= 0 {
                vc.read_signal_done(&mut sig, Event::ReadComplete);
            } else {
                if vc.read_signal_and_update(&mut sig, Event::ReadReady) == SignalResult::Stop {
                    return;
                }
                nh.read_reschedule(vc);
            }
        }
        RawRead::WouldBlock => {
            vc.core.lock().unwrap().read.triggered = false;
            nh.read_ready_remove(vc);
        }
        RawRead::Eof => {
            vc.core.lock().unwrap().read.triggered = false;
            vc.read_signal_done(&mut sig, Event::Eos);
        }
        RawRead::Err(e) => {
            vc.core.lock().unwrap().read.triggered = false;
            vc.read_signal_error(&mut sig, e.raw_os_error().unwrap_or(0));
        }
    }
}
