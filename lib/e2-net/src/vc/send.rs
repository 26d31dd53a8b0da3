/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2025 ByteDance and/or its affiliates.
 */

use std::io::IoSlice;
use std::sync::Arc;
use std::time::Instant;

use log::debug;

use e2_openssl::SslStatus;

use crate::event::Event;
use crate::stat::SslStats;

use super::handshake::{self, HsStatus};
use super::{
    try_signal_guard, NetPoller, SignalResult, TlsVc, VcCore, VcMode, VioOp,
};

#[derive(Default)]
pub(crate) struct Needs {
    pub read: bool,
    pub write: bool,
}

pub(crate) struct WriteTally {
    pub attempted: i64,
    pub written: i64,
    pub needs: Needs,
}

pub(crate) fn net_write_io(vc: &Arc<TlsVc>, nh: &dyn NetPoller) {
    if vc.closed() {
        return;
    }
    if vc.mode() == VcMode::BlindTunnel {
        plain_write_io(vc, nh);
        return;
    }

    let cont = { vc.core.lock().unwrap().write.vio.cont.clone() };
    let mut sig = match try_signal_guard(&cont) {
        Ok(sig) => sig,
        Err(()) => {
            nh.write_reschedule(vc);
            return;
        }
    };

    {
        let core = vc.core.lock().unwrap();
        if !core.write.enabled || core.write.vio.op != VioOp::Write {
            drop(core);
            nh.write_disable(vc);
            return;
        }
    }

    if !vc.handshake_done() {
        match handshake::start_handshake(vc, nh) {
            HsStatus::Done => {}
            HsStatus::WantRead | HsStatus::WantAccept => {
                vc.core.lock().unwrap().read.triggered = false;
                nh.read_ready_remove(vc);
                nh.read_reschedule(vc);
                return;
            }
            HsStatus::WantWrite | HsStatus::WantConnect => {
                vc.core.lock().unwrap().write.triggered = false;
                nh.write_ready_remove(vc);
                nh.write_reschedule(vc);
                return;
            }
            HsStatus::WaitForHook => return,
            HsStatus::Continue => {
                nh.write_reschedule(vc);
                return;
            }
            HsStatus::Error(e) => {
                vc.core.lock().unwrap().write.triggered = false;
                debug!("handshake failed on write path: {e}");
                vc.write_signal_error(&mut sig, e.errno());
                return;
            }
        }
        if vc.mode() == VcMode::BlindTunnel {
            // promotion and replay belong to the read path
            nh.read_reschedule(vc);
            return;
        }
    }

    let towrite = {
        let core = vc.core.lock().unwrap();
        let ntodo = core.write.vio.ntodo();
        if ntodo <= 0 {
            drop(core);
            nh.write_disable(vc);
            return;
        }
        let avail = core.write.vio.buffer.read_avail() as i64;
        if avail == 0 {
            drop(core);
            nh.write_disable(vc);
            return;
        }
        ntodo.min(avail)
    };

    let (ret, tally) = load_buffer_and_write(vc, towrite);

    if tally.written > 0 {
        let mut core = vc.core.lock().unwrap();
        let written = tally.written as usize;
        core.write.vio.buffer.consume(written);
        core.write.vio.ndone += tally.written;
        core.last_activity = Some(Instant::now());
    }

    if ret >= 0 {
        if tally.needs.write {
            // partial record acceptance, keep the interest armed
            debug!("wrote some bytes, but not all requested");
            nh.write_reschedule(vc);
        }
        let ntodo = { vc.core.lock().unwrap().write.vio.ntodo() };
        if ntodo <= 0 {
            vc.write_signal_done(&mut sig, Event::WriteComplete);
        } else {
            if vc.write_signal_and_update(&mut sig, Event::WriteReady) == SignalResult::Stop {
                return;
            }
            nh.write_reschedule(vc);
        }
    } else if ret == -(libc::EAGAIN as i64) {
        if tally.written > 0
            && vc.write_signal_and_update(&mut sig, Event::WriteReady) == SignalResult::Stop
        {
            return;
        }
        if tally.needs.read {
            nh.read_reschedule(vc);
        }
        if tally.needs.write {
            vc.core.lock().unwrap().write.triggered = false;
            nh.write_ready_remove(vc);
            nh.write_reschedule(vc);
        }
    } else {
        vc.core.lock().unwrap().write.triggered = false;
        vc.write_signal_error(&mut sig, (-ret) as i32);
    }
}

/// Encrypt and send up to `towrite` bytes from the write VIO's buffer,
/// one bounded record per op.
///
/// Record caps come in three modes: a fixed cap, dynamic sizing from
/// the recent write rate, or off (one op per block). Dynamic mode
/// models slow start: short records at burst start, full records once
/// the burst has moved enough bytes.
pub(crate) fn load_buffer_and_write(vc: &Arc<TlsVc>, towrite: i64) -> (i64, WriteTally) {
    let stats = vc.env().stats().clone();
    let cfg = vc.env().config();
    let mut core = vc.core.lock().unwrap();
    let core = &mut *core;

    let mut tally = WriteTally {
        attempted: 0,
        written: 0,
        needs: Needs::default(),
    };

    let VcCore {
        engine,
        write,
        last_write,
        bytes_since_idle,
        ..
    } = core;
    let Some(engine) = engine.as_mut() else {
        return (-(libc::EBADF as i64), tally);
    };

    let mut now = None;
    if cfg.max_record == -1 {
        let t = Instant::now();
        if let Some(lw) = *last_write {
            if cfg.write_idle_expired(t.duration_since(lw)) {
                // a new burst: probe with short records again
                *bytes_since_idle = 0;
            }
        }
        now = Some(t);
    }

    let mut ret: i64 = 0;
    'blocks: for slice in write.vio.buffer.read_slices() {
        let mut offset = 0usize;
        while offset < slice.len() {
            let budget = towrite - tally.attempted;
            if budget <= 0 {
                break 'blocks;
            }
            let mut l = (slice.len() - offset).min(budget as usize);
            if cfg.max_record > 0 {
                l = l.min(cfg.max_record as usize);
            } else if cfg.max_record == -1 {
                let cap = cfg.dynamic_record_cap(*bytes_since_idle);
                if cap == cfg.def_record_size {
                    stats.add_dyn_def_record();
                } else {
                    stats.add_dyn_max_record();
                }
                l = l.min(cap);
            }
            if l == 0 {
                break 'blocks;
            }

            tally.attempted += l as i64;
            match engine.write(&slice[offset..offset + l]) {
                Ok(n) => {
                    tally.written += n as i64;
                    ret = tally.written;
                    offset += n;
                    if n < l {
                        // a partially accepted record; unclear how the
                        // library gets here instead of a want-write,
                        // treat it as backpressure
                        tally.needs.write = true;
                        break 'blocks;
                    }
                }
                Err(status) => {
                    ret = map_write_status(status, &mut tally.needs, &stats);
                    break 'blocks;
                }
            }
        }
    }

    if tally.written > 0 {
        if let Some(t) = now {
            *last_write = Some(t);
        }
        *bytes_since_idle += tally.written as u64;
    }

    (ret, tally)
}

fn map_write_status(status: SslStatus, needs: &mut Needs, stats: &SslStats) -> i64 {
    match status {
        SslStatus::WantRead => {
            stats.add_error_want_read();
            needs.read = true;
            -(libc::EAGAIN as i64)
        }
        SslStatus::WantWrite => {
            stats.add_error_want_write();
            needs.write = true;
            -(libc::EAGAIN as i64)
        }
        SslStatus::WantX509Lookup => {
            stats.add_error_want_x509_lookup();
            needs.write = true;
            -(libc::EAGAIN as i64)
        }
        SslStatus::WantAccept | SslStatus::WantConnect | SslStatus::WantSniResolve => {
            needs.write = true;
            -(libc::EAGAIN as i64)
        }
        SslStatus::ZeroReturn => {
            stats.add_error_zero_return();
            -(libc::EPIPE as i64)
        }
        SslStatus::Syscall(e) => {
            stats.add_error_syscall();
            let errno = e
                .and_then(|e| e.raw_os_error())
                .unwrap_or(libc::EPIPE);
            -(errno as i64)
        }
        SslStatus::Ssl(msg) => {
            stats.add_error_ssl();
            debug!("ssl write protocol error: {msg}");
            -(libc::EPROTO as i64)
        }
    }
}

/// Gather-write straight from the VIO buffer in blind-tunnel mode.
fn plain_write_io(vc: &Arc<TlsVc>, nh: &dyn NetPoller) {
    let cont = { vc.core.lock().unwrap().write.vio.cont.clone() };
    let mut sig = match try_signal_guard(&cont) {
        Ok(sig) => sig,
        Err(()) => {
            nh.write_reschedule(vc);
            return;
        }
    };

    let result = {
        let core = vc.core.lock().unwrap();
        if !core.write.enabled || core.write.vio.op != VioOp::Write {
            drop(core);
            nh.write_disable(vc);
            return;
        }
        let towrite = core
            .write
            .vio
            .ntodo()
            .min(core.write.vio.buffer.read_avail() as i64);
        if towrite <= 0 {
            drop(core);
            nh.write_disable(vc);
            return;
        }
        let Some(sock) = core.sock() else {
            return;
        };

        let mut budget = towrite as usize;
        let mut iov = Vec::with_capacity(crate::sock::NET_MAX_IOV);
        for s in core.write.vio.buffer.read_slices() {
            if budget == 0 || iov.len() >= crate::sock::NET_MAX_IOV {
                break;
            }
            let take = s.len().min(budget);
            budget -= take;
            iov.push(IoSlice::new(&s[..take]));
        }
        sock.writev(&iov)
    };

    match result {
        Ok(n) => {
            let ntodo = {
                let mut core = vc.core.lock().unwrap();
                core.write.vio.buffer.consume(n);
                core.write.vio.ndone += n as i64;
                core.last_activity = Some(Instant::now());
                core.write.vio.ntodo()
            };
            if ntodo <= 0 {
                vc.write_signal_done(&mut sig, Event::WriteComplete);
            } else {
                if vc.write_signal_and_update(&mut sig, Event::WriteReady) == SignalResult::Stop {
                    return;
                }
                nh.write_reschedule(vc);
            }
        }
        Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
            vc.core.lock().unwrap().write.triggered = false;
            nh.write_ready_remove(vc);
            nh.write_reschedule(vc);
        }
        Err(e) => {
            vc.core.lock().unwrap().write.triggered = false;
            vc.write_signal_error(&mut sig, e.raw_os_error().unwrap_or(0));
        }
    }
}
