/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2025 ByteDance and/or its affiliates.
 */

use std::io;
use std::os::fd::{AsRawFd, OwnedFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Instant;

use log::{debug, error, warn};
use openssl::ssl::SslContext;
use thiserror::Error;

use e2_openssl::{ServerName, SslEngine, SslStatus};

use crate::env::SslEnv;
use crate::event::{ContRef, Event, EventSink};
use crate::hook::HookPoint;
use crate::sock::RawSock;
use crate::AlpnSet;

mod vio;
pub use vio::{Vio, VioOp};
use vio::NetState;

mod poller;
pub use poller::NetPoller;

pub(crate) mod registry;
use registry::VcToken;

mod replay;
use replay::HandshakeReplay;

mod handshake;
mod recv;
mod send;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VcRole {
    Client,
    Server,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VcMode {
    Tls,
    /// The TLS state machine was abandoned; bytes are forwarded
    /// opaquely. This transition is one-way.
    BlindTunnel,
}

/// Plugin verdict that redirects handshake completion.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HookOp {
    Default,
    Tunnel,
    Terminate,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum PreAcceptState {
    Init,
    Invoke,
    Active,
    Done,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum SniState {
    Init,
    Continue,
    Done,
}

/// What the client-hello callback tells the library to do next.
pub(crate) enum SniDisposition {
    Continue,
    Suspend,
}

#[derive(Clone, Debug, Default)]
pub struct VcOptions {
    /// SNI name to present on client-side handshakes.
    pub sni_servername: Option<String>,
    /// Transparent-proxy accept; tunnel-flagged listening addresses
    /// promote immediately.
    pub transparent: bool,
}

#[derive(Debug, Error)]
pub enum VcError {
    #[error("connection already closed")]
    Closed,
    #[error("no certificate store configured")]
    NoCertStore,
    #[error("failed to create ssl session: {0}")]
    SessionCreate(#[from] openssl::error::ErrorStack),
    #[error("tls handshake failed: {0}")]
    Handshake(SslStatus),
    #[error("eof during handshake")]
    HandshakeEof,
    #[error("transport error during handshake: {0}")]
    HandshakeIo(io::Error),
    #[error("negotiated protocol not registered")]
    AlpnUnresolved,
    #[error("protocol negotiated without a registered alpn set")]
    AlpnSetMissing,
}

impl VcError {
    pub(crate) fn errno(&self) -> i32 {
        match self {
            VcError::Handshake(s) => s.raw_errno().unwrap_or(0),
            VcError::HandshakeIo(e) => e.raw_os_error().unwrap_or(0),
            _ => 0,
        }
    }
}

pub(crate) struct VcCore {
    pub fd: Option<OwnedFd>,
    pub mode: VcMode,
    pub engine: Option<SslEngine<RawSock>>,
    pub replay: Option<HandshakeReplay>,
    pub read: NetState,
    pub write: NetState,
    pub last_write: Option<Instant>,
    pub bytes_since_idle: u64,
    pub handshake_begin: Option<Instant>,
    pub last_activity: Option<Instant>,
}

impl VcCore {
    pub(crate) fn sock(&self) -> Option<RawSock> {
        self.fd.as_ref().map(|fd| RawSock::new(fd.as_raw_fd()))
    }
}

/// State the TLS library's global callbacks and plugin hooks may touch
/// while the engine is being driven. Kept apart from [`VcCore`] so a
/// callback firing inside `accept` never needs the core lock.
pub(crate) struct CbState {
    pub pre_accept: PreAcceptState,
    pub cur_hook: usize,
    pub sni: SniState,
    pub hook_op: HookOp,
    pub sni_name: Option<ServerName>,
    pub pending_ctx: Option<SslContext>,
    pub in_sni_callback: bool,
    pub alpn_set: Option<Arc<AlpnSet>>,
    pub alpn_endpoint: Option<ContRef>,
}

impl CbState {
    fn reset(&mut self) {
        self.pre_accept = PreAcceptState::Init;
        self.cur_hook = 0;
        self.sni = SniState::Init;
        self.hook_op = HookOp::Default;
        self.sni_name = None;
        self.pending_ctx = None;
        self.in_sni_callback = false;
        self.alpn_set = None;
        self.alpn_endpoint = None;
    }
}

/// A TLS-terminating virtual connection.
///
/// Owned by the poller thread that currently holds its ready-list
/// entry; all upstream signalling happens under the VIO continuation's
/// own mutex, acquired by try-lock with reschedule on contention.
pub struct TlsVc {
    env: Arc<SslEnv>,
    role: VcRole,
    options: VcOptions,
    token: VcToken,
    self_ref: Weak<TlsVc>,
    handshake_done: AtomicBool,
    reneg_abort: AtomicBool,
    closed: AtomicBool,
    pub(crate) core: Mutex<VcCore>,
    pub(crate) cb: Mutex<CbState>,
}

impl TlsVc {
    pub fn new_server(env: Arc<SslEnv>, fd: OwnedFd, options: VcOptions) -> Arc<TlsVc> {
        Self::new(env, fd, options, VcRole::Server)
    }

    pub fn new_client(env: Arc<SslEnv>, fd: OwnedFd, options: VcOptions) -> Arc<TlsVc> {
        Self::new(env, fd, options, VcRole::Client)
    }

    fn new(env: Arc<SslEnv>, fd: OwnedFd, options: VcOptions, role: VcRole) -> Arc<TlsVc> {
        let block_size = env.config().buffer_block_size;
        Arc::new_cyclic(|weak| {
            let token = registry::register(weak.clone());
            TlsVc {
                env,
                role,
                options,
                token,
                self_ref: weak.clone(),
                handshake_done: AtomicBool::new(false),
                reneg_abort: AtomicBool::new(false),
                closed: AtomicBool::new(false),
                core: Mutex::new(VcCore {
                    fd: Some(fd),
                    mode: VcMode::Tls,
                    engine: None,
                    replay: None,
                    read: NetState::idle(block_size),
                    write: NetState::idle(block_size),
                    last_write: None,
                    bytes_since_idle: 0,
                    handshake_begin: None,
                    last_activity: None,
                }),
                cb: Mutex::new(CbState {
                    pre_accept: PreAcceptState::Init,
                    cur_hook: 0,
                    sni: SniState::Init,
                    hook_op: HookOp::Default,
                    sni_name: None,
                    pending_ctx: None,
                    in_sni_callback: false,
                    alpn_set: None,
                    alpn_endpoint: None,
                }),
            }
        })
    }

    #[inline]
    pub(crate) fn env(&self) -> &Arc<SslEnv> {
        &self.env
    }

    /// A strong handle to self, for poller and continuation calls.
    /// `None` only during teardown races.
    fn arc(&self) -> Option<Arc<TlsVc>> {
        self.self_ref.upgrade()
    }

    #[inline]
    pub(crate) fn token(&self) -> VcToken {
        self.token
    }

    #[inline]
    pub(crate) fn options(&self) -> &VcOptions {
        &self.options
    }

    #[inline]
    pub fn role(&self) -> VcRole {
        self.role
    }

    pub fn mode(&self) -> VcMode {
        self.core.lock().unwrap().mode
    }

    #[inline]
    pub fn handshake_done(&self) -> bool {
        self.handshake_done.load(Ordering::Acquire)
    }

    pub(crate) fn set_handshake_done(&self) {
        self.handshake_done.store(true, Ordering::Release);
    }

    #[inline]
    pub fn closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn reneg_abort(&self) -> bool {
        self.reneg_abort.load(Ordering::Acquire)
    }

    pub(crate) fn mark_renegotiation_abort(&self) {
        self.reneg_abort.store(true, Ordering::Release);
        self.env.stats().add_renegotiation_abort();
    }

    /// The read half of the poller contract.
    pub fn net_read_io(&self, nh: &dyn NetPoller) {
        let Some(vc) = self.arc() else { return };
        recv::net_read_io(&vc, nh);
    }

    /// The write half of the poller contract.
    pub fn net_write_io(&self, nh: &dyn NetPoller) {
        let Some(vc) = self.arc() else { return };
        send::net_write_io(&vc, nh);
    }

    /// Called by plugins to resume a suspended handshake. During the
    /// pre-accept walk this reschedules the read path; after an SNI
    /// suspension it lets the walk continue on the next drive.
    pub fn reenable(&self, nh: &dyn NetPoller) {
        let mut cb = self.cb.lock().unwrap();
        if cb.pre_accept != PreAcceptState::Done {
            cb.pre_accept = PreAcceptState::Invoke;
            drop(cb);
            if let Some(vc) = self.arc() {
                nh.read_reschedule(&vc);
            }
        } else {
            cb.sni = SniState::Continue;
        }
    }

    /// Attach the read VIO: demand `nbytes`, signal `cont` on progress.
    pub fn do_io_read(&self, cont: Option<ContRef>, nbytes: i64) {
        let block_size = self.env.config().buffer_block_size;
        let mut core = self.core.lock().unwrap();
        core.read.vio = Vio {
            op: VioOp::Read,
            cont,
            buffer: e2_io_chain::ChainBuffer::new(block_size),
            nbytes,
            ndone: 0,
        };
        core.read.enabled = true;
    }

    /// Attach the write VIO.
    pub fn do_io_write(&self, cont: Option<ContRef>, nbytes: i64) {
        let block_size = self.env.config().buffer_block_size;
        let mut core = self.core.lock().unwrap();
        core.write.vio = Vio {
            op: VioOp::Write,
            cont,
            buffer: e2_io_chain::ChainBuffer::new(block_size),
            nbytes,
            ndone: 0,
        };
        core.write.enabled = true;
    }

    /// Drain whatever the read VIO has buffered.
    pub fn take_read_data(&self) -> Vec<u8> {
        let mut core = self.core.lock().unwrap();
        let mut out = Vec::new();
        core.read.vio.buffer.copy_unread(&mut out);
        let n = out.len();
        core.read.vio.buffer.consume(n);
        out
    }

    /// Queue upstream bytes for the write path.
    pub fn queue_write_data(&self, data: &[u8]) {
        let mut core = self.core.lock().unwrap();
        core.write.vio.buffer.append(data);
    }

    /// Bind the protocol set this connection may negotiate. Bound at
    /// most once per connection.
    pub fn register_alpn_set(&self, set: Arc<AlpnSet>) {
        let mut cb = self.cb.lock().unwrap();
        if cb.alpn_set.is_some() || cb.alpn_endpoint.is_some() {
            error!("alpn set registered twice on one connection");
            return;
        }
        cb.alpn_set = Some(set);
    }

    /// The endpoint resolved for the negotiated protocol, if any.
    pub fn alpn_endpoint(&self) -> Option<ContRef> {
        self.cb.lock().unwrap().alpn_endpoint.clone()
    }

    /// Rebind the certificate context of the live session. Returns
    /// false when no session exists. From inside the SNI callback the
    /// rebind is queued and applied when the walk returns.
    pub fn ssl_context_set(&self, ctx: SslContext) -> bool {
        let mut cb = self.cb.lock().unwrap();
        if cb.in_sni_callback {
            cb.pending_ctx = Some(ctx);
            return true;
        }
        drop(cb);
        let mut core = self.core.lock().unwrap();
        match core.engine.as_mut() {
            Some(engine) => {
                if let Err(e) = engine.set_context(&ctx) {
                    warn!("failed to rebind ssl context: {e}");
                }
                true
            }
            None => false,
        }
    }

    /// Record a plugin verdict for handshake completion.
    pub fn set_hook_op(&self, op: HookOp) {
        self.cb.lock().unwrap().hook_op = op;
    }

    pub fn hook_op(&self) -> HookOp {
        self.cb.lock().unwrap().hook_op
    }

    /// The SNI name from the client hello, once parsed.
    pub fn sni_server_name(&self) -> Option<ServerName> {
        self.cb.lock().unwrap().sni_name.clone()
    }

    pub(crate) fn set_sni_name(&self, name: ServerName) {
        self.cb.lock().unwrap().sni_name = Some(name);
    }

    /// Walk a synchronous hook chain. Only the SNI chain is walked this
    /// way; returns whether every hook re-enabled.
    pub fn call_hooks(&self, event: Event) -> bool {
        debug_assert!(matches!(event, Event::Sni));
        let Some(vc) = self.arc() else { return true };
        let hooks = self.env.hooks();
        let chain = hooks.chain(HookPoint::Sni);

        let mut reenabled = true;
        for hook in chain {
            if !reenabled {
                break;
            }
            // reset to the completed state before each invocation; the
            // plugin flips it by calling reenable
            self.cb.lock().unwrap().sni = SniState::Done;

            if let Ok(mut sink) = hook.try_lock() {
                sink.handle_event(event, &vc);
            } else {
                // contended continuation: treat as suspended, the next
                // drive retries the walk
                reenabled = false;
                break;
            }

            if self.cb.lock().unwrap().sni == SniState::Done {
                reenabled = false;
            }
        }
        reenabled
    }

    /// The SNI interception point, run by the library's client-hello
    /// callback while the engine is being driven.
    pub(crate) fn on_client_hello(&self, ssl: &mut openssl::ssl::SslRef) -> SniDisposition {
        self.cb.lock().unwrap().in_sni_callback = true;
        let reenabled = self.call_hooks(Event::Sni);
        let (pending, tunnel) = {
            let mut cb = self.cb.lock().unwrap();
            cb.in_sni_callback = false;
            (cb.pending_ctx.take(), cb.hook_op == HookOp::Tunnel)
        };

        if let Some(ctx) = pending {
            if let Err(e) = ssl.set_ssl_context(&ctx) {
                warn!("failed to rebind ssl context from sni hook: {e}");
            }
        }

        if tunnel || !reenabled {
            SniDisposition::Suspend
        } else {
            SniDisposition::Continue
        }
    }

    /// Server-preference ALPN selection for the library callback.
    pub(crate) fn alpn_select<'a>(&self, client: &'a [u8]) -> Option<&'a [u8]> {
        let cb = self.cb.lock().unwrap();
        cb.alpn_set.as_ref()?.select(client)
    }

    pub(crate) fn has_alpn_set(&self) -> bool {
        self.cb.lock().unwrap().alpn_set.is_some()
    }

    pub(crate) fn enter_blind_tunnel(&self) {
        let mut core = self.core.lock().unwrap();
        core.mode = VcMode::BlindTunnel;
        core.engine = None;
        drop(core);
        self.set_handshake_done();
    }

    /// Tear the connection down and release its resources. A still
    /// active pre-accept hook is a plugin protocol violation: the
    /// connection cannot be cancelled under it, so the leak is counted
    /// and logged.
    pub fn free(&self) {
        {
            let mut cb = self.cb.lock().unwrap();
            if cb.pre_accept == PreAcceptState::Active {
                error!("connection freed with an outstanding pre-accept hook");
                self.env.stats().add_hook_leak();
            }
            cb.reset();
        }

        let block_size = self.env.config().buffer_block_size;
        {
            let mut core = self.core.lock().unwrap();
            core.engine = None;
            core.replay = None;
            core.read = NetState::idle(block_size);
            core.write = NetState::idle(block_size);
            core.mode = VcMode::Tls;
            core.last_write = None;
            core.bytes_since_idle = 0;
            core.handshake_begin = None;
            core.last_activity = None;
            core.fd = None;
        }

        registry::unregister(self.token);
        self.handshake_done.store(false, Ordering::Release);
        self.reneg_abort.store(false, Ordering::Release);
        self.closed.store(true, Ordering::Release);
        debug!("connection freed");
    }
}

impl Drop for TlsVc {
    fn drop(&mut self) {
        registry::unregister(self.token);
    }
}

/// The VIO continuation's lock, held for the duration of one I/O drive
/// so upstream signalling and buffer handoff stay ordered.
pub(crate) struct SignalGuard<'a> {
    cont: &'a ContRef,
    sink: MutexGuard<'a, dyn EventSink>,
}

/// Try to take the continuation's mutex. `Err` means contention: the
/// caller must reschedule instead of blocking the poller thread.
pub(crate) fn try_signal_guard(cont: &Option<ContRef>) -> Result<Option<SignalGuard<'_>>, ()> {
    match cont {
        Some(c) => match c.try_lock() {
            Ok(sink) => Ok(Some(SignalGuard { cont: c, sink })),
            Err(_) => Err(()),
        },
        None => Ok(None),
    }
}

#[derive(PartialEq, Eq)]
pub(crate) enum SignalResult {
    Continue,
    Stop,
}

impl TlsVc {
    pub(crate) fn signal(&self, sig: &mut Option<SignalGuard>, ev: Event) {
        match sig {
            Some(s) => {
                if let Some(vc) = self.arc() {
                    s.sink.handle_event(ev, &vc);
                }
            }
            None => debug!("no continuation bound for event {ev:?}"),
        }
    }

    pub(crate) fn read_signal_done(&self, sig: &mut Option<SignalGuard>, ev: Event) {
        self.signal(sig, ev);
    }

    pub(crate) fn read_signal_error(&self, sig: &mut Option<SignalGuard>, errno: i32) {
        self.signal(sig, Event::Error(errno));
    }

    pub(crate) fn read_signal_and_update(
        &self,
        sig: &mut Option<SignalGuard>,
        ev: Event,
    ) -> SignalResult {
        self.signal(sig, ev);
        if self.closed() {
            SignalResult::Stop
        } else {
            SignalResult::Continue
        }
    }

    /// Whether the upstream swapped the read VIO's continuation while
    /// we were signalling under the old one.
    pub(crate) fn read_retargeted(&self, sig: &Option<SignalGuard>) -> bool {
        let cur = self.core.lock().unwrap().read.vio.cont.clone();
        match (sig, cur) {
            (Some(s), Some(c)) => !Arc::ptr_eq(s.cont, &c),
            (Some(_), None) => true,
            (None, _) => false,
        }
    }

    pub(crate) fn write_signal_done(&self, sig: &mut Option<SignalGuard>, ev: Event) {
        self.signal(sig, ev);
    }

    pub(crate) fn write_signal_error(&self, sig: &mut Option<SignalGuard>, errno: i32) {
        self.signal(sig, Event::Error(errno));
    }

    pub(crate) fn write_signal_and_update(
        &self,
        sig: &mut Option<SignalGuard>,
        ev: Event,
    ) -> SignalResult {
        self.signal(sig, ev);
        if self.closed() {
            SignalResult::Stop
        } else {
            SignalResult::Continue
        }
    }
}
