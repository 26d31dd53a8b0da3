/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2025 ByteDance and/or its affiliates.
 */

use std::io::{Read as _, Write as _};
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use openssl::asn1::Asn1Time;
use openssl::bn::BigNum;
use openssl::ec::{EcGroup, EcKey};
use openssl::hash::MessageDigest;
use openssl::nid::Nid;
use openssl::pkey::{PKey, Private};
use openssl::ssl::{SslConnector, SslMethod, SslVerifyMode};
use openssl::x509::{X509Builder, X509NameBuilder, X509};

use e2_net::vc::{HookOp, NetPoller, TlsVc, VcMode, VcOptions};
use e2_net::{
    AlpnSet, CertStoreBuilder, CertificatePair, ContRef, Event, EventSink, HookPoint,
    HookRegistry, Runtime, ScheduledTask, SslEnv,
};

const SNI_HOST: &str = "origin.test.x";

#[derive(Default)]
struct QueueRuntime {
    tasks: Mutex<Vec<Box<dyn ScheduledTask>>>,
}

impl Runtime for QueueRuntime {
    fn schedule_imm(&self, task: Box<dyn ScheduledTask>) {
        self.tasks.lock().unwrap().push(task);
    }
}

fn run_all(rt: &Arc<QueueRuntime>) {
    loop {
        let queued = std::mem::take(&mut *rt.tasks.lock().unwrap());
        if queued.is_empty() {
            return;
        }
        let dyn_rt: Arc<dyn Runtime> = rt.clone();
        for t in queued {
            t.run(&dyn_rt);
        }
    }
}

#[derive(Default)]
struct MockPoller {
    read_reschedules: AtomicUsize,
    write_reschedules: AtomicUsize,
    read_disables: AtomicUsize,
    read_ready_removes: AtomicUsize,
}

impl NetPoller for MockPoller {
    fn read_reschedule(&self, _vc: &Arc<TlsVc>) {
        self.read_reschedules.fetch_add(1, Ordering::Relaxed);
    }
    fn write_reschedule(&self, _vc: &Arc<TlsVc>) {
        self.write_reschedules.fetch_add(1, Ordering::Relaxed);
    }
    fn read_disable(&self, _vc: &Arc<TlsVc>) {
        self.read_disables.fetch_add(1, Ordering::Relaxed);
    }
    fn write_disable(&self, _vc: &Arc<TlsVc>) {}
    fn read_ready_in_or_enqueue(&self, _vc: &Arc<TlsVc>) {}
    fn read_ready_remove(&self, _vc: &Arc<TlsVc>) {
        self.read_ready_removes.fetch_add(1, Ordering::Relaxed);
    }
    fn write_ready_remove(&self, _vc: &Arc<TlsVc>) {}
}

/// Upstream continuation recording events and draining the read VIO.
struct Recorder {
    events: Arc<Mutex<Vec<Event>>>,
    data: Arc<Mutex<Vec<u8>>>,
}

impl EventSink for Recorder {
    fn handle_event(&mut self, event: Event, vc: &Arc<TlsVc>) {
        self.events.lock().unwrap().push(event);
        let bytes = vc.take_read_data();
        self.data.lock().unwrap().extend_from_slice(&bytes);
    }
}

struct Harness {
    rt: Arc<QueueRuntime>,
    nh: Arc<MockPoller>,
    env: Arc<SslEnv>,
    events: Arc<Mutex<Vec<Event>>>,
    data: Arc<Mutex<Vec<u8>>>,
}

fn test_key_cert() -> (X509, PKey<Private>) {
    let group = EcGroup::from_curve_name(Nid::X9_62_PRIME256V1).unwrap();
    let ec = EcKey::generate(&group).unwrap();
    let pkey = PKey::from_ec_key(ec).unwrap();

    let mut name = X509NameBuilder::new().unwrap();
    name.append_entry_by_text("CN", SNI_HOST).unwrap();
    let name = name.build();

    let mut builder = X509Builder::new().unwrap();
    builder.set_version(2).unwrap();
    builder.set_subject_name(&name).unwrap();
    builder.set_issuer_name(&name).unwrap();
    builder.set_pubkey(&pkey).unwrap();
    let serial = BigNum::from_u32(1).unwrap().to_asn1_integer().unwrap();
    builder.set_serial_number(&serial).unwrap();
    builder
        .set_not_before(&Asn1Time::days_from_now(0).unwrap())
        .unwrap();
    builder
        .set_not_after(&Asn1Time::days_from_now(1).unwrap())
        .unwrap();
    builder.sign(&pkey, MessageDigest::sha256()).unwrap();
    (builder.build(), pkey)
}

fn make_env(rt: &Arc<QueueRuntime>, hooks: HookRegistry) -> Arc<SslEnv> {
    let env = Arc::new(SslEnv::new(rt.clone()));

    let (cert, key) = test_key_cert();
    let mut pair = CertificatePair::default();
    pair.set_certificates(vec![cert]).unwrap();
    pair.set_private_key(key).unwrap();

    let mut store = CertStoreBuilder::default();
    store.set_default_pair(pair).unwrap();
    env.set_cert_store(Arc::new(store.build().unwrap()));
    env.set_hooks(hooks);
    env
}

fn harness(hooks: HookRegistry) -> Harness {
    let rt = Arc::new(QueueRuntime::default());
    let env = make_env(&rt, hooks);
    Harness {
        rt,
        nh: Arc::new(MockPoller::default()),
        env,
        events: Arc::new(Mutex::new(Vec::new())),
        data: Arc::new(Mutex::new(Vec::new())),
    }
}

impl Harness {
    fn server_vc(&self, sock: UnixStream) -> Arc<TlsVc> {
        sock.set_nonblocking(true).unwrap();
        let vc = TlsVc::new_server(self.env.clone(), sock.into(), VcOptions::default());
        let cont: ContRef = Arc::new(Mutex::new(Recorder {
            events: self.events.clone(),
            data: self.data.clone(),
        }));
        vc.do_io_read(Some(cont), i64::MAX);
        vc
    }

    fn drive_read_until(&self, vc: &Arc<TlsVc>, timeout: Duration, pred: impl Fn() -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            vc.net_read_io(&*self.nh);
            run_all(&self.rt);
            if pred() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        false
    }

    fn drive_write_until(
        &self,
        vc: &Arc<TlsVc>,
        timeout: Duration,
        pred: impl Fn() -> bool,
    ) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            vc.net_write_io(&*self.nh);
            vc.net_read_io(&*self.nh);
            run_all(&self.rt);
            if pred() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        false
    }

    fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }

    fn data(&self) -> Vec<u8> {
        self.data.lock().unwrap().clone()
    }
}

fn tls_client(
    sock: UnixStream,
    alpn: Option<&'static [u8]>,
    payload: &'static [u8],
    read_back: usize,
) -> std::thread::JoinHandle<Vec<u8>> {
    std::thread::spawn(move || {
        let mut builder = SslConnector::builder(SslMethod::tls()).unwrap();
        builder.set_verify(SslVerifyMode::NONE);
        if let Some(protos) = alpn {
            builder.set_alpn_protos(protos).unwrap();
        }
        let connector = builder.build();
        let mut config = connector.configure().unwrap();
        config.set_verify_hostname(false);
        let mut stream = config.connect(SNI_HOST, sock).unwrap();

        if !payload.is_empty() {
            stream.write_all(payload).unwrap();
            stream.flush().unwrap();
        }

        let mut got = vec![0u8; read_back];
        if read_back > 0 {
            stream.read_exact(&mut got).unwrap();
        }
        let _ = stream.shutdown();
        got
    })
}

#[test]
fn happy_path_server_handshake_and_echo() {
    let h = harness(HookRegistry::default());
    let (client_sock, server_sock) = UnixStream::pair().unwrap();
    let vc = h.server_vc(server_sock);

    let msg = b"hello over tls";
    let reply = b"hello back";
    let client = tls_client(client_sock, None, msg, reply.len());

    assert!(h.drive_read_until(&vc, Duration::from_secs(5), || h.data() == msg));
    assert!(vc.handshake_done());
    assert_eq!(vc.mode(), VcMode::Tls);
    // no protocol negotiated, so no endpoint resolved
    assert!(vc.alpn_endpoint().is_none());

    // data flowed, no terminal event yet
    let events = h.events();
    assert!(events.contains(&Event::ReadReady));
    assert!(!events
        .iter()
        .any(|e| matches!(e, Event::Eos | Event::Error(_) | Event::ReadComplete)));

    // send the reply through the write path
    vc.do_io_write(None, reply.len() as i64);
    vc.queue_write_data(reply);
    assert!(h.drive_write_until(&vc, Duration::from_secs(5), || client.is_finished()));

    let got = client.join().unwrap();
    assert_eq!(got, reply);

    assert_eq!(h.env.stats().handshake_count(), 1);
    vc.free();
}

#[test]
fn close_notify_signals_one_eos() {
    let h = harness(HookRegistry::default());
    let (client_sock, server_sock) = UnixStream::pair().unwrap();
    let vc = h.server_vc(server_sock);

    let msg = b"last words";
    let client = tls_client(client_sock, None, msg, 0);

    assert!(h.drive_read_until(&vc, Duration::from_secs(5), || {
        h.events().contains(&Event::Eos)
    }));
    client.join().unwrap();

    assert_eq!(h.data(), msg);
    let events = h.events();
    let terminals = events
        .iter()
        .filter(|e| matches!(e, Event::Eos | Event::Error(_) | Event::ReadComplete))
        .count();
    assert_eq!(terminals, 1, "exactly one terminal event: {events:?}");
    assert_eq!(*events.last().unwrap(), Event::Eos);
}

struct PreAcceptHook {
    name: &'static str,
    order: Arc<Mutex<Vec<&'static str>>>,
    reenable: bool,
    nh: Arc<MockPoller>,
}

impl EventSink for PreAcceptHook {
    fn handle_event(&mut self, event: Event, vc: &Arc<TlsVc>) {
        assert_eq!(event, Event::PreAccept);
        self.order.lock().unwrap().push(self.name);
        if self.reenable {
            vc.reenable(&*self.nh);
        }
    }
}

#[test]
fn pre_accept_hooks_run_in_order() {
    let order = Arc::new(Mutex::new(Vec::new()));
    let rt = Arc::new(QueueRuntime::default());
    let nh = Arc::new(MockPoller::default());

    let mut hooks = HookRegistry::default();
    for name in ["first", "second"] {
        hooks.append(
            HookPoint::PreAccept,
            Arc::new(Mutex::new(PreAcceptHook {
                name,
                order: order.clone(),
                reenable: true,
                nh: nh.clone(),
            })),
        );
    }

    let env = make_env(&rt, hooks);
    let h = Harness {
        rt,
        nh,
        env,
        events: Arc::new(Mutex::new(Vec::new())),
        data: Arc::new(Mutex::new(Vec::new())),
    };

    let (client_sock, server_sock) = UnixStream::pair().unwrap();
    let vc = h.server_vc(server_sock);

    let msg = b"after the hooks";
    let client = tls_client(client_sock, None, msg, 0);

    assert!(h.drive_read_until(&vc, Duration::from_secs(5), || h.data() == msg));
    assert_eq!(*order.lock().unwrap(), vec!["first", "second"]);
    let _ = client.join();
}

#[test]
fn pre_accept_suspension_blocks_socket_reads() {
    let order = Arc::new(Mutex::new(Vec::new()));
    let rt = Arc::new(QueueRuntime::default());
    let nh = Arc::new(MockPoller::default());

    let mut hooks = HookRegistry::default();
    hooks.append(
        HookPoint::PreAccept,
        Arc::new(Mutex::new(PreAcceptHook {
            name: "suspender",
            order: order.clone(),
            reenable: false,
            nh: nh.clone(),
        })),
    );

    let env = make_env(&rt, hooks);
    let h = Harness {
        rt,
        nh,
        env,
        events: Arc::new(Mutex::new(Vec::new())),
        data: Arc::new(Mutex::new(Vec::new())),
    };

    let (client_sock, server_sock) = UnixStream::pair().unwrap();
    let vc = h.server_vc(server_sock);

    let msg = b"delayed by a plugin";
    let client = tls_client(client_sock, None, msg, 0);

    // the hook holds the handshake: no socket reads while suspended
    let progressed = h.drive_read_until(&vc, Duration::from_millis(50), || {
        h.env.stats().raw_read_calls() > 0
    });
    assert!(!progressed);
    assert!(!vc.handshake_done());
    assert_eq!(*order.lock().unwrap(), vec!["suspender"]);

    // plugin wakes us up; handshake completes as if never suspended
    vc.reenable(&*h.nh);
    assert!(h.drive_read_until(&vc, Duration::from_secs(5), || h.data() == msg));
    assert!(vc.handshake_done());
    let _ = client.join();
}

#[test]
fn free_with_active_hook_is_flagged() {
    let order = Arc::new(Mutex::new(Vec::new()));
    let rt = Arc::new(QueueRuntime::default());
    let nh = Arc::new(MockPoller::default());

    let mut hooks = HookRegistry::default();
    hooks.append(
        HookPoint::PreAccept,
        Arc::new(Mutex::new(PreAcceptHook {
            name: "stuck",
            order,
            reenable: false,
            nh: nh.clone(),
        })),
    );

    let env = make_env(&rt, hooks);
    let h = Harness {
        rt,
        nh,
        env,
        events: Arc::new(Mutex::new(Vec::new())),
        data: Arc::new(Mutex::new(Vec::new())),
    };

    let (_client_sock, server_sock) = UnixStream::pair().unwrap();
    let vc = h.server_vc(server_sock);

    vc.net_read_io(&*h.nh);
    run_all(&h.rt);
    assert_eq!(h.env.stats().hook_leak(), 0);

    vc.free();
    assert_eq!(h.env.stats().hook_leak(), 1);
}

/// A syntactically valid TLS 1.2 client hello carrying an SNI
/// extension, byte-for-byte under the test's control.
fn build_client_hello(host: &str) -> Vec<u8> {
    let name = host.as_bytes();
    let mut sni_val = Vec::new();
    sni_val.extend_from_slice(&((name.len() as u16 + 3).to_be_bytes()));
    sni_val.push(0x00);
    sni_val.extend_from_slice(&(name.len() as u16).to_be_bytes());
    sni_val.extend_from_slice(name);

    let mut ext = Vec::new();
    ext.extend_from_slice(&0u16.to_be_bytes());
    ext.extend_from_slice(&(sni_val.len() as u16).to_be_bytes());
    ext.extend_from_slice(&sni_val);

    let mut body = Vec::new();
    body.extend_from_slice(&[0x03, 0x03]);
    body.extend_from_slice(&[0x5a; 32]);
    body.push(0x00);
    let ciphers: [u16; 4] = [0xc02f, 0xc030, 0x009c, 0x002f];
    body.extend_from_slice(&((ciphers.len() * 2) as u16).to_be_bytes());
    for c in ciphers {
        body.extend_from_slice(&c.to_be_bytes());
    }
    body.extend_from_slice(&[0x01, 0x00]);
    body.extend_from_slice(&(ext.len() as u16).to_be_bytes());
    body.extend_from_slice(&ext);

    let mut hs = Vec::new();
    hs.push(0x01);
    hs.extend_from_slice(&(body.len() as u32).to_be_bytes()[1..]);
    hs.extend_from_slice(&body);

    let mut rec = Vec::new();
    rec.push(0x16);
    rec.extend_from_slice(&[0x03, 0x01]);
    rec.extend_from_slice(&(hs.len() as u16).to_be_bytes());
    rec.extend_from_slice(&hs);
    rec
}

struct TunnelSniHook {
    nh: Arc<MockPoller>,
    seen_sni: Arc<Mutex<Option<String>>>,
}

impl EventSink for TunnelSniHook {
    fn handle_event(&mut self, event: Event, vc: &Arc<TlsVc>) {
        assert_eq!(event, Event::Sni);
        *self.seen_sni.lock().unwrap() = vc.sni_server_name().map(|n| n.as_ref().to_string());
        vc.set_hook_op(HookOp::Tunnel);
        vc.reenable(&*self.nh);
    }
}

#[test]
fn sni_tunnel_promotion_replays_client_hello() {
    let rt = Arc::new(QueueRuntime::default());
    let nh = Arc::new(MockPoller::default());
    let seen_sni = Arc::new(Mutex::new(None));

    let mut hooks = HookRegistry::default();
    hooks.append(
        HookPoint::Sni,
        Arc::new(Mutex::new(TunnelSniHook {
            nh: nh.clone(),
            seen_sni: seen_sni.clone(),
        })),
    );

    let env = make_env(&rt, hooks);
    let h = Harness {
        rt,
        nh,
        env,
        events: Arc::new(Mutex::new(Vec::new())),
        data: Arc::new(Mutex::new(Vec::new())),
    };

    let (client_sock, server_sock) = UnixStream::pair().unwrap();
    let vc = h.server_vc(server_sock);

    let hello = build_client_hello(SNI_HOST);
    (&client_sock).write_all(&hello).unwrap();

    assert!(h.drive_read_until(&vc, Duration::from_secs(5), || !h.data().is_empty()));

    // abandoned TLS, promoted to a byte tunnel
    assert_eq!(vc.mode(), VcMode::BlindTunnel);
    assert!(vc.handshake_done());
    assert_eq!(seen_sni.lock().unwrap().as_deref(), Some(SNI_HOST));

    // the exact client hello bytes are the first thing upstream sees
    assert_eq!(h.data(), hello);

    // promotion wakes the upstream twice: decision, then forwarding
    let completes = h
        .events()
        .iter()
        .filter(|e| **e == Event::ReadComplete)
        .count();
    assert_eq!(completes, 2);
}

struct AlpnEndpointSink;

impl EventSink for AlpnEndpointSink {
    fn handle_event(&mut self, _event: Event, _vc: &Arc<TlsVc>) {}
}

#[test]
fn alpn_selection_prefers_server_order() {
    let h = harness(HookRegistry::default());
    let (client_sock, server_sock) = UnixStream::pair().unwrap();
    let vc = h.server_vc(server_sock);

    let h2_endpoint: ContRef = Arc::new(Mutex::new(AlpnEndpointSink));
    let h1_endpoint: ContRef = Arc::new(Mutex::new(AlpnEndpointSink));
    let mut set = AlpnSet::builder();
    set.add(&b"h2"[..], h2_endpoint.clone()).unwrap();
    set.add(&b"http/1.1"[..], h1_endpoint).unwrap();
    vc.register_alpn_set(Arc::new(set.build()));

    // the client prefers http/1.1; the server preference must win
    let msg = b"alpn done";
    let client = tls_client(client_sock, Some(&b"\x08http/1.1\x02h2"[..]), msg, 0);

    assert!(h.drive_read_until(&vc, Duration::from_secs(5), || h.data() == msg));
    let endpoint = vc.alpn_endpoint().expect("an endpoint must be resolved");
    assert!(Arc::ptr_eq(&endpoint, &h2_endpoint));
    let _ = client.join();
}
