/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2025 ByteDance and/or its affiliates.
 */

use std::collections::HashMap;
use std::net::IpAddr;

use anyhow::{anyhow, Context};
use log::{debug, warn};
use openssl::pkey::{PKey, Private};
use openssl::ssl::{
    AlpnError, SslAcceptor, SslAcceptorBuilder, SslConnector, SslContext, SslContextBuilder,
    SslContextRef, SslMethod, SslVerifyMode, TlsExtType,
};
use openssl::x509::X509;

use e2_openssl::ServerName;

use crate::vc::registry;
use crate::vc::SniDisposition;

/// A leaf certificate, its chain, and the private key, stored in DER
/// until the context is built.
#[derive(Default, Clone, Debug, Eq, PartialEq)]
pub struct CertificatePair {
    leaf_cert: Vec<u8>,
    chain_certs: Vec<Vec<u8>>,
    key: Vec<u8>,
}

impl CertificatePair {
    pub fn check(&self) -> anyhow::Result<()> {
        if self.leaf_cert.is_empty() {
            return Err(anyhow!("no certificate set"));
        }
        if self.key.is_empty() {
            return Err(anyhow!("no private key set"));
        }
        Ok(())
    }

    pub fn set_certificates(&mut self, certs: Vec<X509>) -> anyhow::Result<()> {
        let certs_len = certs.len();

        let mut certs_iter = certs.into_iter();
        let leaf_cert = certs_iter
            .next()
            .ok_or_else(|| anyhow!("no certificate found"))?;
        self.leaf_cert = leaf_cert
            .to_der()
            .map_err(|e| anyhow!("failed to encode certificate: {e}"))?;

        let mut chain_certs = Vec::with_capacity(certs_len);
        for (i, cert) in certs_iter.enumerate() {
            let bytes = cert
                .to_der()
                .map_err(|e| anyhow!("failed to encode chain certificate #{i}: {e}"))?;
            chain_certs.push(bytes);
        }
        self.chain_certs = chain_certs;

        Ok(())
    }

    pub fn set_private_key(&mut self, key: PKey<Private>) -> anyhow::Result<()> {
        self.key = key
            .private_key_to_der()
            .map_err(|e| anyhow!("failed to encode private key: {e}"))?;
        Ok(())
    }

    fn add_to_ssl_context(&self, ssl_builder: &mut SslContextBuilder) -> anyhow::Result<()> {
        let leaf_cert = X509::from_der(self.leaf_cert.as_slice())
            .map_err(|e| anyhow!("failed to decode certificate: {e}"))?;
        ssl_builder
            .set_certificate(&leaf_cert)
            .map_err(|e| anyhow!("failed to set certificate: {e}"))?;

        for (i, cert) in self.chain_certs.iter().enumerate() {
            let chain_cert = X509::from_der(cert.as_slice())
                .map_err(|e| anyhow!("failed to decode chain certificate #{i}: {e}"))?;
            ssl_builder
                .add_extra_chain_cert(chain_cert)
                .map_err(|e| anyhow!("failed to add chain certificate #{i}: {e}"))?;
        }
        let key = PKey::private_key_from_der(self.key.as_slice())
            .map_err(|e| anyhow!("failed to decode private key: {e}"))?;
        ssl_builder
            .set_private_key(&key)
            .map_err(|e| anyhow!("failed to set private key: {e}"))?;
        Ok(())
    }
}

pub struct CertStoreEntry {
    context: SslContext,
    tunnel: bool,
}

impl CertStoreEntry {
    #[inline]
    pub fn context(&self) -> &SslContextRef {
        &self.context
    }

    /// The destination behind this listening address wants an opaque
    /// tunnel, not local TLS termination.
    #[inline]
    pub fn is_tunnel(&self) -> bool {
        self.tunnel
    }
}

/// Certificate contexts indexed by listening IP, plus the default
/// server context sessions start on and the shared client context.
pub struct CertStore {
    by_ip: HashMap<IpAddr, CertStoreEntry>,
    default_context: SslContext,
    client_context: SslContext,
}

impl CertStore {
    pub fn find(&self, ip: IpAddr) -> Option<&CertStoreEntry> {
        self.by_ip.get(&ip)
    }

    /// The trampoline context: it can never finish a negotiation on its
    /// own, but it carries the callbacks that rebind the session to the
    /// proper context once the client hello is seen.
    #[inline]
    pub fn default_context(&self) -> &SslContextRef {
        &self.default_context
    }

    #[inline]
    pub fn client_context(&self) -> &SslContextRef {
        &self.client_context
    }
}

struct CertStoreBuilderEntry {
    ip: IpAddr,
    pair: Option<CertificatePair>,
    tunnel: bool,
}

#[derive(Default)]
pub struct CertStoreBuilder {
    default_pair: Option<CertificatePair>,
    entries: Vec<CertStoreBuilderEntry>,
}

impl CertStoreBuilder {
    pub fn set_default_pair(&mut self, pair: CertificatePair) -> anyhow::Result<()> {
        pair.check()?;
        self.default_pair = Some(pair);
        Ok(())
    }

    pub fn add_ip_context(&mut self, ip: IpAddr, pair: CertificatePair) -> anyhow::Result<()> {
        pair.check()?;
        self.entries.push(CertStoreBuilderEntry {
            ip,
            pair: Some(pair),
            tunnel: false,
        });
        Ok(())
    }

    /// Mark an address as a tunnel destination: a transparent
    /// connection accepted there is promoted to a blind tunnel before
    /// any byte is consumed.
    pub fn add_tunnel_ip(&mut self, ip: IpAddr) {
        self.entries.push(CertStoreBuilderEntry {
            ip,
            pair: None,
            tunnel: true,
        });
    }

    pub fn build(&self) -> anyhow::Result<CertStore> {
        let default_pair = self
            .default_pair
            .as_ref()
            .ok_or_else(|| anyhow!("no default cert pair set"))?;
        let default_context =
            build_server_context(default_pair).context("failed to build default server context")?;

        let mut by_ip = HashMap::new();
        for e in &self.entries {
            let context = match &e.pair {
                Some(pair) => build_server_context(pair)
                    .context(format!("failed to build server context for {}", e.ip))?,
                None => default_context.clone(),
            };
            by_ip.insert(
                e.ip,
                CertStoreEntry {
                    context,
                    tunnel: e.tunnel,
                },
            );
        }

        let client_context = build_client_context().context("failed to build client context")?;

        Ok(CertStore {
            by_ip,
            default_context,
            client_context,
        })
    }
}

fn build_server_context(pair: &CertificatePair) -> anyhow::Result<SslContext> {
    let mut builder = SslAcceptor::mozilla_intermediate_v5(SslMethod::tls_server())
        .map_err(|e| anyhow!("failed to get ssl acceptor builder: {e}"))?;

    pair.add_to_ssl_context(&mut builder)?;
    builder.set_verify(SslVerifyMode::NONE);

    set_client_hello_callback(&mut builder);
    set_alpn_select_callback(&mut builder);

    Ok(builder.build().into_context())
}

fn build_client_context() -> anyhow::Result<SslContext> {
    let mut builder = SslConnector::builder(SslMethod::tls_client())
        .map_err(|e| anyhow!("failed to get ssl connector builder: {e}"))?;
    // certificate validation policy is owned by upper layers
    builder.set_verify(SslVerifyMode::NONE);
    Ok(builder.build().into_context())
}

/// Runs for every server-side client hello. Resolves the connection
/// behind the session, parses the SNI extension, and hands control to
/// the SNI hook walk; a withheld re-enable or a tunnel verdict turns
/// into a library-level accept suspension.
fn set_client_hello_callback(builder: &mut SslAcceptorBuilder) {
    use openssl::ssl::{ClientHelloError, SslAlert};

    builder.set_client_hello_callback(move |ssl, alert| {
        let Some(vc) = registry::resolve(ssl) else {
            // connection already torn down, nothing to decide
            return Ok(());
        };

        if vc.handshake_done() {
            // a second hello on an established session is a
            // renegotiation attempt, which we refuse
            vc.mark_renegotiation_abort();
            return Err(ClientHelloError::ERROR);
        }

        if let Some(sni_ext) = ssl.client_hello_ext(TlsExtType::SERVER_NAME) {
            match ServerName::from_extension_value(sni_ext) {
                Ok(name) => vc.set_sni_name(name),
                Err(e) => {
                    debug!("invalid sni extension: {e}");
                    *alert = SslAlert::DECODE_ERROR;
                    return Err(ClientHelloError::ERROR);
                }
            }
        }

        match vc.on_client_hello(ssl) {
            SniDisposition::Continue => Ok(()),
            SniDisposition::Suspend => Err(ClientHelloError::RETRY),
        }
    });
}

/// Server-preference ALPN selection against the per-connection set.
fn set_alpn_select_callback(builder: &mut SslAcceptorBuilder) {
    builder.set_alpn_select_callback(move |ssl, client_protos| {
        let Some(vc) = registry::resolve(ssl) else {
            return Err(AlpnError::NOACK);
        };
        match vc.alpn_select(client_protos) {
            Some(proto) => {
                debug!(
                    "selected alpn protocol {}",
                    String::from_utf8_lossy(proto)
                );
                Ok(proto)
            }
            None => {
                if vc.has_alpn_set() {
                    warn!("no alpn protocol overlap with client offer");
                }
                Err(AlpnError::NOACK)
            }
        }
    });
}
