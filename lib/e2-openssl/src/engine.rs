/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2025 ByteDance and/or its affiliates.
 */

use std::io::{Read, Write};

use openssl::error::ErrorStack;
use openssl::ssl::{self, Ssl, SslContextRef, SslRef};
use openssl::x509::X509;

use super::{EngineIo, SslStatus};

/// One TLS session driven over a caller-supplied transport.
///
/// All library outcomes are reported through the closed [`SslStatus`]
/// set; the caller decides how to treat each back-signal.
pub struct SslEngine<S> {
    stream: ssl::SslStream<EngineIo<S>>,
}

impl<S: Read + Write> SslEngine<S> {
    pub fn new(ssl: Ssl, sock: S) -> Result<Self, ErrorStack> {
        ssl::SslStream::new(ssl, EngineIo::new(sock)).map(|stream| SslEngine { stream })
    }

    pub fn with_context(ctx: &SslContextRef, sock: S) -> Result<Self, ErrorStack> {
        let ssl = Ssl::new(ctx)?;
        Self::new(ssl, sock)
    }

    pub fn accept(&mut self) -> Result<(), SslStatus> {
        self.stream.accept().map_err(Into::into)
    }

    pub fn connect(&mut self) -> Result<(), SslStatus> {
        self.stream.connect().map_err(Into::into)
    }

    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize, SslStatus> {
        self.stream.ssl_read(buf).map_err(Into::into)
    }

    pub fn write(&mut self, buf: &[u8]) -> Result<usize, SslStatus> {
        self.stream.ssl_write(buf).map_err(Into::into)
    }

    #[inline]
    pub fn ssl(&self) -> &SslRef {
        self.stream.ssl()
    }

    #[inline]
    pub fn ssl_mut(&mut self) -> &mut SslRef {
        self.stream.ssl_mut()
    }

    /// Feed a copy of `data` as the read side; the socket is untouched.
    /// The library sees "no more yet", not "closed", once it drains.
    pub fn set_read_memory(&mut self, data: &[u8]) {
        self.stream.get_mut().set_memory(data);
    }

    /// Rebind the read side straight to the transport.
    pub fn attach_read_socket(&mut self) {
        self.stream.get_mut().attach_socket();
    }

    /// Bytes fed through [`set_read_memory`](Self::set_read_memory) the
    /// library has not pulled yet.
    pub fn input_pending(&self) -> usize {
        self.stream.get_ref().pending()
    }

    /// Bytes the library pulled from the memory input since the last
    /// call; used by the caller to reconcile its own feed cursor.
    pub fn take_consumed(&mut self) -> usize {
        self.stream.get_mut().take_consumed()
    }

    /// Rebind the certificate context of the live session.
    pub fn set_context(&mut self, ctx: &SslContextRef) -> Result<(), ErrorStack> {
        self.stream.ssl_mut().set_ssl_context(ctx).map(|_| ())
    }

    pub fn set_sni_hostname(&mut self, name: &str) -> Result<(), ErrorStack> {
        self.stream.ssl_mut().set_hostname(name)
    }

    pub fn selected_alpn(&self) -> Option<&[u8]> {
        self.stream.ssl().selected_alpn_protocol()
    }

    pub fn peer_certificate(&self) -> Option<X509> {
        self.stream.ssl().peer_certificate()
    }
}
