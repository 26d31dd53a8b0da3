/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2025 ByteDance and/or its affiliates.
 */

use std::ffi::c_int;
use std::{fmt, io};

use openssl::ssl::{self, ErrorCode};

const RAW_ERROR_WANT_CONNECT: c_int = 7;
const RAW_ERROR_WANT_ACCEPT: c_int = 8;
const RAW_ERROR_WANT_X509_LOOKUP: c_int = 4;

/// The closed set of non-success outcomes a driven session can report.
///
/// Every error code the library can raise maps onto one of these; the
/// `Want*` variants are back-signals, not failures.
#[derive(Debug)]
pub enum SslStatus {
    WantRead,
    WantWrite,
    WantAccept,
    WantConnect,
    WantX509Lookup,
    /// The client-hello callback asked the library to suspend the
    /// accept; it will be re-invoked on the next drive.
    WantSniResolve,
    /// Clean close-notify from the peer.
    ZeroReturn,
    /// Transport failure. `None` means EOF was observed where the
    /// protocol expected more data.
    Syscall(Option<io::Error>),
    /// Fatal protocol or library error.
    Ssl(String),
}

impl SslStatus {
    /// True for the flow-control variants that only ask the caller to
    /// rearm I/O interest.
    pub fn is_want(&self) -> bool {
        matches!(
            self,
            SslStatus::WantRead
                | SslStatus::WantWrite
                | SslStatus::WantAccept
                | SslStatus::WantConnect
                | SslStatus::WantX509Lookup
                | SslStatus::WantSniResolve
        )
    }

    /// The raw OS error for transport failures, if one was captured.
    pub fn raw_errno(&self) -> Option<i32> {
        match self {
            SslStatus::Syscall(Some(e)) => e.raw_os_error(),
            _ => None,
        }
    }
}

impl fmt::Display for SslStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SslStatus::WantRead => f.write_str("want read"),
            SslStatus::WantWrite => f.write_str("want write"),
            SslStatus::WantAccept => f.write_str("want accept"),
            SslStatus::WantConnect => f.write_str("want connect"),
            SslStatus::WantX509Lookup => f.write_str("want x509 lookup"),
            SslStatus::WantSniResolve => f.write_str("want sni resolve"),
            SslStatus::ZeroReturn => f.write_str("zero return"),
            SslStatus::Syscall(Some(e)) => write!(f, "syscall error: {e}"),
            SslStatus::Syscall(None) => f.write_str("unexpected eof"),
            SslStatus::Ssl(msg) => write!(f, "ssl error: {msg}"),
        }
    }
}

impl From<ssl::Error> for SslStatus {
    fn from(e: ssl::Error) -> Self {
        match e.code() {
            ErrorCode::WANT_READ => SslStatus::WantRead,
            ErrorCode::WANT_WRITE => SslStatus::WantWrite,
            ErrorCode::WANT_CLIENT_HELLO_CB => SslStatus::WantSniResolve,
            ErrorCode::ZERO_RETURN => SslStatus::ZeroReturn,
            ErrorCode::SYSCALL => SslStatus::Syscall(e.into_io_error().ok()),
            code if code == ErrorCode::from_raw(RAW_ERROR_WANT_CONNECT) => SslStatus::WantConnect,
            code if code == ErrorCode::from_raw(RAW_ERROR_WANT_ACCEPT) => SslStatus::WantAccept,
            code if code == ErrorCode::from_raw(RAW_ERROR_WANT_X509_LOOKUP) => {
                SslStatus::WantX509Lookup
            }
            _ => match e.ssl_error() {
                Some(stack) => SslStatus::Ssl(stack.to_string()),
                None => SslStatus::Ssl(format!("{e}")),
            },
        }
    }
}
