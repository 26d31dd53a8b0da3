/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2025 ByteDance and/or its affiliates.
 */

use std::sync::Arc;
use std::{fmt, str};

use thiserror::Error;

// RFC 6066: NameType host_name(0), host names are at most 255 octets
const NAME_TYPE_HOST: u8 = 0x00;
const MAX_HOST_NAME_LEN: usize = 255;

#[derive(Debug, Error)]
pub enum ServerNameError {
    #[error("truncated server name list")]
    Truncated,
    #[error("server name list length {0} does not match the extension")]
    ListLengthMismatch(usize),
    #[error("trailing bytes after server name entry")]
    TrailingBytes,
    #[error("unsupported name type {0}")]
    UnsupportedNameType(u8),
    #[error("bad host name length {0}")]
    BadNameLength(usize),
    #[error("host name is not valid utf-8")]
    NotUtf8,
}

/// Strict cursor over the raw extension value; every field must be
/// consumed exactly.
struct ExtReader<'a> {
    buf: &'a [u8],
}

impl<'a> ExtReader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        ExtReader { buf }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], ServerNameError> {
        if self.buf.len() < n {
            return Err(ServerNameError::Truncated);
        }
        let (head, tail) = self.buf.split_at(n);
        self.buf = tail;
        Ok(head)
    }

    fn take_u8(&mut self) -> Result<u8, ServerNameError> {
        Ok(self.take(1)?[0])
    }

    fn take_u16(&mut self) -> Result<usize, ServerNameError> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]) as usize)
    }

    fn finish(self) -> Result<(), ServerNameError> {
        if self.buf.is_empty() {
            Ok(())
        } else {
            Err(ServerNameError::TrailingBytes)
        }
    }
}

/// The host name carried in a client hello's server_name extension.
#[derive(Clone)]
pub struct ServerName {
    host_name: Arc<str>,
}

impl ServerName {
    /// Parse the raw extension value. Clients send a one-entry server
    /// name list holding a single host_name; anything else is refused.
    pub fn from_extension_value(value: &[u8]) -> Result<ServerName, ServerNameError> {
        let mut r = ExtReader::new(value);

        let list_len = r.take_u16()?;
        if list_len != value.len() - 2 {
            return Err(ServerNameError::ListLengthMismatch(list_len));
        }

        let name_type = r.take_u8()?;
        if name_type != NAME_TYPE_HOST {
            return Err(ServerNameError::UnsupportedNameType(name_type));
        }

        let name_len = r.take_u16()?;
        if name_len == 0 || name_len > MAX_HOST_NAME_LEN {
            return Err(ServerNameError::BadNameLength(name_len));
        }

        let name = r.take(name_len)?;
        r.finish()?;

        let host_name = str::from_utf8(name).map_err(|_| ServerNameError::NotUtf8)?;
        Ok(ServerName {
            host_name: Arc::from(host_name),
        })
    }
}

impl AsRef<str> for ServerName {
    fn as_ref(&self) -> &str {
        self.host_name.as_ref()
    }
}

impl fmt::Display for ServerName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.host_name)
    }
}
