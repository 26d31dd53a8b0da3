/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2025 ByteDance and/or its affiliates.
 */

use std::path::PathBuf;
use std::time::Duration;

use log::{debug, warn};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;

use super::protocol::{
    encode_request, parse_response, MgmtError, MgmtField, MgmtOp, ProxyState, RecordValue,
    MAX_FRAME_SIZE,
};

/// How many connect attempts one RPC may burn before giving up.
pub const MAX_CONN_TRIES: usize = 8;

const RECONNECT_DELAY: Duration = Duration::from_millis(100);

/// A remote management client: marshals one request frame per call to
/// the control daemon over its local socket and parses the reply.
///
/// The daemon may restart at any time, so every call runs a bounded
/// reconnect loop; only transport failures are retried, a daemon-level
/// error code comes back as-is.
pub struct MgmtClient {
    socket_path: PathBuf,
    stream: Option<UnixStream>,
}

impl MgmtClient {
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        MgmtClient {
            socket_path: socket_path.into(),
            stream: None,
        }
    }

    pub async fn proxy_state_get(&mut self) -> Result<ProxyState, MgmtError> {
        let payload = self.call(MgmtOp::ProxyStateGet, &[]).await?;
        let mut r = parse_response(&payload, MgmtOp::ProxyStateGet)?;
        let state = r.get_int()?;
        r.finish()?;
        Ok(ProxyState::from(state))
    }

    pub async fn proxy_state_set(&mut self, state: ProxyState) -> Result<(), MgmtError> {
        let payload = self
            .call(MgmtOp::ProxyStateSet, &[MgmtField::Int(i64::from(state))])
            .await?;
        parse_response(&payload, MgmtOp::ProxyStateSet)?.finish()
    }

    pub async fn reconfigure(&mut self) -> Result<(), MgmtError> {
        let payload = self.call(MgmtOp::Reconfigure, &[]).await?;
        parse_response(&payload, MgmtOp::Reconfigure)?.finish()
    }

    pub async fn restart(&mut self) -> Result<(), MgmtError> {
        let payload = self.call(MgmtOp::Restart, &[]).await?;
        parse_response(&payload, MgmtOp::Restart)?.finish()
    }

    /// Values come back typed: an int marker selects the decoding, the
    /// daemon normalizes everything else to a string.
    pub async fn record_get(&mut self, name: &str) -> Result<RecordValue, MgmtError> {
        let payload = self
            .call(MgmtOp::RecordGet, &[MgmtField::Str(name)])
            .await?;
        let mut r = parse_response(&payload, MgmtOp::RecordGet)?;
        let kind = r.get_int()?;
        let value = if kind == 0 {
            RecordValue::Int(r.get_int()?)
        } else {
            RecordValue::Str(r.get_str()?.to_string())
        };
        r.finish()?;
        Ok(value)
    }

    /// Set a record by name; returns the daemon's action-need marker
    /// (whether a reread or restart must follow).
    pub async fn record_set(&mut self, name: &str, value: &str) -> Result<i64, MgmtError> {
        let payload = self
            .call(
                MgmtOp::RecordSet,
                &[MgmtField::Str(name), MgmtField::Str(value)],
            )
            .await?;
        let mut r = parse_response(&payload, MgmtOp::RecordSet)?;
        let action = r.get_int()?;
        r.finish()?;
        Ok(action)
    }

    pub async fn event_resolve(&mut self, name: &str) -> Result<(), MgmtError> {
        let payload = self
            .call(MgmtOp::EventResolve, &[MgmtField::Str(name)])
            .await?;
        parse_response(&payload, MgmtOp::EventResolve)?.finish()
    }

    /// One request/response exchange with reconnects on transport
    /// failure, bounded by [`MAX_CONN_TRIES`].
    async fn call(
        &mut self,
        op: MgmtOp,
        fields: &[MgmtField<'_>],
    ) -> Result<Vec<u8>, MgmtError> {
        let request = encode_request(op, fields);

        let mut tries = 0;
        loop {
            if tries >= MAX_CONN_TRIES {
                return Err(MgmtError::ConnectFailed(tries));
            }
            if tries > 0 {
                tokio::time::sleep(RECONNECT_DELAY).await;
            }
            tries += 1;

            if self.stream.is_none() {
                match UnixStream::connect(&self.socket_path).await {
                    Ok(s) => self.stream = Some(s),
                    Err(e) => {
                        debug!(
                            "failed to connect to {}: {e}",
                            self.socket_path.display()
                        );
                        continue;
                    }
                }
            }

            match self.exchange(&request).await {
                Ok(payload) => return Ok(payload),
                Err(e) => {
                    warn!("management rpc transport failure for {op:?}: {e}");
                    self.stream = None;
                }
            }
        }
    }

    async fn exchange(&mut self, request: &[u8]) -> Result<Vec<u8>, std::io::Error> {
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| std::io::Error::from(std::io::ErrorKind::NotConnected))?;

        stream.write_u32_le(request.len() as u32).await?;
        stream.write_all(request).await?;
        stream.flush().await?;

        let len = stream.read_u32_le().await? as usize;
        if len > MAX_FRAME_SIZE {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("oversized reply frame: {len}"),
            ));
        }
        let mut payload = vec![0u8; len];
        stream.read_exact(&mut payload).await?;
        Ok(payload)
    }
}
