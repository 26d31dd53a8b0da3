/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2025 ByteDance and/or its affiliates.
 */

use std::io;

use bytes::{Buf, BufMut};
use thiserror::Error;

/// Frames larger than this are refused on both sides.
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum MgmtError {
    #[error("io error: {0:?}")]
    Io(#[from] io::Error),
    #[error("frame too large: {0}")]
    FrameTooLarge(usize),
    #[error("truncated message")]
    Truncated,
    #[error("trailing bytes after message")]
    TrailingBytes,
    #[error("unknown op code {0}")]
    UnknownOp(u16),
    #[error("response for op {got:?}, expected {expected:?}")]
    OpMismatch { expected: MgmtOp, got: MgmtOp },
    #[error("invalid utf-8 in string field")]
    InvalidString,
    #[error("daemon error code {0}")]
    Daemon(i32),
    #[error("failed to connect to control daemon after {0} tries")]
    ConnectFailed(usize),
}

/// Management operations, mirrored by the control daemon.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u16)]
pub enum MgmtOp {
    ProxyStateGet = 1,
    ProxyStateSet = 2,
    Reconfigure = 3,
    Restart = 4,
    RecordGet = 5,
    RecordSet = 6,
    EventResolve = 7,
}

impl MgmtOp {
    pub fn from_u16(v: u16) -> Result<Self, MgmtError> {
        match v {
            1 => Ok(MgmtOp::ProxyStateGet),
            2 => Ok(MgmtOp::ProxyStateSet),
            3 => Ok(MgmtOp::Reconfigure),
            4 => Ok(MgmtOp::Restart),
            5 => Ok(MgmtOp::RecordGet),
            6 => Ok(MgmtOp::RecordSet),
            7 => Ok(MgmtOp::EventResolve),
            other => Err(MgmtError::UnknownOp(other)),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProxyState {
    Undefined,
    Off,
    On,
}

impl From<i64> for ProxyState {
    fn from(v: i64) -> Self {
        match v {
            1 => ProxyState::Off,
            2 => ProxyState::On,
            _ => ProxyState::Undefined,
        }
    }
}

impl From<ProxyState> for i64 {
    fn from(v: ProxyState) -> i64 {
        match v {
            ProxyState::Undefined => 0,
            ProxyState::Off => 1,
            ProxyState::On => 2,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RecordValue {
    Int(i64),
    Str(String),
}

/// One marshalled request field. The daemon knows the field sequence
/// for each op; there are no tags on the wire.
pub enum MgmtField<'a> {
    Int(i64),
    Str(&'a str),
    Data(&'a [u8]),
}

/// Marshal a request payload: op code then the fields in order.
pub fn encode_request(op: MgmtOp, fields: &[MgmtField<'_>]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(16);
    buf.put_u16_le(op as u16);
    for f in fields {
        match f {
            MgmtField::Int(v) => buf.put_i64_le(*v),
            MgmtField::Str(s) => {
                buf.put_u32_le(s.len() as u32);
                buf.put_slice(s.as_bytes());
            }
            MgmtField::Data(d) => {
                buf.put_u32_le(d.len() as u32);
                buf.put_slice(d);
            }
        }
    }
    buf
}

/// Strict reader over a response's output fields.
pub struct FieldReader<'a> {
    buf: &'a [u8],
}

impl<'a> FieldReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        FieldReader { buf }
    }

    pub fn get_int(&mut self) -> Result<i64, MgmtError> {
        if self.buf.remaining() < 8 {
            return Err(MgmtError::Truncated);
        }
        Ok(self.buf.get_i64_le())
    }

    pub fn get_data(&mut self) -> Result<&'a [u8], MgmtError> {
        if self.buf.remaining() < 4 {
            return Err(MgmtError::Truncated);
        }
        let len = self.buf.get_u32_le() as usize;
        if self.buf.remaining() < len {
            return Err(MgmtError::Truncated);
        }
        let (head, tail) = self.buf.split_at(len);
        self.buf = tail;
        Ok(head)
    }

    pub fn get_str(&mut self) -> Result<&'a str, MgmtError> {
        let data = self.get_data()?;
        std::str::from_utf8(data).map_err(|_| MgmtError::InvalidString)
    }

    /// Every response must be consumed exactly.
    pub fn finish(self) -> Result<(), MgmtError> {
        if self.buf.is_empty() {
            Ok(())
        } else {
            Err(MgmtError::TrailingBytes)
        }
    }
}

/// Unmarshal a response payload: op echo, daemon error code, then the
/// op-specific outputs handed back for the caller to read.
pub fn parse_response(payload: &[u8], expected: MgmtOp) -> Result<FieldReader<'_>, MgmtError> {
    let mut buf = payload;
    if buf.remaining() < 2 {
        return Err(MgmtError::Truncated);
    }
    let got = MgmtOp::from_u16(buf.get_u16_le())?;
    if got != expected {
        return Err(MgmtError::OpMismatch { expected, got });
    }
    if buf.remaining() < 4 {
        return Err(MgmtError::Truncated);
    }
    let err = buf.get_i32_le();
    if err != 0 {
        return Err(MgmtError::Daemon(err));
    }
    Ok(FieldReader::new(buf))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode_response(op: MgmtOp, err: i32, fields: &[MgmtField<'_>]) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.put_u16_le(op as u16);
        buf.put_i32_le(err);
        for f in fields {
            match f {
                MgmtField::Int(v) => buf.put_i64_le(*v),
                MgmtField::Str(s) => {
                    buf.put_u32_le(s.len() as u32);
                    buf.put_slice(s.as_bytes());
                }
                MgmtField::Data(d) => {
                    buf.put_u32_le(d.len() as u32);
                    buf.put_slice(d);
                }
            }
        }
        buf
    }

    #[test]
    fn request_layout() {
        let buf = encode_request(
            MgmtOp::RecordSet,
            &[
                MgmtField::Str("proxy.config.threads"),
                MgmtField::Str("8"),
            ],
        );
        assert_eq!(&buf[0..2], &6u16.to_le_bytes());
        assert_eq!(&buf[2..6], &20u32.to_le_bytes());
        assert_eq!(&buf[6..26], b"proxy.config.threads");
        assert_eq!(&buf[26..30], &1u32.to_le_bytes());
        assert_eq!(&buf[30..], b"8");
    }

    #[test]
    fn response_roundtrip() {
        let payload = encode_response(
            MgmtOp::RecordGet,
            0,
            &[MgmtField::Int(2), MgmtField::Str("value")],
        );
        let mut r = parse_response(&payload, MgmtOp::RecordGet).unwrap();
        assert_eq!(r.get_int().unwrap(), 2);
        assert_eq!(r.get_str().unwrap(), "value");
        r.finish().unwrap();
    }

    #[test]
    fn daemon_error_short_circuits() {
        let payload = encode_response(MgmtOp::Reconfigure, 13, &[]);
        match parse_response(&payload, MgmtOp::Reconfigure) {
            Err(MgmtError::Daemon(13)) => {}
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn op_mismatch_detected() {
        let payload = encode_response(MgmtOp::Restart, 0, &[]);
        match parse_response(&payload, MgmtOp::Reconfigure) {
            Err(MgmtError::OpMismatch { .. }) => {}
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn truncated_field_detected() {
        let mut payload = encode_response(MgmtOp::RecordGet, 0, &[MgmtField::Str("value")]);
        payload.truncate(payload.len() - 2);
        let mut r = parse_response(&payload, MgmtOp::RecordGet).unwrap();
        match r.get_str() {
            Err(MgmtError::Truncated) => {}
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn trailing_bytes_detected() {
        let mut payload = encode_response(MgmtOp::Reconfigure, 0, &[]);
        payload.push(0xff);
        let r = parse_response(&payload, MgmtOp::Reconfigure).unwrap();
        match r.finish() {
            Err(MgmtError::TrailingBytes) => {}
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn unknown_op_refused() {
        let mut payload = Vec::new();
        payload.put_u16_le(999);
        payload.put_i32_le(0);
        match parse_response(&payload, MgmtOp::Reconfigure) {
            Err(MgmtError::UnknownOp(999)) => {}
            other => panic!("unexpected: {other:?}"),
        }
    }
}
