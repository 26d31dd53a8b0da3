/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2025 ByteDance and/or its affiliates.
 */

use std::io::{self, Read, Write};

/// The byte transport handed to the TLS library.
///
/// The write side always reaches the socket. The read side can be
/// rebound between the socket and a memory input without touching the
/// library's BIO internals; that makes "replace only the read side" a
/// supported operation on this adapter.
pub(crate) struct EngineIo<S> {
    sock: S,
    input: ReadInput,
}

enum ReadInput {
    Socket,
    Memory(MemInput),
}

/// Memory-backed read input with EOF-quiet semantics: exhaustion reads
/// as `WouldBlock`, never as a closed stream.
struct MemInput {
    data: Vec<u8>,
    pos: usize,
    taken: usize,
}

impl<S> EngineIo<S> {
    pub(crate) fn new(sock: S) -> Self {
        EngineIo {
            sock,
            input: ReadInput::Socket,
        }
    }

    pub(crate) fn set_memory(&mut self, data: &[u8]) {
        self.input = ReadInput::Memory(MemInput {
            data: data.to_vec(),
            pos: 0,
            taken: 0,
        });
    }

    pub(crate) fn attach_socket(&mut self) {
        self.input = ReadInput::Socket;
    }

    pub(crate) fn pending(&self) -> usize {
        match &self.input {
            ReadInput::Socket => 0,
            ReadInput::Memory(m) => m.data.len() - m.pos,
        }
    }

    pub(crate) fn take_consumed(&mut self) -> usize {
        match &mut self.input {
            ReadInput::Socket => 0,
            ReadInput::Memory(m) => {
                let n = m.pos - m.taken;
                m.taken = m.pos;
                n
            }
        }
    }
}

impl<S: Read> Read for EngineIo<S> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match &mut self.input {
            ReadInput::Socket => self.sock.read(buf),
            ReadInput::Memory(m) => {
                let avail = &m.data[m.pos..];
                if avail.is_empty() {
                    return Err(io::Error::from(io::ErrorKind::WouldBlock));
                }
                let n = avail.len().min(buf.len());
                buf[..n].copy_from_slice(&avail[..n]);
                m.pos += n;
                Ok(n)
            }
        }
    }
}

impl<S: Write> Write for EngineIo<S> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.sock.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.sock.flush()
    }
}
