/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2025 ByteDance and/or its affiliates.
 */

use std::io::{self, IoSlice, IoSliceMut, Read, Write};
use std::mem;
use std::net::IpAddr;
use std::os::fd::RawFd;

use e2_io_chain::ChainBuffer;

/// iovec count per scatter call; 1003.1g guarantees at least 16.
pub const NET_MAX_IOV: usize = 16;

/// A non-blocking socket viewed through its raw fd. No buffering, no
/// ownership: the fd's lifetime is managed by the connection that
/// created this handle.
#[derive(Clone, Copy, Debug)]
pub struct RawSock {
    fd: RawFd,
}

impl RawSock {
    pub fn new(fd: RawFd) -> Self {
        RawSock { fd }
    }

    #[inline]
    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        let r = unsafe { libc::read(self.fd, buf.as_mut_ptr() as _, buf.len()) };
        if r < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(r as usize)
        }
    }

    pub fn readv(&self, bufs: &mut [IoSliceMut<'_>]) -> io::Result<usize> {
        let r = unsafe { libc::readv(self.fd, bufs.as_ptr() as _, bufs.len() as _) };
        if r < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(r as usize)
        }
    }

    pub fn write(&self, buf: &[u8]) -> io::Result<usize> {
        let r = unsafe { libc::write(self.fd, buf.as_ptr() as _, buf.len()) };
        if r < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(r as usize)
        }
    }

    pub fn writev(&self, bufs: &[IoSlice<'_>]) -> io::Result<usize> {
        let r = unsafe { libc::writev(self.fd, bufs.as_ptr() as _, bufs.len() as _) };
        if r < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(r as usize)
        }
    }

    /// The bound local address, for certificate lookup by listening IP.
    /// `None` for address families without one (unix sockets).
    pub fn local_ip(&self) -> Option<IpAddr> {
        let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
        let mut len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
        let r = unsafe {
            libc::getsockname(
                self.fd,
                &mut storage as *mut libc::sockaddr_storage as *mut libc::sockaddr,
                &mut len,
            )
        };
        if r != 0 {
            return None;
        }
        match storage.ss_family as libc::c_int {
            libc::AF_INET => {
                let sin = unsafe { &*(&storage as *const _ as *const libc::sockaddr_in) };
                Some(IpAddr::from(u32::from_be(sin.sin_addr.s_addr).to_be_bytes()))
            }
            libc::AF_INET6 => {
                let sin6 = unsafe { &*(&storage as *const _ as *const libc::sockaddr_in6) };
                Some(IpAddr::from(sin6.sin6_addr.s6_addr))
            }
            _ => None,
        }
    }
}

impl Read for RawSock {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        RawSock::read(self, buf)
    }
}

impl Write for RawSock {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        RawSock::write(self, buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

pub fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    let r = unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) };
    if r < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

/// What one scatter-read syscall produced.
#[derive(Debug)]
pub enum RawStep {
    Bytes { filled: usize, attempted: usize },
    WouldBlock,
    Eof,
    Err(io::Error),
}

/// Net outcome of a scatter-read drive.
#[derive(Debug)]
pub enum RawRead {
    Bytes(usize),
    WouldBlock,
    Eof,
    Err(io::Error),
}

/// One `readv` per step into the chain's unfilled tail, bounded by
/// [`NET_MAX_IOV`] vectors and the byte budget.
pub struct ScatterReads<'a> {
    sock: RawSock,
    chain: &'a mut ChainBuffer,
    toread: usize,
    total: usize,
}

impl<'a> ScatterReads<'a> {
    pub fn new(sock: RawSock, chain: &'a mut ChainBuffer, toread: usize) -> Self {
        ScatterReads {
            sock,
            chain,
            toread,
            total: 0,
        }
    }

    #[inline]
    pub fn total(&self) -> usize {
        self.total
    }
}

impl Iterator for ScatterReads<'_> {
    type Item = RawStep;

    fn next(&mut self) -> Option<RawStep> {
        let togo = self.toread - self.total;
        if togo == 0 {
            return None;
        }
        if self.chain.write_avail() == 0 {
            self.chain.grow(1);
        }

        let mut attempted = 0;
        let mut iov = Vec::with_capacity(NET_MAX_IOV);
        for s in self.chain.write_slices(NET_MAX_IOV) {
            let take = s.len().min(togo - attempted);
            if take == 0 {
                break;
            }
            attempted += take;
            iov.push(IoSliceMut::new(&mut s[..take]));
        }

        match self.sock.readv(&mut iov) {
            Ok(0) => Some(RawStep::Eof),
            Ok(n) => {
                self.chain.fill(n);
                self.total += n;
                Some(RawStep::Bytes {
                    filled: n,
                    attempted,
                })
            }
            Err(e) => match e.raw_os_error() {
                Some(libc::EAGAIN) | Some(libc::ENOTCONN) => Some(RawStep::WouldBlock),
                Some(libc::ECONNRESET) => Some(RawStep::Eof),
                _ => Some(RawStep::Err(e)),
            },
        }
    }
}

/// Drive scatter reads until the socket drains, closes, errors, or the
/// budget is reached. Bytes banked before a would-block are reported as
/// progress, not as an error.
pub fn read_into_chain(sock: RawSock, chain: &mut ChainBuffer, toread: usize) -> RawRead {
    let mut reads = ScatterReads::new(sock, chain, toread);
    let mut terminal = RawRead::WouldBlock;
    for step in &mut reads {
        match step {
            RawStep::Bytes { filled, attempted } => {
                if filled < attempted {
                    // short read: the socket has no more for now
                    terminal = RawRead::WouldBlock;
                    break;
                }
            }
            RawStep::WouldBlock => {
                terminal = RawRead::WouldBlock;
                break;
            }
            RawStep::Eof => {
                terminal = RawRead::Eof;
                break;
            }
            RawStep::Err(e) => {
                terminal = RawRead::Err(e);
                break;
            }
        }
    }
    let total = reads.total();
    if total > 0 {
        RawRead::Bytes(total)
    } else {
        terminal
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::fd::AsRawFd;
    use std::os::unix::net::UnixStream;

    fn pair() -> (UnixStream, UnixStream) {
        let (a, b) = UnixStream::pair().unwrap();
        a.set_nonblocking(true).unwrap();
        b.set_nonblocking(true).unwrap();
        (a, b)
    }

    #[test]
    fn scatter_read_drains_socket() {
        let (a, b) = pair();
        use std::io::Write as _;
        (&a).write_all(b"0123456789").unwrap();

        let sock = RawSock::new(b.as_raw_fd());
        let mut chain = ChainBuffer::new(4);
        match read_into_chain(sock, &mut chain, usize::MAX) {
            RawRead::Bytes(10) => {}
            other => panic!("unexpected: {other:?}"),
        }
        let mut got = Vec::new();
        chain.copy_unread(&mut got);
        assert_eq!(got, b"0123456789");

        // drained now
        match read_into_chain(sock, &mut chain, usize::MAX) {
            RawRead::WouldBlock => {}
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn eof_after_peer_close() {
        let (a, b) = pair();
        drop(a);
        let sock = RawSock::new(b.as_raw_fd());
        let mut chain = ChainBuffer::new(16);
        match read_into_chain(sock, &mut chain, usize::MAX) {
            RawRead::Eof => {}
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn budget_respected() {
        let (a, b) = pair();
        use std::io::Write as _;
        (&a).write_all(&[7u8; 64]).unwrap();

        let sock = RawSock::new(b.as_raw_fd());
        let mut chain = ChainBuffer::new(8);
        match read_into_chain(sock, &mut chain, 20) {
            RawRead::Bytes(20) => {}
            other => panic!("unexpected: {other:?}"),
        }
        assert_eq!(chain.read_avail(), 20);
    }
}
