//! Raw file-descriptor operations, uniform across the supported
//! transports.
//!
//! A [`NetFd`] owns the descriptor; reader/writer loops work on a copied
//! raw fd so a cancel hook can close the owned side from another thread
//! and leave the loop to die on `EBADF`/`EINTR`.

use std::io;
use std::mem;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, TcpListener, TcpStream, ToSocketAddrs, UdpSocket};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::net::{UnixListener, UnixStream};

use tracing::debug;

use crate::error::{NetError, Result};
use crate::netparms::NetParms;
use crate::protocol::{DestSpec, Protocol};
use crate::wire::{decode_seqnr, encode_seqnr, SEQNR_SIZE};

/// An open transport endpoint: owned descriptor plus the protocol it
/// speaks.
#[derive(Debug)]
pub struct NetFd {
    fd: Option<OwnedFd>,
    pub proto: Protocol,
}

impl NetFd {
    pub fn from_owned(fd: OwnedFd, proto: Protocol) -> Self {
        NetFd {
            fd: Some(fd),
            proto,
        }
    }

    /// The raw descriptor, for handing to a blocking loop. `None` once
    /// closed.
    pub fn raw(&self) -> Option<RawFd> {
        self.fd.as_ref().map(|f| f.as_raw_fd())
    }

    pub fn is_open(&self) -> bool {
        self.fd.is_some()
    }

    /// Close the descriptor. Any thread blocked on it wakes with `EBADF`.
    pub fn close(&mut self) {
        if let Some(fd) = self.fd.take() {
            debug!(fd = fd.as_raw_fd(), "closing");
            drop(fd);
        }
    }

    /// Half-close the sending direction of a stream socket.
    pub fn shutdown_wr(&self) {
        if let Some(fd) = self.raw() {
            unsafe {
                libc::shutdown(fd, libc::SHUT_WR);
            }
        }
    }
}

/// Open a client connection per the destination spec. Datagram sockets
/// come back connected so plain `send` works.
pub fn connect(spec: &DestSpec, np: &NetParms) -> Result<NetFd> {
    match spec {
        DestSpec::Net { proto, addr } => match proto {
            Protocol::Tcp | Protocol::Itcp => {
                let stream = TcpStream::connect(addr.as_str())?;
                stream.set_nodelay(true).ok();
                let fd: OwnedFd = stream.into();
                set_sockbuf(fd.as_raw_fd(), np.sockbuf);
                Ok(NetFd::from_owned(fd, *proto))
            }
            Protocol::Udp | Protocol::Udps | Protocol::Vtp => {
                let sock = UdpSocket::bind(local_any(addr)?)?;
                sock.connect(addr.as_str())?;
                let fd: OwnedFd = sock.into();
                set_sockbuf(fd.as_raw_fd(), np.sockbuf);
                Ok(NetFd::from_owned(fd, *proto))
            }
            Protocol::Unix => Err(NetError::BadDest(addr.clone())),
        },
        DestSpec::UnixSock { path } => {
            let stream = UnixStream::connect(path)?;
            Ok(NetFd::from_owned(stream.into(), Protocol::Unix))
        }
        DestSpec::File { path } => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(path)?;
            Ok(NetFd::from_owned(file.into(), Protocol::Tcp))
        }
    }
}

/// Open the server side: a listening socket for stream protocols, a bound
/// socket for datagram protocols.
pub fn open_server(proto: Protocol, bind: &str, np: &NetParms) -> Result<NetFd> {
    match proto {
        Protocol::Tcp | Protocol::Itcp => {
            let listener = TcpListener::bind(bind)?;
            Ok(NetFd::from_owned(listener.into(), proto))
        }
        Protocol::Udp | Protocol::Udps | Protocol::Vtp => {
            let sock = UdpSocket::bind(bind)?;
            let fd: OwnedFd = sock.into();
            set_sockbuf(fd.as_raw_fd(), np.sockbuf);
            Ok(NetFd::from_owned(fd, proto))
        }
        Protocol::Unix => {
            let _ = std::fs::remove_file(bind);
            let listener = UnixListener::bind(bind)?;
            Ok(NetFd::from_owned(listener.into(), proto))
        }
    }
}

/// Accept one connection on a listening stream socket.
pub fn accept(fd: RawFd) -> io::Result<(OwnedFd, Option<SocketAddr>)> {
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    let rc = unsafe {
        libc::accept(
            fd,
            &mut storage as *mut libc::sockaddr_storage as *mut libc::sockaddr,
            &mut len,
        )
    };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    let owned = unsafe { OwnedFd::from_raw_fd(rc) };
    Ok((owned, storage_to_addr(&storage)))
}

/// Read exactly `buf.len()` bytes unless EOF or an error intervenes;
/// returns the number of bytes actually read.
pub fn read_loop(fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
    let mut done = 0;
    while done < buf.len() {
        let rc = unsafe {
            libc::read(
                fd,
                buf[done..].as_mut_ptr() as *mut libc::c_void,
                buf.len() - done,
            )
        };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        if rc == 0 {
            break;
        }
        done += rc as usize;
    }
    Ok(done)
}

/// Write all of `buf`; returns the number of bytes actually written.
pub fn write_loop(fd: RawFd, buf: &[u8]) -> io::Result<usize> {
    let mut done = 0;
    while done < buf.len() {
        let rc = unsafe {
            libc::write(
                fd,
                buf[done..].as_ptr() as *const libc::c_void,
                buf.len() - done,
            )
        };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        if rc == 0 {
            break;
        }
        done += rc as usize;
    }
    Ok(done)
}

/// Peek the sequence number and source address of the next datagram
/// without consuming it.
pub fn peek_seqnr(fd: RawFd) -> io::Result<(u64, Option<SocketAddr>)> {
    let mut seq = [0u8; SEQNR_SIZE];
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let mut slen = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    let rc = unsafe {
        libc::recvfrom(
            fd,
            seq.as_mut_ptr() as *mut libc::c_void,
            SEQNR_SIZE,
            libc::MSG_PEEK,
            &mut storage as *mut libc::sockaddr_storage as *mut libc::sockaddr,
            &mut slen,
        )
    };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    if rc as usize != SEQNR_SIZE {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            format!("short sequence number peek: {rc} bytes"),
        ));
    }
    Ok((decode_seqnr(&seq), storage_to_addr(&storage)))
}

/// Consume one sequence-numbered datagram, scattering the payload
/// straight into `payload`. Returns the sequence number and payload byte
/// count.
pub fn recv_seq_packet(fd: RawFd, payload: &mut [u8]) -> io::Result<(u64, usize)> {
    let mut seq = [0u8; SEQNR_SIZE];
    let mut iov = [
        libc::iovec {
            iov_base: seq.as_mut_ptr() as *mut libc::c_void,
            iov_len: SEQNR_SIZE,
        },
        libc::iovec {
            iov_base: payload.as_mut_ptr() as *mut libc::c_void,
            iov_len: payload.len(),
        },
    ];
    let mut msg: libc::msghdr = unsafe { mem::zeroed() };
    msg.msg_iov = iov.as_mut_ptr();
    msg.msg_iovlen = 2;
    let rc = unsafe { libc::recvmsg(fd, &mut msg, libc::MSG_WAITALL) };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    let total = rc as usize;
    if total < SEQNR_SIZE {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            format!("datagram shorter than its sequence number: {total} bytes"),
        ));
    }
    Ok((decode_seqnr(&seq), total - SEQNR_SIZE))
}

/// Receive one plain datagram.
pub fn recv_dgram(fd: RawFd, payload: &mut [u8]) -> io::Result<(usize, Option<SocketAddr>)> {
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let mut slen = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    let rc = unsafe {
        libc::recvfrom(
            fd,
            payload.as_mut_ptr() as *mut libc::c_void,
            payload.len(),
            0,
            &mut storage as *mut libc::sockaddr_storage as *mut libc::sockaddr,
            &mut slen,
        )
    };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok((rc as usize, storage_to_addr(&storage)))
}

/// Send one datagram, optionally prefixed by a sequence number, in a
/// single gather write.
pub fn send_seq_packet(fd: RawFd, seqnr: Option<u64>, payload: &[u8]) -> io::Result<usize> {
    let mut seq = [0u8; SEQNR_SIZE];
    let mut iov: [libc::iovec; 2] = unsafe { mem::zeroed() };
    let mut niov = 0;
    if let Some(s) = seqnr {
        encode_seqnr(s, &mut seq);
        iov[niov] = libc::iovec {
            iov_base: seq.as_mut_ptr() as *mut libc::c_void,
            iov_len: SEQNR_SIZE,
        };
        niov += 1;
    }
    iov[niov] = libc::iovec {
        iov_base: payload.as_ptr() as *mut libc::c_void,
        iov_len: payload.len(),
    };
    niov += 1;

    let mut msg: libc::msghdr = unsafe { mem::zeroed() };
    msg.msg_iov = iov.as_mut_ptr();
    msg.msg_iovlen = niov as _;
    let rc = unsafe { libc::sendmsg(fd, &msg, libc::MSG_EOR) };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(rc as usize)
}

/// Send a short datagram to an explicit address (the ACK back-channel).
pub fn send_to(fd: RawFd, payload: &[u8], addr: &SocketAddr) -> io::Result<usize> {
    let (storage, len) = addr_to_storage(addr);
    let rc = unsafe {
        libc::sendto(
            fd,
            payload.as_ptr() as *const libc::c_void,
            payload.len(),
            0,
            &storage as *const libc::sockaddr_storage as *const libc::sockaddr,
            len,
        )
    };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(rc as usize)
}

/// Read and discard until the remote closes; the tail end of a graceful
/// stream shutdown.
pub fn drain_until_close(fd: RawFd) {
    let mut scratch = [0u8; 4096];
    loop {
        let rc = unsafe {
            libc::read(fd, scratch.as_mut_ptr() as *mut libc::c_void, scratch.len())
        };
        if rc <= 0 {
            break;
        }
    }
}

/// Sync a file descriptor's data to stable storage; no-op for sockets.
pub fn fdatasync(fd: RawFd) {
    unsafe {
        libc::fdatasync(fd);
    }
}

/// Propagate an inter-packet delay into the transport itself. Kernel
/// sockets pace in the writer loop instead, so this is a no-op for every
/// protocol currently carried; transports with their own congestion
/// controller hook in here.
pub fn set_ipd(fd: &NetFd, ipd_us: u64) -> Result<()> {
    match fd.proto {
        Protocol::Tcp | Protocol::Itcp | Protocol::Unix => Ok(()),
        Protocol::Udp | Protocol::Udps | Protocol::Vtp => {
            debug!(ipd_us, "pacing handled by the writer loop");
            Ok(())
        }
    }
}

/// Best-effort SO_SNDBUF/SO_RCVBUF request.
pub fn set_sockbuf(fd: RawFd, bytes: usize) {
    if bytes == 0 {
        return;
    }
    let val = bytes as libc::c_int;
    for opt in [libc::SO_SNDBUF, libc::SO_RCVBUF] {
        unsafe {
            libc::setsockopt(
                fd,
                libc::SOL_SOCKET,
                opt,
                &val as *const libc::c_int as *const libc::c_void,
                mem::size_of::<libc::c_int>() as libc::socklen_t,
            );
        }
    }
}

/// A local bind address in the family of the remote spec.
fn local_any(remote: &str) -> Result<SocketAddr> {
    let addr = remote
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| NetError::BadDest(remote.to_string()))?;
    Ok(match addr {
        SocketAddr::V4(_) => SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0),
        SocketAddr::V6(_) => SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0),
    })
}

fn storage_to_addr(storage: &libc::sockaddr_storage) -> Option<SocketAddr> {
    match storage.ss_family as libc::c_int {
        libc::AF_INET => {
            let sin =
                unsafe { &*(storage as *const libc::sockaddr_storage as *const libc::sockaddr_in) };
            let ip = Ipv4Addr::from(u32::from_be(sin.sin_addr.s_addr));
            Some(SocketAddr::new(IpAddr::V4(ip), u16::from_be(sin.sin_port)))
        }
        libc::AF_INET6 => {
            let sin6 = unsafe {
                &*(storage as *const libc::sockaddr_storage as *const libc::sockaddr_in6)
            };
            let ip = Ipv6Addr::from(sin6.sin6_addr.s6_addr);
            Some(SocketAddr::new(
                IpAddr::V6(ip),
                u16::from_be(sin6.sin6_port),
            ))
        }
        _ => None,
    }
}

fn addr_to_storage(addr: &SocketAddr) -> (libc::sockaddr_storage, libc::socklen_t) {
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    match addr {
        SocketAddr::V4(v4) => {
            let sin = unsafe {
                &mut *(&mut storage as *mut libc::sockaddr_storage as *mut libc::sockaddr_in)
            };
            sin.sin_family = libc::AF_INET as libc::sa_family_t;
            sin.sin_port = v4.port().to_be();
            sin.sin_addr.s_addr = u32::from(*v4.ip()).to_be();
            (storage, mem::size_of::<libc::sockaddr_in>() as libc::socklen_t)
        }
        SocketAddr::V6(v6) => {
            let sin6 = unsafe {
                &mut *(&mut storage as *mut libc::sockaddr_storage as *mut libc::sockaddr_in6)
            };
            sin6.sin6_family = libc::AF_INET6 as libc::sa_family_t;
            sin6.sin6_port = v6.port().to_be();
            sin6.sin6_addr.s6_addr = v6.ip().octets();
            (
                storage,
                mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t,
            )
        }
    }
}
