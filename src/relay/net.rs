// src/relay/net.rs - Socket utilities
//
// Sockets are created through libc so that options (buffer sizes, TCP_NODELAY,
// SO_REUSEADDR) are in place before bind/listen and the listen backlog is ours.
// Every socket leaves here non-blocking and wrapped in a std type.

use std::io;
use std::mem;
use std::net::{SocketAddr, TcpListener, TcpStream, UdpSocket};
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};

/// Options applied to a freshly created socket.
#[derive(Debug, Clone, Copy)]
pub struct SocketOptions {
    pub send_buffer: usize,
    pub recv_buffer: usize,
    pub nodelay: bool,
}

fn cvt(ret: libc::c_int) -> io::Result<libc::c_int> {
    if ret < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(ret)
    }
}

fn new_socket(addr: &SocketAddr, ty: libc::c_int) -> io::Result<OwnedFd> {
    let domain = match addr {
        SocketAddr::V4(_) => libc::AF_INET,
        SocketAddr::V6(_) => libc::AF_INET6,
    };
    // SAFETY: socket() takes no pointers; the result is checked before use
    let fd = cvt(unsafe { libc::socket(domain, ty, 0) })?;
    // SAFETY: fd was just returned by socket() and nothing else owns it, so
    // every later error path closes it exactly once
    let owned = unsafe { OwnedFd::from_raw_fd(fd) };
    set_cloexec(owned.as_raw_fd())?;
    Ok(owned)
}

fn set_cloexec(fd: RawFd) -> io::Result<()> {
    // SAFETY: fcntl on a valid descriptor owned by the caller
    let flags = cvt(unsafe { libc::fcntl(fd, libc::F_GETFD) })?;
    // SAFETY: same descriptor; F_SETFD takes an int argument, no pointers
    cvt(unsafe { libc::fcntl(fd, libc::F_SETFD, flags | libc::FD_CLOEXEC) })?;
    Ok(())
}

fn setsockopt_int(fd: RawFd, level: libc::c_int, name: libc::c_int, value: libc::c_int) -> io::Result<()> {
    // SAFETY: `value` lives on the stack for the duration of the call and the
    // length passed matches its type.
    cvt(unsafe {
        libc::setsockopt(
            fd,
            level,
            name,
            &value as *const libc::c_int as *const libc::c_void,
            mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    })?;
    Ok(())
}

pub fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    // SAFETY: fcntl on a valid descriptor owned by the caller
    let flags = cvt(unsafe { libc::fcntl(fd, libc::F_GETFL) })?;
    // SAFETY: same descriptor; F_SETFL takes an int argument, no pointers
    cvt(unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) })?;
    Ok(())
}

pub fn set_send_buffer(fd: RawFd, size: usize) -> io::Result<()> {
    setsockopt_int(fd, libc::SOL_SOCKET, libc::SO_SNDBUF, size.min(i32::MAX as usize) as libc::c_int)
}

pub fn set_recv_buffer(fd: RawFd, size: usize) -> io::Result<()> {
    setsockopt_int(fd, libc::SOL_SOCKET, libc::SO_RCVBUF, size.min(i32::MAX as usize) as libc::c_int)
}

pub fn set_tcp_nodelay(fd: RawFd) -> io::Result<()> {
    setsockopt_int(fd, libc::IPPROTO_TCP, libc::TCP_NODELAY, 1)
}

fn set_reuse_addr(fd: RawFd) -> io::Result<()> {
    setsockopt_int(fd, libc::SOL_SOCKET, libc::SO_REUSEADDR, 1)
}

fn apply(fd: RawFd, options: &SocketOptions) -> io::Result<()> {
    set_nonblocking(fd)?;
    if options.nodelay {
        set_tcp_nodelay(fd)?;
    }
    if options.send_buffer > 0 {
        set_send_buffer(fd, options.send_buffer)?;
    }
    if options.recv_buffer > 0 {
        set_recv_buffer(fd, options.recv_buffer)?;
    }
    Ok(())
}

/// Socket address in C layout.
fn raw_addr(addr: &SocketAddr) -> (libc::sockaddr_storage, libc::socklen_t) {
    // SAFETY: sockaddr_storage is plain data; all-zero is a valid empty address
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let len = match addr {
        SocketAddr::V4(v4) => {
            // SAFETY: sockaddr_storage is large and aligned enough for sockaddr_in
            let sin = unsafe { &mut *(&mut storage as *mut _ as *mut libc::sockaddr_in) };
            sin.sin_family = libc::AF_INET as libc::sa_family_t;
            sin.sin_port = v4.port().to_be();
            sin.sin_addr = libc::in_addr {
                s_addr: u32::from_ne_bytes(v4.ip().octets()),
            };
            #[cfg(any(target_os = "macos", target_os = "freebsd", target_os = "openbsd", target_os = "dragonfly"))]
            {
                sin.sin_len = mem::size_of::<libc::sockaddr_in>() as u8;
            }
            mem::size_of::<libc::sockaddr_in>()
        }
        SocketAddr::V6(v6) => {
            // SAFETY: sockaddr_storage is large and aligned enough for sockaddr_in6
            let sin6 = unsafe { &mut *(&mut storage as *mut _ as *mut libc::sockaddr_in6) };
            sin6.sin6_family = libc::AF_INET6 as libc::sa_family_t;
            sin6.sin6_port = v6.port().to_be();
            sin6.sin6_addr.s6_addr = v6.ip().octets();
            sin6.sin6_flowinfo = v6.flowinfo();
            sin6.sin6_scope_id = v6.scope_id();
            #[cfg(any(target_os = "macos", target_os = "freebsd", target_os = "openbsd", target_os = "dragonfly"))]
            {
                sin6.sin6_len = mem::size_of::<libc::sockaddr_in6>() as u8;
            }
            mem::size_of::<libc::sockaddr_in6>()
        }
    };
    (storage, len as libc::socklen_t)
}

fn bind(fd: RawFd, addr: &SocketAddr) -> io::Result<()> {
    let (storage, len) = raw_addr(addr);
    // SAFETY: storage holds a valid sockaddr of `len` bytes for this family
    cvt(unsafe { libc::bind(fd, &storage as *const _ as *const libc::sockaddr, len) })?;
    Ok(())
}

/// Non-blocking UDP socket bound to `addr`.
pub fn udp_bind(addr: SocketAddr, options: &SocketOptions) -> io::Result<UdpSocket> {
    let fd = new_socket(&addr, libc::SOCK_DGRAM)?;
    apply(fd.as_raw_fd(), options)?;
    bind(fd.as_raw_fd(), &addr)?;
    Ok(UdpSocket::from(fd))
}

/// Non-blocking TCP listener bound to `addr` with the given backlog.
pub fn tcp_listen(addr: SocketAddr, options: &SocketOptions, backlog: i32) -> io::Result<TcpListener> {
    let fd = new_socket(&addr, libc::SOCK_STREAM)?;
    set_reuse_addr(fd.as_raw_fd())?;
    apply(fd.as_raw_fd(), options)?;
    bind(fd.as_raw_fd(), &addr)?;
    // SAFETY: listen() on a bound stream socket we own
    cvt(unsafe { libc::listen(fd.as_raw_fd(), backlog) })?;
    Ok(TcpListener::from(fd))
}

/// Starts a non-blocking connect to `addr`.
///
/// The connect usually completes later; the first writable event (or a
/// failed read/write) reports the outcome.
pub fn tcp_connect(addr: SocketAddr, options: &SocketOptions) -> io::Result<TcpStream> {
    let fd = new_socket(&addr, libc::SOCK_STREAM)?;
    apply(fd.as_raw_fd(), options)?;

    let (storage, len) = raw_addr(&addr);
    loop {
        // SAFETY: storage holds a valid sockaddr of `len` bytes for this family
        let ret = unsafe {
            libc::connect(fd.as_raw_fd(), &storage as *const _ as *const libc::sockaddr, len)
        };
        if ret == 0 {
            break;
        }
        let err = io::Error::last_os_error();
        match err.raw_os_error() {
            Some(libc::EINTR) => continue,
            Some(libc::EINPROGRESS) => break,
            _ => return Err(err),
        }
    }
    Ok(TcpStream::from(fd))
}

/// Prepares an accepted client socket: non-blocking with the given send buffer.
pub fn configure_client(stream: &TcpStream, send_buffer: usize) -> io::Result<()> {
    set_nonblocking(stream.as_raw_fd())?;
    if send_buffer > 0 {
        set_send_buffer(stream.as_raw_fd(), send_buffer)?;
    }
    Ok(())
}

fn get_int_opt(fd: RawFd, level: libc::c_int, name: libc::c_int) -> io::Result<libc::c_int> {
    let mut value: libc::c_int = 0;
    let mut len = mem::size_of::<libc::c_int>() as libc::socklen_t;
    // SAFETY: value and len are valid for writes and len matches value's size
    cvt(unsafe {
        libc::getsockopt(
            fd,
            level,
            name,
            &mut value as *mut libc::c_int as *mut libc::c_void,
            &mut len,
        )
    })?;
    Ok(value)
}

/// Effective SO_SNDBUF (the kernel may report a scaled value)
pub fn send_buffer(fd: RawFd) -> io::Result<usize> {
    get_int_opt(fd, libc::SOL_SOCKET, libc::SO_SNDBUF).map(|v| v as usize)
}

/// SO_LINGER with a zero timeout: closing the socket sends RST instead of FIN.
#[cfg(test)]
pub(crate) fn set_linger_zero(fd: RawFd) -> io::Result<()> {
    let linger = libc::linger {
        l_onoff: 1,
        l_linger: 0,
    };
    // SAFETY: `linger` lives on the stack for the duration of the call and the
    // length passed matches its type.
    cvt(unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_LINGER,
            &linger as *const libc::linger as *const libc::c_void,
            mem::size_of::<libc::linger>() as libc::socklen_t,
        )
    })?;
    Ok(())
}

pub fn is_nonblocking(fd: RawFd) -> io::Result<bool> {
    // SAFETY: fcntl on a valid descriptor owned by the caller
    let flags = cvt(unsafe { libc::fcntl(fd, libc::F_GETFL) })?;
    Ok(flags & libc::O_NONBLOCK != 0)
}
