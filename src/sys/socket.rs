use std::io;
use std::mem;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};
use std::os::unix::io::RawFd;

use libc::{self, c_int};

use crate::addr::SockAddr;
use crate::sys::syscall;

#[cfg(any(target_os = "linux", target_os = "android"))]
const MSG_NOSIGNAL: c_int = libc::MSG_NOSIGNAL;
#[cfg(not(any(target_os = "linux", target_os = "android")))]
const MSG_NOSIGNAL: c_int = 0;

/// Open a stream socket in the given domain, close-on-exec and non-blocking.
pub fn stream(domain: c_int) -> io::Result<RawFd> {
    match syscall!(socket(
        domain,
        libc::SOCK_STREAM | libc::SOCK_CLOEXEC | libc::SOCK_NONBLOCK,
        0
    )) {
        Ok(fd) => return Ok(fd),
        Err(ref e) if e.raw_os_error() == Some(libc::EINVAL) => {}
        Err(e) => return Err(e),
    }

    let fd = syscall!(socket(domain, libc::SOCK_STREAM, 0))?;
    if let Err(e) = prepare(fd) {
        let _ = syscall!(close(fd));
        return Err(e);
    }

    Ok(fd)
}

/// Put an inherited descriptor into the mode every owned socket runs in:
/// close-on-exec, non-blocking, and no SIGPIPE where the platform has the
/// socket option for it.
pub fn prepare(fd: RawFd) -> io::Result<()> {
    syscall!(fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC))?;

    let mut opt = syscall!(fcntl(fd, libc::F_GETFL, 0))?;
    if opt == -1 {
        opt = 0;
    }
    if opt & libc::O_NONBLOCK == 0 {
        syscall!(fcntl(fd, libc::F_SETFL, opt | libc::O_NONBLOCK))?;
    }

    #[cfg(any(target_os = "macos", target_os = "ios", target_os = "freebsd"))]
    {
        let on: c_int = 1;
        syscall!(setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_NOSIGPIPE,
            &on as *const _ as *const libc::c_void,
            std::mem::size_of::<c_int>() as libc::socklen_t
        ))?;
    }

    Ok(())
}

pub fn bind(fd: RawFd, addr: &SockAddr) -> io::Result<()> {
    syscall!(bind(fd, addr.as_ptr(), addr.len()))?;
    Ok(())
}

pub fn listen(fd: RawFd, backlog: c_int) -> io::Result<()> {
    syscall!(listen(fd, backlog))?;
    Ok(())
}

pub fn connect(fd: RawFd, addr: &SockAddr) -> io::Result<()> {
    syscall!(connect(fd, addr.as_ptr(), addr.len()))?;
    Ok(())
}

#[cfg(any(target_os = "linux", target_os = "android", target_os = "freebsd"))]
pub fn accept(fd: RawFd) -> io::Result<RawFd> {
    let new = syscall!(accept4(
        fd,
        std::ptr::null_mut(),
        std::ptr::null_mut(),
        libc::SOCK_CLOEXEC | libc::SOCK_NONBLOCK
    ))?;
    Ok(new)
}

#[cfg(not(any(target_os = "linux", target_os = "android", target_os = "freebsd")))]
pub fn accept(fd: RawFd) -> io::Result<RawFd> {
    let new = syscall!(accept(fd, std::ptr::null_mut(), std::ptr::null_mut()))?;
    if let Err(e) = prepare(new) {
        let _ = syscall!(close(new));
        return Err(e);
    }
    Ok(new)
}

/// Pending error on the socket, cleared by reading it. Used after the poller
/// reports writability or an error condition on a connecting socket.
pub fn take_error(fd: RawFd) -> io::Result<Option<io::Error>> {
    let mut err: c_int = 0;
    let mut len = std::mem::size_of::<c_int>() as libc::socklen_t;
    syscall!(getsockopt(
        fd,
        libc::SOL_SOCKET,
        libc::SO_ERROR,
        &mut err as *mut _ as *mut libc::c_void,
        &mut len
    ))?;
    if err == 0 {
        Ok(None)
    } else {
        Ok(Some(io::Error::from_raw_os_error(err)))
    }
}

/// Gathered write of all non-empty slices. Returns the number of bytes the
/// kernel took, which may be short.
pub fn sendv(fd: RawFd, bufs: &[&[u8]]) -> io::Result<usize> {
    let mut iov: Vec<libc::iovec> = Vec::with_capacity(bufs.len());
    for buf in bufs {
        if buf.is_empty() {
            continue;
        }
        iov.push(libc::iovec {
            iov_base: buf.as_ptr() as *mut libc::c_void,
            iov_len: buf.len(),
        });
    }

    if iov.is_empty() {
        return Ok(0);
    }

    let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
    msg.msg_iov = iov.as_mut_ptr();
    msg.msg_iovlen = iov.len() as _;

    let n = syscall!(sendmsg(fd, &msg, MSG_NOSIGNAL))?;
    Ok(n as usize)
}

/// Read into `buf`. `Ok(0)` on a non-empty buffer means the peer closed.
pub fn recv(fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
    let n = syscall!(recv(
        fd,
        buf.as_mut_ptr() as *mut libc::c_void,
        buf.len(),
        0
    ))?;
    Ok(n as usize)
}

pub fn close(fd: RawFd) {
    let _ = syscall!(close(fd));
}

/// The bound local address of a TCP socket, mainly to recover the port
/// after binding to port 0.
pub fn local_addr(fd: RawFd) -> io::Result<SocketAddr> {
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let mut len = mem::size_of_val(&storage) as libc::socklen_t;
    syscall!(getsockname(
        fd,
        &mut storage as *mut _ as *mut libc::sockaddr,
        &mut len
    ))?;
    sockaddr_to_addr(&storage)
}

fn sockaddr_to_addr(storage: &libc::sockaddr_storage) -> io::Result<SocketAddr> {
    match storage.ss_family as c_int {
        libc::AF_INET => {
            let sin = unsafe { *(storage as *const _ as *const libc::sockaddr_in) };
            Ok(SocketAddr::V4(SocketAddrV4::new(
                Ipv4Addr::from(u32::from_be(sin.sin_addr.s_addr)),
                u16::from_be(sin.sin_port),
            )))
        }
        libc::AF_INET6 => {
            let sin6 = unsafe { *(storage as *const _ as *const libc::sockaddr_in6) };
            Ok(SocketAddr::V6(SocketAddrV6::new(
                Ipv6Addr::from(sin6.sin6_addr.s6_addr),
                u16::from_be(sin6.sin6_port),
                sin6.sin6_flowinfo,
                sin6.sin6_scope_id,
            )))
        }
        _ => Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "not an inet socket",
        )),
    }
}
