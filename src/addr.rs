use std::ffi::CString;
use std::fmt;
use std::io;
use std::mem;
use std::net::SocketAddr;
use std::os::unix::ffi::OsStrExt;
use std::path::PathBuf;

use libc::{c_int, socklen_t};

use crate::sys::syscall;

/// A transport address an endpoint binds or connects to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Addr {
    Tcp(SocketAddr),
    Ipc(PathBuf),
}

impl Addr {
    pub fn domain(&self) -> c_int {
        match self {
            Addr::Tcp(SocketAddr::V4(_)) => libc::AF_INET,
            Addr::Tcp(SocketAddr::V6(_)) => libc::AF_INET6,
            Addr::Ipc(_) => libc::AF_UNIX,
        }
    }

    pub fn to_sockaddr(&self) -> io::Result<SockAddr> {
        match self {
            Addr::Tcp(SocketAddr::V4(v4)) => {
                let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
                let sin = &mut storage as *mut _ as *mut libc::sockaddr_in;
                unsafe {
                    (*sin).sin_family = libc::AF_INET as libc::sa_family_t;
                    (*sin).sin_port = v4.port().to_be();
                    (*sin).sin_addr = libc::in_addr {
                        s_addr: u32::from(*v4.ip()).to_be(),
                    };
                }
                Ok(SockAddr {
                    storage,
                    len: mem::size_of::<libc::sockaddr_in>() as socklen_t,
                })
            }
            Addr::Tcp(SocketAddr::V6(v6)) => {
                let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
                let sin6 = &mut storage as *mut _ as *mut libc::sockaddr_in6;
                unsafe {
                    (*sin6).sin6_family = libc::AF_INET6 as libc::sa_family_t;
                    (*sin6).sin6_port = v6.port().to_be();
                    (*sin6).sin6_flowinfo = v6.flowinfo();
                    (*sin6).sin6_scope_id = v6.scope_id();
                    (*sin6).sin6_addr.s6_addr = v6.ip().octets();
                }
                Ok(SockAddr {
                    storage,
                    len: mem::size_of::<libc::sockaddr_in6>() as socklen_t,
                })
            }
            Addr::Ipc(path) => {
                let bytes = path.as_os_str().as_bytes();

                let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
                let un = &mut storage as *mut _ as *mut libc::sockaddr_un;
                let sun_path_cap = unsafe { (*un).sun_path.len() };

                // The path must fit with its terminating nul.
                if bytes.len() >= sun_path_cap {
                    return Err(io::Error::from_raw_os_error(libc::ENAMETOOLONG));
                }
                if bytes.contains(&0) {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidInput,
                        "ipc path contains a nul byte",
                    ));
                }

                unsafe {
                    (*un).sun_family = libc::AF_UNIX as libc::sa_family_t;
                    for (i, b) in bytes.iter().enumerate() {
                        (*un).sun_path[i] = *b as libc::c_char;
                    }
                }

                let sun_path_offset = {
                    let probe: libc::sockaddr_un = unsafe { mem::zeroed() };
                    (&probe.sun_path as *const _ as usize) - (&probe as *const _ as usize)
                };

                Ok(SockAddr {
                    storage,
                    len: (sun_path_offset + bytes.len() + 1) as socklen_t,
                })
            }
        }
    }

    /// Remove a stale IPC socket file left over by a previous run. Missing
    /// files are not an error; a no-op for TCP.
    pub fn unlink_stale(&self) -> io::Result<()> {
        if let Addr::Ipc(path) = self {
            let cpath = CString::new(path.as_os_str().as_bytes())
                .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "nul in ipc path"))?;
            if let Err(e) = syscall!(unlink(cpath.as_ptr())) {
                if e.raw_os_error() != Some(libc::ENOENT) {
                    return Err(e);
                }
            }
        }
        Ok(())
    }
}

impl fmt::Display for Addr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Addr::Tcp(sa) => write!(f, "tcp://{}", sa),
            Addr::Ipc(path) => write!(f, "ipc://{}", path.display()),
        }
    }
}

/// An `Addr` lowered to the raw form the socket calls take.
#[derive(Debug)]
pub struct SockAddr {
    storage: libc::sockaddr_storage,
    len: socklen_t,
}

impl SockAddr {
    pub fn as_ptr(&self) -> *const libc::sockaddr {
        &self.storage as *const _ as *const libc::sockaddr
    }

    pub fn len(&self) -> socklen_t {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}
