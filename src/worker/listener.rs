//! Listening sockets
//!
//! Every worker binds its own listener set with SO_REUSEPORT, letting the
//! kernel spread incoming connections across workers without any shared
//! accept lock. Sockets are created through raw syscalls because the
//! reuse options must be set before bind.

use std::io;
use std::mem;
use std::net::{ SocketAddr, TcpListener };
use std::os::fd::FromRawFd;
use std::sync::Arc;

use tracing::info;

use crate::config::PortConfig;
use crate::constants::LISTEN_BACKLOG;
use crate::error::{ Result, SpoolError };

/// One bound listener plus the routing its port carries.
pub struct Listener {
    pub socket: TcpListener,
    /// Owning app index for peers accepted here
    pub app: u16,
    /// TLS termination config when this port is encrypted
    pub tls: Option<Arc<rustls::ServerConfig>>,
}

impl Listener {
    pub fn bind(port: &PortConfig) -> Result<Self> {
        let socket = bind_reuseport(port.listen)?;
        info!(addr = %port.listen, app = port.app, tls = port.tls.is_some(), "listening");
        Ok(Self {
            socket,
            app: port.app as u16,
            tls: port.tls.clone(),
        })
    }
}

fn setsockopt_bool(fd: i32, level: i32, name: i32) -> io::Result<()> {
    let value: libc::c_int = 1;
    let rc = unsafe {
        libc::setsockopt(
            fd,
            level,
            name,
            (&value as *const libc::c_int).cast(),
            mem::size_of::<libc::c_int>() as libc::socklen_t
        )
    };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Create a nonblocking listening socket with SO_REUSEADDR + SO_REUSEPORT
/// set before bind.
pub fn bind_reuseport(addr: SocketAddr) -> Result<TcpListener> {
    let domain = match addr {
        SocketAddr::V4(_) => libc::AF_INET,
        SocketAddr::V6(_) => libc::AF_INET6,
    };

    let fd = unsafe {
        libc::socket(domain, libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC, 0)
    };
    if fd < 0 {
        return Err(io::Error::last_os_error().into());
    }
    // from here every failure must close fd before returning
    let result = (|| -> Result<TcpListener> {
        setsockopt_bool(fd, libc::SOL_SOCKET, libc::SO_REUSEADDR).map_err(SpoolError::Io)?;
        setsockopt_bool(fd, libc::SOL_SOCKET, libc::SO_REUSEPORT).map_err(SpoolError::Io)?;

        let rc = match addr {
            SocketAddr::V4(v4) => {
                let sin = libc::sockaddr_in {
                    sin_family: libc::AF_INET as libc::sa_family_t,
                    sin_port: v4.port().to_be(),
                    sin_addr: libc::in_addr {
                        s_addr: u32::from_ne_bytes(v4.ip().octets()),
                    },
                    sin_zero: [0; 8],
                };
                unsafe {
                    libc::bind(
                        fd,
                        (&sin as *const libc::sockaddr_in).cast(),
                        mem::size_of::<libc::sockaddr_in>() as libc::socklen_t
                    )
                }
            }
            SocketAddr::V6(v6) => {
                let sin6 = libc::sockaddr_in6 {
                    sin6_family: libc::AF_INET6 as libc::sa_family_t,
                    sin6_port: v6.port().to_be(),
                    sin6_flowinfo: v6.flowinfo(),
                    sin6_addr: libc::in6_addr {
                        s6_addr: v6.ip().octets(),
                    },
                    sin6_scope_id: v6.scope_id(),
                };
                unsafe {
                    libc::bind(
                        fd,
                        (&sin6 as *const libc::sockaddr_in6).cast(),
                        mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t
                    )
                }
            }
        };
        if rc < 0 {
            return Err(
                SpoolError::socket(format!("bind {addr}: {}", io::Error::last_os_error()))
            );
        }

        if unsafe { libc::listen(fd, LISTEN_BACKLOG) } < 0 {
            return Err(
                SpoolError::socket(format!("listen {addr}: {}", io::Error::last_os_error()))
            );
        }

        Ok(unsafe {
            // SAFETY: fd is an owned, successfully configured socket
            TcpListener::from_raw_fd(fd)
        })
    })();

    if result.is_err() {
        unsafe {
            libc::close(fd);
        }
    }
    result
}
