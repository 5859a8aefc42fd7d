use std::net::SocketAddr;
use std::path::PathBuf;
use std::os::unix::io::{AsRawFd, RawFd};

use socket2::{Domain, Protocol, SockAddr, Socket, Type};

use crate::error::Error;

/// Network family of a listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Family {
    Tcp,
    Unix,
    Udp,
}

/// A bound listening socket. Every event loop registers read-readiness
/// on every listener fd; the socket itself is owned here and closed on
/// drop, unlinking Unix socket paths.
pub(crate) struct Listener {
    socket: Socket,
    pub(crate) family: Family,
    pub(crate) addr: SockAddr,
    pub(crate) index: usize,
    unlink_path: Option<PathBuf>,
}

impl Listener {
    pub(crate) fn fd(&self) -> RawFd {
        self.socket.as_raw_fd()
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        if let Some(path) = self.unlink_path.take() {
            let _ = std::fs::remove_file(path);
        }
    }
}

/// Split an address spec like `tcp://127.0.0.1:9000`, `udp://[::1]:53`,
/// or `unix:///tmp/app.sock` into family and address. A bare address
/// defaults to TCP.
fn parse(spec: &str) -> Result<(Family, &str), Error> {
    let (family, rest) = match spec.split_once("://") {
        Some(("tcp", rest)) => (Family::Tcp, rest),
        Some(("udp", rest)) => (Family::Udp, rest),
        Some(("unix", rest)) => (Family::Unix, rest),
        Some((scheme, _)) => {
            return Err(Error::InvalidAddress(format!("unknown scheme: {scheme}")));
        }
        None => (Family::Tcp, spec),
    };
    if rest.is_empty() {
        return Err(Error::InvalidAddress(format!("empty address: {spec}")));
    }
    Ok((family, rest))
}

/// Bind a listener for the given spec, with `SO_REUSEPORT` set and the
/// fd in non-blocking mode.
pub(crate) fn bind(spec: &str, backlog: i32, index: usize) -> Result<Listener, Error> {
    let (family, addr) = parse(spec)?;
    match family {
        Family::Tcp => bind_inet(addr, family, Type::STREAM, Some(Protocol::TCP), backlog, index),
        Family::Udp => bind_inet(addr, family, Type::DGRAM, Some(Protocol::UDP), backlog, index),
        Family::Unix => bind_unix(addr, backlog, index),
    }
}

fn bind_inet(
    addr: &str,
    family: Family,
    ty: Type,
    protocol: Option<Protocol>,
    backlog: i32,
    index: usize,
) -> Result<Listener, Error> {
    let sock_addr: SocketAddr = addr
        .parse()
        .map_err(|e| Error::InvalidAddress(format!("{addr}: {e}")))?;
    let domain = match sock_addr {
        SocketAddr::V4(_) => Domain::IPV4,
        SocketAddr::V6(_) => Domain::IPV6,
    };

    let socket = Socket::new(domain, ty, protocol)?;
    socket.set_reuse_address(true)?;
    // SO_REUSEPORT lets several server processes bind the same address
    // and have the kernel spread accepts among them.
    socket.set_reuse_port(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&sock_addr.into())?;
    if family == Family::Tcp {
        socket.listen(backlog)?;
    }

    let addr = socket.local_addr()?;
    Ok(Listener {
        socket,
        family,
        addr,
        index,
        unlink_path: None,
    })
}

fn bind_unix(path: &str, backlog: i32, index: usize) -> Result<Listener, Error> {
    // A stale socket file from a previous run would make bind fail.
    let _ = std::fs::remove_file(path);

    let socket = Socket::new(Domain::UNIX, Type::STREAM, None)?;
    socket.set_nonblocking(true)?;
    let addr = SockAddr::unix(path)?;
    socket.bind(&addr)?;
    socket.listen(backlog)?;

    Ok(Listener {
        socket,
        family: Family::Unix,
        addr,
        index,
        unlink_path: Some(PathBuf::from(path)),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_schemes() {
        assert_eq!(parse("tcp://127.0.0.1:80").unwrap(), (Family::Tcp, "127.0.0.1:80"));
        assert_eq!(parse("udp://127.0.0.1:53").unwrap(), (Family::Udp, "127.0.0.1:53"));
        assert_eq!(parse("unix:///tmp/x.sock").unwrap(), (Family::Unix, "/tmp/x.sock"));
        assert_eq!(parse("127.0.0.1:80").unwrap(), (Family::Tcp, "127.0.0.1:80"));
    }

    #[test]
    fn parse_rejects_unknown_scheme() {
        assert!(matches!(
            parse("sctp://127.0.0.1:80"),
            Err(Error::InvalidAddress(_))
        ));
        assert!(matches!(parse("tcp://"), Err(Error::InvalidAddress(_))));
    }

    #[test]
    fn bind_tcp_resolves_port() {
        let listener = bind("tcp://127.0.0.1:0", 128, 0).unwrap();
        assert_eq!(listener.family, Family::Tcp);
        let addr = listener.addr.as_socket().unwrap();
        assert_ne!(addr.port(), 0);
    }

    #[test]
    fn bind_udp() {
        let listener = bind("udp://127.0.0.1:0", 128, 0).unwrap();
        assert_eq!(listener.family, Family::Udp);
        assert!(listener.addr.as_socket().is_some());
    }

    #[test]
    fn bind_rejects_garbage() {
        assert!(matches!(
            bind("tcp://not-an-address", 128, 0),
            Err(Error::InvalidAddress(_))
        ));
    }

    #[test]
    fn bind_unix_unlinks_on_drop() {
        let path = std::env::temp_dir().join(format!("levio-listener-{}.sock", std::process::id()));
        let path_str = path.to_str().unwrap();
        let spec = format!("unix://{path_str}");
        let listener = bind(&spec, 128, 0).unwrap();
        assert_eq!(listener.family, Family::Unix);
        assert!(path.exists());
        drop(listener);
        assert!(!path.exists());
    }
}
