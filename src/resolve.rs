//! Pluggable address resolution and original-destination recovery.

use std::{fmt::Debug, future::Future, net::SocketAddr, pin::Pin};

use tokio::{io, net::TcpStream};

/// Resolves a hostname and port to candidate socket addresses.
///
/// The default [`SystemResolver`] asks the operating system. Tests and
/// special deployments substitute their own implementation.
pub trait Resolver: Debug + Send + Sync {
    fn resolve<'a>(
        &'a self,
        host: &'a str,
        port: u16,
    ) -> Pin<Box<dyn Future<Output = io::Result<Vec<SocketAddr>>> + Send + 'a>>;
}

/// Resolver backed by the operating system's name lookup.
#[derive(Debug, Clone, Default)]
pub struct SystemResolver;

impl Resolver for SystemResolver {
    fn resolve<'a>(
        &'a self,
        host: &'a str,
        port: u16,
    ) -> Pin<Box<dyn Future<Output = io::Result<Vec<SocketAddr>>> + Send + 'a>> {
        Box::pin(async move {
            let addrs = tokio::net::lookup_host((host, port)).await?;
            Ok(addrs.collect())
        })
    }
}

/// Recovers the destination a client originally dialed before the connection
/// was transparently redirected to the proxy.
///
/// Returns `None` when the socket was not redirected or the platform cannot
/// tell. The answer is captured once at accept time.
pub trait OriginalDst: Debug + Send + Sync {
    fn original_dst(&self, stream: &TcpStream) -> Option<SocketAddr>;
}

/// Treats every connection as dialed directly at the proxy.
#[derive(Debug, Clone, Default)]
pub struct NoRedirect;

impl OriginalDst for NoRedirect {
    fn original_dst(&self, _stream: &TcpStream) -> Option<SocketAddr> {
        None
    }
}

/// Reports a fixed original destination for every connection.
///
/// Useful for tests and for deployments where all redirected traffic is
/// known to head to one place.
#[derive(Debug, Clone)]
pub struct FixedDst(pub SocketAddr);

impl OriginalDst for FixedDst {
    fn original_dst(&self, _stream: &TcpStream) -> Option<SocketAddr> {
        Some(self.0)
    }
}

/// Reads the pre-redirect destination that iptables REDIRECT/TPROXY stored
/// on the socket.
#[cfg(target_os = "linux")]
#[derive(Debug, Clone, Default)]
pub struct SoOriginalDst;

#[cfg(target_os = "linux")]
impl OriginalDst for SoOriginalDst {
    fn original_dst(&self, stream: &TcpStream) -> Option<SocketAddr> {
        use std::os::fd::AsRawFd;

        const SO_ORIGINAL_DST: libc::c_int = 80;

        let fd = stream.as_raw_fd();
        let mut addr: libc::sockaddr_in = unsafe { std::mem::zeroed() };
        let mut len = std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
        let ret = unsafe {
            libc::getsockopt(
                fd,
                libc::SOL_IP,
                SO_ORIGINAL_DST,
                &mut addr as *mut _ as *mut libc::c_void,
                &mut len,
            )
        };
        if ret != 0 {
            return None;
        }
        let ip = std::net::Ipv4Addr::from(u32::from_be(addr.sin_addr.s_addr));
        let port = u16::from_be(addr.sin_port);
        Some(SocketAddr::from((ip, port)))
    }
}
