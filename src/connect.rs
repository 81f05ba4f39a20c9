//! Opening upstream connections and deciding when to reuse them.

use std::{net::SocketAddr, sync::Arc};

use n0_error::{e, stack_error};
use tokio::{io, net::TcpStream};
use tracing::{debug, trace};

use crate::{parse::Authority, resolve::Resolver};

/// Errors from resolving or dialing an upstream destination.
#[stack_error(derive, add_meta)]
#[non_exhaustive]
pub enum ConnectError {
    /// The destination resolves back to the proxy itself.
    #[error("destination {addr} is the proxy's own listening address")]
    LocalLoop { addr: SocketAddr },

    /// Name resolution failed.
    #[error("failed to resolve {authority}")]
    Resolve {
        authority: Authority,
        #[error(source, std_err)]
        source: io::Error,
    },

    /// Name resolution returned no candidates.
    #[error("no addresses found for {authority}")]
    NoAddresses { authority: Authority },

    /// Every resolved candidate refused the connection.
    #[error("failed to connect to {authority}")]
    Unreachable {
        authority: Authority,
        #[error(source, std_err)]
        source: io::Error,
    },
}

/// Dials upstream destinations on behalf of sessions.
///
/// Carries the proxy's own listening address so a destination that points
/// back at the proxy is refused before any connect is attempted.
#[derive(Debug, Clone)]
pub struct Connector {
    resolver: Arc<dyn Resolver>,
    local: SocketAddr,
}

impl Connector {
    pub fn new(resolver: Arc<dyn Resolver>, local: SocketAddr) -> Self {
        Self { resolver, local }
    }

    /// Resolves `authority` to candidate addresses, rejecting self-loops.
    async fn resolve(&self, authority: &Authority) -> Result<Vec<SocketAddr>, ConnectError> {
        let addrs = self
            .resolver
            .resolve(&authority.host, authority.port)
            .await
            .map_err(|source| {
                e!(ConnectError::Resolve {
                    authority: authority.clone(),
                    source
                })
            })?;
        if addrs.is_empty() {
            return Err(e!(ConnectError::NoAddresses {
                authority: authority.clone()
            }));
        }
        for addr in &addrs {
            if self.is_self(*addr) {
                return Err(e!(ConnectError::LocalLoop { addr: *addr }));
            }
        }
        Ok(addrs)
    }

    /// Connects to the first reachable resolved address.
    pub async fn connect(
        &self,
        authority: &Authority,
    ) -> Result<(TcpStream, SocketAddr), ConnectError> {
        let addrs = self.resolve(authority).await?;
        let mut last_err = None;
        for addr in addrs {
            trace!(%authority, %addr, "dialing upstream");
            match TcpStream::connect(addr).await {
                Ok(stream) => {
                    debug!(%authority, %addr, "connected upstream");
                    return Ok((stream, addr));
                }
                Err(err) => {
                    trace!(%addr, "connect failed: {err:#}");
                    last_err = Some(err);
                }
            }
        }
        let source = last_err
            .unwrap_or_else(|| io::Error::new(io::ErrorKind::AddrNotAvailable, "no candidates"));
        Err(e!(ConnectError::Unreachable {
            authority: authority.clone(),
            source
        }))
    }

    /// Reports whether an existing upstream connected to `current` also
    /// serves `authority`, by resolved-address equality.
    pub async fn reusable(
        &self,
        authority: &Authority,
        current: SocketAddr,
    ) -> Result<bool, ConnectError> {
        let addrs = self.resolve(authority).await?;
        Ok(addrs.contains(&current))
    }

    /// A candidate is the proxy itself when the port matches and the address
    /// is the bound address, or either side is a wildcard or loopback route
    /// to the same host.
    fn is_self(&self, addr: SocketAddr) -> bool {
        if addr.port() != self.local.port() {
            return false;
        }
        let (a, b) = (addr.ip(), self.local.ip());
        a == b
            || ((a.is_loopback() || a.is_unspecified()) && (b.is_loopback() || b.is_unspecified()))
    }
}
