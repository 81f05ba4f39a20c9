//! A transparent/forward HTTP proxy.
//!
//! Sniffs each client connection to decide whether it carries HTTP, extracts
//! the destination from the request line, the `Host:` header, a CONNECT
//! target, or the original destination of a transparently redirected socket,
//! then opens (or reuses) an upstream connection and relays bytes in both
//! directions until either side closes.

mod buffer;
mod connect;
mod parse;
mod registry;
mod relay;
mod resolve;
mod server;
mod session;

pub use {
    connect::{ConnectError, Connector},
    parse::{
        Authority, Classification, ESTABLISHED_RESPONSE, PROXY_ERROR_RESPONSE, RequestHead,
        classify,
    },
    registry::{ConnId, Registry},
    resolve::{FixedDst, NoRedirect, OriginalDst, Resolver, SystemResolver},
    server::{Proxy, ProxyOpts},
    session::{SessionError, SessionLimits, SessionState},
};

#[cfg(target_os = "linux")]
pub use resolve::SoOriginalDst;
