//! Listener accept loop and proxy-wide options.

use std::{sync::Arc, time::Duration};

use n0_error::{Result, StdResultExt};
use tokio::net::TcpListener;
use tokio_util::{future::FutureExt as _, sync::CancellationToken, task::TaskTracker};
use tracing::{Instrument, debug, error_span, warn};

use crate::{
    connect::Connector,
    parse::Authority,
    registry::Registry,
    resolve::{NoRedirect, OriginalDst, Resolver, SystemResolver},
    session::{Session, SessionLimits},
};

const GRACEFUL_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(1);

/// Configuration for a [`Proxy`].
#[derive(derive_more::Debug, Clone)]
pub struct ProxyOpts {
    /// When set, every session connects here regardless of the request
    /// target.
    pub upstream: Option<Authority>,
    /// Name resolution for upstream destinations.
    #[debug("Arc<dyn Resolver>")]
    pub resolver: Arc<dyn Resolver>,
    /// Recovery of pre-redirect destinations for transparent deployments.
    #[debug("Arc<dyn OriginalDst>")]
    pub original_dst: Arc<dyn OriginalDst>,
    /// Per-session buffering knobs.
    pub limits: SessionLimits,
}

impl Default for ProxyOpts {
    fn default() -> Self {
        Self {
            upstream: None,
            resolver: Arc::new(SystemResolver),
            original_dst: Arc::new(NoRedirect),
            limits: SessionLimits::default(),
        }
    }
}

impl ProxyOpts {
    /// Sends all traffic to a fixed next-hop upstream.
    pub fn upstream(mut self, authority: Authority) -> Self {
        self.upstream = Some(authority);
        self
    }

    pub fn resolver(mut self, resolver: impl Resolver + 'static) -> Self {
        self.resolver = Arc::new(resolver);
        self
    }

    pub fn original_dst(mut self, original_dst: impl OriginalDst + 'static) -> Self {
        self.original_dst = Arc::new(original_dst);
        self
    }

    pub fn limits(mut self, limits: SessionLimits) -> Self {
        self.limits = limits;
        self
    }
}

/// Accepts client connections and runs one session task per connection.
#[derive(Debug)]
pub struct Proxy {
    opts: ProxyOpts,
    registry: Registry,
    shutdown: CancellationToken,
    tasks: TaskTracker,
}

impl Proxy {
    pub fn new(opts: ProxyOpts) -> Self {
        Self {
            opts,
            registry: Registry::new(),
            shutdown: CancellationToken::new(),
            tasks: TaskTracker::new(),
        }
    }

    /// Index of live connections.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Runs the accept loop until [`Proxy::shutdown`] is called.
    pub async fn run(&self, listener: TcpListener) -> Result<()> {
        let local = listener
            .local_addr()
            .std_context("failed to read listener address")?;
        let connector = Connector::new(self.opts.resolver.clone(), local);
        debug!(%local, "listening");
        loop {
            let accepted = listener
                .accept()
                .with_cancellation_token(&self.shutdown)
                .await;
            let (stream, peer) = match accepted {
                None => return Ok(()),
                Some(res) => res.std_context("failed to accept connection")?,
            };
            let id = self.registry.insert(peer);
            // captured at accept time, before any bytes are read
            let original_dst = self.opts.original_dst.original_dst(&stream);
            let session = Session::new(
                stream,
                connector.clone(),
                self.opts.upstream.clone(),
                original_dst,
                self.opts.limits,
            );
            let registry = self.registry.clone();
            let shutdown = self.shutdown.clone();
            self.tasks.spawn(
                async move {
                    debug!("new connection");
                    match shutdown.run_until_cancelled_owned(session.run()).await {
                        None => debug!("aborted at shutdown"),
                        Some(Err(err)) => warn!("connection closed with error: {err:#}"),
                        Some(Ok(())) => debug!("connection closed"),
                    }
                    registry.remove(id);
                }
                .instrument(error_span!("conn", %id, %peer)),
            );
        }
    }

    /// Stops accepting and gives live sessions a short grace period.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        self.tasks.close();
        debug!("shutting down ({} pending sessions)", self.tasks.len());
        match tokio::time::timeout(GRACEFUL_SHUTDOWN_TIMEOUT, self.tasks.wait()).await {
            Ok(_) => debug!("all sessions closed cleanly"),
            Err(_) => debug!(
                remaining = self.tasks.len(),
                "not all sessions closed in time, abort"
            ),
        }
    }
}
