//! Per-connection state machine: sniff, connect, forward, tunnel, tear down.

use std::{io, net::SocketAddr};

use n0_error::{AnyError, anyerr, e, stack_error};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
};
use tracing::{debug, trace};

use crate::{
    buffer::Buffer,
    connect::{ConnectError, Connector},
    parse::{
        self, Authority, Classification, ESTABLISHED_RESPONSE, PROXY_ERROR_RESPONSE, RequestHead,
    },
    relay::forward_bidi,
};

/// Per-session buffering knobs.
#[derive(Debug, Clone, Copy)]
pub struct SessionLimits {
    /// Upper bound on bytes buffered while waiting for a request to
    /// complete. Exceeding it tears the session down.
    pub max_buffered: usize,
    /// Read size for each readiness-driven chunk read.
    pub read_chunk: usize,
}

impl Default for SessionLimits {
    fn default() -> Self {
        Self {
            max_buffered: 256 * 1024,
            read_chunk: 4 * 1024,
        }
    }
}

/// Lifecycle phase of one client connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Accumulating client bytes until the sniffer reaches a verdict.
    AwaitingRequest,
    /// Resolving and dialing the upstream destination.
    Connecting,
    /// Relaying while still watching client bytes for further requests.
    Forwarding,
    /// Opaque bidirectional relay, no further classification.
    Tunneling,
    /// Torn down; both sockets released.
    Closed,
}

/// Errors that tear down a single session.
#[stack_error(derive, add_meta)]
#[non_exhaustive]
pub enum SessionError {
    /// No destination in the request, no Host header, no original
    /// destination, no configured upstream.
    #[error("no destination could be determined for the request")]
    MissingDestination,

    /// The destination was present but unusable, or bytes between
    /// pipelined requests do not form a request.
    #[error("malformed request")]
    Malformed {
        #[error(source)]
        source: AnyError,
    },

    /// Buffered client data outgrew the configured bound before a request
    /// completed.
    #[error("buffered request exceeded {limit} bytes")]
    BufferLimit { limit: usize },

    /// Resolving or dialing the upstream failed.
    #[error("failed to reach upstream")]
    Connect {
        #[error(source)]
        source: ConnectError,
    },

    /// A socket read or write failed.
    #[error("io error")]
    Io {
        #[error(source, std_err)]
        source: io::Error,
    },

    /// The opaque relay failed mid-tunnel.
    #[error("relay failed")]
    Relay {
        #[error(source)]
        source: AnyError,
    },
}

impl SessionError {
    /// Whether the client should be told via the synthetic 500 response.
    ///
    /// Transport failures get no reply; the socket state speaks for itself.
    pub fn should_reply(&self) -> bool {
        !matches!(self, Self::Io { .. } | Self::Relay { .. })
    }
}

impl From<io::Error> for SessionError {
    #[track_caller]
    fn from(source: io::Error) -> Self {
        e!(SessionError::Io { source })
    }
}

struct Upstream {
    stream: TcpStream,
    authority: Authority,
    addr: SocketAddr,
}

/// One client connection and everything it owns.
///
/// All mutation happens on the session's own task; the single-writer rule
/// for both sockets holds by construction.
pub(crate) struct Session {
    client: TcpStream,
    upstream: Option<Upstream>,
    inbound: Buffer,
    pending: Buffer,
    state: SessionState,
    response_started: bool,
    connector: Connector,
    upstream_override: Option<Authority>,
    original_dst: Option<SocketAddr>,
    limits: SessionLimits,
}

impl Session {
    pub(crate) fn new(
        client: TcpStream,
        connector: Connector,
        upstream_override: Option<Authority>,
        original_dst: Option<SocketAddr>,
        limits: SessionLimits,
    ) -> Self {
        Self {
            client,
            upstream: None,
            inbound: Buffer::new(),
            pending: Buffer::new(),
            state: SessionState::AwaitingRequest,
            response_started: false,
            connector,
            upstream_override,
            original_dst,
            limits,
        }
    }

    /// Drives the session to completion and tears it down.
    pub(crate) async fn run(mut self) -> Result<(), SessionError> {
        let res = self.drive().await;
        self.finish(&res).await;
        res
    }

    async fn drive(&mut self) -> Result<(), SessionError> {
        loop {
            match self.state {
                SessionState::AwaitingRequest => self.await_request().await?,
                SessionState::Forwarding => self.forward().await?,
                SessionState::Tunneling => self.tunnel().await?,
                // Connecting is transient inside dispatch and never observed here
                SessionState::Connecting | SessionState::Closed => return Ok(()),
            }
        }
    }

    /// Reads client chunks until the sniffer reaches a verdict.
    async fn await_request(&mut self) -> Result<(), SessionError> {
        let mut buf = vec![0u8; self.limits.read_chunk];
        while self.state == SessionState::AwaitingRequest {
            let n = self.client.read(&mut buf).await?;
            if n == 0 {
                if !self.inbound.is_empty() {
                    trace!(
                        buffered = self.inbound.len(),
                        "client closed before request completed"
                    );
                }
                self.state = SessionState::Closed;
                return Ok(());
            }
            self.inbound.append(&buf[..n]);
            self.dispatch_buffered().await?;
        }
        Ok(())
    }

    /// Classifies buffered client bytes and dispatches every complete
    /// request found, leaving any trailing partial request buffered.
    async fn dispatch_buffered(&mut self) -> Result<(), SessionError> {
        loop {
            if self.inbound.is_empty() {
                return Ok(());
            }
            match parse::classify(self.inbound.as_slice()) {
                Classification::Incomplete => {
                    if self.inbound.len() > self.limits.max_buffered {
                        return Err(e!(SessionError::BufferLimit {
                            limit: self.limits.max_buffered
                        }));
                    }
                    return Ok(());
                }
                Classification::NotHttp => {
                    return if self.state == SessionState::AwaitingRequest {
                        self.begin_transparent_tunnel().await
                    } else {
                        Err(e!(
                            SessionError::Malformed,
                            anyerr!("bytes between requests do not form an HTTP request")
                        ))
                    };
                }
                Classification::Complete(head) => {
                    self.dispatch_request(head).await?;
                    if self.state == SessionState::Tunneling {
                        return Ok(());
                    }
                    // keep scanning for pipelined requests
                }
            }
        }
    }

    /// Handles one complete request starting at the front of `inbound`.
    async fn dispatch_request(&mut self, head: RequestHead) -> Result<(), SessionError> {
        let authority = resolve_target(
            self.upstream_override.as_ref(),
            &head,
            self.original_dst,
        )?;
        let frame_len = head.total_len();
        if head.is_connect() {
            debug!(%authority, "tunnel request");
            // the CONNECT header is consumed, not forwarded
            self.inbound.take(frame_len);
            self.flush_pending().await?;
            self.open_upstream(&authority).await?;
            self.client.write_all(ESTABLISHED_RESPONSE).await?;
            self.response_started = true;
            self.state = SessionState::Tunneling;
        } else {
            debug!(%authority, method = %head.method, target = %head.target, "proxy request");
            let frame = self.inbound.take(frame_len);
            // staged bytes belong to the held upstream; write them out
            // before that socket can be replaced
            if self
                .upstream
                .as_ref()
                .is_some_and(|upstream| upstream.authority != authority)
            {
                self.flush_pending().await?;
            }
            self.pending.append(&frame);
            self.open_upstream(&authority).await?;
            self.state = SessionState::Forwarding;
        }
        Ok(())
    }

    /// A stream that is not HTTP can still be proxied when the connection
    /// was transparently redirected: the destination the client originally
    /// dialed stands in for the request target and the bytes pass through
    /// verbatim. The client never sent CONNECT, so it gets no 200 either.
    async fn begin_transparent_tunnel(&mut self) -> Result<(), SessionError> {
        let authority = match (&self.upstream_override, self.original_dst) {
            (Some(authority), _) => authority.clone(),
            (None, Some(addr)) => Authority::from(addr),
            (None, None) => return Err(e!(SessionError::MissingDestination)),
        };
        trace!(
            request = authority.to_connect_request().trim_end(),
            "synthesized tunnel request for non-http stream"
        );
        self.open_upstream(&authority).await?;
        self.state = SessionState::Tunneling;
        Ok(())
    }

    /// Reuses the held upstream when it already serves `authority`,
    /// otherwise drops it and dials fresh.
    async fn open_upstream(&mut self, authority: &Authority) -> Result<(), SessionError> {
        self.state = SessionState::Connecting;
        if let Some(upstream) = &self.upstream {
            if upstream.authority == *authority
                || self
                    .connector
                    .reusable(authority, upstream.addr)
                    .await
                    .map_err(|source| e!(SessionError::Connect { source }))?
            {
                trace!(%authority, addr = %upstream.addr, "reusing upstream");
                return Ok(());
            }
            debug!(old = %upstream.authority, new = %authority, "target changed, reconnecting");
            // drop the old socket before dialing the new target
            self.upstream = None;
        }
        let (stream, addr) = self
            .connector
            .connect(authority)
            .await
            .map_err(|source| e!(SessionError::Connect { source }))?;
        self.upstream = Some(Upstream {
            stream,
            authority: authority.clone(),
            addr,
        });
        Ok(())
    }

    /// Writes the staged request bytes to the upstream.
    async fn flush_pending(&mut self) -> Result<(), SessionError> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let Some(upstream) = self.upstream.as_mut() else {
            return Ok(());
        };
        let bytes = self.pending.take_all();
        upstream.stream.write_all(&bytes).await?;
        Ok(())
    }

    /// Relay loop that keeps watching client bytes for further requests.
    ///
    /// Client bytes re-enter classification so keep-alive and pipelined
    /// requests can be dispatched, including a reconnect when the target
    /// changes. Upstream bytes go to the client in arrival order. Staged
    /// request bytes drain to the upstream as a third arm, so a response
    /// keeps relaying while a large request is still being written.
    async fn forward(&mut self) -> Result<(), SessionError> {
        enum Dir {
            Client(usize),
            Upstream(usize),
            Drained(usize),
        }

        let mut client_buf = vec![0u8; self.limits.read_chunk];
        let mut upstream_buf = vec![0u8; self.limits.read_chunk];
        while self.state == SessionState::Forwarding {
            let dir = {
                let client = &mut self.client;
                let pending = &self.pending;
                let Some(upstream) = self.upstream.as_mut() else {
                    return Ok(());
                };
                let (mut upstream_recv, mut upstream_send) = upstream.stream.split();
                tokio::select! {
                    res = client.read(&mut client_buf) => Dir::Client(res?),
                    res = upstream_recv.read(&mut upstream_buf) => Dir::Upstream(res?),
                    res = upstream_send.write(pending.as_slice()), if !pending.is_empty() => {
                        Dir::Drained(res?)
                    }
                }
            };
            match dir {
                Dir::Client(0) => {
                    trace!("client closed");
                    self.state = SessionState::Closed;
                }
                Dir::Client(n) => {
                    self.inbound.append(&client_buf[..n]);
                    self.dispatch_buffered().await?;
                }
                Dir::Upstream(0) => {
                    trace!("upstream closed");
                    self.state = SessionState::Closed;
                }
                Dir::Upstream(n) => {
                    self.client.write_all(&upstream_buf[..n]).await?;
                    self.response_started = true;
                }
                Dir::Drained(0) => {
                    trace!("upstream stopped accepting writes");
                    self.state = SessionState::Closed;
                }
                Dir::Drained(n) => {
                    self.pending.take(n);
                }
            }
        }
        Ok(())
    }

    /// Opaque relay until either side closes.
    async fn tunnel(&mut self) -> Result<(), SessionError> {
        let Some(upstream) = self.upstream.as_mut() else {
            self.state = SessionState::Closed;
            return Ok(());
        };
        // early data buffered before or alongside the tunnel request
        if !self.inbound.is_empty() {
            let bytes = self.inbound.take_all();
            upstream.stream.write_all(&bytes).await?;
        }
        let (mut client_recv, mut client_send) = self.client.split();
        let (mut upstream_recv, mut upstream_send) = upstream.stream.split();
        let (up, down) = forward_bidi(
            &mut client_recv,
            &mut client_send,
            &mut upstream_recv,
            &mut upstream_send,
        )
        .await
        .map_err(|source| e!(SessionError::Relay { source }))?;
        trace!(up, down, "tunnel closed");
        self.state = SessionState::Closed;
        Ok(())
    }

    /// Teardown: tell the client if it can still be told, then release
    /// both sockets. Runs exactly once per session.
    async fn finish(&mut self, res: &Result<(), SessionError>) {
        if let Err(err) = res {
            if err.should_reply() && !self.response_started {
                self.client.write_all(PROXY_ERROR_RESPONSE).await.ok();
            }
        }
        self.upstream = None;
        self.client.shutdown().await.ok();
        self.state = SessionState::Closed;
    }
}

/// Destination precedence: configured upstream, then the request line,
/// then the Host header, then the original destination of a transparently
/// redirected socket.
fn resolve_target(
    upstream_override: Option<&Authority>,
    head: &RequestHead,
    original_dst: Option<SocketAddr>,
) -> Result<Authority, SessionError> {
    if let Some(authority) = upstream_override {
        return Ok(authority.clone());
    }
    let from_line = head
        .authority()
        .map_err(|source| e!(SessionError::Malformed { source }))?;
    if let Some(authority) = from_line {
        return Ok(authority);
    }
    if let Some(host) = &head.host {
        return Authority::from_host_header(host)
            .map_err(|source| e!(SessionError::Malformed { source }));
    }
    if let Some(addr) = original_dst {
        return Ok(addr.into());
    }
    Err(e!(SessionError::MissingDestination))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parse::Classification;

    fn head(request: &[u8]) -> RequestHead {
        match parse::classify(request) {
            Classification::Complete(head) => head,
            other => panic!("expected Complete, got {other:?}"),
        }
    }

    #[test]
    fn override_takes_precedence_over_request() {
        let configured = Authority {
            host: "gateway.test".to_string(),
            port: 3128,
        };
        let head = head(b"GET http://example.com/ HTTP/1.1\r\n\r\n");
        let target = resolve_target(Some(&configured), &head, None).unwrap();
        assert_eq!(target, configured);
    }

    #[test]
    fn request_line_beats_host_header() {
        let head = head(b"GET http://a.test/ HTTP/1.1\r\nHost: b.test\r\n\r\n");
        let target = resolve_target(None, &head, None).unwrap();
        assert_eq!(target.host, "a.test");
    }

    #[test]
    fn host_header_beats_original_destination() {
        let orig: SocketAddr = "10.1.1.1:8080".parse().unwrap();
        let head = head(b"GET / HTTP/1.1\r\nHost: b.test\r\n\r\n");
        let target = resolve_target(None, &head, Some(orig)).unwrap();
        assert_eq!((target.host.as_str(), target.port), ("b.test", 80));
    }

    #[test]
    fn original_destination_is_the_last_resort() {
        let orig: SocketAddr = "10.1.1.1:8080".parse().unwrap();
        let head = head(b"GET / HTTP/1.1\r\n\r\n");
        let target = resolve_target(None, &head, Some(orig)).unwrap();
        assert_eq!((target.host.as_str(), target.port), ("10.1.1.1", 8080));

        let err = resolve_target(None, &head, None).unwrap_err();
        assert!(matches!(err, SessionError::MissingDestination { .. }));
    }
}
