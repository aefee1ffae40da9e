//! Intercepting proxy
//!
//! ```text
//! accept ─► peek first byte
//!             ├─ 0x16 ─────────────► TLS (SNI) ──────────────┐
//!             └─ HTTP/1.1 request                            │
//!                  ├─ CONNECT h:p ─► 200 ─► peek ─► TLS ─────┤
//!                  │                          └──► plaintext ┤
//!                  ├─ absolute-form (forward proxy) ─────────┤
//!                  └─ origin-form (Host header, port 80) ────┤
//!                                                            ▼
//!                      decode ─► session ─► policy ─► audit ─► 403 | upstream
//! ```
//!
//! One request is served per session connection. Nothing is written
//! upstream before the verdict.

use super::ca::CertificateAuthority;
use super::codec::{encode_upstream, FramingError, RawRequest, RequestCodec};
use super::request::{normalize_path, split_authority, split_target, Scheme, TrafficRequest};
use super::upstream::{Io, Upstream};
use crate::audit::{DecisionLog, Subject};
use crate::config::ProxyConfig;
use crate::error::{Error, Result};
use crate::policy::TrafficPolicy;
use crate::session::{Session, SessionManager};
use crate::verdict::{DenyReason, Verdict};
use futures::StreamExt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tokio_rustls::LazyConfigAcceptor;
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;

/// First byte of a TLS handshake record
const TLS_HANDSHAKE: u8 = 0x16;

const CONNECT_ESTABLISHED: &[u8] = b"HTTP/1.1 200 Connection Established\r\n\r\n";

/// Where a request is going, fixed before the request is read when the
/// transport names it (SNI or CONNECT).
#[derive(Debug, Clone)]
struct Destination {
    scheme: Scheme,
    host: String,
    port: u16,
    /// CONNECT authority that disagreed with the SNI
    conflicting: Option<String>,
}

/// The traffic engine
pub struct TrafficEngine {
    sessions: Arc<SessionManager>,
    policy: TrafficPolicy,
    log: Arc<DecisionLog>,
    ca: Arc<CertificateAuthority>,
    upstream: Upstream,
    max_body: usize,
    handshake_timeout: Duration,
    limiter: Arc<Semaphore>,
}

impl TrafficEngine {
    /// Create a new traffic engine
    pub fn new(
        config: &ProxyConfig,
        sessions: Arc<SessionManager>,
        policy: TrafficPolicy,
        log: Arc<DecisionLog>,
        ca: Arc<CertificateAuthority>,
    ) -> Result<Self> {
        Ok(Self {
            sessions,
            policy,
            log,
            ca,
            upstream: Upstream::new(config)?,
            max_body: config.max_body_bytes,
            handshake_timeout: Duration::from_millis(config.handshake_timeout_ms),
            limiter: Arc::new(Semaphore::new(config.max_connections.max(1))),
        })
    }

    /// Accept connections until `shutdown` fires.
    pub async fn serve(self: Arc<Self>, listener: TcpListener, shutdown: CancellationToken) -> Result<()> {
        if let Ok(addr) = listener.local_addr() {
            tracing::info!(addr = %addr, "Traffic engine listening");
        }

        loop {
            let permit = tokio::select! {
                _ = shutdown.cancelled() => break,
                permit = self.limiter.clone().acquire_owned() => permit
                    .map_err(|e| Error::Traffic(format!("connection limiter closed: {}", e)))?,
            };

            let (stream, peer) = tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        tracing::warn!(error = %e, "Accept failed");
                        continue;
                    }
                },
            };

            let engine = self.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                let _permit = permit;
                tokio::select! {
                    _ = shutdown.cancelled() => {}
                    result = engine.handle_connection(stream, peer) => {
                        if let Err(e) = result {
                            tracing::debug!(peer = %peer, error = %e, "Connection ended with error");
                        }
                    }
                }
            });
        }

        tracing::info!("Traffic engine stopped");
        Ok(())
    }

    async fn handle_connection(&self, stream: TcpStream, peer: SocketAddr) -> Result<()> {
        let _ = stream.set_nodelay(true);
        let session = self.sessions.by_addr(peer.ip().to_canonical()).await;

        match session.clone() {
            Some(owner) => {
                tokio::select! {
                    _ = owner.cancelled() => {
                        tracing::debug!(session = %owner.id(), "Session ended; closing connection");
                        Ok(())
                    }
                    result = self.dispatch(stream, session) => result,
                }
            }
            None => self.dispatch(stream, None).await,
        }
    }

    async fn dispatch(&self, stream: TcpStream, session: Option<Arc<Session>>) -> Result<()> {
        if self.peek_tls(&stream).await? {
            let (tls, host, _) = self.intercept(stream, None).await?;
            let dest = Destination {
                scheme: Scheme::Https,
                host,
                port: Scheme::Https.default_port(),
                conflicting: None,
            };
            return self.serve_one(tls, dest, session).await;
        }

        let mut framed = FramedRead::new(stream, RequestCodec::new(self.max_body));
        let first = framed.next().await;
        let pipelined = !framed.read_buffer().is_empty();
        let mut stream = framed.into_inner();

        let raw = match first {
            Some(Ok(raw)) if raw.method.eq_ignore_ascii_case("CONNECT") => raw,
            Some(other) => return self.handle_request(other, None, &mut stream, session).await,
            None => return Ok(()),
        };

        let Some((host, port)) = split_authority(&raw.target, Scheme::Https.default_port()) else {
            let malformed = Err(FramingError::Malformed(format!(
                "invalid CONNECT target '{}'",
                raw.target
            )));
            return self.handle_request(malformed, None, &mut stream, session).await;
        };
        if pipelined {
            return Err(Error::Traffic(
                "data sent before the tunnel was established".to_string(),
            ));
        }

        stream.write_all(CONNECT_ESTABLISHED).await?;

        if self.peek_tls(&stream).await? {
            let (tls, tls_host, sni) = self.intercept(stream, Some(host.clone())).await?;
            let conflicting = sni.filter(|sni| *sni != host).map(|_| host);
            let dest = Destination {
                scheme: Scheme::Https,
                host: tls_host,
                port,
                conflicting,
            };
            self.serve_one(tls, dest, session).await
        } else {
            let dest = Destination {
                scheme: Scheme::Http,
                host,
                port,
                conflicting: None,
            };
            self.serve_one(stream, dest, session).await
        }
    }

    /// Whether the next byte from the session opens a TLS handshake.
    async fn peek_tls(&self, stream: &TcpStream) -> Result<bool> {
        let mut first = [0u8; 1];
        let n = tokio::time::timeout(self.handshake_timeout, stream.peek(&mut first))
            .await
            .map_err(|_| Error::Traffic("session sent nothing".to_string()))??;
        Ok(n == 1 && first[0] == TLS_HANDSHAKE)
    }

    /// Terminate the session's TLS with a leaf for the requested host.
    /// Returns the stream, the host the leaf was issued for and the SNI.
    async fn intercept(
        &self,
        stream: TcpStream,
        fallback: Option<String>,
    ) -> Result<(tokio_rustls::server::TlsStream<TcpStream>, String, Option<String>)> {
        let acceptor = LazyConfigAcceptor::new(rustls::server::Acceptor::default(), stream);
        let start = tokio::time::timeout(self.handshake_timeout, acceptor)
            .await
            .map_err(|_| Error::Tls("ClientHello timed out".to_string()))?
            .map_err(|e| Error::Tls(format!("invalid ClientHello: {}", e)))?;

        let sni = start
            .client_hello()
            .server_name()
            .map(|name| name.to_ascii_lowercase());
        let host = sni
            .clone()
            .or(fallback)
            .ok_or_else(|| Error::Tls("no SNI and no tunnel host".to_string()))?;

        let config = self.ca.server_config(&host)?;
        let tls = tokio::time::timeout(self.handshake_timeout, start.into_stream(config))
            .await
            .map_err(|_| Error::Tls(format!("handshake for {} timed out", host)))?
            .map_err(|e| Error::Tls(format!("handshake for {} failed: {}", host, e)))?;
        Ok((tls, host, sni))
    }

    async fn serve_one<S: Io>(
        &self,
        stream: S,
        dest: Destination,
        session: Option<Arc<Session>>,
    ) -> Result<()> {
        let mut framed = FramedRead::new(stream, RequestCodec::new(self.max_body));
        let Some(raw) = framed.next().await else {
            return Ok(());
        };
        let mut stream = framed.into_inner();
        self.handle_request(raw, Some(dest), &mut stream, session).await
    }

    async fn handle_request<S: Io>(
        &self,
        raw: std::result::Result<RawRequest, FramingError>,
        dest: Option<Destination>,
        client: &mut S,
        session: Option<Arc<Session>>,
    ) -> Result<()> {
        let (request, verdict) = self.decide(raw, dest.as_ref(), session.as_ref()).await;
        self.record(&request, &verdict).await;

        if let Verdict::Deny { reason, message } = &verdict {
            write_status(client, 403, "Forbidden", Some(reason.code()), message).await?;
            return Ok(());
        }

        let mut upstream = match self
            .upstream
            .connect(request.scheme, &request.host, request.port)
            .await
        {
            Ok(upstream) => upstream,
            Err(e) => {
                tracing::warn!(
                    session = ?request.session_id,
                    host = %request.host,
                    error = %e,
                    "Upstream unavailable"
                );
                write_status(client, 502, "Bad Gateway", None, &e.to_string()).await?;
                return Ok(());
            }
        };

        upstream.write_all(&encode_upstream(&request)).await?;
        upstream.flush().await?;

        let relayed = tokio::io::copy(&mut upstream, client).await;
        let _ = client.shutdown().await;
        match relayed {
            Ok(bytes) => {
                tracing::debug!(host = %request.host, bytes, "Response relayed");
                Ok(())
            }
            Err(e) => Err(Error::Upstream(format!(
                "relay from {} failed: {}",
                request.host, e
            ))),
        }
    }

    /// Build the canonical request and its verdict. Every failure is a
    /// denial.
    async fn decide(
        &self,
        raw: std::result::Result<RawRequest, FramingError>,
        dest: Option<&Destination>,
        session: Option<&Arc<Session>>,
    ) -> (TrafficRequest, Verdict) {
        let session_id = session.map(|s| s.id().to_string());

        let raw = match raw {
            Ok(raw) => raw,
            Err(e) => {
                let reason = match e {
                    FramingError::TooLarge { .. } => DenyReason::BodyTooLarge,
                    _ => DenyReason::MalformedTraffic,
                };
                return (
                    placeholder(dest, session_id),
                    Verdict::deny(reason, e.to_string()),
                );
            }
        };

        let request = match canonicalize(raw, dest, session_id.clone()) {
            Ok(request) => request,
            Err((request, verdict)) => return (*request, verdict),
        };

        let Some(session) = session else {
            return (
                request,
                Verdict::deny(
                    DenyReason::UnregisteredSession,
                    "traffic from an unregistered source address",
                ),
            );
        };

        let verdict = self.policy.evaluate(&request).await;
        if !self.sessions.is_live(session).await {
            return (
                request,
                Verdict::deny(
                    DenyReason::SessionDeregistered,
                    format!("session '{}' was deregistered", session.id()),
                ),
            );
        }
        (request, verdict)
    }

    async fn record(&self, request: &TrafficRequest, verdict: &Verdict) {
        let session = request.session_id.as_deref().unwrap_or("-");
        match verdict {
            Verdict::Deny { reason, message } => tracing::warn!(
                session = %session,
                method = %request.method,
                host = %request.host,
                path = %request.path,
                reason = %reason,
                "Request denied: {}",
                message
            ),
            _ => tracing::info!(
                session = %session,
                method = %request.method,
                host = %request.host,
                path = %request.path,
                verdict = %verdict,
                "Request allowed"
            ),
        }

        let subject = Subject::Request {
            method: request.method.clone(),
            scheme: request.scheme.to_string(),
            host: request.host.clone(),
            port: request.port,
            path: request.path.clone(),
        };
        if let Err(e) = self
            .log
            .record(request.session_id.clone(), subject, verdict)
            .await
        {
            tracing::error!(session = %session, error = %e, "Failed to record decision");
        }
    }
}

type Rejected = (Box<TrafficRequest>, Verdict);

/// Attach the destination to a decoded request and apply the transport
/// checks: host agreement and no protocol upgrades.
fn canonicalize(
    raw: RawRequest,
    dest: Option<&Destination>,
    session_id: Option<String>,
) -> std::result::Result<TrafficRequest, Rejected> {
    let absolute = parse_absolute(&raw.target);

    let (scheme, host, port, path, query, pinned) = match (dest, absolute) {
        (Some(dest), Some((_, host, port, path, query))) => {
            if host != dest.host || port != dest.port {
                let request = from_raw(&raw, dest.scheme, &dest.host, dest.port, &path, query, session_id);
                return Err(reject(
                    request,
                    DenyReason::HostMismatch,
                    format!("request names {} inside a tunnel to {}", host, dest.host),
                ));
            }
            (dest.scheme, dest.host.clone(), dest.port, path, query, true)
        }
        (Some(dest), None) => {
            let (path, query) = split_target(&raw.target);
            (dest.scheme, dest.host.clone(), dest.port, path, query, true)
        }
        (None, Some((scheme, host, port, path, query))) => (scheme, host, port, path, query, true),
        (None, None) => {
            let (path, query) = split_target(&raw.target);
            match raw
                .headers
                .get_str("host")
                .and_then(|h| split_authority(h, Scheme::Http.default_port()))
            {
                Some((host, port)) if raw.target.starts_with('/') => {
                    (Scheme::Http, host, port, path, query, false)
                }
                _ => {
                    let request = from_raw(&raw, Scheme::Http, "-", 0, &path, query, session_id);
                    return Err(reject(
                        request,
                        DenyReason::MalformedTraffic,
                        "request has no usable destination host",
                    ));
                }
            }
        }
    };

    let Some(path) = normalize_path(&path) else {
        let request = from_raw(&raw, scheme, &host, port, &path, query, session_id);
        return Err(reject(
            request,
            DenyReason::MalformedTraffic,
            format!("request path '{}' has no unambiguous canonical form", path),
        ));
    };
    let request = from_raw(&raw, scheme, &host, port, &path, query, session_id);

    if let Some(tunnel) = dest.and_then(|d| d.conflicting.as_ref()) {
        return Err(reject(
            request,
            DenyReason::HostMismatch,
            format!("TLS server name {} does not match tunnel host {}", host, tunnel),
        ));
    }

    if pinned {
        if let Some(header) = request.headers.get_str("host").map(str::to_string) {
            let named = split_authority(&header, scheme.default_port()).map(|(h, _)| h);
            if named.as_deref() != Some(host.as_str()) {
                return Err(reject(
                    request,
                    DenyReason::HostMismatch,
                    format!("Host header '{}' does not match destination {}", header, host),
                ));
            }
        }
    }

    if request.headers.contains("upgrade") || request.headers.has_token("connection", "upgrade") {
        return Err(reject(
            request,
            DenyReason::ProtocolUpgrade,
            "protocol upgrades cannot be inspected",
        ));
    }

    Ok(request)
}

fn reject(request: TrafficRequest, reason: DenyReason, message: impl Into<String>) -> Rejected {
    (Box::new(request), Verdict::deny(reason, message))
}

fn from_raw(
    raw: &RawRequest,
    scheme: Scheme,
    host: &str,
    port: u16,
    path: &str,
    query: Option<String>,
    session_id: Option<String>,
) -> TrafficRequest {
    TrafficRequest {
        method: raw.method.to_ascii_uppercase(),
        scheme,
        host: host.to_ascii_lowercase(),
        port,
        path: path.to_string(),
        query,
        headers: raw.headers.clone(),
        body: raw.body.clone(),
        session_id,
    }
}

/// Stand-in subject for requests that could not be decoded.
fn placeholder(dest: Option<&Destination>, session_id: Option<String>) -> TrafficRequest {
    TrafficRequest {
        method: "-".to_string(),
        scheme: dest.map_or(Scheme::Http, |d| d.scheme),
        host: dest.map_or_else(|| "-".to_string(), |d| d.host.clone()),
        port: dest.map_or(0, |d| d.port),
        path: String::new(),
        query: None,
        headers: Default::default(),
        body: Default::default(),
        session_id,
    }
}

/// Parse an absolute-form target into scheme, host, port, path and query.
fn parse_absolute(target: &str) -> Option<(Scheme, String, u16, String, Option<String>)> {
    let lower = target.get(..8).unwrap_or(target).to_ascii_lowercase();
    let (scheme, rest) = if lower.starts_with("http://") {
        (Scheme::Http, &target[7..])
    } else if lower.starts_with("https://") {
        (Scheme::Https, &target[8..])
    } else {
        return None;
    };

    let split = rest.find(['/', '?']).unwrap_or(rest.len());
    let (authority, remainder) = rest.split_at(split);
    if authority.is_empty() || authority.contains('@') {
        return None;
    }
    let (host, port) = split_authority(authority, scheme.default_port())?;
    let remainder = if remainder.starts_with('?') || remainder.is_empty() {
        format!("/{}", remainder)
    } else {
        remainder.to_string()
    };
    let (path, query) = split_target(&remainder);
    Some((scheme, host, port, path, query))
}

async fn write_status<S: AsyncWrite + Unpin>(
    client: &mut S,
    status: u16,
    phrase: &str,
    reason: Option<&str>,
    message: &str,
) -> std::io::Result<()> {
    let body = match reason {
        Some(code) => format!("sandgate: request denied ({}): {}\n", code, message),
        None => format!("sandgate: {}\n", message),
    };
    let mut response = format!(
        "HTTP/1.1 {} {}\r\nContent-Type: text/plain; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n",
        status,
        phrase,
        body.len()
    );
    if let Some(code) = reason {
        response.push_str(&format!("X-Sandgate-Reason: {}\r\n", code));
    }
    response.push_str("\r\n");
    response.push_str(&body);

    client.write_all(response.as_bytes()).await?;
    client.flush().await?;
    client.shutdown().await
}
