//! Request forwarding
//! A single-backend reverse proxy: relays one request to the backend and
//! streams the backend's response back unchanged apart from hop-by-hop
//! headers.

use crate::certificate;
use anyhow::{anyhow, Context, Result};
use bytes::Bytes;
use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::{Body, Incoming};
use hyper::header::{
    HeaderName, HeaderValue, CONNECTION, CONTENT_TYPE, HOST, PROXY_AUTHENTICATE,
    PROXY_AUTHORIZATION, TE, TRAILER, TRANSFER_ENCODING, UPGRADE,
};
use hyper::{HeaderMap, Request, Response, StatusCode, Uri, Version};
use hyper_util::rt::TokioIo;
use rustls::pki_types::ServerName;
use rustls::{ClientConfig, RootCertStore};
use std::error::Error as StdError;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tracing::{debug, warn};
use url::Url;

/// Response body type shared by everything the proxy answers with.
pub type ProxyBody = BoxBody<Bytes, hyper::Error>;

static X_FORWARDED_FOR: HeaderName = HeaderName::from_static("x-forwarded-for");
static X_FORWARDED_HOST: HeaderName = HeaderName::from_static("x-forwarded-host");
static X_FORWARDED_PROTO: HeaderName = HeaderName::from_static("x-forwarded-proto");

/// Headers that describe a single connection and are never relayed.
static HOP_BY_HOP: [HeaderName; 9] = [
    CONNECTION,
    HeaderName::from_static("keep-alive"),
    HeaderName::from_static("proxy-connection"),
    PROXY_AUTHENTICATE,
    PROXY_AUTHORIZATION,
    TE,
    TRAILER,
    TRANSFER_ENCODING,
    UPGRADE,
];

/// Connection settings for reaching backends.
#[derive(Clone)]
pub struct Upstream {
    tls: TlsConnector,
}

impl Upstream {
    /// Trust the public web PKI for `https` backends.
    pub fn webpki() -> Result<Self, rustls::Error> {
        let mut roots = RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        Self::with_roots(roots)
    }

    /// Trust only `roots` for `https` backends.
    pub fn with_roots(roots: RootCertStore) -> Result<Self, rustls::Error> {
        let mut config = ClientConfig::builder_with_provider(certificate::provider())
            .with_safe_default_protocol_versions()?
            .with_root_certificates(roots)
            .with_no_client_auth();
        config.alpn_protocols = vec![b"http/1.1".to_vec()];

        Ok(Self {
            tls: TlsConnector::from(Arc::new(config)),
        })
    }
}

/// Forwarding handler bound to one backend.
pub struct ReverseProxy {
    backend: Url,
    upstream: Upstream,
}

impl ReverseProxy {
    /// Only the backend's scheme and authority are used; its path is ignored.
    pub fn new(backend: Url, upstream: Upstream) -> Self {
        Self { backend, upstream }
    }

    pub fn backend(&self) -> &Url {
        &self.backend
    }

    /// Relay `req` to the backend.
    ///
    /// Any failure reaching the backend is answered with 502 for this request
    /// only. Dropping the returned future abandons the backend call.
    pub async fn forward<B>(&self, req: Request<B>, remote_addr: SocketAddr) -> Response<ProxyBody>
    where
        B: Body<Data = Bytes> + Send + 'static,
        B::Error: Into<Box<dyn StdError + Send + Sync>>,
    {
        let method = req.method().clone();
        let path = req.uri().path().to_string();

        match self.try_forward(req, remote_addr).await {
            Ok(response) => {
                debug!(
                    "{} {} -> {} {}",
                    method,
                    path,
                    self.backend,
                    response.status()
                );
                response
            }
            Err(e) => {
                warn!("Backend {} failed for {} {}: {:#}", self.backend, method, path, e);
                text_response(StatusCode::BAD_GATEWAY, "Bad Gateway\n")
            }
        }
    }

    async fn try_forward<B>(&self, req: Request<B>, remote_addr: SocketAddr) -> Result<Response<ProxyBody>>
    where
        B: Body<Data = Bytes> + Send + 'static,
        B::Error: Into<Box<dyn StdError + Send + Sync>>,
    {
        let proxy_req = rewrite_request(req, remote_addr)?;

        let host = self
            .backend
            .host_str()
            .ok_or_else(|| anyhow!("backend URL has no host"))?;
        let port = self
            .backend
            .port_or_known_default()
            .ok_or_else(|| anyhow!("backend URL has no port"))?;

        // IPv6 literals arrive bracketed.
        let host = host.trim_start_matches('[').trim_end_matches(']');

        let stream = TcpStream::connect((host, port))
            .await
            .with_context(|| format!("failed to connect to {}:{}", host, port))?;

        let response = if self.backend.scheme() == "https" {
            let server_name = ServerName::try_from(host.to_string())
                .context("invalid backend server name")?;
            let tls_stream = self
                .upstream
                .tls
                .connect(server_name, stream)
                .await
                .context("backend TLS handshake failed")?;
            send_request(TokioIo::new(tls_stream), proxy_req).await?
        } else {
            send_request(TokioIo::new(stream), proxy_req).await?
        };

        let (mut parts, body) = response.into_parts();
        strip_hop_by_hop(&mut parts.headers);

        Ok(Response::from_parts(parts, body.boxed()))
    }
}

/// Send one request over a fresh HTTP/1.1 connection.
async fn send_request<I, B>(io: I, req: Request<B>) -> Result<Response<Incoming>>
where
    I: hyper::rt::Read + hyper::rt::Write + Unpin + Send + 'static,
    B: Body<Data = Bytes> + Send + 'static,
    B::Error: Into<Box<dyn StdError + Send + Sync>>,
{
    let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
        .await
        .context("Failed to establish connection to backend")?;

    tokio::spawn(async move {
        if let Err(e) = conn.await {
            debug!("Backend connection error: {}", e);
        }
    });

    sender
        .send_request(req)
        .await
        .context("Failed to send request to backend")
}

/// Turn a client request into the request sent to the backend.
///
/// Keeps method, path, query, body and end-to-end headers. The declared
/// host goes out as `Host`; a URI authority (absolute form, HTTP/2) wins
/// over the client's `Host` header.
pub(crate) fn rewrite_request<B>(req: Request<B>, remote_addr: SocketAddr) -> Result<Request<B>> {
    let (mut parts, body) = req.into_parts();

    let host = match parts.uri.authority() {
        Some(authority) => {
            Some(HeaderValue::from_str(authority.as_str()).context("Invalid authority")?)
        }
        None => parts.headers.get(HOST).cloned(),
    };

    let path_and_query = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    parts.uri = path_and_query.parse::<Uri>().context("Invalid URI")?;
    parts.version = Version::HTTP_11;

    strip_hop_by_hop(&mut parts.headers);

    let mut forwarded_for = parts
        .headers
        .get_all(&X_FORWARDED_FOR)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .collect::<Vec<_>>()
        .join(", ");
    if !forwarded_for.is_empty() {
        forwarded_for.push_str(", ");
    }
    forwarded_for.push_str(&remote_addr.ip().to_string());
    parts.headers.insert(
        X_FORWARDED_FOR.clone(),
        HeaderValue::from_str(&forwarded_for).context("Invalid X-Forwarded-For")?,
    );

    if let Some(host) = host {
        parts.headers.insert(HOST, host.clone());
        parts.headers.insert(X_FORWARDED_HOST.clone(), host);
    }
    parts
        .headers
        .insert(X_FORWARDED_PROTO.clone(), HeaderValue::from_static("https"));

    Ok(Request::from_parts(parts, body))
}

/// Remove hop-by-hop headers, including any named by `Connection`.
pub(crate) fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let listed: Vec<HeaderName> = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();

    for name in listed {
        headers.remove(name);
    }
    for name in &HOP_BY_HOP {
        headers.remove(name);
    }
}

/// Create text response
pub fn text_response(status: StatusCode, body: &'static str) -> Response<ProxyBody> {
    let mut response = Response::new(full_body(Bytes::from_static(body.as_bytes())));
    *response.status_mut() = status;
    response.headers_mut().insert(
        CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    response.headers_mut().insert(
        HeaderName::from_static("x-content-type-options"),
        HeaderValue::from_static("nosniff"),
    );
    response
}

/// Create full body
fn full_body(bytes: Bytes) -> ProxyBody {
    Full::new(bytes).map_err(|never| match never {}).boxed()
}
