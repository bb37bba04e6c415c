//! Shared helpers for end-to-end tests: certificates, mock backends, a TLS
//! client and a running proxy.

#![allow(dead_code)]

use anyhow::{anyhow, Result};
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::client::conn::{http1 as client_http1, http2 as client_http2};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{HeaderMap, Method, Request, Response, StatusCode, Uri};
use hyper_util::rt::{TokioExecutor, TokioIo};
use rcgen::{
    BasicConstraints, Certificate, CertificateParams, DistinguishedName, DnType, IsCa,
};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivatePkcs8KeyDer, ServerName, UnixTime};
use rustls::{
    ClientConfig, DigitallySignedStruct, RootCertStore, ServerConfig, SignatureScheme,
    SupportedProtocolVersion,
};
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::{client, TlsAcceptor, TlsConnector};
use vhostproxy::{load_targets, ProxyConfig, ProxyServer, TargetSpec, Upstream};

pub fn provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

// ---------------------------------------------------------------------------
// Certificates
// ---------------------------------------------------------------------------

/// A self-signed identity written to disk for one domain.
pub struct TestIdentity {
    pub cert_der: CertificateDer<'static>,
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
}

/// Generate a self-signed certificate for `domain` (port stripped).
pub fn write_identity(dir: &Path, domain: &str) -> TestIdentity {
    let host = domain.split(':').next().unwrap_or(domain);
    let cert = rcgen::generate_simple_self_signed(vec![host.to_string()]).unwrap();

    let cert_pem = cert.serialize_pem().unwrap();
    let name = domain.replace(':', "_");
    let cert_path = dir.join(format!("{}.crt", name));
    let key_path = dir.join(format!("{}.key", name));
    fs::write(&cert_path, &cert_pem).unwrap();
    fs::write(&key_path, cert.serialize_private_key_pem()).unwrap();

    let cert_der = rustls_pemfile::certs(&mut cert_pem.as_bytes())
        .next()
        .unwrap()
        .unwrap();

    TestIdentity {
        cert_der,
        cert_path,
        key_path,
    }
}

/// A target set for `domain` with a fresh identity. Returns the served leaf too.
pub fn target(dir: &Path, domain: &str, backend: &str) -> (TargetSpec, CertificateDer<'static>) {
    let identity = write_identity(dir, domain);
    let spec = TargetSpec::new(domain, backend, identity.cert_path, identity.key_path);
    (spec, identity.cert_der)
}

/// A CA plus a `localhost` leaf it signed, for backends that speak TLS.
pub struct BackendPki {
    pub roots: RootCertStore,
    pub acceptor: TlsAcceptor,
}

pub fn backend_pki() -> BackendPki {
    let mut ca_params = CertificateParams::new(Vec::<String>::new());
    ca_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    let mut ca_name = DistinguishedName::new();
    ca_name.push(DnType::CommonName, "vhostproxy test CA");
    ca_params.distinguished_name = ca_name;
    let ca = Certificate::from_params(ca_params).unwrap();

    let leaf = Certificate::from_params(CertificateParams::new(vec!["localhost".to_string()]))
        .unwrap();
    let leaf_der = CertificateDer::from(leaf.serialize_der_with_signer(&ca).unwrap());
    let leaf_key = PrivatePkcs8KeyDer::from(leaf.serialize_private_key_der());

    let mut roots = RootCertStore::empty();
    roots
        .add(CertificateDer::from(ca.serialize_der().unwrap()))
        .unwrap();

    let config = ServerConfig::builder_with_provider(provider())
        .with_safe_default_protocol_versions()
        .unwrap()
        .with_no_client_auth()
        .with_single_cert(vec![leaf_der], leaf_key.into())
        .unwrap();

    BackendPki {
        roots,
        acceptor: TlsAcceptor::from(Arc::new(config)),
    }
}

// ---------------------------------------------------------------------------
// Mock backend
// ---------------------------------------------------------------------------

/// What a backend saw for one request.
#[derive(Debug, Clone)]
pub struct Recorded {
    pub method: Method,
    pub uri: Uri,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// Echo backend: answers 201 with `x-backend: <name>` and body `<name>|<request body>`.
pub struct Backend {
    pub addr: SocketAddr,
    connections: Arc<AtomicUsize>,
    requests: Arc<Mutex<Vec<Recorded>>>,
}

impl Backend {
    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<Recorded> {
        self.requests.lock().unwrap().clone()
    }
}

pub async fn spawn_backend(name: &'static str) -> Backend {
    spawn_backend_inner(name, None).await
}

pub async fn spawn_tls_backend(name: &'static str, acceptor: TlsAcceptor) -> Backend {
    spawn_backend_inner(name, Some(acceptor)).await
}

async fn spawn_backend_inner(name: &'static str, acceptor: Option<TlsAcceptor>) -> Backend {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let connections = Arc::new(AtomicUsize::new(0));
    let requests = Arc::new(Mutex::new(Vec::new()));

    let counter = connections.clone();
    let log = requests.clone();
    tokio::spawn(async move {
        loop {
            let (stream, _) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(_) => continue,
            };
            counter.fetch_add(1, Ordering::SeqCst);

            let acceptor = acceptor.clone();
            let log = log.clone();
            tokio::spawn(async move {
                match acceptor {
                    Some(acceptor) => {
                        if let Ok(tls) = acceptor.accept(stream).await {
                            serve_echo(TokioIo::new(tls), name, log).await;
                        }
                    }
                    None => serve_echo(TokioIo::new(stream), name, log).await,
                }
            });
        }
    });

    Backend {
        addr,
        connections,
        requests,
    }
}

async fn serve_echo<I>(io: I, name: &'static str, log: Arc<Mutex<Vec<Recorded>>>)
where
    I: hyper::rt::Read + hyper::rt::Write + Unpin + Send + 'static,
{
    let service = service_fn(move |req: Request<Incoming>| {
        let log = log.clone();
        async move {
            let (parts, body) = req.into_parts();
            let body = body.collect().await?.to_bytes();

            let mut echoed = format!("{}|", name).into_bytes();
            echoed.extend_from_slice(&body);

            log.lock().unwrap().push(Recorded {
                method: parts.method,
                uri: parts.uri,
                headers: parts.headers,
                body,
            });

            Ok::<_, hyper::Error>(
                Response::builder()
                    .status(StatusCode::CREATED)
                    .header("x-backend", name)
                    .header("keep-alive", "timeout=5")
                    .body(Full::new(Bytes::from(echoed)))
                    .unwrap(),
            )
        }
    });

    let _ = http1::Builder::new().serve_connection(io, service).await;
}

/// An address nothing listens on.
pub fn closed_port_url() -> String {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    format!("http://127.0.0.1:{}", port)
}

// ---------------------------------------------------------------------------
// Proxy
// ---------------------------------------------------------------------------

pub fn local_config() -> ProxyConfig {
    ProxyConfig {
        listen_addr: "127.0.0.1:0".parse().unwrap(),
        handshake_timeout: Duration::from_secs(5),
        header_read_timeout: Duration::from_secs(5),
    }
}

pub async fn start_proxy(specs: &[TargetSpec]) -> SocketAddr {
    start_proxy_with(specs, Upstream::webpki().unwrap()).await
}

pub async fn start_proxy_with(specs: &[TargetSpec], upstream: Upstream) -> SocketAddr {
    let definitions = load_targets(specs).unwrap();
    let server = ProxyServer::with_upstream(local_config(), &definitions, upstream).unwrap();
    let bound = server.bind().await.unwrap();
    let addr = bound.local_addr().unwrap();
    tokio::spawn(bound.serve());
    addr
}

// ---------------------------------------------------------------------------
// TLS client
// ---------------------------------------------------------------------------

/// Accepts any server certificate but still checks handshake signatures.
#[derive(Debug)]
struct AcceptAnyCert {
    provider: Arc<CryptoProvider>,
}

impl ServerCertVerifier for AcceptAnyCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

/// Client-side TLS settings.
pub struct TestClient {
    connector: TlsConnector,
    http2: bool,
}

impl TestClient {
    /// TLS 1.3, HTTP/1.1, sends SNI.
    pub fn new() -> Self {
        Self::build(&[&rustls::version::TLS13], false, true)
    }

    /// TLS 1.3, HTTP/2 via ALPN.
    pub fn http2() -> Self {
        Self::build(&[&rustls::version::TLS13], true, true)
    }

    /// Never sends a server name.
    pub fn without_sni() -> Self {
        Self::build(&[&rustls::version::TLS13], false, false)
    }

    /// Refuses anything above TLS 1.2.
    pub fn tls12_only() -> Self {
        Self::build(&[&rustls::version::TLS12], false, true)
    }

    fn build(versions: &[&'static SupportedProtocolVersion], http2: bool, sni: bool) -> Self {
        let provider = provider();
        let mut config = ClientConfig::builder_with_provider(provider.clone())
            .with_protocol_versions(versions)
            .unwrap()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptAnyCert { provider }))
            .with_no_client_auth();
        config.enable_sni = sni;
        config.alpn_protocols = if http2 {
            vec![b"h2".to_vec()]
        } else {
            vec![b"http/1.1".to_vec()]
        };

        Self {
            connector: TlsConnector::from(Arc::new(config)),
            http2,
        }
    }

    /// Complete a TLS handshake presenting `server_name`, no HTTP on top.
    pub async fn handshake(
        &self,
        proxy: SocketAddr,
        server_name: &str,
    ) -> Result<client::TlsStream<TcpStream>> {
        let tcp = TcpStream::connect(proxy).await?;
        let name = ServerName::try_from(server_name.to_string())?;
        Ok(self.connector.connect(name, tcp).await?)
    }

    /// Open an HTTP connection over TLS presenting `server_name`.
    pub async fn connect(&self, proxy: SocketAddr, server_name: &str) -> Result<Session> {
        let tls = self.handshake(proxy, server_name).await?;

        let peer_certificate = tls
            .get_ref()
            .1
            .peer_certificates()
            .and_then(|certs| certs.first())
            .cloned()
            .ok_or_else(|| anyhow!("server sent no certificate"))?;

        let io = TokioIo::new(tls);
        let sender = if self.http2 {
            let (sender, conn) = client_http2::handshake(TokioExecutor::new(), io).await?;
            tokio::spawn(conn);
            Sender::Http2(sender)
        } else {
            let (sender, conn) = client_http1::handshake(io).await?;
            tokio::spawn(conn);
            Sender::Http1(sender)
        };

        Ok(Session {
            sender,
            peer_certificate,
        })
    }

    /// One request on a fresh connection.
    pub async fn request(
        &self,
        proxy: SocketAddr,
        server_name: &str,
        req: Request<Full<Bytes>>,
    ) -> Result<Reply> {
        self.connect(proxy, server_name).await?.send(req).await
    }
}

enum Sender {
    Http1(client_http1::SendRequest<Full<Bytes>>),
    Http2(client_http2::SendRequest<Full<Bytes>>),
}

/// An established client connection to the proxy.
pub struct Session {
    sender: Sender,
    pub peer_certificate: CertificateDer<'static>,
}

impl Session {
    pub async fn send(&mut self, req: Request<Full<Bytes>>) -> Result<Reply> {
        let response = match &mut self.sender {
            Sender::Http1(sender) => {
                sender.ready().await?;
                sender.send_request(req).await?
            }
            Sender::Http2(sender) => {
                sender.ready().await?;
                sender.send_request(req).await?
            }
        };

        let (parts, body) = response.into_parts();
        Ok(Reply {
            status: parts.status,
            headers: parts.headers,
            body: body.collect().await?.to_bytes(),
        })
    }
}

/// A fully read response.
#[derive(Debug)]
pub struct Reply {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// An HTTP/1.1 request with an explicit `Host` header.
pub fn get(host: &str, path: &str) -> Request<Full<Bytes>> {
    Request::builder()
        .uri(path)
        .header("host", host)
        .body(Full::new(Bytes::new()))
        .unwrap()
}
