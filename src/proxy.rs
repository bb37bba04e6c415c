//! Proxy server implementation
//! Owns the listener, terminates TLS and hands every request to the
//! dispatcher.

use crate::certificate::{self, CertificateStore};
use crate::config::TargetSpec;
use crate::dispatch::Dispatcher;
use crate::error::StartupError;
use crate::forward::Upstream;
use crate::routing::RouteTable;
use crate::target::{self, TargetDefinition};
use anyhow::{anyhow, Context, Result};
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper::Request;
use hyper_util::rt::{TokioExecutor, TokioIo, TokioTimer};
use hyper_util::server::conn::auto;
use rustls::ServerConfig;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{sleep, timeout};
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

/// Proxy server configuration
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    pub listen_addr: SocketAddr,
    /// Upper bound on a client's TLS handshake.
    pub handshake_timeout: Duration,
    /// Upper bound on reading an HTTP/1 request head.
    pub header_read_timeout: Duration,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 443)),
            handshake_timeout: Duration::from_secs(10),
            header_read_timeout: Duration::from_secs(30),
        }
    }
}

/// Build the TLS 1.3-only server config around the certificate store.
pub fn server_tls_config(store: CertificateStore) -> Result<ServerConfig, rustls::Error> {
    let mut config = ServerConfig::builder_with_provider(certificate::provider())
        .with_protocol_versions(&[&rustls::version::TLS13])?
        .with_no_client_auth()
        .with_cert_resolver(Arc::new(store));
    config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];
    Ok(config)
}

/// A fully initialized proxy that has not opened any socket yet.
pub struct ProxyServer {
    config: ProxyConfig,
    dispatcher: Arc<Dispatcher>,
    tls_config: Arc<ServerConfig>,
}

impl ProxyServer {
    /// Load certificates and build routes. Nothing listens until `bind`.
    pub fn new(config: ProxyConfig, definitions: &[TargetDefinition]) -> Result<Self, StartupError> {
        Self::with_upstream(config, definitions, Upstream::webpki()?)
    }

    /// Like `new`, with explicit settings for reaching `https` backends.
    pub fn with_upstream(
        config: ProxyConfig,
        definitions: &[TargetDefinition],
        upstream: Upstream,
    ) -> Result<Self, StartupError> {
        if definitions.is_empty() {
            return Err(StartupError::NoTargets);
        }

        let store = CertificateStore::load(definitions)?;
        let routes = RouteTable::build(definitions, &upstream)?;
        let tls_config = server_tls_config(store)?;

        info!("Initialized {} virtual hosts", routes.len());

        Ok(Self {
            config,
            dispatcher: Arc::new(Dispatcher::new(routes)),
            tls_config: Arc::new(tls_config),
        })
    }

    /// Validate raw target sets and initialize.
    pub fn from_specs(config: ProxyConfig, specs: &[TargetSpec]) -> Result<Self, StartupError> {
        let definitions = target::load_targets(specs)?;
        Self::new(config, &definitions)
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn tls_config(&self) -> Arc<ServerConfig> {
        self.tls_config.clone()
    }

    /// Open the listening socket.
    pub async fn bind(self) -> Result<BoundProxy> {
        let listener = TcpListener::bind(self.config.listen_addr)
            .await
            .with_context(|| format!("Failed to bind {}", self.config.listen_addr))?;

        Ok(BoundProxy {
            listener,
            acceptor: TlsAcceptor::from(self.tls_config),
            dispatcher: self.dispatcher,
            config: self.config,
        })
    }

    /// Bind and serve until the process exits.
    pub async fn run(self) -> Result<()> {
        self.bind().await?.serve().await
    }
}

/// A proxy with an open listener.
pub struct BoundProxy {
    listener: TcpListener,
    acceptor: TlsAcceptor,
    dispatcher: Arc<Dispatcher>,
    config: ProxyConfig,
}

impl BoundProxy {
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections forever. Per-connection failures never stop the loop.
    pub async fn serve(self) -> Result<()> {
        info!("Reverse proxy listening for connections on {}", self.local_addr()?);

        loop {
            let (stream, remote_addr) = match self.listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    // Usually fd exhaustion; back off instead of spinning.
                    warn!("Failed to accept connection: {}", e);
                    sleep(Duration::from_millis(100)).await;
                    continue;
                }
            };

            let acceptor = self.acceptor.clone();
            let dispatcher = self.dispatcher.clone();
            let config = self.config.clone();
            let span = info_span!("conn", id = %Uuid::new_v4(), peer = %remote_addr);

            tokio::spawn(
                async move {
                    if let Err(e) =
                        handle_connection(stream, remote_addr, acceptor, dispatcher, config).await
                    {
                        debug!("Connection from {} closed: {:#}", remote_addr, e);
                    }
                }
                .instrument(span),
            );
        }
    }
}

/// Terminate TLS on one connection and serve its requests.
async fn handle_connection(
    stream: TcpStream,
    remote_addr: SocketAddr,
    acceptor: TlsAcceptor,
    dispatcher: Arc<Dispatcher>,
    config: ProxyConfig,
) -> Result<()> {
    let tls_stream = timeout(config.handshake_timeout, acceptor.accept(stream))
        .await
        .context("TLS handshake timed out")?
        .context("TLS handshake failed")?;

    {
        let (_, session) = tls_stream.get_ref();
        debug!(
            "TLS established with {} (server name {:?}, alpn {:?})",
            remote_addr,
            session.server_name(),
            session
                .alpn_protocol()
                .map(|p| String::from_utf8_lossy(p).into_owned())
        );
    }

    let io = TokioIo::new(tls_stream);

    let service = service_fn(move |req: Request<Incoming>| {
        let dispatcher = dispatcher.clone();
        async move { Ok::<_, Infallible>(dispatcher.dispatch(req, remote_addr).await) }
    });

    let mut builder = auto::Builder::new(TokioExecutor::new());
    builder
        .http1()
        .timer(TokioTimer::new())
        .header_read_timeout(config.header_read_timeout);

    builder
        .serve_connection(io, service)
        .await
        .map_err(|e| anyhow!("HTTP service error: {}", e))
}
