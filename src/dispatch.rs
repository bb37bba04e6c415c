//! Per-request dispatch
//! Looks up the declared host and either forwards or answers 404.

use crate::forward::{text_response, ProxyBody, ReverseProxy};
use crate::routing::{Resolve, RouteTable};
use bytes::Bytes;
use hyper::body::Body;
use hyper::header::HOST;
use hyper::{Request, Response, StatusCode};
use std::error::Error as StdError;
use std::net::SocketAddr;
use tracing::debug;

/// Entry point for every decrypted request.
pub struct Dispatcher<R = RouteTable> {
    routes: R,
}

impl<R: Resolve> Dispatcher<R> {
    pub fn new(routes: R) -> Self {
        Self { routes }
    }

    pub fn routes(&self) -> &R {
        &self.routes
    }

    /// Handler for an exact declared host, port included.
    pub fn route(&self, host: &str) -> Option<&ReverseProxy> {
        self.routes.resolve(host)
    }

    /// Forward `req` to its domain's backend, or answer 404 without any
    /// outbound connection.
    pub async fn dispatch<B>(&self, req: Request<B>, remote_addr: SocketAddr) -> Response<ProxyBody>
    where
        B: Body<Data = Bytes> + Send + 'static,
        B::Error: Into<Box<dyn StdError + Send + Sync>>,
    {
        let host = declared_host(&req).unwrap_or_default();

        match self.route(host) {
            Some(proxy) => proxy.forward(req, remote_addr).await,
            None => {
                debug!(
                    "No route for host {:?} ({} {} from {})",
                    host,
                    req.method(),
                    req.uri().path(),
                    remote_addr
                );
                not_found()
            }
        }
    }
}

/// The host a request was sent to: the URI authority when there is one
/// (absolute-form HTTP/1.1, HTTP/2 `:authority`), else the `Host` header.
pub fn declared_host<B>(req: &Request<B>) -> Option<&str> {
    match req.uri().authority() {
        Some(authority) => Some(authority.as_str()),
        None => req.headers().get(HOST).and_then(|host| host.to_str().ok()),
    }
}

fn not_found() -> Response<ProxyBody> {
    text_response(StatusCode::NOT_FOUND, "Not Found\n")
}
