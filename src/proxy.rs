use crate::config::{Config, HEALTH_PREFIX};
use crate::error::{json_error_response, ProxyBody, ProxyErrorCode};
use crate::routing::{downstream_target, split_first_segment, RouteTable};
use crate::upstream::{self, build_downstream_request, ForwardError};
use http_body_util::{BodyExt, Full};
use hyper::body::{Body, Bytes, Incoming};
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Read-only state shared by every connection
#[derive(Debug)]
pub struct Router {
    routes: RouteTable,
    service_name: String,
    request_timeout: Duration,
}

impl Router {
    pub fn new(routes: RouteTable, service_name: impl Into<String>, request_timeout: Duration) -> Self {
        Self {
            routes,
            service_name: service_name.into(),
            request_timeout,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(
            RouteTable::from_backends(&config.backends),
            config.server.service_name.clone(),
            config.server.request_timeout(),
        )
    }

    pub fn routes(&self) -> &RouteTable {
        &self.routes
    }
}

/// The path-prefix reverse proxy
pub struct ProxyServer {
    bind_addr: SocketAddr,
    router: Arc<Router>,
    shutdown_rx: watch::Receiver<bool>,
}

impl ProxyServer {
    pub fn new(bind_addr: SocketAddr, router: Router, shutdown_rx: watch::Receiver<bool>) -> Self {
        Self {
            bind_addr,
            router: Arc::new(router),
            shutdown_rx,
        }
    }

    pub fn from_config(config: &Config, shutdown_rx: watch::Receiver<bool>) -> anyhow::Result<Self> {
        let bind_addr: SocketAddr = format!("{}:{}", config.server.bind, config.server.port)
            .parse()
            .map_err(|e| anyhow::anyhow!("Invalid bind address '{}': {}", config.server.bind, e))?;
        Ok(Self::new(bind_addr, Router::from_config(config), shutdown_rx))
    }

    pub fn bind_addr(&self) -> SocketAddr {
        self.bind_addr
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to bind {}: {}", self.bind_addr, e))?;
        self.serve(listener).await
    }

    /// Serve on an already bound listener until shutdown is signalled
    pub async fn serve(self, listener: TcpListener) -> anyhow::Result<()> {
        let local_addr = listener.local_addr()?;
        info!(
            addr = %local_addr,
            routes = self.router.routes().routes().len(),
            "Router listening (HTTP/1.1 and HTTP/2)"
        );

        let mut shutdown_rx = self.shutdown_rx.clone();
        if *shutdown_rx.borrow() {
            return Ok(());
        }

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let router = Arc::clone(&self.router);
                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(stream, addr, router).await {
                                    debug!(addr = %addr, error = %e, "Connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        info!("Router shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    router: Arc<Router>,
) -> anyhow::Result<()> {
    let _ = stream.set_nodelay(true);
    let io = TokioIo::new(stream);

    let service = service_fn(move |req: Request<Incoming>| {
        let router = Arc::clone(&router);
        async move { handle_request(req, router, addr).await }
    });

    AutoBuilder::new(TokioExecutor::new())
        .http1()
        .preserve_header_case(true)
        .http2()
        .max_concurrent_streams(250)
        .serve_connection(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Connection error: {}", e))?;

    Ok(())
}

pub(crate) async fn handle_request<B>(
    req: Request<B>,
    router: Arc<Router>,
    client_addr: SocketAddr,
) -> Result<Response<ProxyBody>, hyper::Error>
where
    B: Body + Send + 'static,
    B::Data: Send,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    let path = req.uri().path();

    if let Some((HEALTH_PREFIX, "/")) = split_first_segment(path) {
        return Ok(health_response(&router.service_name));
    }

    let Some(matched) = router.routes().resolve(path) else {
        debug!(method = %req.method(), path, client = %client_addr, "No route for request");
        return Ok(json_error_response(
            ProxyErrorCode::UnknownRoute,
            "No backend configured for this path",
        ));
    };

    let request_id = Uuid::new_v4();
    let backend = matched.route.name.clone();
    let port = matched.route.port;
    let target = downstream_target(matched.rest, req.uri().query());

    debug!(
        %request_id,
        backend,
        port,
        method = %req.method(),
        target,
        client = %client_addr,
        "Forwarding request"
    );

    let result = match build_downstream_request(req, port, &target) {
        Ok(downstream) => upstream::forward(downstream, port, router.request_timeout).await,
        Err(e) => Err(ForwardError::from(e)),
    };

    match result {
        Ok(response) => {
            debug!(%request_id, backend, status = %response.status(), "Relaying response");
            Ok(response.map(|body| body.boxed()))
        }
        Err(e) => {
            warn!(%request_id, backend, port, error = %e, "Backend call failed");
            Ok(json_error_response(e.code(), format!("Proxy error: {}", e)))
        }
    }
}

fn health_response(service_name: &str) -> Response<ProxyBody> {
    let body = serde_json::json!({
        "status": "ok",
        "service": service_name,
    });

    Response::builder()
        .status(StatusCode::OK)
        .header(hyper::header::CONTENT_TYPE, "application/json")
        .body(
            Full::new(Bytes::from(body.to_string()))
                .map_err(|never| match never {})
                .boxed(),
        )
        .expect("valid response with static status and headers")
}
