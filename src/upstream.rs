//! Downstream calls to backends.
//!
//! Every forwarded request opens its own connection to the backend; nothing
//! is pooled or shared between requests. The request timeout bounds connect,
//! handshake and the wait for the response head, and then every gap between
//! two body frames. A streaming body that keeps producing data is never cut.

use crate::error::ProxyErrorCode;
use hyper::body::{Body, Bytes, Frame, Incoming, SizeHint};
use hyper::client::conn::http1;
use hyper::header::{CONTENT_LENGTH, HOST};
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use std::future::Future;
use std::net::{Ipv4Addr, SocketAddr};
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio::time::{Instant, Sleep};
use tracing::debug;

/// Errors from a single downstream call
#[derive(Debug, thiserror::Error)]
pub enum ForwardError {
    #[error("connection to {addr} failed: {source}")]
    Connect {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("HTTP handshake with {addr} failed: {source}")]
    Handshake {
        addr: SocketAddr,
        #[source]
        source: hyper::Error,
    },

    #[error("backend request failed: {0}")]
    Request(#[source] hyper::Error),

    #[error("backend did not respond within {} seconds", .0.as_secs())]
    Timeout(Duration),

    #[error("invalid downstream request: {0}")]
    Build(#[from] hyper::http::Error),
}

impl ForwardError {
    /// Error code reported to the caller
    pub fn code(&self) -> ProxyErrorCode {
        match self {
            ForwardError::Timeout(_) => ProxyErrorCode::RequestTimeout,
            _ => ProxyErrorCode::ConnectionFailed,
        }
    }
}

/// Address of a backend port on the loopback interface
pub fn backend_addr(port: u16) -> SocketAddr {
    SocketAddr::from((Ipv4Addr::LOCALHOST, port))
}

/// Rebuild an inbound request for the backend.
///
/// Method, body and every header pass through unchanged except `Host`, which
/// is set to the backend authority, and `Content-Length`, which the client
/// connection derives from the body.
pub fn build_downstream_request<B>(
    req: Request<B>,
    port: u16,
    target: &str,
) -> Result<Request<B>, hyper::http::Error> {
    let (parts, body) = req.into_parts();
    let mut builder = Request::builder().method(parts.method).uri(target);

    for (key, value) in parts.headers.iter() {
        if key == HOST || key == CONTENT_LENGTH {
            continue;
        }
        builder = builder.header(key, value);
    }

    builder
        .header(HOST, format!("{}", backend_addr(port)))
        .body(body)
}

/// Aborts the connection task unless disarmed
struct ConnectionGuard(Option<JoinHandle<()>>);

impl ConnectionGuard {
    fn disarm(mut self) {
        self.0.take();
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        if let Some(handle) = self.0.take() {
            handle.abort();
        }
    }
}

/// Backend response body with an idle timeout between frames.
///
/// Frames pass through untouched. If the backend sends nothing for the whole
/// timeout the body ends with [`ForwardError::Timeout`], which makes the
/// server abort the response to the caller.
#[derive(Debug)]
pub struct RelayBody {
    inner: Incoming,
    idle: Duration,
    deadline: Pin<Box<Sleep>>,
}

impl RelayBody {
    pub fn new(inner: Incoming, idle: Duration) -> Self {
        Self {
            inner,
            idle,
            deadline: Box::pin(tokio::time::sleep(idle)),
        }
    }
}

impl Body for RelayBody {
    type Data = Bytes;
    type Error = ForwardError;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Bytes>, ForwardError>>> {
        let this = self.get_mut();

        match Pin::new(&mut this.inner).poll_frame(cx) {
            Poll::Ready(frame) => {
                this.deadline.as_mut().reset(Instant::now() + this.idle);
                Poll::Ready(frame.map(|result| result.map_err(ForwardError::Request)))
            }
            Poll::Pending => match this.deadline.as_mut().poll(cx) {
                Poll::Ready(()) => Poll::Ready(Some(Err(ForwardError::Timeout(this.idle)))),
                Poll::Pending => Poll::Pending,
            },
        }
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

/// Send one request to the backend on `port` over a fresh connection.
///
/// If the returned future is dropped before the response head arrives (for
/// example because the caller hung up), the downstream connection is closed.
/// `timeout` also becomes the idle limit of the returned body.
pub async fn forward<B>(
    req: Request<B>,
    port: u16,
    timeout: Duration,
) -> Result<Response<RelayBody>, ForwardError>
where
    B: Body + Send + 'static,
    B::Data: Send,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    let addr = backend_addr(port);

    let exchange = async move {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|source| ForwardError::Connect { addr, source })?;
        let _ = stream.set_nodelay(true);

        let (mut sender, conn) = http1::handshake(TokioIo::new(stream))
            .await
            .map_err(|source| ForwardError::Handshake { addr, source })?;

        let guard = ConnectionGuard(Some(tokio::spawn(async move {
            if let Err(e) = conn.await {
                debug!(%addr, error = %e, "Backend connection closed with error");
            }
        })));

        let response = sender.send_request(req).await.map_err(ForwardError::Request)?;
        guard.disarm();
        Ok::<_, ForwardError>(response)
    };

    let response = tokio::time::timeout(timeout, exchange)
        .await
        .map_err(|_| ForwardError::Timeout(timeout))??;
    Ok(response.map(|body| RelayBody::new(body, timeout)))
}
