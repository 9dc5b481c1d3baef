//! Integration tests for coder2api

use std::convert::Infallible;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use coder2api::config::{BackendConfig, Config};
use coder2api::process::ProcessState;
use coder2api::proxy::{ProxyServer, Router};
use coder2api::routing::{Route, RouteTable};
use coder2api::supervisor::{Foreground, ForegroundExit, ShutdownSignals, Supervisor, SupervisorState};
use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::header::HeaderMap;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;

/// A request as seen by a stub backend
#[derive(Debug, Clone)]
struct Recorded {
    method: String,
    uri: String,
    headers: HeaderMap,
    body: Vec<u8>,
}

/// In-test HTTP backend that records every request it receives
struct StubBackend {
    port: u16,
    requests: Arc<Mutex<Vec<Recorded>>>,
    accepts: Arc<AtomicUsize>,
}

impl StubBackend {
    async fn start(name: &'static str) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let requests = Arc::new(Mutex::new(Vec::new()));
        let accepts = Arc::new(AtomicUsize::new(0));

        let stub_requests = Arc::clone(&requests);
        let stub_accepts = Arc::clone(&accepts);
        tokio::spawn(async move {
            loop {
                let (stream, _) = match listener.accept().await {
                    Ok(conn) => conn,
                    Err(_) => break,
                };
                stub_accepts.fetch_add(1, Ordering::SeqCst);
                let requests = Arc::clone(&stub_requests);
                tokio::spawn(async move {
                    let service = service_fn(move |req: Request<Incoming>| {
                        let requests = Arc::clone(&requests);
                        async move { stub_handle(name, req, requests).await }
                    });
                    let _ = http1::Builder::new()
                        .serve_connection(TokioIo::new(stream), service)
                        .await;
                });
            }
        });

        Self { port, requests, accepts }
    }

    fn requests(&self) -> Vec<Recorded> {
        self.requests.lock().clone()
    }

    fn route(&self, prefix: &str) -> Route {
        Route {
            prefix: prefix.to_string(),
            name: format!("stub-{}", prefix),
            port: self.port,
        }
    }
}

async fn stub_handle(
    name: &'static str,
    req: Request<Incoming>,
    requests: Arc<Mutex<Vec<Recorded>>>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    let (parts, body) = req.into_parts();
    let body = body
        .collect()
        .await
        .map(|b| b.to_bytes().to_vec())
        .unwrap_or_default();

    requests.lock().push(Recorded {
        method: parts.method.to_string(),
        uri: parts.uri.to_string(),
        headers: parts.headers.clone(),
        body,
    });

    match parts.uri.path() {
        "/slow" => tokio::time::sleep(Duration::from_millis(1500)).await,
        "/hang" => tokio::time::sleep(Duration::from_secs(60)).await,
        _ => {}
    }

    Ok(Response::builder()
        .status(201)
        .header("Content-Type", "application/x-stub")
        .header("X-Stub", name)
        .header("X-Trace", "abc123")
        .body(Full::new(Bytes::from(format!("stub:{}", name))))
        .unwrap())
}

/// Start a router on an ephemeral port
async fn start_router(routes: Vec<Route>, timeout: Duration) -> (u16, watch::Sender<bool>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let server = ProxyServer::new(
        addr,
        Router::new(RouteTable::new(routes), "coder2api", timeout),
        shutdown_rx,
    );
    tokio::spawn(server.serve(listener));
    (addr.port(), shutdown_tx)
}

/// A port nothing listens on
async fn closed_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

/// Wait for a port to become available (server listening)
async fn wait_for_port(port: u16, timeout: Duration) -> bool {
    let start = Instant::now();
    while start.elapsed() < timeout {
        if TcpStream::connect(format!("127.0.0.1:{}", port))
            .await
            .is_ok()
        {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    false
}

struct HttpResponse {
    status: u16,
    headers: Vec<(String, String)>,
    body: String,
}

impl HttpResponse {
    fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    fn json(&self) -> serde_json::Value {
        serde_json::from_str(&self.body).unwrap()
    }
}

/// Send a raw HTTP/1.1 request and read the whole response
async fn http_request(
    port: u16,
    method: &str,
    path: &str,
    headers: &[(&str, &str)],
    body: &str,
) -> Result<HttpResponse, Box<dyn std::error::Error + Send + Sync>> {
    let mut stream = TcpStream::connect(format!("127.0.0.1:{}", port)).await?;

    let mut request = format!("{} {} HTTP/1.1\r\n", method, path);
    if !headers.iter().any(|(k, _)| k.eq_ignore_ascii_case("host")) {
        request.push_str(&format!("Host: 127.0.0.1:{}\r\n", port));
    }
    for (key, value) in headers {
        request.push_str(&format!("{}: {}\r\n", key, value));
    }
    request.push_str(&format!("Content-Length: {}\r\nConnection: close\r\n\r\n{}", body.len(), body));
    stream.write_all(request.as_bytes()).await?;

    let mut raw = String::new();
    stream.read_to_string(&mut raw).await?;

    let (head, body) = raw.split_once("\r\n\r\n").ok_or("incomplete response")?;
    let mut lines = head.lines();
    let status_line = lines.next().ok_or("missing status line")?;
    let status = status_line
        .split_whitespace()
        .nth(1)
        .ok_or("missing status code")?
        .parse()?;
    let headers = lines
        .filter_map(|line| line.split_once(':'))
        .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        .collect();

    Ok(HttpResponse {
        status,
        headers,
        body: body.to_string(),
    })
}

async fn http_get(port: u16, path: &str) -> HttpResponse {
    http_request(port, "GET", path, &[], "").await.unwrap()
}

#[tokio::test]
async fn test_prefix_is_stripped_and_request_preserved() {
    let stub = StubBackend::start("codex").await;
    let (port, _shutdown) = start_router(vec![stub.route("codex")], Duration::from_secs(10)).await;

    let response = http_request(
        port,
        "POST",
        "/codex/v1/chat/completions?model=gpt-5&stream=true",
        &[
            ("Host", "client.example:9999"),
            ("Authorization", "Bearer secret-token"),
            ("Content-Type", "application/json"),
            ("X-Custom-Header", "keep-me"),
        ],
        r#"{"messages":[]}"#,
    )
    .await
    .unwrap();
    assert_eq!(response.status, 201);

    let requests = stub.requests();
    assert_eq!(requests.len(), 1);
    let seen = &requests[0];
    assert_eq!(seen.method, "POST");
    assert_eq!(seen.uri, "/v1/chat/completions?model=gpt-5&stream=true");
    assert_eq!(seen.body, br#"{"messages":[]}"#);

    // Host is recomputed for the backend, everything else passes through
    assert_eq!(
        seen.headers.get("host").unwrap(),
        &format!("127.0.0.1:{}", stub.port)
    );
    assert_eq!(seen.headers.get("content-length").unwrap(), "15");
    assert_eq!(seen.headers.get("authorization").unwrap(), "Bearer secret-token");
    assert_eq!(seen.headers.get("content-type").unwrap(), "application/json");
    assert_eq!(seen.headers.get("x-custom-header").unwrap(), "keep-me");
    assert!(seen.headers.get("x-request-id").is_none());
    assert!(seen.headers.get("x-forwarded-for").is_none());
}

#[tokio::test]
async fn test_bare_prefix_forwards_root() {
    let stub = StubBackend::start("cc").await;
    let (port, _shutdown) = start_router(vec![stub.route("cc")], Duration::from_secs(10)).await;

    assert_eq!(http_get(port, "/cc").await.status, 201);
    assert_eq!(http_get(port, "/cc/").await.status, 201);
    assert_eq!(http_get(port, "/cc?").await.status, 201);

    let uris: Vec<String> = stub.requests().into_iter().map(|r| r.uri).collect();
    assert_eq!(uris, vec!["/", "/", "/"]);
}

#[tokio::test]
async fn test_response_is_relayed_unchanged() {
    let stub = StubBackend::start("gemini").await;
    let (port, _shutdown) = start_router(vec![stub.route("gemini")], Duration::from_secs(10)).await;

    let response = http_request(port, "PUT", "/gemini/v1beta/models", &[], "x").await.unwrap();
    assert_eq!(response.status, 201);
    assert_eq!(response.header("content-type"), Some("application/x-stub"));
    assert_eq!(response.header("x-stub"), Some("gemini"));
    assert_eq!(response.header("x-trace"), Some("abc123"));
    assert_eq!(response.body, "stub:gemini");
}

#[tokio::test]
async fn test_routes_select_distinct_backends() {
    let codex = StubBackend::start("codex").await;
    let cc = StubBackend::start("cc").await;
    let (port, _shutdown) = start_router(
        vec![codex.route("codex"), cc.route("cc")],
        Duration::from_secs(10),
    )
    .await;

    assert_eq!(http_get(port, "/codex/a").await.body, "stub:codex");
    assert_eq!(http_get(port, "/cc/b").await.body, "stub:cc");
    assert_eq!(codex.requests().len(), 1);
    assert_eq!(cc.requests().len(), 1);
    assert_eq!(cc.requests()[0].uri, "/b");
}

#[tokio::test]
async fn test_closed_backend_returns_502_json_for_every_method() {
    let dead = closed_port().await;
    let (port, _shutdown) = start_router(
        vec![Route {
            prefix: "codex".into(),
            name: "chatmock".into(),
            port: dead,
        }],
        Duration::from_secs(10),
    )
    .await;

    for method in ["GET", "POST", "PUT", "DELETE", "PATCH", "OPTIONS"] {
        let response = http_request(port, method, "/codex/v1/models", &[], "").await.unwrap();
        assert_eq!(response.status, 502, "method {}", method);
        assert_eq!(response.header("content-type"), Some("application/json"));
        let json = response.json();
        let error = json["error"].as_str().unwrap();
        assert!(error.starts_with("Proxy error:"), "unexpected error: {}", error);
    }
}

#[tokio::test]
async fn test_unknown_prefix_is_404_without_downstream_connection() {
    let stub = StubBackend::start("codex").await;
    let (port, _shutdown) = start_router(vec![stub.route("codex")], Duration::from_secs(10)).await;

    for path in ["/unknown/x", "/CODEX/x", "/codexx", "/"] {
        let response = http_get(port, path).await;
        assert_eq!(response.status, 404, "path {}", path);
        assert_eq!(response.header("x-proxy-error"), Some("UNKNOWN_ROUTE"));
    }

    assert_eq!(stub.accepts.load(Ordering::SeqCst), 0);
    assert!(stub.requests().is_empty());
}

#[tokio::test]
async fn test_health_is_ok_while_backends_are_down() {
    let (port, _shutdown) = start_router(
        vec![
            Route { prefix: "gemini".into(), name: "gemini".into(), port: closed_port().await },
            Route { prefix: "codex".into(), name: "chatmock".into(), port: closed_port().await },
        ],
        Duration::from_secs(10),
    )
    .await;

    for method in ["GET", "POST"] {
        let response = http_request(port, method, "/health", &[], "").await.unwrap();
        assert_eq!(response.status, 200);
        let json = response.json();
        assert_eq!(json["status"], "ok");
        assert_eq!(json["service"], "coder2api");
    }
}

#[tokio::test]
async fn test_slow_backend_does_not_delay_other_backend() {
    let slow = StubBackend::start("slow").await;
    let fast = StubBackend::start("fast").await;
    let (port, _shutdown) = start_router(
        vec![slow.route("a"), fast.route("b")],
        Duration::from_secs(10),
    )
    .await;

    let slow_request = tokio::spawn(async move { http_request(port, "GET", "/a/slow", &[], "").await });
    // Let the slow request reach its backend
    tokio::time::sleep(Duration::from_millis(200)).await;

    let started = Instant::now();
    let response = http_get(port, "/b/fast").await;
    assert_eq!(response.status, 201);
    assert!(started.elapsed() < Duration::from_millis(1000));
    assert!(!slow_request.is_finished());

    let slow_response = slow_request.await.unwrap().unwrap();
    assert_eq!(slow_response.status, 201);
    assert_eq!(slow_response.body, "stub:slow");
}

#[tokio::test]
async fn test_backend_timeout_returns_502() {
    let stub = StubBackend::start("hang").await;
    let (port, _shutdown) = start_router(vec![stub.route("codex")], Duration::from_millis(500)).await;

    let started = Instant::now();
    let response = http_get(port, "/codex/hang").await;
    assert_eq!(response.status, 502);
    assert_eq!(response.header("x-proxy-error"), Some("REQUEST_TIMEOUT"));
    assert!(started.elapsed() < Duration::from_secs(5));
}

/// Raw backend on an ephemeral port. `script` gets the accepted socket after
/// the request head has been read.
async fn raw_backend<F, Fut>(script: F) -> u16
where
    F: FnOnce(TcpStream) -> Fut + Send + 'static,
    Fut: std::future::Future<Output = ()> + Send,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut head = Vec::new();
        let mut buf = [0u8; 1024];
        while !head.windows(4).any(|w| w == b"\r\n\r\n") {
            let n = stream.read(&mut buf).await.unwrap();
            if n == 0 {
                return;
            }
            head.extend_from_slice(&buf[..n]);
        }
        script(stream).await;
    });
    port
}

#[tokio::test]
async fn test_stalled_response_body_is_aborted() {
    let backend = raw_backend(|mut stream| async move {
        stream
            .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 10\r\n\r\nab")
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_secs(60)).await;
    })
    .await;
    let route = Route {
        prefix: "p".into(),
        name: "stall".into(),
        port: backend,
    };
    let (port, _shutdown) = start_router(vec![route], Duration::from_millis(500)).await;

    let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    stream
        .write_all(b"GET /p/stream HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
        .await
        .unwrap();

    let mut received = Vec::new();
    let read = tokio::time::timeout(Duration::from_secs(5), async {
        let mut buf = [0u8; 1024];
        loop {
            match stream.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => received.extend_from_slice(&buf[..n]),
            }
        }
    })
    .await;

    assert!(read.is_ok(), "caller connection still open after the idle timeout");
    let text = String::from_utf8_lossy(&received);
    assert!(text.starts_with("HTTP/1.1 200"));
    let (_, body) = text.split_once("\r\n\r\n").unwrap_or((text.as_ref(), ""));
    assert!(body.len() < 10, "truncated body was reported as complete");
}

#[tokio::test]
async fn test_caller_hangup_closes_backend_connection() {
    let (head_tx, head_rx) = tokio::sync::oneshot::channel::<()>();
    let (eof_tx, eof_rx) = tokio::sync::oneshot::channel::<Instant>();
    let backend = raw_backend(move |mut stream| async move {
        let _ = head_tx.send(());
        let mut buf = [0u8; 64];
        loop {
            match stream.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(_) => continue,
            }
        }
        let _ = eof_tx.send(Instant::now());
    })
    .await;
    let route = Route {
        prefix: "p".into(),
        name: "hang".into(),
        port: backend,
    };
    let (port, _shutdown) = start_router(vec![route], Duration::from_secs(30)).await;

    let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    stream
        .write_all(b"GET /p/hang HTTP/1.1\r\nHost: localhost\r\n\r\n")
        .await
        .unwrap();
    tokio::time::timeout(Duration::from_secs(5), head_rx)
        .await
        .unwrap()
        .unwrap();

    let hung_up = Instant::now();
    drop(stream);

    let eof = tokio::time::timeout(Duration::from_secs(5), eof_rx)
        .await
        .expect("backend connection stayed open after the caller left")
        .unwrap();
    assert!(eof.duration_since(hung_up) < Duration::from_secs(3));
}

#[tokio::test]
async fn test_router_stops_accepting_on_shutdown() {
    let (port, shutdown) = start_router(Vec::new(), Duration::from_secs(1)).await;
    assert!(wait_for_port(port, Duration::from_secs(2)).await);

    shutdown.send(true).unwrap();

    let start = Instant::now();
    let mut closed = false;
    while start.elapsed() < Duration::from_secs(2) {
        if TcpStream::connect(("127.0.0.1", port)).await.is_err() {
            closed = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert!(closed);
}

#[cfg(unix)]
fn sleeper(name: &str, port: u16) -> BackendConfig {
    BackendConfig::local(name, &["sleep", "30"], port, name)
}

#[cfg(unix)]
#[tokio::test]
async fn test_serve_runs_router_and_stops_children_on_signal() {
    let dir = tempfile::TempDir::new().unwrap();
    let router_port = closed_port().await;

    let mut config = Config::default();
    config.server.bind = "127.0.0.1".into();
    config.server.port = router_port;
    config.server.log_dir = dir.path().join("logs").to_string_lossy().into_owned();
    config.server.root = Some(dir.path().to_string_lossy().into_owned());
    config.server.shutdown_grace_period_secs = 2;
    config.server.reap_interval_ms = 50;
    config.backends = vec![sleeper("alpha", closed_port().await), sleeper("beta", closed_port().await)];
    config.validate().unwrap();

    let supervisor = Supervisor::from_config(&config);
    supervisor.start_all(&config.backends).await.unwrap();
    assert!(dir.path().join("logs/alpha.out.log").exists());
    assert!(dir.path().join("logs/beta.err.log").exists());

    let server = ProxyServer::from_config(&config, supervisor.subscribe()).unwrap();
    let (signal_tx, mut signals) = ShutdownSignals::channel();

    let run = supervisor.run_foreground(Foreground::in_process(server.run()), &mut signals);
    let drive = async {
        assert!(wait_for_port(router_port, Duration::from_secs(5)).await);
        let health = http_get(router_port, "/health").await;
        assert_eq!(health.status, 200);
        // Backends exist but are not HTTP servers
        assert_eq!(http_get(router_port, "/alpha/x").await.status, 502);
        signal_tx.send("SIGTERM").unwrap();
    };
    let (exit, ()) = tokio::join!(run, drive);

    assert_eq!(exit, ForegroundExit::Signal("SIGTERM"));
    assert_eq!(exit.exit_code(), 0);
    assert_eq!(supervisor.state(), SupervisorState::Stopped);
    let statuses = supervisor.statuses();
    assert_eq!(statuses.len(), 2);
    assert!(statuses.iter().all(|s| s.state == ProcessState::Killed));
    assert!(TcpStream::connect(("127.0.0.1", router_port)).await.is_err());

    // Second shutdown is a no-op
    assert!(!supervisor.shutdown().await);
}

#[cfg(unix)]
#[tokio::test]
async fn test_spawn_failure_leaves_no_children_running() {
    let dir = tempfile::TempDir::new().unwrap();
    let supervisor = Supervisor::new(
        dir.path().join("logs"),
        dir.path().to_path_buf(),
        Duration::from_secs(2),
    );

    let result = supervisor
        .start_all(&[
            sleeper("first", 4401),
            BackendConfig::local("second", &["/nonexistent/coder2api-missing"], 4402, "second"),
        ])
        .await;

    assert!(result.is_err());
    assert_eq!(supervisor.state(), SupervisorState::Stopped);
    let statuses = supervisor.statuses();
    assert_eq!(statuses.len(), 1);
    assert_eq!(statuses[0].state, ProcessState::Killed);
}

#[cfg(unix)]
mod binary {
    use super::*;
    use std::process::Stdio;
    use tokio::process::Command;

    const BIN: &str = env!("CARGO_BIN_EXE_coder2api");

    #[tokio::test]
    async fn test_router_subcommand_reads_ports_from_environment() {
        let stub = StubBackend::start("codex").await;
        let router_port = closed_port().await;

        let mut child = Command::new(BIN)
            .arg("router")
            .env("CODER2API_PORT", router_port.to_string())
            .env("CODER2API_CODEX_PORT", stub.port.to_string())
            .env("RUST_LOG", "warn")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .unwrap();

        assert!(wait_for_port(router_port, Duration::from_secs(10)).await);

        let response = http_get(router_port, "/codex/v1/models").await;
        assert_eq!(response.status, 201);
        assert_eq!(response.body, "stub:codex");
        assert_eq!(stub.requests()[0].uri, "/v1/models");

        let health = http_get(router_port, "/health").await;
        assert_eq!(health.json()["service"], "coder2api");

        child.start_kill().unwrap();
        let _ = child.wait().await;
    }

    fn alive(pid: i32) -> bool {
        unsafe { libc::kill(pid, 0) == 0 }
    }

    #[tokio::test]
    async fn test_serve_router_process_stops_everything_on_sigterm() {
        let dir = tempfile::TempDir::new().unwrap();
        let stub = StubBackend::start("rec").await;
        let router_port = closed_port().await;
        let pid_file = dir.path().join("backend.pid");
        let config_path = dir.path().join("coder2api.toml");
        std::fs::write(
            &config_path,
            format!(
                r#"
[server]
bind = "127.0.0.1"
port = {router_port}
log_dir = '{log_dir}'
root = '{root}'
shutdown_grace_period_secs = 2

[[backends]]
name = "recorder"
command = ["sh", "-c", 'echo $$ > "$0"; exec sleep 30', '{pid_file}']
port = 4601
prefix = "rec"
"#,
                router_port = router_port,
                log_dir = dir.path().join("logs").display(),
                root = dir.path().display(),
                pid_file = pid_file.display(),
            ),
        )
        .unwrap();

        let mut child = Command::new(BIN)
            .arg("--config")
            .arg(&config_path)
            .args(["serve", "--router-process"])
            .env("CODER2API_REC_PORT", stub.port.to_string())
            .env("RUST_LOG", "warn")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .unwrap();

        assert!(wait_for_port(router_port, Duration::from_secs(10)).await);

        let response = http_get(router_port, "/rec/v1/ping").await;
        assert_eq!(response.status, 201);
        assert_eq!(stub.requests()[0].uri, "/v1/ping");

        let mut backend_pid = None;
        for _ in 0..100 {
            if let Some(pid) = std::fs::read_to_string(&pid_file)
                .ok()
                .and_then(|s| s.trim().parse::<i32>().ok())
            {
                backend_pid = Some(pid);
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        let backend_pid = backend_pid.expect("backend never wrote its pid");
        assert!(alive(backend_pid));

        let pid = child.id().unwrap() as i32;
        unsafe { libc::kill(pid, libc::SIGTERM) };
        tokio::time::sleep(Duration::from_millis(50)).await;
        unsafe { libc::kill(pid, libc::SIGTERM) };

        let status = tokio::time::timeout(Duration::from_secs(15), child.wait())
            .await
            .expect("serve did not exit after SIGTERM")
            .unwrap();
        assert_eq!(status.code(), Some(0));
        assert!(!alive(backend_pid));
        assert!(TcpStream::connect(("127.0.0.1", router_port)).await.is_err());
    }

    #[tokio::test]
    async fn test_invalid_config_exits_with_1() {
        let status = Command::new(BIN)
            .args(["--config", "/nonexistent/coder2api.toml", "router"])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .unwrap();
        assert_eq!(status.code(), Some(1));
    }

    #[tokio::test]
    async fn test_exec_delegates_and_propagates_exit_code() {
        let dir = tempfile::TempDir::new().unwrap();
        let config_path = dir.path().join("coder2api.toml");
        std::fs::write(
            &config_path,
            r#"
[server]
root = "."

[[backends]]
name = "exiter"
command = ["sh", "-c", "exit \"$0\""]
port = 4501
prefix = "exit"
"#,
        )
        .unwrap();

        let status = Command::new(BIN)
            .arg("--config")
            .arg(&config_path)
            .args(["exec", "exiter", "7"])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .unwrap();
        assert_eq!(status.code(), Some(7));

        let status = Command::new(BIN)
            .arg("--config")
            .arg(&config_path)
            .args(["exec", "missing"])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .unwrap();
        assert_eq!(status.code(), Some(1));
    }
}
