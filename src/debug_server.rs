//! Debug Server Module
//!
//! Read-only HTTP views over the capture threads, mounted under
//! `/debug/t<id>/`:
//!
//! - `files`: tracked blockfile names
//! - `index?name=&start=&finish=`: index dump, range bounds hex-encoded
//! - `packets?name=`: every packet of one blockfile as a pcap file
//! - `positions?name=` with a query expression as the request body
//!
//! plus `/healthz`. Every per-file route holds a read lease on its thread
//! until the response body is finished, so a file is never evicted while it
//! is being served.

use crate::blockfile::Positions;
use crate::config::DebugConfig;
use crate::health::HealthManager;
use crate::packet::PacketStream;
use crate::pcap_blockfile::{pcap_header, pcap_record};
use crate::query::parse_query;
use crate::shutdown::ShutdownSignal;
use crate::tracker::{CaptureThread, FileLease};
use crate::{Result, TrackerError};
use bytes::Bytes;
use futures::Stream;
use http_body_util::{combinators::BoxBody, BodyExt, Full, StreamBody};
use hyper::body::Frame;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

pub type DebugBody = BoxBody<Bytes, hyper::Error>;

const MAX_CONNECTIONS: usize = 16;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Connection guard to automatically decrement connection counter when dropped
struct ConnectionGuard {
    counter: Arc<AtomicUsize>,
}

impl ConnectionGuard {
    fn new(counter: Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::Relaxed);
        Self { counter }
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Debug listener over a set of capture threads
#[derive(Clone)]
pub struct DebugServer {
    config: Arc<DebugConfig>,
    threads: Arc<Vec<Arc<CaptureThread>>>,
    health: Option<Arc<HealthManager>>,
}

impl DebugServer {
    pub fn new(config: Arc<DebugConfig>, threads: Vec<Arc<CaptureThread>>) -> Self {
        Self {
            config,
            threads: Arc::new(threads),
            health: None,
        }
    }

    pub fn set_health_manager(&mut self, health: Arc<HealthManager>) {
        self.health = Some(health);
    }

    /// Bind to the configured address and serve until shutdown
    pub async fn start(&self, shutdown_signal: ShutdownSignal) -> Result<()> {
        let addr = SocketAddr::new(
            self.config.bind_address.parse().map_err(|e| {
                TrackerError::ConfigError(format!("Invalid debug bind address: {}", e))
            })?,
            self.config.port,
        );

        let listener = TcpListener::bind(addr).await.map_err(|e| {
            TrackerError::IoError(format!("Failed to bind debug server to {}: {}", addr, e))
        })?;

        info!("Debug server listening on {}", addr);
        self.serve(listener, shutdown_signal).await
    }

    /// Serve connections from an already bound listener until shutdown
    pub async fn serve(
        &self,
        listener: TcpListener,
        mut shutdown_signal: ShutdownSignal,
    ) -> Result<()> {
        let active_connections = Arc::new(AtomicUsize::new(0));

        loop {
            tokio::select! {
                accept_result = listener.accept() => {
                    match accept_result {
                        Ok((stream, remote_addr)) => {
                            if active_connections.load(Ordering::Relaxed) >= MAX_CONNECTIONS {
                                warn!(
                                    "Debug connection limit reached ({}), rejecting {}",
                                    MAX_CONNECTIONS, remote_addr
                                );
                                drop(stream);
                                continue;
                            }
                            debug!("Debug server accepting connection from {}", remote_addr);

                            let io = TokioIo::new(stream);
                            let server = self.clone();
                            let guard = ConnectionGuard::new(active_connections.clone());

                            tokio::spawn(async move {
                                let _connection_guard = guard;
                                let service = service_fn(move |req| {
                                    let server = server.clone();
                                    async move {
                                        Ok::<_, hyper::Error>(server.handle_with_timeout(req).await)
                                    }
                                });

                                let conn = http1::Builder::new().serve_connection(io, service);
                                if let Err(e) = conn.await {
                                    if !e.to_string().contains("connection closed") {
                                        error!("Error serving debug connection: {}", e);
                                    }
                                }
                            });
                        }
                        Err(e) => {
                            error!("Failed to accept debug connection: {}", e);
                            tokio::time::sleep(Duration::from_millis(100)).await;
                        }
                    }
                }
                _ = shutdown_signal.wait_for_shutdown() => {
                    info!("Debug server received shutdown signal");
                    break;
                }
            }
        }

        // In-flight responses may still hold read leases; give them a moment.
        let shutdown_timeout = Duration::from_secs(5);
        let start_time = std::time::Instant::now();
        while active_connections.load(Ordering::Relaxed) > 0
            && start_time.elapsed() < shutdown_timeout
        {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        let remaining = active_connections.load(Ordering::Relaxed);
        if remaining > 0 {
            info!("Debug server shutdown with {} active connections remaining", remaining);
        } else {
            info!("Debug server shutdown complete");
        }
        Ok(())
    }

    async fn handle_with_timeout(
        &self,
        req: Request<hyper::body::Incoming>,
    ) -> Response<DebugBody> {
        match tokio::time::timeout(REQUEST_TIMEOUT, self.handle_request(req)).await {
            Ok(response) => response,
            Err(_) => {
                error!("Debug request timed out after {:?}", REQUEST_TIMEOUT);
                text_response(StatusCode::REQUEST_TIMEOUT, "Request timeout\n")
            }
        }
    }

    async fn handle_request(&self, req: Request<hyper::body::Incoming>) -> Response<DebugBody> {
        let method = req.method().clone();
        let path = req.uri().path().to_string();
        let params = parse_query_params(req.uri().query());

        let body = if method == Method::GET || method == Method::HEAD {
            Bytes::new()
        } else {
            match req.into_body().collect().await {
                Ok(collected) => collected.to_bytes(),
                Err(e) => {
                    warn!("Could not read debug request body: {}", e);
                    return text_response(StatusCode::BAD_REQUEST, "could not read request body\n");
                }
            }
        };

        let response = self.route(&path, &params, body).await;
        debug!("Debug {} {} -> {}", method, path, response.status());
        response
    }

    /// Dispatch a request by path
    pub async fn route(
        &self,
        path: &str,
        params: &HashMap<String, String>,
        body: Bytes,
    ) -> Response<DebugBody> {
        if path == "/healthz" {
            return self.healthz().await;
        }

        let Some((thread, endpoint)) = self.thread_route(path) else {
            return text_response(StatusCode::NOT_FOUND, "404 page not found\n");
        };
        let name = params.get("name").map(String::as_str).unwrap_or_default();

        match endpoint {
            "files" => files_response(thread).await,
            "index" => index_response(thread, name, params).await,
            "packets" => packets_response(thread, name).await,
            "positions" => positions_response(thread, name, &body).await,
            _ => text_response(StatusCode::NOT_FOUND, "404 page not found\n"),
        }
    }

    fn thread_route<'a>(&self, path: &'a str) -> Option<(&Arc<CaptureThread>, &'a str)> {
        let rest = path.strip_prefix("/debug/t")?;
        let (id, endpoint) = rest.split_once('/')?;
        let id: usize = id.parse().ok()?;
        let thread = self.threads.iter().find(|t| t.id() == id)?;
        Some((thread, endpoint))
    }

    async fn healthz(&self) -> Response<DebugBody> {
        let Some(health) = &self.health else {
            return text_response(StatusCode::NOT_FOUND, "health reporting disabled\n");
        };
        match health.health_response().await {
            Ok(response) => response.map(|body| full_body(Bytes::from(body))),
            Err(e) => {
                error!("Failed to build health response: {}", e);
                text_response(StatusCode::INTERNAL_SERVER_ERROR, "health check failed\n")
            }
        }
    }
}

async fn files_response(thread: &CaptureThread) -> Response<DebugBody> {
    let mut out = format!(
        "Thread {} (IDX: {:?}, PKT: {:?})\n",
        thread.id(),
        thread.index_path(),
        thread.packet_path()
    );
    for name in thread.tracked_files().await {
        out.push('\t');
        out.push_str(&name);
        out.push('\n');
    }
    text_response(StatusCode::OK, out)
}

async fn index_response(
    thread: &CaptureThread,
    name: &str,
    params: &HashMap<String, String>,
) -> Response<DebugBody> {
    let Some(lease) = thread.file_lease(name).await else {
        return text_response(StatusCode::NOT_FOUND, "file not found\n");
    };

    let start = match decode_bound(params.get("start")) {
        Ok(start) => start,
        Err(()) => return text_response(StatusCode::BAD_REQUEST, "bad start\n"),
    };
    let finish = match decode_bound(params.get("finish")) {
        Ok(finish) => finish,
        Err(()) => return text_response(StatusCode::BAD_REQUEST, "bad finish\n"),
    };

    // The lease moves along so the file stays tracked while it is read.
    let dumped = tokio::task::spawn_blocking(move || {
        let mut out = Vec::new();
        lease
            .file()
            .dump_index(&mut out, start.as_deref(), finish.as_deref())
            .map(|()| out)
    })
    .await
    .unwrap_or_else(|e| Err(TrackerError::IoError(format!("index dump task failed: {}", e))));

    match dumped {
        Ok(out) => text_response(StatusCode::OK, out),
        Err(e) => {
            warn!("Index dump of {} failed: {}", name, e);
            text_response(StatusCode::INTERNAL_SERVER_ERROR, format!("ERROR: {}\n", e))
        }
    }
}

async fn packets_response(thread: &CaptureThread, name: &str) -> Response<DebugBody> {
    let Some(lease) = thread.file_lease(name).await else {
        return text_response(StatusCode::NOT_FOUND, "file not found\n");
    };
    let packets = lease.file().clone().all_packets();
    let body = PcapBody {
        header: Some(pcap_header()),
        packets,
        _lease: lease,
    };

    let mut response = Response::new(BoxBody::new(StreamBody::new(body)));
    response.headers_mut().insert(
        hyper::header::CONTENT_TYPE,
        hyper::header::HeaderValue::from_static("application/octet-stream"),
    );
    response
}

async fn positions_response(
    thread: &CaptureThread,
    name: &str,
    body: &[u8],
) -> Response<DebugBody> {
    let Some(lease) = thread.file_lease(name).await else {
        return text_response(StatusCode::NOT_FOUND, "file not found\n");
    };
    let Ok(expression) = std::str::from_utf8(body) else {
        return text_response(StatusCode::BAD_REQUEST, "could not read request body\n");
    };
    let query = match parse_query(expression) {
        Ok(query) => query,
        Err(e) => {
            debug!("Rejecting positions query {:?}: {}", expression, e);
            return text_response(StatusCode::BAD_REQUEST, "could not parse query\n");
        }
    };

    let positions = tokio::task::spawn_blocking(move || lease.file().positions(query.as_ref()))
        .await
        .unwrap_or_else(|e| Err(TrackerError::QueryError(format!("positions task failed: {}", e))));
    text_response(StatusCode::OK, format_positions(positions))
}

/// Render a positions result: `ALL`, or one hex-encoded 4-byte big-endian
/// offset per line
pub fn format_positions(positions: Result<Positions>) -> String {
    match positions {
        Err(e) => format!("ERROR: {}", e),
        Ok(Positions::All) => "POSITIONS:\n\tALL".to_string(),
        Ok(Positions::Offsets(offsets)) => {
            let mut out = String::from("POSITIONS:\n");
            for pos in offsets {
                out.push('\t');
                out.push_str(&hex::encode(pos.to_be_bytes()));
                out.push('\n');
            }
            out
        }
    }
}

fn decode_bound(value: Option<&String>) -> std::result::Result<Option<Vec<u8>>, ()> {
    match value.map(String::as_str) {
        None | Some("") => Ok(None),
        Some(s) => hex::decode(s).map(Some).map_err(|_| ()),
    }
}

/// Parse `a=b&c=d`, URL-decoding values. Later duplicates are ignored.
pub fn parse_query_params(query: Option<&str>) -> HashMap<String, String> {
    let mut params = HashMap::new();
    let Some(query) = query else {
        return params;
    };
    for pair in query.split('&').filter(|p| !p.is_empty()) {
        let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
        let decoded = urlencoding::decode(value).unwrap_or_else(|_| {
            warn!("Failed to URL decode parameter value: {}", value);
            std::borrow::Cow::Borrowed(value)
        });
        params
            .entry(key.to_string())
            .or_insert_with(|| decoded.into_owned());
    }
    params
}

fn full_body(bytes: Bytes) -> DebugBody {
    Full::new(bytes).map_err(|never| match never {}).boxed()
}

fn text_response(status: StatusCode, body: impl Into<Bytes>) -> Response<DebugBody> {
    let mut response = Response::new(full_body(body.into()));
    *response.status_mut() = status;
    response.headers_mut().insert(
        hyper::header::CONTENT_TYPE,
        hyper::header::HeaderValue::from_static("text/plain"),
    );
    response
}

/// pcap file body: global header, then one record per packet. Holds the
/// file's read lease until dropped.
struct PcapBody {
    header: Option<Bytes>,
    packets: PacketStream,
    _lease: FileLease,
}

impl Stream for PcapBody {
    type Item = std::result::Result<Frame<Bytes>, hyper::Error>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if let Some(header) = self.header.take() {
            return Poll::Ready(Some(Ok(Frame::data(header))));
        }
        match Pin::new(&mut self.packets).poll_next(cx) {
            Poll::Ready(Some(Ok(packet))) => {
                Poll::Ready(Some(Ok(Frame::data(pcap_record(&packet)))))
            }
            Poll::Ready(Some(Err(e))) => {
                warn!("Stopping pcap stream early: {}", e);
                self.packets.close();
                Poll::Ready(None)
            }
            Poll::Ready(None) => Poll::Ready(None),
            Poll::Pending => Poll::Pending,
        }
    }
}
