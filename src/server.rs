//! Static file server for the staged directory

use crate::error::{Result, ShareError};
use http_body_util::Full;
use hyper::body::{Bytes, Incoming};
use hyper::header::{CONTENT_LENGTH, CONTENT_TYPE, LOCATION};
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, CONTROLS};
use std::convert::Infallible;
use std::fmt::Write as _;
use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::fs;
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

const LISTEN_BACKLOG: u32 = 1024;
const READY_POLL_INTERVAL: Duration = Duration::from_millis(20);
const CONNECTION_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Characters escaped in directory listing links
const HREF_ESCAPE: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'%')
    .add(b'<')
    .add(b'>')
    .add(b'?')
    .add(b'`')
    .add(b'{')
    .add(b'}');

/// Serves one directory as a document root
pub struct StaticServer {
    root: PathBuf,
    port: u16,
    ready_timeout: Duration,
}

impl StaticServer {
    pub fn new(root: impl Into<PathBuf>, port: u16) -> Self {
        Self {
            root: root.into(),
            port,
            ready_timeout: Duration::from_secs(1),
        }
    }

    pub fn with_ready_timeout(mut self, timeout: Duration) -> Self {
        self.ready_timeout = timeout;
        self
    }

    /// Bind, spawn the accept loop, and return once a loopback probe
    /// connection has been accepted by the listener.
    pub async fn start(self) -> Result<ServerHandle> {
        let listener = bind_reusable(self.port)?;
        let addr = listener.local_addr().map_err(|e| ShareError::Bind {
            port: self.port,
            source: e,
        })?;

        info!(port = addr.port(), root = %self.root.display(), "Starting HTTP server");

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let root = Arc::new(self.root);
        let task = tokio::spawn(serve(listener, root, shutdown_rx));

        let handle = ServerHandle {
            addr,
            shutdown_tx,
            task: Some(task),
        };

        if !wait_until_accepting(addr.port(), self.ready_timeout).await {
            warn!(
                port = addr.port(),
                timeout_ms = self.ready_timeout.as_millis() as u64,
                "Listener did not answer the readiness probe in time"
            );
            return Err(ShareError::Bind {
                port: addr.port(),
                source: io::Error::new(io::ErrorKind::TimedOut, "listener did not become ready"),
            });
        }

        Ok(handle)
    }
}

/// Bind `0.0.0.0:port` with address reuse enabled
fn bind_reusable(port: u16) -> Result<TcpListener> {
    let bind_err = |source| ShareError::Bind { port, source };
    let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, port));

    let socket = TcpSocket::new_v4().map_err(bind_err)?;
    socket.set_reuseaddr(true).map_err(bind_err)?;
    socket.bind(addr).map_err(bind_err)?;
    socket.listen(LISTEN_BACKLOG).map_err(bind_err)
}

async fn wait_until_accepting(port: u16, timeout: Duration) -> bool {
    let probe = SocketAddr::from((Ipv4Addr::LOCALHOST, port));
    let start = Instant::now();
    loop {
        if TcpStream::connect(probe).await.is_ok() {
            debug!(port, "HTTP server accepting connections");
            return true;
        }
        if start.elapsed() >= timeout {
            return false;
        }
        tokio::time::sleep(READY_POLL_INTERVAL).await;
    }
}

async fn serve(listener: TcpListener, root: Arc<PathBuf>, mut shutdown_rx: watch::Receiver<bool>) {
    let conn_shutdown = shutdown_rx.clone();
    let mut connections = JoinSet::new();

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, addr)) => {
                        let root = Arc::clone(&root);
                        let shutdown = conn_shutdown.clone();
                        connections.spawn(async move {
                            if let Err(e) = serve_connection(stream, root, shutdown).await {
                                debug!(addr = %addr, error = %e, "Connection error");
                            }
                        });
                    }
                    Err(e) => {
                        error!(error = %e, "Failed to accept connection");
                    }
                }
            }
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    debug!("HTTP server loop exiting");
                    break;
                }
            }
        }
    }
    drop(listener);

    // open connections were told to finish their current response and close
    let drained = tokio::time::timeout(CONNECTION_DRAIN_TIMEOUT, async {
        while connections.join_next().await.is_some() {}
    })
    .await;
    if drained.is_err() {
        warn!(remaining = connections.len(), "Aborting connections that did not close in time");
        connections.abort_all();
    }
}

async fn serve_connection(
    stream: TcpStream,
    root: Arc<PathBuf>,
    mut shutdown_rx: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let io = TokioIo::new(stream);
    let service = service_fn(move |req| {
        let root = Arc::clone(&root);
        async move { handle_request(req, &root).await }
    });

    let builder = AutoBuilder::new(TokioExecutor::new());
    let conn = builder.serve_connection(io, service);
    tokio::pin!(conn);

    let result = if *shutdown_rx.borrow() {
        conn.as_mut().graceful_shutdown();
        conn.as_mut().await
    } else {
        tokio::select! {
            result = conn.as_mut() => result,
            _ = shutdown_rx.changed() => {
                conn.as_mut().graceful_shutdown();
                conn.as_mut().await
            }
        }
    };

    result.map_err(|e| anyhow::anyhow!("Connection error: {}", e))
}

/// Handle to a running server. Dropping it signals the loop to stop.
pub struct ServerHandle {
    addr: SocketAddr,
    shutdown_tx: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
}

impl ServerHandle {
    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Stop accepting, close open connections once their current response is
    /// written, and release the listening socket. Safe to call twice.
    pub async fn stop(&mut self) {
        let Some(task) = self.task.take() else {
            return;
        };
        let _ = self.shutdown_tx.send(true);
        if let Err(e) = task.await {
            warn!(error = %e, "HTTP server task ended abnormally");
        }
        info!(port = self.addr.port(), "HTTP server stopped");
    }
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(true);
    }
}

fn response(status: StatusCode, content_type: &str, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    let body = body.into();
    Response::builder()
        .status(status)
        .header(CONTENT_TYPE, content_type)
        .header(CONTENT_LENGTH, body.len())
        .body(Full::new(body))
        .expect("valid response with StatusCode enum and static headers")
}

fn error_page(status: StatusCode) -> Response<Full<Bytes>> {
    let reason = status.canonical_reason().unwrap_or("Error");
    let body = format!(
        "<!DOCTYPE html>\n<html><head><title>{code} {reason}</title></head>\n\
         <body><h1>{code} {reason}</h1></body></html>\n",
        code = status.as_u16(),
    );
    response(status, "text/html; charset=utf-8", body)
}

fn redirect(location: &str) -> Response<Full<Bytes>> {
    Response::builder()
        .status(StatusCode::MOVED_PERMANENTLY)
        .header(LOCATION, location)
        .header(CONTENT_LENGTH, 0)
        .body(Full::new(Bytes::new()))
        .unwrap_or_else(|_| error_page(StatusCode::BAD_REQUEST))
}

/// Map a request path onto the document root, rejecting traversal
pub fn resolve_path(root: &Path, request_path: &str) -> Option<PathBuf> {
    let decoded = percent_decode_str(request_path).decode_utf8().ok()?;
    let mut resolved = root.to_path_buf();
    for segment in decoded.split('/') {
        match segment {
            "" | "." => continue,
            ".." => return None,
            s if s.contains('\\') || s.contains('\0') => return None,
            s => resolved.push(s),
        }
    }
    Some(resolved)
}

async fn handle_request(
    req: Request<Incoming>,
    root: &Path,
) -> std::result::Result<Response<Full<Bytes>>, Infallible> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    debug!(%method, %path, "Request");

    if method != Method::GET && method != Method::HEAD {
        let mut resp = error_page(StatusCode::METHOD_NOT_ALLOWED);
        resp.headers_mut()
            .insert(hyper::header::ALLOW, hyper::header::HeaderValue::from_static("GET, HEAD"));
        return Ok(resp);
    }

    let mut resp = serve_path(root, &path).await;
    if method == Method::HEAD {
        *resp.body_mut() = Full::new(Bytes::new());
    }
    Ok(resp)
}

async fn serve_path(root: &Path, request_path: &str) -> Response<Full<Bytes>> {
    let Some(target) = resolve_path(root, request_path) else {
        return error_page(StatusCode::BAD_REQUEST);
    };

    let meta = match fs::metadata(&target).await {
        Ok(meta) => meta,
        Err(_) => return error_page(StatusCode::NOT_FOUND),
    };

    if meta.is_dir() {
        if !request_path.ends_with('/') {
            return redirect(&format!("{}/", request_path));
        }
        let index = target.join("index.html");
        if fs::metadata(&index).await.is_ok_and(|m| m.is_file()) {
            return serve_file(&index).await;
        }
        return match directory_listing(&target, request_path).await {
            Ok(html) => response(StatusCode::OK, "text/html; charset=utf-8", html),
            Err(e) => {
                warn!(path = %target.display(), error = %e, "Failed to list directory");
                error_page(StatusCode::NOT_FOUND)
            }
        };
    }

    serve_file(&target).await
}

async fn serve_file(path: &Path) -> Response<Full<Bytes>> {
    match fs::read(path).await {
        Ok(contents) => {
            let mime = mime_guess::from_path(path).first_or_octet_stream();
            let content_type = if mime.type_() == mime_guess::mime::TEXT {
                format!("{}; charset=utf-8", mime.essence_str())
            } else {
                mime.essence_str().to_string()
            };
            response(StatusCode::OK, &content_type, contents)
        }
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Failed to read file");
            error_page(StatusCode::NOT_FOUND)
        }
    }
}

fn escape_html(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            c => out.push(c),
        }
    }
    out
}

async fn directory_listing(dir: &Path, request_path: &str) -> io::Result<String> {
    let mut items = Vec::new();
    let mut entries = fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name().to_string_lossy().into_owned();
        let is_dir = fs::metadata(entry.path()).await.is_ok_and(|m| m.is_dir());
        items.push((name, is_dir));
    }
    items.sort();

    let title = escape_html(&percent_decode_str(request_path).decode_utf8_lossy());
    let mut html = format!(
        "<!DOCTYPE html>\n<html><head><meta charset=\"utf-8\">\
         <title>Directory listing for {title}</title></head>\n\
         <body><h1>Directory listing for {title}</h1><hr><ul>\n"
    );
    for (name, is_dir) in items {
        let display = if is_dir { format!("{}/", name) } else { name };
        let href = utf8_percent_encode(&display, HREF_ESCAPE).to_string();
        let _ = writeln!(html, "<li><a href=\"{}\">{}</a></li>", href, escape_html(&display));
    }
    html.push_str("</ul><hr></body></html>\n");
    Ok(html)
}
