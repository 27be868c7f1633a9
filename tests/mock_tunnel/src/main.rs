//! Mock tunnel agent for integration testing
//!
//! Invoked like the real agent: `mock-tunnel http <port> [--basic-auth user:pass]`.
//!
//! Environment variables:
//! - MOCK_TUNNEL_API_PORT: port of the status API (default: 4040)
//! - MOCK_TUNNEL_STARTUP_DELAY_MS: delay before the status API listens (default: 0)
//! - MOCK_TUNNEL_EMPTY: if set, the status API reports no tunnels
//!
//! Endpoints:
//! - GET /api/tunnels: `{"tunnels":[{"public_url":...}]}`
//! - GET /forward/<path>: fetches `<path>` from the local port and relays the raw response

use std::env;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

struct Args {
    port: u16,
    basic_auth: Option<String>,
}

fn parse_args() -> Result<Args, String> {
    let args: Vec<String> = env::args().skip(1).collect();
    if args.first().map(String::as_str) != Some("http") {
        return Err(format!("unsupported invocation: {:?}", args));
    }
    let port = args
        .get(1)
        .ok_or("missing port")?
        .parse()
        .map_err(|e| format!("invalid port: {}", e))?;

    let mut basic_auth = None;
    let mut rest = args.iter().skip(2);
    while let Some(arg) = rest.next() {
        match arg.as_str() {
            "--basic-auth" => basic_auth = rest.next().cloned(),
            other => return Err(format!("unknown flag: {}", other)),
        }
    }

    Ok(Args { port, basic_auth })
}

#[tokio::main]
async fn main() {
    let args = match parse_args() {
        Ok(a) => a,
        Err(e) => {
            eprintln!("Mock tunnel: {}", e);
            std::process::exit(2);
        }
    };

    let api_port: u16 = env::var("MOCK_TUNNEL_API_PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(4040);

    let startup_delay: u64 = env::var("MOCK_TUNNEL_STARTUP_DELAY_MS")
        .ok()
        .and_then(|d| d.parse().ok())
        .unwrap_or(0);

    let empty = env::var_os("MOCK_TUNNEL_EMPTY").is_some();

    println!(
        "Mock tunnel: forwarding port {} (auth: {})",
        args.port,
        args.basic_auth.as_deref().unwrap_or("none")
    );

    if startup_delay > 0 {
        tokio::time::sleep(Duration::from_millis(startup_delay)).await;
    }

    let listener = TcpListener::bind(("127.0.0.1", api_port))
        .await
        .expect("Failed to bind status API");
    eprintln!("Mock tunnel: status API on port {}", api_port);

    let body = if empty {
        r#"{"tunnels":[],"uri":"/api/tunnels"}"#.to_string()
    } else {
        format!(
            r#"{{"tunnels":[{{"name":"command_line","public_url":"https://mock-{port}.tunnel.test","proto":"https","config":{{"addr":"http://localhost:{port}"}}}}],"uri":"/api/tunnels"}}"#,
            port = args.port
        )
    };

    let local_port = args.port;
    tokio::select! {
        _ = accept_loop(listener, body, local_port) => {}
        _ = tokio::signal::ctrl_c() => {}
    }
}

async fn accept_loop(listener: TcpListener, body: String, local_port: u16) {
    loop {
        match listener.accept().await {
            Ok((stream, _)) => {
                let body = body.clone();
                tokio::spawn(async move {
                    handle_connection(stream, &body, local_port).await;
                });
            }
            Err(e) => eprintln!("Mock tunnel: accept error: {}", e),
        }
    }
}

async fn handle_connection(mut stream: TcpStream, body: &str, local_port: u16) {
    let mut buf = Vec::new();
    let mut temp = [0u8; 1024];

    loop {
        let n = match stream.read(&mut temp).await {
            Ok(0) | Err(_) => return,
            Ok(n) => n,
        };
        buf.extend_from_slice(&temp[..n]);
        if buf.windows(4).any(|w| w == b"\r\n\r\n") {
            break;
        }
        if buf.len() > 8192 {
            return;
        }
    }

    let request = String::from_utf8_lossy(&buf);
    let path = request
        .lines()
        .next()
        .and_then(|l| l.split(' ').nth(1))
        .unwrap_or("/")
        .to_string();

    eprintln!("Mock tunnel: GET {}", path);

    if let Some(rest) = path.strip_prefix("/forward") {
        let target = if rest.is_empty() { "/" } else { rest };
        match forward(local_port, target).await {
            Ok(raw) => {
                let _ = stream.write_all(&raw).await;
            }
            Err(e) => {
                let msg = format!("forward failed: {}", e);
                let _ = stream.write_all(plain("502 Bad Gateway", "text/plain", &msg).as_bytes()).await;
            }
        }
        return;
    }

    let response = match path.as_str() {
        "/api/tunnels" => plain("200 OK", "application/json", body),
        _ => plain("404 Not Found", "text/plain", "not found"),
    };
    let _ = stream.write_all(response.as_bytes()).await;
}

fn plain(status: &str, content_type: &str, body: &str) -> String {
    format!(
        "HTTP/1.1 {}\r\n\
         Content-Type: {}\r\n\
         Content-Length: {}\r\n\
         Connection: close\r\n\
         \r\n\
         {}",
        status,
        content_type,
        body.len(),
        body
    )
}

async fn forward(port: u16, path: &str) -> std::io::Result<Vec<u8>> {
    let mut upstream = TcpStream::connect(("127.0.0.1", port)).await?;
    let request = format!(
        "GET {} HTTP/1.1\r\nHost: 127.0.0.1:{}\r\nConnection: close\r\n\r\n",
        path, port
    );
    upstream.write_all(request.as_bytes()).await?;
    let mut raw = Vec::new();
    upstream.read_to_end(&mut raw).await?;
    Ok(raw)
}
