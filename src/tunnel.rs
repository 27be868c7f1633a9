//! Tunnel agent process management
//!
//! Launches the tunnel binary (`ngrok http <port>` by default), asks its
//! local status API which public URLs were assigned, and terminates it on
//! shutdown.

use crate::config::{BasicAuth, TunnelConfig};
use crate::error::{Result, ShareError};
use parking_lot::Mutex;
use serde::Deserialize;
use std::collections::VecDeque;
use std::io;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Lines of agent output kept for diagnostics
const MAX_OUTPUT_LINES: usize = 500;

/// How long to wait for the output readers to drain after the agent exits
const OUTPUT_DRAIN_TIMEOUT: Duration = Duration::from_millis(500);

/// Body of `GET /api/tunnels`
#[derive(Debug, Clone, Deserialize)]
pub struct TunnelList {
    pub tunnels: Vec<TunnelInfo>,
}

/// One entry of the status API's `tunnels` array
#[derive(Debug, Clone, Deserialize)]
pub struct TunnelInfo {
    pub public_url: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub proto: Option<String>,
}

/// Parse a status body into the list of public URLs
pub fn parse_public_urls(body: &str) -> std::result::Result<Vec<String>, serde_json::Error> {
    let list: TunnelList = serde_json::from_str(body)?;
    Ok(list.tunnels.into_iter().map(|t| t.public_url).collect())
}

type OutputBuffer = Arc<Mutex<VecDeque<String>>>;

/// Configured but not yet launched tunnel
pub struct TunnelManager {
    config: TunnelConfig,
    port: u16,
    basic_auth: Option<BasicAuth>,
    http_client: reqwest::Client,
}

impl TunnelManager {
    pub fn new(config: TunnelConfig, port: u16, basic_auth: Option<BasicAuth>) -> Result<Self> {
        let http_client = reqwest::Client::builder()
            .timeout(config.query_timeout())
            .build()
            .map_err(|e| ShareError::Config(format!("cannot build status API client: {}", e)))?;
        Ok(Self {
            config,
            port,
            basic_auth,
            http_client,
        })
    }

    /// Arguments passed to the tunnel binary
    pub fn command_args(&self) -> Vec<String> {
        let mut args = vec!["http".to_string(), self.port.to_string()];
        if let Some(ref auth) = self.basic_auth {
            args.push("--basic-auth".to_string());
            args.push(auth.as_arg());
        }
        args
    }

    /// Launch the agent and wait until its status API lists the tunnels.
    ///
    /// On any failure the agent is terminated before the error is returned.
    pub async fn start(self) -> Result<TunnelHandle> {
        let mut handle = self.spawn()?;
        self.wait_ready(&mut handle).await?;
        Ok(handle)
    }

    /// Launch the agent process and start capturing its output
    pub fn spawn(&self) -> Result<TunnelHandle> {
        let binary = self.config.binary.clone();
        info!(binary = %binary, port = self.port, auth = self.basic_auth.is_some(), "Starting tunnel");

        let mut child = Command::new(&binary)
            .args(self.command_args())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| spawn_error(&binary, e))?;

        let pid = child.id().unwrap_or(0);
        debug!(binary = %binary, pid, "Tunnel process spawned");

        let output: OutputBuffer = Arc::new(Mutex::new(VecDeque::new()));
        let mut readers = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            readers.push(capture_lines(stdout, "stdout", Arc::clone(&output)));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(capture_lines(stderr, "stderr", Arc::clone(&output)));
        }

        Ok(TunnelHandle {
            binary,
            child: Some(child),
            public_urls: Vec::new(),
            output,
            readers,
            stop_grace: self.config.stop_grace(),
        })
    }

    /// Wait until the status API lists the tunnels of a spawned agent.
    ///
    /// On failure the agent is stopped, its buffered output is logged, and
    /// the output stays readable through [`TunnelHandle::output`].
    pub async fn wait_ready(&self, handle: &mut TunnelHandle) -> Result<()> {
        match self.wait_for_urls(handle).await {
            Ok(urls) => {
                handle.public_urls = urls;
                Ok(())
            }
            Err(e) => {
                error!(error = %e, "Failed to get tunnel info");
                handle.stop().await;
                handle.drain_output().await;
                handle.report_output();
                Err(e)
            }
        }
    }

    /// Bounded retry against the status API, checking between attempts that
    /// the agent is still alive
    async fn wait_for_urls(&self, handle: &mut TunnelHandle) -> Result<Vec<String>> {
        let attempts = self.config.query_attempts.max(1);
        tokio::time::sleep(self.config.startup_grace()).await;

        let mut last_err = ShareError::NoTunnels;
        for attempt in 1..=attempts {
            if attempt > 1 {
                tokio::time::sleep(self.config.backoff(attempt - 1)).await;
            }

            if let Some(status) = handle.try_exit_status() {
                return Err(ShareError::Network {
                    url: self.config.api_url.clone(),
                    message: format!("{} exited early with {}", handle.binary, status),
                });
            }

            match self.query_status().await {
                Ok(urls) if !urls.is_empty() => {
                    debug!(attempt, count = urls.len(), "Tunnel status received");
                    return Ok(urls);
                }
                Ok(_) => {
                    debug!(attempt, attempts, "Status API lists no tunnels yet");
                    last_err = ShareError::NoTunnels;
                }
                Err(e) => {
                    debug!(attempt, attempts, error = %e, "Tunnel status query failed");
                    last_err = e;
                }
            }
        }

        Err(last_err)
    }

    /// Single GET against the status API
    pub async fn query_status(&self) -> Result<Vec<String>> {
        let url = &self.config.api_url;
        let network = |message: String| ShareError::Network {
            url: url.clone(),
            message,
        };

        let body = self
            .http_client
            .get(url)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| network(e.to_string()))?
            .text()
            .await
            .map_err(|e| network(e.to_string()))?;

        parse_public_urls(&body).map_err(|e| network(format!("invalid status body: {}", e)))
    }
}

fn spawn_error(binary: &str, e: io::Error) -> ShareError {
    if e.kind() == io::ErrorKind::NotFound {
        ShareError::BinaryNotFound {
            binary: binary.to_string(),
        }
    } else {
        ShareError::Launch {
            binary: binary.to_string(),
            source: e,
        }
    }
}

fn capture_lines<R>(reader: R, stream: &'static str, output: OutputBuffer) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            debug!(stream, line = %line, "tunnel output");
            let mut buf = output.lock();
            buf.push_back(line);
            while buf.len() > MAX_OUTPUT_LINES {
                buf.pop_front();
            }
        }
    })
}

/// A running tunnel agent and the URLs it reported
pub struct TunnelHandle {
    binary: String,
    child: Option<Child>,
    public_urls: Vec<String>,
    output: OutputBuffer,
    readers: Vec<JoinHandle<()>>,
    stop_grace: Duration,
}

impl TunnelHandle {
    pub fn public_urls(&self) -> &[String] {
        &self.public_urls
    }

    pub fn pid(&self) -> Option<u32> {
        self.child.as_ref().and_then(|c| c.id())
    }

    /// Buffered stdout/stderr lines of the agent
    pub fn output(&self) -> Vec<String> {
        self.output.lock().iter().cloned().collect()
    }

    pub fn is_running(&mut self) -> bool {
        match self.child.as_mut() {
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => false,
        }
    }

    fn try_exit_status(&mut self) -> Option<std::process::ExitStatus> {
        self.child.as_mut().and_then(|c| c.try_wait().ok().flatten())
    }

    async fn drain_output(&mut self) {
        for reader in self.readers.drain(..) {
            if tokio::time::timeout(OUTPUT_DRAIN_TIMEOUT, reader).await.is_err() {
                debug!("Tunnel output reader did not finish in time");
            }
        }
    }

    fn report_output(&self) {
        for line in self.output() {
            error!(binary = %self.binary, "{}", line);
        }
    }

    /// SIGTERM, then SIGKILL after the grace period. Safe to call twice.
    pub async fn stop(&mut self) {
        let Some(mut child) = self.child.take() else {
            return;
        };

        if let Ok(Some(status)) = child.try_wait() {
            debug!(binary = %self.binary, ?status, "Tunnel process already exited");
            return;
        }

        if let Some(pid) = child.id() {
            debug!(binary = %self.binary, pid, "Sending SIGTERM to tunnel");

            #[cfg(unix)]
            unsafe {
                libc::kill(pid as i32, libc::SIGTERM);
            }

            #[cfg(not(unix))]
            {
                let _ = child.start_kill();
            }
        }

        match tokio::time::timeout(self.stop_grace, child.wait()).await {
            Ok(Ok(status)) => {
                info!(binary = %self.binary, ?status, "Tunnel closed");
            }
            Ok(Err(e)) => {
                warn!(binary = %self.binary, error = %e, "Error waiting for tunnel to exit");
            }
            Err(_) => {
                warn!(
                    binary = %self.binary,
                    grace_period_secs = self.stop_grace.as_secs(),
                    "Grace period exceeded, sending SIGKILL"
                );
                let _ = child.kill().await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Serve `body` as JSON for every request; returns the status URL
    async fn status_api(body: &'static str) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let mut buf = [0u8; 2048];
                    let _ = stream.read(&mut buf).await;
                    let response = format!(
                        "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                        body.len(),
                        body
                    );
                    let _ = stream.write_all(response.as_bytes()).await;
                });
            }
        });
        format!("http://127.0.0.1:{}/api/tunnels", port)
    }

    fn fast_config(binary: &str, api_url: String) -> TunnelConfig {
        TunnelConfig {
            binary: binary.to_string(),
            api_url,
            startup_grace_ms: 50,
            query_attempts: 3,
            query_backoff_ms: 50,
            query_timeout_ms: 500,
            stop_grace_secs: 2,
        }
    }

    #[cfg(unix)]
    fn fake_agent(dir: &std::path::Path, script: &str) -> String {
        use std::os::unix::fs::PermissionsExt;
        let path = dir.join("fake-agent");
        std::fs::write(&path, format!("#!/bin/sh\n{}\n", script)).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path.to_string_lossy().into_owned()
    }

    #[test]
    fn test_parse_public_urls() {
        let body = r#"{"tunnels":[
            {"name":"command_line","public_url":"https://abc.ngrok.io","proto":"https"},
            {"name":"command_line (http)","public_url":"http://abc.ngrok.io","proto":"http"}
        ],"uri":"/api/tunnels"}"#;
        assert_eq!(
            parse_public_urls(body).unwrap(),
            vec!["https://abc.ngrok.io", "http://abc.ngrok.io"]
        );
        assert!(parse_public_urls(r#"{"tunnels":[]}"#).unwrap().is_empty());
        assert!(parse_public_urls(r#"{"other":[]}"#).is_err());
        assert!(parse_public_urls("not json").is_err());
    }

    #[test]
    fn test_command_args() {
        let manager = TunnelManager::new(TunnelConfig::default(), 8080, None).unwrap();
        assert_eq!(manager.command_args(), vec!["http", "8080"]);

        let auth = BasicAuth::parse("admin:password").unwrap();
        let manager = TunnelManager::new(TunnelConfig::default(), 9000, Some(auth)).unwrap();
        assert_eq!(
            manager.command_args(),
            vec!["http", "9000", "--basic-auth", "admin:password"]
        );
    }

    #[tokio::test]
    async fn test_missing_binary_is_not_found() {
        let config = fast_config("tunshare-no-such-tunnel-binary", "http://127.0.0.1:9/".into());
        let err = TunnelManager::new(config, 8080, None).unwrap().start().await.err().unwrap();
        assert_eq!(err.code(), crate::error::ShareErrorCode::BinaryNotFound);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_start_reports_urls_and_stop_terminates() {
        let dir = tempfile::tempdir().unwrap();
        let agent = fake_agent(dir.path(), "exec sleep 30");
        let api = status_api(r#"{"tunnels":[{"public_url":"https://demo.ngrok.io"}]}"#).await;

        let mut handle = TunnelManager::new(fast_config(&agent, api), 8080, None)
            .unwrap()
            .start()
            .await
            .unwrap();

        assert_eq!(handle.public_urls(), ["https://demo.ngrok.io".to_string()]);
        assert!(handle.is_running());
        assert!(handle.pid().is_some());

        handle.stop().await;
        assert!(!handle.is_running());
        handle.stop().await;
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_empty_tunnel_list_is_no_tunnels() {
        let dir = tempfile::tempdir().unwrap();
        let agent = fake_agent(dir.path(), "exec sleep 30");
        let api = status_api(r#"{"tunnels":[]}"#).await;

        let err = TunnelManager::new(fast_config(&agent, api), 8080, None)
            .unwrap()
            .start()
            .await
            .err()
            .unwrap();
        assert_eq!(err.code(), crate::error::ShareErrorCode::NoTunnels);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_unreachable_status_api_is_network_error() {
        let dir = tempfile::tempdir().unwrap();
        let agent = fake_agent(dir.path(), "echo agent booting\nexec sleep 30");

        // bind and drop to get a port nobody listens on
        let port = {
            let l = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            l.local_addr().unwrap().port()
        };
        let api = format!("http://127.0.0.1:{}/api/tunnels", port);

        let err = TunnelManager::new(fast_config(&agent, api), 8080, None)
            .unwrap()
            .start()
            .await
            .err()
            .unwrap();
        assert_eq!(err.code(), crate::error::ShareErrorCode::Network);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_agent_exiting_early_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let agent = fake_agent(dir.path(), "echo 'ERR_NGROK_4018: authentication failed' >&2\nexit 1");
        let api = status_api(r#"{"tunnels":[{"public_url":"https://never.ngrok.io"}]}"#).await;

        let mut config = fast_config(&agent, api);
        config.startup_grace_ms = 300;

        let err = TunnelManager::new(config, 8080, None)
            .unwrap()
            .start()
            .await
            .err()
            .unwrap();
        assert_eq!(err.code(), crate::error::ShareErrorCode::Network);
        assert!(err.to_string().contains("exited early"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_failed_start_keeps_agent_output() {
        let dir = tempfile::tempdir().unwrap();
        let agent = fake_agent(
            dir.path(),
            "echo 't=info msg=\"starting web service\"'\necho 'ERR_NGROK_4018: authentication failed' >&2\nexit 1",
        );
        let api = status_api(r#"{"tunnels":[{"public_url":"https://never.ngrok.io"}]}"#).await;

        let mut config = fast_config(&agent, api);
        config.startup_grace_ms = 300;
        let manager = TunnelManager::new(config, 8080, None).unwrap();

        let mut handle = manager.spawn().unwrap();
        let err = manager.wait_ready(&mut handle).await.unwrap_err();
        assert_eq!(err.code(), crate::error::ShareErrorCode::Network);

        let output = handle.output();
        assert!(
            output.iter().any(|l| l.contains("ERR_NGROK_4018")),
            "stderr missing from {:?}",
            output
        );
        assert!(output.iter().any(|l| l.contains("starting web service")));
        assert!(!handle.is_running());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_non_executable_binary_is_launch_error() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("not-executable");
        std::fs::write(&path, "#!/bin/sh\nexit 0\n").unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o644)).unwrap();

        let config = fast_config(path.to_str().unwrap(), "http://127.0.0.1:9/".into());
        let err = TunnelManager::new(config, 8080, None).unwrap().start().await.err().unwrap();
        assert_eq!(err.code(), crate::error::ShareErrorCode::Launch);
        assert!(err.to_string().contains("not-executable"));
    }

    #[tokio::test]
    async fn test_status_query_honors_timeout() {
        // accepts connections but never answers
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((stream, _)) = listener.accept().await {
                held.push(stream);
            }
        });

        let mut config = fast_config("unused", format!("http://127.0.0.1:{}/api/tunnels", port));
        config.query_timeout_ms = 200;
        let manager = TunnelManager::new(config, 8080, None).unwrap();

        let started = std::time::Instant::now();
        let err = manager.query_status().await.unwrap_err();
        assert_eq!(err.code(), crate::error::ShareErrorCode::Network);
        assert!(started.elapsed() < Duration::from_secs(2));
    }
}
