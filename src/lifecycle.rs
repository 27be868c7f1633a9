//! Startup sequencing and teardown
//!
//! The controller stages content, starts the static server, then the tunnel.
//! Everything that was started lives in a [`Session`], whose `shutdown`
//! stops each piece in reverse dependency order exactly once.

use crate::config::Config;
use crate::error::{Result, ShareError};
use crate::server::{ServerHandle, StaticServer};
use crate::stage::{StagedDir, Stager};
use crate::tunnel::{TunnelHandle, TunnelManager};
use std::io;
use std::path::Path;
use tracing::{info, warn};

/// Listens for SIGINT and SIGTERM (Ctrl+C only on non-unix platforms)
pub struct ShutdownSignal {
    #[cfg(unix)]
    sigint: tokio::signal::unix::Signal,
    #[cfg(unix)]
    sigterm: tokio::signal::unix::Signal,
}

impl ShutdownSignal {
    /// Install the handlers. From here on the default terminate-on-signal
    /// behavior is replaced, so a second signal cannot cut teardown short.
    pub fn install() -> io::Result<Self> {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            Ok(Self {
                sigint: signal(SignalKind::interrupt())?,
                sigterm: signal(SignalKind::terminate())?,
            })
        }

        #[cfg(not(unix))]
        {
            Ok(Self {})
        }
    }

    /// Wait for the next signal and return its name
    pub async fn recv(&mut self) -> &'static str {
        #[cfg(unix)]
        {
            tokio::select! {
                _ = self.sigint.recv() => "SIGINT",
                _ = self.sigterm.recv() => "SIGTERM",
            }
        }

        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
            "Ctrl+C"
        }
    }
}

/// Owns the configuration and the user's content tokens
pub struct Controller {
    config: Config,
    content: Vec<String>,
    editor: String,
}

impl Controller {
    pub fn new(config: Config, content: Vec<String>) -> Self {
        let editor = config.editor_command(std::env::var("EDITOR").ok());
        Self {
            config,
            content,
            editor,
        }
    }

    /// Override the editor used for empty input
    pub fn with_editor(mut self, editor: impl Into<String>) -> Self {
        self.editor = editor.into();
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Stage the content on a blocking thread (the editor may be interactive)
    pub async fn stage(&self) -> Result<StagedDir> {
        let stager = Stager::new(self.editor.clone());
        let tokens = self.content.clone();
        tokio::task::spawn_blocking(move || stager.stage(&tokens))
            .await
            .map_err(|e| ShareError::fs(std::env::temp_dir(), io::Error::other(e)))?
    }

    /// Start server then tunnel on top of an already staged directory.
    ///
    /// If either step fails, whatever was started is stopped and the staged
    /// directory is removed before the error is returned.
    pub async fn launch(&self, staged: StagedDir) -> Result<Session> {
        let mut session = Session::new(staged);
        self.launch_into(&mut session).await?;
        Ok(session)
    }

    /// Start server then tunnel, storing each handle in `session` as soon as
    /// it exists.
    ///
    /// If this future is dropped part way, `session` still owns everything
    /// that was started and [`Session::shutdown`] stops it gracefully. On
    /// error the session has already been shut down.
    pub async fn launch_into(&self, session: &mut Session) -> Result<()> {
        let basic_auth = match self.config.basic_auth() {
            Ok(auth) => auth,
            Err(e) => {
                session.shutdown().await;
                return Err(e);
            }
        };

        let server = StaticServer::new(session.staged.path(), self.config.port)
            .with_ready_timeout(self.config.server.ready_timeout())
            .start()
            .await;
        let port = match server {
            Ok(handle) => session.server.insert(handle).port(),
            Err(e) => {
                warn!(error = %e, "Failed to start HTTP server");
                session.shutdown().await;
                return Err(e);
            }
        };

        let spawned =
            TunnelManager::new(self.config.tunnel.clone(), port, basic_auth).and_then(|manager| {
                let handle = manager.spawn()?;
                Ok((manager, handle))
            });
        let (manager, handle) = match spawned {
            Ok(spawned) => spawned,
            Err(e) => {
                warn!(error = %e, "Failed to start tunnel");
                session.shutdown().await;
                return Err(e);
            }
        };

        let tunnel = session.tunnel.insert(handle);
        let ready = manager.wait_ready(tunnel).await;
        if let Err(e) = ready {
            warn!(error = %e, "Failed to start tunnel");
            session.shutdown().await;
            return Err(e);
        }

        Ok(())
    }

    /// Stage and launch
    pub async fn start(&self) -> Result<Session> {
        let staged = self.stage().await?;
        self.launch(staged).await
    }

    /// Full lifecycle: start, print the URLs, block until a signal, tear down.
    ///
    /// A signal during startup skips straight to teardown of whatever was
    /// already running.
    pub async fn run(self) -> anyhow::Result<()> {
        let mut signals = ShutdownSignal::install()?;

        let staged = tokio::select! {
            result = self.stage() => result?,
            name = signals.recv() => {
                // a directory staged after this point is removed when dropped
                info!(signal = name, "Interrupted while staging content");
                return Ok(());
            }
        };

        let mut session = Session::new(staged);
        let interrupted = tokio::select! {
            result = self.launch_into(&mut session) => {
                result?;
                None
            }
            name = signals.recv() => Some(name),
        };

        let name = match interrupted {
            Some(name) => {
                info!(signal = name, "Interrupted during startup");
                name
            }
            None => {
                print_urls(session.public_urls());
                signals.recv().await
            }
        };

        println!("\nCleaning up...");
        info!(signal = name, "Received signal, shutting down");
        session.shutdown().await;
        Ok(())
    }
}

fn print_urls(urls: &[String]) {
    println!("\nSend this url to access message:");
    for url in urls {
        println!("  {}", url);
    }
    println!("\nPress Ctrl+C to stop the server and exit");
}

/// Everything that is running on behalf of one invocation.
///
/// Dropping a session without `shutdown` still releases the server before
/// the staged directory goes away; the agent is then killed outright.
pub struct Session {
    server: Option<ServerHandle>,
    tunnel: Option<TunnelHandle>,
    shut_down: bool,
    staged: StagedDir,
}

impl Session {
    pub fn new(staged: StagedDir) -> Self {
        Self {
            server: None,
            tunnel: None,
            shut_down: false,
            staged,
        }
    }

    pub fn staged_path(&self) -> &Path {
        self.staged.path()
    }

    pub fn server_port(&self) -> Option<u16> {
        self.server.as_ref().map(|s| s.port())
    }

    pub fn public_urls(&self) -> &[String] {
        self.tunnel.as_ref().map(|t| t.public_urls()).unwrap_or(&[])
    }

    pub fn tunnel_pid(&self) -> Option<u32> {
        self.tunnel.as_ref().and_then(|t| t.pid())
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down
    }

    /// Stop the server, stop the tunnel, remove the staged directory.
    /// Components that never started are skipped; later calls do nothing.
    pub async fn shutdown(&mut self) {
        if self.shut_down {
            return;
        }
        self.shut_down = true;

        if let Some(mut server) = self.server.take() {
            server.stop().await;
        }
        if let Some(mut tunnel) = self.tunnel.take() {
            tunnel.stop().await;
        }
        if let Err(e) = self.staged.remove() {
            warn!(error = %e, "Failed to remove temporary directory");
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        drop(self.server.take());
        drop(self.tunnel.take());
        if let Err(e) = self.staged.remove() {
            warn!(error = %e, "Failed to remove temporary directory");
        }
    }
}
