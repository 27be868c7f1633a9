use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::error;
use tunshare::config::Config;
use tunshare::lifecycle::Controller;

/// Share text, a file, or a folder through a public tunnel
#[derive(Parser, Debug)]
#[command(version, about)]
struct Cli {
    /// Port to use for the local HTTP server (default: 8080)
    #[arg(short, long)]
    port: Option<u16>,

    /// Basic auth in format 'admin:password'
    #[arg(long, value_name = "USER:PASSWORD")]
    basic_auth: Option<String>,

    /// Config file (default: $TUNSHARE_CONFIG or <config dir>/tunshare/config.toml)
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Tunnel binary to launch (default: ngrok)
    #[arg(long, value_name = "PATH")]
    tunnel_bin: Option<String>,

    /// Tunnel agent status endpoint
    #[arg(long, value_name = "URL")]
    api_url: Option<String>,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Folder path, file path, or text to serve. Opens $EDITOR when empty.
    content: Vec<String>,
}

impl Cli {
    fn into_config(self) -> anyhow::Result<(Config, Vec<String>)> {
        let mut config = Config::discover(self.config.as_deref())?;
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(auth) = self.basic_auth {
            config.basic_auth = Some(auth);
        }
        if let Some(bin) = self.tunnel_bin {
            config.tunnel.binary = bin;
        }
        if let Some(url) = self.api_url {
            config.tunnel.api_url = url;
        }
        config.validate()?;
        Ok((config, self.content))
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let directive = if cli.verbose { "tunshare=debug" } else { "tunshare=info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(directive.parse().expect("valid log directive")),
        )
        .with_writer(std::io::stderr)
        .init();

    let result = match cli.into_config() {
        Ok((config, content)) => Controller::new(config, content).run().await,
        Err(e) => Err(e),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "Startup failed");
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}
