/// Wake-word detection service binary
///
/// Serves the wake-word protocol over TCP (or stdin/stdout) until Ctrl+C.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use wakeword_server::config::{Engine, ListenUri, ServerConfig};
use wakeword_server::supervisor::{serve_stdio, Supervisor};

#[derive(Parser, Debug)]
#[command(name = "wakeword-service", version, about = "Streaming wake-word detection server")]
struct Cli {
    /// tcp://host:port or stdio://
    #[arg(long, env = "WAKEWORD_URI")]
    uri: Option<String>,

    /// JSON model file with detector parameters
    #[arg(long, env = "WAKEWORD_MODEL_PATH")]
    model_path: Option<PathBuf>,

    /// Keyword name reported in detections
    #[arg(long, env = "WAKEWORD_KEYWORD")]
    keyword_name: Option<String>,

    /// Detection threshold (0.0 - 1.0)
    #[arg(long, env = "WAKEWORD_THRESHOLD")]
    threshold: Option<f32>,

    #[arg(long, value_enum)]
    engine: Option<Engine>,

    #[arg(long)]
    max_sessions: Option<usize>,

    /// JSON config file; flags and environment override its values
    #[arg(long, short)]
    config: Option<PathBuf>,

    /// Log DEBUG messages
    #[arg(long, env = "WAKEWORD_DEBUG")]
    debug: bool,
}

impl Cli {
    fn load_config(&self) -> Result<ServerConfig> {
        let mut config = match &self.config {
            Some(path) => ServerConfig::from_file(path)?,
            None => ServerConfig::default(),
        };

        if let Some(uri) = &self.uri {
            config.uri = uri.clone();
        }
        if let Some(path) = &self.model_path {
            config.model_path = Some(path.clone());
        }
        if let Some(keyword) = &self.keyword_name {
            config.keyword_name = keyword.clone();
        }
        if let Some(threshold) = self.threshold {
            config.threshold = threshold;
        }
        if let Some(engine) = self.engine {
            config.engine = engine;
        }
        if let Some(max_sessions) = self.max_sessions {
            config.max_sessions = max_sessions;
        }

        config.validate()?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    wakeword_server::init_logging(cli.debug);

    info!("Starting wake-word service v{}", wakeword_server::VERSION);

    let config = cli.load_config().context("Failed to load configuration")?;
    let template = config
        .build_template()
        .context("Failed to create detector")?;

    let detector = template.info();
    info!(
        "Detector '{}' v{} ready, keywords: {:?}, threshold: {:.2}",
        detector.name, detector.version, detector.keywords, config.threshold
    );

    let shutdown = CancellationToken::new();
    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Received Ctrl+C, shutting down");
                signal_token.cancel();
            }
            Err(e) => error!("Failed to listen for Ctrl+C: {}", e),
        }
    });

    match config.listen_uri()? {
        ListenUri::Tcp(addr) => {
            let supervisor = Supervisor::listen(addr.as_str(), template, &config)
                .await
                .with_context(|| format!("Failed to bind {}", addr))?;
            supervisor.run(shutdown).await;
        }
        ListenUri::Stdio => {
            let stats = serve_stdio(template, &config.session_config(), shutdown).await?;
            info!("Stdio session finished: {:?}", stats);
        }
    }

    info!("Wake-word service stopped");
    Ok(())
}
