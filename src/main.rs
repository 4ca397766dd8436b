use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use config::Config;
use hazardwatch::metrics::MonitoringConfig;
use hazardwatch::playback::HlsProbeFactory;
use hazardwatch::store::MemoryStore;
use hazardwatch::{build_state, create_app, AppOptions};
use serde::Deserialize;
use tracing::info;

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(long, default_value = "config.toml")]
    config: String,

    /// Operator whose cameras are monitored (overrides config)
    #[arg(long)]
    operator: Option<String>,

    /// Listen port (overrides config)
    #[arg(long)]
    port: Option<u16>,
}

#[derive(Debug, Deserialize)]
struct Settings {
    server: ServerConfig,
    console: ConsoleConfig,
    #[serde(default)]
    analysis: AnalysisConfig,
    #[serde(default)]
    streaming: StreamingConfig,
    #[serde(default)]
    monitoring: MonitoringConfig,
}

#[derive(Debug, Deserialize)]
struct ServerConfig {
    host: String,
    port: u16,
}

#[derive(Debug, Deserialize)]
struct ConsoleConfig {
    operator_id: String,
    #[serde(default = "default_recent_log_limit")]
    recent_log_limit: usize,
}

fn default_recent_log_limit() -> usize {
    5
}

#[derive(Debug, Deserialize)]
struct AnalysisConfig {
    #[serde(default = "default_analysis_url")]
    base_url: String,
    #[serde(default = "default_analysis_timeout")]
    timeout_secs: u64,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            base_url: default_analysis_url(),
            timeout_secs: default_analysis_timeout(),
        }
    }
}

fn default_analysis_url() -> String {
    "http://localhost:5000".to_string()
}

fn default_analysis_timeout() -> u64 {
    10
}

#[derive(Debug, Deserialize)]
struct StreamingConfig {
    #[serde(default = "default_hls_port")]
    hls_port: u16,
    #[serde(default = "default_probe_interval")]
    probe_interval_secs: u64,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            hls_port: default_hls_port(),
            probe_interval_secs: default_probe_interval(),
        }
    }
}

fn default_hls_port() -> u16 {
    hazardwatch::stream_url::DEFAULT_HLS_PORT
}

fn default_probe_interval() -> u64 {
    5
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let settings = Config::builder()
        .add_source(config::File::with_name(&args.config))
        .build()?;
    let settings: Settings = settings.try_deserialize()?;

    info!("Configuration loaded from {}: {:?}", args.config, settings);

    let operator_id = args.operator.unwrap_or(settings.console.operator_id);
    let port = args.port.unwrap_or(settings.server.port);

    let options = AppOptions {
        operator_id: operator_id.clone(),
        recent_log_limit: settings.console.recent_log_limit,
        analysis_url: settings.analysis.base_url,
        analysis_timeout: Duration::from_secs(settings.analysis.timeout_secs),
        hls_port: settings.streaming.hls_port,
        metrics_enabled: settings.monitoring.enabled,
    };

    let store = Arc::new(MemoryStore::new());
    let players = Arc::new(HlsProbeFactory::new(
        reqwest::Client::builder()
            .timeout(Duration::from_secs(settings.streaming.probe_interval_secs.max(1)))
            .build()?,
        Duration::from_secs(settings.streaming.probe_interval_secs.max(1)),
    ));

    info!("Starting console for operator {}", operator_id);
    let state = build_state(store, options, players).await?;
    let app = create_app(state.clone());

    let addr = format!("{}:{}", settings.server.host, port);
    info!("Listening on http://{}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutdown requested");
        })
        .await?;

    // Release any player still attached before the console goes away.
    state.playback.detach();
    Ok(())
}
