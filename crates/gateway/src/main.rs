use std::sync::Arc;

use anyhow::Context;
use axum::http::{HeaderValue, Method};
use clap::Parser;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tracing_subscriber::EnvFilter;

use vs_clients::{HttpBlobStore, HttpObjectStore, HttpSlideExtractor, HttpTranscriptSource};
use vs_domain::config::{env_secret, Config, ConfigSeverity};
use vs_engine::Engine;
use vs_gateway::api;
use vs_gateway::coordinator::Coordinator;
use vs_gateway::state::AppState;
use vs_gateway::workflows::{register_all, WorkflowDeps};
use vs_providers::OpenAiCompatModel;
use vs_store::Store;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// CLI
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Parser)]
#[command(name = "vidscribe", about = "Durable video-analysis workflows over HTTP")]
struct Cli {
    /// Path to the TOML config file.
    #[arg(long, default_value = "config.toml")]
    config: std::path::PathBuf,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(clap::Subcommand)]
enum Command {
    /// Run the HTTP gateway (default).
    Serve,
    /// Configuration helpers.
    #[command(subcommand)]
    Config(ConfigCommand),
    /// Print the version.
    Version,
}

#[derive(clap::Subcommand)]
enum ConfigCommand {
    /// Check the config and environment for problems.
    Validate,
    /// Print the effective configuration.
    Show,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = load_config(&cli.config)?;

    match cli.command {
        None | Some(Command::Serve) => {
            init_tracing();
            run_server(Arc::new(config)).await
        }
        Some(Command::Config(ConfigCommand::Validate)) => {
            let issues = config.validate();
            for issue in &issues {
                println!("{:?}: {issue}", issue.severity);
            }
            if issues.iter().any(|i| i.severity == ConfigSeverity::Error) {
                std::process::exit(1);
            }
            println!("config ok");
            Ok(())
        }
        Some(Command::Config(ConfigCommand::Show)) => {
            println!("{}", toml::to_string_pretty(&config)?);
            Ok(())
        }
        Some(Command::Version) => {
            println!("vidscribe {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

fn load_config(path: &std::path::Path) -> anyhow::Result<Config> {
    if path.exists() {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        toml::from_str(&raw).with_context(|| format!("parsing {}", path.display()))
    } else {
        Ok(Config::default())
    }
}

/// Structured JSON tracing for the serve command.
fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,vs_gateway=debug,vs_engine=debug")),
        )
        .json()
        .init();
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Server
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

async fn run_server(config: Arc<Config>) -> anyhow::Result<()> {
    tracing::info!("VidScribe starting");

    // ── Config validation (missing secrets are fatal) ───────────────
    let issues = config.validate();
    for issue in &issues {
        match issue.severity {
            ConfigSeverity::Warning => tracing::warn!("config: {issue}"),
            ConfigSeverity::Error => tracing::error!("config: {issue}"),
        }
    }
    if issues.iter().any(|i| i.severity == ConfigSeverity::Error) {
        anyhow::bail!(
            "config validation failed with {} error(s)",
            issues
                .iter()
                .filter(|i| i.severity == ConfigSeverity::Error)
                .count()
        );
    }

    // ── Store ───────────────────────────────────────────────────────
    let store = Arc::new(Store::open(&config.database.path).context("opening database")?);
    tracing::info!(path = %config.database.path.display(), "store ready");

    // ── External service clients ────────────────────────────────────
    let transcripts = Arc::new(
        HttpTranscriptSource::new(
            &config.transcript_api,
            env_secret(&config.transcript_api.token_env)?,
        )
        .context("transcript client")?,
    );
    let extractor = Arc::new(
        HttpSlideExtractor::new(
            &config.slide_extractor,
            env_secret(&config.slide_extractor.token_env)?,
        )
        .context("slide extractor client")?,
    );
    let objects = Arc::new(
        HttpObjectStore::new(
            &config.object_storage,
            env_secret(&config.object_storage.token_env)?,
        )
        .context("object storage client")?,
    );
    let blobs = Arc::new(
        HttpBlobStore::new(
            &config.blob_storage,
            env_secret(&config.blob_storage.token_env)?,
        )
        .context("blob storage client")?,
    );
    tracing::info!("external service clients ready");

    // ── LLM provider ────────────────────────────────────────────────
    let llm = Arc::new(
        OpenAiCompatModel::new(&config.llm, env_secret(&config.llm.api_key_env)?)
            .context("LLM provider")?,
    );
    tracing::info!(model = %config.llm.model, "LLM provider ready");

    // ── Engine + workflow catalog ───────────────────────────────────
    let engine = Engine::new(store.clone());
    register_all(
        &engine,
        WorkflowDeps {
            store: store.clone(),
            llm,
            transcripts,
            extractor,
            objects,
            blobs,
            config: config.clone(),
        },
    );
    let recovered = engine.recover().context("recovering persisted runs")?;
    if recovered > 0 {
        tracing::info!(recovered, "resumed non-terminal runs");
    }
    tracing::info!("workflow engine ready");

    // ── Coordinator + periodic stale-extraction sweep ───────────────
    let coordinator = Arc::new(Coordinator::new(
        store.clone(),
        engine.clone(),
        config.clone(),
    ));
    {
        let coordinator = coordinator.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(std::time::Duration::from_secs(60));
            loop {
                interval.tick().await;
                coordinator.sweep_stale_extractions();
            }
        });
    }

    let state = AppState {
        config: config.clone(),
        store,
        engine,
        coordinator,
    };

    // ── Middleware ──────────────────────────────────────────────────
    let cors_layer = build_cors_layer(&config.server.cors.allowed_origins);
    let max_concurrent = std::env::var("VS_MAX_CONCURRENT_REQUESTS")
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(256);
    tracing::info!(max_concurrent, "concurrency limit set");

    let app = api::router()
        .layer(cors_layer)
        .layer(tower::limit::ConcurrencyLimitLayer::new(max_concurrent))
        .with_state(state);

    // ── Bind ────────────────────────────────────────────────────────
    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding to {addr}"))?;
    tracing::info!(addr = %addr, "VidScribe listening");

    axum::serve(listener, app).await.context("axum server error")?;
    Ok(())
}

/// One compiled entry of `server.cors.allowed_origins`.
enum OriginRule {
    /// Literal origin, byte-compared.
    Exact(HeaderValue),
    /// `scheme://host:*` entry; the stored prefix ends at the colon and
    /// the remainder must be a non-empty run of digits.
    AnyPort(String),
}

impl OriginRule {
    fn compile(entry: &str) -> Option<Self> {
        if let Some(host) = entry.strip_suffix(":*") {
            return Some(Self::AnyPort(format!("{host}:")));
        }
        entry.parse::<HeaderValue>().ok().map(Self::Exact)
    }

    fn matches(&self, origin: &HeaderValue) -> bool {
        match self {
            Self::Exact(allowed) => allowed == origin,
            Self::AnyPort(prefix) => origin
                .to_str()
                .ok()
                .and_then(|o| o.strip_prefix(prefix.as_str()))
                .is_some_and(|port| !port.is_empty() && port.bytes().all(|b| b.is_ascii_digit())),
        }
    }
}

/// Build the CORS layer from the configured origins. A lone `"*"` allows
/// everything; otherwise each entry compiles to an [`OriginRule`].
fn build_cors_layer(allowed_origins: &[String]) -> CorsLayer {
    use axum::http::header;

    let methods = [Method::GET, Method::POST, Method::PUT, Method::OPTIONS];
    let headers = [header::CONTENT_TYPE, header::AUTHORIZATION];

    if allowed_origins.iter().any(|o| o == "*") {
        tracing::warn!("CORS allows all origins");
        return CorsLayer::new()
            .allow_origin(tower_http::cors::Any)
            .allow_methods(methods)
            .allow_headers(headers);
    }

    let rules: Vec<OriginRule> = allowed_origins
        .iter()
        .filter_map(|entry| {
            let rule = OriginRule::compile(entry);
            if rule.is_none() {
                tracing::warn!(origin = %entry, "invalid CORS origin, skipping");
            }
            rule
        })
        .collect();

    CorsLayer::new()
        .allow_origin(AllowOrigin::predicate(move |origin, _| {
            rules.iter().any(|rule| rule.matches(origin))
        }))
        .allow_methods(methods)
        .allow_headers(headers)
}
