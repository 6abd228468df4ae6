//! tiercache daemon
//!
//! Runs a cache instance and exposes its health, stats and Prometheus
//! metrics over HTTP until Ctrl-C, then shuts the cache down cleanly.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                      tiercache                           │
//! ├──────────────────────────────────────────────────────────┤
//! │  health server  /healthz /livez /readyz /stats           │
//! │  metrics server /metrics                                 │
//! │  stats reporter (periodic log + exporter refresh)        │
//! │                         │                                │
//! │                  CacheManager                            │
//! └──────────────────────────────────────────────────────────┘
//! ```

use std::convert::Infallible;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use http_body_util::Full;
use hyper::body::{Bytes, Incoming};
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use tiercache::cache::{BackendConfig, CacheManager, PreferredBackend, RemoteConfig};
use tiercache::monitoring::{CacheMetricsExporter, HealthCheck};
use tiercache::{Error, Result, VERSION};

// =============================================================================
// CLI Arguments
// =============================================================================

/// tiercache - memory + Redis tiered cache daemon
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// YAML configuration file; flags below override its values
    #[arg(long, env = "TIERCACHE_CONFIG")]
    config: Option<PathBuf>,

    /// Preferred backend (auto, memory, remote)
    #[arg(long, env = "TIERCACHE_BACKEND")]
    backend: Option<String>,

    /// Redis URL, credentials included
    #[arg(long, env = "TIERCACHE_REDIS_URL")]
    redis_url: Option<String>,

    /// Prefix for every key written to Redis
    #[arg(long, env = "TIERCACHE_KEY_PREFIX")]
    key_prefix: Option<String>,

    /// Default entry TTL in seconds
    #[arg(long, env = "TIERCACHE_DEFAULT_TTL_SECONDS")]
    default_ttl_seconds: Option<u64>,

    /// Memory tier capacity in entries
    #[arg(long, env = "TIERCACHE_MAX_ENTRIES")]
    max_entries: Option<usize>,

    /// Expiry sweep period in milliseconds
    #[arg(long, env = "TIERCACHE_CLEANUP_INTERVAL_MS")]
    cleanup_interval_ms: Option<u64>,

    /// Run without the memory tier
    #[arg(long, env = "TIERCACHE_DISABLE_MEMORY_CACHE")]
    disable_memory_cache: bool,

    /// Consecutive failures before the remote tier gives up
    #[arg(long, env = "TIERCACHE_RECONNECT_MAX_ATTEMPTS")]
    reconnect_max_attempts: Option<u32>,

    /// First reconnect delay in milliseconds
    #[arg(long, env = "TIERCACHE_RECONNECT_BASE_DELAY_MS")]
    reconnect_base_delay_ms: Option<u64>,

    /// Stats log period in seconds
    #[arg(long, env = "TIERCACHE_STATS_INTERVAL_SECONDS", default_value = "30")]
    stats_interval_seconds: u64,

    /// Metrics server bind address
    #[arg(long, env = "METRICS_ADDR", default_value = "0.0.0.0:8080")]
    metrics_addr: String,

    /// Health server bind address
    #[arg(long, env = "HEALTH_ADDR", default_value = "0.0.0.0:8081")]
    health_addr: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,
}

/// Everything the HTTP handlers need
struct AppState {
    cache: Arc<CacheManager>,
    health: HealthCheck,
    exporter: CacheMetricsExporter,
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(&args);

    info!("Starting tiercache {}", VERSION);

    let config = build_config(&args)?;
    info!("  Preferred backend: {}", config.preferred_backend);
    info!("  Default TTL: {}s", config.default_ttl_seconds);
    info!("  Max entries: {}", config.max_entries);
    info!("  Memory cache: {}", config.enable_memory_cache);
    info!(
        "  Remote: {}",
        config
            .remote
            .as_ref()
            .map_or("not configured", |r| r.url.as_str())
    );

    let cache = Arc::new(CacheManager::new(config).await?);
    info!("Active backend: {}", cache.backend_type());

    let state = Arc::new(AppState {
        cache: Arc::clone(&cache),
        health: HealthCheck::new(),
        exporter: CacheMetricsExporter::new()?,
    });
    state.health.set_ready(true);

    // Start health server
    let health_addr = args.health_addr.clone();
    let health_state = Arc::clone(&state);
    tokio::spawn(async move {
        if let Err(e) = serve(&health_addr, "health", health_state, route_health).await {
            error!("Health server error: {}", e);
        }
    });

    // Start metrics server
    let metrics_addr = args.metrics_addr.clone();
    let metrics_state = Arc::clone(&state);
    tokio::spawn(async move {
        if let Err(e) = serve(&metrics_addr, "metrics", metrics_state, route_metrics).await {
            error!("Metrics server error: {}", e);
        }
    });

    // Periodic stats report
    let shutdown = CancellationToken::new();
    let reporter = tokio::spawn(report_stats(
        Arc::clone(&state),
        Duration::from_secs(args.stats_interval_seconds.max(1)),
        shutdown.child_token(),
    ));

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    state.health.set_ready(false);
    shutdown.cancel();
    let _ = reporter.await;
    cache.destroy().await;
    state.health.set_live(false);

    info!("tiercache shutdown complete");
    Ok(())
}

// =============================================================================
// Configuration
// =============================================================================

fn build_config(args: &Args) -> Result<BackendConfig> {
    let mut config = match &args.config {
        Some(path) => BackendConfig::from_yaml_file(path)?,
        None => BackendConfig::default(),
    };

    if let Some(backend) = &args.backend {
        config.preferred_backend = backend.parse::<PreferredBackend>()?;
    }
    if let Some(url) = &args.redis_url {
        let remote = config.remote.get_or_insert_with(RemoteConfig::default);
        remote.url = url.clone();
    }
    if let Some(prefix) = &args.key_prefix {
        let remote = config.remote.as_mut().ok_or_else(|| {
            Error::Configuration("--key-prefix requires a remote endpoint".into())
        })?;
        remote.key_prefix = prefix.clone();
    }
    if let Some(ttl) = args.default_ttl_seconds {
        config.default_ttl_seconds = ttl;
    }
    if let Some(max_entries) = args.max_entries {
        config.max_entries = max_entries;
    }
    if let Some(interval) = args.cleanup_interval_ms {
        config.cleanup_interval_ms = interval;
    }
    if args.disable_memory_cache {
        config.enable_memory_cache = false;
    }
    if let Some(attempts) = args.reconnect_max_attempts {
        config.reconnect.max_attempts = attempts;
    }
    if let Some(delay) = args.reconnect_base_delay_ms {
        config.reconnect.base_delay_ms = delay;
        config.reconnect.max_delay_ms = config.reconnect.max_delay_ms.max(delay);
    }

    config.validate()?;
    Ok(config)
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let mut filter = EnvFilter::from_default_env().add_directive(level.into());
    for directive in ["hyper=warn", "redis=info"] {
        if let Ok(directive) = directive.parse() {
            filter = filter.add_directive(directive);
        }
    }

    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .init();
    }
}

// =============================================================================
// Stats Reporter
// =============================================================================

async fn report_stats(state: Arc<AppState>, period: Duration, shutdown: CancellationToken) {
    let mut ticker = tokio::time::interval(period);
    ticker.tick().await;

    loop {
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {
                let stats = state.cache.stats();
                state.exporter.observe(&stats);
                info!(
                    backend = %stats.backend_type,
                    status = %stats.backend_status,
                    requests = stats.requests,
                    hit_rate = stats.hit_rate,
                    errors = stats.errors,
                    memory_entries = stats.memory_entries,
                    "cache stats"
                );
            }
        }
    }
}

// =============================================================================
// HTTP Servers
// =============================================================================

type HttpResponse = Response<Full<Bytes>>;

fn respond(status: StatusCode, content_type: &'static str, body: impl Into<Bytes>) -> HttpResponse {
    let mut response = Response::new(Full::new(body.into()));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
    response
}

fn respond_json<T: serde::Serialize>(status: StatusCode, value: &T) -> HttpResponse {
    match serde_json::to_vec(value) {
        Ok(body) => respond(status, "application/json", body),
        Err(e) => respond(
            StatusCode::INTERNAL_SERVER_ERROR,
            "text/plain",
            format!("serialization failed: {}", e),
        ),
    }
}

fn not_found() -> HttpResponse {
    respond(StatusCode::NOT_FOUND, "text/plain", "not found")
}

fn route_health(state: &AppState, req: &Request<Incoming>) -> HttpResponse {
    match req.uri().path() {
        "/healthz" | "/livez" => {
            if state.health.is_live() {
                respond(StatusCode::OK, "text/plain", "ok")
            } else {
                respond(StatusCode::SERVICE_UNAVAILABLE, "text/plain", "not live")
            }
        }
        "/readyz" => {
            let report = state.health.readiness(&state.cache.stats());
            let status = if report.status.is_operational() {
                StatusCode::OK
            } else {
                StatusCode::SERVICE_UNAVAILABLE
            };
            respond_json(status, &report)
        }
        "/stats" => respond_json(StatusCode::OK, &state.cache.stats()),
        _ => not_found(),
    }
}

fn route_metrics(state: &AppState, req: &Request<Incoming>) -> HttpResponse {
    match req.uri().path() {
        "/metrics" => {
            state.exporter.observe(&state.cache.stats());
            match state.exporter.encode() {
                Ok(text) => respond(StatusCode::OK, state.exporter.content_type(), text),
                Err(e) => respond(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "text/plain",
                    e.to_string(),
                ),
            }
        }
        _ => not_found(),
    }
}

async fn serve(
    addr: &str,
    name: &'static str,
    state: Arc<AppState>,
    route: fn(&AppState, &Request<Incoming>) -> HttpResponse,
) -> Result<()> {
    let addr: SocketAddr = addr
        .parse()
        .map_err(|e| Error::Configuration(format!("Invalid {} server address: {}", name, e)))?;

    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| Error::Internal(format!("Failed to bind {} server: {}", name, e)))?;

    info!("{} server listening on {}", name, addr);

    loop {
        let (stream, _) = listener
            .accept()
            .await
            .map_err(|e| Error::Internal(format!("{} server accept error: {}", name, e)))?;

        let io = TokioIo::new(stream);
        let state = Arc::clone(&state);

        tokio::spawn(async move {
            let service = service_fn(move |req: Request<Incoming>| {
                let response = route(&state, &req);
                async move { Ok::<_, Infallible>(response) }
            });
            if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                error!("{} server connection error: {}", name, e);
            }
        });
    }
}
