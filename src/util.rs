use anyhow::{Context, Result};
use tracing_subscriber::{fmt, EnvFilter};

use crate::models::LoopDetectionConfig;

/// Initialize dotenv and structured tracing based on RUST_LOG.
///
/// Supports an explicit env file via ENV_FILE, then falls back to default
/// `.env` discovery. Safe to call more than once; later calls are no-ops.
pub fn init_tracing() {
    let mut env_source: String = "none".into();
    if let Ok(p) = std::env::var("ENV_FILE") {
        let p = p.trim();
        if !p.is_empty() && std::path::Path::new(p).is_file() && dotenvy::from_filename(p).is_ok() {
            env_source = p.to_string();
        }
    }
    if env_source == "none" && dotenvy::dotenv().is_ok() {
        env_source = ".env".into();
    }

    let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into());
    let subscriber = fmt().with_env_filter(EnvFilter::new(filter)).finish();
    let _ = tracing::subscriber::set_global_default(subscriber);

    tracing::info!("Environment loaded from: {}", env_source);
}

/// Interpret common truthy spellings used by the env knobs.
pub fn env_flag(name: &str) -> bool {
    std::env::var(name)
        .map(|v| {
            matches!(
                v.trim().to_ascii_lowercase().as_str(),
                "1" | "true" | "yes" | "on"
            )
        })
        .unwrap_or(false)
}

/// Build an HTTP client honoring proxy and timeout environment variables.
///
/// Environment:
/// - PROXIIUM_NO_PROXY = 1|true|yes|on  -> disable all proxies
/// - PROXIIUM_PROXY_URL = <url>         -> proxy for all schemes
/// - PROXIIUM_HTTP_TIMEOUT_SECONDS      -> overall request timeout (u64)
pub fn build_http_client_from_env() -> reqwest::Client {
    let mut builder = reqwest::Client::builder();

    if let Ok(secs) = std::env::var("PROXIIUM_HTTP_TIMEOUT_SECONDS") {
        if let Ok(n) = secs.trim().parse::<u64>() {
            builder = builder.timeout(std::time::Duration::from_secs(n));
        }
    }

    if env_flag("PROXIIUM_NO_PROXY") {
        builder = builder.no_proxy();
    } else if let Ok(url) = std::env::var("PROXIIUM_PROXY_URL") {
        let u = url.trim();
        if !u.is_empty() {
            if let Ok(p) = reqwest::Proxy::all(u) {
                builder = builder.proxy(p);
            }
        }
    }

    builder = builder.user_agent(format!("proxiium/{}", env!("CARGO_PKG_VERSION")));

    builder.build().unwrap_or_else(|_| reqwest::Client::new())
}

/// Read loop-detection thresholds from the environment, falling back to
/// defaults for unset knobs.
///
/// Environment:
/// - PROXIIUM_LOOP_ENABLED             -> 1|true|yes|on (default on)
/// - PROXIIUM_LOOP_MIN_PATTERN_LENGTH  -> usize
/// - PROXIIUM_LOOP_MAX_PATTERN_LENGTH  -> usize
/// - PROXIIUM_LOOP_MIN_REPETITIONS     -> usize
pub fn loop_config_from_env() -> Result<LoopDetectionConfig> {
    let mut config = LoopDetectionConfig::default();

    if std::env::var("PROXIIUM_LOOP_ENABLED").is_ok() {
        config.enabled = env_flag("PROXIIUM_LOOP_ENABLED");
    }
    if let Ok(v) = std::env::var("PROXIIUM_LOOP_MIN_PATTERN_LENGTH") {
        config.min_pattern_length = v
            .trim()
            .parse()
            .context("PROXIIUM_LOOP_MIN_PATTERN_LENGTH must be a positive integer")?;
    }
    if let Ok(v) = std::env::var("PROXIIUM_LOOP_MAX_PATTERN_LENGTH") {
        config.max_pattern_length = v
            .trim()
            .parse()
            .context("PROXIIUM_LOOP_MAX_PATTERN_LENGTH must be a positive integer")?;
    }
    if let Ok(v) = std::env::var("PROXIIUM_LOOP_MIN_REPETITIONS") {
        config.min_repetitions = v
            .trim()
            .parse()
            .context("PROXIIUM_LOOP_MIN_REPETITIONS must be a positive integer")?;
    }

    anyhow::ensure!(
        config.min_pattern_length >= 1,
        "min pattern length must be at least 1"
    );
    anyhow::ensure!(
        config.max_pattern_length >= config.min_pattern_length,
        "max pattern length must not be below the minimum"
    );
    Ok(config)
}
